//! TOML settings for every workflow stage.

use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::{
    definition::DefinitionOptions, engine::EngineSettings, raster::RasterPlan,
    results::ResultSchema, scoring::ScoringSettings,
};

/// Settings file looked up in the current directory when none is named.
pub const DEFAULT_SETTINGS_FILE: &str = "postfire.toml";

/// File-system layout of a workflow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PathSettings {
    /// Sweep definition table.
    pub definition: PathBuf,
    /// Root of the generated combination artifacts.
    pub configs_dir: PathBuf,
    /// Base configuration merged under every combination.
    pub base_config: PathBuf,
    /// Directory for merged configurations.
    pub work_dir: PathBuf,
    /// Directory receiving relocated results.
    pub results_dir: PathBuf,
    /// JSON-lines run log; `None` disables it.
    pub run_log: Option<PathBuf>,
    /// Combined result table written by `combine`.
    pub combined: PathBuf,
    /// Directory for generated rasters.
    pub rasters_dir: PathBuf,
}

impl Default for PathSettings {
    fn default() -> Self {
        Self {
            definition: PathBuf::from("configs/sweep/sweep_definitions.csv"),
            configs_dir: PathBuf::from("configs/sweep"),
            base_config: PathBuf::from("configs/params.jshc"),
            work_dir: PathBuf::from("work"),
            results_dir: PathBuf::from("results"),
            run_log: Some(PathBuf::from("logs/sweep.jsonl")),
            combined: PathBuf::from("results/all_scenarios_combined.csv"),
            rasters_dir: PathBuf::from("preprocessed/rasters"),
        }
    }
}

impl PathSettings {
    fn resolve(&mut self, base: &Path) {
        for path in [
            &mut self.definition,
            &mut self.configs_dir,
            &mut self.base_config,
            &mut self.work_dir,
            &mut self.results_dir,
            &mut self.combined,
            &mut self.rasters_dir,
        ] {
            *path = resolve(base, path);
        }
        if let Some(log) = &mut self.run_log {
            *log = resolve(base, log);
        }
    }
}

/// Sweep execution knobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SweepSettings {
    /// Maximum concurrent engine invocations.
    pub jobs: usize,
}

impl Default for SweepSettings {
    fn default() -> Self {
        Self { jobs: 1 }
    }
}

/// Whole settings document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// `[paths]`
    pub paths: PathSettings,
    /// `[engine]`
    pub engine: EngineSettings,
    /// `[generation]`
    pub generation: DefinitionOptions,
    /// `[sweep]`
    pub sweep: SweepSettings,
    /// `[schema]`
    pub schema: ResultSchema,
    /// `[scoring]`
    pub scoring: ScoringSettings,
    /// `[rasters]`
    pub rasters: RasterPlan,
    #[serde(skip)]
    source_dir: PathBuf,
}

impl Settings {
    /// Loads settings from a TOML file; relative paths resolve against the
    /// file's directory.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .with_context(|| format!("reading settings {}", path.display()))?;
        let settings: Self =
            toml::from_str(&raw).with_context(|| format!("parsing {}", path.display()))?;
        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let dir = fs::canonicalize(&dir)
            .with_context(|| format!("resolving settings directory {}", dir.display()))?;
        settings.finish(dir)
    }

    /// Loads `explicit` when given (it must exist), otherwise
    /// [`DEFAULT_SETTINGS_FILE`] when present in the current directory,
    /// otherwise defaults.
    pub fn load_or_default(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::load(path);
        }
        let fallback = Path::new(DEFAULT_SETTINGS_FILE);
        if fallback.is_file() {
            return Self::load(fallback);
        }
        let cwd = std::env::current_dir().context("resolving current directory")?;
        Self::default().finish(cwd)
    }

    /// Directory relative paths were resolved against.
    #[must_use]
    pub fn source_dir(&self) -> &Path {
        &self.source_dir
    }

    /// Resolves a path relative to the settings directory.
    #[must_use]
    pub fn resolve_path(&self, candidate: impl AsRef<Path>) -> PathBuf {
        resolve(&self.source_dir, candidate.as_ref())
    }

    /// Checks cross-field constraints.
    pub fn validate(&self) -> Result<()> {
        if self.sweep.jobs == 0 {
            bail!("[sweep] jobs must be at least 1");
        }
        if self.engine.program.trim().is_empty() {
            bail!("[engine] program must not be empty");
        }
        if self.engine.timeout_secs == 0 {
            bail!("[engine] timeout_secs must be positive");
        }
        self.scoring.validate().context("invalid [scoring] section")?;
        self.rasters
            .grid
            .validate()
            .context("invalid [rasters.grid] section")?;
        Ok(())
    }

    fn finish(mut self, dir: PathBuf) -> Result<Self> {
        self.paths.resolve(&dir);
        self.engine.working_dir = Some(match self.engine.working_dir.take() {
            Some(working_dir) => resolve(&dir, &working_dir),
            None => dir.clone(),
        });
        self.source_dir = dir;
        self.validate()?;
        Ok(self)
    }
}

fn resolve(base: &Path, candidate: &Path) -> PathBuf {
    if candidate.is_absolute() {
        candidate.to_path_buf()
    } else {
        base.join(candidate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{definition::DuplicatePolicy, engine::OutputLocation, scoring::EvaluationWindow};
    use tempfile::tempdir;

    #[test]
    fn loads_and_resolves_relative_paths() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("postfire.toml");
        fs::write(
            &path,
            r#"
            [paths]
            base_config = "configs/base.jshc"
            results_dir = "/srv/results"

            [engine]
            program = "pixi"
            args = ["run", "java", "-jar", "jar/joshsim-fat-prod.jar", "run"]
            timeout_secs = 600
            output = { mode = "per-invocation" }

            [engine.data]
            "data.jshd" = "preprocessed/fire_severity.jshd"

            [generation]
            duplicate_paths = "last-wins"

            [sweep]
            jobs = 4

            [scoring.window]
            mode = "trailing"
            steps = 25
            "#,
        )
        .unwrap();

        let settings = Settings::load(&path).unwrap();
        let root = fs::canonicalize(dir.path()).unwrap();
        assert_eq!(settings.source_dir(), root);
        assert_eq!(settings.paths.base_config, root.join("configs/base.jshc"));
        assert_eq!(settings.paths.results_dir, PathBuf::from("/srv/results"));
        assert_eq!(settings.paths.work_dir, root.join("work"));
        assert_eq!(settings.engine.working_dir.as_deref(), Some(root.as_path()));
        assert_eq!(settings.engine.output, OutputLocation::PerInvocation);
        assert_eq!(settings.engine.data["data.jshd"], "preprocessed/fire_severity.jshd");
        assert_eq!(settings.generation.duplicate_paths, DuplicatePolicy::LastWins);
        assert_eq!(settings.sweep.jobs, 4);
        assert_eq!(settings.scoring.window, EvaluationWindow::Trailing { steps: 25 });
        assert_eq!(settings.schema, ResultSchema::default());
    }

    #[test]
    fn explicit_missing_file_is_an_error() {
        let dir = tempdir().unwrap();
        assert!(Settings::load_or_default(Some(&dir.path().join("absent.toml"))).is_err());
    }

    #[test]
    fn rejects_invalid_sections() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        fs::write(&path, "[sweep]\njobs = 0\n").unwrap();
        assert!(Settings::load(&path).is_err());

        fs::write(
            &path,
            "[scoring.bands.ratio]\ntarget = { min = 1.0, max = 4.0 }\nloose = { min = 1.5, max = 3.0 }\n",
        )
        .unwrap();
        assert!(Settings::load(&path).is_err());

        fs::write(&path, "[engine]\nunknown_shape = [").unwrap();
        assert!(Settings::load(&path).is_err());
    }

    #[test]
    fn defaults_are_valid() {
        let settings = Settings::default().finish(PathBuf::from("/workspace")).unwrap();
        assert_eq!(
            settings.paths.definition,
            PathBuf::from("/workspace/configs/sweep/sweep_definitions.csv")
        );
        assert_eq!(settings.resolve_path("x.csv"), PathBuf::from("/workspace/x.csv"));
    }
}
