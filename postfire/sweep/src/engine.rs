//! Contract with the external simulation engine and the process-based invoker.

use std::{
    path::{Path, PathBuf},
    process::Stdio,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tokio::{process::Command, time::timeout};

use crate::{error::InvocationError, keys::SweepKey};

const DEFAULT_TIMEOUT_SECS: u64 = 7_200;
const MAX_CAPTURED_TAIL_BYTES: usize = 8_192;

/// Where the engine writes its result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "kebab-case")]
pub enum OutputLocation {
    /// One engine-chosen path shared by every invocation.
    Fixed {
        /// Output path, relative to the engine working directory.
        path: PathBuf,
    },
    /// The engine writes to the `{output}` placeholder of each invocation.
    PerInvocation,
}

impl Default for OutputLocation {
    fn default() -> Self {
        Self::Fixed {
            path: PathBuf::from("results/output.csv"),
        }
    }
}

/// How to call the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// Program to launch.
    pub program: String,
    /// Arguments placed before the model path.
    pub args: Vec<String>,
    /// Model definition passed to the engine.
    pub model: PathBuf,
    /// Simulation / entry-point name.
    pub simulation: String,
    /// Logical name bound to the merged configuration via `--data`.
    pub config_binding: String,
    /// Extra `--data name=path` bindings (preprocessed spatial inputs).
    pub data: IndexMap<String, String>,
    /// Working directory of the engine process (defaults to the settings directory).
    pub working_dir: Option<PathBuf>,
    /// Per-invocation timeout in seconds.
    pub timeout_secs: u64,
    /// Output location convention.
    pub output: OutputLocation,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            program: "java".into(),
            args: vec![
                "-jar".into(),
                "jar/joshsim-fat-prod.jar".into(),
                "run".into(),
            ],
            model: PathBuf::from("model.josh"),
            simulation: "Main".into(),
            config_binding: "config.jshc".into(),
            data: IndexMap::new(),
            working_dir: None,
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            output: OutputLocation::default(),
        }
    }
}

impl EngineSettings {
    /// Per-invocation timeout.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Fixed output path resolved against the working directory, if the engine
    /// uses one.
    #[must_use]
    pub fn fixed_output(&self) -> Option<PathBuf> {
        match &self.output {
            OutputLocation::Fixed { path } => Some(match &self.working_dir {
                Some(dir) if path.is_relative() => dir.join(path),
                _ => path.clone(),
            }),
            OutputLocation::PerInvocation => None,
        }
    }

    /// Builds the invocation for one combination. `destination` is where the
    /// relocated result ends up; in per-invocation mode the engine writes there
    /// directly.
    #[must_use]
    pub fn invocation(
        &self,
        key: &SweepKey,
        config: &Path,
        destination: &Path,
    ) -> EngineInvocation {
        let output = self.fixed_output().unwrap_or_else(|| destination.to_path_buf());
        let substitute = |raw: &str| {
            raw.replace("{key}", &key.to_string())
                .replace("{config}", &config.display().to_string())
                .replace("{output}", &output.display().to_string())
        };
        let mut args: Vec<String> = self.args.iter().map(|arg| substitute(arg)).collect();
        args.push(self.model.display().to_string());
        args.push(self.simulation.clone());
        args.push("--data".into());
        args.push(format!("{}={}", self.config_binding, config.display()));
        for (name, value) in &self.data {
            args.push("--data".into());
            args.push(format!("{name}={}", substitute(value)));
        }
        EngineInvocation {
            key: key.clone(),
            program: self.program.clone(),
            args,
            working_dir: self.working_dir.clone(),
            timeout: self.timeout(),
            output,
        }
    }
}

/// A fully resolved engine call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineInvocation {
    /// Combination being simulated.
    pub key: SweepKey,
    /// Program to launch.
    pub program: String,
    /// Full argument list.
    pub args: Vec<String>,
    /// Working directory, if any.
    pub working_dir: Option<PathBuf>,
    /// Timeout for this call.
    pub timeout: Duration,
    /// Where the engine writes its result.
    pub output: PathBuf,
}

impl EngineInvocation {
    /// Shell-like rendering for dry runs and logs.
    #[must_use]
    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .map(|part| {
                if part.is_empty() || part.contains(char::is_whitespace) {
                    format!("'{part}'")
                } else {
                    part.to_string()
                }
            })
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// What a finished engine process reported.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvocationReport {
    /// Exit code, `None` when terminated by a signal.
    pub exit_code: Option<i32>,
    /// Whether the exit status was success.
    pub success: bool,
    /// Wall-clock duration.
    pub duration: Duration,
    /// Tail of standard output.
    pub stdout_tail: String,
    /// Tail of standard error.
    pub stderr_tail: String,
}

/// Runs the engine for one invocation. A nonzero exit is a report, not an error;
/// errors are reserved for calls that never produced an exit status.
#[async_trait]
pub trait EngineInvoker: Send + Sync {
    /// Invokes the engine and waits for it to finish.
    async fn invoke(
        &self,
        invocation: &EngineInvocation,
    ) -> Result<InvocationReport, InvocationError>;
}

/// Launches the engine as a child process.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessInvoker;

#[async_trait]
impl EngineInvoker for ProcessInvoker {
    async fn invoke(
        &self,
        invocation: &EngineInvocation,
    ) -> Result<InvocationReport, InvocationError> {
        let mut command = Command::new(&invocation.program);
        command.args(&invocation.args);
        if let Some(dir) = &invocation.working_dir {
            command.current_dir(dir);
        }
        command.stdin(Stdio::null());
        command.stdout(Stdio::piped());
        command.stderr(Stdio::piped());
        command.kill_on_drop(true);

        let child = command.spawn().map_err(|source| InvocationError::Spawn {
            program: invocation.program.clone(),
            source,
        })?;

        let start = Instant::now();
        match timeout(invocation.timeout, child.wait_with_output()).await {
            Ok(output) => {
                let output = output?;
                Ok(InvocationReport {
                    exit_code: output.status.code(),
                    success: output.status.success(),
                    duration: start.elapsed(),
                    stdout_tail: tail(&output.stdout),
                    stderr_tail: tail(&output.stderr),
                })
            }
            Err(_) => Err(InvocationError::Timeout {
                timeout: invocation.timeout,
            }),
        }
    }
}

fn tail(bytes: &[u8]) -> String {
    let text = String::from_utf8_lossy(bytes);
    if text.len() <= MAX_CAPTURED_TAIL_BYTES {
        return text.into_owned();
    }
    let mut start = text.len() - MAX_CAPTURED_TAIL_BYTES;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    format!("...[truncated]\n{}", &text[start..])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> SweepKey {
        SweepKey::parse("growth/high").unwrap()
    }

    #[test]
    fn builds_engine_cli_contract() {
        let mut settings = EngineSettings::default();
        settings
            .data
            .insert("data.jshd".into(), "preprocessed/fire_severity.jshd".into());
        let invocation = settings.invocation(
            &key(),
            Path::new("work/growth/high/merged.jshc"),
            Path::new("results/growth__high.csv"),
        );
        assert_eq!(invocation.program, "java");
        assert_eq!(
            invocation.args,
            vec![
                "-jar",
                "jar/joshsim-fat-prod.jar",
                "run",
                "model.josh",
                "Main",
                "--data",
                "config.jshc=work/growth/high/merged.jshc",
                "--data",
                "data.jshd=preprocessed/fire_severity.jshd",
            ]
        );
        assert_eq!(invocation.output, PathBuf::from("results/output.csv"));
        assert_eq!(invocation.timeout, Duration::from_secs(DEFAULT_TIMEOUT_SECS));
    }

    #[test]
    fn per_invocation_output_substitutes_placeholders() {
        let settings = EngineSettings {
            args: vec!["--out".into(), "{output}".into(), "--label".into(), "{key}".into()],
            output: OutputLocation::PerInvocation,
            ..EngineSettings::default()
        };
        let invocation = settings.invocation(
            &key(),
            Path::new("merged.jshc"),
            Path::new("results/growth__high.csv"),
        );
        assert_eq!(invocation.args[1], "results/growth__high.csv");
        assert_eq!(invocation.args[3], "growth/high");
        assert_eq!(invocation.output, PathBuf::from("results/growth__high.csv"));
    }

    #[test]
    fn fixed_output_resolves_against_working_dir() {
        let settings = EngineSettings {
            working_dir: Some(PathBuf::from("/workspace")),
            ..EngineSettings::default()
        };
        assert_eq!(
            settings.fixed_output(),
            Some(PathBuf::from("/workspace/results/output.csv"))
        );
    }

    #[test]
    fn command_line_quotes_spaced_arguments() {
        let invocation = EngineInvocation {
            key: key(),
            program: "engine".into(),
            args: vec!["run".into(), "my model.josh".into()],
            working_dir: None,
            timeout: Duration::from_secs(1),
            output: PathBuf::from("out.csv"),
        };
        assert_eq!(invocation.command_line(), "engine run 'my model.josh'");
    }

    #[test]
    fn tail_keeps_the_end_of_long_output() {
        let long = "x".repeat(MAX_CAPTURED_TAIL_BYTES + 10) + "END";
        let kept = tail(long.as_bytes());
        assert!(kept.starts_with("...[truncated]"));
        assert!(kept.ends_with("END"));
    }

    #[cfg(unix)]
    #[test]
    fn process_invoker_reports_exit_status() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let invocation = EngineInvocation {
            key: key(),
            program: "sh".into(),
            args: vec!["-c".into(), "echo running; echo broken >&2; exit 3".into()],
            working_dir: None,
            timeout: Duration::from_secs(30),
            output: PathBuf::from("unused.csv"),
        };
        let report = rt.block_on(ProcessInvoker.invoke(&invocation)).unwrap();
        assert!(!report.success);
        assert_eq!(report.exit_code, Some(3));
        assert!(report.stdout_tail.contains("running"));
        assert!(report.stderr_tail.contains("broken"));
    }

    #[cfg(unix)]
    #[test]
    fn process_invoker_times_out() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let invocation = EngineInvocation {
            key: key(),
            program: "sh".into(),
            args: vec!["-c".into(), "sleep 5".into()],
            working_dir: None,
            timeout: Duration::from_millis(100),
            output: PathBuf::from("unused.csv"),
        };
        let err = rt.block_on(ProcessInvoker.invoke(&invocation)).unwrap_err();
        assert!(matches!(err, InvocationError::Timeout { .. }));
    }

    #[test]
    fn missing_program_is_a_spawn_error() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let invocation = EngineInvocation {
            key: key(),
            program: "postfire-engine-that-does-not-exist".into(),
            args: Vec::new(),
            working_dir: None,
            timeout: Duration::from_secs(1),
            output: PathBuf::from("unused.csv"),
        };
        let err = rt.block_on(ProcessInvoker.invoke(&invocation)).unwrap_err();
        assert!(matches!(err, InvocationError::Spawn { .. }));
    }
}
