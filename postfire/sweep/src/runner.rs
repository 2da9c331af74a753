//! Sweep orchestration: merge, invoke, relocate, record.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use anyhow::{bail, Context, Result};
use futures::{stream, StreamExt};
use serde::Serialize;
use serde_json::json;
use shared_logging::LogLevel;

use crate::{
    engine::{EngineInvocation, EngineInvoker, EngineSettings, InvocationReport},
    error::InvocationError,
    keys::{ArtifactStore, SweepKey},
    params::ConfigArtifact,
    slot::OutputSlot,
    telemetry::{new_run_id, SweepTelemetry},
};

/// File name of the merged configuration inside each work directory.
pub const MERGED_FILE_NAME: &str = "merged.jshc";

/// Where the relocated result of `key` lives.
#[must_use]
pub fn result_path(results_dir: &Path, key: &SweepKey) -> PathBuf {
    results_dir.join(format!("{}.csv", key.file_stem()))
}

/// Per-run switches.
#[derive(Debug, Clone)]
pub struct SweepOptions {
    /// Only run combinations matching this key or key prefix.
    pub selector: Option<SweepKey>,
    /// List planned invocations without writing or executing anything.
    pub dry_run: bool,
    /// Maximum concurrent invocations.
    pub jobs: usize,
}

impl Default for SweepOptions {
    fn default() -> Self {
        Self {
            selector: None,
            dry_run: false,
            jobs: 1,
        }
    }
}

/// One planned invocation.
#[derive(Debug, Clone)]
pub struct SweepPlanEntry {
    /// Combination key.
    pub key: SweepKey,
    /// Where the merged configuration is written.
    pub merged_config: PathBuf,
    /// Where the result is relocated.
    pub destination: PathBuf,
    /// Resolved engine call.
    pub invocation: EngineInvocation,
}

/// Final state of one combination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CombinationStatus {
    /// Engine succeeded and its output was relocated.
    Succeeded,
    /// Preparation, invocation or relocation failed.
    Failed,
    /// Dry run; nothing executed.
    Planned,
}

/// Outcome recorded for one combination.
#[derive(Debug, Clone, Serialize)]
pub struct CombinationOutcome {
    /// Combination key.
    pub key: SweepKey,
    /// Final state.
    pub status: CombinationStatus,
    /// Engine exit code when the process exited.
    pub exit_code: Option<i32>,
    /// Wall-clock duration of the engine call.
    pub duration: Option<Duration>,
    /// Relocated result, when any output was produced.
    pub result: Option<PathBuf>,
    /// Failure description.
    pub error: Option<String>,
    /// Rendered command line.
    pub command: String,
}

/// Summary of a sweep.
#[derive(Debug, Clone, Serialize)]
pub struct SweepSummary {
    /// Run id tagging every run-log record.
    pub run_id: String,
    /// Combinations selected for the run.
    pub planned: usize,
    /// Combinations that produced a result.
    pub succeeded: usize,
    /// Combinations that failed.
    pub failed: usize,
    /// Combinations skipped by a dry run.
    pub skipped: usize,
    /// Per-combination outcomes in plan order.
    pub outcomes: Vec<CombinationOutcome>,
}

impl SweepSummary {
    /// Failed outcomes.
    pub fn failures(&self) -> impl Iterator<Item = &CombinationOutcome> {
        self.outcomes
            .iter()
            .filter(|outcome| outcome.status == CombinationStatus::Failed)
    }
}

/// Builder for [`SweepRunner`].
pub struct SweepRunnerBuilder {
    store: Arc<dyn ArtifactStore>,
    invoker: Arc<dyn EngineInvoker>,
    engine: EngineSettings,
    base_config: Option<PathBuf>,
    work_dir: PathBuf,
    results_dir: PathBuf,
    telemetry: Option<SweepTelemetry>,
}

impl SweepRunnerBuilder {
    /// Sets engine settings.
    #[must_use]
    pub fn engine(mut self, engine: EngineSettings) -> Self {
        self.engine = engine;
        self
    }

    /// Sets the base configuration every combination is merged over.
    #[must_use]
    pub fn base_config(mut self, path: impl Into<PathBuf>) -> Self {
        self.base_config = Some(path.into());
        self
    }

    /// Sets the directory for merged configurations.
    #[must_use]
    pub fn work_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.work_dir = path.into();
        self
    }

    /// Sets the directory receiving relocated results.
    #[must_use]
    pub fn results_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.results_dir = path.into();
        self
    }

    /// Sets telemetry.
    #[must_use]
    pub fn telemetry(mut self, telemetry: SweepTelemetry) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    /// Builds the runner.
    pub fn build(self) -> Result<SweepRunner> {
        let Some(base_config) = self.base_config else {
            bail!("sweep runner needs a base configuration");
        };
        let slot = self.engine.fixed_output().map(|path| Arc::new(OutputSlot::new(path)));
        Ok(SweepRunner {
            store: self.store,
            invoker: self.invoker,
            engine: self.engine,
            base_config,
            work_dir: self.work_dir,
            results_dir: self.results_dir,
            telemetry: self.telemetry,
            slot,
        })
    }
}

/// Runs the external engine once per stored combination.
pub struct SweepRunner {
    store: Arc<dyn ArtifactStore>,
    invoker: Arc<dyn EngineInvoker>,
    engine: EngineSettings,
    base_config: PathBuf,
    work_dir: PathBuf,
    results_dir: PathBuf,
    telemetry: Option<SweepTelemetry>,
    slot: Option<Arc<OutputSlot>>,
}

impl SweepRunner {
    /// Returns a builder reading combinations from `store` and calling `invoker`.
    #[must_use]
    pub fn builder(
        store: Arc<dyn ArtifactStore>,
        invoker: Arc<dyn EngineInvoker>,
    ) -> SweepRunnerBuilder {
        SweepRunnerBuilder {
            store,
            invoker,
            engine: EngineSettings::default(),
            base_config: None,
            work_dir: PathBuf::from("work"),
            results_dir: PathBuf::from("results"),
            telemetry: None,
        }
    }

    /// Directory receiving relocated results.
    #[must_use]
    pub fn results_dir(&self) -> &Path {
        &self.results_dir
    }

    /// Lists the invocations a run would perform, in key order.
    pub fn plan(&self, selector: Option<&SweepKey>) -> Result<Vec<SweepPlanEntry>> {
        let keys = self
            .store
            .keys()
            .context("failed to list combination artifacts")?;
        Ok(keys
            .into_iter()
            .filter(|key| match selector {
                Some(sel) => key.matches_selector(sel),
                None => true,
            })
            .map(|key| {
                let merged_config = self
                    .work_dir
                    .join(key.to_relative_path())
                    .join(MERGED_FILE_NAME);
                let destination = result_path(&self.results_dir, &key);
                let invocation = self.engine.invocation(&key, &merged_config, &destination);
                SweepPlanEntry {
                    key,
                    merged_config,
                    destination,
                    invocation,
                }
            })
            .collect())
    }

    /// Runs the sweep. Only setup problems (missing base configuration,
    /// unlistable store) are errors; combination failures are recorded in the
    /// summary and the sweep continues.
    pub async fn run(&self, options: &SweepOptions) -> Result<SweepSummary> {
        if options.jobs == 0 {
            bail!("jobs must be at least 1");
        }
        let base = ConfigArtifact::load(&self.base_config).with_context(|| {
            format!("failed to read base configuration {}", self.base_config.display())
        })?;
        let plan = self.plan(options.selector.as_ref())?;
        let run_id = self
            .telemetry
            .as_ref()
            .map_or_else(new_run_id, |tel| tel.run_id().to_string());
        self.log(
            LogLevel::Info,
            "sweep.started",
            None,
            json!({
                "planned": plan.len(),
                "dry_run": options.dry_run,
                "jobs": options.jobs,
                "selector": options.selector.as_ref().map(ToString::to_string),
            }),
        );
        if plan.is_empty() {
            self.log(
                LogLevel::Warn,
                "sweep.nothing_planned",
                None,
                json!({ "selector": options.selector.as_ref().map(ToString::to_string) }),
            );
        }

        let outcomes: Vec<CombinationOutcome> = if options.dry_run {
            plan.iter().map(planned_outcome).collect()
        } else {
            let mut indexed: Vec<(usize, CombinationOutcome)> =
                stream::iter(plan.iter().enumerate())
                    .map(|(index, entry)| {
                        let base = &base;
                        async move { (index, self.run_one(base, entry).await) }
                    })
                    .buffer_unordered(options.jobs)
                    .collect()
                    .await;
            indexed.sort_by_key(|(index, _)| *index);
            indexed.into_iter().map(|(_, outcome)| outcome).collect()
        };

        let summary = summarize(run_id, outcomes);
        self.log(
            LogLevel::Info,
            "sweep.finished",
            None,
            json!({
                "planned": summary.planned,
                "succeeded": summary.succeeded,
                "failed": summary.failed,
                "skipped": summary.skipped,
            }),
        );
        Ok(summary)
    }

    async fn run_one(&self, base: &ConfigArtifact, entry: &SweepPlanEntry) -> CombinationOutcome {
        let mut outcome = CombinationOutcome {
            key: entry.key.clone(),
            status: CombinationStatus::Failed,
            exit_code: None,
            duration: None,
            result: None,
            error: None,
            command: entry.invocation.command_line(),
        };

        if let Err(error) = self.prepare(base, entry).await {
            return self.fail(outcome, &error);
        }
        self.log(
            LogLevel::Info,
            "sweep.combination.started",
            Some(&entry.key),
            json!({ "command": outcome.command, "config": entry.merged_config }),
        );

        let (invoked, relocated) = self.execute(entry).await;
        if relocated {
            outcome.result = Some(entry.destination.clone());
        }
        let verdict = match invoked {
            Ok(report) => {
                outcome.exit_code = report.exit_code;
                outcome.duration = Some(report.duration);
                judge(&report, relocated, &entry.invocation)
            }
            Err(error) => Err(error),
        };
        match verdict {
            Ok(()) => {
                outcome.status = CombinationStatus::Succeeded;
                self.log(
                    LogLevel::Info,
                    "sweep.combination.succeeded",
                    Some(&entry.key),
                    json!({
                        "exit_code": outcome.exit_code,
                        "duration_secs": outcome.duration.map(|d| d.as_secs_f64()),
                        "result": entry.destination,
                    }),
                );
                outcome
            }
            Err(error) => self.fail(outcome, &error),
        }
    }

    async fn prepare(
        &self,
        base: &ConfigArtifact,
        entry: &SweepPlanEntry,
    ) -> Result<(), InvocationError> {
        let overrides = self
            .store
            .get(&entry.key)
            .map_err(|err| InvocationError::Prepare {
                reason: err.to_string(),
            })?
            .ok_or_else(|| InvocationError::Prepare {
                reason: format!("artifact for '{}' disappeared", entry.key),
            })?;
        let merged = ConfigArtifact::merge(base, &overrides, &entry.key.to_string());
        if let Some(parent) = entry.merged_config.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&entry.merged_config, merged.render()).await?;
        Ok(())
    }

    /// Invokes the engine and relocates whatever output it left, successful or not.
    /// A previous run's result never survives a new attempt.
    async fn execute(
        &self,
        entry: &SweepPlanEntry,
    ) -> (Result<InvocationReport, InvocationError>, bool) {
        if let Some(slot) = &self.slot {
            let guard = slot.acquire().await;
            if let Err(err) = remove_stale(&entry.destination).await {
                return (Err(err.into()), false);
            }
            if let Err(err) = guard.clear_stale() {
                return (Err(err.into()), false);
            }
            let invoked = self.invoker.invoke(&entry.invocation).await;
            match guard.relocate_to(&entry.destination) {
                Ok(relocated) => (invoked, relocated),
                Err(err) => (invoked.and(Err(err.into())), false),
            }
        } else {
            if let Err(err) = remove_stale(&entry.destination).await {
                return (Err(err.into()), false);
            }
            if let Some(parent) = entry.destination.parent() {
                if let Err(err) = tokio::fs::create_dir_all(parent).await {
                    return (Err(err.into()), false);
                }
            }
            let invoked = self.invoker.invoke(&entry.invocation).await;
            (invoked, entry.destination.is_file())
        }
    }

    fn fail(&self, mut outcome: CombinationOutcome, error: &InvocationError) -> CombinationOutcome {
        outcome.status = CombinationStatus::Failed;
        outcome.error = Some(error.to_string());
        let stderr_tail = match error {
            InvocationError::NonZeroExit { stderr_tail, .. } => Some(stderr_tail.as_str()),
            _ => None,
        };
        self.log(
            LogLevel::Warn,
            "sweep.combination.failed",
            Some(&outcome.key),
            json!({
                "error": outcome.error,
                "exit_code": outcome.exit_code,
                "partial_result": outcome.result,
                "stderr_tail": stderr_tail,
            }),
        );
        outcome
    }

    fn log(
        &self,
        level: LogLevel,
        message: &str,
        key: Option<&SweepKey>,
        metadata: serde_json::Value,
    ) {
        if let Some(tel) = &self.telemetry {
            let _ = tel.log(level, message, key, metadata);
        }
    }
}

async fn remove_stale(path: &Path) -> std::io::Result<()> {
    match tokio::fs::remove_file(path).await {
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

fn judge(
    report: &InvocationReport,
    relocated: bool,
    invocation: &EngineInvocation,
) -> Result<(), InvocationError> {
    if !report.success {
        return Err(InvocationError::NonZeroExit {
            code: report.exit_code,
            stderr_tail: report.stderr_tail.clone(),
        });
    }
    if !relocated {
        return Err(InvocationError::MissingOutput {
            expected: invocation.output.clone(),
        });
    }
    Ok(())
}

fn planned_outcome(entry: &SweepPlanEntry) -> CombinationOutcome {
    CombinationOutcome {
        key: entry.key.clone(),
        status: CombinationStatus::Planned,
        exit_code: None,
        duration: None,
        result: None,
        error: None,
        command: entry.invocation.command_line(),
    }
}

fn summarize(run_id: String, outcomes: Vec<CombinationOutcome>) -> SweepSummary {
    let count = |status| outcomes.iter().filter(|o| o.status == status).count();
    SweepSummary {
        run_id,
        planned: outcomes.len(),
        succeeded: count(CombinationStatus::Succeeded),
        failed: count(CombinationStatus::Failed),
        skipped: count(CombinationStatus::Planned),
        outcomes,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        engine::OutputLocation,
        keys::MemoryArtifactStore,
        params::ParamValue,
    };
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use tempfile::tempdir;

    /// Writes the merged config it receives to the engine output path.
    struct EchoEngine {
        fail_keys: Vec<&'static str>,
        calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl EngineInvoker for EchoEngine {
        async fn invoke(
            &self,
            invocation: &EngineInvocation,
        ) -> Result<InvocationReport, InvocationError> {
            let key = invocation.key.to_string();
            self.calls.lock().push(key.clone());
            if self.fail_keys.contains(&key.as_str()) {
                return Ok(InvocationReport {
                    exit_code: Some(1),
                    success: false,
                    duration: Duration::from_millis(1),
                    stdout_tail: String::new(),
                    stderr_tail: "model error".into(),
                });
            }
            let config = invocation
                .args
                .iter()
                .find_map(|arg| arg.strip_prefix("config.jshc="))
                .unwrap();
            let merged = ConfigArtifact::load(config).unwrap();
            let growth = merged.get("growthRate").unwrap();
            std::fs::create_dir_all(invocation.output.parent().unwrap()).unwrap();
            std::fs::write(&invocation.output, format!("growthRate\n{}\n", growth.value)).unwrap();
            Ok(InvocationReport {
                exit_code: Some(0),
                success: true,
                duration: Duration::from_millis(1),
                stdout_tail: String::new(),
                stderr_tail: String::new(),
            })
        }
    }

    fn store_with(keys: &[(&str, &str)]) -> Arc<MemoryArtifactStore> {
        let store = Arc::new(MemoryArtifactStore::new());
        for (key, growth) in keys {
            let mut artifact = ConfigArtifact::new();
            artifact.push_entry("growthRate", &ParamValue::new(*growth, Some("percent")));
            store.put(&SweepKey::parse(key).unwrap(), &artifact).unwrap();
        }
        store
    }

    fn engine(fail_keys: Vec<&'static str>) -> Arc<EchoEngine> {
        Arc::new(EchoEngine {
            fail_keys,
            calls: Mutex::new(Vec::new()),
        })
    }

    #[test]
    fn failure_does_not_stop_later_combinations() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let dir = tempdir().unwrap();
        let base = dir.path().join("base.jshc");
        std::fs::write(&base, "growthRate = 1 percent\n").unwrap();
        let echo = engine(vec!["b"]);
        let store = store_with(&[("a", "5"), ("b", "7"), ("c", "10")]);
        let runner = SweepRunner::builder(store, echo.clone())
            .engine(EngineSettings {
                output: OutputLocation::Fixed {
                    path: dir.path().join("engine/output.csv"),
                },
                ..EngineSettings::default()
            })
            .base_config(&base)
            .work_dir(dir.path().join("work"))
            .results_dir(dir.path().join("results"))
            .build()
            .unwrap();

        let summary = rt.block_on(runner.run(&SweepOptions::default())).unwrap();
        assert_eq!((summary.planned, summary.succeeded, summary.failed), (3, 2, 1));
        assert_eq!(echo.calls.lock().len(), 3);
        assert_eq!(summary.outcomes[1].status, CombinationStatus::Failed);
        assert_eq!(summary.outcomes[1].exit_code, Some(1));
        assert_eq!(
            std::fs::read_to_string(dir.path().join("results/c.csv")).unwrap(),
            "growthRate\n10\n"
        );
        assert!(!dir.path().join("results/b.csv").exists());
    }

    #[test]
    fn dry_run_writes_nothing() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let dir = tempdir().unwrap();
        let base = dir.path().join("base.jshc");
        std::fs::write(&base, "growthRate = 1 percent\n").unwrap();
        let echo = engine(Vec::new());
        let store = store_with(&[("fire/low", "5"), ("fire/high", "9")]);
        let runner = SweepRunner::builder(store, echo.clone())
            .base_config(&base)
            .work_dir(dir.path().join("work"))
            .results_dir(dir.path().join("results"))
            .build()
            .unwrap();

        let options = SweepOptions {
            dry_run: true,
            ..SweepOptions::default()
        };
        let summary = rt.block_on(runner.run(&options)).unwrap();
        assert_eq!(summary.skipped, 2);
        assert!(summary.outcomes[0].command.contains("merged.jshc"));
        assert!(echo.calls.lock().is_empty());
        assert!(!dir.path().join("work").exists());
        assert!(!dir.path().join("results").exists());
    }

    #[test]
    fn selector_limits_the_plan() {
        let dir = tempdir().unwrap();
        let runner = SweepRunner::builder(
            store_with(&[("fire/low", "5"), ("fire/high", "9"), ("firebreak", "1")]),
            engine(Vec::new()),
        )
        .base_config(dir.path().join("base.jshc"))
        .build()
        .unwrap();
        let fire = SweepKey::parse("fire").unwrap();
        let plan = runner.plan(Some(&fire)).unwrap();
        let keys: Vec<String> = plan.iter().map(|e| e.key.to_string()).collect();
        assert_eq!(keys, vec!["fire/high", "fire/low"]);
        assert_eq!(plan[0].destination, PathBuf::from("results/fire__high.csv"));

        let unknown = SweepKey::parse("nothing").unwrap();
        assert!(runner.plan(Some(&unknown)).unwrap().is_empty());
    }

    #[test]
    fn missing_base_configuration_is_fatal() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let dir = tempdir().unwrap();
        let runner = SweepRunner::builder(store_with(&[("a", "5")]), engine(Vec::new()))
            .base_config(dir.path().join("absent.jshc"))
            .build()
            .unwrap();
        assert!(rt.block_on(runner.run(&SweepOptions::default())).is_err());
    }

    #[test]
    fn builder_requires_base_configuration() {
        assert!(SweepRunner::builder(store_with(&[]), engine(Vec::new()))
            .build()
            .is_err());
    }
}
