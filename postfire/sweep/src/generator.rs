use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use shared_logging::LogLevel;

use crate::{
    definition::{RejectedRow, SweepDefinition},
    error::ConfigError,
    keys::{ArtifactStore, SweepKey},
    telemetry::SweepTelemetry,
};

/// Outcome of materializing a definition.
#[derive(Debug, Default)]
pub struct GenerationReport {
    /// Keys written to the store, in definition order.
    pub generated: Vec<SweepKey>,
    /// Rows refused while reading or writing.
    pub rejected: Vec<RejectedRow>,
}

/// Outcome of a clean pass.
#[derive(Debug, Default)]
pub struct CleanReport {
    /// Declared keys whose artifact was removed.
    pub removed: Vec<SweepKey>,
    /// Declared keys that had nothing to remove.
    pub absent: Vec<SweepKey>,
}

/// Expands sweep definitions into one configuration artifact per combination.
pub struct ConfigGenerator {
    store: Arc<dyn ArtifactStore>,
    telemetry: Option<SweepTelemetry>,
}

impl ConfigGenerator {
    /// Creates a generator writing into `store`.
    #[must_use]
    pub fn new(store: Arc<dyn ArtifactStore>, telemetry: Option<SweepTelemetry>) -> Self {
        Self { store, telemetry }
    }

    /// Writes one artifact per accepted combination. A failed write rejects that
    /// row only; rows rejected while reading are carried into the report.
    pub fn generate(&self, definition: SweepDefinition) -> GenerationReport {
        let generated_at = Utc::now();
        let mut report = GenerationReport {
            generated: Vec::new(),
            rejected: definition.rejected,
        };
        for row in &report.rejected {
            self.log(
                LogLevel::Warn,
                "generation.row_rejected",
                None,
                json!({ "line": row.line, "path": row.path, "error": row.error.to_string() }),
            );
        }
        for combination in definition.combinations {
            let artifact = combination.to_artifact(generated_at);
            match self.store.put(&combination.key, &artifact) {
                Ok(()) => {
                    self.log(
                        LogLevel::Debug,
                        "generation.artifact_written",
                        Some(&combination.key),
                        json!({ "parameters": combination.params.len() }),
                    );
                    report.generated.push(combination.key);
                }
                Err(error) => {
                    self.log(
                        LogLevel::Warn,
                        "generation.write_failed",
                        Some(&combination.key),
                        json!({ "error": error.to_string() }),
                    );
                    report.rejected.push(RejectedRow {
                        line: combination.line,
                        path: Some(combination.key.to_string()),
                        error,
                    });
                }
            }
        }
        self.log(
            LogLevel::Info,
            "generation.completed",
            None,
            json!({ "generated": report.generated.len(), "rejected": report.rejected.len() }),
        );
        report
    }

    /// Removes the artifact of every key the definition declares. Keys the
    /// definition does not declare are never touched; running twice is a no-op.
    pub fn clean(&self, definition: &SweepDefinition) -> Result<CleanReport, ConfigError> {
        let mut report = CleanReport::default();
        for key in &definition.declared {
            if self.store.remove(key)? {
                self.log(LogLevel::Debug, "generation.artifact_removed", Some(key), json!({}));
                report.removed.push(key.clone());
            } else {
                report.absent.push(key.clone());
            }
        }
        self.log(
            LogLevel::Info,
            "generation.cleaned",
            None,
            json!({ "removed": report.removed.len(), "absent": report.absent.len() }),
        );
        Ok(report)
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
