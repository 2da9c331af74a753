use std::{fmt, path::PathBuf, sync::Arc};

use anyhow::Result;
use serde_json::Value;
use shared_logging::{JsonLogger, LogLevel, LogRecord};
use uuid::Uuid;

use crate::keys::SweepKey;

/// Telemetry builder for sweep components.
pub struct SweepTelemetryBuilder {
    component: String,
    log_path: Option<PathBuf>,
    run_id: Option<String>,
}

impl SweepTelemetryBuilder {
    /// Creates a new builder scoped to a component label.
    #[must_use]
    pub fn new(component: impl Into<String>) -> Self {
        Self {
            component: component.into(),
            log_path: None,
            run_id: None,
        }
    }

    /// Sets the JSON-lines run log path.
    #[must_use]
    pub fn log_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_path = Some(path.into());
        self
    }

    /// Sets an explicit run id instead of a generated one.
    #[must_use]
    pub fn run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = Some(run_id.into());
        self
    }

    /// Builds telemetry.
    pub fn build(self) -> Result<SweepTelemetry> {
        let logger = match self.log_path {
            Some(path) => Some(Arc::new(JsonLogger::new(path)?)),
            None => None,
        };
        Ok(SweepTelemetry {
            component: self.component,
            run_id: self.run_id.unwrap_or_else(new_run_id),
            logger,
        })
    }
}

/// Telemetry handle shared across sweep components: every record goes to
/// `tracing` and, when configured, to the run log.
#[derive(Clone)]
pub struct SweepTelemetry {
    component: String,
    run_id: String,
    logger: Option<Arc<JsonLogger>>,
}

impl fmt::Debug for SweepTelemetry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SweepTelemetry")
            .field("component", &self.component)
            .field("run_id", &self.run_id)
            .finish()
    }
}

impl SweepTelemetry {
    /// Returns a builder.
    #[must_use]
    pub fn builder(component: impl Into<String>) -> SweepTelemetryBuilder {
        SweepTelemetryBuilder::new(component)
    }

    /// Same run log, different component label.
    #[must_use]
    pub fn for_component(&self, component: impl Into<String>) -> Self {
        Self {
            component: component.into(),
            run_id: self.run_id.clone(),
            logger: self.logger.clone(),
        }
    }

    /// Run id attached to every record.
    #[must_use]
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Logs a record, optionally about one combination.
    pub fn log(
        &self,
        level: LogLevel,
        message: &str,
        combination: Option<&SweepKey>,
        metadata: Value,
    ) -> Result<()> {
        let key = combination.map(ToString::to_string);
        let key_field = key.as_deref().unwrap_or("-");
        match level {
            LogLevel::Debug => {
                tracing::debug!(
                    component = %self.component,
                    combination = key_field,
                    %metadata,
                    "{message}"
                );
            }
            LogLevel::Info => {
                tracing::info!(
                    component = %self.component,
                    combination = key_field,
                    %metadata,
                    "{message}"
                );
            }
            LogLevel::Warn => {
                tracing::warn!(
                    component = %self.component,
                    combination = key_field,
                    %metadata,
                    "{message}"
                );
            }
            LogLevel::Error => {
                tracing::error!(
                    component = %self.component,
                    combination = key_field,
                    %metadata,
                    "{message}"
                );
            }
        }
        if let Some(logger) = &self.logger {
            let mut record = LogRecord::new(&self.component, level, message)
                .with_run_id(&self.run_id)
                .with_metadata(metadata);
            if let Some(key) = key {
                record = record.with_combination(key);
            }
            logger.log(&record)?;
        }
        Ok(())
    }
}

/// Generates a fresh sweep run id.
#[must_use]
pub fn new_run_id() -> String {
    format!("sweep-{}", Uuid::new_v4())
}
