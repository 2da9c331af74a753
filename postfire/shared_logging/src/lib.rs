#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    missing_docs,
    rust_2018_idioms
)]

//! Append-only JSON-lines run log shared by the sweep tools.
//!
//! Every record is one JSON object per line. Records emitted while a sweep is
//! running carry the sweep's run id and, when they concern a single parameter
//! combination, that combination's key, so a run log can be filtered back into
//! per-combination histories.

use std::{
    fs::{self, File},
    io::{BufRead, BufReader, Write},
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Log severity level.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    /// Debug information.
    Debug,
    /// Informational events.
    Info,
    /// Warning indicator.
    Warn,
    /// Error indicator.
    Error,
}

/// Structured run log record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogRecord {
    /// Timestamp in ISO8601.
    pub timestamp: DateTime<Utc>,
    /// Component emitting the record (`generator`, `sweep`, `scorer`, ...).
    pub component: String,
    /// Severity.
    pub level: LogLevel,
    /// Dotted event name, e.g. `sweep.combination.failed`.
    pub message: String,
    /// Identifier shared by every record of one sweep invocation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    /// Key of the parameter combination the record is about.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub combination: Option<String>,
    /// Arbitrary JSON fields.
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl LogRecord {
    /// Creates a record with the provided info.
    #[must_use]
    pub fn new(component: impl Into<String>, level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            component: component.into(),
            level,
            message: message.into(),
            run_id: None,
            combination: None,
            metadata: serde_json::Map::new(),
        }
    }

    /// Tags the record with a sweep run id.
    #[must_use]
    pub fn with_run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = Some(run_id.into());
        self
    }

    /// Tags the record with a combination key.
    #[must_use]
    pub fn with_combination(mut self, key: impl Into<String>) -> Self {
        self.combination = Some(key.into());
        self
    }

    /// Merges the fields of a JSON object into the metadata. Non-object values are
    /// stored under `data`.
    #[must_use]
    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        match metadata {
            serde_json::Value::Object(map) => self.metadata.extend(map),
            serde_json::Value::Null => {}
            other => {
                self.metadata.insert("data".into(), other);
            }
        }
        self
    }
}

/// Thread-safe JSON logger with append-only semantics.
#[derive(Debug)]
pub struct JsonLogger {
    path: PathBuf,
    writer: Mutex<File>,
}

impl JsonLogger {
    /// Creates or opens a logger at the desired path.
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating run log directory {}", parent.display()))?;
        }
        let file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("opening run log {}", path.display()))?;
        Ok(Self {
            path,
            writer: Mutex::new(file),
        })
    }

    /// Writes a log record as JSON line.
    pub fn log(&self, record: &LogRecord) -> Result<()> {
        let mut writer = self.writer.lock();
        serde_json::to_writer(&mut *writer, record)?;
        writer.write_all(b"\n")?;
        writer.flush()?;
        Ok(())
    }

    /// Returns the underlying file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Reads every record of a run log. A missing file yields no records; blank lines
/// are skipped.
pub fn read_records(path: impl AsRef<Path>) -> Result<Vec<LogRecord>> {
    let path = path.as_ref();
    if !path.exists() {
        return Ok(Vec::new());
    }
    let reader = BufReader::new(
        File::open(path).with_context(|| format!("opening run log {}", path.display()))?,
    );
    let mut records = Vec::new();
    for (idx, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let record = serde_json::from_str(&line)
            .with_context(|| format!("{}:{}: malformed run log record", path.display(), idx + 1))?;
        records.push(record);
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    #[test]
    fn writes_json_lines() {
        let dir = tempdir().unwrap();
        let logger = JsonLogger::new(dir.path().join("logs/sweep.jsonl")).unwrap();
        logger
            .log(&LogRecord::new("sweep", LogLevel::Info, "sweep.started"))
            .unwrap();
        let content = fs::read_to_string(logger.path()).unwrap();
        assert!(content.contains("\"message\":\"sweep.started\""));
        assert!(!content.contains("combination"));
    }

    #[test]
    fn reads_back_tagged_records() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("run.jsonl");
        let logger = JsonLogger::new(&path).unwrap();
        let record = LogRecord::new("sweep", LogLevel::Warn, "sweep.combination.failed")
            .with_run_id("sweep-1")
            .with_combination("growth/low")
            .with_metadata(json!({ "exit_code": 3 }));
        logger.log(&record).unwrap();
        logger
            .log(&LogRecord::new("sweep", LogLevel::Info, "sweep.finished").with_run_id("sweep-1"))
            .unwrap();

        let records = read_records(&path).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].combination.as_deref(), Some("growth/low"));
        assert_eq!(records[0].metadata["exit_code"], json!(3));
        assert_eq!(records[1].level, LogLevel::Info);
    }

    #[test]
    fn missing_log_reads_empty() {
        let dir = tempdir().unwrap();
        assert!(read_records(dir.path().join("absent.jsonl")).unwrap().is_empty());
    }
}
