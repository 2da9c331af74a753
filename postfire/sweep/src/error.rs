use std::{io, path::PathBuf, time::Duration};

use thiserror::Error;

/// Errors raised while reading a sweep definition or materializing its artifacts.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The definition header lacks the mandatory `path` column.
    #[error("definition {} has no `path` column", .source_path.display())]
    MissingPathColumn {
        /// Definition file (or `<reader>` for in-memory input).
        source_path: PathBuf,
    },
    /// A row declares an empty `path`.
    #[error("empty `path` value")]
    EmptyPath,
    /// A `path` value cannot be turned into a sweep key.
    #[error("invalid sweep path '{key}': {reason}")]
    InvalidKey {
        /// Offending raw value.
        key: String,
        /// Why it was refused.
        reason: &'static str,
    },
    /// The same `path` appears on more than one row.
    #[error("path '{path}' already declared on line {first_line}")]
    DuplicatePath {
        /// Duplicated path.
        path: String,
        /// Line of the first declaration.
        first_line: u64,
    },
    /// A parameter value does not parse as a finite number.
    #[error("column '{column}' holds non-numeric value '{value}'")]
    MalformedValue {
        /// Parameter column.
        column: String,
        /// Raw cell content.
        value: String,
    },
    /// A value or unit the artifact format cannot carry: values may not hold
    /// whitespace and neither may hold `#`.
    #[error("column '{column}' holds '{value}', which would not read back from an artifact")]
    UnrepresentableValue {
        /// Parameter column.
        column: String,
        /// Raw cell content.
        value: String,
    },
    /// A scenario name is not among the built-in presets.
    #[error("unknown scenario '{name}'")]
    UnknownScenario {
        /// Requested name.
        name: String,
    },
    /// CSV decoding failure.
    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),
    /// I/O error (filesystem).
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// Failure of a single external engine invocation.
#[derive(Debug, Error)]
pub enum InvocationError {
    /// Merged configuration could not be prepared.
    #[error("could not prepare configuration: {reason}")]
    Prepare {
        /// Underlying cause.
        reason: String,
    },
    /// The engine process could not be started.
    #[error("failed to start '{program}': {source}")]
    Spawn {
        /// Program that was launched.
        program: String,
        /// Launch error.
        #[source]
        source: io::Error,
    },
    /// The engine did not finish within the configured timeout.
    #[error("engine timed out after {}s", .timeout.as_secs())]
    Timeout {
        /// Timeout that expired.
        timeout: Duration,
    },
    /// The engine exited unsuccessfully.
    #[error("engine exited with status {code:?}")]
    NonZeroExit {
        /// Exit code, `None` when terminated by a signal.
        code: Option<i32>,
        /// Tail of the captured standard error.
        stderr_tail: String,
    },
    /// The engine reported success but wrote nothing.
    #[error("engine produced no output at {}", .expected.display())]
    MissingOutput {
        /// Where output was expected.
        expected: PathBuf,
    },
    /// I/O error while waiting for or relocating output.
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// Reasons a scenario result is excluded from ranking.
#[derive(Debug, Error)]
pub enum ScoringError {
    /// No result file exists for the configuration.
    #[error("result file {} is missing", .path.display())]
    MissingResult {
        /// Expected result location.
        path: PathBuf,
    },
    /// The result file holds a header but no rows.
    #[error("result file {} has no rows", .path.display())]
    EmptyResult {
        /// Result location.
        path: PathBuf,
    },
    /// A column required for scoring is absent.
    #[error("result is missing column '{column}'")]
    MissingColumn {
        /// Column name from the result schema.
        column: String,
    },
    /// A cell could not be parsed.
    #[error("line {line}: {reason}")]
    Malformed {
        /// CSV line number.
        line: u64,
        /// Parse failure description.
        reason: String,
    },
    /// Rows exist, but none fall inside the evaluation window.
    #[error("no rows inside evaluation window ({window})")]
    NoRowsInWindow {
        /// Rendered window.
        window: String,
    },
    /// A covariate stratum holds no rows inside the window.
    #[error("{stratum} stratum holds no rows inside the evaluation window")]
    EmptyStratum {
        /// `low` or `high`.
        stratum: &'static str,
    },
    /// CSV decoding failure.
    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),
    /// I/O error (filesystem).
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// Errors raised by raster generation and ASCII grid I/O.
#[derive(Debug, Error)]
pub enum RasterError {
    /// Grid geometry is unusable.
    #[error("invalid grid: {reason}")]
    InvalidGrid {
        /// Description.
        reason: String,
    },
    /// An ASCII grid file could not be parsed.
    #[error("line {line}: {reason}")]
    Malformed {
        /// Line number in the grid file.
        line: usize,
        /// Parse failure description.
        reason: String,
    },
    /// I/O error (filesystem).
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}
