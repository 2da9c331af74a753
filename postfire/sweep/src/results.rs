//! Scenario result tables produced by the engine.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ScoringError;

/// Column names of the engine export. The engine owns these names, so they
/// are configuration rather than constants.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResultSchema {
    /// Replicate index (optional; absent means a single replicate).
    pub replicate: String,
    /// Time step.
    pub step: String,
    /// Cell x coordinate.
    pub x: String,
    /// Cell y coordinate.
    pub y: String,
    /// Seedling count (informational).
    pub seedlings: String,
    /// Juvenile count (informational).
    pub juveniles: String,
    /// Adult count (informational).
    pub adults: String,
    /// Total population count.
    pub alive: String,
    /// Invasive cover fraction.
    pub cover: String,
    /// Disturbance severity (optional).
    pub severity: String,
    /// Covariate used to split cells into strata.
    pub covariate: String,
}

impl Default for ResultSchema {
    fn default() -> Self {
        Self {
            replicate: "replicate".into(),
            step: "step".into(),
            x: "position.x".into(),
            y: "position.y".into(),
            seedlings: "numSeedling".into(),
            juveniles: "numJuvenile".into(),
            adults: "numAdult".into(),
            alive: "numAlive".into(),
            cover: "invasiveCover".into(),
            severity: "fireSeverity".into(),
            covariate: "elevation".into(),
        }
    }
}

/// One row of a scenario result.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResultRow {
    /// Replicate index.
    pub replicate: u32,
    /// Time step.
    pub step: i64,
    /// Cell x coordinate.
    pub x: f64,
    /// Cell y coordinate.
    pub y: f64,
    /// Total population in the cell.
    pub alive: f64,
    /// Cover fraction in the cell.
    pub cover: f64,
    /// Covariate value of the cell.
    pub covariate: f64,
    /// Disturbance severity, when exported.
    pub severity: Option<f64>,
}

impl ResultRow {
    /// Cell identity, comparable across steps and replicates.
    #[must_use]
    pub fn cell(&self) -> (u64, u64) {
        (self.x.to_bits(), self.y.to_bits())
    }
}

/// A loaded scenario result.
#[derive(Debug, Clone)]
pub struct ScenarioResult {
    /// Source file.
    pub path: PathBuf,
    /// Rows in file order.
    pub rows: Vec<ResultRow>,
}

struct Columns {
    replicate: Option<usize>,
    step: usize,
    x: usize,
    y: usize,
    alive: usize,
    cover: usize,
    covariate: usize,
    severity: Option<usize>,
}

impl Columns {
    fn locate(headers: &csv::StringRecord, schema: &ResultSchema) -> Result<Self, ScoringError> {
        let find = |name: &str| headers.iter().position(|h| h.trim() == name);
        let require = |name: &str| {
            find(name).ok_or_else(|| ScoringError::MissingColumn {
                column: name.to_string(),
            })
        };
        Ok(Self {
            replicate: find(&schema.replicate),
            step: require(&schema.step)?,
            x: require(&schema.x)?,
            y: require(&schema.y)?,
            alive: require(&schema.alive)?,
            cover: require(&schema.cover)?,
            covariate: require(&schema.covariate)?,
            severity: find(&schema.severity),
        })
    }
}

impl ScenarioResult {
    /// Loads a result file using `schema` for column names.
    pub fn load(path: impl AsRef<Path>, schema: &ResultSchema) -> Result<Self, ScoringError> {
        let path = path.as_ref();
        if !path.is_file() {
            return Err(ScoringError::MissingResult {
                path: path.to_path_buf(),
            });
        }
        let mut table = csv::ReaderBuilder::new().has_headers(true).from_path(path)?;
        let columns = Columns::locate(table.headers()?, schema)?;

        let mut rows = Vec::new();
        for record in table.records() {
            let record = record?;
            let line = record.position().map_or(0, csv::Position::line);
            let number = |idx: usize, name: &str| -> Result<f64, ScoringError> {
                let raw = record.get(idx).unwrap_or("").trim();
                raw.parse::<f64>().map_err(|_| ScoringError::Malformed {
                    line,
                    reason: format!("column '{name}' holds '{raw}'"),
                })
            };
            let replicate = match columns.replicate {
                Some(idx) => {
                    let raw = record.get(idx).unwrap_or("").trim();
                    raw.parse::<u32>().map_err(|_| ScoringError::Malformed {
                        line,
                        reason: format!("column '{}' holds '{raw}'", schema.replicate),
                    })?
                }
                None => 0,
            };
            let raw_step = number(columns.step, &schema.step)?;
            if raw_step.fract() != 0.0 {
                return Err(ScoringError::Malformed {
                    line,
                    reason: format!("step '{raw_step}' is not an integer"),
                });
            }
            #[allow(clippy::cast_possible_truncation)]
            let step = raw_step as i64;
            let severity = match columns.severity {
                Some(idx) if !record.get(idx).unwrap_or("").trim().is_empty() => {
                    Some(number(idx, &schema.severity)?)
                }
                _ => None,
            };
            rows.push(ResultRow {
                replicate,
                step,
                x: number(columns.x, &schema.x)?,
                y: number(columns.y, &schema.y)?,
                alive: number(columns.alive, &schema.alive)?,
                cover: number(columns.cover, &schema.cover)?,
                covariate: number(columns.covariate, &schema.covariate)?,
                severity,
            });
        }
        if rows.is_empty() {
            return Err(ScoringError::EmptyResult {
                path: path.to_path_buf(),
            });
        }
        Ok(Self {
            path: path.to_path_buf(),
            rows,
        })
    }

    /// Distinct steps in ascending order.
    #[must_use]
    pub fn steps(&self) -> Vec<i64> {
        let mut steps: Vec<i64> = self.rows.iter().map(|row| row.step).collect();
        steps.sort_unstable();
        steps.dedup();
        steps
    }
}
