//! Tabular parameter-combination definitions (`sweep_definitions.csv`).
//!
//! Header row: a mandatory `path` column, then parameter columns `name` with
//! optional companions `name_unit`. Each data row is one combination.

use std::{
    collections::HashMap,
    fs::File,
    io::Read,
    path::{Path, PathBuf},
};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::{
    error::ConfigError,
    keys::SweepKey,
    params::{ConfigArtifact, ParamValue},
};

const PATH_COLUMN: &str = "path";
const UNIT_SUFFIX: &str = "_unit";

/// How repeated `path` values are handled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DuplicatePolicy {
    /// Keep the first declaration, reject later rows.
    #[default]
    Reject,
    /// Later rows replace earlier ones (logged).
    LastWins,
}

/// How parameter values are validated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ValuePolicy {
    /// Values must parse as finite numbers.
    #[default]
    Numeric,
    /// Values are passed through untouched, as long as the artifact format
    /// can carry them.
    Literal,
}

/// Options applied while reading a definition.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DefinitionOptions {
    /// Duplicate-path policy.
    #[serde(default)]
    pub duplicate_paths: DuplicatePolicy,
    /// Value validation policy.
    #[serde(default)]
    pub values: ValuePolicy,
}

/// One accepted row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Combination {
    /// Structured key built from the `path` column.
    pub key: SweepKey,
    /// Line of the row in the definition file.
    pub line: u64,
    /// Non-empty parameters in header order.
    pub params: IndexMap<String, ParamValue>,
}

impl Combination {
    /// Materializes the combination as an artifact: a comment header followed by
    /// one data line per parameter.
    #[must_use]
    pub fn to_artifact(&self, generated_at: chrono::DateTime<chrono::Utc>) -> ConfigArtifact {
        let mut artifact = ConfigArtifact::new();
        artifact.push_comment("Parameter sweep combination (generated)");
        artifact.push_comment(&format!("Path: {}", self.key));
        artifact.push_comment(&format!("Generated: {}", generated_at.to_rfc3339()));
        artifact.push_comment("");
        artifact.push_comment(
            "Swept parameters only; merged over the base configuration at run time.",
        );
        for (name, value) in &self.params {
            artifact.push_entry(name, value);
        }
        artifact
    }
}

/// A row refused while reading the definition.
#[derive(Debug)]
pub struct RejectedRow {
    /// Line of the row in the definition file.
    pub line: u64,
    /// Raw `path` cell, when present.
    pub path: Option<String>,
    /// Why it was refused.
    pub error: ConfigError,
}

/// Parsed definition: accepted combinations plus rejected rows.
#[derive(Debug)]
pub struct SweepDefinition {
    /// Definition file, if read from disk.
    pub source: Option<PathBuf>,
    /// Parameter columns in header order.
    pub columns: Vec<String>,
    /// Accepted combinations.
    pub combinations: Vec<Combination>,
    /// Rejected rows.
    pub rejected: Vec<RejectedRow>,
    /// Every syntactically valid key declared by any row, rejected rows included.
    pub declared: Vec<SweepKey>,
}

impl SweepDefinition {
    /// Loads a definition file.
    pub fn load(path: impl AsRef<Path>, options: DefinitionOptions) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let file = File::open(path)?;
        let mut definition = Self::read(file, path, options)?;
        definition.source = Some(path.to_path_buf());
        Ok(definition)
    }

    /// Reads a definition from any reader.
    pub fn from_reader<R: Read>(
        reader: R,
        options: DefinitionOptions,
    ) -> Result<Self, ConfigError> {
        Self::read(reader, Path::new("<reader>"), options)
    }

    /// Builds a definition directly from combinations (used by scenario presets).
    #[must_use]
    pub fn from_combinations(combinations: Vec<Combination>) -> Self {
        let mut columns: Vec<String> = Vec::new();
        for combination in &combinations {
            for name in combination.params.keys() {
                if !columns.contains(name) {
                    columns.push(name.clone());
                }
            }
        }
        let declared = combinations.iter().map(|c| c.key.clone()).collect();
        Self {
            source: None,
            columns,
            combinations,
            rejected: Vec::new(),
            declared,
        }
    }

    fn read<R: Read>(
        reader: R,
        source_path: &Path,
        options: DefinitionOptions,
    ) -> Result<Self, ConfigError> {
        let mut table = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .from_reader(reader);
        let headers: Vec<String> = table
            .headers()?
            .iter()
            .map(|header| header.trim().to_string())
            .collect();
        let path_idx = headers
            .iter()
            .position(|header| header == PATH_COLUMN)
            .ok_or_else(|| ConfigError::MissingPathColumn {
                source_path: source_path.to_path_buf(),
            })?;
        let layout = ColumnLayout::from_headers(&headers, path_idx);

        let mut combinations: Vec<Combination> = Vec::new();
        let mut rejected = Vec::new();
        let mut declared: Vec<SweepKey> = Vec::new();
        let mut first_lines: HashMap<SweepKey, u64> = HashMap::new();

        for (idx, record) in table.records().enumerate() {
            let fallback_line = idx as u64 + 2;
            let record = match record {
                Ok(record) => record,
                Err(err) => {
                    let line = err
                        .position()
                        .map_or(fallback_line, csv::Position::line);
                    rejected.push(RejectedRow {
                        line,
                        path: None,
                        error: err.into(),
                    });
                    continue;
                }
            };
            let line = record.position().map_or(fallback_line, csv::Position::line);
            let raw_path = record.get(path_idx).unwrap_or_default().to_string();
            let reject = |error| RejectedRow {
                line,
                path: Some(raw_path.clone()),
                error,
            };

            let key = match SweepKey::parse(&raw_path) {
                Ok(key) => key,
                Err(error) => {
                    rejected.push(reject(error));
                    continue;
                }
            };
            if !declared.contains(&key) {
                declared.push(key.clone());
            }

            let params = match layout.params(&record, options.values) {
                Ok(params) => params,
                Err(error) => {
                    rejected.push(reject(error));
                    continue;
                }
            };

            if let Some(first_line) = first_lines.get(&key).copied() {
                match options.duplicate_paths {
                    DuplicatePolicy::Reject => {
                        rejected.push(reject(ConfigError::DuplicatePath {
                            path: key.to_string(),
                            first_line,
                        }));
                        continue;
                    }
                    DuplicatePolicy::LastWins => {
                        tracing::warn!(
                            path = %key,
                            line,
                            first_line,
                            "duplicate path; later row replaces earlier one"
                        );
                        if let Some(existing) = combinations.iter_mut().find(|c| c.key == key) {
                            *existing = Combination { key, line, params };
                        }
                        continue;
                    }
                }
            }
            first_lines.insert(key.clone(), line);
            combinations.push(Combination { key, line, params });
        }

        Ok(Self {
            source: None,
            columns: layout.names(),
            combinations,
            rejected,
            declared,
        })
    }

    /// Writes the definition back out as CSV (`path`, then `name`/`name_unit` pairs).
    /// A unit column is only emitted for parameters that carry a unit somewhere.
    pub fn write_csv(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let with_unit: Vec<bool> = self
            .columns
            .iter()
            .map(|name| {
                self.combinations.iter().any(|combination| {
                    combination
                        .params
                        .get(name)
                        .is_some_and(|value| value.unit.is_some())
                })
            })
            .collect();

        let mut writer = csv::Writer::from_path(path)?;
        let mut header = vec![PATH_COLUMN.to_string()];
        for (name, unit) in self.columns.iter().zip(&with_unit) {
            header.push(name.clone());
            if *unit {
                header.push(format!("{name}{UNIT_SUFFIX}"));
            }
        }
        writer.write_record(&header)?;

        for combination in &self.combinations {
            let mut row = vec![combination.key.to_string()];
            for (name, unit) in self.columns.iter().zip(&with_unit) {
                let value = combination.params.get(name);
                row.push(value.map(|v| v.value.clone()).unwrap_or_default());
                if *unit {
                    row.push(value.and_then(|v| v.unit.clone()).unwrap_or_default());
                }
            }
            writer.write_record(&row)?;
        }
        writer.flush()?;
        Ok(())
    }
}

/// Parameter column -> (value index, unit index).
struct ColumnLayout {
    params: Vec<(String, usize, Option<usize>)>,
}

impl ColumnLayout {
    fn from_headers(headers: &[String], path_idx: usize) -> Self {
        let params = headers
            .iter()
            .enumerate()
            .filter(|(idx, name)| {
                *idx != path_idx && !name.ends_with(UNIT_SUFFIX) && !name.is_empty()
            })
            .map(|(idx, name)| {
                let unit_name = format!("{name}{UNIT_SUFFIX}");
                let unit_idx = headers.iter().position(|header| *header == unit_name);
                (name.clone(), idx, unit_idx)
            })
            .collect::<Vec<_>>();
        for header in headers.iter().filter(|h| h.ends_with(UNIT_SUFFIX)) {
            let base = header.trim_end_matches(UNIT_SUFFIX);
            if !params.iter().any(|(name, _, _)| name == base) {
                tracing::warn!(column = %header, "unit column has no matching parameter column");
            }
        }
        Self { params }
    }

    fn names(&self) -> Vec<String> {
        self.params.iter().map(|(name, _, _)| name.clone()).collect()
    }

    fn params(
        &self,
        record: &csv::StringRecord,
        policy: ValuePolicy,
    ) -> Result<IndexMap<String, ParamValue>, ConfigError> {
        let mut params = IndexMap::new();
        for (name, value_idx, unit_idx) in &self.params {
            let value = record.get(*value_idx).unwrap_or_default();
            if value.trim().is_empty() {
                continue;
            }
            let unit = unit_idx.and_then(|idx| record.get(idx));
            let trimmed = value.trim();
            if trimmed.contains(|c: char| c == '#' || c.is_whitespace())
                || unit.is_some_and(|unit| unit.contains('#'))
            {
                return Err(ConfigError::UnrepresentableValue {
                    column: name.clone(),
                    value: value.to_string(),
                });
            }
            let param = ParamValue::new(value, unit);
            if policy == ValuePolicy::Numeric && param.numeric().is_none() {
                return Err(ConfigError::MalformedValue {
                    column: name.clone(),
                    value: value.to_string(),
                });
            }
            params.insert(name.clone(), param);
        }
        Ok(params)
    }
}
