//! Configuration artifacts: line-oriented `key = value [unit]` listings.
//!
//! The external engine resolves repeated keys by taking the last occurrence, and
//! so does [`ConfigArtifact::effective`]. Merging relies on that: overrides are
//! appended after the base lines.

use std::{fmt, fs, io, path::Path};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// A parameter value with its optional unit annotation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParamValue {
    /// Raw value text, e.g. `5` or `0.35`.
    pub value: String,
    /// Unit annotation, e.g. `percent`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
}

impl ParamValue {
    /// Creates a value; an empty unit is treated as absent.
    #[must_use]
    pub fn new(value: impl Into<String>, unit: Option<&str>) -> Self {
        Self {
            value: value.into(),
            unit: unit
                .map(str::trim)
                .filter(|unit| !unit.is_empty())
                .map(ToOwned::to_owned),
        }
    }

    /// Numeric interpretation of the value, if it is a finite number.
    #[must_use]
    pub fn numeric(&self) -> Option<f64> {
        self.value
            .trim()
            .parse::<f64>()
            .ok()
            .filter(|value| value.is_finite())
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.unit {
            Some(unit) => write!(f, "{} {unit}", self.value),
            None => f.write_str(&self.value),
        }
    }
}

/// One resolved data line of an artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigEntry {
    /// Parameter name.
    pub key: String,
    /// Value and unit.
    pub value: ParamValue,
}

/// Immutable line listing handed to the external engine.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigArtifact {
    lines: Vec<String>,
}

impl ConfigArtifact {
    /// Creates an empty artifact.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Splits text into lines, keeping every line verbatim.
    #[must_use]
    pub fn parse(text: &str) -> Self {
        Self {
            lines: text.lines().map(ToOwned::to_owned).collect(),
        }
    }

    /// Reads an artifact from disk.
    pub fn load(path: impl AsRef<Path>) -> io::Result<Self> {
        Ok(Self::parse(&fs::read_to_string(path)?))
    }

    /// Appends a `# ...` comment line.
    pub fn push_comment(&mut self, text: &str) {
        if text.is_empty() {
            self.lines.push("#".into());
        } else {
            self.lines.push(format!("# {text}"));
        }
    }

    /// Appends a `name = value [unit]` line.
    pub fn push_entry(&mut self, name: &str, value: &ParamValue) {
        self.lines.push(format!("{name} = {value}"));
    }

    /// Every line, comments included.
    #[must_use]
    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    /// Data lines in file order, repeated keys included.
    #[must_use]
    pub fn entries(&self) -> Vec<ConfigEntry> {
        self.lines
            .iter()
            .filter_map(|line| parse_entry(line))
            .collect()
    }

    /// Effective key -> value resolution; the last occurrence of a key wins.
    #[must_use]
    pub fn effective(&self) -> IndexMap<String, ParamValue> {
        let mut resolved = IndexMap::new();
        for entry in self.entries() {
            resolved.insert(entry.key, entry.value);
        }
        resolved
    }

    /// Effective value of one key.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<ParamValue> {
        self.entries()
            .into_iter()
            .rev()
            .find(|entry| entry.key == key)
            .map(|entry| entry.value)
    }

    /// Concatenates the base lines verbatim, a separator comment, then every
    /// non-comment line of `overrides`, so override values take precedence.
    #[must_use]
    pub fn merge(base: &Self, overrides: &Self, label: &str) -> Self {
        let mut lines = base.lines.clone();
        lines.push(format!("# --- overrides: {label} ---"));
        lines.extend(
            overrides
                .lines
                .iter()
                .filter(|line| !is_comment(line))
                .cloned(),
        );
        Self { lines }
    }

    /// Renders the artifact with a trailing newline.
    #[must_use]
    pub fn render(&self) -> String {
        let mut out = self.lines.join("\n");
        out.push('\n');
        out
    }
}

fn is_comment(line: &str) -> bool {
    line.trim_start().starts_with('#')
}

/// Parses `key = value [unit]`, ignoring anything after an inline `#`.
fn parse_entry(line: &str) -> Option<ConfigEntry> {
    let content = line.split('#').next().unwrap_or_default().trim();
    let (key, rest) = content.split_once('=')?;
    let key = key.trim();
    if key.is_empty() {
        return None;
    }
    let rest = rest.trim();
    let (value, unit) = match rest.split_once(char::is_whitespace) {
        Some((value, unit)) => (value, Some(unit)),
        None => (rest, None),
    };
    if value.is_empty() {
        return None;
    }
    Some(ConfigEntry {
        key: key.to_string(),
        value: ParamValue::new(value, unit),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: &str = "# base parameters\n\
                        totalSteps = 50 count\n\
                        growthRate = 1 percent\n\
                        treeSuppression = 0.4 # fraction\n";

    #[test]
    fn resolves_value_and_unit() {
        let artifact = ConfigArtifact::parse(BASE);
        let growth = artifact.get("growthRate").unwrap();
        assert_eq!(growth.value, "1");
        assert_eq!(growth.unit.as_deref(), Some("percent"));
        let suppression = artifact.get("treeSuppression").unwrap();
        assert_eq!(suppression.unit, None);
        assert_eq!(suppression.numeric(), Some(0.4));
        assert_eq!(artifact.entries().len(), 3);
    }

    #[test]
    fn later_occurrence_overrides_earlier() {
        let artifact = ConfigArtifact::parse("a = 1 count\nb = 2\na = 3 count\n");
        let effective = artifact.effective();
        assert_eq!(effective.len(), 2);
        assert_eq!(effective["a"].value, "3");
    }

    #[test]
    fn merge_with_empty_overrides_is_equivalent_to_base() {
        let base = ConfigArtifact::parse(BASE);
        let merged = ConfigArtifact::merge(&base, &ConfigArtifact::new(), "empty");
        assert_eq!(merged.effective(), base.effective());
        assert!(merged.lines().starts_with(base.lines()));
    }

    #[test]
    fn merge_prefers_override_values_and_drops_override_comments() {
        let base = ConfigArtifact::parse(BASE);
        let overrides = ConfigArtifact::parse("# Path: growth/high\ngrowthRate = 10 percent\n");
        let merged = ConfigArtifact::merge(&base, &overrides, "growth/high");
        assert_eq!(merged.get("growthRate").unwrap().value, "10");
        assert_eq!(merged.get("totalSteps").unwrap().value, "50");
        assert!(!merged.lines().iter().any(|line| line.contains("Path:")));
    }

    #[test]
    fn push_entry_renders_unit_only_when_present() {
        let mut artifact = ConfigArtifact::new();
        artifact.push_entry("growthRate", &ParamValue::new("5", Some("percent")));
        artifact.push_entry("hasFire", &ParamValue::new("1", Some("")));
        assert_eq!(artifact.render(), "growthRate = 5 percent\nhasFire = 1\n");
    }
}
