//! Built-in management scenarios compared by the post-fire workflow.

use indexmap::IndexMap;

use crate::{
    definition::{Combination, SweepDefinition},
    error::ConfigError,
    keys::SweepKey,
    params::ParamValue,
};

/// One management scenario: fire on/off plus intervention intensities.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ManagementScenario {
    /// Key used as the combination path.
    pub name: &'static str,
    /// Human-readable label.
    pub label: &'static str,
    /// Whether the fire disturbance is applied.
    pub has_fire: bool,
    /// Extra seedlings planted per patch.
    pub seeding_boost: u32,
    /// Invasive removal effort in percent per year.
    pub removal_effort: u32,
}

/// Counterfactual, fire only, and the three intervention variants.
pub const PRESETS: [ManagementScenario; 5] = [
    ManagementScenario {
        name: "baseline",
        label: "Baseline (no fire)",
        has_fire: false,
        seeding_boost: 0,
        removal_effort: 0,
    },
    ManagementScenario {
        name: "fire_only",
        label: "Fire only",
        has_fire: true,
        seeding_boost: 0,
        removal_effort: 0,
    },
    ManagementScenario {
        name: "fire_seeding",
        label: "Fire + seeding",
        has_fire: true,
        seeding_boost: 8,
        removal_effort: 0,
    },
    ManagementScenario {
        name: "fire_removal",
        label: "Fire + removal",
        has_fire: true,
        seeding_boost: 0,
        removal_effort: 12,
    },
    ManagementScenario {
        name: "fire_both",
        label: "Fire + seeding + removal",
        has_fire: true,
        seeding_boost: 8,
        removal_effort: 12,
    },
];

impl ManagementScenario {
    /// Parameters this scenario overrides.
    #[must_use]
    pub fn params(&self) -> IndexMap<String, ParamValue> {
        let mut params = IndexMap::new();
        params.insert(
            "hasFire".into(),
            ParamValue::new(if self.has_fire { "1" } else { "0" }, None),
        );
        params.insert(
            "seedingBoost".into(),
            ParamValue::new(self.seeding_boost.to_string(), Some("count")),
        );
        params.insert(
            "removalEffort".into(),
            ParamValue::new(self.removal_effort.to_string(), Some("percent")),
        );
        params
    }

    fn combination(&self, line: u64) -> Option<Combination> {
        let key = SweepKey::parse(self.name).ok()?;
        Some(Combination {
            key,
            line,
            params: self.params(),
        })
    }
}

/// Looks up a preset by name.
#[must_use]
pub fn find(name: &str) -> Option<&'static ManagementScenario> {
    PRESETS.iter().find(|scenario| scenario.name == name)
}

/// The presets as a sweep definition, one row per scenario.
#[must_use]
pub fn preset_definition() -> SweepDefinition {
    let combinations = PRESETS
        .iter()
        .zip(2_u64..)
        .filter_map(|(scenario, line)| scenario.combination(line))
        .collect();
    SweepDefinition::from_combinations(combinations)
}

/// The named presets as a sweep definition, in the order given. An empty
/// selection means every preset.
pub fn selected_definition(names: &[String]) -> Result<SweepDefinition, ConfigError> {
    if names.is_empty() {
        return Ok(preset_definition());
    }
    let mut combinations = Vec::with_capacity(names.len());
    for (name, line) in names.iter().zip(2_u64..) {
        let scenario = find(name).ok_or_else(|| ConfigError::UnknownScenario {
            name: name.clone(),
        })?;
        if let Some(combination) = scenario.combination(line) {
            combinations.push(combination);
        }
    }
    Ok(SweepDefinition::from_combinations(combinations))
}
