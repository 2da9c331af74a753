//! Summary metrics, composite scores and ranking of scenario results.

use std::{
    cmp::Ordering,
    collections::{BTreeMap, BTreeSet, HashMap},
    fmt,
    path::{Path, PathBuf},
};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use shared_logging::LogLevel;

use crate::{
    error::{ConfigError, ScoringError},
    keys::{ArtifactStore, SweepKey},
    results::{ResultRow, ResultSchema, ScenarioResult},
    runner::result_path,
    telemetry::SweepTelemetry,
};

/// Steps over which metrics are computed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "kebab-case")]
pub enum EvaluationWindow {
    /// The last `steps` distinct steps of the series.
    Trailing {
        /// Number of steps kept.
        steps: u32,
    },
    /// Every step in `from..=to`.
    Range {
        /// First step (inclusive).
        from: i64,
        /// Last step (inclusive).
        to: i64,
    },
}

impl Default for EvaluationWindow {
    fn default() -> Self {
        Self::Trailing { steps: 10 }
    }
}

impl fmt::Display for EvaluationWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Trailing { steps } => write!(f, "last {steps} steps"),
            Self::Range { from, to } => write!(f, "steps {from}..={to}"),
        }
    }
}

impl EvaluationWindow {
    /// Selects the window steps among the distinct `steps` (ascending).
    #[must_use]
    pub fn select(&self, steps: &[i64]) -> Vec<i64> {
        match *self {
            Self::Trailing { steps: count } => {
                let keep = usize::try_from(count).unwrap_or(usize::MAX).min(steps.len());
                steps[steps.len() - keep..].to_vec()
            }
            Self::Range { from, to } => steps
                .iter()
                .copied()
                .filter(|step| (from..=to).contains(step))
                .collect(),
        }
    }

    fn validate(&self) -> Result<()> {
        match *self {
            Self::Trailing { steps: 0 } => bail!("trailing window must keep at least one step"),
            Self::Range { from, to } if from > to => {
                bail!("window range {from}..={to} is empty")
            }
            _ => Ok(()),
        }
    }
}

/// How cells are split into low and high covariate strata.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "kebab-case")]
pub enum StratumSplit {
    /// Lowest and highest `fraction` of distinct cells ranked by covariate.
    Quantile {
        /// Share of cells in each stratum, in `(0, 0.5]`.
        fraction: f64,
    },
    /// Cells at or below `low_max` and at or above `high_min`.
    Threshold {
        /// Upper bound of the low stratum (inclusive).
        low_max: f64,
        /// Lower bound of the high stratum (inclusive).
        high_min: f64,
    },
}

impl Default for StratumSplit {
    fn default() -> Self {
        Self::Quantile { fraction: 1.0 / 3.0 }
    }
}

impl StratumSplit {
    fn validate(&self) -> Result<()> {
        match *self {
            Self::Quantile { fraction } if fraction <= 0.0 || fraction > 0.5 => {
                bail!("stratum fraction {fraction} must lie in (0, 0.5]")
            }
            Self::Threshold { low_max, high_min } if low_max > high_min => {
                bail!("low stratum bound {low_max} exceeds high stratum bound {high_min}")
            }
            _ => Ok(()),
        }
    }
}

/// Inclusive numeric range.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BandRange {
    /// Lower bound.
    pub min: f64,
    /// Upper bound.
    pub max: f64,
}

impl BandRange {
    /// Creates a range.
    #[must_use]
    pub const fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }

    /// Inclusive containment.
    #[must_use]
    pub fn contains(&self, value: f64) -> bool {
        value >= self.min && value <= self.max
    }

    /// Whether `other` lies entirely inside this range.
    #[must_use]
    pub fn encloses(&self, other: &Self) -> bool {
        self.min <= other.min && other.max <= self.max
    }

    /// Midpoint.
    #[must_use]
    pub fn midpoint(&self) -> f64 {
        (self.min + self.max) / 2.0
    }

    /// Width.
    #[must_use]
    pub fn width(&self) -> f64 {
        self.max - self.min
    }
}

const fn default_full_points() -> u32 {
    25
}

const fn default_partial_points() -> u32 {
    12
}

/// Points awarded for one metric.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TargetBand {
    /// Full points inside this range.
    pub target: BandRange,
    /// Partial points inside this range.
    pub loose: BandRange,
    /// Points inside the target range.
    #[serde(default = "default_full_points")]
    pub full_points: u32,
    /// Points inside the loose range only.
    #[serde(default = "default_partial_points")]
    pub partial_points: u32,
}

impl TargetBand {
    /// Band with default points.
    #[must_use]
    pub const fn new(target: BandRange, loose: BandRange) -> Self {
        Self {
            target,
            loose,
            full_points: default_full_points(),
            partial_points: default_partial_points(),
        }
    }

    /// Points for `value`; boundaries belong to the range they close.
    #[must_use]
    pub fn award(&self, value: f64) -> u32 {
        if self.target.contains(value) {
            self.full_points
        } else if self.loose.contains(value) {
            self.partial_points
        } else {
            0
        }
    }

    /// Distance from the target midpoint in units of target width.
    #[must_use]
    pub fn distance(&self, value: f64) -> f64 {
        if !value.is_finite() {
            return f64::INFINITY;
        }
        let offset = (value - self.target.midpoint()).abs();
        let width = self.target.width();
        if width > 0.0 {
            offset / width
        } else {
            offset
        }
    }

    fn validate(&self, name: &str) -> Result<()> {
        for (label, range) in [("target", &self.target), ("loose", &self.loose)] {
            if range.min > range.max {
                bail!("{name} {label} range [{}, {}] is inverted", range.min, range.max);
            }
        }
        if !self.loose.encloses(&self.target) {
            bail!("{name} loose range must contain its target range");
        }
        if self.partial_points > self.full_points {
            bail!("{name} partial points exceed full points");
        }
        Ok(())
    }
}

/// The four named bands of the composite score.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoreBands {
    /// Coefficient of variation of total population (lower is better).
    pub stability: TargetBand,
    /// Mean per-cell population at the final window step.
    pub density: TargetBand,
    /// High-stratum over low-stratum population.
    pub ratio: TargetBand,
    /// Mean cover fraction in the low stratum.
    pub cover: TargetBand,
}

impl Default for ScoreBands {
    fn default() -> Self {
        Self {
            stability: TargetBand::new(BandRange::new(0.0, 0.10), BandRange::new(0.0, 0.20)),
            density: TargetBand::new(BandRange::new(3.0, 7.0), BandRange::new(2.0, 9.0)),
            ratio: TargetBand::new(BandRange::new(1.2, 2.0), BandRange::new(1.0, 3.0)),
            cover: TargetBand::new(BandRange::new(0.2, 0.5), BandRange::new(0.1, 0.7)),
        }
    }
}

/// Every tunable of the scorer in one place.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringSettings {
    /// Evaluation window.
    pub window: EvaluationWindow,
    /// Stratum split.
    pub strata: StratumSplit,
    /// Score bands.
    pub bands: ScoreBands,
}

impl ScoringSettings {
    /// Rejects empty windows, inverted ranges and loose ranges that do not
    /// contain their target.
    pub fn validate(&self) -> Result<()> {
        self.window.validate()?;
        self.strata.validate()?;
        self.bands.stability.validate("stability")?;
        self.bands.density.validate("density")?;
        self.bands.ratio.validate("ratio")?;
        self.bands.cover.validate("cover")?;
        Ok(())
    }
}

/// Summary metrics of one scenario result.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Metrics {
    /// Coefficient of variation of the per-step total population.
    pub stability_cv: f64,
    /// Mean per-cell population at the final window step.
    pub equilibrium_density: f64,
    /// High-stratum over low-stratum mean population.
    pub stratified_ratio: f64,
    /// Mean cover fraction within the low stratum.
    pub stratified_cover: f64,
    /// First window step.
    pub window_start: i64,
    /// Last window step.
    pub window_end: i64,
    /// Rows inside the window.
    pub rows: usize,
}

/// Points per band and the tie-break distance.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ScoreBreakdown {
    /// Stability points.
    pub stability: u32,
    /// Density points.
    pub density: u32,
    /// Ratio points.
    pub ratio: u32,
    /// Cover points.
    pub cover: u32,
    /// Total in `[0, 100]`.
    pub total: u32,
    /// Summed distance from band midpoints; lower is closer.
    pub closeness: f64,
}

/// A configuration that made it into the ranking.
#[derive(Debug, Clone, Serialize)]
pub struct ScoredConfiguration {
    /// Combination key.
    pub key: SweepKey,
    /// Scored result file.
    pub result: PathBuf,
    /// Configuration artifact the result was produced from.
    pub artifact: Option<PathBuf>,
    /// Metrics.
    pub metrics: Metrics,
    /// Score.
    pub score: ScoreBreakdown,
}

/// A configuration left out of the ranking, with the reason.
#[derive(Debug)]
pub struct Exclusion {
    /// Combination key.
    pub key: SweepKey,
    /// Expected result file.
    pub result: PathBuf,
    /// Why it was excluded.
    pub error: ScoringError,
}

/// A result to score and the artifact it traces back to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScoringInput {
    /// Combination key.
    pub key: SweepKey,
    /// Result file.
    pub result: PathBuf,
    /// Configuration artifact, when the store can locate it.
    pub artifact: Option<PathBuf>,
}

impl ScoringInput {
    /// One input per stored combination, pointing at its relocated result.
    pub fn discover(
        store: &dyn ArtifactStore,
        results_dir: &Path,
    ) -> Result<Vec<Self>, ConfigError> {
        Ok(store
            .keys()?
            .into_iter()
            .map(|key| Self {
                result: result_path(results_dir, &key),
                artifact: store.locate(&key),
                key,
            })
            .collect())
    }
}

/// Ranked configurations and exclusions.
#[derive(Debug, Default)]
pub struct ScoringReport {
    /// Configurations, best first.
    pub ranked: Vec<ScoredConfiguration>,
    /// Configurations left out, in input order.
    pub excluded: Vec<Exclusion>,
}

impl ScoringReport {
    /// The best `n` configurations.
    #[must_use]
    pub fn top(&self, n: usize) -> &[ScoredConfiguration] {
        &self.ranked[..n.min(self.ranked.len())]
    }

    /// JSON rendering of the whole report.
    #[must_use]
    pub fn to_json(&self) -> Value {
        json!({
            "ranked": self.ranked,
            "excluded": self
                .excluded
                .iter()
                .map(|ex| json!({
                    "key": ex.key.to_string(),
                    "result": ex.result,
                    "reason": ex.error.to_string(),
                }))
                .collect::<Vec<_>>(),
        })
    }

    /// Writes [`Self::to_json`] to `path`.
    pub fn write_json(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("failed to create {}", parent.display()))?;
            }
        }
        let body = serde_json::to_string_pretty(&self.to_json())?;
        std::fs::write(path, body).with_context(|| format!("failed to write {}", path.display()))
    }
}

/// Cells of one covariate stratum, keyed by [`ResultRow::cell`].
type CellSet = BTreeSet<(u64, u64)>;

/// Computes metrics and ranks configurations.
pub struct Scorer {
    settings: ScoringSettings,
    schema: ResultSchema,
    telemetry: Option<SweepTelemetry>,
}

impl Scorer {
    /// Creates a scorer.
    #[must_use]
    pub fn new(settings: ScoringSettings, schema: ResultSchema) -> Self {
        Self {
            settings,
            schema,
            telemetry: None,
        }
    }

    /// Attaches telemetry.
    #[must_use]
    pub fn with_telemetry(mut self, telemetry: SweepTelemetry) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    /// Active settings.
    #[must_use]
    pub fn settings(&self) -> &ScoringSettings {
        &self.settings
    }

    /// Computes metrics over the evaluation window only.
    pub fn compute_metrics(&self, result: &ScenarioResult) -> Result<Metrics, ScoringError> {
        let window = self.settings.window.select(&result.steps());
        let (Some(&window_start), Some(&window_end)) = (window.first(), window.last()) else {
            return Err(ScoringError::NoRowsInWindow {
                window: self.settings.window.to_string(),
            });
        };
        let rows: Vec<&ResultRow> = result
            .rows
            .iter()
            .filter(|row| window.binary_search(&row.step).is_ok())
            .collect();

        let totals = step_totals(&rows);
        let stability_cv = coefficient_of_variation(&totals);

        let final_rows: Vec<f64> = rows
            .iter()
            .filter(|row| row.step == window_end)
            .map(|row| row.alive)
            .collect();
        let equilibrium_density = mean(&final_rows);

        let (low, high) = self.strata(&rows)?;
        let population = |cells: &CellSet| {
            let values: Vec<f64> = rows
                .iter()
                .filter(|row| cells.contains(&row.cell()))
                .map(|row| row.alive)
                .collect();
            mean(&values)
        };
        let low_population = population(&low);
        let high_population = population(&high);
        let stratified_ratio = if low_population == 0.0 {
            if high_population == 0.0 {
                1.0
            } else {
                f64::INFINITY
            }
        } else {
            high_population / low_population
        };
        let low_cover: Vec<f64> = rows
            .iter()
            .filter(|row| low.contains(&row.cell()))
            .map(|row| row.cover)
            .collect();

        Ok(Metrics {
            stability_cv,
            equilibrium_density,
            stratified_ratio,
            stratified_cover: mean(&low_cover),
            window_start,
            window_end,
            rows: rows.len(),
        })
    }

    /// Awards band points and computes the tie-break distance.
    #[must_use]
    pub fn score_metrics(&self, metrics: &Metrics) -> ScoreBreakdown {
        let bands = &self.settings.bands;
        let pairs = [
            (&bands.stability, metrics.stability_cv),
            (&bands.density, metrics.equilibrium_density),
            (&bands.ratio, metrics.stratified_ratio),
            (&bands.cover, metrics.stratified_cover),
        ];
        let points: Vec<u32> = pairs.iter().map(|(band, value)| band.award(*value)).collect();
        let closeness = pairs.iter().map(|(band, value)| band.distance(*value)).sum();
        ScoreBreakdown {
            stability: points[0],
            density: points[1],
            ratio: points[2],
            cover: points[3],
            total: points.iter().sum::<u32>().min(100),
            closeness,
        }
    }

    /// Loads, measures and scores one result.
    pub fn score(&self, input: &ScoringInput) -> Result<ScoredConfiguration, ScoringError> {
        let result = ScenarioResult::load(&input.result, &self.schema)?;
        let metrics = self.compute_metrics(&result)?;
        Ok(ScoredConfiguration {
            key: input.key.clone(),
            result: input.result.clone(),
            artifact: input.artifact.clone(),
            score: self.score_metrics(&metrics),
            metrics,
        })
    }

    /// Scores every input and ranks by total (descending), closeness
    /// (ascending), then key. Unscorable inputs are excluded with a reason.
    pub fn rank(&self, inputs: &[ScoringInput]) -> ScoringReport {
        let mut report = ScoringReport::default();
        for input in inputs {
            match self.score(input) {
                Ok(scored) => {
                    self.log(
                        LogLevel::Debug,
                        "scoring.scored",
                        Some(&scored.key),
                        json!({ "total": scored.score.total, "closeness": scored.score.closeness }),
                    );
                    report.ranked.push(scored);
                }
                Err(error) => {
                    self.log(
                        LogLevel::Warn,
                        "scoring.excluded",
                        Some(&input.key),
                        json!({ "reason": error.to_string() }),
                    );
                    report.excluded.push(Exclusion {
                        key: input.key.clone(),
                        result: input.result.clone(),
                        error,
                    });
                }
            }
        }
        report.ranked.sort_by(compare_ranked);
        self.log(
            LogLevel::Info,
            "scoring.finished",
            None,
            json!({ "ranked": report.ranked.len(), "excluded": report.excluded.len() }),
        );
        report
    }

    /// Low and high strata as cell sets.
    fn strata(&self, rows: &[&ResultRow]) -> Result<(CellSet, CellSet), ScoringError> {
        let mut by_cell: BTreeMap<(u64, u64), f64> = BTreeMap::new();
        for row in rows {
            by_cell.entry(row.cell()).or_insert(row.covariate);
        }
        let (low, high): (CellSet, CellSet) = match self.settings.strata {
            StratumSplit::Quantile { fraction } => {
                let mut cells: Vec<((u64, u64), f64)> = by_cell.into_iter().collect();
                cells.sort_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)));
                #[allow(
                    clippy::cast_possible_truncation,
                    clippy::cast_sign_loss,
                    clippy::cast_precision_loss
                )]
                let share = (cells.len() as f64).mul_add(fraction, 1e-9).floor() as usize;
                let share = share.max(1).min(cells.len());
                let low = cells[..share].iter().map(|(cell, _)| *cell).collect();
                let high = cells[cells.len() - share..].iter().map(|(cell, _)| *cell).collect();
                (low, high)
            }
            StratumSplit::Threshold { low_max, high_min } => {
                let low = by_cell
                    .iter()
                    .filter(|(_, value)| **value <= low_max)
                    .map(|(cell, _)| *cell)
                    .collect();
                let high = by_cell
                    .iter()
                    .filter(|(_, value)| **value >= high_min)
                    .map(|(cell, _)| *cell)
                    .collect();
                (low, high)
            }
        };
        if low.is_empty() {
            return Err(ScoringError::EmptyStratum { stratum: "low" });
        }
        if high.is_empty() {
            return Err(ScoringError::EmptyStratum { stratum: "high" });
        }
        Ok((low, high))
    }

    fn log(&self, level: LogLevel, message: &str, key: Option<&SweepKey>, metadata: Value) {
        if let Some(tel) = &self.telemetry {
            let _ = tel.log(level, message, key, metadata);
        }
    }
}

fn compare_ranked(a: &ScoredConfiguration, b: &ScoredConfiguration) -> Ordering {
    b.score
        .total
        .cmp(&a.score.total)
        .then_with(|| a.score.closeness.total_cmp(&b.score.closeness))
        .then_with(|| a.key.cmp(&b.key))
}

/// Per-step total population, averaged over replicates.
fn step_totals(rows: &[&ResultRow]) -> Vec<f64> {
    let mut sums: BTreeMap<i64, HashMap<u32, f64>> = BTreeMap::new();
    for row in rows {
        *sums
            .entry(row.step)
            .or_default()
            .entry(row.replicate)
            .or_insert(0.0) += row.alive;
    }
    sums.values()
        .map(|per_replicate| per_replicate.values().copied().collect::<Vec<_>>())
        .map(|totals| mean(&totals))
        .collect()
}

#[allow(clippy::cast_precision_loss)]
fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Population standard deviation over mean; infinite when the mean is zero.
#[allow(clippy::cast_precision_loss)]
fn coefficient_of_variation(values: &[f64]) -> f64 {
    let avg = mean(values);
    if avg == 0.0 {
        return f64::INFINITY;
    }
    let variance = values.iter().map(|v| (v - avg).powi(2)).sum::<f64>() / values.len() as f64;
    variance.sqrt() / avg
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn row(step: i64, x: f64, alive: f64, cover: f64, covariate: f64) -> ResultRow {
        ResultRow {
            replicate: 0,
            step,
            x,
            y: 0.0,
            alive,
            cover,
            covariate,
            severity: None,
        }
    }

    fn result(rows: Vec<ResultRow>) -> ScenarioResult {
        ScenarioResult {
            path: PathBuf::from("memory.csv"),
            rows,
        }
    }

    fn metrics(stability_cv: f64) -> Metrics {
        Metrics {
            stability_cv,
            equilibrium_density: 5.0,
            stratified_ratio: 1.5,
            stratified_cover: 0.3,
            window_start: 0,
            window_end: 1,
            rows: 2,
        }
    }

    #[test]
    fn stability_boundary_is_inclusive_on_both_sides() {
        let scorer = Scorer::new(ScoringSettings::default(), ResultSchema::default());
        assert_eq!(scorer.score_metrics(&metrics(0.10)).stability, 25);
        assert_eq!(scorer.score_metrics(&metrics(0.100_001)).stability, 12);
        assert_eq!(scorer.score_metrics(&metrics(0.20)).stability, 12);
        assert_eq!(scorer.score_metrics(&metrics(0.200_001)).stability, 0);
        assert_eq!(scorer.score_metrics(&metrics(0.10)).total, 100);
    }

    #[test]
    fn window_excludes_transient_steps() {
        // Steps 0..=1 are a cold start with wild totals; the window keeps 2..=3.
        let rows = vec![
            row(0, 0.0, 100.0, 0.0, 1.0),
            row(1, 0.0, 0.5, 0.0, 1.0),
            row(2, 0.0, 9.0, 0.0, 1.0),
            row(3, 0.0, 11.0, 0.0, 1.0),
        ];
        let settings = ScoringSettings {
            window: EvaluationWindow::Trailing { steps: 2 },
            ..ScoringSettings::default()
        };
        let scorer = Scorer::new(settings, ResultSchema::default());
        let metrics = scorer.compute_metrics(&result(rows)).unwrap();
        assert!((metrics.stability_cv - 0.1).abs() < 1e-12);
        assert_eq!((metrics.window_start, metrics.window_end), (2, 3));
        assert_eq!(metrics.equilibrium_density, 11.0);
    }

    #[test]
    fn empty_window_is_an_exclusion_reason() {
        let settings = ScoringSettings {
            window: EvaluationWindow::Range { from: 50, to: 60 },
            ..ScoringSettings::default()
        };
        let scorer = Scorer::new(settings, ResultSchema::default());
        let err = scorer
            .compute_metrics(&result(vec![row(1, 0.0, 1.0, 0.0, 1.0)]))
            .unwrap_err();
        assert!(matches!(err, ScoringError::NoRowsInWindow { .. }));
    }

    #[test]
    fn strata_split_by_covariate() {
        // Three cells at low, middle and high elevation.
        let rows = vec![
            row(1, 0.0, 2.0, 0.4, 100.0),
            row(1, 1.0, 3.0, 0.1, 500.0),
            row(1, 2.0, 6.0, 0.0, 900.0),
        ];
        let scorer = Scorer::new(ScoringSettings::default(), ResultSchema::default());
        let metrics = scorer.compute_metrics(&result(rows.clone())).unwrap();
        assert_eq!(metrics.stratified_ratio, 3.0);
        assert_eq!(metrics.stratified_cover, 0.4);

        let thresholds = ScoringSettings {
            strata: StratumSplit::Threshold {
                low_max: 500.0,
                high_min: 900.0,
            },
            ..ScoringSettings::default()
        };
        let metrics = Scorer::new(thresholds, ResultSchema::default())
            .compute_metrics(&result(rows))
            .unwrap();
        assert_eq!(metrics.stratified_ratio, 6.0 / 2.5);
        assert!((metrics.stratified_cover - 0.25).abs() < 1e-12);
    }

    #[test]
    fn zero_populations_follow_ratio_conventions() {
        let scorer = Scorer::new(ScoringSettings::default(), ResultSchema::default());
        let extinct = vec![row(1, 0.0, 0.0, 0.0, 1.0), row(1, 1.0, 0.0, 0.0, 2.0)];
        let metrics = scorer.compute_metrics(&result(extinct)).unwrap();
        assert_eq!(metrics.stratified_ratio, 1.0);
        assert!(metrics.stability_cv.is_infinite());
        assert_eq!(scorer.score_metrics(&metrics).stability, 0);

        let upslope_only = vec![row(1, 0.0, 0.0, 0.0, 1.0), row(1, 1.0, 4.0, 0.0, 2.0)];
        let metrics = scorer.compute_metrics(&result(upslope_only)).unwrap();
        assert!(metrics.stratified_ratio.is_infinite());
    }

    #[test]
    fn replicates_are_averaged_per_step() {
        let mut rows = vec![row(1, 0.0, 8.0, 0.0, 1.0), row(2, 0.0, 12.0, 0.0, 1.0)];
        let mut second = row(1, 0.0, 10.0, 0.0, 1.0);
        second.replicate = 1;
        rows.push(second);
        let mut third = row(2, 0.0, 10.0, 0.0, 1.0);
        third.replicate = 1;
        rows.push(third);
        // Step totals: (8 + 10) / 2 = 9 and (12 + 10) / 2 = 11.
        let scorer = Scorer::new(ScoringSettings::default(), ResultSchema::default());
        let metrics = scorer.compute_metrics(&result(rows)).unwrap();
        assert!((metrics.stability_cv - 0.1).abs() < 1e-12);
    }

    #[test]
    fn ranking_breaks_ties_by_closeness_then_key() {
        let scorer = Scorer::new(ScoringSettings::default(), ResultSchema::default());
        let scored = |key: &str, density: f64| {
            let mut m = metrics(0.05);
            m.equilibrium_density = density;
            ScoredConfiguration {
                key: SweepKey::parse(key).unwrap(),
                result: PathBuf::from(format!("{key}.csv")),
                artifact: None,
                score: scorer.score_metrics(&m),
                metrics: m,
            }
        };
        let mut ranked = vec![
            scored("c", 6.5),
            scored("b", 5.0),
            scored("a", 6.5),
            scored("d", 8.0),
        ];
        ranked.sort_by(compare_ranked);
        let order: Vec<String> = ranked.iter().map(|s| s.key.to_string()).collect();
        assert_eq!(order, vec!["b", "a", "c", "d"]);
    }

    #[test]
    fn rank_records_exclusions() {
        let dir = tempdir().unwrap();
        let good = dir.path().join("good.csv");
        std::fs::write(
            &good,
            "step,position.x,position.y,numAlive,invasiveCover,elevation\n1,0,0,9,0.3,1\n2,0,0,11,0.3,1\n",
        )
        .unwrap();
        let empty = dir.path().join("empty.csv");
        std::fs::write(
            &empty,
            "step,position.x,position.y,numAlive,invasiveCover,elevation\n",
        )
        .unwrap();
        let inputs = vec![
            ScoringInput {
                key: SweepKey::parse("good").unwrap(),
                result: good,
                artifact: None,
            },
            ScoringInput {
                key: SweepKey::parse("empty").unwrap(),
                result: empty,
                artifact: None,
            },
            ScoringInput {
                key: SweepKey::parse("missing").unwrap(),
                result: dir.path().join("missing.csv"),
                artifact: None,
            },
        ];
        let report = Scorer::new(ScoringSettings::default(), ResultSchema::default()).rank(&inputs);
        assert_eq!(report.ranked.len(), 1);
        assert_eq!(report.excluded.len(), 2);
        assert!(matches!(report.excluded[0].error, ScoringError::EmptyResult { .. }));
        assert!(matches!(report.excluded[1].error, ScoringError::MissingResult { .. }));
        assert_eq!(report.top(5).len(), 1);

        let json_path = dir.path().join("report/scores.json");
        report.write_json(&json_path).unwrap();
        let written: Value =
            serde_json::from_str(&std::fs::read_to_string(json_path).unwrap()).unwrap();
        assert_eq!(written["excluded"].as_array().unwrap().len(), 2);
        assert_eq!(written["ranked"][0]["key"], "good");
    }

    #[test]
    fn settings_validation_catches_bad_bands() {
        assert!(ScoringSettings::default().validate().is_ok());

        let mut narrow_loose = ScoringSettings::default();
        narrow_loose.bands.density.loose = BandRange::new(4.0, 5.0);
        assert!(narrow_loose.validate().is_err());

        let empty_window = ScoringSettings {
            window: EvaluationWindow::Trailing { steps: 0 },
            ..ScoringSettings::default()
        };
        assert!(empty_window.validate().is_err());

        let bad_fraction = ScoringSettings {
            strata: StratumSplit::Quantile { fraction: 0.8 },
            ..ScoringSettings::default()
        };
        assert!(bad_fraction.validate().is_err());
    }

    #[test]
    fn settings_deserialize_from_toml() {
        let settings: ScoringSettings = toml::from_str(
            r#"
            [window]
            mode = "range"
            from = 5
            to = 20

            [strata]
            method = "threshold"
            low_max = 1200.0
            high_min = 1800.0

            [bands.stability]
            target = { min = 0.0, max = 0.15 }
            loose = { min = 0.0, max = 0.3 }
            "#,
        )
        .unwrap();
        assert_eq!(settings.window, EvaluationWindow::Range { from: 5, to: 20 });
        assert_eq!(settings.bands.stability.full_points, 25);
        assert_eq!(settings.bands.stability.target.max, 0.15);
        assert_eq!(settings.bands.density, ScoreBands::default().density);
    }

    #[test]
    fn strata_cover_whole_grid_rows() {
        // 30x30 grid, elevation rising with y; each third holds ten full rows.
        let mut rows = Vec::new();
        for step in 0..2 {
            for y in 0..30_u32 {
                for x in 0..30_u32 {
                    let alive = match y {
                        0..=9 => 1.0,
                        10..=19 => 2.0,
                        _ => 3.0,
                    };
                    let mut cell = row(step, f64::from(x), alive, 0.2, f64::from(y));
                    cell.y = f64::from(y);
                    rows.push(cell);
                }
            }
        }
        let scorer = Scorer::new(ScoringSettings::default(), ResultSchema::default());
        let refs: Vec<&ResultRow> = rows.iter().collect();
        let (low, high) = scorer.strata(&refs).unwrap();
        assert_eq!((low.len(), high.len()), (300, 300));
        assert!(low.contains(&(0.0_f64.to_bits(), 9.0_f64.to_bits())));
        assert!(!low.contains(&(0.0_f64.to_bits(), 10.0_f64.to_bits())));
        assert!(high.contains(&(29.0_f64.to_bits(), 20.0_f64.to_bits())));

        let metrics = scorer.compute_metrics(&result(rows)).unwrap();
        assert_eq!(metrics.stratified_ratio, 3.0);
        assert_eq!(metrics.rows, 1800);
    }
}
