#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    rust_2018_idioms,
    missing_docs
)]

//! Postfire sweep engine: expands parameter sweeps into configuration
//! artifacts, drives the external simulation engine once per combination, and
//! scores the resulting time series.

/// Typed errors per concern.
pub mod error;

/// Sweep keys and artifact stores.
pub mod keys;

/// Configuration artifact format.
pub mod params;

/// Sweep definition tables.
pub mod definition;

/// Artifact generation and cleanup.
pub mod generator;

/// Built-in management scenarios.
pub mod scenarios;

/// Structured logging for sweep components.
pub mod telemetry;

/// External engine contract.
pub mod engine;

/// Single-writer output location.
pub mod slot;

/// Sweep orchestration.
pub mod runner;

/// Scenario result tables.
pub mod results;

/// Metrics, scores and ranking.
pub mod scoring;

/// Result concatenation.
pub mod aggregate;

/// Synthetic spatial inputs.
pub mod raster;

/// TOML settings.
pub mod settings;

pub use aggregate::{combine, CombineReport};
pub use definition::{DefinitionOptions, DuplicatePolicy, SweepDefinition, ValuePolicy};
pub use engine::{EngineInvocation, EngineInvoker, EngineSettings, OutputLocation, ProcessInvoker};
pub use error::{ConfigError, InvocationError, RasterError, ScoringError};
pub use generator::{CleanReport, ConfigGenerator, GenerationReport};
pub use keys::{ArtifactStore, FsArtifactStore, MemoryArtifactStore, SweepKey};
pub use params::{ConfigArtifact, ParamValue};
pub use raster::{GridSpec, Raster, RasterPlan, RasterSet};
pub use results::{ResultSchema, ScenarioResult};
pub use runner::{CombinationStatus, SweepOptions, SweepRunner, SweepSummary};
pub use scoring::{Scorer, ScoringInput, ScoringReport, ScoringSettings};
pub use settings::Settings;
pub use telemetry::SweepTelemetry;
