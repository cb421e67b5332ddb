// THEORY:
// This file is the entry point for the `wakesafe_vision` library crate. It exposes
// the engine that estimates a driver's fatigue state from a photo.
//
// The public surface is deliberately small: `FatigueAnalyzer` analyses one photo,
// `BatchOrchestrator` runs many under a concurrency cap, and `MetricsCollector`
// accumulates what happened. Vision models are not part of the crate; they are
// plugged in through the provider traits in `core_modules::providers`.

pub mod config;
pub mod core_modules;
pub mod error;
pub mod parallel_pipeline;
pub mod pipeline;

pub use config::EngineConfig;
pub use core_modules::metrics::{MetricsCollector, MetricsSnapshot};
pub use error::{AnalysisError, ProcessingError};
pub use parallel_pipeline::{BatchFailure, BatchOrchestrator, BatchOutcome};
pub use pipeline::{AnalysisOutcome, FatigueAnalyzer, FatigueLabel, FusionResult};
