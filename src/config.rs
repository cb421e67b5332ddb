// THEORY:
// `EngineConfig` is the single bundle of tunable behavior for the engine, in the same
// spirit as a pipeline config: plain public fields, cloned into every component that
// needs them, with no component re-reading the environment on its own.
//
// Values are layered: compiled defaults, then an optional JSON file, then
// `WAKESAFE_*` environment overrides. `validate` is the gate every layer passes
// through before the engine is built.

use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::error::ConfigError;

const ENV_PREFIX: &str = "WAKESAFE_";

/// Per-detector trust multipliers used by the fusion vote.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
pub struct FusionWeights {
    pub cascade: f64,
    pub geometry: f64,
    pub classifier: f64,
}

impl Default for FusionWeights {
    fn default() -> Self {
        Self {
            cascade: 0.3,
            geometry: 0.5,
            classifier: 0.2,
        }
    }
}

impl FusionWeights {
    /// Upper bound of a fused confidence: the value reached when every detector votes
    /// the same label with full confidence.
    pub fn total(&self) -> f64 {
        self.cascade + self.geometry + self.classifier
    }
}

/// Decision thresholds of the landmark-geometry detector.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
pub struct LandmarkThresholds {
    /// EAR below this value reads as closed eyes.
    pub ear_sleeping: f64,
    /// EAR below this value (and at or above `ear_sleeping`) reads as drooping eyes.
    pub ear_drowsy: f64,
    /// |pitch| + |roll| above this many degrees reads as a drooping head.
    pub head_tilt_degrees: f64,
}

impl Default for LandmarkThresholds {
    fn default() -> Self {
        Self {
            ear_sleeping: 0.20,
            ear_drowsy: 0.25,
            head_tilt_degrees: 15.0,
        }
    }
}

/// Capacities of the metrics rolling windows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub processing_time_capacity: usize,
    pub error_capacity: usize,
    pub outcome_capacity: usize,
    pub adapter_time_capacity: usize,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            processing_time_capacity: 1000,
            error_capacity: 100,
            outcome_capacity: 100,
            adapter_time_capacity: 100,
        }
    }
}

/// Optional sanity checks applied to raw image bytes before analysis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ValidationConfig {
    pub enabled: bool,
    pub min_bytes: usize,
    pub min_width: u32,
    pub min_height: u32,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            min_bytes: 1024,
            min_width: 100,
            min_height: 100,
        }
    }
}

/// Configuration for the whole engine.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub fusion: FusionWeights,
    pub thresholds: LandmarkThresholds,
    /// Decoded photos are resized to this resolution before any detector sees them.
    pub working_width: u32,
    pub working_height: u32,
    /// Default number of photos analysed at the same time by a batch.
    pub concurrency_limit: usize,
    /// A photo still running after this many seconds is filed as failed. `None` disables it.
    pub item_timeout_secs: Option<u64>,
    pub metrics: MetricsConfig,
    pub validation: ValidationConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            fusion: FusionWeights::default(),
            thresholds: LandmarkThresholds::default(),
            working_width: 640,
            working_height: 480,
            concurrency_limit: 5,
            item_timeout_secs: Some(30),
            metrics: MetricsConfig::default(),
            validation: ValidationConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn item_timeout(&self) -> Option<Duration> {
        self.item_timeout_secs.map(Duration::from_secs)
    }

    /// Loads a JSON config file. Missing fields keep their defaults.
    pub fn from_json_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Applies `WAKESAFE_*` overrides from the process environment.
    pub fn with_env_overrides(self) -> Result<Self, ConfigError> {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    /// Applies overrides from an arbitrary key lookup. Keys carry the `WAKESAFE_` prefix.
    pub fn with_overrides<F>(mut self, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(&format!("{ENV_PREFIX}{name}"));

        if let Some(raw) = get("CONCURRENCY_LIMIT") {
            self.concurrency_limit = parse_field("concurrency_limit", &raw)?;
        }
        if let Some(raw) = get("ITEM_TIMEOUT_SECS") {
            let secs: u64 = parse_field("item_timeout_secs", &raw)?;
            self.item_timeout_secs = (secs > 0).then_some(secs);
        }
        if let Some(raw) = get("WORKING_WIDTH") {
            self.working_width = parse_field("working_width", &raw)?;
        }
        if let Some(raw) = get("WORKING_HEIGHT") {
            self.working_height = parse_field("working_height", &raw)?;
        }
        if let Some(raw) = get("VALIDATE_INPUT") {
            self.validation.enabled = parse_field("validation.enabled", &raw)?;
        }

        Ok(self)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.concurrency_limit == 0 {
            return Err(invalid("concurrency_limit", "must be at least 1"));
        }
        if self.working_width == 0 || self.working_height == 0 {
            return Err(invalid("working_width/working_height", "must be non-zero"));
        }

        let weights = [
            ("fusion.cascade", self.fusion.cascade),
            ("fusion.geometry", self.fusion.geometry),
            ("fusion.classifier", self.fusion.classifier),
        ];
        for (field, weight) in weights {
            if !weight.is_finite() || weight < 0.0 {
                return Err(invalid(field, "must be a finite, non-negative number"));
            }
        }

        let thresholds = &self.thresholds;
        if !(thresholds.ear_sleeping > 0.0 && thresholds.ear_sleeping <= thresholds.ear_drowsy) {
            return Err(invalid(
                "thresholds.ear_sleeping",
                "must be positive and not above thresholds.ear_drowsy",
            ));
        }
        if !thresholds.head_tilt_degrees.is_finite() || thresholds.head_tilt_degrees < 0.0 {
            return Err(invalid("thresholds.head_tilt_degrees", "must be non-negative"));
        }

        let capacities = [
            ("metrics.processing_time_capacity", self.metrics.processing_time_capacity),
            ("metrics.error_capacity", self.metrics.error_capacity),
            ("metrics.outcome_capacity", self.metrics.outcome_capacity),
            ("metrics.adapter_time_capacity", self.metrics.adapter_time_capacity),
        ];
        for (field, capacity) in capacities {
            if capacity == 0 {
                return Err(invalid(field, "must be at least 1"));
            }
        }

        Ok(())
    }
}

fn invalid(field: &'static str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.to_string(),
    }
}

fn parse_field<T>(field: &'static str, raw: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
        field,
        reason: format!("`{raw}`: {e}"),
    })
}
