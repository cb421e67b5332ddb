// THEORY:
// Errors in this engine are sorted by how far they are allowed to travel.
//
// 1.  `DetectorError` never leaves a detector. Every variant is caught at the
//     adapter boundary and turned into an `unknown/0.0` verdict.
// 2.  `DecodeError`, `FetchError`, `ValidationError` are fatal to one photo only.
//     Together with timeouts and captured panics they form `AnalysisError`, the
//     cause carried across the analyzer boundary.
// 3.  `ProcessingError` is the only error an analysis call returns. It pairs the
//     cause with the item identity so a batch can file it under the right photo.
// 4.  `ConfigError` belongs to startup and never appears during analysis.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// The image bytes could not be turned into pixels.
#[derive(Debug, Error)]
#[error("failed to decode image: {0}")]
pub struct DecodeError(#[from] pub image::ImageError);

/// Image acquisition failed before any analysis could start.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("image source `{reference}` does not exist")]
    NotFound { reference: String },
    #[error("image source `{reference}` returned status {status}")]
    Rejected { reference: String, status: u16 },
    #[error("failed to read image source `{reference}`: {source}")]
    Io {
        reference: String,
        #[source]
        source: std::io::Error,
    },
}

/// The optional pre-analysis checks rejected an image.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("image payload is empty")]
    Empty,
    #[error("image payload is {actual} bytes, below the {minimum} byte minimum")]
    TooSmall { actual: usize, minimum: usize },
    #[error("image is {width}x{height}, below the {min_width}x{min_height} minimum")]
    DimensionsTooSmall {
        width: u32,
        height: u32,
        min_width: u32,
        min_height: u32,
    },
}

/// Why a single photo could not be analysed.
#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("image rejected: {0}")]
    Validation(#[from] ValidationError),
    #[error("analysis panicked: {0}")]
    Panicked(String),
    #[error("analysis timed out after {0:?}")]
    TimedOut(Duration),
}

/// The error that crosses the single-item analyzer boundary.
#[derive(Debug, Error)]
#[error("analysis failed for item `{item_id}`: {cause}")]
pub struct ProcessingError {
    pub item_id: String,
    #[source]
    pub cause: AnalysisError,
}

impl ProcessingError {
    pub fn new(item_id: impl Into<String>, cause: impl Into<AnalysisError>) -> Self {
        Self {
            item_id: item_id.into(),
            cause: cause.into(),
        }
    }
}

/// Internal detector failures. Converted to an abstaining verdict at the adapter boundary.
#[derive(Debug, Error)]
pub enum DetectorError {
    #[error("{kind} model failed: {source}")]
    Model {
        kind: &'static str,
        #[source]
        source: anyhow::Error,
    },
    #[error("expected {expected} facial landmarks, got {found}")]
    MissingLandmarks { expected: usize, found: usize },
    #[error("degenerate geometry: {0}")]
    DegenerateGeometry(&'static str),
    #[error("head pose fit did not converge (reprojection error {0:.2}px)")]
    PoseDidNotConverge(f64),
    #[error("model output is invalid: {0}")]
    InvalidOutput(String),
    #[error("detector panicked: {0}")]
    Panicked(String),
}

/// Invalid engine configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Renders a caught panic payload as text.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
