// THEORY:
// Every fatigue signal source sits behind the `FatigueDetector` trait. A detector
// turns a decoded photo into a `DetectorVerdict` and, above all, never fails its
// caller: internal errors and panics are caught right here and turned into an
// abstaining verdict that carries the error text.
//
// Key architectural principles:
// 1.  **Closed Set of Kinds**: `Detector` is an enum with one variant per detector
//     kind. The set is known at compile time, so there is no boxing and no loosely
//     typed lookup. Callers use only the trait surface.
// 2.  **Fallible Inside, Total Outside**: Implementations write `evaluate`, which
//     returns `Result<_, DetectorError>` and may use `?` freely. The provided `detect`
//     wraps it in the isolation boundary.
// 3.  **Pure**: A detector reads its shared model handle and the input image. It keeps
//     no per-call state.

use image::DynamicImage;
use serde::Serialize;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use tracing::warn;

use crate::core_modules::cascade_detector::CascadeDetector;
use crate::core_modules::classifier_detector::ClassifierDetector;
use crate::core_modules::landmark_detector::LandmarkDetector;
use crate::core_modules::verdict::DetectorVerdict;
use crate::error::{DetectorError, panic_message};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectorKind {
    Cascade,
    Landmark,
    Classifier,
}

impl DetectorKind {
    pub const ALL: [DetectorKind; 3] = [
        DetectorKind::Cascade,
        DetectorKind::Landmark,
        DetectorKind::Classifier,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            DetectorKind::Cascade => "cascade",
            DetectorKind::Landmark => "landmark",
            DetectorKind::Classifier => "classifier",
        }
    }
}

impl fmt::Display for DetectorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

pub trait FatigueDetector: Send + Sync {
    fn kind(&self) -> DetectorKind;

    /// Whether the underlying model is loaded.
    fn is_ready(&self) -> bool;

    /// The detector logic proper. May fail.
    fn evaluate(&self, image: &DynamicImage) -> Result<DetectorVerdict, DetectorError>;

    /// Runs `evaluate` behind the isolation boundary. Never fails, never panics.
    fn detect(&self, image: &DynamicImage) -> DetectorVerdict {
        isolate(self.kind(), || self.evaluate(image))
    }
}

/// Converts any error or panic from `run` into an `unknown/0.0` verdict.
pub fn isolate<F>(kind: DetectorKind, run: F) -> DetectorVerdict
where
    F: FnOnce() -> Result<DetectorVerdict, DetectorError>,
{
    let error = match catch_unwind(AssertUnwindSafe(run)) {
        Ok(Ok(verdict)) => return verdict,
        Ok(Err(error)) => error,
        Err(payload) => DetectorError::Panicked(panic_message(payload.as_ref())),
    };
    warn!(detector = %kind, %error, "detector degraded to unknown");
    DetectorVerdict::degraded(error)
}

/// One of the three supported detectors.
pub enum Detector {
    Cascade(CascadeDetector),
    Landmark(LandmarkDetector),
    Classifier(ClassifierDetector),
}

impl Detector {
    fn as_dyn(&self) -> &dyn FatigueDetector {
        match self {
            Detector::Cascade(detector) => detector,
            Detector::Landmark(detector) => detector,
            Detector::Classifier(detector) => detector,
        }
    }
}

impl FatigueDetector for Detector {
    fn kind(&self) -> DetectorKind {
        self.as_dyn().kind()
    }

    fn is_ready(&self) -> bool {
        self.as_dyn().is_ready()
    }

    fn evaluate(&self, image: &DynamicImage) -> Result<DetectorVerdict, DetectorError> {
        self.as_dyn().evaluate(image)
    }

    fn detect(&self, image: &DynamicImage) -> DetectorVerdict {
        self.as_dyn().detect(image)
    }
}

impl From<CascadeDetector> for Detector {
    fn from(detector: CascadeDetector) -> Self {
        Detector::Cascade(detector)
    }
}

impl From<LandmarkDetector> for Detector {
    fn from(detector: LandmarkDetector) -> Self {
        Detector::Landmark(detector)
    }
}

impl From<ClassifierDetector> for Detector {
    fn from(detector: ClassifierDetector) -> Self {
        Detector::Classifier(detector)
    }
}
