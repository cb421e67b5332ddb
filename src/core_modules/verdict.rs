// THEORY:
// The `verdict` module defines the vocabulary every other layer speaks. A detector
// looks at one photo and answers with a `DetectorVerdict`: a fatigue label, how sure
// it is, and a diagnostic payload describing what it saw. The fusion layer reads
// only the label and the confidence; the payload rides along untouched so that the
// final result can explain itself.
//
// Key architectural principles:
// 1.  **Closed Label Set**: `FatigueLabel` has exactly four members. `Unknown` is an
//     abstention, not a fourth opinion. Constructors enforce that an abstaining
//     verdict always carries a confidence of exactly 0.0.
// 2.  **Bounded Confidence**: Every verdict confidence lives in [0.0, 1.0]. Values
//     coming from external models are clamped on the way in; non-finite values
//     are turned into abstentions.
// 3.  **Typed Diagnostics**: The detail payload is a closed enum, one variant per
//     detector kind plus a `Degraded` variant for isolated failures. It serializes
//     as a tagged map for downstream consumers.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The fatigue state of a driver as judged by a single detector or by the fusion layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FatigueLabel {
    Alert,
    Drowsy,
    Sleeping,
    Unknown,
}

impl FatigueLabel {
    /// The three labels that take part in a vote, highest priority first.
    /// When two labels accumulate the same score, the earlier one wins.
    pub const VOTING_PRIORITY: [FatigueLabel; 3] =
        [FatigueLabel::Sleeping, FatigueLabel::Drowsy, FatigueLabel::Alert];

    pub fn as_str(&self) -> &'static str {
        match self {
            FatigueLabel::Alert => "alert",
            FatigueLabel::Drowsy => "drowsy",
            FatigueLabel::Sleeping => "sleeping",
            FatigueLabel::Unknown => "unknown",
        }
    }

    pub fn is_unknown(&self) -> bool {
        matches!(self, FatigueLabel::Unknown)
    }
}

impl fmt::Display for FatigueLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pitch/yaw/roll orientation of a face in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct HeadPose {
    pub pitch: f64,
    pub yaw: f64,
    pub roll: f64,
}

impl HeadPose {
    /// The tilt measure used for drowsiness: nodding plus sideways lean.
    /// Yaw (looking left or right) is not part of it.
    pub fn tilt(&self) -> f64 {
        self.pitch.abs() + self.roll.abs()
    }
}

/// Adapter-specific diagnostics attached to every verdict.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "adapter", rename_all = "snake_case")]
pub enum VerdictDetail {
    Cascade {
        faces_detected: usize,
        eye_count: usize,
        face_detected: bool,
        eyes_detected: bool,
    },
    Landmark {
        face_detected: bool,
        ear: f64,
        head_pose: HeadPose,
        landmarks_count: usize,
    },
    Classifier {
        class_index: usize,
        probabilities: Vec<f32>,
    },
    /// The detector failed internally and abstained.
    Degraded { error: String },
}

/// The answer of one detector for one photo. Created fresh per invocation and never mutated.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DetectorVerdict {
    prediction: FatigueLabel,
    confidence: f64,
    detail: VerdictDetail,
}

impl DetectorVerdict {
    /// Builds a voting verdict. The confidence is clamped into [0, 1]; a non-finite
    /// confidence or an `Unknown` label yields an abstention instead.
    pub fn new(prediction: FatigueLabel, confidence: f64, detail: VerdictDetail) -> Self {
        if prediction.is_unknown() || !confidence.is_finite() {
            return Self::abstain(detail);
        }
        Self {
            prediction,
            confidence: confidence.clamp(0.0, 1.0),
            detail,
        }
    }

    /// An `unknown/0.0` verdict that keeps its diagnostics.
    pub fn abstain(detail: VerdictDetail) -> Self {
        Self {
            prediction: FatigueLabel::Unknown,
            confidence: 0.0,
            detail,
        }
    }

    /// An `unknown/0.0` verdict describing an isolated internal failure.
    pub fn degraded(error: impl fmt::Display) -> Self {
        Self::abstain(VerdictDetail::Degraded {
            error: error.to_string(),
        })
    }

    pub fn prediction(&self) -> FatigueLabel {
        self.prediction
    }

    pub fn confidence(&self) -> f64 {
        self.confidence
    }

    pub fn detail(&self) -> &VerdictDetail {
        &self.detail
    }

    pub fn is_abstention(&self) -> bool {
        self.prediction.is_unknown()
    }

    pub fn is_degraded(&self) -> bool {
        matches!(self.detail, VerdictDetail::Degraded { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn empty_cascade() -> VerdictDetail {
        VerdictDetail::Cascade {
            faces_detected: 0,
            eye_count: 0,
            face_detected: false,
            eyes_detected: false,
        }
    }

    #[test]
    fn unknown_label_forces_zero_confidence() {
        let verdict = DetectorVerdict::new(FatigueLabel::Unknown, 0.9, empty_cascade());
        assert_eq!(verdict.prediction(), FatigueLabel::Unknown);
        assert_eq!(verdict.confidence(), 0.0);
    }

    #[test]
    fn confidence_is_clamped_into_unit_range() {
        let high = DetectorVerdict::new(FatigueLabel::Alert, 1.7, empty_cascade());
        let low = DetectorVerdict::new(FatigueLabel::Drowsy, -0.2, empty_cascade());
        assert_eq!(high.confidence(), 1.0);
        assert_eq!(low.confidence(), 0.0);
    }

    #[test]
    fn non_finite_confidence_becomes_abstention() {
        let verdict = DetectorVerdict::new(FatigueLabel::Sleeping, f64::NAN, empty_cascade());
        assert!(verdict.is_abstention());
        assert_eq!(verdict.confidence(), 0.0);
    }

    #[test]
    fn degraded_verdict_keeps_error_text() {
        let verdict = DetectorVerdict::degraded("model offline");
        assert!(verdict.is_degraded());
        assert_eq!(
            verdict.detail(),
            &VerdictDetail::Degraded {
                error: "model offline".to_string()
            }
        );
    }

    #[test]
    fn detail_serializes_with_adapter_tag() {
        let json = serde_json::to_value(empty_cascade()).unwrap();
        assert_eq!(json["adapter"], "cascade");
        assert_eq!(json["faces_detected"], 0);
    }

    #[test]
    fn head_pose_tilt_ignores_yaw() {
        let pose = HeadPose {
            pitch: -10.0,
            yaw: 40.0,
            roll: 6.0,
        };
        assert_eq!(pose.tilt(), 16.0);
    }
}
