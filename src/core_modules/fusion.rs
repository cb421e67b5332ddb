// THEORY:
// The fusion engine is where the three detectors' opinions, which routinely disagree,
// become one decision. It is a weighted vote with abstention:
//
// Key architectural principles:
// 1.  **Weighted Ballots**: Each non-abstaining detector adds `confidence * weight`
//     to the bucket of its label. Geometry carries the most weight because it is the
//     most direct physiological signal.
// 2.  **Abstention Is Not a Vote**: An `unknown` verdict contributes nothing. When all
//     three abstain the result is `unknown` with confidence 0.0.
// 3.  **Severity Breaks Ties**: Among labels that received a ballot, the highest score
//     wins; scores within `TIE_TOLERANCE` of each other are ties and go to the more
//     severe label (sleeping, then drowsy, then alert).
// 4.  **Raw Scale**: The fused confidence is the winning bucket's score as-is. It is
//     neither clamped nor renormalized and can reach the sum of the weights.
//
// Fusion is a pure function of its inputs.

use serde::Serialize;

use crate::config::FusionWeights;
use crate::core_modules::detector::DetectorKind;
use crate::core_modules::verdict::{DetectorVerdict, FatigueLabel, HeadPose, VerdictDetail};

/// Scores closer than this are treated as equal.
pub const TIE_TOLERANCE: f64 = 1e-9;

/// Geometric evidence surfaced alongside the fused decision.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct GeometricMetrics {
    pub ear: f64,
    pub head_pose: HeadPose,
    pub face_detected: bool,
    pub eyes_detected: bool,
}

/// The verdict of every detector, kept for observability.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AdapterVerdicts {
    pub cascade: DetectorVerdict,
    pub landmark: DetectorVerdict,
    pub classifier: DetectorVerdict,
}

impl AdapterVerdicts {
    /// Files verdicts by detector kind. A kind that produced no verdict abstains.
    pub fn from_verdicts(verdicts: impl IntoIterator<Item = (DetectorKind, DetectorVerdict)>) -> Self {
        let mut cascade = None;
        let mut landmark = None;
        let mut classifier = None;
        for (kind, verdict) in verdicts {
            match kind {
                DetectorKind::Cascade => cascade = Some(verdict),
                DetectorKind::Landmark => landmark = Some(verdict),
                DetectorKind::Classifier => classifier = Some(verdict),
            }
        }
        let missing = |kind: DetectorKind| DetectorVerdict::degraded(format!("no {kind} detector configured"));
        Self {
            cascade: cascade.unwrap_or_else(|| missing(DetectorKind::Cascade)),
            landmark: landmark.unwrap_or_else(|| missing(DetectorKind::Landmark)),
            classifier: classifier.unwrap_or_else(|| missing(DetectorKind::Classifier)),
        }
    }
}

/// The single fused decision for one photo.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FusionResult {
    pub prediction: FatigueLabel,
    pub confidence: f64,
    pub geometric_metrics: GeometricMetrics,
    pub per_adapter: AdapterVerdicts,
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct FusionEngine {
    weights: FusionWeights,
}

impl FusionEngine {
    pub fn new(weights: FusionWeights) -> Self {
        Self { weights }
    }

    pub fn fuse(
        &self,
        cascade: DetectorVerdict,
        landmark: DetectorVerdict,
        classifier: DetectorVerdict,
    ) -> FusionResult {
        self.fuse_all(AdapterVerdicts {
            cascade,
            landmark,
            classifier,
        })
    }

    pub fn fuse_all(&self, verdicts: AdapterVerdicts) -> FusionResult {
        let ballots = [
            (&verdicts.cascade, self.weights.cascade),
            (&verdicts.landmark, self.weights.geometry),
            (&verdicts.classifier, self.weights.classifier),
        ];
        let (prediction, confidence) = weighted_vote(&ballots);

        FusionResult {
            prediction,
            confidence,
            geometric_metrics: geometric_metrics(&verdicts),
            per_adapter: verdicts,
        }
    }
}

/// Weighted vote over `(verdict, weight)` ballots. Returns `(Unknown, 0.0)` when every
/// ballot abstains.
pub fn weighted_vote(ballots: &[(&DetectorVerdict, f64)]) -> (FatigueLabel, f64) {
    // Indexed like `FatigueLabel::VOTING_PRIORITY`.
    let mut scores = [0.0_f64; 3];
    let mut voted = [false; 3];

    for (verdict, weight) in ballots {
        let label = verdict.prediction();
        let Some(slot) = FatigueLabel::VOTING_PRIORITY.iter().position(|l| *l == label) else {
            continue;
        };
        scores[slot] += verdict.confidence() * weight;
        voted[slot] = true;
    }

    let mut winner: Option<usize> = None;
    for slot in 0..scores.len() {
        if !voted[slot] {
            continue;
        }
        match winner {
            Some(best) if scores[slot] <= scores[best] + TIE_TOLERANCE => {}
            _ => winner = Some(slot),
        }
    }

    match winner {
        Some(slot) => (FatigueLabel::VOTING_PRIORITY[slot], scores[slot]),
        None => (FatigueLabel::Unknown, 0.0),
    }
}

fn geometric_metrics(verdicts: &AdapterVerdicts) -> GeometricMetrics {
    let mut metrics = GeometricMetrics::default();

    if let VerdictDetail::Landmark {
        face_detected,
        ear,
        head_pose,
        ..
    } = verdicts.landmark.detail()
    {
        metrics.ear = *ear;
        metrics.head_pose = *head_pose;
        metrics.face_detected |= *face_detected;
    }

    if let VerdictDetail::Cascade {
        face_detected,
        eyes_detected,
        ..
    } = verdicts.cascade.detail()
    {
        metrics.face_detected |= *face_detected;
        metrics.eyes_detected = *eyes_detected;
    }

    metrics
}
