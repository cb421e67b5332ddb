// THEORY:
// The landmark detector carries the most direct physiological evidence. From the 68
// landmarks of the largest face it derives two independent signals:
//
// 1.  **Eye openness**: the averaged Eye Aspect Ratio. Below `ear_sleeping` the eyes
//     are closed (sleeping 0.9), below `ear_drowsy` they droop (drowsy 0.7), else
//     alert 0.8.
// 2.  **Head tilt**: |pitch| + |roll| from the perspective fit. Above
//     `head_tilt_degrees` the head droops (drowsy 0.8), else alert 0.6.
//
// A pose fit that fails falls back to a level head, so only the eyes speak.
//
// The two are combined by severity. Closed eyes win outright with their own
// confidence. Otherwise any drowsy signal wins, and otherwise the face is alert; in
// both of those cases the confidence is the larger of the two signal confidences.

use image::DynamicImage;
use std::sync::Arc;
use tracing::warn;

use crate::config::LandmarkThresholds;
use crate::core_modules::detector::{DetectorKind, FatigueDetector};
use crate::core_modules::head_pose::{CameraIntrinsics, estimate_head_pose};
use crate::core_modules::landmarks::{FaceBox, FaceLandmarks};
use crate::core_modules::providers::LandmarkModel;
use crate::core_modules::verdict::{DetectorVerdict, FatigueLabel, HeadPose, VerdictDetail};
use crate::error::DetectorError;

const EAR_SLEEPING_CONFIDENCE: f64 = 0.9;
const EAR_DROWSY_CONFIDENCE: f64 = 0.7;
const EAR_ALERT_CONFIDENCE: f64 = 0.8;
const TILT_DROWSY_CONFIDENCE: f64 = 0.8;
const TILT_ALERT_CONFIDENCE: f64 = 0.6;

/// Combines eye openness and head tilt into one label and confidence.
pub fn classify_geometry(
    ear: f64,
    pose: &HeadPose,
    thresholds: &LandmarkThresholds,
) -> (FatigueLabel, f64) {
    let (ear_label, ear_confidence) = if ear < thresholds.ear_sleeping {
        (FatigueLabel::Sleeping, EAR_SLEEPING_CONFIDENCE)
    } else if ear < thresholds.ear_drowsy {
        (FatigueLabel::Drowsy, EAR_DROWSY_CONFIDENCE)
    } else {
        (FatigueLabel::Alert, EAR_ALERT_CONFIDENCE)
    };

    let (pose_label, pose_confidence) = if pose.tilt() > thresholds.head_tilt_degrees {
        (FatigueLabel::Drowsy, TILT_DROWSY_CONFIDENCE)
    } else {
        (FatigueLabel::Alert, TILT_ALERT_CONFIDENCE)
    };

    if ear_label == FatigueLabel::Sleeping {
        return (FatigueLabel::Sleeping, ear_confidence);
    }

    let combined = ear_confidence.max(pose_confidence);
    if ear_label == FatigueLabel::Drowsy || pose_label == FatigueLabel::Drowsy {
        (FatigueLabel::Drowsy, combined)
    } else {
        (FatigueLabel::Alert, combined)
    }
}

pub struct LandmarkDetector {
    model: Arc<dyn LandmarkModel>,
    thresholds: LandmarkThresholds,
}

impl LandmarkDetector {
    pub fn new(model: Arc<dyn LandmarkModel>, thresholds: LandmarkThresholds) -> Self {
        Self { model, thresholds }
    }
}

impl FatigueDetector for LandmarkDetector {
    fn kind(&self) -> DetectorKind {
        DetectorKind::Landmark
    }

    fn is_ready(&self) -> bool {
        self.model.is_ready()
    }

    fn evaluate(&self, image: &DynamicImage) -> Result<DetectorVerdict, DetectorError> {
        let model_error = |source| DetectorError::Model {
            kind: "landmark",
            source,
        };

        let gray = image.to_luma8();
        let faces = self.model.detect_faces(&gray).map_err(model_error)?;
        let Some(face) = FaceBox::largest(&faces) else {
            return Ok(DetectorVerdict::abstain(VerdictDetail::Landmark {
                face_detected: false,
                ear: 0.0,
                head_pose: HeadPose::default(),
                landmarks_count: 0,
            }));
        };

        let points = self.model.predict(&gray, face).map_err(model_error)?;
        let landmarks = FaceLandmarks::new(points)?;

        let ear = landmarks.eye_aspect_ratio()?;
        let camera = CameraIntrinsics::for_image(gray.width(), gray.height());
        let head_pose = match estimate_head_pose(&landmarks.pose_points(), &camera) {
            Ok(pose) => pose,
            Err(error) => {
                warn!(%error, "head pose fit failed, classifying by eye openness alone");
                HeadPose::default()
            }
        };

        let (label, confidence) = classify_geometry(ear, &head_pose, &self.thresholds);
        Ok(DetectorVerdict::new(
            label,
            confidence,
            VerdictDetail::Landmark {
                face_detected: true,
                ear,
                head_pose,
                landmarks_count: landmarks.len(),
            },
        ))
    }
}
