// THEORY:
// The cascade detector is the coarsest signal: is there a face, and can two eyes be
// found inside it? Closed eyes defeat an open-eye cascade, so a face without an eye
// pair is read as sleeping.
//
// Only the largest face is considered. Eyes are searched inside that face's region,
// never across the whole frame.

use image::DynamicImage;
use image::imageops;
use std::sync::Arc;
use tracing::debug;

use crate::core_modules::detector::{DetectorKind, FatigueDetector};
use crate::core_modules::landmarks::FaceBox;
use crate::core_modules::providers::CascadeModel;
use crate::core_modules::verdict::{DetectorVerdict, FatigueLabel, VerdictDetail};
use crate::error::DetectorError;

const EYES_CLOSED_CONFIDENCE: f64 = 0.8;
const EYES_OPEN_CONFIDENCE: f64 = 0.7;
const EYE_PAIR: usize = 2;

pub struct CascadeDetector {
    model: Arc<dyn CascadeModel>,
}

impl CascadeDetector {
    pub fn new(model: Arc<dyn CascadeModel>) -> Self {
        Self { model }
    }
}

impl FatigueDetector for CascadeDetector {
    fn kind(&self) -> DetectorKind {
        DetectorKind::Cascade
    }

    fn is_ready(&self) -> bool {
        self.model.is_ready()
    }

    fn evaluate(&self, image: &DynamicImage) -> Result<DetectorVerdict, DetectorError> {
        let gray = image.to_luma8();
        let faces = self
            .model
            .detect_faces(&gray)
            .map_err(|source| DetectorError::Model {
                kind: "cascade",
                source,
            })?;

        let Some(largest) = FaceBox::largest(&faces) else {
            return Ok(DetectorVerdict::abstain(VerdictDetail::Cascade {
                faces_detected: 0,
                eye_count: 0,
                face_detected: false,
                eyes_detected: false,
            }));
        };
        let Some(face) = largest.clamp_to(gray.width(), gray.height()) else {
            debug!(?largest, "face box lies outside the frame, no region to search for eyes");
            return Ok(DetectorVerdict::abstain(VerdictDetail::Cascade {
                faces_detected: faces.len(),
                eye_count: 0,
                face_detected: true,
                eyes_detected: false,
            }));
        };

        let roi = imageops::crop_imm(&gray, face.x, face.y, face.width, face.height).to_image();
        let eyes = self
            .model
            .detect_eyes(&roi)
            .map_err(|source| DetectorError::Model {
                kind: "cascade",
                source,
            })?;

        let eyes_detected = eyes.len() >= EYE_PAIR;
        let (label, confidence) = if eyes_detected {
            (FatigueLabel::Alert, EYES_OPEN_CONFIDENCE)
        } else {
            (FatigueLabel::Sleeping, EYES_CLOSED_CONFIDENCE)
        };

        Ok(DetectorVerdict::new(
            label,
            confidence,
            VerdictDetail::Cascade {
                faces_detected: faces.len(),
                eye_count: eyes.len(),
                face_detected: true,
                eyes_detected,
            },
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use image::GrayImage;
    use std::sync::Mutex;

    struct FakeCascade {
        faces: Vec<FaceBox>,
        eyes: usize,
        roi_sizes: Mutex<Vec<(u32, u32)>>,
    }

    impl FakeCascade {
        fn new(faces: Vec<FaceBox>, eyes: usize) -> Arc<Self> {
            Arc::new(Self {
                faces,
                eyes,
                roi_sizes: Mutex::new(Vec::new()),
            })
        }
    }

    impl CascadeModel for FakeCascade {
        fn detect_faces(&self, _gray: &GrayImage) -> anyhow::Result<Vec<FaceBox>> {
            Ok(self.faces.clone())
        }

        fn detect_eyes(&self, face: &GrayImage) -> anyhow::Result<Vec<FaceBox>> {
            self.roi_sizes.lock().unwrap().push(face.dimensions());
            Ok(vec![FaceBox::new(1, 1, 4, 4); self.eyes])
        }
    }

    struct BrokenCascade;

    impl CascadeModel for BrokenCascade {
        fn detect_faces(&self, _gray: &GrayImage) -> anyhow::Result<Vec<FaceBox>> {
            Err(anyhow!("classifier file missing"))
        }

        fn detect_eyes(&self, _face: &GrayImage) -> anyhow::Result<Vec<FaceBox>> {
            unreachable!()
        }
    }

    fn frame() -> DynamicImage {
        DynamicImage::new_rgb8(640, 480)
    }

    #[test]
    fn no_face_abstains() {
        let detector = CascadeDetector::new(FakeCascade::new(vec![], 2));
        let verdict = detector.detect(&frame());
        assert_eq!(verdict.prediction(), FatigueLabel::Unknown);
        assert_eq!(verdict.confidence(), 0.0);
        assert!(!verdict.is_degraded());
    }

    #[test]
    fn face_without_eye_pair_is_sleeping() {
        let detector = CascadeDetector::new(FakeCascade::new(vec![FaceBox::new(100, 100, 200, 200)], 1));
        let verdict = detector.detect(&frame());
        assert_eq!(verdict.prediction(), FatigueLabel::Sleeping);
        assert_eq!(verdict.confidence(), 0.8);
    }

    #[test]
    fn face_with_eyes_is_alert_and_eyes_searched_in_largest_face() {
        let model = FakeCascade::new(
            vec![FaceBox::new(0, 0, 50, 50), FaceBox::new(200, 100, 180, 160)],
            2,
        );
        let detector = CascadeDetector::new(model.clone());
        let verdict = detector.detect(&frame());

        assert_eq!(verdict.prediction(), FatigueLabel::Alert);
        assert_eq!(verdict.confidence(), 0.7);
        assert_eq!(*model.roi_sizes.lock().unwrap(), vec![(180, 160)]);
        assert_eq!(
            verdict.detail(),
            &VerdictDetail::Cascade {
                faces_detected: 2,
                eye_count: 2,
                face_detected: true,
                eyes_detected: true,
            }
        );
    }

    #[test]
    fn face_outside_frame_is_reported_but_abstains() {
        let model = FakeCascade::new(vec![FaceBox::new(700, 500, 40, 40)], 2);
        let detector = CascadeDetector::new(model.clone());
        let verdict = detector.detect(&frame());

        assert!(verdict.is_abstention());
        assert!(!verdict.is_degraded());
        assert!(model.roi_sizes.lock().unwrap().is_empty());
        assert_eq!(
            verdict.detail(),
            &VerdictDetail::Cascade {
                faces_detected: 1,
                eye_count: 0,
                face_detected: true,
                eyes_detected: false,
            }
        );
    }

    #[test]
    fn model_failure_degrades() {
        let detector = CascadeDetector::new(Arc::new(BrokenCascade));
        let verdict = detector.detect(&frame());
        assert!(verdict.is_degraded());
        assert_eq!(verdict.confidence(), 0.0);
    }
}
