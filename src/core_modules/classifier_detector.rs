// THEORY:
// The classifier detector treats its model as a black box. The photo is resized to
// the model's input size, converted to RGB, scaled to [0, 1] and laid out as a
// single-image NHWC tensor. The arg-max of the returned distribution picks the label
// through a fixed index map, and its probability becomes the confidence.

use image::DynamicImage;
use image::imageops::FilterType;
use ndarray::Array4;
use std::sync::Arc;

use crate::core_modules::detector::{DetectorKind, FatigueDetector};
use crate::core_modules::providers::ClassifierModel;
use crate::core_modules::verdict::{DetectorVerdict, FatigueLabel, VerdictDetail};
use crate::error::DetectorError;

/// Label for a class index of the model output. Unmapped indices are `Unknown`.
pub fn label_for_index(index: usize) -> FatigueLabel {
    match index {
        0 => FatigueLabel::Alert,
        1 => FatigueLabel::Drowsy,
        2 => FatigueLabel::Sleeping,
        _ => FatigueLabel::Unknown,
    }
}

/// Builds the `[1, height, width, 3]` input tensor for a `(width, height)` model input.
pub fn preprocess(image: &DynamicImage, (width, height): (u32, u32)) -> Array4<f32> {
    let rgb = image
        .resize_exact(width, height, FilterType::Triangle)
        .to_rgb8();
    Array4::from_shape_fn(
        (1, height as usize, width as usize, 3),
        |(_, y, x, channel)| rgb.get_pixel(x as u32, y as u32)[channel] as f32 / 255.0,
    )
}

/// Index and value of the largest probability. The first index wins ties.
fn arg_max(probabilities: &[f32]) -> Option<(usize, f32)> {
    probabilities
        .iter()
        .copied()
        .enumerate()
        .reduce(|best, candidate| if candidate.1 > best.1 { candidate } else { best })
}

pub struct ClassifierDetector {
    model: Arc<dyn ClassifierModel>,
}

impl ClassifierDetector {
    pub fn new(model: Arc<dyn ClassifierModel>) -> Self {
        Self { model }
    }
}

impl FatigueDetector for ClassifierDetector {
    fn kind(&self) -> DetectorKind {
        DetectorKind::Classifier
    }

    fn is_ready(&self) -> bool {
        self.model.is_ready()
    }

    fn evaluate(&self, image: &DynamicImage) -> Result<DetectorVerdict, DetectorError> {
        let (width, height) = self.model.input_size();
        if width == 0 || height == 0 {
            return Err(DetectorError::InvalidOutput(format!(
                "model declares an empty input size {width}x{height}"
            )));
        }

        let input = preprocess(image, (width, height));
        let probabilities = self
            .model
            .infer(&input)
            .map_err(|source| DetectorError::Model {
                kind: "classifier",
                source,
            })?;

        if probabilities.iter().any(|p| !p.is_finite()) {
            return Err(DetectorError::InvalidOutput(
                "non-finite class probability".to_string(),
            ));
        }
        let (class_index, probability) = arg_max(&probabilities)
            .ok_or_else(|| DetectorError::InvalidOutput("empty class distribution".to_string()))?;

        Ok(DetectorVerdict::new(
            label_for_index(class_index),
            probability as f64,
            VerdictDetail::Classifier {
                class_index,
                probabilities,
            },
        ))
    }
}
