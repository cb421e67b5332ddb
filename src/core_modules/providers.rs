// THEORY:
// The engine never runs a vision model itself. Face cascades, landmark regressors
// and the fatigue classifier are loaded elsewhere and handed in behind the traits in
// this module, together with the image source the photos come from and the sink
// finished results go to.
//
// Key architectural principles:
// 1.  **Opaque Capabilities**: Model traits speak in plain image and tensor types and
//     report failure with `anyhow::Result`. Whatever a provider does internally, the
//     detectors only see boxes, points and probabilities.
// 2.  **Loaded Once**: Providers are shared as `Arc<dyn ...>` across every concurrent
//     analysis. They must be `Send + Sync` and must not need `&mut self`.
// 3.  **Fire-and-Forget Output**: A `ResultSink` accepts finished results and never
//     reports back. Whatever happens downstream is the collaborator's concern.

use anyhow::anyhow;
use async_trait::async_trait;
use image::GrayImage;
use ndarray::Array4;
use std::path::PathBuf;
use tokio::sync::mpsc;
use tracing::warn;

use crate::core_modules::fusion::FusionResult;
use crate::core_modules::landmarks::{FaceBox, Point2};
use crate::error::FetchError;

/// Face and eye presence detection (Haar-style cascades).
pub trait CascadeModel: Send + Sync {
    /// Face regions in a full grayscale frame.
    fn detect_faces(&self, gray: &GrayImage) -> anyhow::Result<Vec<FaceBox>>;
    /// Eye regions inside a cropped face. Coordinates are relative to the crop.
    fn detect_eyes(&self, face: &GrayImage) -> anyhow::Result<Vec<FaceBox>>;
    fn is_ready(&self) -> bool {
        true
    }
}

/// Face detection plus 68-point landmark regression.
pub trait LandmarkModel: Send + Sync {
    fn detect_faces(&self, gray: &GrayImage) -> anyhow::Result<Vec<FaceBox>>;
    /// Landmarks of one face in full-frame coordinates, in iBUG order.
    fn predict(&self, gray: &GrayImage, face: FaceBox) -> anyhow::Result<Vec<Point2>>;
    fn is_ready(&self) -> bool {
        true
    }
}

/// A learned fatigue classifier taking a `[1, height, width, 3]` RGB tensor in `[0, 1]`.
pub trait ClassifierModel: Send + Sync {
    /// Expected `(width, height)` of the input tensor.
    fn input_size(&self) -> (u32, u32) {
        (224, 224)
    }
    /// Class probabilities, index 0 = alert, 1 = drowsy, 2 = sleeping.
    fn infer(&self, input: &Array4<f32>) -> anyhow::Result<Vec<f32>>;
    fn is_ready(&self) -> bool {
        true
    }
}

/// Stand-in for a model that failed to load. Reports not-ready and errors on every call,
/// so the detector wrapping it always abstains.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnloadedModel;

impl CascadeModel for UnloadedModel {
    fn detect_faces(&self, _gray: &GrayImage) -> anyhow::Result<Vec<FaceBox>> {
        Err(anyhow!("cascade model is not loaded"))
    }

    fn detect_eyes(&self, _face: &GrayImage) -> anyhow::Result<Vec<FaceBox>> {
        Err(anyhow!("cascade model is not loaded"))
    }

    fn is_ready(&self) -> bool {
        false
    }
}

impl LandmarkModel for UnloadedModel {
    fn detect_faces(&self, _gray: &GrayImage) -> anyhow::Result<Vec<FaceBox>> {
        Err(anyhow!("landmark model is not loaded"))
    }

    fn predict(&self, _gray: &GrayImage, _face: FaceBox) -> anyhow::Result<Vec<Point2>> {
        Err(anyhow!("landmark model is not loaded"))
    }

    fn is_ready(&self) -> bool {
        false
    }
}

impl ClassifierModel for UnloadedModel {
    fn infer(&self, _input: &Array4<f32>) -> anyhow::Result<Vec<f32>> {
        Err(anyhow!("classifier model is not loaded"))
    }

    fn is_ready(&self) -> bool {
        false
    }
}

/// Where photo bytes come from.
#[async_trait]
pub trait ImageSource: Send + Sync {
    async fn fetch(&self, reference: &str) -> Result<Vec<u8>, FetchError>;
}

/// Reads photos from the local file system, optionally below a root directory.
#[derive(Debug, Clone, Default)]
pub struct FileImageSource {
    root: Option<PathBuf>,
}

impl FileImageSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: Some(root.into()),
        }
    }

    fn resolve(&self, reference: &str) -> PathBuf {
        match &self.root {
            Some(root) => root.join(reference),
            None => PathBuf::from(reference),
        }
    }
}

#[async_trait]
impl ImageSource for FileImageSource {
    async fn fetch(&self, reference: &str) -> Result<Vec<u8>, FetchError> {
        let path = self.resolve(reference);
        tokio::fs::read(&path).await.map_err(|source| {
            if source.kind() == std::io::ErrorKind::NotFound {
                FetchError::NotFound {
                    reference: reference.to_string(),
                }
            } else {
                FetchError::Io {
                    reference: reference.to_string(),
                    source,
                }
            }
        })
    }
}

/// One finished analysis handed downstream.
#[derive(Debug, Clone)]
pub struct SinkRecord {
    pub item_id: String,
    pub result: FusionResult,
}

/// Downstream consumer of finished results. Must not block.
pub trait ResultSink: Send + Sync {
    fn submit(&self, item_id: &str, result: &FusionResult);
}

/// Forwards results onto an unbounded channel drained by a separate task.
#[derive(Debug, Clone)]
pub struct ChannelResultSink {
    sender: mpsc::UnboundedSender<SinkRecord>,
}

impl ChannelResultSink {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<SinkRecord>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

impl ResultSink for ChannelResultSink {
    fn submit(&self, item_id: &str, result: &FusionResult) {
        let record = SinkRecord {
            item_id: item_id.to_string(),
            result: result.clone(),
        };
        if self.sender.send(record).is_err() {
            warn!(item_id, "result sink receiver is gone, dropping result");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_file_is_not_found() {
        let source = FileImageSource::with_root(std::env::temp_dir());
        let err = source
            .fetch("wakesafe-vision-definitely-missing.png")
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::NotFound { .. }));
    }

    #[tokio::test]
    async fn existing_file_is_read() {
        let dir = std::env::temp_dir();
        let name = format!("wakesafe-vision-source-{}.bin", std::process::id());
        tokio::fs::write(dir.join(&name), b"bytes").await.unwrap();

        let source = FileImageSource::with_root(&dir);
        assert_eq!(source.fetch(&name).await.unwrap(), b"bytes".to_vec());

        tokio::fs::remove_file(dir.join(&name)).await.unwrap();
    }

    #[test]
    fn unloaded_model_is_not_ready_and_fails() {
        let model = UnloadedModel;
        let gray = GrayImage::new(4, 4);
        assert!(!CascadeModel::is_ready(&model));
        assert!(!LandmarkModel::is_ready(&model));
        assert!(!ClassifierModel::is_ready(&model));
        assert!(CascadeModel::detect_faces(&model, &gray).is_err());
        assert!(model.infer(&Array4::zeros((1, 2, 2, 3))).is_err());
    }
}
