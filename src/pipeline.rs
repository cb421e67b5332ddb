// THEORY:
// The `pipeline` module is the single-photo entry point of the engine. A
// `FatigueAnalyzer` owns the three detectors, the fusion engine and a handle to the
// shared metrics, and turns one photo into one `AnalysisOutcome`.
//
// Key architectural principles:
// 1.  **Linear Flow**: (optional) validate -> decode -> resize to the working
//     resolution -> run every detector -> fuse -> record -> hand off. No step is
//     skipped and nothing runs twice.
// 2.  **Exactly One Record**: Each call writes exactly one success or one error into
//     the metrics, whatever happens, so `total = successful + failed` always holds.
// 3.  **Item-Scoped Failure**: Decode, fetch and validation failures, and panics that
//     somehow escape a detector, come back as a `ProcessingError` naming the item.
//     They never affect another item.
// 4.  **Fire-and-Forget Hand-off**: A finished result is submitted to the optional
//     `ResultSink` and the analyzer moves on. The sink cannot fail the analysis.

use chrono::{DateTime, Utc};
use image::DynamicImage;
use image::imageops::FilterType;
use serde::Serialize;
use std::collections::BTreeMap;
use std::io::Cursor;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::config::{EngineConfig, ValidationConfig};
use crate::core_modules::cascade_detector::CascadeDetector;
use crate::core_modules::classifier_detector::ClassifierDetector;
use crate::core_modules::detector::{Detector, FatigueDetector};
use crate::core_modules::fusion::{AdapterVerdicts, FusionEngine};
use crate::core_modules::landmark_detector::LandmarkDetector;
use crate::core_modules::metrics::{MetricsCollector, MetricsSnapshot};
use crate::core_modules::providers::{
    CascadeModel, ClassifierModel, FileImageSource, ImageSource, LandmarkModel, ResultSink,
};
use crate::error::{AnalysisError, DecodeError, ProcessingError, ValidationError, panic_message};

// Re-export key data structures for the public API.
pub use crate::core_modules::fusion::{FusionResult, GeometricMetrics};
pub use crate::core_modules::verdict::{DetectorVerdict, FatigueLabel, HeadPose};

/// The result of analysing one photo.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnalysisOutcome {
    pub item_id: String,
    pub result: FusionResult,
    /// Wall-clock time from the start of the call to the fused result.
    pub processing_time_ms: f64,
    pub timestamp: DateTime<Utc>,
}

/// Checks raw photo bytes before analysis: non-empty, at least `min_bytes` long, a
/// recognizable image, at least `min_width x min_height`. Returns the dimensions.
pub fn validate_image(bytes: &[u8], config: &ValidationConfig) -> Result<(u32, u32), AnalysisError> {
    if bytes.is_empty() {
        return Err(ValidationError::Empty.into());
    }
    if bytes.len() < config.min_bytes {
        return Err(ValidationError::TooSmall {
            actual: bytes.len(),
            minimum: config.min_bytes,
        }
        .into());
    }

    let (width, height) = image::ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .map_err(|e| DecodeError(image::ImageError::IoError(e)))?
        .into_dimensions()
        .map_err(DecodeError)?;

    if width < config.min_width || height < config.min_height {
        return Err(ValidationError::DimensionsTooSmall {
            width,
            height,
            min_width: config.min_width,
            min_height: config.min_height,
        }
        .into());
    }
    Ok((width, height))
}

/// The main, top-level struct for analysing single photos.
pub struct FatigueAnalyzer {
    config: EngineConfig,
    detectors: Vec<Detector>,
    fusion: FusionEngine,
    metrics: Arc<MetricsCollector>,
    source: Arc<dyn ImageSource>,
    sink: Option<Arc<dyn ResultSink>>,
}

impl FatigueAnalyzer {
    pub fn new(config: EngineConfig, detectors: Vec<Detector>, metrics: Arc<MetricsCollector>) -> Self {
        Self {
            fusion: FusionEngine::new(config.fusion),
            config,
            detectors,
            metrics,
            source: Arc::new(FileImageSource::new()),
            sink: None,
        }
    }

    /// Builds the standard three-detector analyzer around loaded model providers.
    pub fn from_models(
        config: EngineConfig,
        cascade: Arc<dyn CascadeModel>,
        landmark: Arc<dyn LandmarkModel>,
        classifier: Arc<dyn ClassifierModel>,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        let detectors = vec![
            Detector::from(CascadeDetector::new(cascade)),
            Detector::from(LandmarkDetector::new(landmark, config.thresholds)),
            Detector::from(ClassifierDetector::new(classifier)),
        ];
        Self::new(config, detectors, metrics)
    }

    pub fn with_source(mut self, source: Arc<dyn ImageSource>) -> Self {
        self.source = source;
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn ResultSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn metrics(&self) -> &Arc<MetricsCollector> {
        &self.metrics
    }

    pub fn metrics_snapshot(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Readiness of every detector, keyed by detector name.
    pub fn adapters_ready(&self) -> BTreeMap<&'static str, bool> {
        self.detectors
            .iter()
            .map(|detector| (detector.kind().name(), detector.is_ready()))
            .collect()
    }

    pub fn all_ready(&self) -> bool {
        !self.detectors.is_empty() && self.detectors.iter().all(|detector| detector.is_ready())
    }

    /// Analyses one photo given as encoded bytes.
    #[instrument(skip(self, bytes), fields(bytes = bytes.len()))]
    pub async fn analyze(&self, item_id: &str, bytes: &[u8]) -> Result<AnalysisOutcome, ProcessingError> {
        let started = Instant::now();
        let result = self.guarded_evaluate(bytes);
        self.finish(item_id, started, result)
    }

    /// Fetches a photo from the image source, then analyses it.
    #[instrument(skip(self))]
    pub async fn analyze_source(
        &self,
        item_id: &str,
        reference: &str,
    ) -> Result<AnalysisOutcome, ProcessingError> {
        let started = Instant::now();
        let result = match self.source.fetch(reference).await {
            Ok(bytes) => {
                debug!(bytes = bytes.len(), "fetched image");
                self.guarded_evaluate(&bytes)
            }
            Err(error) => Err(error.into()),
        };
        self.finish(item_id, started, result)
    }

    fn guarded_evaluate(&self, bytes: &[u8]) -> Result<FusionResult, AnalysisError> {
        catch_unwind(AssertUnwindSafe(|| self.evaluate(bytes))).unwrap_or_else(|payload| {
            Err(AnalysisError::Panicked(panic_message(payload.as_ref())))
        })
    }

    fn evaluate(&self, bytes: &[u8]) -> Result<FusionResult, AnalysisError> {
        if self.config.validation.enabled {
            validate_image(bytes, &self.config.validation)?;
        }

        let image = image::load_from_memory(bytes).map_err(DecodeError)?;
        let image = self.to_working_resolution(image);

        let verdicts = self.detectors.iter().map(|detector| {
            let started = Instant::now();
            let verdict = detector.detect(&image);
            self.metrics
                .record_adapter_time(detector.kind(), started.elapsed().as_secs_f64() * 1000.0);
            (detector.kind(), verdict)
        });

        Ok(self.fusion.fuse_all(AdapterVerdicts::from_verdicts(verdicts)))
    }

    fn to_working_resolution(&self, image: DynamicImage) -> DynamicImage {
        let (width, height) = (self.config.working_width, self.config.working_height);
        if image.width() == width && image.height() == height {
            image
        } else {
            image.resize_exact(width, height, FilterType::Triangle)
        }
    }

    fn finish(
        &self,
        item_id: &str,
        started: Instant,
        result: Result<FusionResult, AnalysisError>,
    ) -> Result<AnalysisOutcome, ProcessingError> {
        let processing_time_ms = started.elapsed().as_secs_f64() * 1000.0;
        match result {
            Ok(result) => {
                self.metrics
                    .record_success(result.prediction, result.confidence, processing_time_ms);
                self.hand_off(item_id, &result);
                info!(
                    item_id,
                    prediction = %result.prediction,
                    confidence = result.confidence,
                    processing_time_ms,
                    "analysis complete"
                );
                Ok(AnalysisOutcome {
                    item_id: item_id.to_string(),
                    result,
                    processing_time_ms,
                    timestamp: Utc::now(),
                })
            }
            Err(cause) => {
                let error = ProcessingError::new(item_id, cause);
                self.metrics.record_error(error.to_string());
                warn!(%error, "analysis failed");
                Err(error)
            }
        }
    }

    // The outcome is already recorded, so a panicking sink must not reach the caller.
    fn hand_off(&self, item_id: &str, result: &FusionResult) {
        let Some(sink) = &self.sink else {
            return;
        };
        if let Err(payload) = catch_unwind(AssertUnwindSafe(|| sink.submit(item_id, result))) {
            warn!(
                item_id,
                panic = %panic_message(payload.as_ref()),
                "result sink panicked, result dropped"
            );
        }
    }
}
