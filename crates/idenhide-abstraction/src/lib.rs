//! Item processor abstraction layer for Iden-Hide.
//!
//! This module defines the boundary between the batch orchestrator and the
//! external face/plate detection and blur capability. Everything on the far
//! side of [`ItemProcessor`] is opaque to the orchestrator: it sees one item
//! in, a detection payload (and optionally a rendered artifact) out.

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default blur strength applied to faces.
pub const DEFAULT_FACE_BLUR_STRENGTH: u8 = 25;

/// Default blur strength applied to license plates.
pub const DEFAULT_PLATE_BLUR_STRENGTH: u8 = 20;

/// Represents an error raised by the external detection/blur capability.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProcessingError {
    /// The request could not be delivered (network issues, connection refused).
    #[error("Request Error: {0}")]
    RequestError(String),

    /// The capability answered but refused or failed to process the item.
    #[error("Rejected: {0}")]
    Rejected(String),

    /// A rendered artifact is not available yet (eventual consistency after a render).
    #[error("Artifact not ready: {0}")]
    NotReady(String),

    /// The processing options are out of range.
    #[error("Invalid options: {0}")]
    InvalidOptions(String),

    /// The response could not be decoded.
    #[error("Serialization Error: {0}")]
    SerializationError(String),

    /// Other unexpected errors.
    #[error("Other Processing Error: {0}")]
    Other(String),
}

impl ProcessingError {
    /// Whether repeating the same call may succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::RequestError(_) | Self::NotReady(_) | Self::Other(_))
    }
}

/// How the dispatcher runs the items of a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// Several items in flight at once, bounded by the job concurrency.
    #[default]
    Parallel,
    /// One item at a time, strictly in index order.
    Sequential,
}

impl std::fmt::Display for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Parallel => f.write_str("parallel"),
            Self::Sequential => f.write_str("sequential"),
        }
    }
}

/// Options forwarded to the detection/blur capability for every item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessOptions {
    /// Detect faces.
    pub detect_faces: bool,
    /// Detect license plates.
    pub detect_plates: bool,
    /// Produce a blurred artifact after detection.
    pub render_blur: bool,
    /// Blur strength for faces, 1-100.
    pub face_blur_strength: u8,
    /// Blur strength for license plates, 1-100.
    pub plate_blur_strength: u8,
}

impl Default for ProcessOptions {
    fn default() -> Self {
        Self {
            detect_faces: true,
            detect_plates: true,
            render_blur: true,
            face_blur_strength: DEFAULT_FACE_BLUR_STRENGTH,
            plate_blur_strength: DEFAULT_PLATE_BLUR_STRENGTH,
        }
    }
}

impl ProcessOptions {
    /// Checks that both blur strengths lie in `1..=100`.
    pub fn validate(&self) -> Result<(), ProcessingError> {
        if !(1..=100).contains(&self.face_blur_strength) {
            return Err(ProcessingError::InvalidOptions(format!(
                "face blur strength must be between 1 and 100, got {}",
                self.face_blur_strength
            )));
        }
        if !(1..=100).contains(&self.plate_blur_strength) {
            return Err(ProcessingError::InvalidOptions(format!(
                "plate blur strength must be between 1 and 100, got {}",
                self.plate_blur_strength
            )));
        }
        Ok(())
    }
}

/// Kind of object found in an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectionLabel {
    /// A human face.
    Face,
    /// A vehicle license plate.
    LicensePlate,
}

/// Pixel-space bounding box `[x1, y1, x2, y2]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x1: i32,
    pub y1: i32,
    pub x2: i32,
    pub y2: i32,
}

/// A single detection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    /// What was detected.
    pub label: DetectionLabel,
    /// Confidence in `[0, 1]`.
    pub confidence: f32,
    /// Where it was detected.
    pub bbox: BoundingBox,
}

/// Detection payload for one item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct DetectionResult {
    /// Number of faces found.
    pub face_count: u32,
    /// Number of license plates found.
    pub plate_count: u32,
    /// Individual detections.
    pub detections: Vec<Detection>,
    /// Time the capability reported spending on the item.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processing_time_ms: Option<f64>,
}

impl DetectionResult {
    /// Builds a result from raw detections, deriving the per-label counts and
    /// clamping confidences into `[0, 1]`.
    #[must_use]
    pub fn from_detections(detections: Vec<Detection>) -> Self {
        let detections: Vec<Detection> = detections
            .into_iter()
            .map(|mut d| {
                d.confidence = d.confidence.clamp(0.0, 1.0);
                d
            })
            .collect();
        let face_count = detections.iter().filter(|d| d.label == DetectionLabel::Face).count() as u32;
        let plate_count =
            detections.iter().filter(|d| d.label == DetectionLabel::LicensePlate).count() as u32;
        Self { face_count, plate_count, detections, processing_time_ms: None }
    }

    /// Attaches the processing time reported by the capability.
    #[must_use]
    pub fn with_processing_time(mut self, millis: f64) -> Self {
        self.processing_time_ms = Some(millis);
        self
    }

    /// Total number of detections.
    #[must_use]
    pub fn total(&self) -> usize {
        self.detections.len()
    }
}

/// The bytes of one item, handed to the processor once a worker has fetched it.
#[derive(Debug, Clone)]
pub struct ItemPayload {
    /// File name of the item (last path segment).
    pub name: String,
    /// Encoded image bytes.
    pub bytes: Bytes,
}

impl ItemPayload {
    #[must_use]
    pub fn new(name: impl Into<String>, bytes: impl Into<Bytes>) -> Self {
        Self { name: name.into(), bytes: bytes.into() }
    }
}

/// Reference to a rendered artifact held by the capability.
///
/// The artifact may not be durably available the moment the render call
/// returns, so it is fetched separately through [`ItemProcessor::fetch_rendered`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderHandle {
    /// Capability-specific locator (a download path, a key, ...).
    pub locator: String,
    /// Number of regions the renderer blurred.
    pub regions_blurred: u32,
}

/// The external detection/blur capability.
///
/// Implementations must be `Send + Sync`; one instance is shared by every
/// worker of a batch. No batching semantics cross this boundary.
#[async_trait]
pub trait ItemProcessor: Send + Sync {
    /// Called once by the dispatcher before items are dispatched under `strategy`.
    ///
    /// A failure here is systemic: it is not attributed to any item.
    async fn prepare(&self, strategy: Strategy, concurrency: usize) -> Result<(), ProcessingError> {
        let _ = (strategy, concurrency);
        Ok(())
    }

    /// Runs detection on one item.
    async fn process(
        &self,
        item: &ItemPayload,
        options: &ProcessOptions,
    ) -> Result<DetectionResult, ProcessingError>;

    /// Renders a blurred version of the item.
    async fn render_blur(
        &self,
        item: &ItemPayload,
        detection: &DetectionResult,
        options: &ProcessOptions,
    ) -> Result<RenderHandle, ProcessingError>;

    /// Downloads a previously rendered artifact.
    async fn fetch_rendered(&self, handle: &RenderHandle) -> Result<Bytes, ProcessingError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detection(label: DetectionLabel, confidence: f32) -> Detection {
        Detection { label, confidence, bbox: BoundingBox { x1: 0, y1: 0, x2: 10, y2: 10 } }
    }

    #[test]
    fn test_default_options_are_valid() {
        let options = ProcessOptions::default();
        assert!(options.validate().is_ok());
        assert_eq!(options.face_blur_strength, 25);
        assert_eq!(options.plate_blur_strength, 20);
    }

    #[test]
    fn test_blur_strength_out_of_range() {
        let options = ProcessOptions { face_blur_strength: 0, ..Default::default() };
        assert!(matches!(options.validate(), Err(ProcessingError::InvalidOptions(_))));

        let options = ProcessOptions { plate_blur_strength: 101, ..Default::default() };
        assert!(matches!(options.validate(), Err(ProcessingError::InvalidOptions(_))));
    }

    #[test]
    fn test_detection_counts() {
        let result = DetectionResult::from_detections(vec![
            detection(DetectionLabel::Face, 0.9),
            detection(DetectionLabel::Face, 1.4),
            detection(DetectionLabel::LicensePlate, 0.7),
        ]);
        assert_eq!(result.face_count, 2);
        assert_eq!(result.plate_count, 1);
        assert_eq!(result.total(), 3);
        assert!((result.detections[1].confidence - 1.0).abs() < f32::EPSILON);
    }

    #[test]
    fn test_label_serialization() {
        let json = serde_json::to_string(&DetectionLabel::LicensePlate).unwrap();
        assert_eq!(json, "\"license_plate\"");
    }

    #[test]
    fn test_transient_errors() {
        assert!(ProcessingError::NotReady("x".to_string()).is_transient());
        assert!(!ProcessingError::Rejected("x".to_string()).is_transient());
        assert!(!ProcessingError::InvalidOptions("x".to_string()).is_transient());
    }

    struct Noop;

    #[async_trait]
    impl ItemProcessor for Noop {
        async fn process(
            &self,
            _item: &ItemPayload,
            _options: &ProcessOptions,
        ) -> Result<DetectionResult, ProcessingError> {
            Ok(DetectionResult::default())
        }

        async fn render_blur(
            &self,
            _item: &ItemPayload,
            _detection: &DetectionResult,
            _options: &ProcessOptions,
        ) -> Result<RenderHandle, ProcessingError> {
            Ok(RenderHandle { locator: "noop".to_string(), regions_blurred: 0 })
        }

        async fn fetch_rendered(&self, _handle: &RenderHandle) -> Result<Bytes, ProcessingError> {
            Ok(Bytes::new())
        }
    }

    #[tokio::test]
    async fn test_prepare_defaults_to_ok() {
        let processor = Noop;
        assert!(processor.prepare(Strategy::Parallel, 4).await.is_ok());
    }
}
