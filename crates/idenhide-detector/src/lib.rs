//! HTTP adapter for the face/plate detection service.
//!
//! [`HttpDetector`] implements [`ItemProcessor`] against a detection service
//! exposing `/health`, `/detect`, `/blur` and `/download/{file}`. Images are
//! uploaded as multipart form data; the rendered image is downloaded in a
//! separate call because it may not be on the service's disk yet when
//! `/blur` answers.

use async_trait::async_trait;
use bytes::Bytes;
use idenhide_abstraction::{
    BoundingBox, Detection, DetectionLabel, DetectionResult, ItemPayload, ItemProcessor, ProcessOptions,
    ProcessingError, RenderHandle, Strategy,
};
use reqwest::multipart::{Form, Part};
use reqwest::{Client, StatusCode, Url};
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, error, warn};

/// Default detection service address.
pub const DEFAULT_BASE_URL: &str = "http://localhost:8000";

/// Default per-request timeout. Detection on large images is slow.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);

/// Detection service client.
#[derive(Debug, Clone)]
pub struct HttpDetector {
    /// Base URL of the service, without a trailing slash.
    base_url: String,
    /// HTTP client for making requests.
    client: Client,
}

impl HttpDetector {
    /// Creates a detector talking to [`DEFAULT_BASE_URL`].
    ///
    /// # Errors
    /// Returns a `ProcessingError` if the HTTP client cannot be created.
    pub fn new() -> Result<Self, ProcessingError> {
        Self::with_base_url(DEFAULT_BASE_URL)
    }

    /// Creates a detector with a custom base URL and the default timeout.
    ///
    /// # Errors
    /// Returns a `ProcessingError` if the HTTP client cannot be created.
    pub fn with_base_url(base_url: impl Into<String>) -> Result<Self, ProcessingError> {
        Self::with_timeout(base_url, DEFAULT_TIMEOUT)
    }

    /// Creates a detector with a custom base URL and request timeout.
    ///
    /// # Errors
    /// Returns a `ProcessingError` if the HTTP client cannot be created.
    pub fn with_timeout(base_url: impl Into<String>, timeout: Duration) -> Result<Self, ProcessingError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ProcessingError::Other(format!("Failed to build HTTP client: {e}")))?;
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Ok(Self { base_url, client })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    fn download_url(&self, file_name: &str) -> Result<Url, ProcessingError> {
        let mut url = Url::parse(&self.base_url)
            .map_err(|e| ProcessingError::Other(format!("Invalid detector URL {}: {e}", self.base_url)))?;
        url.path_segments_mut()
            .map_err(|()| ProcessingError::Other(format!("Detector URL {} cannot take a path", self.base_url)))?
            .pop_if_empty()
            .extend(["download", file_name]);
        Ok(url)
    }

    fn image_part(item: &ItemPayload) -> Result<Part, ProcessingError> {
        Part::bytes(item.bytes.to_vec())
            .file_name(item.name.clone())
            .mime_str(content_type_for(&item.name))
            .map_err(|e| ProcessingError::Other(format!("Invalid content type: {e}")))
    }

    fn request_error(&self, err: &reqwest::Error) -> ProcessingError {
        error!(error = %err, base_url = %self.base_url, "Detection service request failed");
        if err.is_connect() {
            ProcessingError::RequestError(format!("Detection service not reachable at {}", self.base_url))
        } else if err.is_timeout() {
            ProcessingError::RequestError(format!("Detection service timed out: {err}"))
        } else {
            ProcessingError::RequestError(format!("Network error: {err}"))
        }
    }

    /// Maps a non-success status to an error. Client errors are the item's
    /// fault; server errors may clear up on their own.
    async fn status_error(response: reqwest::Response) -> ProcessingError {
        let status = response.status();
        let body = response.text().await.unwrap_or_else(|_| "Unknown error".to_string());
        let detail = serde_json::from_str::<ServiceError>(&body).map_or(body, |e| e.detail);
        warn!(status = %status, detail = %detail, "Detection service returned error status");
        if status.is_client_error() {
            ProcessingError::Rejected(format!("{status}: {detail}"))
        } else {
            ProcessingError::Other(format!("{status}: {detail}"))
        }
    }
}

/// Multipart content type for an image file name.
fn content_type_for(name: &str) -> &'static str {
    let extension = name.rsplit_once('.').map(|(_, ext)| ext.to_ascii_lowercase());
    match extension.as_deref() {
        Some("png") => "image/png",
        Some("gif") => "image/gif",
        Some("bmp") => "image/bmp",
        Some("webp") => "image/webp",
        _ => "image/jpeg",
    }
}

fn flag(value: bool) -> &'static str {
    if value { "true" } else { "false" }
}

// Detection service request/response structures
#[derive(Deserialize)]
struct ServiceError {
    detail: String,
}

#[derive(Deserialize)]
struct ServiceBox {
    x1: i32,
    y1: i32,
    x2: i32,
    y2: i32,
    confidence: f32,
    label: String,
}

#[derive(Deserialize)]
struct DetectionResponse {
    success: bool,
    message: String,
    #[serde(default)]
    detections: Vec<ServiceBox>,
    #[serde(default)]
    processing_time_ms: Option<f64>,
}

#[derive(Deserialize)]
struct BlurResponse {
    success: bool,
    message: String,
    #[serde(default)]
    blurred_image_path: String,
    #[serde(default)]
    detections_applied: u32,
}

fn to_detection(raw: ServiceBox) -> Option<Detection> {
    let label = match raw.label.as_str() {
        "face" => DetectionLabel::Face,
        "license_plate" => DetectionLabel::LicensePlate,
        other => {
            debug!(label = other, "Ignoring detection with unknown label");
            return None;
        }
    };
    Some(Detection {
        label,
        confidence: raw.confidence,
        bbox: BoundingBox { x1: raw.x1, y1: raw.y1, x2: raw.x2, y2: raw.y2 },
    })
}

#[async_trait]
impl ItemProcessor for HttpDetector {
    async fn prepare(&self, strategy: Strategy, concurrency: usize) -> Result<(), ProcessingError> {
        debug!(base_url = %self.base_url, strategy = %strategy, concurrency, "Probing detection service");
        let response = self
            .client
            .get(self.url("/health"))
            .send()
            .await
            .map_err(|e| self.request_error(&e))?;
        if !response.status().is_success() {
            return Err(ProcessingError::RequestError(format!(
                "Detection service unhealthy: {}",
                response.status()
            )));
        }
        Ok(())
    }

    async fn process(
        &self,
        item: &ItemPayload,
        options: &ProcessOptions,
    ) -> Result<DetectionResult, ProcessingError> {
        debug!(name = %item.name, size = item.bytes.len(), "Detecting");

        let form = Form::new()
            .part("file", Self::image_part(item)?)
            .text("detect_face", flag(options.detect_faces))
            .text("detect_license_plate", flag(options.detect_plates));

        let response = self
            .client
            .post(self.url("/detect"))
            .multipart(form)
            .send()
            .await
            .map_err(|e| self.request_error(&e))?;
        if !response.status().is_success() {
            return Err(Self::status_error(response).await);
        }

        let body: DetectionResponse = response.json().await.map_err(|e| {
            error!(error = %e, "Failed to parse detection response");
            ProcessingError::SerializationError(format!("Failed to parse response: {e}"))
        })?;
        if !body.success {
            return Err(ProcessingError::Rejected(body.message));
        }

        let detections = body.detections.into_iter().filter_map(to_detection).collect();
        let result = DetectionResult::from_detections(detections);
        Ok(match body.processing_time_ms {
            Some(millis) => result.with_processing_time(millis),
            None => result,
        })
    }

    async fn render_blur(
        &self,
        item: &ItemPayload,
        _detection: &DetectionResult,
        options: &ProcessOptions,
    ) -> Result<RenderHandle, ProcessingError> {
        debug!(name = %item.name, "Rendering blur");

        let form = Form::new()
            .part("file", Self::image_part(item)?)
            .text("detect_face", flag(options.detect_faces))
            .text("detect_license_plate", flag(options.detect_plates))
            .text("face_blur_strength", options.face_blur_strength.to_string())
            .text("plate_blur_strength", options.plate_blur_strength.to_string());

        let response = self
            .client
            .post(self.url("/blur"))
            .multipart(form)
            .send()
            .await
            .map_err(|e| self.request_error(&e))?;
        if !response.status().is_success() {
            return Err(Self::status_error(response).await);
        }

        let body: BlurResponse = response.json().await.map_err(|e| {
            error!(error = %e, "Failed to parse blur response");
            ProcessingError::SerializationError(format!("Failed to parse response: {e}"))
        })?;
        if !body.success {
            return Err(ProcessingError::Rejected(body.message));
        }

        // The service reports a path on its own disk; only the file name is
        // downloadable.
        let locator = body
            .blurred_image_path
            .rsplit(['/', '\\'])
            .next()
            .filter(|name| !name.is_empty())
            .ok_or_else(|| ProcessingError::SerializationError("Blur response has no output path".to_string()))?
            .to_string();
        Ok(RenderHandle { locator, regions_blurred: body.detections_applied })
    }

    async fn fetch_rendered(&self, handle: &RenderHandle) -> Result<Bytes, ProcessingError> {
        let url = self.download_url(&handle.locator)?;
        let response = self.client.get(url).send().await.map_err(|e| self.request_error(&e))?;
        match response.status() {
            status if status.is_success() => response
                .bytes()
                .await
                .map_err(|e| ProcessingError::RequestError(format!("Failed to read artifact: {e}"))),
            StatusCode::NOT_FOUND => Err(ProcessingError::NotReady(handle.locator.clone())),
            _ => Err(Self::status_error(response).await),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;

    fn item() -> ItemPayload {
        ItemPayload::new("street.jpg", Bytes::from_static(b"jpeg-bytes"))
    }

    #[test]
    fn test_content_type_for() {
        assert_eq!(content_type_for("a.PNG"), "image/png");
        assert_eq!(content_type_for("a.jpeg"), "image/jpeg");
        assert_eq!(content_type_for("noext"), "image/jpeg");
    }

    #[test]
    fn test_trailing_slash_trimmed() {
        let detector = HttpDetector::with_base_url("http://detector:8000/").unwrap();
        assert_eq!(detector.base_url(), "http://detector:8000");
        assert_eq!(
            detector.download_url("a b.jpg").unwrap().as_str(),
            "http://detector:8000/download/a%20b.jpg"
        );
    }

    #[tokio::test]
    async fn test_prepare_checks_health() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/health")
            .with_status(200)
            .with_body(r#"{"status": "healthy", "message": "API is running"}"#)
            .create_async()
            .await;

        let detector = HttpDetector::with_base_url(server.url()).unwrap();
        detector.prepare(Strategy::Parallel, 4).await.unwrap();
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_prepare_unreachable() {
        let detector = HttpDetector::with_timeout("http://127.0.0.1:9", Duration::from_secs(2)).unwrap();
        let err = detector.prepare(Strategy::Sequential, 1).await.unwrap_err();
        assert!(matches!(err, ProcessingError::RequestError(_)));
    }

    #[tokio::test]
    async fn test_detect_success() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/detect")
            .match_body(Matcher::AllOf(vec![
                Matcher::Regex(r#"name="file"; filename="street.jpg""#.to_string()),
                Matcher::Regex(r#"name="detect_face"\s+true"#.to_string()),
                Matcher::Regex(r#"name="detect_license_plate"\s+false"#.to_string()),
            ]))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{
                    "success": true,
                    "message": "Detection completed successfully",
                    "detections": [
                        {"x1": 10, "y1": 20, "x2": 50, "y2": 60, "confidence": 0.93, "label": "face"},
                        {"x1": 5, "y1": 5, "x2": 9, "y2": 9, "confidence": 0.4, "label": "license_plate"},
                        {"x1": 0, "y1": 0, "x2": 1, "y2": 1, "confidence": 0.5, "label": "logo"}
                    ],
                    "total_faces": 1,
                    "total_license_plates": 1,
                    "processing_time_ms": 41.5
                }"#,
            )
            .create_async()
            .await;

        let detector = HttpDetector::with_base_url(server.url()).unwrap();
        let options = ProcessOptions { detect_plates: false, ..ProcessOptions::default() };
        let result = detector.process(&item(), &options).await.unwrap();

        assert_eq!(result.face_count, 1);
        assert_eq!(result.plate_count, 1);
        assert_eq!(result.total(), 2);
        assert_eq!(result.detections[0].bbox, BoundingBox { x1: 10, y1: 20, x2: 50, y2: 60 });
        assert_eq!(result.processing_time_ms, Some(41.5));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_detect_unsuccessful_body_is_rejected() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/detect")
            .with_status(200)
            .with_body(r#"{"success": false, "message": "Detection failed: model not loaded"}"#)
            .create_async()
            .await;

        let detector = HttpDetector::with_base_url(server.url()).unwrap();
        let err = detector.process(&item(), &ProcessOptions::default()).await.unwrap_err();
        assert_eq!(err, ProcessingError::Rejected("Detection failed: model not loaded".to_string()));
    }

    #[tokio::test]
    async fn test_detect_bad_request_is_rejected() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/detect")
            .with_status(400)
            .with_body(r#"{"detail": "Invalid image file"}"#)
            .create_async()
            .await;

        let detector = HttpDetector::with_base_url(server.url()).unwrap();
        match detector.process(&item(), &ProcessOptions::default()).await {
            Err(ProcessingError::Rejected(message)) => assert!(message.contains("Invalid image file")),
            other => panic!("Expected Rejected error variant, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_server_error_is_transient() {
        let mut server = mockito::Server::new_async().await;
        server.mock("POST", "/detect").with_status(500).with_body("boom").create_async().await;

        let detector = HttpDetector::with_base_url(server.url()).unwrap();
        let err = detector.process(&item(), &ProcessOptions::default()).await.unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_blur_sends_strengths_and_returns_file_name() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/blur")
            .match_body(Matcher::AllOf(vec![
                Matcher::Regex(r#"name="face_blur_strength"\s+40"#.to_string()),
                Matcher::Regex(r#"name="plate_blur_strength"\s+20"#.to_string()),
            ]))
            .with_status(200)
            .with_body(
                r#"{
                    "success": true,
                    "message": "Blur applied successfully",
                    "blurred_image_path": "outputs/blurred_street_1700000000.jpg",
                    "detections_applied": 3,
                    "processing_time_ms": 88.0
                }"#,
            )
            .create_async()
            .await;

        let detector = HttpDetector::with_base_url(server.url()).unwrap();
        let options = ProcessOptions { face_blur_strength: 40, ..ProcessOptions::default() };
        let handle = detector.render_blur(&item(), &DetectionResult::default(), &options).await.unwrap();

        assert_eq!(handle.locator, "blurred_street_1700000000.jpg");
        assert_eq!(handle.regions_blurred, 3);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_fetch_rendered_not_ready_then_ready() {
        let mut server = mockito::Server::new_async().await;
        let handle = RenderHandle { locator: "blurred_a.jpg".to_string(), regions_blurred: 1 };

        let missing = server
            .mock("GET", "/download/blurred_a.jpg")
            .with_status(404)
            .with_body(r#"{"detail": "File 'blurred_a.jpg' not found."}"#)
            .create_async()
            .await;
        let detector = HttpDetector::with_base_url(server.url()).unwrap();
        let err = detector.fetch_rendered(&handle).await.unwrap_err();
        assert!(matches!(err, ProcessingError::NotReady(_)));
        assert!(err.is_transient());
        missing.remove_async().await;

        server
            .mock("GET", "/download/blurred_a.jpg")
            .with_status(200)
            .with_header("content-type", "image/jpeg")
            .with_body("blurred-bytes")
            .create_async()
            .await;
        let bytes = detector.fetch_rendered(&handle).await.unwrap();
        assert_eq!(bytes, Bytes::from_static(b"blurred-bytes"));
    }
}
