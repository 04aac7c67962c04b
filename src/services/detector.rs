use async_trait::async_trait;
use base64::Engine;
use image::DynamicImage;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::models::detection::BoundingBox;
use crate::models::outcome::FailureKind;

/// A frame that decoded successfully, with its original encoding kept for
/// detectors that prefer to receive the compressed bytes.
#[derive(Debug, Clone)]
pub struct DecodedFrame {
    pub width: u32,
    pub height: u32,
    pub encoded: Arc<[u8]>,
    pub image: Arc<DynamicImage>,
}

/// What the model reports for one object, before it is tied to a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawDetection {
    #[serde(rename = "label")]
    pub class_label: String,
    pub confidence: f32,
    #[serde(rename = "box", with = "box_as_array")]
    pub bounding_box: BoundingBox,
}

/// The object-detection model, treated as a black-box scorer.
#[async_trait]
pub trait Detector: Send + Sync {
    async fn detect(&self, frame: &DecodedFrame) -> Result<Vec<RawDetection>, DetectorError>;
}

#[derive(Serialize)]
struct DetectRequest {
    image: String,
    width: u32,
    height: u32,
}

#[derive(Deserialize)]
struct DetectResponse {
    detections: Vec<RawDetection>,
}

/// Client for a model-serving sidecar that scores one frame per request.
pub struct HttpDetector {
    http: Client,
    endpoint: String,
    api_token: Option<String>,
}

impl HttpDetector {
    pub fn new(endpoint: &str, api_token: Option<String>) -> Result<Self, DetectorError> {
        let http = Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| DetectorError::Unavailable(e.to_string()))?;

        Ok(Self {
            http,
            endpoint: endpoint.to_string(),
            api_token,
        })
    }
}

#[async_trait]
impl Detector for HttpDetector {
    async fn detect(&self, frame: &DecodedFrame) -> Result<Vec<RawDetection>, DetectorError> {
        let body = DetectRequest {
            image: base64::engine::general_purpose::STANDARD.encode(&frame.encoded),
            width: frame.width,
            height: frame.height,
        };

        let mut request = self.http.post(&self.endpoint).json(&body);
        if let Some(token) = &self.api_token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await?;
        if let Some(err) = classify_status(response.status()) {
            return Err(err);
        }

        let parsed: DetectResponse = response.json().await?;
        Ok(parsed.detections)
    }
}

/// Map a model-server status to an error, `None` for success.
pub fn classify_status(status: StatusCode) -> Option<DetectorError> {
    if status.is_success() {
        return None;
    }
    Some(match status {
        StatusCode::TOO_MANY_REQUESTS | StatusCode::SERVICE_UNAVAILABLE | StatusCode::INSUFFICIENT_STORAGE => {
            DetectorError::Exhausted(format!("model server returned {}", status))
        }
        StatusCode::BAD_REQUEST | StatusCode::UNSUPPORTED_MEDIA_TYPE | StatusCode::UNPROCESSABLE_ENTITY | StatusCode::PAYLOAD_TOO_LARGE => {
            DetectorError::Rejected(format!("model server returned {}", status))
        }
        _ => DetectorError::Unavailable(format!("model server returned {}", status)),
    })
}

#[derive(Debug, thiserror::Error)]
pub enum DetectorError {
    #[error("Model server unavailable: {0}")]
    Unavailable(String),

    #[error("Accelerator resources exhausted: {0}")]
    Exhausted(String),

    #[error("Model rejected frame: {0}")]
    Rejected(String),

    #[error("Model returned invalid output: {0}")]
    InvalidOutput(String),
}

impl From<reqwest::Error> for DetectorError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            DetectorError::InvalidOutput(err.to_string())
        } else if err.is_timeout() {
            DetectorError::Exhausted(err.to_string())
        } else {
            DetectorError::Unavailable(err.to_string())
        }
    }
}

impl DetectorError {
    pub fn kind(&self) -> FailureKind {
        match self {
            DetectorError::Unavailable(_) => FailureKind::Transport,
            DetectorError::Exhausted(_) => FailureKind::Capacity,
            DetectorError::Rejected(_) | DetectorError::InvalidOutput(_) => FailureKind::Data,
        }
    }
}

mod box_as_array {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    use crate::models::detection::BoundingBox;

    pub fn serialize<S: Serializer>(b: &BoundingBox, serializer: S) -> Result<S::Ok, S::Error> {
        [b.x_min, b.y_min, b.x_max, b.y_max].serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<BoundingBox, D::Error> {
        let [x_min, y_min, x_max, y_max] = <[f32; 4]>::deserialize(deserializer)?;
        Ok(BoundingBox::new(x_min, y_min, x_max, y_max))
    }
}
