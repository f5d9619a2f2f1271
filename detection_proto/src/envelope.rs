use crate::error::ProtocolError;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

/// ISO-8601 timestamp with millisecond precision, as carried in envelopes.
pub fn now_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Every request a client may send. Unknown `type` tags are rejected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DetectionRequest {
    ImageDetection(ImageDetection),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ImageDetection {
    /// Base64 encoded image bytes.
    pub image_data: String,
    pub format: String,
    pub timestamp: String,
    #[serde(
        rename = "originalFrame",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub original_frame: Option<u32>,
    #[serde(
        rename = "originalFileName",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub original_file_name: Option<String>,
}

impl ImageDetection {
    pub fn new(image: &[u8], format: impl Into<String>) -> Self {
        Self {
            image_data: STANDARD.encode(image),
            format: format.into(),
            timestamp: now_timestamp(),
            original_frame: None,
            original_file_name: None,
        }
    }

    pub fn with_origin(mut self, frame: u32, file_name: impl Into<String>) -> Self {
        self.original_frame = Some(frame);
        self.original_file_name = Some(file_name.into());
        self
    }

    pub fn decode_image(&self) -> Result<Vec<u8>, ProtocolError> {
        Ok(STANDARD.decode(&self.image_data)?)
    }
}

/// One detected object as it travels on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    #[serde(rename = "class")]
    pub label: String,
    pub score: f64,
    /// `[x, y, width, height]` in pixels.
    pub bbox: [i64; 4],
}

impl Prediction {
    /// Rounds the score to two decimals and the box to whole pixels.
    pub fn new(label: impl Into<String>, score: f32, bbox: [f32; 4]) -> Self {
        let score = (f64::from(score.clamp(0.0, 1.0)) * 100.0).round() / 100.0;
        Self {
            label: label.into(),
            score,
            bbox: bbox.map(|coord| coord.round() as i64),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DetectionResponse {
    Success(DetectionSuccess),
    Error(DetectionFailure),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionSuccess {
    pub objects: usize,
    pub predictions: Vec<Prediction>,
    pub timestamp: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_timestamp: Option<String>,
    /// Base64 encoded JPEG with every prediction drawn on it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotated_image: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionFailure {
    pub message: String,
    pub timestamp: String,
}

impl DetectionResponse {
    pub fn success(predictions: Vec<Prediction>, original_timestamp: Option<String>) -> Self {
        DetectionResponse::Success(DetectionSuccess {
            objects: predictions.len(),
            predictions,
            timestamp: now_timestamp(),
            original_timestamp,
            annotated_image: None,
        })
    }

    pub fn error(message: impl Into<String>) -> Self {
        DetectionResponse::Error(DetectionFailure {
            message: message.into(),
            timestamp: now_timestamp(),
        })
    }

    pub fn with_annotated_image(mut self, image: &[u8]) -> Self {
        if let DetectionResponse::Success(success) = &mut self {
            success.annotated_image = Some(STANDARD.encode(image));
        }
        self
    }

    pub fn timestamp(&self) -> &str {
        match self {
            DetectionResponse::Success(success) => &success.timestamp,
            DetectionResponse::Error(failure) => &failure.timestamp,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, ProtocolError> {
        Ok(serde_json::to_vec(self)?)
    }
}
