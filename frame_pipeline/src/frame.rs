use base64::{engine::general_purpose::STANDARD, Engine as _};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use detection_proto::{DetectionResponse, Prediction, ProtocolError};

/// File name an image with the given 1-based ordinal is stored under.
pub fn numbered_image_name(index: u32) -> String {
    format!("frame_{:05}.jpg", index)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameEncoding {
    Raw,
    Base64,
}

/// One extracted still image. `index` is its 1-based position in the source.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub index: u32,
    pub source_name: String,
    pub format: String,
    pub payload: Bytes,
    pub encoding: FrameEncoding,
    pub captured_at: DateTime<Utc>,
    /// Size of the decoded image, whatever the payload encoding.
    pub size_bytes: usize,
}

impl Frame {
    pub fn from_image(index: u32, image: impl Into<Bytes>, format: impl Into<String>) -> Self {
        let payload = image.into();
        Self {
            index,
            source_name: numbered_image_name(index),
            format: format.into(),
            size_bytes: payload.len(),
            payload,
            encoding: FrameEncoding::Raw,
            captured_at: Utc::now(),
        }
    }

    pub fn raw_bytes(&self) -> Result<Bytes, base64::DecodeError> {
        match self.encoding {
            FrameEncoding::Raw => Ok(self.payload.clone()),
            FrameEncoding::Base64 => STANDARD.decode(&self.payload).map(Bytes::from),
        }
    }

    pub fn to_base64(&self) -> String {
        match self.encoding {
            FrameEncoding::Raw => STANDARD.encode(&self.payload),
            FrameEncoding::Base64 => String::from_utf8_lossy(&self.payload).into_owned(),
        }
    }
}

/// Falls back to the local clock when the service sent an unreadable time.
fn parse_response_time(timestamp: &str) -> DateTime<Utc> {
    match DateTime::parse_from_rfc3339(timestamp) {
        Ok(t) => t.with_timezone(&Utc),
        Err(e) => {
            tracing::warn!(
                "Unparsable response timestamp {:?} ({}), using local time",
                timestamp,
                e
            );
            Utc::now()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectionStatus {
    Success,
    Error,
}

/// Outcome of one detection request as seen by the pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct DetectionResult {
    pub status: DetectionStatus,
    pub object_count: usize,
    pub predictions: Vec<Prediction>,
    pub annotated_payload: Option<Bytes>,
    pub responded_at: DateTime<Utc>,
    pub error_message: Option<String>,
}

impl DetectionResult {
    pub fn from_response(response: DetectionResponse) -> Result<Self, ProtocolError> {
        let responded_at = parse_response_time(response.timestamp());

        match response {
            DetectionResponse::Success(success) => {
                let annotated_payload = success
                    .annotated_image
                    .map(|image| STANDARD.decode(image).map(Bytes::from))
                    .transpose()?;

                Ok(Self {
                    status: DetectionStatus::Success,
                    object_count: success.objects,
                    predictions: success.predictions,
                    annotated_payload,
                    responded_at,
                    error_message: None,
                })
            }
            DetectionResponse::Error(failure) => Ok(Self {
                status: DetectionStatus::Error,
                object_count: 0,
                predictions: Vec::new(),
                annotated_payload: None,
                responded_at,
                error_message: Some(failure.message),
            }),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == DetectionStatus::Success
    }
}
