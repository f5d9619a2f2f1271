use async_trait::async_trait;
use detection_proto::Prediction;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("Image decoding error: {0}")]
    Decode(String),
    #[error("Inference failed: {0}")]
    Inference(String),
}

/// One object found by a [`Detector`], in pixel coordinates of the source image.
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub label: String,
    pub confidence: f32,
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    /// Drawing color, when the backend knows one for this label.
    pub color: Option<[u8; 3]>,
}

impl Detection {
    pub fn to_prediction(&self) -> Prediction {
        Prediction::new(
            self.label.clone(),
            self.confidence,
            [self.x, self.y, self.width, self.height],
        )
    }
}

/// Maps encoded image bytes to labeled boxes, highest confidence first.
///
/// A single detector is shared by every connection the server accepts, so
/// implementations must tolerate concurrent calls. Backends that cannot should
/// be served with `max_concurrent_detections: 1`, which serializes calls.
#[async_trait]
pub trait Detector: Send + Sync + 'static {
    async fn detect(&self, image: &[u8]) -> Result<Vec<Detection>, DetectorError>;
}
