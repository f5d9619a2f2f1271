mod annotate;
mod server;

pub mod config;
pub mod connection;
pub mod detector;
pub mod labels;
#[cfg(feature = "onnx")]
pub mod ort_detector;

pub use annotate::{annotate_image, AnnotateError};
pub use detector::{Detection, Detector, DetectorError};
pub use server::{DetectionServer, RequestHandler, ServerError};

#[cfg(feature = "onnx")]
pub use server::start_server;
