use crate::frame::{DetectionResult, Frame};
use async_trait::async_trait;
use detection_proto::{
    parse_document, DetectionRequest, DetectionResponse, ErrorKind, ImageDetection,
    ProtocolError, END_OF_DATA_MARKER,
};
use std::{
    io,
    path::{Path, PathBuf},
};
use thiserror::Error;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::UnixStream,
};
use tracing::instrument;

const READ_CHUNK_SIZE: usize = 64 * 1024;

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("Failed to connect to detection service at {path:?}: {source}")]
    Connect { path: PathBuf, source: io::Error },
    #[error("Socket I/O failed: {0}")]
    Transport(#[from] io::Error),
    #[error("Connection ended before a complete response ({received} bytes received)")]
    ConnectionEnded { received: usize },
    #[error("Invalid response: {0}")]
    InvalidResponse(String),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

impl ClientError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ClientError::Connect { .. } | ClientError::Transport(_) => ErrorKind::Transport,
            ClientError::ConnectionEnded { .. } => ErrorKind::Framing,
            ClientError::InvalidResponse(_) => ErrorKind::Validation,
            ClientError::Protocol(e) => e.kind(),
        }
    }
}

/// Anything able to turn a frame into a detection result.
#[async_trait]
pub trait FrameDetector: Send + Sync {
    async fn detect(&self, frame: &Frame) -> Result<DetectionResult, ClientError>;
}

/// Talks to the detection service, one connection per request.
#[derive(Debug, Clone)]
pub struct DetectionClient {
    socket_path: PathBuf,
}

impl DetectionClient {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Checks that the service accepts connections.
    pub async fn probe(&self) -> Result<(), ClientError> {
        let stream = self.connect().await?;
        drop(stream);
        tracing::info!("Detection service reachable at {:?}", self.socket_path);
        Ok(())
    }

    #[instrument(skip(self, frame), fields(frame = frame.index))]
    pub async fn detect_frame(&self, frame: &Frame) -> Result<DetectionResult, ClientError> {
        let image = frame.raw_bytes().map_err(ProtocolError::from)?;
        let request = DetectionRequest::ImageDetection(
            ImageDetection::new(&image, frame.format.clone())
                .with_origin(frame.index, frame.source_name.clone()),
        );
        let payload = serde_json::to_vec(&request).map_err(ProtocolError::from)?;

        let response = self.exchange(&payload).await?;
        let result = DetectionResult::from_response(response)?;
        tracing::debug!(
            "Frame {} resolved with {} objects",
            frame.index,
            result.object_count
        );
        Ok(result)
    }

    /// Sends raw image bytes using the end-of-data marker framing.
    #[instrument(skip(self, image), fields(size = image.len()))]
    pub async fn detect_legacy(&self, image: &[u8]) -> Result<DetectionResult, ClientError> {
        let mut payload = Vec::with_capacity(image.len() + END_OF_DATA_MARKER.len());
        payload.extend_from_slice(image);
        payload.extend_from_slice(END_OF_DATA_MARKER);

        let response = self.exchange(&payload).await?;
        Ok(DetectionResult::from_response(response)?)
    }

    async fn connect(&self) -> Result<UnixStream, ClientError> {
        UnixStream::connect(&self.socket_path)
            .await
            .map_err(|source| ClientError::Connect {
                path: self.socket_path.clone(),
                source,
            })
    }

    async fn exchange(&self, payload: &[u8]) -> Result<DetectionResponse, ClientError> {
        let mut stream = self.connect().await?;
        stream.write_all(payload).await?;

        let mut buffer = Vec::new();
        let mut chunk = vec![0u8; READ_CHUNK_SIZE];

        loop {
            let n = match stream.read(&mut chunk).await {
                Ok(0) => {
                    return Err(ClientError::ConnectionEnded {
                        received: buffer.len(),
                    })
                }
                Ok(n) => n,
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::ConnectionReset | io::ErrorKind::BrokenPipe
                    ) =>
                {
                    tracing::debug!("Connection reset after {} bytes", buffer.len());
                    return Err(ClientError::ConnectionEnded {
                        received: buffer.len(),
                    });
                }
                Err(e) => return Err(ClientError::Transport(e)),
            };
            buffer.extend_from_slice(&chunk[..n]);

            match parse_document::<DetectionResponse>(&buffer) {
                Ok(Some(response)) => {
                    check_consistency(&response).map_err(ClientError::InvalidResponse)?;
                    return Ok(response);
                }
                Ok(None) => continue,
                Err(ProtocolError::Validation(message)) => {
                    return Err(ClientError::InvalidResponse(message))
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

/// Rejects success documents whose count disagrees with the predictions or
/// whose scores fall outside [0, 1].
fn check_consistency(response: &DetectionResponse) -> Result<(), String> {
    let DetectionResponse::Success(success) = response else {
        return Ok(());
    };
    if success.objects != success.predictions.len() {
        return Err(format!(
            "objects is {} but {} predictions were sent",
            success.objects,
            success.predictions.len()
        ));
    }
    if let Some(bad) = success
        .predictions
        .iter()
        .find(|p| !(0.0..=1.0).contains(&p.score))
    {
        return Err(format!("score {} of {} is outside [0, 1]", bad.score, bad.label));
    }
    Ok(())
}

#[async_trait]
impl FrameDetector for DetectionClient {
    async fn detect(&self, frame: &Frame) -> Result<DetectionResult, ClientError> {
        self.detect_frame(frame).await
    }
}
