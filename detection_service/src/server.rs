use crate::{
    annotate::annotate_image,
    config::DetectionConfig,
    connection::{Connection, InboundRequest},
    detector::Detector,
};
use detection_proto::{DetectionResponse, ProtocolError};
use futures::future::BoxFuture;
use std::{
    future::Future,
    io,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};
use thiserror::Error;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{UnixListener, UnixStream},
    signal,
    sync::Semaphore,
};
use tokio_stream::{wrappers::UnixListenerStream, StreamExt};

const READ_CHUNK_SIZE: usize = 64 * 1024;

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("Failed to bind {path:?}: {source}")]
    Bind { path: PathBuf, source: io::Error },
    #[error("Socket error: {0}")]
    Io(#[from] io::Error),
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

/// Turns one assembled request into the single response written back.
pub struct RequestHandler<D: Detector> {
    detector: Arc<D>,
    limiter: Option<Arc<Semaphore>>,
    annotate: bool,
    jpeg_quality: u8,
}

impl<D: Detector> RequestHandler<D> {
    pub fn new(detector: Arc<D>, config: &DetectionConfig) -> Self {
        let limiter = config
            .max_concurrent_detections
            .map(|permits| Arc::new(Semaphore::new(permits.max(1))));

        Self {
            detector,
            limiter,
            annotate: config.annotate,
            jpeg_quality: config.jpeg_quality,
        }
    }

    pub async fn handle(&self, request: InboundRequest) -> DetectionResponse {
        match request {
            InboundRequest::Json(detection) => match detection.decode_image() {
                Ok(image) => {
                    tracing::debug!("Decoded image buffer size: {} bytes", image.len());
                    self.detect(&image, Some(detection.timestamp)).await
                }
                Err(e) => DetectionResponse::error(e.to_string()),
            },
            InboundRequest::Legacy(image) => self.detect(&image, None).await,
            InboundRequest::Invalid(message) => {
                tracing::warn!("Rejecting request: {}", message);
                DetectionResponse::error(message)
            }
        }
    }

    async fn detect(&self, image: &[u8], original_timestamp: Option<String>) -> DetectionResponse {
        let _permit = match &self.limiter {
            Some(limiter) => match limiter.acquire().await {
                Ok(permit) => Some(permit),
                Err(e) => return DetectionResponse::error(e.to_string()),
            },
            None => None,
        };

        let detections = match self.detector.detect(image).await {
            Ok(detections) => detections,
            Err(e) => {
                tracing::error!("Detection failed: {}", e);
                return DetectionResponse::error(e.to_string());
            }
        };

        for (i, detection) in detections.iter().enumerate() {
            tracing::debug!(
                "Detection {}: label={}, confidence={:.3}, bbox=({:.1}, {:.1}, {:.1}, {:.1})",
                i,
                detection.label,
                detection.confidence,
                detection.x,
                detection.y,
                detection.width,
                detection.height
            );
        }

        let predictions = detections.iter().map(|d| d.to_prediction()).collect();
        let response = DetectionResponse::success(predictions, original_timestamp);
        if !self.annotate {
            return response;
        }

        match annotate_image(image, &detections, self.jpeg_quality) {
            Ok(annotated) => response.with_annotated_image(&annotated),
            Err(e) => {
                tracing::warn!("Responding without annotated image: {}", e);
                response
            }
        }
    }
}

pub struct DetectionServer<D: Detector> {
    listener: UnixListener,
    socket_path: PathBuf,
    handler: Arc<RequestHandler<D>>,
}

impl<D: Detector> DetectionServer<D> {
    /// Binds the socket, replacing any stale socket file left at `socket_path`.
    /// Must be called from within a tokio runtime.
    pub fn bind(
        socket_path: impl AsRef<Path>,
        detector: Arc<D>,
        config: &DetectionConfig,
    ) -> Result<Self, ServerError> {
        let socket_path = socket_path.as_ref().to_path_buf();
        remove_socket_file(&socket_path)?;

        let listener = UnixListener::bind(&socket_path).map_err(|source| ServerError::Bind {
            path: socket_path.clone(),
            source,
        })?;

        Ok(Self {
            listener,
            socket_path,
            handler: Arc::new(RequestHandler::new(detector, config)),
        })
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Serves until SIGINT or SIGTERM.
    pub async fn run(self) -> Result<(), ServerError> {
        self.run_until(async {
            shutdown_signal().await;
            tracing::info!("Shutdown signal received, starting graceful shutdown")
        })
        .await
    }

    /// Serves until `shutdown` resolves, then removes the socket file.
    /// Connections already accepted keep running to completion.
    pub async fn run_until(self, shutdown: impl Future<Output = ()>) -> Result<(), ServerError> {
        tracing::info!("Detection service listening on {:?}", self.socket_path);

        let mut incoming = UnixListenerStream::new(self.listener);
        let next_id = AtomicU64::new(1);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                accepted = incoming.next() => match accepted {
                    Some(Ok(stream)) => {
                        let id = next_id.fetch_add(1, Ordering::Relaxed);
                        let handler = self.handler.clone();
                        tracing::debug!(connection = id, "Client connected");
                        tokio::spawn(async move {
                            if let Err(e) = serve_connection(stream, handler, id).await {
                                tracing::error!(connection = id, "Connection failed: {}", e);
                            }
                        });
                    }
                    Some(Err(e)) => tracing::error!("Failed to accept connection: {}", e),
                    None => break,
                }
            }
        }

        remove_socket_file(&self.socket_path)?;
        tracing::info!("Detection service stopped");
        Ok(())
    }
}

async fn serve_connection<D: Detector>(
    stream: UnixStream,
    handler: Arc<RequestHandler<D>>,
    id: u64,
) -> Result<(), ServerError> {
    let (mut reader, mut writer) = stream.into_split();
    let mut connection = Connection::new(id);
    let mut chunk = vec![0u8; READ_CHUNK_SIZE];
    let mut processing: Option<BoxFuture<'static, DetectionResponse>> = None;
    let mut peer_open = true;

    loop {
        tokio::select! {
            read = reader.read(&mut chunk), if peer_open => {
                let request = match read {
                    Ok(0) => {
                        tracing::debug!(connection = id, "Client ended connection");
                        peer_open = false;
                        connection.on_peer_closed()
                    }
                    Ok(n) => connection.on_data(&chunk[..n]),
                    Err(e) => {
                        tracing::warn!(connection = id, "Read failed, dropping connection: {}", e);
                        connection.on_read_failed();
                        break;
                    }
                };

                if let Some(request) = request {
                    let handler = handler.clone();
                    processing = Some(Box::pin(async move { handler.handle(request).await }));
                } else if !peer_open && !connection.is_processing() {
                    break;
                }
            }
            response = in_flight(&mut processing), if processing.is_some() => {
                connection.on_detector_resolved();

                let bytes = response.to_bytes()?;
                writer.write_all(&bytes).await?;
                writer.shutdown().await?;
                connection.on_write_complete();
                tracing::debug!(connection = id, "Response of {} bytes sent", bytes.len());
                break;
            }
            else => break,
        }
    }

    Ok(())
}

async fn in_flight(processing: &mut Option<BoxFuture<'static, DetectionResponse>>) -> DetectionResponse {
    match processing {
        Some(future) => future.await,
        None => std::future::pending().await,
    }
}

fn remove_socket_file(path: &Path) -> io::Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

#[cfg(feature = "onnx")]
pub async fn start_server(config: crate::config::Config) -> Result<(), Box<dyn std::error::Error>> {
    let detector = crate::ort_detector::OrtDetector::new(&config.model, &config.labels)?;
    let server = DetectionServer::bind(
        &config.server.socket_path,
        Arc::new(detector),
        &config.detection,
    )?;

    server.run().await?;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
