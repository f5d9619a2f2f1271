use async_trait::async_trait;
use bytes::Bytes;
use detection_service::{
    config::DetectionConfig, Detection, DetectionServer, Detector, DetectorError,
};
use frame_pipeline::{
    codec::{CodecError, EncodeOptions, FrameCodec, OutputFrame},
    DetectionClient, DispatchPolicy, Orchestrator, SlotState,
};
use std::{path::Path, sync::Arc, time::Duration};
use tokio::sync::oneshot;

/// Labels each image with its own text, answering later frames sooner.
struct EchoDetector;

#[async_trait]
impl Detector for EchoDetector {
    async fn detect(&self, image: &[u8]) -> Result<Vec<Detection>, DetectorError> {
        let text = std::str::from_utf8(image)
            .map_err(|e| DetectorError::Decode(e.to_string()))?
            .to_string();
        let index: u64 = text
            .trim_start_matches("source-")
            .parse()
            .map_err(|_| DetectorError::Decode(format!("unexpected image {}", text)))?;
        tokio::time::sleep(Duration::from_millis(60 - 10 * (index % 6))).await;

        Ok(vec![Detection {
            label: text,
            confidence: 0.9,
            x: index as f32,
            y: 0.0,
            width: 10.0,
            height: 10.0,
            color: None,
        }])
    }
}

struct StaticCodec {
    frames: Vec<Bytes>,
}

#[async_trait]
impl FrameCodec for StaticCodec {
    async fn extract_frames(&self, _video: &Path) -> Result<Vec<Bytes>, CodecError> {
        Ok(self.frames.clone())
    }

    async fn encode_frames(
        &self,
        frames: &[OutputFrame],
        _options: &EncodeOptions,
    ) -> Result<Vec<u8>, CodecError> {
        Ok(frames.iter().flat_map(|f| f.image.to_vec()).collect())
    }
}

async fn start_service(socket: &Path) -> oneshot::Sender<()> {
    let config = DetectionConfig {
        annotate: false,
        ..DetectionConfig::default()
    };
    let server = DetectionServer::bind(socket, Arc::new(EchoDetector), &config).unwrap();
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    tokio::spawn(server.run_until(async {
        let _ = shutdown_rx.await;
    }));
    shutdown_tx
}

#[tokio::test]
async fn test_pipeline_against_running_service() {
    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("detection.sock");
    let shutdown = start_service(&socket).await;

    let client = DetectionClient::new(&socket);
    client.probe().await.unwrap();

    let codec = StaticCodec {
        frames: (1..=8)
            .map(|i| Bytes::from(format!("source-{}", i)))
            .collect(),
    };
    let orchestrator = Orchestrator::new(client, codec, DispatchPolicy::Batched { size: 4 });

    let frames = orchestrator.extract(Path::new("input.mp4")).await.unwrap();
    let job = orchestrator.dispatch(&frames).await.unwrap();
    assert!(job.is_done());
    assert_eq!(job.progress().to_string(), "8/8");

    for (index, slot) in job.slots() {
        match slot {
            SlotState::Completed(result) => {
                assert_eq!(result.object_count, 1);
                assert_eq!(result.predictions[0].label, format!("source-{}", index));
                assert_eq!(result.predictions[0].bbox, [index as i64, 0, 10, 10]);
            }
            other => panic!("frame {} not completed: {:?}", index, other),
        }
    }

    // No annotations were requested, so every output frame is its own source.
    let output = orchestrator.reassemble(&frames, &job).unwrap();
    for (position, frame) in output.iter().enumerate() {
        assert_eq!(frame.index, position as u32 + 1);
        assert_eq!(frame.image, Bytes::from(format!("source-{}", frame.index)));
    }

    let video = orchestrator
        .encode(&output, &EncodeOptions::default())
        .await
        .unwrap()
        .unwrap();
    assert!(video.starts_with(b"source-1source-2"));

    shutdown.send(()).unwrap();
}

#[tokio::test]
async fn test_service_errors_are_recorded_per_frame() {
    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("detection.sock");
    let shutdown = start_service(&socket).await;

    let codec = StaticCodec {
        frames: vec![
            Bytes::from_static(b"source-1"),
            Bytes::from_static(b"not a frame"),
            Bytes::from_static(b"source-3"),
        ],
    };
    let orchestrator = Orchestrator::new(
        DetectionClient::new(&socket),
        codec,
        DispatchPolicy::Sequential {
            delay: Duration::from_millis(5),
        },
    );

    let frames = orchestrator.extract(Path::new("input.mp4")).await.unwrap();
    let job = orchestrator.dispatch(&frames).await.unwrap();

    let progress = job.progress();
    assert_eq!((progress.succeeded, progress.failed), (2, 1));
    match job.slot(2) {
        Some(SlotState::Completed(result)) => {
            assert!(!result.is_success());
            assert!(result
                .error_message
                .as_deref()
                .unwrap()
                .starts_with("Image decoding error"));
        }
        other => panic!("unexpected slot {:?}", other),
    }

    shutdown.send(()).unwrap();
}

#[tokio::test]
async fn test_legacy_request_against_running_service() {
    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("detection.sock");
    let shutdown = start_service(&socket).await;

    let result = DetectionClient::new(&socket)
        .detect_legacy(b"source-5")
        .await
        .unwrap();

    assert!(result.is_success());
    assert_eq!(result.predictions[0].label, "source-5");

    shutdown.send(()).unwrap();
}

#[tokio::test]
async fn test_availability_check_fails_once_service_stopped() {
    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("detection.sock");
    let shutdown = start_service(&socket).await;
    shutdown.send(()).unwrap();
    // Give the accept loop a moment to stop and remove the socket.
    tokio::time::sleep(Duration::from_millis(50)).await;

    let client = DetectionClient::new(&socket);
    assert!(client.probe().await.is_err());
}
