//! Drives a video through extraction, detection, and reassembly.

use crate::client::{ClientError, FrameDetector};
use crate::codec::{CodecError, EncodeOptions, FrameCodec, OutputFrame};
use crate::frame::Frame;
use crate::job::{JobError, PipelineJob, Progress, SlotState};
use futures::future::join_all;
use std::{path::Path, time::Duration};
use thiserror::Error;
use tracing::instrument;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),
    #[error("Batch {batch} failed on frame {frame} ({progress} succeeded): {source}")]
    BatchFailed {
        batch: usize,
        frame: u32,
        progress: Progress,
        #[source]
        source: ClientError,
    },
    #[error("Job error: {0}")]
    Job(#[from] JobError),
    #[error("Frame {0} has no annotated image")]
    MissingAnnotation(u32),
    #[error("Frames are not numbered 1..N: expected {expected}, found {found}")]
    NonContiguous { expected: u32, found: u32 },
    #[error("Frame payload is not valid base64: {0}")]
    Payload(#[from] base64::DecodeError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchPolicy {
    /// One request at a time, pausing between requests. Failures are recorded
    /// and the job carries on.
    Sequential { delay: Duration },
    /// Up to `size` requests at once. Any failed request aborts the job once
    /// its batch has resolved.
    Batched { size: usize },
}

impl Default for DispatchPolicy {
    fn default() -> Self {
        DispatchPolicy::Batched { size: 5 }
    }
}

pub struct Orchestrator<D, C> {
    detector: D,
    codec: C,
    policy: DispatchPolicy,
    fallback_to_source: bool,
}

impl<D: FrameDetector, C: FrameCodec> Orchestrator<D, C> {
    pub fn new(detector: D, codec: C, policy: DispatchPolicy) -> Self {
        Self {
            detector,
            codec,
            policy,
            fallback_to_source: true,
        }
    }

    /// Whether frames without an annotated image reuse their source image.
    pub fn with_fallback_to_source(mut self, fallback: bool) -> Self {
        self.fallback_to_source = fallback;
        self
    }

    pub fn policy(&self) -> DispatchPolicy {
        self.policy
    }

    #[instrument(skip(self))]
    pub async fn extract(&self, video: &Path) -> Result<Vec<Frame>, PipelineError> {
        let images = self.codec.extract_frames(video).await?;
        let frames = images
            .into_iter()
            .enumerate()
            .map(|(position, image)| Frame::from_image(position as u32 + 1, image, "jpg"))
            .collect();
        Ok(frames)
    }

    #[instrument(skip(self, frames), fields(frames = frames.len()))]
    pub async fn dispatch(&self, frames: &[Frame]) -> Result<PipelineJob, PipelineError> {
        check_numbering(frames)?;
        let mut job = PipelineJob::new(frames.len());
        if frames.is_empty() {
            tracing::info!("No frames to process");
            return Ok(job);
        }

        match self.policy {
            DispatchPolicy::Sequential { delay } => {
                self.dispatch_sequential(frames, delay, &mut job).await?
            }
            DispatchPolicy::Batched { size } => {
                self.dispatch_batched(frames, size.max(1), &mut job).await?
            }
        }

        tracing::info!("Detection finished: {} frames succeeded", job.progress());
        Ok(job)
    }

    async fn dispatch_sequential(
        &self,
        frames: &[Frame],
        delay: Duration,
        job: &mut PipelineJob,
    ) -> Result<(), PipelineError> {
        for (position, frame) in frames.iter().enumerate() {
            let outcome = self.detector.detect(frame).await.map_err(|e| {
                tracing::error!("Frame {} failed: {}", frame.index, e);
                e.to_string()
            });
            job.record(frame.index, outcome)?;
            tracing::debug!("Progress: {}", job.progress());

            if position + 1 < frames.len() {
                tokio::time::sleep(delay).await;
            }
        }
        Ok(())
    }

    async fn dispatch_batched(
        &self,
        frames: &[Frame],
        size: usize,
        job: &mut PipelineJob,
    ) -> Result<(), PipelineError> {
        for (batch, chunk) in frames.chunks(size).enumerate() {
            let batch = batch + 1;
            tracing::debug!("Dispatching batch {} of {} frames", batch, chunk.len());

            let outcomes = join_all(chunk.iter().map(|frame| async move {
                (frame.index, self.detector.detect(frame).await)
            }))
            .await;

            let mut first_failure = None;
            for (index, outcome) in outcomes {
                match outcome {
                    Ok(result) => job.record(index, Ok(result))?,
                    Err(e) => {
                        tracing::error!("Frame {} failed in batch {}: {}", index, batch, e);
                        job.record(index, Err(e.to_string()))?;
                        first_failure.get_or_insert((index, e));
                    }
                }
            }

            if let Some((frame, source)) = first_failure {
                return Err(PipelineError::BatchFailed {
                    batch,
                    frame,
                    progress: job.progress(),
                    source,
                });
            }
            tracing::info!("Batch {} done, progress {}", batch, job.progress());
        }
        Ok(())
    }

    /// Output frame `k` comes from slot `k`, whatever order results arrived in.
    pub fn reassemble(
        &self,
        frames: &[Frame],
        job: &PipelineJob,
    ) -> Result<Vec<OutputFrame>, PipelineError> {
        check_numbering(frames)?;

        job.slots()
            .map(|(index, slot)| -> Result<OutputFrame, PipelineError> {
                let annotated = match slot {
                    SlotState::Completed(result) => result.annotated_payload.clone(),
                    _ => None,
                };

                let image = match annotated {
                    Some(image) => image,
                    None if self.fallback_to_source => {
                        let source = frames
                            .get(index as usize - 1)
                            .ok_or(PipelineError::MissingAnnotation(index))?;
                        tracing::warn!("Frame {} has no annotation, using source image", index);
                        source.raw_bytes()?
                    }
                    None => return Err(PipelineError::MissingAnnotation(index)),
                };

                Ok(OutputFrame { index, image })
            })
            .collect()
    }

    /// Encodes the output video, or returns `None` when there is nothing to encode.
    #[instrument(skip(self, frames, options), fields(frames = frames.len()))]
    pub async fn encode(
        &self,
        frames: &[OutputFrame],
        options: &EncodeOptions,
    ) -> Result<Option<Vec<u8>>, PipelineError> {
        if frames.is_empty() {
            tracing::info!("No frames, skipping encoding");
            return Ok(None);
        }
        Ok(Some(self.codec.encode_frames(frames, options).await?))
    }
}

fn check_numbering(frames: &[Frame]) -> Result<(), PipelineError> {
    for (position, frame) in frames.iter().enumerate() {
        let expected = position as u32 + 1;
        if frame.index != expected {
            return Err(PipelineError::NonContiguous {
                expected,
                found: frame.index,
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{DetectionResult, DetectionStatus};
    use async_trait::async_trait;
    use bytes::Bytes;
    use chrono::Utc;
    use std::sync::Mutex;
    use std::time::Instant;

    #[derive(Debug, Clone, PartialEq)]
    enum Event {
        Start(u32),
        End(u32),
    }

    #[derive(Default)]
    struct MockDetector {
        drop_frame: Option<u32>,
        refuse_frame: Option<u32>,
        reject_frame: Option<u32>,
        skip_annotation: Option<u32>,
        events: Mutex<Vec<Event>>,
    }

    #[async_trait]
    impl FrameDetector for MockDetector {
        async fn detect(&self, frame: &Frame) -> Result<DetectionResult, ClientError> {
            self.events.lock().unwrap().push(Event::Start(frame.index));
            // Later frames answer first.
            tokio::time::sleep(Duration::from_millis(5 * (10 - frame.index as u64 % 10))).await;
            self.events.lock().unwrap().push(Event::End(frame.index));

            if self.drop_frame == Some(frame.index) {
                return Err(ClientError::ConnectionEnded { received: 0 });
            }
            if self.refuse_frame == Some(frame.index) {
                return Err(ClientError::Transport(std::io::Error::new(
                    std::io::ErrorKind::ConnectionRefused,
                    "service unavailable",
                )));
            }

            let rejected = self.reject_frame == Some(frame.index);
            Ok(DetectionResult {
                status: if rejected {
                    DetectionStatus::Error
                } else {
                    DetectionStatus::Success
                },
                object_count: 0,
                predictions: vec![],
                annotated_payload: (!rejected && self.skip_annotation != Some(frame.index))
                    .then(|| Bytes::from(format!("annotated-{}", frame.index))),
                responded_at: Utc::now(),
                error_message: rejected.then(|| "Image decoding error".to_string()),
            })
        }
    }

    #[derive(Default)]
    struct MockCodec {
        extracted: Vec<Bytes>,
        encoded: Mutex<Vec<OutputFrame>>,
    }

    #[async_trait]
    impl FrameCodec for MockCodec {
        async fn extract_frames(&self, _video: &Path) -> Result<Vec<Bytes>, CodecError> {
            Ok(self.extracted.clone())
        }

        async fn encode_frames(
            &self,
            frames: &[OutputFrame],
            _options: &EncodeOptions,
        ) -> Result<Vec<u8>, CodecError> {
            *self.encoded.lock().unwrap() = frames.to_vec();
            Ok(b"video".to_vec())
        }
    }

    fn frames(count: u32) -> Vec<Frame> {
        (1..=count)
            .map(|i| Frame::from_image(i, format!("source-{}", i).into_bytes(), "jpg"))
            .collect()
    }

    fn orchestrator(detector: MockDetector, policy: DispatchPolicy) -> Orchestrator<MockDetector, MockCodec> {
        Orchestrator::new(detector, MockCodec::default(), policy)
    }

    #[tokio::test]
    async fn test_batched_output_follows_source_order() {
        let orchestrator = orchestrator(MockDetector::default(), DispatchPolicy::Batched { size: 3 });
        let frames = frames(7);

        let job = orchestrator.dispatch(&frames).await.unwrap();
        assert!(job.is_done());
        assert_eq!(job.progress().succeeded, 7);

        let output = orchestrator.reassemble(&frames, &job).unwrap();
        for (position, frame) in output.iter().enumerate() {
            assert_eq!(frame.index, position as u32 + 1);
            assert_eq!(frame.image, Bytes::from(format!("annotated-{}", frame.index)));
        }

        // Within a batch later frames finish first.
        let events = orchestrator.detector.events.lock().unwrap().clone();
        let ends: Vec<u32> = events
            .iter()
            .filter_map(|e| match e {
                Event::End(i) => Some(*i),
                _ => None,
            })
            .collect();
        assert_eq!(ends[..3], [3, 2, 1]);
    }

    #[tokio::test]
    async fn test_batches_do_not_overlap() {
        let orchestrator = orchestrator(MockDetector::default(), DispatchPolicy::Batched { size: 2 });
        orchestrator.dispatch(&frames(5)).await.unwrap();

        let events = orchestrator.detector.events.lock().unwrap().clone();
        for (position, event) in events.iter().enumerate() {
            if let Event::Start(index) = event {
                let batch_start = (index - 1) / 2 * 2 + 1;
                for earlier in 1..batch_start {
                    let end = events.iter().position(|e| *e == Event::End(earlier)).unwrap();
                    assert!(end < position, "frame {} started before {} ended", index, earlier);
                }
            }
        }
    }

    #[tokio::test]
    async fn test_sequential_continues_after_failure() {
        let detector = MockDetector {
            drop_frame: Some(2),
            ..MockDetector::default()
        };
        let delay = Duration::from_millis(20);
        let orchestrator = orchestrator(detector, DispatchPolicy::Sequential { delay });

        let started = Instant::now();
        let job = orchestrator.dispatch(&frames(3)).await.unwrap();
        assert!(started.elapsed() >= delay * 2);

        assert!(job.slot(1).unwrap().is_success());
        assert!(matches!(job.slot(2), Some(SlotState::Failed(_))));
        assert!(job.slot(3).unwrap().is_success());
        assert_eq!(job.progress().to_string(), "2/3");

        let events = orchestrator.detector.events.lock().unwrap().clone();
        assert_eq!(
            events,
            vec![
                Event::Start(1),
                Event::End(1),
                Event::Start(2),
                Event::End(2),
                Event::Start(3),
                Event::End(3)
            ]
        );
    }

    #[tokio::test]
    async fn test_sequential_records_transport_failure() {
        let detector = MockDetector {
            refuse_frame: Some(1),
            ..MockDetector::default()
        };
        let orchestrator = orchestrator(
            detector,
            DispatchPolicy::Sequential {
                delay: Duration::from_millis(1),
            },
        );

        let job = orchestrator.dispatch(&frames(2)).await.unwrap();

        match job.slot(1) {
            Some(SlotState::Failed(message)) => {
                assert!(message.starts_with("Socket I/O failed"));
                assert!(message.contains("service unavailable"));
            }
            other => panic!("unexpected slot {:?}", other),
        }
        assert!(job.slot(2).unwrap().is_success());
        assert_eq!(job.progress().to_string(), "1/2");
    }

    #[tokio::test]
    async fn test_batch_transport_failure_aborts_job() {
        let detector = MockDetector {
            refuse_frame: Some(3),
            ..MockDetector::default()
        };
        let orchestrator = orchestrator(detector, DispatchPolicy::Batched { size: 2 });

        match orchestrator.dispatch(&frames(4)).await.unwrap_err() {
            PipelineError::BatchFailed {
                batch,
                frame,
                source,
                ..
            } => {
                assert_eq!((batch, frame), (2, 3));
                assert_eq!(source.kind(), detection_proto::ErrorKind::Transport);
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_batch_failure_aborts_job() {
        let detector = MockDetector {
            drop_frame: Some(2),
            ..MockDetector::default()
        };
        let orchestrator = orchestrator(detector, DispatchPolicy::Batched { size: 2 });

        let err = orchestrator.dispatch(&frames(6)).await.unwrap_err();
        match err {
            PipelineError::BatchFailed {
                batch,
                frame,
                progress,
                ..
            } => {
                assert_eq!(batch, 1);
                assert_eq!(frame, 2);
                assert_eq!(progress.succeeded, 1);
                assert_eq!(progress.failed, 1);
            }
            other => panic!("unexpected error {:?}", other),
        }

        let events = orchestrator.detector.events.lock().unwrap().clone();
        assert!(!events.contains(&Event::Start(3)));
    }

    #[tokio::test]
    async fn test_service_error_is_not_an_abort() {
        let detector = MockDetector {
            reject_frame: Some(1),
            ..MockDetector::default()
        };
        let orchestrator = orchestrator(detector, DispatchPolicy::Batched { size: 2 });

        let frames = frames(3);
        let job = orchestrator.dispatch(&frames).await.unwrap();
        assert_eq!(job.progress().succeeded, 2);
        assert_eq!(job.progress().failed, 1);

        let output = orchestrator.reassemble(&frames, &job).unwrap();
        assert_eq!(output[0].image, Bytes::from("source-1"));
    }

    #[tokio::test]
    async fn test_missing_annotation_without_fallback() {
        let detector = MockDetector {
            skip_annotation: Some(2),
            ..MockDetector::default()
        };
        let orchestrator = orchestrator(detector, DispatchPolicy::default())
            .with_fallback_to_source(false);

        let frames = frames(3);
        let job = orchestrator.dispatch(&frames).await.unwrap();
        assert!(matches!(
            orchestrator.reassemble(&frames, &job),
            Err(PipelineError::MissingAnnotation(2))
        ));
    }

    #[tokio::test]
    async fn test_zero_frames() {
        let orchestrator = orchestrator(MockDetector::default(), DispatchPolicy::default());

        let frames = orchestrator.extract(Path::new("empty.mp4")).await.unwrap();
        let job = orchestrator.dispatch(&frames).await.unwrap();
        let progress = job.progress();
        assert_eq!((progress.succeeded, progress.failed, progress.total), (0, 0, 0));
        assert!(job.is_done());

        let output = orchestrator.reassemble(&frames, &job).unwrap();
        let video = orchestrator
            .encode(&output, &EncodeOptions::default())
            .await
            .unwrap();
        assert!(video.is_none());
    }

    #[tokio::test]
    async fn test_extract_and_encode() {
        let codec = MockCodec {
            extracted: vec![Bytes::from_static(b"a"), Bytes::from_static(b"b")],
            ..MockCodec::default()
        };
        let orchestrator = Orchestrator::new(MockDetector::default(), codec, DispatchPolicy::default());

        let frames = orchestrator.extract(Path::new("in.mp4")).await.unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[1].index, 2);
        assert_eq!(frames[1].source_name, "frame_00002.jpg");

        let job = orchestrator.dispatch(&frames).await.unwrap();
        let output = orchestrator.reassemble(&frames, &job).unwrap();
        let video = orchestrator
            .encode(&output, &EncodeOptions::default())
            .await
            .unwrap();

        assert_eq!(video.as_deref(), Some(&b"video"[..]));
        assert_eq!(*orchestrator.codec.encoded.lock().unwrap(), output);
    }

    #[tokio::test]
    async fn test_misnumbered_frames_are_rejected() {
        let orchestrator = orchestrator(MockDetector::default(), DispatchPolicy::default());
        let frames = vec![Frame::from_image(2, vec![1], "jpg")];

        assert!(matches!(
            orchestrator.dispatch(&frames).await,
            Err(PipelineError::NonContiguous {
                expected: 1,
                found: 2
            })
        ));
    }
}
