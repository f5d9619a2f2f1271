//! Durable one-JSON-file-per-frame storage used between pipeline stages.
//!
//! Source frames are stored as `frame_NNNNN.json`. Once a frame has been
//! through detection it is stored again with the outcome attached, as
//! `frame_NNNNN_detected.json` or `frame_NNNNN_error.json`.

use crate::codec::OutputFrame;
use crate::frame::{DetectionResult, Frame, FrameEncoding};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use detection_proto::Prediction;
use serde::{Deserialize, Serialize};
use std::{
    io,
    path::{Path, PathBuf},
};
use thiserror::Error;
use tokio::fs;

const FILE_PREFIX: &str = "frame_";

#[derive(Error, Debug)]
pub enum ArchiveError {
    #[error("Archive I/O failed for {path:?}: {source}")]
    Io { path: PathBuf, source: io::Error },
    #[error("Malformed archive file {path:?}: {source}")]
    Json {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("Frame {frame} image data is not valid base64: {source}")]
    ImageData {
        frame: u32,
        source: base64::DecodeError,
    },
    #[error("Frame {frame} declares {declared} bytes but holds {actual}")]
    SizeMismatch {
        frame: u32,
        declared: usize,
        actual: usize,
    },
    #[error("Archive frames are not contiguous: expected frame {expected}, found {found}")]
    NonContiguous { expected: u32, found: u32 },
    #[error("Frame {0} has no annotated image")]
    MissingAnnotation(u32),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArchivedFrame {
    pub frame_number: u32,
    pub original_file_name: String,
    pub timestamp: DateTime<Utc>,
    pub format: String,
    pub size: usize,
    pub image_data: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detection: Option<ArchivedDetection>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotated_image_data: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ArchivedDetection {
    Completed {
        timestamp: DateTime<Utc>,
        objects: usize,
        predictions: Vec<Prediction>,
        /// Milliseconds between capture and the service's response.
        #[serde(rename = "processingTime")]
        processing_time: i64,
    },
    Failed {
        timestamp: DateTime<Utc>,
        status: String,
        error: String,
    },
}

impl ArchivedFrame {
    pub fn from_frame(frame: &Frame) -> Self {
        Self {
            frame_number: frame.index,
            original_file_name: frame.source_name.clone(),
            timestamp: frame.captured_at,
            format: frame.format.clone(),
            size: frame.size_bytes,
            image_data: frame.to_base64(),
            detection: None,
            annotated_image_data: None,
        }
    }

    pub fn to_frame(&self) -> Result<Frame, ArchiveError> {
        let image = STANDARD
            .decode(&self.image_data)
            .map_err(|source| ArchiveError::ImageData {
                frame: self.frame_number,
                source,
            })?;

        if image.len() != self.size {
            return Err(ArchiveError::SizeMismatch {
                frame: self.frame_number,
                declared: self.size,
                actual: image.len(),
            });
        }

        Ok(Frame {
            index: self.frame_number,
            source_name: self.original_file_name.clone(),
            format: self.format.clone(),
            size_bytes: image.len(),
            payload: Bytes::from(image),
            encoding: FrameEncoding::Raw,
            captured_at: self.timestamp,
        })
    }

    /// Attaches a completed detection. Service-reported failures are stored
    /// the same way as transport failures.
    pub fn with_result(mut self, result: &DetectionResult) -> Self {
        if !result.is_success() {
            let message = result
                .error_message
                .clone()
                .unwrap_or_else(|| "unknown error".to_string());
            return self.with_failure(result.responded_at, message);
        }

        self.detection = Some(ArchivedDetection::Completed {
            timestamp: result.responded_at,
            objects: result.object_count,
            predictions: result.predictions.clone(),
            processing_time: (result.responded_at - self.timestamp).num_milliseconds(),
        });
        self.annotated_image_data = result
            .annotated_payload
            .as_ref()
            .map(|image| STANDARD.encode(image));
        self
    }

    pub fn with_failure(mut self, at: DateTime<Utc>, error: impl Into<String>) -> Self {
        self.detection = Some(ArchivedDetection::Failed {
            timestamp: at,
            status: "error".to_string(),
            error: error.into(),
        });
        self.annotated_image_data = None;
        self
    }

    pub fn file_name(&self) -> String {
        let suffix = match self.detection {
            None => "",
            Some(ArchivedDetection::Completed { .. }) => "_detected",
            Some(ArchivedDetection::Failed { .. }) => "_error",
        };
        format!("{}{:05}{}.json", FILE_PREFIX, self.frame_number, suffix)
    }

    /// The image this frame contributes to the output video: the annotated
    /// image when there is one, otherwise the source image if allowed.
    pub fn to_output_frame(&self, fallback_to_source: bool) -> Result<OutputFrame, ArchiveError> {
        let image = match &self.annotated_image_data {
            Some(annotated) => Bytes::from(STANDARD.decode(annotated).map_err(|source| {
                ArchiveError::ImageData {
                    frame: self.frame_number,
                    source,
                }
            })?),
            None if fallback_to_source => {
                tracing::warn!(
                    "Frame {} has no annotation, using source image",
                    self.frame_number
                );
                self.to_frame()?.payload
            }
            None => return Err(ArchiveError::MissingAnnotation(self.frame_number)),
        };

        Ok(OutputFrame {
            index: self.frame_number,
            image,
        })
    }
}

/// Frame number encoded in an archive file name, e.g. `frame_00042_detected.json`.
pub fn parse_frame_number(file_name: &str) -> Option<u32> {
    let rest = file_name.strip_prefix(FILE_PREFIX)?;
    if !rest.ends_with(".json") {
        return None;
    }
    let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
    digits.parse().ok()
}

fn is_processed_entry(file_name: &str) -> bool {
    file_name.ends_with("_detected.json") || file_name.ends_with("_error.json")
}

fn is_source_entry(file_name: &str) -> bool {
    file_name
        .strip_prefix(FILE_PREFIX)
        .and_then(|rest| rest.strip_suffix(".json"))
        .is_some_and(|digits| !digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit()))
}

#[derive(Debug, Clone)]
pub struct FrameArchive {
    dir: PathBuf,
}

impl FrameArchive {
    pub async fn create(dir: impl Into<PathBuf>) -> Result<Self, ArchiveError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .await
            .map_err(|source| ArchiveError::Io {
                path: dir.clone(),
                source,
            })?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub async fn write(&self, frame: &ArchivedFrame) -> Result<PathBuf, ArchiveError> {
        let path = self.dir.join(frame.file_name());
        let json = serde_json::to_vec_pretty(frame).map_err(|source| ArchiveError::Json {
            path: path.clone(),
            source,
        })?;
        fs::write(&path, json)
            .await
            .map_err(|source| ArchiveError::Io {
                path: path.clone(),
                source,
            })?;
        Ok(path)
    }

    pub async fn read(path: &Path) -> Result<ArchivedFrame, ArchiveError> {
        let bytes = fs::read(path).await.map_err(|source| ArchiveError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_slice(&bytes).map_err(|source| ArchiveError::Json {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Every archive file in the directory, ordered by frame number.
    pub async fn entries(&self) -> Result<Vec<PathBuf>, ArchiveError> {
        let io_err = |source| ArchiveError::Io {
            path: self.dir.clone(),
            source,
        };
        let mut read_dir = fs::read_dir(&self.dir).await.map_err(io_err)?;
        let mut entries = Vec::new();

        while let Some(entry) = read_dir.next_entry().await.map_err(io_err)? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if let Some(number) = parse_frame_number(&name) {
                entries.push((number, name, entry.path()));
            }
        }

        entries.sort();
        Ok(entries.into_iter().map(|(_, _, path)| path).collect())
    }

    /// Reads the entries whose file name passes `select`. Their frame numbers
    /// must run 1..N without gaps or repeats.
    async fn load_contiguous(
        &self,
        select: fn(&str) -> bool,
    ) -> Result<Vec<ArchivedFrame>, ArchiveError> {
        let mut loaded = Vec::new();

        for path in self.entries().await? {
            let selected = path
                .file_name()
                .map(|name| select(&name.to_string_lossy()))
                .unwrap_or(false);
            if !selected {
                continue;
            }

            let archived = Self::read(&path).await?;
            let expected = loaded.len() as u32 + 1;
            if archived.frame_number != expected {
                return Err(ArchiveError::NonContiguous {
                    expected,
                    found: archived.frame_number,
                });
            }
            loaded.push(archived);
        }

        Ok(loaded)
    }

    /// Loads the source frames, which must be numbered 1..N without gaps.
    pub async fn load_frames(&self) -> Result<Vec<Frame>, ArchiveError> {
        let frames = self
            .load_contiguous(is_source_entry)
            .await?
            .iter()
            .map(ArchivedFrame::to_frame)
            .collect::<Result<Vec<_>, _>>()?;

        tracing::debug!("Loaded {} frames from {:?}", frames.len(), self.dir);
        Ok(frames)
    }

    /// Loads the `_detected` / `_error` entries as output frames, in frame
    /// order. Entries without an annotation use their source image when
    /// `fallback_to_source` is set.
    pub async fn load_output_frames(
        &self,
        fallback_to_source: bool,
    ) -> Result<Vec<OutputFrame>, ArchiveError> {
        let output = self
            .load_contiguous(is_processed_entry)
            .await?
            .iter()
            .map(|archived| archived.to_output_frame(fallback_to_source))
            .collect::<Result<Vec<_>, _>>()?;

        tracing::debug!("Loaded {} output frames from {:?}", output.len(), self.dir);
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::DetectionStatus;
    use chrono::Duration;

    fn frame(index: u32) -> Frame {
        Frame::from_image(index, vec![index as u8, 0xd8, 0xff, 0x00, 0x10], "jpg")
    }

    fn success(at: DateTime<Utc>) -> DetectionResult {
        DetectionResult {
            status: DetectionStatus::Success,
            object_count: 1,
            predictions: vec![Prediction::new("cat", 0.91, [1.0, 2.0, 3.0, 4.0])],
            annotated_payload: Some(Bytes::from_static(b"annotated")),
            responded_at: at,
            error_message: None,
        }
    }

    #[test]
    fn test_archive_round_trip_preserves_payload() {
        let original = frame(3);
        let restored = ArchivedFrame::from_frame(&original).to_frame().unwrap();

        assert_eq!(restored.raw_bytes().unwrap(), original.raw_bytes().unwrap());
        assert_eq!(restored.index, 3);
        assert_eq!(restored.source_name, "frame_00003.jpg");
    }

    #[test]
    fn test_wire_field_names() {
        let value = serde_json::to_value(ArchivedFrame::from_frame(&frame(1))).unwrap();
        for key in [
            "frameNumber",
            "originalFileName",
            "timestamp",
            "format",
            "size",
            "imageData",
        ] {
            assert!(value.get(key).is_some(), "missing {}", key);
        }
        assert!(value.get("detection").is_none());
    }

    #[test]
    fn test_size_mismatch_is_rejected() {
        let mut archived = ArchivedFrame::from_frame(&frame(1));
        archived.size += 1;
        assert!(matches!(
            archived.to_frame(),
            Err(ArchiveError::SizeMismatch { .. })
        ));
    }

    #[test]
    fn test_with_result_records_detection() {
        let archived = ArchivedFrame::from_frame(&frame(2));
        let responded_at = archived.timestamp + Duration::milliseconds(250);
        let archived = archived.with_result(&success(responded_at));

        assert_eq!(archived.file_name(), "frame_00002_detected.json");
        assert_eq!(
            archived.annotated_image_data.as_deref(),
            Some(STANDARD.encode(b"annotated").as_str())
        );
        match archived.detection {
            Some(ArchivedDetection::Completed {
                objects,
                processing_time,
                ..
            }) => {
                assert_eq!(objects, 1);
                assert_eq!(processing_time, 250);
            }
            other => panic!("unexpected detection {:?}", other),
        }
    }

    #[test]
    fn test_error_result_is_archived_as_failure() {
        let result = DetectionResult {
            status: DetectionStatus::Error,
            object_count: 0,
            predictions: vec![],
            annotated_payload: None,
            responded_at: Utc::now(),
            error_message: Some("decode failed".to_string()),
        };
        let archived = ArchivedFrame::from_frame(&frame(4)).with_result(&result);

        assert_eq!(archived.file_name(), "frame_00004_error.json");
        let value = serde_json::to_value(&archived).unwrap();
        assert_eq!(value["detection"]["status"], "error");
        assert_eq!(value["detection"]["error"], "decode failed");
    }

    #[test]
    fn test_parse_frame_number() {
        assert_eq!(parse_frame_number("frame_00042.json"), Some(42));
        assert_eq!(parse_frame_number("frame_00042_detected.json"), Some(42));
        assert_eq!(parse_frame_number("frame_00042.jpg"), None);
        assert_eq!(parse_frame_number("other_00042.json"), None);
        assert!(is_source_entry("frame_00042.json"));
        assert!(!is_source_entry("frame_00042_error.json"));
    }

    #[tokio::test]
    async fn test_write_and_load_frames() {
        let dir = tempfile::tempdir().unwrap();
        let archive = FrameArchive::create(dir.path().join("frames")).await.unwrap();

        for index in [2, 1, 3] {
            archive
                .write(&ArchivedFrame::from_frame(&frame(index)))
                .await
                .unwrap();
        }
        let processed = ArchivedFrame::from_frame(&frame(1)).with_failure(Utc::now(), "boom");
        archive.write(&processed).await.unwrap();

        let frames = archive.load_frames().await.unwrap();
        let indices: Vec<u32> = frames.iter().map(|f| f.index).collect();
        assert_eq!(indices, vec![1, 2, 3]);
        assert_eq!(archive.entries().await.unwrap().len(), 4);

        let restored = FrameArchive::read(&archive.dir().join("frame_00001_error.json"))
            .await
            .unwrap();
        assert_eq!(restored, processed);
    }

    #[tokio::test]
    async fn test_gap_in_archive_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let archive = FrameArchive::create(dir.path()).await.unwrap();
        for index in [1, 3] {
            archive
                .write(&ArchivedFrame::from_frame(&frame(index)))
                .await
                .unwrap();
        }

        assert!(matches!(
            archive.load_frames().await,
            Err(ArchiveError::NonContiguous {
                expected: 2,
                found: 3
            })
        ));
    }

    #[tokio::test]
    async fn test_load_output_frames_prefers_annotation() {
        let dir = tempfile::tempdir().unwrap();
        let archive = FrameArchive::create(dir.path()).await.unwrap();

        let detected = ArchivedFrame::from_frame(&frame(1)).with_result(&success(Utc::now()));
        let failed = ArchivedFrame::from_frame(&frame(2)).with_failure(Utc::now(), "refused");
        for archived in [failed, detected] {
            archive.write(&archived).await.unwrap();
        }
        // Source entries are not part of the output.
        archive
            .write(&ArchivedFrame::from_frame(&frame(3)))
            .await
            .unwrap();

        let output = archive.load_output_frames(true).await.unwrap();
        assert_eq!(
            output,
            vec![
                OutputFrame {
                    index: 1,
                    image: Bytes::from_static(b"annotated"),
                },
                OutputFrame {
                    index: 2,
                    image: frame(2).payload,
                },
            ]
        );

        assert!(matches!(
            archive.load_output_frames(false).await,
            Err(ArchiveError::MissingAnnotation(2))
        ));
    }

    #[tokio::test]
    async fn test_repeated_output_entry_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let archive = FrameArchive::create(dir.path()).await.unwrap();
        let detected = ArchivedFrame::from_frame(&frame(1)).with_result(&success(Utc::now()));
        let failed = ArchivedFrame::from_frame(&frame(1)).with_failure(Utc::now(), "boom");
        archive.write(&detected).await.unwrap();
        archive.write(&failed).await.unwrap();

        assert!(matches!(
            archive.load_output_frames(true).await,
            Err(ArchiveError::NonContiguous {
                expected: 2,
                found: 1
            })
        ));
    }
}
