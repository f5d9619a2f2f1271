//! Video to still-image conversion and back, via an external ffmpeg.

use crate::frame::numbered_image_name;
use async_trait::async_trait;
use bytes::Bytes;
use serde::Deserialize;
use std::{
    ffi::OsString,
    io,
    path::{Path, PathBuf},
    process::Stdio,
};
use tempfile::TempDir;
use thiserror::Error;
use tokio::{fs, process::Command};

const IMAGE_PATTERN: &str = "frame_%05d.jpg";
const OUTPUT_FILE: &str = "output.mp4";

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Input video not found: {0:?}")]
    VideoNotFound(PathBuf),
    #[error("Failed to spawn {program:?}: {source}")]
    Spawn { program: PathBuf, source: io::Error },
    #[error("ffmpeg exited with {code:?}: {stderr}")]
    Failed { code: Option<i32>, stderr: String },
    #[error("ffmpeg produced no frames")]
    NoFrames,
    #[error("Frame images are not contiguous: expected {expected}, found {found}")]
    FrameOrder { expected: String, found: String },
    #[error("Codec I/O failed: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Quality {
    Low,
    Medium,
    #[default]
    High,
}

impl Quality {
    pub fn args(&self) -> [&'static str; 4] {
        match self {
            Quality::Low => ["-crf", "30", "-preset", "fast"],
            Quality::Medium => ["-crf", "23", "-preset", "medium"],
            Quality::High => ["-crf", "18", "-preset", "slow"],
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EncodeOptions {
    pub framerate: u32,
    pub quality: Quality,
    pub video_codec: String,
    /// Output size such as `1280x720`; source size when unset.
    pub resolution: Option<String>,
}

impl Default for EncodeOptions {
    fn default() -> Self {
        Self {
            framerate: 25,
            quality: Quality::High,
            video_codec: "libx264".to_string(),
            resolution: None,
        }
    }
}

/// An image destined for position `index` (1-based) of the output video.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputFrame {
    pub index: u32,
    pub image: Bytes,
}

#[async_trait]
pub trait FrameCodec: Send + Sync {
    /// JPEG stills of every frame of `video`, in source order.
    async fn extract_frames(&self, video: &Path) -> Result<Vec<Bytes>, CodecError>;

    /// Encodes frames, which must be numbered 1..N in order, into a video.
    async fn encode_frames(
        &self,
        frames: &[OutputFrame],
        options: &EncodeOptions,
    ) -> Result<Vec<u8>, CodecError>;
}

pub fn extraction_args(video: &Path, output_dir: &Path) -> Vec<OsString> {
    vec![
        "-i".into(),
        video.as_os_str().to_owned(),
        "-y".into(),
        "-q:v".into(),
        "2".into(),
        output_dir.join(IMAGE_PATTERN).into_os_string(),
    ]
}

pub fn encoding_args(input_dir: &Path, output: &Path, options: &EncodeOptions) -> Vec<OsString> {
    let mut args: Vec<OsString> = vec![
        "-y".into(),
        "-framerate".into(),
        options.framerate.to_string().into(),
        "-i".into(),
        input_dir.join(IMAGE_PATTERN).into_os_string(),
        "-c:v".into(),
        options.video_codec.clone().into(),
    ];
    args.extend(options.quality.args().into_iter().map(OsString::from));
    args.extend([OsString::from("-pix_fmt"), OsString::from("yuv420p")]);
    if let Some(resolution) = &options.resolution {
        args.extend([OsString::from("-s"), OsString::from(resolution)]);
    }
    args.push(output.as_os_str().to_owned());
    args
}

/// Checks that `names` (sorted) are exactly `frame_00001.jpg`, `frame_00002.jpg`, ...
pub fn check_frame_sequence(names: &[String]) -> Result<(), CodecError> {
    for (position, name) in names.iter().enumerate() {
        let expected = numbered_image_name(position as u32 + 1);
        if *name != expected {
            return Err(CodecError::FrameOrder {
                expected,
                found: name.clone(),
            });
        }
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct FfmpegCodec {
    ffmpeg_path: PathBuf,
}

impl FfmpegCodec {
    pub fn new(ffmpeg_path: impl Into<PathBuf>) -> Self {
        Self {
            ffmpeg_path: ffmpeg_path.into(),
        }
    }

    async fn run(&self, args: Vec<OsString>) -> Result<(), CodecError> {
        tracing::debug!("Running {:?} {:?}", self.ffmpeg_path, args);

        let child = Command::new(&self.ffmpeg_path)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| CodecError::Spawn {
                program: self.ffmpeg_path.clone(),
                source,
            })?;

        let output = child.wait_with_output().await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            tracing::error!("ffmpeg failed: {}", stderr);
            return Err(CodecError::Failed {
                code: output.status.code(),
                stderr,
            });
        }
        Ok(())
    }
}

#[async_trait]
impl FrameCodec for FfmpegCodec {
    async fn extract_frames(&self, video: &Path) -> Result<Vec<Bytes>, CodecError> {
        if !fs::try_exists(video).await? {
            return Err(CodecError::VideoNotFound(video.to_path_buf()));
        }

        let work_dir = TempDir::new()?;
        self.run(extraction_args(video, work_dir.path())).await?;

        let mut names = Vec::new();
        let mut entries = fs::read_dir(work_dir.path()).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.ends_with(".jpg") {
                names.push(name);
            }
        }
        if names.is_empty() {
            return Err(CodecError::NoFrames);
        }
        names.sort();
        check_frame_sequence(&names)?;

        let mut frames = Vec::with_capacity(names.len());
        for name in &names {
            frames.push(Bytes::from(fs::read(work_dir.path().join(name)).await?));
        }

        tracing::info!("Extracted {} frames from {:?}", frames.len(), video);
        Ok(frames)
    }

    async fn encode_frames(
        &self,
        frames: &[OutputFrame],
        options: &EncodeOptions,
    ) -> Result<Vec<u8>, CodecError> {
        if frames.is_empty() {
            return Err(CodecError::NoFrames);
        }

        let work_dir = TempDir::new()?;
        let mut names = Vec::with_capacity(frames.len());
        for frame in frames {
            let name = numbered_image_name(frame.index);
            fs::write(work_dir.path().join(&name), &frame.image).await?;
            names.push(name);
        }
        check_frame_sequence(&names)?;

        let output = work_dir.path().join(OUTPUT_FILE);
        self.run(encoding_args(work_dir.path(), &output, options))
            .await?;

        let video = fs::read(&output).await?;
        tracing::info!(
            "Encoded {} frames into {} bytes at {} fps",
            frames.len(),
            video.len(),
            options.framerate
        );
        Ok(video)
    }
}
