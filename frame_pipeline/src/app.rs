use crate::archive::{ArchivedFrame, FrameArchive};
use crate::client::DetectionClient;
use crate::codec::{FfmpegCodec, OutputFrame};
use crate::config::Config;
use crate::frame::Frame;
use crate::job::{PipelineJob, Progress, SlotState};
use crate::orchestrator::Orchestrator;

use anyhow::Context;
use chrono::Utc;
use std::path::Path;

/// Runs one video through the detection service and writes the annotated video.
pub async fn start_app(config: Config) -> anyhow::Result<Progress> {
    let client = DetectionClient::new(&config.detection_service.socket_path);
    client
        .probe()
        .await
        .context("Detection service is not available")?;

    let codec = FfmpegCodec::new(&config.codec.ffmpeg_path);
    let orchestrator = Orchestrator::new(client, codec, config.dispatch.policy())
        .with_fallback_to_source(config.job.fallback_to_source);

    let extracted = orchestrator
        .extract(&config.job.input_video)
        .await
        .with_context(|| format!("Failed to extract frames from {:?}", config.job.input_video))?;

    let frames_archive = FrameArchive::create(config.job.frames_dir()).await?;
    for frame in &extracted {
        frames_archive
            .write(&ArchivedFrame::from_frame(frame))
            .await?;
    }
    let frames = frames_archive
        .load_frames()
        .await
        .context("Failed to load archived frames")?;
    tracing::info!(
        "Archived {} frames in {:?}",
        frames.len(),
        frames_archive.dir()
    );

    let job = orchestrator
        .dispatch(&frames)
        .await
        .context("Frame detection aborted")?;
    let output = archive_and_reload(
        &config.job.processed_dir(),
        &frames,
        &job,
        config.job.fallback_to_source,
    )
    .await?;

    match orchestrator
        .encode(&output, &config.codec.encode_options())
        .await
        .context("Failed to encode output video")?
    {
        Some(video) => {
            tokio::fs::write(&config.job.output_video, &video)
                .await
                .with_context(|| format!("Failed to write {:?}", config.job.output_video))?;
            tracing::info!(
                "Wrote {} bytes to {:?}",
                video.len(),
                config.job.output_video
            );
        }
        None => tracing::warn!("Input produced no frames, no video written"),
    }

    let progress = job.progress();
    tracing::info!(
        "Job complete: {} succeeded, {} failed",
        progress,
        progress.failed
    );
    Ok(progress)
}

/// Archives every frame with its outcome into a fresh `dir`, then reads the
/// output frames back from it in frame order.
async fn archive_and_reload(
    dir: &Path,
    frames: &[Frame],
    job: &PipelineJob,
    fallback_to_source: bool,
) -> anyhow::Result<Vec<OutputFrame>> {
    if tokio::fs::try_exists(dir).await? {
        tokio::fs::remove_dir_all(dir)
            .await
            .with_context(|| format!("Failed to clear {:?}", dir))?;
    }
    let archive = FrameArchive::create(dir).await?;
    archive_outcomes(&archive, frames, job).await?;

    let output = archive
        .load_output_frames(fallback_to_source)
        .await
        .context("Failed to read back processed frames")?;
    anyhow::ensure!(
        output.len() == job.total(),
        "Processed archive holds {} frames, job has {}",
        output.len(),
        job.total()
    );
    Ok(output)
}

async fn archive_outcomes(
    archive: &FrameArchive,
    frames: &[Frame],
    job: &PipelineJob,
) -> anyhow::Result<()> {
    for (frame, (_, slot)) in frames.iter().zip(job.slots()) {
        let archived = ArchivedFrame::from_frame(frame);
        let archived = match slot {
            SlotState::Pending => continue,
            SlotState::Completed(result) => archived.with_result(result),
            SlotState::Failed(message) => archived.with_failure(Utc::now(), message.clone()),
        };
        archive.write(&archived).await?;
    }
    Ok(())
}
