pub mod app;
pub mod archive;
pub mod client;
pub mod codec;
pub mod config;
pub mod frame;
pub mod job;
pub mod orchestrator;

pub use app::start_app;
pub use client::{ClientError, DetectionClient, FrameDetector};
pub use frame::{DetectionResult, DetectionStatus, Frame};
pub use job::{PipelineJob, Progress, SlotState};
pub use orchestrator::{DispatchPolicy, Orchestrator, PipelineError};
