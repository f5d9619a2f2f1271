use crate::frame::DetectionResult;
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum JobError {
    #[error("Frame {index} is outside the job (1..={total})")]
    OutOfRange { index: u32, total: usize },
    #[error("Frame {0} already has a result")]
    AlreadyWritten(u32),
}

#[derive(Debug, Clone, PartialEq)]
pub enum SlotState {
    Pending,
    Completed(DetectionResult),
    /// The attempt ended without a usable response.
    Failed(String),
}

impl SlotState {
    pub fn is_success(&self) -> bool {
        matches!(self, SlotState::Completed(result) if result.is_success())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    pub succeeded: usize,
    pub failed: usize,
    pub total: usize,
}

impl Progress {
    pub fn attempted(&self) -> usize {
        self.succeeded + self.failed
    }
}

impl fmt::Display for Progress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.succeeded, self.total)
    }
}

/// One slot per source frame, each written at most once.
///
/// Slots are addressed by the frame's 1-based index, so results land in source
/// order no matter when they arrive.
#[derive(Debug, Clone)]
pub struct PipelineJob {
    slots: Vec<SlotState>,
}

impl PipelineJob {
    pub fn new(total: usize) -> Self {
        Self {
            slots: vec![SlotState::Pending; total],
        }
    }

    pub fn total(&self) -> usize {
        self.slots.len()
    }

    pub fn record(
        &mut self,
        index: u32,
        outcome: Result<DetectionResult, String>,
    ) -> Result<(), JobError> {
        let total = self.slots.len();
        let slot = (index as usize)
            .checked_sub(1)
            .and_then(|position| self.slots.get_mut(position))
            .ok_or(JobError::OutOfRange { index, total })?;

        if *slot != SlotState::Pending {
            return Err(JobError::AlreadyWritten(index));
        }

        *slot = match outcome {
            Ok(result) => SlotState::Completed(result),
            Err(message) => SlotState::Failed(message),
        };
        Ok(())
    }

    pub fn slot(&self, index: u32) -> Option<&SlotState> {
        (index as usize)
            .checked_sub(1)
            .and_then(|position| self.slots.get(position))
    }

    pub fn slots(&self) -> impl Iterator<Item = (u32, &SlotState)> {
        self.slots
            .iter()
            .enumerate()
            .map(|(position, slot)| (position as u32 + 1, slot))
    }

    /// A service-reported error counts as failed, same as a lost connection.
    pub fn progress(&self) -> Progress {
        let succeeded = self.slots.iter().filter(|s| s.is_success()).count();
        let pending = self
            .slots
            .iter()
            .filter(|s| **s == SlotState::Pending)
            .count();

        Progress {
            succeeded,
            failed: self.slots.len() - succeeded - pending,
            total: self.slots.len(),
        }
    }

    pub fn is_done(&self) -> bool {
        self.slots.iter().all(|s| *s != SlotState::Pending)
    }
}
