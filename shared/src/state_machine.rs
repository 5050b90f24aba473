//! Job target state machine
//!
//! A target moves through the ordered steps of a job. Its persisted progress is
//! the step it was last presented to plus the outcome at that step, which is
//! enough to resume after a stop or a crash.

use serde::{Deserialize, Serialize};

/// Per-target status within the step it was last presented to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TargetStatus {
    /// Waiting to be presented to its current step
    InQueue,
    /// Current step succeeded
    ProcessOk,
    /// Current step failed; no later step will run for this target
    ProcessFailed,
    /// Current step asked to be presented again on a later pass
    ProcessAgain,
}

/// What a target processor reported for one presentation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    Ok,
    Again,
    Failed { reason: String },
}

/// Result of applying an outcome to a target's progress
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransitionResult {
    Moved { from: TargetStatus, to: TargetStatus },
    /// The target was not pending for the step it was reported against
    NotPending { step_index: u32, status: TargetStatus },
}

/// Persisted progress of one target through a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetProgress {
    pub step_index: u32,
    pub status: TargetStatus,
}

impl TargetProgress {
    pub fn queued(step_index: u32) -> Self {
        Self {
            step_index,
            status: TargetStatus::InQueue,
        }
    }

    /// Step this target runs next, or None once it is done with the job
    pub fn next_step(&self, step_count: u32) -> Option<u32> {
        let next = match self.status {
            TargetStatus::InQueue | TargetStatus::ProcessAgain => self.step_index,
            TargetStatus::ProcessOk => self.step_index + 1,
            TargetStatus::ProcessFailed => return None,
        };
        (next < step_count).then_some(next)
    }

    pub fn is_pending_for(&self, step_index: u32, step_count: u32) -> bool {
        self.next_step(step_count) == Some(step_index)
    }

    pub fn is_terminal(&self, step_count: u32) -> bool {
        self.next_step(step_count).is_none()
    }

    /// Record the outcome of presenting this target to `step_index`
    pub fn apply(&mut self, step_index: u32, step_count: u32, outcome: &StepOutcome) -> TransitionResult {
        if !self.is_pending_for(step_index, step_count) {
            return TransitionResult::NotPending {
                step_index: self.step_index,
                status: self.status,
            };
        }

        let from = self.status;
        let to = match outcome {
            StepOutcome::Ok => TargetStatus::ProcessOk,
            StepOutcome::Again => TargetStatus::ProcessAgain,
            StepOutcome::Failed { .. } => TargetStatus::ProcessFailed,
        };
        self.step_index = step_index;
        self.status = to;
        TransitionResult::Moved { from, to }
    }
}

/// Whether a status change is allowed while a target sits on one step
pub fn is_valid_transition(from: TargetStatus, to: TargetStatus) -> bool {
    use TargetStatus::*;

    match (from, to) {
        (InQueue | ProcessAgain, ProcessOk | ProcessFailed | ProcessAgain) => true,
        // Reset for a fresh run or a restart from a chosen step
        (_, InQueue) => true,
        _ => false,
    }
}

/// First step that still has work, given every target's progress
pub fn resume_step<'a, I>(progress: I, step_count: u32) -> Option<u32>
where
    I: IntoIterator<Item = &'a TargetProgress>,
{
    progress
        .into_iter()
        .filter_map(|p| p.next_step(step_count))
        .min()
}
