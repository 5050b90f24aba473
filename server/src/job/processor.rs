//! Per-target step processing
//!
//! A [`TargetProcessor`] decides the outcome of presenting one target to one
//! step. The [`TargetDriver`] wraps every call with failure and panic
//! isolation and applies the outcome to the target's progress, so a broken
//! target never takes its siblings down with it.

use async_trait::async_trait;
use devmgmt_shared::state_machine::{StepOutcome, TransitionResult};
use futures::FutureExt;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{debug, error, warn};
use uuid::Uuid;

use super::error::TargetProcessingError;
use super::model::{Job, JobStepDefinition, JobTarget};

/// The step a target is being presented to
#[derive(Debug, Clone)]
pub struct StepContext {
    pub job: Arc<Job>,
    pub step_index: u32,
    pub execution_id: Uuid,
}

impl StepContext {
    pub fn step(&self) -> &JobStepDefinition {
        &self.job.steps[self.step_index as usize]
    }

    pub fn step_count(&self) -> u32 {
        self.job.step_count()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetOutcome {
    pub outcome: StepOutcome,
    /// Device operation behind this outcome, if a call was made
    pub operation_id: Option<Uuid>,
}

impl TargetOutcome {
    pub fn ok(operation_id: Option<Uuid>) -> Self {
        Self {
            outcome: StepOutcome::Ok,
            operation_id,
        }
    }

    pub fn again(operation_id: Option<Uuid>) -> Self {
        Self {
            outcome: StepOutcome::Again,
            operation_id,
        }
    }

    pub fn failed(reason: impl Into<String>, operation_id: Option<Uuid>) -> Self {
        Self {
            outcome: StepOutcome::Failed {
                reason: reason.into(),
            },
            operation_id,
        }
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TargetProcessor: Send + Sync {
    async fn process_target(
        &self,
        ctx: &StepContext,
        target: &JobTarget,
    ) -> Result<TargetOutcome, TargetProcessingError>;
}

/// Target processors by the name job steps refer to them with
#[derive(Default, Clone)]
pub struct ProcessorRegistry {
    processors: HashMap<String, Arc<dyn TargetProcessor>>,
}

impl ProcessorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, processor: Arc<dyn TargetProcessor>) -> Self {
        self.processors.insert(name.into(), processor);
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn TargetProcessor>> {
        self.processors.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.processors.contains_key(name)
    }
}

/// Runs processors with isolation and applies their outcomes
#[derive(Debug, Clone, Copy)]
pub struct TargetDriver {
    max_again_passes: u32,
}

impl TargetDriver {
    pub fn new(max_again_passes: u32) -> Self {
        Self { max_again_passes }
    }

    /// Present `target` to the context's step and return it with its new progress
    pub async fn process(
        &self,
        processor: &dyn TargetProcessor,
        ctx: &StepContext,
        mut target: JobTarget,
    ) -> JobTarget {
        let result = AssertUnwindSafe(processor.process_target(ctx, &target))
            .catch_unwind()
            .await;

        let mut outcome = match result {
            Ok(Ok(outcome)) => {
                if outcome.operation_id.is_some() {
                    target.operation_id = outcome.operation_id;
                }
                outcome.outcome
            }
            Ok(Err(e)) => {
                warn!(target_id = %target.target_id, step = ctx.step_index, error = %e, "Target processing failed");
                StepOutcome::Failed {
                    reason: e.to_string(),
                }
            }
            Err(_) => {
                let e = TargetProcessingError::Panicked {
                    target_id: target.target_id.clone(),
                };
                error!(target_id = %target.target_id, step = ctx.step_index, "Target processor panicked");
                StepOutcome::Failed {
                    reason: e.to_string(),
                }
            }
        };

        match outcome {
            StepOutcome::Again => {
                target.again_passes += 1;
                if target.again_passes > self.max_again_passes {
                    outcome = StepOutcome::Failed {
                        reason: format!(
                            "still pending after {} passes on step {}",
                            self.max_again_passes, ctx.step_index
                        ),
                    };
                }
            }
            _ => target.again_passes = 0,
        }

        match &outcome {
            StepOutcome::Failed { reason } => target.last_exception = Some(reason.clone()),
            StepOutcome::Ok => target.last_exception = None,
            StepOutcome::Again => {}
        }

        match target.progress.apply(ctx.step_index, ctx.step_count(), &outcome) {
            TransitionResult::Moved { from, to } => {
                debug!(target_id = %target.target_id, step = ctx.step_index, ?from, ?to, "Target progressed");
            }
            TransitionResult::NotPending { step_index, status } => {
                warn!(
                    target_id = %target.target_id,
                    step = ctx.step_index,
                    current_step = step_index,
                    ?status,
                    "Outcome reported for a target not pending on this step"
                );
            }
        }
        target
    }
}
