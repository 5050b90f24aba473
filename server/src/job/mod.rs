//! Job engine
//!
//! This module handles:
//! - Job definitions, their targets and execution records
//! - Presenting targets to steps with failure isolation
//! - Starting, stopping, resuming and queuing executions

mod coordinator;
mod device_step;
mod error;
mod model;
mod processor;
mod repository;

pub use coordinator::{CoordinatorConfig, JobCoordinator, StartOutcome, JOB_ENTITY, JOB_EVENT_SOURCE};
pub use device_step::{DeviceCommandProcessor, DEVICE_COMMAND_PROCESSOR};
pub use error::{JobEngineError, TargetProcessingError};
pub use model::{
    ExecutionStatus, Job, JobStartOptions, JobStepDefinition, JobTarget, QueuedJobExecution,
    RequestTemplate,
};
pub use processor::{ProcessorRegistry, StepContext, TargetDriver, TargetOutcome, TargetProcessor};
pub use repository::{
    BeginOutcome, JobExecutionRepository, JobRepository, JobTargetRepository, ResumeOutcome,
};

#[cfg(test)]
pub use repository::{MockJobExecutionRepository, MockJobRepository, MockJobTargetRepository};
