use thiserror::Error;
use uuid::Uuid;

use super::model::ExecutionStatus;
use crate::command::DispatchError;
use crate::events::EventStoreError;
use crate::store::StoreError;

/// Errors surfaced to callers of the job engine
#[derive(Error, Debug)]
pub enum JobEngineError {
    #[error("Job {job_id} not found in scope {tenant_id}")]
    JobNotFound { tenant_id: String, job_id: String },

    #[error("Job {job_id} is invalid: {reason}")]
    InvalidJob { job_id: String, reason: String },

    #[error("Step {step_index} of job {job_id} uses unknown processor '{processor}'")]
    UnknownProcessor {
        job_id: String,
        step_index: u32,
        processor: String,
    },

    #[error("Invalid start options for job {job_id}: {reason}")]
    InvalidStartOptions { job_id: String, reason: String },

    #[error("Job {job_id} is not running")]
    JobNotRunning { job_id: String },

    #[error("Job {job_id} is running")]
    JobRunning { job_id: String },

    #[error("Execution {execution_id} of job {job_id} not found")]
    ExecutionNotFound { job_id: String, execution_id: Uuid },

    #[error("Execution {execution_id} of job {job_id} cannot be resumed from {status:?}")]
    ExecutionNotResumable {
        job_id: String,
        execution_id: Uuid,
        status: ExecutionStatus,
    },

    #[error("Job storage error: {0}")]
    Store(#[from] StoreError),

    #[error(transparent)]
    Events(#[from] EventStoreError),
}

impl JobEngineError {
    pub fn http_status(&self) -> u16 {
        match self {
            JobEngineError::JobNotFound { .. } | JobEngineError::ExecutionNotFound { .. } => 404,
            JobEngineError::InvalidJob { .. }
            | JobEngineError::UnknownProcessor { .. }
            | JobEngineError::InvalidStartOptions { .. } => 400,
            JobEngineError::JobNotRunning { .. }
            | JobEngineError::JobRunning { .. }
            | JobEngineError::ExecutionNotResumable { .. } => 409,
            JobEngineError::Store(StoreError::Conflict { .. }) => 409,
            JobEngineError::Store(_) | JobEngineError::Events(_) => 500,
        }
    }

    /// Stable code clients can match on
    pub fn error_code(&self) -> &'static str {
        match self {
            JobEngineError::JobNotFound { .. } => "JOB_NOT_FOUND",
            JobEngineError::InvalidJob { .. } => "JOB_INVALID",
            JobEngineError::UnknownProcessor { .. } => "JOB_UNKNOWN_PROCESSOR",
            JobEngineError::InvalidStartOptions { .. } => "JOB_INVALID_START_OPTIONS",
            JobEngineError::JobNotRunning { .. } => "JOB_NOT_RUNNING",
            JobEngineError::JobRunning { .. } => "JOB_RUNNING",
            JobEngineError::ExecutionNotFound { .. } => "JOB_EXECUTION_NOT_FOUND",
            JobEngineError::ExecutionNotResumable { .. } => "JOB_EXECUTION_NOT_RESUMABLE",
            JobEngineError::Store(StoreError::Conflict { .. }) => "JOB_CONCURRENT_MODIFICATION",
            JobEngineError::Store(_) => "JOB_STORAGE_ERROR",
            JobEngineError::Events(_) => "JOB_EVENT_STORE_ERROR",
        }
    }
}

/// A target processor could not decide an outcome for one target
#[derive(Error, Debug)]
pub enum TargetProcessingError {
    #[error("Target {target_id}: {reason}")]
    Failed { target_id: String, reason: String },

    #[error("Target {target_id}: processor panicked")]
    Panicked { target_id: String },

    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error(transparent)]
    Store(#[from] StoreError),
}
