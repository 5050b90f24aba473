use async_trait::async_trait;
use uuid::Uuid;

use super::model::{ExecutionStatus, Job, JobStartOptions, JobTarget, QueuedJobExecution};
use crate::store::StoreError;

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait JobRepository: Send + Sync {
    async fn find(&self, tenant_id: &str, job_id: &str) -> Result<Option<Job>, StoreError>;

    async fn save(&self, job: Job) -> Result<(), StoreError>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait JobTargetRepository: Send + Sync {
    async fn list(&self, tenant_id: &str, job_id: &str) -> Result<Vec<JobTarget>, StoreError>;

    /// Insert the targets that do not exist yet, returning how many were new
    async fn insert_missing(&self, targets: Vec<JobTarget>) -> Result<usize, StoreError>;

    /// Store `target` if its version is current; returns it with the new version
    async fn update(&self, target: JobTarget) -> Result<JobTarget, StoreError>;

    async fn delete_all(&self, tenant_id: &str, job_id: &str) -> Result<usize, StoreError>;
}

/// Result of asking to run a job
#[derive(Debug, Clone, PartialEq)]
pub enum BeginOutcome {
    Started(QueuedJobExecution),
    /// Another execution is running; this one waits behind it
    Queued(QueuedJobExecution),
    /// Another execution is running and queuing was not asked for
    AlreadyRunning(QueuedJobExecution),
}

/// Result of asking to resume a stopped execution
#[derive(Debug, Clone, PartialEq)]
pub enum ResumeOutcome {
    Resumed(QueuedJobExecution),
    /// This very execution is already running
    AlreadyRunning(QueuedJobExecution),
    /// A different execution of the job is running
    Busy(QueuedJobExecution),
    NotResumable(ExecutionStatus),
    NotFound,
}

/// Execution records. Operations that decide whether a job is running are
/// atomic, so at most one execution per job is ever RUNNING.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait JobExecutionRepository: Send + Sync {
    async fn try_begin(
        &self,
        tenant_id: &str,
        job_id: &str,
        options: JobStartOptions,
        owner_node: &str,
    ) -> Result<BeginOutcome, StoreError>;

    async fn try_resume(
        &self,
        tenant_id: &str,
        job_id: &str,
        execution_id: Uuid,
        owner_node: &str,
    ) -> Result<ResumeOutcome, StoreError>;

    /// Start the oldest QUEUED execution if nothing is running
    async fn promote_next(
        &self,
        tenant_id: &str,
        job_id: &str,
        owner_node: &str,
    ) -> Result<Option<QueuedJobExecution>, StoreError>;

    async fn find(
        &self,
        tenant_id: &str,
        job_id: &str,
        execution_id: Uuid,
    ) -> Result<Option<QueuedJobExecution>, StoreError>;

    async fn find_running(&self, tenant_id: &str, job_id: &str) -> Result<Option<QueuedJobExecution>, StoreError>;

    async fn list(&self, tenant_id: &str, job_id: &str) -> Result<Vec<QueuedJobExecution>, StoreError>;

    async fn list_running_owned_by(&self, owner_node: &str) -> Result<Vec<QueuedJobExecution>, StoreError>;

    /// Store `execution` if its version is current; returns it with the new version
    async fn update(&self, execution: QueuedJobExecution) -> Result<QueuedJobExecution, StoreError>;

    async fn delete_all(&self, tenant_id: &str, job_id: &str) -> Result<usize, StoreError>;
}
