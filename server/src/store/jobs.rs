use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::StoreError;
use crate::job::{
    BeginOutcome, ExecutionStatus, Job, JobExecutionRepository, JobRepository, JobStartOptions, JobTarget,
    JobTargetRepository, QueuedJobExecution, ResumeOutcome,
};

type JobKey = (String, String);

fn job_key(tenant_id: &str, job_id: &str) -> JobKey {
    (tenant_id.to_string(), job_id.to_string())
}

pub struct InMemoryJobStore {
    jobs: Arc<RwLock<HashMap<JobKey, Job>>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self {
            jobs: Arc::new(RwLock::new(HashMap::new())),
        }
    }
}

impl Default for InMemoryJobStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobRepository for InMemoryJobStore {
    async fn find(&self, tenant_id: &str, job_id: &str) -> Result<Option<Job>, StoreError> {
        Ok(self.jobs.read().await.get(&job_key(tenant_id, job_id)).cloned())
    }

    async fn save(&self, job: Job) -> Result<(), StoreError> {
        let key = job_key(&job.tenant_id, &job.job_id);
        self.jobs.write().await.insert(key, job);
        Ok(())
    }
}

/// Targets grouped per job, kept in the order the job lists them
pub struct InMemoryJobTargetStore {
    targets: Arc<RwLock<HashMap<JobKey, Vec<JobTarget>>>>,
}

impl InMemoryJobTargetStore {
    pub fn new() -> Self {
        Self {
            targets: Arc::new(RwLock::new(HashMap::new())),
        }
    }
}

impl Default for InMemoryJobTargetStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobTargetRepository for InMemoryJobTargetStore {
    async fn list(&self, tenant_id: &str, job_id: &str) -> Result<Vec<JobTarget>, StoreError> {
        Ok(self
            .targets
            .read()
            .await
            .get(&job_key(tenant_id, job_id))
            .cloned()
            .unwrap_or_default())
    }

    async fn insert_missing(&self, targets: Vec<JobTarget>) -> Result<usize, StoreError> {
        let mut all = self.targets.write().await;
        let mut created = 0;
        for target in targets {
            let existing = all.entry(job_key(&target.tenant_id, &target.job_id)).or_default();
            if !existing.iter().any(|t| t.target_id == target.target_id) {
                existing.push(target);
                created += 1;
            }
        }
        Ok(created)
    }

    async fn update(&self, mut target: JobTarget) -> Result<JobTarget, StoreError> {
        let mut all = self.targets.write().await;
        let not_found = || StoreError::NotFound {
            entity: "job target",
            id: format!("{}/{}", target.job_id, target.target_id),
        };
        let stored = all
            .get_mut(&job_key(&target.tenant_id, &target.job_id))
            .and_then(|targets| targets.iter_mut().find(|t| t.target_id == target.target_id))
            .ok_or_else(not_found)?;

        if stored.version != target.version {
            return Err(StoreError::Conflict {
                entity: "job target",
                id: format!("{}/{}", target.job_id, target.target_id),
                expected: target.version,
                found: stored.version,
            });
        }
        target.version += 1;
        *stored = target.clone();
        Ok(target)
    }

    async fn delete_all(&self, tenant_id: &str, job_id: &str) -> Result<usize, StoreError> {
        Ok(self
            .targets
            .write()
            .await
            .remove(&job_key(tenant_id, job_id))
            .map_or(0, |targets| targets.len()))
    }
}

/// Execution records; every decision about RUNNING happens under one write lock
pub struct InMemoryJobExecutionStore {
    executions: Arc<RwLock<HashMap<JobKey, Vec<QueuedJobExecution>>>>,
}

impl InMemoryJobExecutionStore {
    pub fn new() -> Self {
        Self {
            executions: Arc::new(RwLock::new(HashMap::new())),
        }
    }
}

impl Default for InMemoryJobExecutionStore {
    fn default() -> Self {
        Self::new()
    }
}

fn running(executions: &[QueuedJobExecution]) -> Option<&QueuedJobExecution> {
    executions.iter().find(|e| e.status == ExecutionStatus::Running)
}

#[async_trait]
impl JobExecutionRepository for InMemoryJobExecutionStore {
    async fn try_begin(
        &self,
        tenant_id: &str,
        job_id: &str,
        options: JobStartOptions,
        owner_node: &str,
    ) -> Result<BeginOutcome, StoreError> {
        let mut all = self.executions.write().await;
        let executions = all.entry(job_key(tenant_id, job_id)).or_default();

        if let Some(current) = running(executions) {
            if !options.enqueue {
                return Ok(BeginOutcome::AlreadyRunning(current.clone()));
            }
            let queued = QueuedJobExecution::new(tenant_id, job_id, options, owner_node, ExecutionStatus::Queued);
            executions.push(queued.clone());
            return Ok(BeginOutcome::Queued(queued));
        }

        let started = QueuedJobExecution::new(tenant_id, job_id, options, owner_node, ExecutionStatus::Running);
        executions.push(started.clone());
        Ok(BeginOutcome::Started(started))
    }

    async fn try_resume(
        &self,
        tenant_id: &str,
        job_id: &str,
        execution_id: Uuid,
        owner_node: &str,
    ) -> Result<ResumeOutcome, StoreError> {
        let mut all = self.executions.write().await;
        let Some(executions) = all.get_mut(&job_key(tenant_id, job_id)) else {
            return Ok(ResumeOutcome::NotFound);
        };
        let Some(position) = executions.iter().position(|e| e.execution_id == execution_id) else {
            return Ok(ResumeOutcome::NotFound);
        };

        if let Some(current) = running(executions) {
            return Ok(if current.execution_id == execution_id {
                ResumeOutcome::AlreadyRunning(current.clone())
            } else {
                ResumeOutcome::Busy(current.clone())
            });
        }

        let execution = &mut executions[position];
        if execution.status != ExecutionStatus::Stopped {
            return Ok(ResumeOutcome::NotResumable(execution.status));
        }
        execution.status = ExecutionStatus::Running;
        execution.owner_node = owner_node.to_string();
        execution.started_on = Some(Utc::now());
        execution.ended_on = None;
        execution.version += 1;
        Ok(ResumeOutcome::Resumed(execution.clone()))
    }

    async fn promote_next(
        &self,
        tenant_id: &str,
        job_id: &str,
        owner_node: &str,
    ) -> Result<Option<QueuedJobExecution>, StoreError> {
        let mut all = self.executions.write().await;
        let Some(executions) = all.get_mut(&job_key(tenant_id, job_id)) else {
            return Ok(None);
        };
        if running(executions).is_some() {
            return Ok(None);
        }

        let Some(next) = executions
            .iter_mut()
            .filter(|e| e.status == ExecutionStatus::Queued)
            .min_by_key(|e| e.enqueued_on)
        else {
            return Ok(None);
        };
        next.status = ExecutionStatus::Running;
        next.owner_node = owner_node.to_string();
        next.started_on = Some(Utc::now());
        next.version += 1;
        Ok(Some(next.clone()))
    }

    async fn find(
        &self,
        tenant_id: &str,
        job_id: &str,
        execution_id: Uuid,
    ) -> Result<Option<QueuedJobExecution>, StoreError> {
        Ok(self
            .executions
            .read()
            .await
            .get(&job_key(tenant_id, job_id))
            .and_then(|executions| executions.iter().find(|e| e.execution_id == execution_id))
            .cloned())
    }

    async fn find_running(&self, tenant_id: &str, job_id: &str) -> Result<Option<QueuedJobExecution>, StoreError> {
        Ok(self
            .executions
            .read()
            .await
            .get(&job_key(tenant_id, job_id))
            .and_then(|executions| running(executions))
            .cloned())
    }

    async fn list(&self, tenant_id: &str, job_id: &str) -> Result<Vec<QueuedJobExecution>, StoreError> {
        Ok(self
            .executions
            .read()
            .await
            .get(&job_key(tenant_id, job_id))
            .cloned()
            .unwrap_or_default())
    }

    async fn list_running_owned_by(&self, owner_node: &str) -> Result<Vec<QueuedJobExecution>, StoreError> {
        Ok(self
            .executions
            .read()
            .await
            .values()
            .flatten()
            .filter(|e| e.status == ExecutionStatus::Running && e.owner_node == owner_node)
            .cloned()
            .collect())
    }

    async fn update(&self, mut execution: QueuedJobExecution) -> Result<QueuedJobExecution, StoreError> {
        let mut all = self.executions.write().await;
        let executions = all
            .get_mut(&job_key(&execution.tenant_id, &execution.job_id))
            .ok_or_else(|| StoreError::NotFound {
                entity: "job execution",
                id: execution.execution_id.to_string(),
            })?;

        if execution.status == ExecutionStatus::Running
            && executions
                .iter()
                .any(|e| e.status == ExecutionStatus::Running && e.execution_id != execution.execution_id)
        {
            return Err(StoreError::Conflict {
                entity: "job execution",
                id: execution.execution_id.to_string(),
                expected: execution.version,
                found: execution.version,
            });
        }

        let stored = executions
            .iter_mut()
            .find(|e| e.execution_id == execution.execution_id)
            .ok_or_else(|| StoreError::NotFound {
                entity: "job execution",
                id: execution.execution_id.to_string(),
            })?;
        if stored.version != execution.version {
            return Err(StoreError::Conflict {
                entity: "job execution",
                id: execution.execution_id.to_string(),
                expected: execution.version,
                found: stored.version,
            });
        }
        execution.version += 1;
        *stored = execution.clone();
        Ok(execution)
    }

    async fn delete_all(&self, tenant_id: &str, job_id: &str) -> Result<usize, StoreError> {
        Ok(self
            .executions
            .write()
            .await
            .remove(&job_key(tenant_id, job_id))
            .map_or(0, |executions| executions.len()))
    }
}
