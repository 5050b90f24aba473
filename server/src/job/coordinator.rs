//! Job execution coordinator
//!
//! Runs the steps of a job in order over its targets. Within a step, pending
//! targets are presented concurrently up to a limit; targets asking to be
//! presented again get another pass after a delay. Progress is persisted
//! after every target, so a stopped or crashed execution resumes at the first
//! step that still has work.

use futures::{stream, StreamExt};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use chrono::Utc;
use devmgmt_shared::state_machine::{resume_step, TargetStatus};

use super::error::JobEngineError;
use super::model::{ExecutionStatus, Job, JobStartOptions, JobTarget, QueuedJobExecution};
use super::processor::{ProcessorRegistry, StepContext, TargetDriver, TargetProcessor};
use super::repository::{
    BeginOutcome, JobExecutionRepository, JobRepository, JobTargetRepository, ResumeOutcome,
};
use crate::events::{EventAction, EventRecorder, RecordOutcome, ServiceEvent};
use crate::store::StoreError;

/// Source service of events the job engine records
pub const JOB_EVENT_SOURCE: &str = "job-engine";

/// Entity type of job definition events
pub const JOB_ENTITY: &str = "job";

const UPDATE_ATTEMPTS: usize = 3;

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub node_id: String,
    pub max_concurrent_targets: usize,
    pub again_delay: Duration,
    pub max_again_passes: u32,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            node_id: "node-1".to_string(),
            max_concurrent_targets: 16,
            again_delay: Duration::from_secs(5),
            max_again_passes: 5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Started(Uuid),
    Queued(Uuid),
    /// Nothing was started; carries the running execution
    AlreadyRunning(Uuid),
}

struct LocalExecution {
    stop: CancellationToken,
    task: JoinHandle<()>,
}

#[derive(Clone)]
pub struct JobCoordinator {
    jobs: Arc<dyn JobRepository>,
    targets: Arc<dyn JobTargetRepository>,
    executions: Arc<dyn JobExecutionRepository>,
    processors: Arc<ProcessorRegistry>,
    recorder: Arc<EventRecorder>,
    driver: TargetDriver,
    config: Arc<CoordinatorConfig>,
    shutdown: CancellationToken,
    local: Arc<Mutex<HashMap<Uuid, LocalExecution>>>,
}

impl JobCoordinator {
    pub fn new(
        jobs: Arc<dyn JobRepository>,
        targets: Arc<dyn JobTargetRepository>,
        executions: Arc<dyn JobExecutionRepository>,
        processors: ProcessorRegistry,
        recorder: Arc<EventRecorder>,
        config: CoordinatorConfig,
    ) -> Self {
        Self {
            jobs,
            targets,
            executions,
            processors: Arc::new(processors),
            recorder,
            driver: TargetDriver::new(config.max_again_passes),
            config: Arc::new(config),
            shutdown: CancellationToken::new(),
            local: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Validate and store a job definition
    pub async fn define_job(&self, job: Job) -> Result<(), JobEngineError> {
        self.validate(&job)?;

        let event = ServiceEvent::new(
            Uuid::new_v4().to_string(),
            JOB_EVENT_SOURCE,
            &job.tenant_id,
            JOB_ENTITY,
            &job.job_id,
            EventAction::Updated,
        );
        let jobs = self.jobs.clone();
        let job_id = job.job_id.clone();
        self.recorder
            .record_once(event, move || async move {
                jobs.save(job).await?;
                Ok(())
            })
            .await?;
        info!(job_id = %job_id, "Job defined");
        Ok(())
    }

    pub async fn start_job(&self, tenant_id: &str, job_id: &str) -> Result<StartOutcome, JobEngineError> {
        self.start_job_with_options(tenant_id, job_id, JobStartOptions::default())
            .await
    }

    #[instrument(skip(self, options), fields(enqueue = options.enqueue))]
    pub async fn start_job_with_options(
        &self,
        tenant_id: &str,
        job_id: &str,
        options: JobStartOptions,
    ) -> Result<StartOutcome, JobEngineError> {
        let job = self.load_job(tenant_id, job_id).await?;
        self.validate(&job)?;
        self.check_options(&job, &options)?;

        let created = self
            .targets
            .insert_missing(job.target_ids.iter().map(|t| JobTarget::new(&job, t)).collect())
            .await?;
        if created > 0 {
            debug!(created, "Created job targets");
        }

        match self
            .executions
            .try_begin(tenant_id, job_id, options, &self.config.node_id)
            .await?
        {
            BeginOutcome::Started(execution) => {
                let execution_id = execution.execution_id;
                info!(execution_id = %execution_id, "Job execution started");
                self.launch(job, execution, true);
                Ok(StartOutcome::Started(execution_id))
            }
            BeginOutcome::Queued(execution) => {
                info!(execution_id = %execution.execution_id, "Job execution queued");
                Ok(StartOutcome::Queued(execution.execution_id))
            }
            BeginOutcome::AlreadyRunning(execution) => {
                info!(execution_id = %execution.execution_id, "Job already running, start ignored");
                Ok(StartOutcome::AlreadyRunning(execution.execution_id))
            }
        }
    }

    /// Stop the running execution of a job and drop everything queued behind it
    #[instrument(skip(self))]
    pub async fn stop_job(&self, tenant_id: &str, job_id: &str) -> Result<(), JobEngineError> {
        self.load_job(tenant_id, job_id).await?;
        let running = self
            .executions
            .find_running(tenant_id, job_id)
            .await?
            .ok_or_else(|| JobEngineError::JobNotRunning {
                job_id: job_id.to_string(),
            })?;

        for queued in self.executions.list(tenant_id, job_id).await? {
            if queued.status == ExecutionStatus::Queued {
                self.end_execution(&queued, ExecutionStatus::Queued, ExecutionStatus::Stopped)
                    .await?;
            }
        }
        self.stop_execution(running).await
    }

    #[instrument(skip(self))]
    pub async fn stop_job_execution(
        &self,
        tenant_id: &str,
        job_id: &str,
        execution_id: Uuid,
    ) -> Result<(), JobEngineError> {
        self.load_job(tenant_id, job_id).await?;
        let execution = self
            .executions
            .find(tenant_id, job_id, execution_id)
            .await?
            .ok_or_else(|| JobEngineError::ExecutionNotFound {
                job_id: job_id.to_string(),
                execution_id,
            })?;
        if execution.status != ExecutionStatus::Running {
            return Err(JobEngineError::JobNotRunning {
                job_id: job_id.to_string(),
            });
        }
        self.stop_execution(execution).await
    }

    /// Continue a stopped execution from the first step that still has work
    #[instrument(skip(self))]
    pub async fn resume_job_execution(
        &self,
        tenant_id: &str,
        job_id: &str,
        execution_id: Uuid,
    ) -> Result<(), JobEngineError> {
        let job = self.load_job(tenant_id, job_id).await?;
        self.validate(&job)?;
        // A stopped execution whose task has not wound down yet
        if self.is_local(&execution_id) {
            return Err(JobEngineError::JobRunning {
                job_id: job_id.to_string(),
            });
        }

        match self
            .executions
            .try_resume(tenant_id, job_id, execution_id, &self.config.node_id)
            .await?
        {
            ResumeOutcome::Resumed(execution) => {
                info!("Job execution resumed");
                self.launch(job, execution, false);
                Ok(())
            }
            ResumeOutcome::AlreadyRunning(_) => {
                debug!("Execution already running, resume ignored");
                Ok(())
            }
            ResumeOutcome::Busy(_) => Err(JobEngineError::JobRunning {
                job_id: job_id.to_string(),
            }),
            ResumeOutcome::NotResumable(status) => Err(JobEngineError::ExecutionNotResumable {
                job_id: job_id.to_string(),
                execution_id,
                status,
            }),
            ResumeOutcome::NotFound => Err(JobEngineError::ExecutionNotFound {
                job_id: job_id.to_string(),
                execution_id,
            }),
        }
    }

    pub async fn is_running(&self, tenant_id: &str, job_id: &str) -> Result<bool, JobEngineError> {
        Ok(self.executions.find_running(tenant_id, job_id).await?.is_some())
    }

    pub async fn is_running_many(
        &self,
        tenant_id: &str,
        job_ids: &[String],
    ) -> Result<Vec<(String, bool)>, JobEngineError> {
        let mut results = Vec::with_capacity(job_ids.len());
        for job_id in job_ids {
            results.push((job_id.clone(), self.is_running(tenant_id, job_id).await?));
        }
        Ok(results)
    }

    /// Delete the targets and executions of a job that is not running
    #[instrument(skip(self))]
    pub async fn clean_job_data(&self, tenant_id: &str, job_id: &str) -> Result<(), JobEngineError> {
        self.load_job(tenant_id, job_id).await?;
        if self.is_running(tenant_id, job_id).await? {
            return Err(JobEngineError::JobRunning {
                job_id: job_id.to_string(),
            });
        }

        let event = ServiceEvent::new(
            Uuid::new_v4().to_string(),
            JOB_EVENT_SOURCE,
            tenant_id,
            JOB_ENTITY,
            job_id,
            EventAction::Deleted,
        )
        .with_payload(serde_json::json!({ "scope": "data" }));

        let targets = self.targets.clone();
        let executions = self.executions.clone();
        let (tenant, job) = (tenant_id.to_string(), job_id.to_string());
        let outcome = self
            .recorder
            .record_once(event, move || async move {
                let removed_targets = targets.delete_all(&tenant, &job).await?;
                let removed_executions = executions.delete_all(&tenant, &job).await?;
                Ok((removed_targets, removed_executions))
            })
            .await?;

        if let RecordOutcome::Applied((targets, executions)) = outcome {
            info!(targets, executions, "Job data cleaned");
        }
        Ok(())
    }

    /// Relaunch executions this node owned when it last went down
    pub async fn resume_orphaned_executions(&self) -> Result<usize, JobEngineError> {
        let orphans = self
            .executions
            .list_running_owned_by(&self.config.node_id)
            .await?;
        let mut relaunched = 0;

        for execution in orphans {
            if self.is_local(&execution.execution_id) {
                continue;
            }
            match self.load_job(&execution.tenant_id, &execution.job_id).await {
                Ok(job) => {
                    info!(execution_id = %execution.execution_id, job_id = %execution.job_id, "Relaunching orphaned execution");
                    self.launch(job, execution, false);
                    relaunched += 1;
                }
                Err(e) => warn!(execution_id = %execution.execution_id, error = %e, "Orphaned execution has no job"),
            }
        }
        Ok(relaunched)
    }

    /// Stop driving executions and wait for them; they stay RUNNING for the next start
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let tasks: Vec<JoinHandle<()>> = self
            .local
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(_, local)| local.task)
            .collect();
        for task in tasks {
            if let Err(e) = task.await {
                error!(error = %e, "Execution task failed during shutdown");
            }
        }
    }

    /// Whether this node is driving the execution right now
    pub fn is_local(&self, execution_id: &Uuid) -> bool {
        self.local
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(execution_id)
    }

    async fn load_job(&self, tenant_id: &str, job_id: &str) -> Result<Arc<Job>, JobEngineError> {
        self.jobs
            .find(tenant_id, job_id)
            .await?
            .map(Arc::new)
            .ok_or_else(|| JobEngineError::JobNotFound {
                tenant_id: tenant_id.to_string(),
                job_id: job_id.to_string(),
            })
    }

    fn validate(&self, job: &Job) -> Result<(), JobEngineError> {
        let invalid = |reason: &str| JobEngineError::InvalidJob {
            job_id: job.job_id.clone(),
            reason: reason.to_string(),
        };
        if job.steps.is_empty() {
            return Err(invalid("job has no steps"));
        }
        if job.target_ids.is_empty() {
            return Err(invalid("job has no targets"));
        }
        let unique: HashSet<&String> = job.target_ids.iter().collect();
        if unique.len() != job.target_ids.len() {
            return Err(invalid("target ids must be unique"));
        }
        for (index, step) in job.steps.iter().enumerate() {
            if !self.processors.contains(&step.processor) {
                return Err(JobEngineError::UnknownProcessor {
                    job_id: job.job_id.clone(),
                    step_index: index as u32,
                    processor: step.processor.clone(),
                });
            }
        }
        Ok(())
    }

    fn check_options(&self, job: &Job, options: &JobStartOptions) -> Result<(), JobEngineError> {
        let invalid = |reason: String| JobEngineError::InvalidStartOptions {
            job_id: job.job_id.clone(),
            reason,
        };
        if let Some(from) = options.from_step_index {
            if from >= job.step_count() {
                return Err(invalid(format!(
                    "fromStepIndex {from} is beyond the last step {}",
                    job.step_count() - 1
                )));
            }
            if !options.reset_step_index {
                return Err(invalid("fromStepIndex requires resetStepIndex".to_string()));
            }
        }
        if let Some(unknown) = options
            .target_id_sublist
            .iter()
            .find(|t| !job.target_ids.contains(t))
        {
            return Err(invalid(format!("target {unknown} is not part of the job")));
        }
        Ok(())
    }

    fn launch(&self, job: Arc<Job>, execution: QueuedJobExecution, fresh: bool) {
        let stop = self.shutdown.child_token();
        let execution_id = execution.execution_id;
        let this = self.clone();
        let token = stop.clone();

        let mut local = self.local.lock().unwrap_or_else(PoisonError::into_inner);
        let task = tokio::spawn(async move {
            this.run_execution(job, execution, fresh, token).await;
        });
        local.insert(execution_id, LocalExecution { stop, task });
    }

    async fn run_execution(
        &self,
        job: Arc<Job>,
        execution: QueuedJobExecution,
        fresh: bool,
        stop: CancellationToken,
    ) {
        let execution_id = execution.execution_id;
        let status = match self.drive(&job, &execution, fresh, &stop).await {
            Ok(status) => status,
            Err(e) => {
                error!(execution_id = %execution_id, job_id = %job.job_id, error = %e, "Job execution aborted");
                ExecutionStatus::Stopped
            }
        };

        if self.shutdown.is_cancelled() {
            debug!(execution_id = %execution_id, "Left running for the next start");
            return;
        }

        if let Err(e) = self
            .end_execution(&execution, ExecutionStatus::Running, status)
            .await
        {
            error!(execution_id = %execution_id, error = %e, "Failed to close job execution");
        }
        self.local
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&execution_id);
        info!(execution_id = %execution_id, job_id = %job.job_id, status = ?status, "Job execution ended");

        match self
            .executions
            .promote_next(&execution.tenant_id, &execution.job_id, &self.config.node_id)
            .await
        {
            Ok(Some(next)) => {
                info!(execution_id = %next.execution_id, "Starting queued execution");
                self.launch(job, next, true);
            }
            Ok(None) => {}
            Err(e) => error!(job_id = %job.job_id, error = %e, "Failed to start queued execution"),
        }
    }

    #[instrument(skip_all, fields(execution_id = %execution.execution_id, job_id = %job.job_id))]
    async fn drive(
        &self,
        job: &Arc<Job>,
        execution: &QueuedJobExecution,
        fresh: bool,
        stop: &CancellationToken,
    ) -> Result<ExecutionStatus, JobEngineError> {
        let options = &execution.options;
        let step_count = job.step_count();

        if fresh && options.reset_step_index {
            let from = options.from_step_index.unwrap_or(0);
            for mut target in self.participants(execution).await? {
                target.reset(from);
                self.targets.update(target).await?;
            }
        }

        let participants = self.participants(execution).await?;
        let Some(mut step_index) = resume_step(participants.iter().map(|t| &t.progress), step_count) else {
            info!("No target has work left");
            return Ok(ExecutionStatus::Completed);
        };
        if step_index > 0 {
            info!(step = step_index, "Entering job at first open step");
        }

        while step_index < step_count {
            if !self.run_step(job, execution, step_index, stop).await? {
                return Ok(ExecutionStatus::Stopped);
            }
            step_index += 1;
        }
        Ok(ExecutionStatus::Completed)
    }

    /// Returns false when the execution was stopped before the step finished
    async fn run_step(
        &self,
        job: &Arc<Job>,
        execution: &QueuedJobExecution,
        step_index: u32,
        stop: &CancellationToken,
    ) -> Result<bool, JobEngineError> {
        let step = &job.steps[step_index as usize];
        let processor = self
            .processors
            .get(&step.processor)
            .ok_or_else(|| JobEngineError::UnknownProcessor {
                job_id: job.job_id.clone(),
                step_index,
                processor: step.processor.clone(),
            })?;
        let ctx = StepContext {
            job: job.clone(),
            step_index,
            execution_id: execution.execution_id,
        };
        let step_count = job.step_count();
        let mut pass = 0u32;

        loop {
            if self.stop_requested(execution, stop).await? {
                return Ok(false);
            }

            let pending: Vec<JobTarget> = self
                .participants(execution)
                .await?
                .into_iter()
                .filter(|t| t.progress.is_pending_for(step_index, step_count))
                .collect();
            if pending.is_empty() {
                return Ok(true);
            }

            pass += 1;
            info!(step = step_index, step_name = %step.name, pass, targets = pending.len(), "Presenting targets");

            let results: Vec<Result<Option<JobTarget>, StoreError>> = stream::iter(pending)
                .map(|target| self.present(processor.as_ref(), &ctx, target, stop))
                .buffer_unordered(self.config.max_concurrent_targets.max(1))
                .collect()
                .await;

            let mut again = 0;
            for result in results {
                if let Some(target) = result? {
                    if target.progress.status == TargetStatus::ProcessAgain {
                        again += 1;
                    }
                }
            }

            if again > 0 {
                debug!(step = step_index, again, "Waiting before presenting targets again");
                tokio::select! {
                    _ = stop.cancelled() => {}
                    _ = tokio::time::sleep(self.config.again_delay) => {}
                }
            }
        }
    }

    async fn present(
        &self,
        processor: &dyn TargetProcessor,
        ctx: &StepContext,
        target: JobTarget,
        stop: &CancellationToken,
    ) -> Result<Option<JobTarget>, StoreError> {
        if stop.is_cancelled() {
            return Ok(None);
        }
        let target_id = target.target_id.clone();
        let processed = self.driver.process(processor, ctx, target).await;

        match self.targets.update(processed).await {
            Ok(stored) => Ok(Some(stored)),
            Err(e) if e.is_conflict() => {
                warn!(target_id = %target_id, error = %e, "Target changed concurrently, will revisit");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    async fn participants(&self, execution: &QueuedJobExecution) -> Result<Vec<JobTarget>, StoreError> {
        Ok(self
            .targets
            .list(&execution.tenant_id, &execution.job_id)
            .await?
            .into_iter()
            .filter(|t| execution.options.includes(&t.target_id))
            .collect())
    }

    async fn stop_requested(
        &self,
        execution: &QueuedJobExecution,
        stop: &CancellationToken,
    ) -> Result<bool, StoreError> {
        if stop.is_cancelled() {
            return Ok(true);
        }
        // Another node may have stopped it
        let current = self
            .executions
            .find(&execution.tenant_id, &execution.job_id, execution.execution_id)
            .await?;
        Ok(!matches!(current, Some(e) if e.status == ExecutionStatus::Running))
    }

    async fn stop_execution(&self, execution: QueuedJobExecution) -> Result<(), JobEngineError> {
        let execution_id = execution.execution_id;
        self.end_execution(&execution, ExecutionStatus::Running, ExecutionStatus::Stopped)
            .await?;

        if let Some(local) = self
            .local
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&execution_id)
        {
            local.stop.cancel();
        }
        info!(execution_id = %execution_id, "Job execution stop requested");
        Ok(())
    }

    /// Move an execution from `from` to the final `to`, recorded once per run
    async fn end_execution(
        &self,
        execution: &QueuedJobExecution,
        from: ExecutionStatus,
        to: ExecutionStatus,
    ) -> Result<(), JobEngineError> {
        let event = ServiceEvent::new(
            format!("execution:{}:v{}:end", execution.execution_id, execution.version),
            JOB_EVENT_SOURCE,
            &execution.tenant_id,
            "job-execution",
            execution.execution_id.to_string(),
            EventAction::Updated,
        )
        .with_payload(serde_json::json!({ "jobId": execution.job_id, "status": to }));

        let executions = self.executions.clone();
        let (tenant, job, id) = (
            execution.tenant_id.clone(),
            execution.job_id.clone(),
            execution.execution_id,
        );
        self.recorder
            .record_once(event, move || async move {
                for _ in 0..UPDATE_ATTEMPTS {
                    let Some(mut current) = executions.find(&tenant, &job, id).await? else {
                        return Ok(());
                    };
                    if current.status != from {
                        return Ok(());
                    }
                    current.status = to;
                    current.ended_on = Some(Utc::now());
                    match executions.update(current).await {
                        Ok(_) => return Ok(()),
                        Err(e) if e.is_conflict() => continue,
                        Err(e) => return Err(e.into()),
                    }
                }
                Err(anyhow::anyhow!("execution {id} kept changing while being closed"))
            })
            .await?;
        Ok(())
    }
}
