//! Jobs, their targets and their executions

use chrono::{DateTime, Utc};
use devmgmt_shared::state_machine::TargetProgress;
use devmgmt_shared::{CanonicalRequest, Method, Metrics};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Canonical request every target of a step receives, addressed per target
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestTemplate {
    pub app_name: String,
    #[serde(default = "default_app_version")]
    pub app_version: String,
    pub method: Method,
    #[serde(default)]
    pub resource_path: Vec<String>,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub metrics: Metrics,
}

fn default_app_version() -> String {
    "1.0.0".to_string()
}

impl RequestTemplate {
    pub fn new(app_name: impl Into<String>, method: Method) -> Self {
        Self {
            app_name: app_name.into(),
            app_version: default_app_version(),
            method,
            resource_path: Vec::new(),
            body: String::new(),
            metrics: Metrics::new(),
        }
    }

    pub fn with_resource<I, S>(mut self, segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.resource_path = segments.into_iter().map(Into::into).collect();
        self
    }

    pub fn build(&self, tenant_id: &str, device_id: &str) -> CanonicalRequest {
        let mut request = CanonicalRequest::new(tenant_id, device_id, &self.app_name, self.method)
            .with_app_version(&self.app_version)
            .with_resource(self.resource_path.iter().cloned())
            .with_body(self.body.as_bytes());
        request.metrics = self.metrics.clone();
        request
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStepDefinition {
    pub name: String,
    /// Name of the target processor that runs this step
    pub processor: String,
    pub template: RequestTemplate,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub job_id: String,
    pub tenant_id: String,
    pub name: String,
    pub steps: Vec<JobStepDefinition>,
    pub target_ids: Vec<String>,
}

impl Job {
    pub fn step_count(&self) -> u32 {
        self.steps.len() as u32
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobTarget {
    pub job_id: String,
    pub tenant_id: String,
    pub target_id: String,
    pub progress: TargetProgress,
    pub last_exception: Option<String>,
    /// Device operation of the last call made for this target
    pub operation_id: Option<Uuid>,
    /// Consecutive PROCESS_AGAIN results on the current step
    pub again_passes: u32,
    pub version: u64,
}

impl JobTarget {
    pub fn new(job: &Job, target_id: impl Into<String>) -> Self {
        Self {
            job_id: job.job_id.clone(),
            tenant_id: job.tenant_id.clone(),
            target_id: target_id.into(),
            progress: TargetProgress::queued(0),
            last_exception: None,
            operation_id: None,
            again_passes: 0,
            version: 0,
        }
    }

    /// Put the target back in the queue of `step_index`
    pub fn reset(&mut self, step_index: u32) {
        self.progress = TargetProgress::queued(step_index);
        self.last_exception = None;
        self.operation_id = None;
        self.again_passes = 0;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    Queued,
    Running,
    Stopped,
    Completed,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct JobStartOptions {
    /// Only these targets take part; empty means all of them
    pub target_id_sublist: Vec<String>,
    /// Put the participating targets back in the queue before running
    pub reset_step_index: bool,
    /// Step the reset puts targets on; 0 when absent
    pub from_step_index: Option<u32>,
    /// Queue behind a running execution instead of doing nothing
    pub enqueue: bool,
}

impl JobStartOptions {
    pub fn includes(&self, target_id: &str) -> bool {
        self.target_id_sublist.is_empty() || self.target_id_sublist.iter().any(|t| t == target_id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedJobExecution {
    pub execution_id: Uuid,
    pub job_id: String,
    pub tenant_id: String,
    pub status: ExecutionStatus,
    pub options: JobStartOptions,
    /// Node running (or last running) this execution
    pub owner_node: String,
    pub enqueued_on: DateTime<Utc>,
    pub started_on: Option<DateTime<Utc>>,
    pub ended_on: Option<DateTime<Utc>>,
    pub version: u64,
}

impl QueuedJobExecution {
    pub fn new(
        tenant_id: impl Into<String>,
        job_id: impl Into<String>,
        options: JobStartOptions,
        owner_node: impl Into<String>,
        status: ExecutionStatus,
    ) -> Self {
        let now = Utc::now();
        Self {
            execution_id: Uuid::new_v4(),
            job_id: job_id.into(),
            tenant_id: tenant_id.into(),
            status,
            options,
            owner_node: owner_node.into(),
            enqueued_on: now,
            started_on: (status == ExecutionStatus::Running).then_some(now),
            ended_on: None,
            version: 0,
        }
    }
}
