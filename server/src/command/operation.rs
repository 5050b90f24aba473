//! Device management operations: the persisted record of one dispatched call

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use devmgmt_shared::{CanonicalRequest, CorrelationId, Method};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::store::StoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationStatus {
    /// Sent, waiting for the device
    Running,
    /// Deadline passed without a reply; a late reply may still settle it
    Notified,
    Completed,
    Failed,
}

impl OperationStatus {
    pub fn is_final(&self) -> bool {
        matches!(self, OperationStatus::Completed | OperationStatus::Failed)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceManagementOperation {
    /// Same value as the correlation id's request id
    pub operation_id: Uuid,
    pub correlation_id: CorrelationId,
    pub tenant_id: String,
    pub device_id: String,
    pub app_name: String,
    pub method: Method,
    pub resource: Vec<String>,
    pub status: OperationStatus,
    pub started_on: DateTime<Utc>,
    pub ended_on: Option<DateTime<Utc>>,
    pub message: Option<String>,
    /// Set once the request reached the transport; an unpublished
    /// operation has nothing to wait for
    #[serde(default)]
    pub published: bool,
    /// Optimistic lock; bumped by every successful update
    pub version: u64,
}

impl DeviceManagementOperation {
    pub fn start(correlation_id: CorrelationId, request: &CanonicalRequest) -> Self {
        Self {
            operation_id: correlation_id.request_id,
            tenant_id: correlation_id.tenant_id.clone(),
            device_id: correlation_id.device_id.clone(),
            correlation_id,
            app_name: request.app_name.clone(),
            method: request.method,
            resource: request.resource_path.clone(),
            status: OperationStatus::Running,
            started_on: Utc::now(),
            ended_on: None,
            message: None,
            published: false,
            version: 0,
        }
    }

    /// Move to a final status; a final operation never changes again
    pub fn finish(&mut self, status: OperationStatus, message: Option<String>) -> bool {
        if self.status.is_final() || !status.is_final() {
            return false;
        }
        self.status = status;
        self.ended_on = Some(Utc::now());
        self.message = message;
        true
    }

    pub fn mark_published(&mut self) -> bool {
        if self.published {
            return false;
        }
        self.published = true;
        true
    }

    /// Mark as waiting past its deadline; only a running operation can be notified
    pub fn notify_timeout(&mut self, message: impl Into<String>) -> bool {
        if self.status != OperationStatus::Running {
            return false;
        }
        self.status = OperationStatus::Notified;
        self.message = Some(message.into());
        true
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait OperationRepository: Send + Sync {
    async fn create(&self, operation: DeviceManagementOperation) -> Result<(), StoreError>;

    async fn find(&self, operation_id: Uuid) -> Result<Option<DeviceManagementOperation>, StoreError>;

    /// Fails with `StoreError::Conflict` when `operation.version` is stale
    async fn update(&self, operation: DeviceManagementOperation) -> Result<(), StoreError>;
}

const UPDATE_ATTEMPTS: usize = 3;

/// Load, change and store an operation, retrying on version conflicts.
///
/// `change` returns false to leave the operation untouched. Returns whether
/// the change was stored.
pub async fn modify_operation<F>(
    operations: &dyn OperationRepository,
    operation_id: Uuid,
    mut change: F,
) -> Result<bool, StoreError>
where
    F: FnMut(&mut DeviceManagementOperation) -> bool + Send,
{
    let mut last_conflict = None;
    for _ in 0..UPDATE_ATTEMPTS {
        let Some(mut operation) = operations.find(operation_id).await? else {
            return Err(StoreError::NotFound {
                entity: "operation",
                id: operation_id.to_string(),
            });
        };
        if !change(&mut operation) {
            return Ok(false);
        }
        match operations.update(operation).await {
            Ok(()) => return Ok(true),
            Err(e) if e.is_conflict() => last_conflict = Some(e),
            Err(e) => return Err(e),
        }
    }
    Err(last_conflict.unwrap_or(StoreError::Backend("update retries exhausted".into())))
}
