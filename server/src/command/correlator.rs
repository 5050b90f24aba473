//! Matches inbound replies to outstanding requests

use devmgmt_shared::{CanonicalResponse, CorrelationId, DeviceEnvelope};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{oneshot, RwLock};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::translator::{TranslationError, TranslatorRegistry};

/// How a pending call was settled
#[derive(Debug, Clone, PartialEq)]
pub enum CallResult {
    Completed(CanonicalResponse),
    TranslationFailed(TranslationError),
    TimedOut,
}

/// What the caller expects back, checked against the reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpectedResponse {
    pub app_name: String,
}

impl ExpectedResponse {
    pub fn from_app(app_name: impl Into<String>) -> Self {
        Self {
            app_name: app_name.into(),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CorrelatorError {
    #[error("Correlation id {0} is already registered")]
    AlreadyRegistered(CorrelationId),
}

/// Result of feeding a reply to the correlator
#[derive(Debug)]
pub enum ResolveOutcome {
    /// A waiter received the settled result
    Delivered(CorrelationId),
    /// No pending call for this id (expired, cancelled or a duplicate)
    Unmatched(CorrelationId, DeviceEnvelope),
    /// The reply carries no usable correlation id
    Uncorrelated(TranslationError),
}

struct PendingCall {
    expected: ExpectedResponse,
    deadline: Instant,
    slot: oneshot::Sender<CallResult>,
}

/// Returned by `register`, consumed by `wait`
#[derive(Debug)]
pub struct PendingHandle {
    pub correlation_id: CorrelationId,
    pub deadline: Instant,
    receiver: oneshot::Receiver<CallResult>,
}

/// Owns every pending call from registration to resolution.
///
/// Whoever removes an entry from the pending map settles it: a reply, the
/// sweeper, the waiter's own deadline or a cancel. That makes resolution
/// at-most-once even when replies race each other or the deadline.
pub struct ResponseCorrelator {
    translators: Arc<TranslatorRegistry>,
    pending: Arc<RwLock<HashMap<CorrelationId, PendingCall>>>,
}

impl ResponseCorrelator {
    pub fn new(translators: Arc<TranslatorRegistry>) -> Self {
        Self {
            translators,
            pending: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub async fn register(
        &self,
        correlation_id: CorrelationId,
        expected: ExpectedResponse,
        timeout: Duration,
    ) -> Result<PendingHandle, CorrelatorError> {
        let (slot, receiver) = oneshot::channel();
        let deadline = Instant::now() + timeout;

        let mut pending = self.pending.write().await;
        if pending.contains_key(&correlation_id) {
            return Err(CorrelatorError::AlreadyRegistered(correlation_id));
        }
        pending.insert(
            correlation_id.clone(),
            PendingCall {
                expected,
                deadline,
                slot,
            },
        );
        debug!(correlation_id = %correlation_id, timeout_ms = timeout.as_millis() as u64, "Registered pending call");

        Ok(PendingHandle {
            correlation_id,
            deadline,
            receiver,
        })
    }

    /// Settle the pending call a reply belongs to
    pub async fn resolve(&self, envelope: DeviceEnvelope) -> ResolveOutcome {
        let correlation_id = match self.translators.translate::<DeviceEnvelope, CorrelationId>(&envelope) {
            Ok(id) => id,
            Err(e) => return ResolveOutcome::Uncorrelated(e),
        };

        let Some(call) = self.pending.write().await.remove(&correlation_id) else {
            debug!(correlation_id = %correlation_id, "Reply has no pending call");
            return ResolveOutcome::Unmatched(correlation_id, envelope);
        };

        let result = match self
            .translators
            .translate::<DeviceEnvelope, CanonicalResponse>(&envelope)
        {
            Ok(response) if response.app_name != call.expected.app_name => {
                CallResult::TranslationFailed(TranslationError::invalid_channel(
                    format!(
                        "reply from app '{}' where '{}' was expected",
                        response.app_name, call.expected.app_name
                    ),
                    &envelope,
                ))
            }
            Ok(response) => CallResult::Completed(response),
            Err(e) => CallResult::TranslationFailed(e),
        };

        if call.slot.send(result).is_err() {
            // Waiter went away after we claimed the entry; the result is lost
            warn!(correlation_id = %correlation_id, "Waiter dropped before reply was delivered");
        }
        ResolveOutcome::Delivered(correlation_id)
    }

    /// Wait for the call to settle, never past its deadline
    pub async fn wait(&self, handle: PendingHandle) -> CallResult {
        let PendingHandle {
            correlation_id,
            deadline,
            mut receiver,
        } = handle;

        match tokio::time::timeout_at(deadline, &mut receiver).await {
            Ok(Ok(result)) => result,
            // Sender dropped without a result: cancelled
            Ok(Err(_)) => CallResult::TimedOut,
            Err(_) => {
                if self.pending.write().await.remove(&correlation_id).is_some() {
                    debug!(correlation_id = %correlation_id, "Pending call expired at deadline");
                    return CallResult::TimedOut;
                }
                // Someone else claimed the entry first and is sending its result
                receiver.await.unwrap_or(CallResult::TimedOut)
            }
        }
    }

    /// Drop a registration without settling it
    pub async fn cancel(&self, correlation_id: &CorrelationId) -> bool {
        self.pending.write().await.remove(correlation_id).is_some()
    }

    /// Time out every call past its deadline, returning their ids
    pub async fn expire_overdue(&self) -> Vec<CorrelationId> {
        let now = Instant::now();
        let mut pending = self.pending.write().await;
        let overdue: Vec<CorrelationId> = pending
            .iter()
            .filter(|(_, call)| call.deadline <= now)
            .map(|(id, _)| id.clone())
            .collect();

        for id in &overdue {
            if let Some(call) = pending.remove(id) {
                let _ = call.slot.send(CallResult::TimedOut);
            }
        }
        overdue
    }

    pub async fn is_pending(&self, correlation_id: &CorrelationId) -> bool {
        self.pending.read().await.contains_key(correlation_id)
    }

    pub async fn pending_count(&self) -> usize {
        self.pending.read().await.len()
    }

    pub async fn pending_count_for(&self, tenant_id: &str, device_id: &str) -> usize {
        self.pending
            .read()
            .await
            .keys()
            .filter(|id| id.tenant_id == tenant_id && id.device_id == device_id)
            .count()
    }
}
