//! Command dispatcher for sending canonical requests to devices

use devmgmt_shared::{CanonicalRequest, CanonicalResponse, CorrelationId, DeviceEnvelope, DeviceTopic};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use super::correlator::{CallResult, ExpectedResponse, ResolveOutcome, ResponseCorrelator};
use super::operation::{
    modify_operation, DeviceManagementOperation, OperationRepository, OperationStatus,
};
use crate::events::{EventAction, EventRecorder, EventStoreError, ServiceEvent};
use crate::store::StoreError;
use crate::transport::DeviceTransport;
use crate::translator::{CorrelatedRequest, TranslationError, TranslatorRegistry};

/// Source service under which operation completions are recorded
pub const OPERATION_EVENT_SOURCE: &str = "device-management-operation";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Failed to deliver request {correlation_id}: {reason}")]
pub struct CommunicationError {
    pub correlation_id: CorrelationId,
    pub reason: String,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("No reply to {correlation_id} within {timeout_ms}ms")]
pub struct TimeoutError {
    pub correlation_id: CorrelationId,
    pub timeout_ms: u64,
}

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error(transparent)]
    Communication(#[from] CommunicationError),

    #[error("Operation store error: {0}")]
    Store(#[from] StoreError),

    #[error("Operation {0} not found")]
    UnknownOperation(CorrelationId),
}

/// Expected ways a call ends; only failures to talk to the device are errors
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    Completed(CanonicalResponse),
    TranslationFailed(TranslationError),
    TimedOut(TimeoutError),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Dispatched {
    pub correlation_id: CorrelationId,
    pub outcome: DispatchOutcome,
}

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub default_timeout: Duration,
    /// Per app name overrides, keys compared case-insensitively
    pub app_timeouts: HashMap<String, Duration>,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_millis(devmgmt_shared::timeouts::DEFAULT_REQUEST_TIMEOUT_MS),
            app_timeouts: HashMap::new(),
        }
    }
}

impl DispatcherConfig {
    pub fn timeout_for(&self, app_name: &str) -> Duration {
        self.app_timeouts
            .get(&app_name.to_ascii_lowercase())
            .copied()
            .unwrap_or(self.default_timeout)
    }
}

/// Dispatches requests to devices and settles their operations
pub struct CommandDispatcher {
    transport: Arc<dyn DeviceTransport>,
    correlator: Arc<ResponseCorrelator>,
    operations: Arc<dyn OperationRepository>,
    recorder: Arc<EventRecorder>,
    translators: Arc<TranslatorRegistry>,
    config: DispatcherConfig,
}

impl CommandDispatcher {
    pub fn new(
        transport: Arc<dyn DeviceTransport>,
        correlator: Arc<ResponseCorrelator>,
        operations: Arc<dyn OperationRepository>,
        recorder: Arc<EventRecorder>,
        translators: Arc<TranslatorRegistry>,
        config: DispatcherConfig,
    ) -> Self {
        let app_timeouts = config
            .app_timeouts
            .into_iter()
            .map(|(app, timeout)| (app.to_ascii_lowercase(), timeout))
            .collect();
        Self {
            transport,
            correlator,
            operations,
            recorder,
            translators,
            config: DispatcherConfig {
                app_timeouts,
                ..config
            },
        }
    }

    /// Send a request and wait for its reply, its translation failure or its deadline
    #[instrument(skip(self, request), fields(tenant = %request.tenant_id, device = %request.device_id, app = %request.app_name, method = %request.method))]
    pub async fn send(
        &self,
        request: CanonicalRequest,
        timeout: Option<Duration>,
    ) -> Result<Dispatched, DispatchError> {
        let timeout = timeout.unwrap_or_else(|| self.config.timeout_for(&request.app_name));
        let correlated = CorrelatedRequest::new(request);
        let correlation_id = correlated.correlation_id.clone();

        self.operations
            .create(DeviceManagementOperation::start(
                correlation_id.clone(),
                &correlated.request,
            ))
            .await?;

        let envelope = match self
            .translators
            .translate::<CorrelatedRequest, DeviceEnvelope>(&correlated)
        {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(correlation_id = %correlation_id, error = %e, "Request could not be translated");
                self.settle(&correlation_id, OperationStatus::Failed, Some(e.to_string()))
                    .await?;
                return Ok(Dispatched {
                    correlation_id,
                    outcome: DispatchOutcome::TranslationFailed(e),
                });
            }
        };

        let handle = self
            .correlator
            .register(
                correlation_id.clone(),
                ExpectedResponse::from_app(&correlated.request.app_name),
                timeout,
            )
            .await
            .map_err(|e| CommunicationError {
                correlation_id: correlation_id.clone(),
                reason: e.to_string(),
            })?;

        let topic = match envelope.channel.as_ref() {
            Some(channel) => DeviceTopic::request(channel),
            None => {
                self.correlator.cancel(&correlation_id).await;
                return Err(CommunicationError {
                    correlation_id,
                    reason: "translated request has no channel".into(),
                }
                .into());
            }
        };

        if let Err(e) = self.transport.publish(&topic, &envelope).await {
            self.correlator.cancel(&correlation_id).await;
            warn!(correlation_id = %correlation_id, topic = %topic, error = %e, "Publish failed");
            return Err(CommunicationError {
                correlation_id,
                reason: e.to_string(),
            }
            .into());
        }
        info!(correlation_id = %correlation_id, topic = %topic, "Request published");
        if let Err(e) = modify_operation(self.operations.as_ref(), correlation_id.request_id, |op| {
            op.mark_published()
        })
        .await
        {
            warn!(correlation_id = %correlation_id, error = %e, "Could not mark operation published");
        }

        let outcome = self.await_settlement(handle, timeout).await?;
        Ok(Dispatched {
            correlation_id,
            outcome,
        })
    }

    /// Wait again for an operation that is still open, without re-sending it.
    ///
    /// An operation that never reached the transport is returned as is.
    #[instrument(skip(self), fields(correlation_id = %correlation_id))]
    pub async fn reobserve(
        &self,
        correlation_id: &CorrelationId,
        timeout: Option<Duration>,
    ) -> Result<OperationStatus, DispatchError> {
        let operation = self
            .operations
            .find(correlation_id.request_id)
            .await?
            .ok_or_else(|| DispatchError::UnknownOperation(correlation_id.clone()))?;
        if operation.status.is_final() || !operation.published {
            return Ok(operation.status);
        }

        let timeout = timeout.unwrap_or_else(|| self.config.timeout_for(&operation.app_name));
        let handle = match self
            .correlator
            .register(
                correlation_id.clone(),
                ExpectedResponse::from_app(&operation.app_name),
                timeout,
            )
            .await
        {
            Ok(handle) => handle,
            // Another caller is already waiting on it
            Err(_) => return Ok(operation.status),
        };

        let outcome = self.await_settlement(handle, timeout).await?;
        Ok(match outcome {
            DispatchOutcome::Completed(response) if response.is_accepted() => OperationStatus::Completed,
            DispatchOutcome::Completed(_) | DispatchOutcome::TranslationFailed(_) => OperationStatus::Failed,
            DispatchOutcome::TimedOut(_) => OperationStatus::Notified,
        })
    }

    /// Inbound entry point for every reply the transport receives
    pub async fn handle_reply(&self, envelope: DeviceEnvelope) {
        match self.correlator.resolve(envelope).await {
            ResolveOutcome::Delivered(correlation_id) => {
                debug!(correlation_id = %correlation_id, "Reply delivered to waiter");
            }
            ResolveOutcome::Uncorrelated(e) => {
                warn!(error = %e, "Dropping reply without usable correlation id");
            }
            ResolveOutcome::Unmatched(correlation_id, envelope) => {
                if let Err(e) = self.reconcile_late_reply(&correlation_id, &envelope).await {
                    warn!(correlation_id = %correlation_id, error = %e, "Late reply could not be reconciled");
                }
            }
        }
    }

    async fn await_settlement(
        &self,
        handle: super::correlator::PendingHandle,
        timeout: Duration,
    ) -> Result<DispatchOutcome, DispatchError> {
        let correlation_id = handle.correlation_id.clone();

        match self.correlator.wait(handle).await {
            CallResult::Completed(response) => {
                let (status, message) = settlement_of(&response);
                self.settle(&correlation_id, status, message).await?;
                Ok(DispatchOutcome::Completed(response))
            }
            CallResult::TranslationFailed(e) => {
                self.settle(&correlation_id, OperationStatus::Failed, Some(e.to_string()))
                    .await?;
                Ok(DispatchOutcome::TranslationFailed(e))
            }
            CallResult::TimedOut => {
                let error = TimeoutError {
                    correlation_id: correlation_id.clone(),
                    timeout_ms: timeout.as_millis() as u64,
                };
                self.mark_notified(&correlation_id, &error).await?;
                Ok(DispatchOutcome::TimedOut(error))
            }
        }
    }

    /// A reply nobody waits for settles a still-open operation once
    async fn reconcile_late_reply(
        &self,
        correlation_id: &CorrelationId,
        envelope: &DeviceEnvelope,
    ) -> Result<(), DispatchError> {
        let Some(operation) = self.operations.find(correlation_id.request_id).await? else {
            debug!(correlation_id = %correlation_id, "Reply for unknown operation");
            return Ok(());
        };
        if operation.status.is_final() {
            debug!(correlation_id = %correlation_id, status = ?operation.status, "Operation already settled, dropping reply");
            return Ok(());
        }

        let (status, message) = match self
            .translators
            .translate::<DeviceEnvelope, CanonicalResponse>(envelope)
        {
            Ok(response) => settlement_of(&response),
            Err(e) => (OperationStatus::Failed, Some(e.to_string())),
        };
        info!(correlation_id = %correlation_id, status = ?status, "Reconciling late reply");
        self.settle(correlation_id, status, message).await
    }

    /// Move an operation to its final status, exactly once per correlation id
    async fn settle(
        &self,
        correlation_id: &CorrelationId,
        status: OperationStatus,
        message: Option<String>,
    ) -> Result<(), DispatchError> {
        let event = ServiceEvent::new(
            correlation_id.to_string(),
            OPERATION_EVENT_SOURCE,
            &correlation_id.tenant_id,
            "device-management-operation",
            correlation_id.request_id.to_string(),
            EventAction::Updated,
        )
        .with_payload(serde_json::json!({ "status": status }));

        let operations = self.operations.clone();
        let operation_id = correlation_id.request_id;
        let result = self
            .recorder
            .record_once(event, move || async move {
                modify_operation(operations.as_ref(), operation_id, |op| {
                    op.finish(status, message.clone())
                })
                .await?;
                Ok(())
            })
            .await;

        match result {
            Ok(_) => Ok(()),
            Err(EventStoreError::Store(e)) => Err(e.into()),
            Err(EventStoreError::EffectFailed { source, .. }) => match source.downcast::<StoreError>() {
                Ok(store) => Err(store.into()),
                Err(other) => Err(StoreError::Backend(other.to_string()).into()),
            },
        }
    }

    async fn mark_notified(
        &self,
        correlation_id: &CorrelationId,
        error: &TimeoutError,
    ) -> Result<(), DispatchError> {
        let message = error.to_string();
        modify_operation(self.operations.as_ref(), correlation_id.request_id, |op| {
            op.notify_timeout(message.clone())
        })
        .await?;
        Ok(())
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }
}

fn settlement_of(response: &CanonicalResponse) -> (OperationStatus, Option<String>) {
    if response.is_accepted() {
        (OperationStatus::Completed, None)
    } else {
        let message = response
            .exception_message
            .clone()
            .unwrap_or_else(|| format!("device replied {:?}", response.code));
        (OperationStatus::Failed, Some(message))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::operation::MockOperationRepository;
    use crate::events::MockEventStoreRepository;
    use crate::transport::{MockDeviceTransport, TransportError};
    use devmgmt_shared::Method;

    fn dispatcher(transport: MockDeviceTransport, operations: MockOperationRepository) -> CommandDispatcher {
        let translators = Arc::new(TranslatorRegistry::with_defaults());
        CommandDispatcher::new(
            Arc::new(transport),
            Arc::new(ResponseCorrelator::new(translators.clone())),
            Arc::new(operations),
            Arc::new(EventRecorder::new(Arc::new(MockEventStoreRepository::new()), "node-a")),
            translators,
            DispatcherConfig::default(),
        )
    }

    #[test]
    fn test_timeout_for_app_is_case_insensitive() {
        let mut config = DispatcherConfig::default();
        config
            .app_timeouts
            .insert("deploy-v2".into(), Duration::from_secs(60));
        assert_eq!(config.timeout_for("DEPLOY-V2"), Duration::from_secs(60));
        assert_eq!(
            config.timeout_for("KEYS-V1"),
            Duration::from_millis(devmgmt_shared::timeouts::DEFAULT_REQUEST_TIMEOUT_MS)
        );
    }

    #[tokio::test]
    async fn test_publish_failure_is_communication_error() {
        let mut transport = MockDeviceTransport::new();
        transport
            .expect_publish()
            .times(1)
            .returning(|topic, _| Err(TransportError::NotConnected(topic.client_id.clone())));

        let mut operations = MockOperationRepository::new();
        operations.expect_create().times(1).returning(|_| Ok(()));
        operations.expect_update().never();

        let dispatcher = dispatcher(transport, operations);
        let request = CanonicalRequest::new("1", "gw-01", "DEPLOY-V2", Method::Read);
        let err = dispatcher.send(request, None).await.unwrap_err();

        match err {
            DispatchError::Communication(e) => {
                assert_eq!(e.correlation_id.device_id, "gw-01");
                assert!(e.reason.contains("gw-01"));
                assert!(!dispatcher.correlator.is_pending(&e.correlation_id).await);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_store_failure_aborts_before_publish() {
        let mut transport = MockDeviceTransport::new();
        transport.expect_publish().never();

        let mut operations = MockOperationRepository::new();
        operations
            .expect_create()
            .returning(|_| Err(StoreError::Backend("offline".into())));

        let dispatcher = dispatcher(transport, operations);
        let request = CanonicalRequest::new("1", "gw-01", "DEPLOY-V2", Method::Read);
        assert!(matches!(
            dispatcher.send(request, None).await,
            Err(DispatchError::Store(_))
        ));
    }
}
