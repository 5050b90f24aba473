//! Target processor that sends one device command per target

use async_trait::async_trait;
use devmgmt_shared::state_machine::TargetStatus;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument};

use super::error::TargetProcessingError;
use super::model::JobTarget;
use super::processor::{StepContext, TargetOutcome, TargetProcessor};
use crate::command::{
    CommandDispatcher, DispatchError, DispatchOutcome, OperationRepository, OperationStatus,
};

/// Name job steps use to select this processor
pub const DEVICE_COMMAND_PROCESSOR: &str = "device-command";

/// Builds the step's request for the target and dispatches it.
///
/// A target presented again after a timeout is not sent the command twice:
/// the earlier operation is looked up and, while it is still open, observed
/// again. An operation whose publish failed is sent anew.
pub struct DeviceCommandProcessor {
    dispatcher: Arc<CommandDispatcher>,
    operations: Arc<dyn OperationRepository>,
}

impl DeviceCommandProcessor {
    pub fn new(dispatcher: Arc<CommandDispatcher>, operations: Arc<dyn OperationRepository>) -> Self {
        Self {
            dispatcher,
            operations,
        }
    }

    async fn revisit(
        &self,
        target: &JobTarget,
        timeout: Option<Duration>,
    ) -> Result<Option<TargetOutcome>, TargetProcessingError> {
        let Some(operation_id) = target.operation_id else {
            return Ok(None);
        };
        let Some(operation) = self.operations.find(operation_id).await? else {
            return Ok(None);
        };
        if !operation.status.is_final() && !operation.published {
            debug!(operation_id = %operation_id, "Earlier operation never reached the device, sending again");
            return Ok(None);
        }

        let status = if operation.status.is_final() {
            operation.status
        } else {
            debug!(operation_id = %operation_id, "Observing earlier operation again");
            match self.dispatcher.reobserve(&operation.correlation_id, timeout).await {
                Ok(status) => status,
                Err(DispatchError::Communication(_)) => OperationStatus::Notified,
                Err(e) => return Err(e.into()),
            }
        };

        Ok(Some(match status {
            OperationStatus::Completed => TargetOutcome::ok(Some(operation_id)),
            OperationStatus::Failed => {
                let reason = self
                    .operations
                    .find(operation_id)
                    .await?
                    .and_then(|op| op.message)
                    .unwrap_or_else(|| "device operation failed".to_string());
                TargetOutcome::failed(reason, Some(operation_id))
            }
            OperationStatus::Running | OperationStatus::Notified => {
                TargetOutcome::again(Some(operation_id))
            }
        }))
    }
}

#[async_trait]
impl TargetProcessor for DeviceCommandProcessor {
    #[instrument(skip(self, ctx, target), fields(job_id = %ctx.job.job_id, step = ctx.step_index, target_id = %target.target_id))]
    async fn process_target(
        &self,
        ctx: &StepContext,
        target: &JobTarget,
    ) -> Result<TargetOutcome, TargetProcessingError> {
        let step = ctx.step();
        let timeout = step.timeout_ms.map(Duration::from_millis);

        if target.progress.status == TargetStatus::ProcessAgain {
            if let Some(outcome) = self.revisit(target, timeout).await? {
                return Ok(outcome);
            }
        }

        let request = step
            .template
            .build(&target.tenant_id, &target.target_id)
            .with_requester(format!("job:{}:{}", ctx.job.job_id, ctx.execution_id));

        match self.dispatcher.send(request, timeout).await {
            Ok(dispatched) => {
                let operation_id = Some(dispatched.correlation_id.request_id);
                Ok(match dispatched.outcome {
                    DispatchOutcome::Completed(response) if response.is_accepted() => {
                        TargetOutcome::ok(operation_id)
                    }
                    DispatchOutcome::Completed(response) => TargetOutcome::failed(
                        response
                            .exception_message
                            .unwrap_or_else(|| format!("device replied {:?}", response.code)),
                        operation_id,
                    ),
                    DispatchOutcome::TranslationFailed(e) => TargetOutcome::failed(e.to_string(), operation_id),
                    DispatchOutcome::TimedOut(_) => TargetOutcome::again(operation_id),
                })
            }
            Err(DispatchError::Communication(e)) => {
                Ok(TargetOutcome::again(Some(e.correlation_id.request_id)))
            }
            Err(e) => Err(e.into()),
        }
    }
}
