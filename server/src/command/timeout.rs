//! Timeout tracking for pending calls

use super::correlator::ResponseCorrelator;
use std::sync::Arc;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Periodically expires pending calls past their deadline
pub struct TimeoutTracker {
    correlator: Arc<ResponseCorrelator>,
    check_interval: Duration,
}

impl TimeoutTracker {
    pub fn new(correlator: Arc<ResponseCorrelator>, check_interval: Duration) -> Self {
        Self {
            correlator,
            check_interval,
        }
    }

    /// One sweep, returning how many calls timed out
    pub async fn sweep(&self) -> usize {
        let expired = self.correlator.expire_overdue().await;
        for id in &expired {
            debug!(correlation_id = %id, "Pending call timed out");
        }
        if !expired.is_empty() {
            info!(count = expired.len(), "Expired overdue pending calls");
        }
        expired.len()
    }

    /// Sweep until `shutdown` is cancelled
    pub async fn run(&self, shutdown: CancellationToken) {
        let mut ticker = interval(self.check_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!("Timeout tracker stopping");
                    break;
                }
                _ = ticker.tick() => {
                    self.sweep().await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::correlator::{CallResult, ExpectedResponse};
    use crate::translator::TranslatorRegistry;
    use devmgmt_shared::CorrelationId;

    #[tokio::test]
    async fn test_sweep_counts_expired_calls() {
        let correlator = Arc::new(ResponseCorrelator::new(Arc::new(
            TranslatorRegistry::with_defaults(),
        )));
        let tracker = TimeoutTracker::new(correlator.clone(), Duration::from_millis(10));

        let handle = correlator
            .register(
                CorrelationId::generate("1", "gw-01"),
                ExpectedResponse::from_app("DEPLOY-V2"),
                Duration::ZERO,
            )
            .await
            .unwrap();
        correlator
            .register(
                CorrelationId::generate("1", "gw-02"),
                ExpectedResponse::from_app("DEPLOY-V2"),
                Duration::from_secs(60),
            )
            .await
            .unwrap();

        assert_eq!(tracker.sweep().await, 1);
        assert_eq!(correlator.pending_count().await, 1);
        assert_eq!(correlator.wait(handle).await, CallResult::TimedOut);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let correlator = Arc::new(ResponseCorrelator::new(Arc::new(
            TranslatorRegistry::with_defaults(),
        )));
        let tracker = TimeoutTracker::new(correlator, Duration::from_millis(5));
        let shutdown = CancellationToken::new();
        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(1), tracker.run(shutdown))
            .await
            .expect("tracker did not stop");
    }
}
