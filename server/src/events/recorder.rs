use futures::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, error, instrument, warn};

use super::store::{ClaimOutcome, EventStoreRepository};
use super::{EventListener, ServiceEvent};
use crate::store::StoreError;

#[derive(Error, Debug)]
pub enum EventStoreError {
    #[error("Event store unavailable: {0}")]
    Store(#[from] StoreError),

    #[error("Effect for event {context_id} from {source_service} failed: {source}")]
    EffectFailed {
        context_id: String,
        source_service: String,
        #[source]
        source: anyhow::Error,
    },
}

/// Outcome of `record_once`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordOutcome<T> {
    /// The effect ran and the event is now PROCESSED
    Applied(T),
    /// Already processed, or being processed by another delivery
    Duplicate,
}

impl<T> RecordOutcome<T> {
    pub fn is_applied(&self) -> bool {
        matches!(self, RecordOutcome::Applied(_))
    }
}

/// How long a claim holds before another delivery may take it over
pub const DEFAULT_CLAIM_LEASE: Duration = Duration::from_secs(30);

const MAX_CLAIM_POLL: Duration = Duration::from_millis(100);

pub struct EventRecorder {
    store: Arc<dyn EventStoreRepository>,
    node_id: String,
    claim_lease: Duration,
    listeners: RwLock<Vec<Arc<dyn EventListener>>>,
}

impl EventRecorder {
    pub fn new(store: Arc<dyn EventStoreRepository>, node_id: impl Into<String>) -> Self {
        Self {
            store,
            node_id: node_id.into(),
            claim_lease: DEFAULT_CLAIM_LEASE,
            listeners: RwLock::new(Vec::new()),
        }
    }

    pub fn with_claim_lease(mut self, lease: Duration) -> Self {
        self.claim_lease = lease;
        self
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub async fn subscribe(&self, listener: Arc<dyn EventListener>) {
        debug!(listener = listener.name(), "Event listener subscribed");
        self.listeners.write().await.push(listener);
    }

    /// Run `effect` unless this event was already processed.
    ///
    /// A delivery that finds another one running the effect waits for it to
    /// settle: it returns `Duplicate` once the event is PROCESSED and runs
    /// the effect itself when the other claim is released or its lease
    /// expires. A failing effect releases the claim and the error is
    /// returned, so a later redelivery of the same event runs the effect again.
    #[instrument(skip(self, event, effect), fields(context_id = %event.context_id, source = %event.source_service))]
    pub async fn record_once<F, Fut, T>(
        &self,
        event: ServiceEvent,
        effect: F,
    ) -> Result<RecordOutcome<T>, EventStoreError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let poll = (self.claim_lease / 10).clamp(Duration::from_millis(1), MAX_CLAIM_POLL);
        let record = loop {
            match self.store.claim(&event, &self.node_id, self.claim_lease).await? {
                ClaimOutcome::Claimed(record) => break record,
                ClaimOutcome::AlreadyProcessed => {
                    debug!("Event already processed, skipping effect");
                    return Ok(RecordOutcome::Duplicate);
                }
                ClaimOutcome::InFlight => {
                    debug!("Event is being processed by another delivery, waiting");
                    tokio::time::sleep(poll).await;
                }
            }
        };

        match effect().await {
            Ok(value) => {
                self.store.mark_processed(record.record_id).await?;
                self.notify(&event).await;
                Ok(RecordOutcome::Applied(value))
            }
            Err(source) => {
                if let Err(e) = self.store.release(record.record_id, record.claim_token).await {
                    error!(error = %e, "Failed to release claim after effect failure");
                }
                Err(EventStoreError::EffectFailed {
                    context_id: event.context_id,
                    source_service: event.source_service,
                    source,
                })
            }
        }
    }

    /// Tell every listener about `event`; a failing listener does not stop the rest
    pub async fn notify(&self, event: &ServiceEvent) {
        let listeners = self.listeners.read().await.clone();

        for listener in listeners {
            let result = AssertUnwindSafe(listener.on_event(event)).catch_unwind().await;
            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(
                    listener = listener.name(),
                    context_id = %event.context_id,
                    error = %e,
                    "Event listener failed"
                ),
                Err(_) => error!(
                    listener = listener.name(),
                    context_id = %event.context_id,
                    "Event listener panicked"
                ),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::store::{EventStatus, EventStoreRecord, MockEventStoreRepository};
    use crate::events::EventAction;
    use async_trait::async_trait;
    use chrono::Utc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use uuid::Uuid;

    fn event() -> ServiceEvent {
        ServiceEvent::new("ctx-1", "test", "1", "thing", "t-1", EventAction::Updated)
    }

    fn record(event: &ServiceEvent) -> EventStoreRecord {
        EventStoreRecord {
            record_id: Uuid::new_v4(),
            context_id: event.context_id.clone(),
            source_service: event.source_service.clone(),
            event: event.clone(),
            status: EventStatus::Unprocessed,
            in_flight: true,
            origin_node: "node-a".into(),
            recorded_on: Utc::now(),
            claimed_on: Some(Utc::now()),
            claim_token: Uuid::new_v4(),
            sequence: 0,
        }
    }

    struct Counting(AtomicUsize);

    #[async_trait]
    impl EventListener for Counting {
        fn name(&self) -> &str {
            "counting"
        }

        async fn on_event(&self, _event: &ServiceEvent) -> anyhow::Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct Panicking;

    #[async_trait]
    impl EventListener for Panicking {
        fn name(&self) -> &str {
            "panicking"
        }

        async fn on_event(&self, _event: &ServiceEvent) -> anyhow::Result<()> {
            panic!("listener blew up");
        }
    }

    #[tokio::test]
    async fn test_claimed_event_runs_effect_and_notifies() {
        let ev = event();
        let claimed = record(&ev);
        let processed = EventStoreRecord {
            status: EventStatus::Processed,
            in_flight: false,
            sequence: 1,
            ..claimed.clone()
        };

        let mut store = MockEventStoreRepository::new();
        store
            .expect_claim()
            .times(1)
            .returning(move |_, _, _| Ok(ClaimOutcome::Claimed(claimed.clone())));
        store
            .expect_mark_processed()
            .times(1)
            .returning(move |_| Ok(processed.clone()));

        let recorder = EventRecorder::new(Arc::new(store), "node-a");
        let counter = Arc::new(Counting(AtomicUsize::new(0)));
        recorder.subscribe(Arc::new(Panicking)).await;
        recorder.subscribe(counter.clone()).await;

        let outcome = recorder.record_once(ev, || async { Ok(42) }).await.unwrap();
        assert_eq!(outcome, RecordOutcome::Applied(42));
        assert_eq!(counter.0.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_processed_event_skips_effect() {
        let mut store = MockEventStoreRepository::new();
        store
            .expect_claim()
            .returning(|_, _, _| Ok(ClaimOutcome::AlreadyProcessed));
        store.expect_mark_processed().never();

        let recorder = EventRecorder::new(Arc::new(store), "node-a");
        let ran = Arc::new(AtomicUsize::new(0));
        let effect_ran = ran.clone();
        let outcome = recorder
            .record_once(event(), move || async move {
                effect_ran.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await
            .unwrap();

        assert_eq!(outcome, RecordOutcome::Duplicate);
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_failed_effect_releases_claim() {
        let ev = event();
        let claimed = record(&ev);
        let (record_id, token) = (claimed.record_id, claimed.claim_token);

        let mut store = MockEventStoreRepository::new();
        store
            .expect_claim()
            .returning(move |_, _, _| Ok(ClaimOutcome::Claimed(claimed.clone())));
        store
            .expect_release()
            .withf(move |id, claim| *id == record_id && *claim == token)
            .times(1)
            .returning(|_, _| Ok(()));
        store.expect_mark_processed().never();

        let recorder = EventRecorder::new(Arc::new(store), "node-a");
        let result = recorder
            .record_once(ev, || async { Err::<(), _>(anyhow::anyhow!("disk full")) })
            .await;

        match result {
            Err(EventStoreError::EffectFailed { context_id, .. }) => assert_eq!(context_id, "ctx-1"),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_store_failure_propagates() {
        let mut store = MockEventStoreRepository::new();
        store
            .expect_claim()
            .returning(|_, _, _| Err(StoreError::Backend("offline".into())));

        let recorder = EventRecorder::new(Arc::new(store), "node-a");
        let result = recorder.record_once(event(), || async { Ok(()) }).await;
        assert!(matches!(result, Err(EventStoreError::Store(_))));
    }

    #[tokio::test]
    async fn test_delivery_waits_for_inflight_claim_to_settle() {
        let ev = event();
        let claimed = record(&ev);
        let processed = EventStoreRecord {
            status: EventStatus::Processed,
            in_flight: false,
            sequence: 1,
            ..claimed.clone()
        };

        let mut store = MockEventStoreRepository::new();
        let mut seq = mockall::Sequence::new();
        store
            .expect_claim()
            .times(2)
            .in_sequence(&mut seq)
            .returning(|_, _, _| Ok(ClaimOutcome::InFlight));
        // The other delivery failed and released its claim
        store
            .expect_claim()
            .times(1)
            .in_sequence(&mut seq)
            .returning(move |_, _, _| Ok(ClaimOutcome::Claimed(claimed.clone())));
        store
            .expect_mark_processed()
            .times(1)
            .returning(move |_| Ok(processed.clone()));

        let recorder = EventRecorder::new(Arc::new(store), "node-a").with_claim_lease(Duration::from_millis(20));
        let outcome = recorder.record_once(ev, || async { Ok("ran") }).await.unwrap();
        assert_eq!(outcome, RecordOutcome::Applied("ran"));
    }
}
