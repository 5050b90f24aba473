use chrono::Utc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::recorder::EventRecorder;
use super::store::EventStoreRepository;
use crate::store::StoreError;

const REPLAY_BATCH: usize = 256;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HousekeepingReport {
    pub replayed: usize,
    pub purged: usize,
    pub cursor: u64,
}

/// Replays events processed by other nodes to local listeners and purges
/// records every node's cursor has passed once they are older than the
/// retention. The cursor is saved in the event store under the node id, so a
/// restarted node carries on where it stopped.
pub struct HouseKeeper {
    store: Arc<dyn EventStoreRepository>,
    recorder: Arc<EventRecorder>,
    retention: Duration,
    cursor: AtomicU64,
}

impl HouseKeeper {
    pub fn new(
        store: Arc<dyn EventStoreRepository>,
        recorder: Arc<EventRecorder>,
        retention: Duration,
    ) -> Self {
        Self {
            store,
            recorder,
            retention,
            cursor: AtomicU64::new(0),
        }
    }

    pub fn cursor(&self) -> u64 {
        self.cursor.load(Ordering::SeqCst)
    }

    pub async fn run_once(&self) -> Result<HousekeepingReport, StoreError> {
        let mut report = HousekeepingReport::default();
        let node_id = self.recorder.node_id();
        let saved = self.store.load_cursor(node_id).await?.unwrap_or(0);
        let mut cursor = self.cursor().max(saved);

        loop {
            let batch = self.store.processed_after(cursor, REPLAY_BATCH).await?;
            let done = batch.len() < REPLAY_BATCH;

            for record in batch {
                if record.origin_node != node_id {
                    self.recorder.notify(&record.event).await;
                    report.replayed += 1;
                }
                cursor = cursor.max(record.sequence);
                self.cursor.store(cursor, Ordering::SeqCst);
            }
            if done {
                break;
            }
        }
        self.store.save_cursor(node_id, cursor).await?;

        // Records another node has not replayed yet stay
        let floor = self.store.min_cursor().await?.unwrap_or(cursor).min(cursor);

        let older_than = chrono::Duration::from_std(self.retention)
            .ok()
            .and_then(|retention| Utc::now().checked_sub_signed(retention));
        if let Some(older_than) = older_than {
            report.purged = self.store.purge_processed(floor, older_than).await?;
        }
        report.cursor = cursor;
        Ok(report)
    }

    pub async fn run(&self, every: Duration, shutdown: CancellationToken) {
        let mut ticker = interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!("House-keeping stopping");
                    break;
                }
                _ = ticker.tick() => {
                    match self.run_once().await {
                        Ok(report) if report.replayed > 0 || report.purged > 0 => {
                            info!(replayed = report.replayed, purged = report.purged, cursor = report.cursor, "House-keeping pass");
                        }
                        Ok(_) => {}
                        Err(e) => warn!(error = %e, "House-keeping pass failed"),
                    }
                }
            }
        }
    }
}
