use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::warn;
use uuid::Uuid;

use super::StoreError;
use crate::events::{ClaimOutcome, EventStatus, EventStoreRecord, EventStoreRepository, ServiceEvent};

type EventKey = (String, String);

#[derive(Default)]
struct EventTable {
    records: HashMap<EventKey, EventStoreRecord>,
    keys_by_id: HashMap<Uuid, EventKey>,
    /// Dedup keys of purged records with the sequence they were processed at
    tombstones: HashMap<EventKey, u64>,
    cursors: HashMap<String, u64>,
    last_sequence: u64,
}

impl EventTable {
    fn by_id(&mut self, record_id: Uuid) -> Result<&mut EventStoreRecord, StoreError> {
        let not_found = || StoreError::NotFound {
            entity: "event record",
            id: record_id.to_string(),
        };
        let key = self.keys_by_id.get(&record_id).ok_or_else(not_found)?;
        self.records.get_mut(key).ok_or_else(not_found)
    }
}

/// In-memory event store; one write lock makes `claim` atomic
pub struct InMemoryEventStore {
    table: Arc<RwLock<EventTable>>,
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self {
            table: Arc::new(RwLock::new(EventTable::default())),
        }
    }

    /// Records still holding their event
    pub async fn count(&self) -> usize {
        self.table.read().await.records.len()
    }

    pub async fn tombstone_count(&self) -> usize {
        self.table.read().await.tombstones.len()
    }
}

impl Default for InMemoryEventStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventStoreRepository for InMemoryEventStore {
    async fn claim(
        &self,
        event: &ServiceEvent,
        origin_node: &str,
        lease: Duration,
    ) -> Result<ClaimOutcome, StoreError> {
        let mut table = self.table.write().await;
        let key = (event.context_id.clone(), event.source_service.clone());
        if table.tombstones.contains_key(&key) {
            return Ok(ClaimOutcome::AlreadyProcessed);
        }

        let now = Utc::now();
        if let Some(record) = table.records.get_mut(&key) {
            if record.status == EventStatus::Processed {
                return Ok(ClaimOutcome::AlreadyProcessed);
            }
            if record.in_flight && !record.lease_expired(lease, now) {
                return Ok(ClaimOutcome::InFlight);
            }
            if record.in_flight {
                warn!(
                    context_id = %record.context_id,
                    source = %record.source_service,
                    holder = %record.origin_node,
                    "Taking over an expired event claim"
                );
            }
            record.in_flight = true;
            record.origin_node = origin_node.to_string();
            record.claimed_on = Some(now);
            record.claim_token = Uuid::new_v4();
            return Ok(ClaimOutcome::Claimed(record.clone()));
        }

        let record = EventStoreRecord {
            record_id: Uuid::new_v4(),
            context_id: event.context_id.clone(),
            source_service: event.source_service.clone(),
            event: event.clone(),
            status: EventStatus::Unprocessed,
            in_flight: true,
            origin_node: origin_node.to_string(),
            recorded_on: now,
            claimed_on: Some(now),
            claim_token: Uuid::new_v4(),
            sequence: 0,
        };
        table.keys_by_id.insert(record.record_id, key.clone());
        table.records.insert(key, record.clone());
        Ok(ClaimOutcome::Claimed(record))
    }

    async fn mark_processed(&self, record_id: Uuid) -> Result<EventStoreRecord, StoreError> {
        let mut table = self.table.write().await;
        let sequence = table.last_sequence + 1;
        let record = table.by_id(record_id)?;
        if record.status == EventStatus::Processed {
            return Ok(record.clone());
        }
        record.status = EventStatus::Processed;
        record.in_flight = false;
        record.claimed_on = None;
        record.sequence = sequence;
        let processed = record.clone();
        table.last_sequence = sequence;
        Ok(processed)
    }

    async fn release(&self, record_id: Uuid, claim_token: Uuid) -> Result<(), StoreError> {
        let mut table = self.table.write().await;
        let record = table.by_id(record_id)?;
        if record.status == EventStatus::Unprocessed && record.claim_token == claim_token {
            record.in_flight = false;
            record.claimed_on = None;
        }
        Ok(())
    }

    async fn find(&self, context_id: &str, source_service: &str) -> Result<Option<EventStoreRecord>, StoreError> {
        let key = (context_id.to_string(), source_service.to_string());
        Ok(self.table.read().await.records.get(&key).cloned())
    }

    async fn processed_after(&self, after: u64, limit: usize) -> Result<Vec<EventStoreRecord>, StoreError> {
        let table = self.table.read().await;
        let mut records: Vec<EventStoreRecord> = table
            .records
            .values()
            .filter(|r| r.status == EventStatus::Processed && r.sequence > after)
            .cloned()
            .collect();
        records.sort_by_key(|r| r.sequence);
        records.truncate(limit);
        Ok(records)
    }

    async fn purge_processed(&self, sequence: u64, older_than: DateTime<Utc>) -> Result<usize, StoreError> {
        let mut table = self.table.write().await;
        let doomed: Vec<(Uuid, EventKey, u64)> = table
            .records
            .iter()
            .filter(|(_, r)| {
                r.status == EventStatus::Processed && r.sequence <= sequence && r.recorded_on < older_than
            })
            .map(|(key, r)| (r.record_id, key.clone(), r.sequence))
            .collect();

        for (record_id, key, processed_at) in &doomed {
            table.records.remove(key);
            table.keys_by_id.remove(record_id);
            table.tombstones.insert(key.clone(), *processed_at);
        }
        Ok(doomed.len())
    }

    async fn load_cursor(&self, consumer: &str) -> Result<Option<u64>, StoreError> {
        Ok(self.table.read().await.cursors.get(consumer).copied())
    }

    async fn save_cursor(&self, consumer: &str, sequence: u64) -> Result<(), StoreError> {
        let mut table = self.table.write().await;
        let cursor = table.cursors.entry(consumer.to_string()).or_default();
        *cursor = (*cursor).max(sequence);
        Ok(())
    }

    async fn min_cursor(&self) -> Result<Option<u64>, StoreError> {
        Ok(self.table.read().await.cursors.values().min().copied())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventAction;

    fn event(context_id: &str) -> ServiceEvent {
        ServiceEvent::new(context_id, "test", "1", "thing", "t-1", EventAction::Updated)
    }

    const LEASE: Duration = Duration::from_secs(30);

    #[tokio::test]
    async fn test_live_claim_blocks_and_expired_claim_is_taken_over() {
        let store = InMemoryEventStore::new();
        let ClaimOutcome::Claimed(first) = store.claim(&event("c1"), "node-a", LEASE).await.unwrap() else {
            panic!("first claim must win");
        };
        assert_eq!(store.claim(&event("c1"), "node-b", LEASE).await.unwrap(), ClaimOutcome::InFlight);

        let ClaimOutcome::Claimed(second) = store.claim(&event("c1"), "node-b", Duration::ZERO).await.unwrap() else {
            panic!("expired claim must be taken over");
        };
        assert_eq!(second.record_id, first.record_id);
        assert_eq!(second.origin_node, "node-b");
        assert_ne!(second.claim_token, first.claim_token);

        // The abandoned holder cannot release the new claim
        store.release(first.record_id, first.claim_token).await.unwrap();
        assert!(store.find("c1", "test").await.unwrap().unwrap().in_flight);
    }

    #[tokio::test]
    async fn test_purged_key_stays_processed() {
        let store = InMemoryEventStore::new();
        let ClaimOutcome::Claimed(record) = store.claim(&event("c1"), "node-a", LEASE).await.unwrap() else {
            panic!("claim must win");
        };
        let processed = store.mark_processed(record.record_id).await.unwrap();

        let purged = store
            .purge_processed(processed.sequence, Utc::now() + chrono::Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(purged, 1);
        assert_eq!(store.count().await, 0);
        assert_eq!(store.tombstone_count().await, 1);
        assert_eq!(
            store.claim(&event("c1"), "node-a", LEASE).await.unwrap(),
            ClaimOutcome::AlreadyProcessed
        );
    }

    #[tokio::test]
    async fn test_cursors_only_move_forward() {
        let store = InMemoryEventStore::new();
        assert_eq!(store.min_cursor().await.unwrap(), None);
        store.save_cursor("node-a", 5).await.unwrap();
        store.save_cursor("node-a", 3).await.unwrap();
        store.save_cursor("node-b", 2).await.unwrap();
        assert_eq!(store.load_cursor("node-a").await.unwrap(), Some(5));
        assert_eq!(store.min_cursor().await.unwrap(), Some(2));
    }
}
