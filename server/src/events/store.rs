use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

use super::ServiceEvent;
use crate::store::StoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventStatus {
    Unprocessed,
    Processed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventStoreRecord {
    pub record_id: Uuid,
    pub context_id: String,
    pub source_service: String,
    pub event: ServiceEvent,
    pub status: EventStatus,
    /// Set while some node is running the effect
    pub in_flight: bool,
    /// Node that recorded the event, or holds the current claim
    pub origin_node: String,
    pub recorded_on: DateTime<Utc>,
    /// Start of the current claim's lease
    #[serde(default)]
    pub claimed_on: Option<DateTime<Utc>>,
    /// Identifies the current claim; a release from an older claim is ignored
    #[serde(default = "Uuid::nil")]
    pub claim_token: Uuid,
    /// Assigned when the record becomes PROCESSED; orders house-keeping
    pub sequence: u64,
}

impl EventStoreRecord {
    /// Whether the claim on this record ran past `lease` at `now`
    pub fn lease_expired(&self, lease: Duration, now: DateTime<Utc>) -> bool {
        let Some(claimed_on) = self.claimed_on else {
            return true;
        };
        chrono::Duration::from_std(lease)
            .ok()
            .and_then(|lease| claimed_on.checked_add_signed(lease))
            .is_some_and(|until| until <= now)
    }
}

/// Result of trying to take ownership of an event
#[derive(Debug, Clone, PartialEq)]
pub enum ClaimOutcome {
    Claimed(EventStoreRecord),
    AlreadyProcessed,
    /// Another delivery holds an unexpired claim and is running the effect
    InFlight,
}

/// Dedup store keyed by `(context_id, source_service)`.
///
/// `claim` must be atomic: of any number of concurrent claims for one key,
/// exactly one returns `Claimed`. A claim older than the lease may be taken
/// over. Purging keeps the dedup key so a processed event never runs again.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait EventStoreRepository: Send + Sync {
    async fn claim(
        &self,
        event: &ServiceEvent,
        origin_node: &str,
        lease: Duration,
    ) -> Result<ClaimOutcome, StoreError>;

    async fn mark_processed(&self, record_id: Uuid) -> Result<EventStoreRecord, StoreError>;

    /// Give up a claim after the effect failed so a redelivery can retry
    async fn release(&self, record_id: Uuid, claim_token: Uuid) -> Result<(), StoreError>;

    async fn find(&self, context_id: &str, source_service: &str) -> Result<Option<EventStoreRecord>, StoreError>;

    /// PROCESSED records with a sequence above `after`, oldest first
    async fn processed_after(&self, after: u64, limit: usize) -> Result<Vec<EventStoreRecord>, StoreError>;

    /// Drop PROCESSED records at or below `sequence` recorded before
    /// `older_than`, keeping their dedup keys
    async fn purge_processed(&self, sequence: u64, older_than: DateTime<Utc>) -> Result<usize, StoreError>;

    async fn load_cursor(&self, consumer: &str) -> Result<Option<u64>, StoreError>;

    async fn save_cursor(&self, consumer: &str, sequence: u64) -> Result<(), StoreError>;

    /// Lowest cursor over every consumer that ever saved one
    async fn min_cursor(&self) -> Result<Option<u64>, StoreError>;
}
