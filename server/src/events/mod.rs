//! Idempotent business event recording
//!
//! Every side effect that must happen exactly once despite redelivery goes
//! through [`EventRecorder::record_once`]. Local listeners (cache
//! invalidation, audit) hear about each unique event once; house-keeping
//! replays events other nodes processed.

mod housekeeping;
mod recorder;
mod store;

pub use housekeeping::{HouseKeeper, HousekeepingReport};
pub use recorder::{EventRecorder, EventStoreError, RecordOutcome, DEFAULT_CLAIM_LEASE};
pub use store::{ClaimOutcome, EventStatus, EventStoreRecord, EventStoreRepository};

#[cfg(test)]
pub use store::MockEventStoreRepository;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventAction {
    Created,
    Updated,
    Deleted,
    Executed,
}

/// A business event; `(context_id, source_service)` identifies it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceEvent {
    pub context_id: String,
    pub source_service: String,
    pub tenant_id: String,
    pub entity_type: String,
    pub entity_id: String,
    pub action: EventAction,
    pub occurred_on: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
}

impl ServiceEvent {
    pub fn new(
        context_id: impl Into<String>,
        source_service: impl Into<String>,
        tenant_id: impl Into<String>,
        entity_type: impl Into<String>,
        entity_id: impl Into<String>,
        action: EventAction,
    ) -> Self {
        Self {
            context_id: context_id.into(),
            source_service: source_service.into(),
            tenant_id: tenant_id.into(),
            entity_type: entity_type.into(),
            entity_id: entity_id.into(),
            action,
            occurred_on: Utc::now(),
            payload: None,
        }
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = Some(payload);
        self
    }
}

/// Hears about every unique event once per node
#[async_trait]
pub trait EventListener: Send + Sync {
    fn name(&self) -> &str;

    async fn on_event(&self, event: &ServiceEvent) -> anyhow::Result<()>;
}
