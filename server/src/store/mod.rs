//! Storage seams
//!
//! Every repository trait returns [`StoreError`]. The in-memory
//! implementations here back the binary and the tests; a durable backend
//! implements the same traits.

mod events;
mod jobs;
mod operations;

pub use events::InMemoryEventStore;
pub use jobs::{InMemoryJobExecutionStore, InMemoryJobStore, InMemoryJobTargetStore};
pub use operations::InMemoryOperationStore;

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("{entity} {id} was modified concurrently (expected version {expected}, found {found})")]
    Conflict {
        entity: &'static str,
        id: String,
        expected: u64,
        found: u64,
    },

    #[error("{entity} already exists: {id}")]
    Duplicate { entity: &'static str, id: String },

    #[error("Storage backend error: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict { .. })
    }
}
