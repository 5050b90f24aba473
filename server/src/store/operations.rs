use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::StoreError;
use crate::command::{DeviceManagementOperation, OperationRepository};

/// In-memory implementation of OperationRepository using HashMap
pub struct InMemoryOperationStore {
    operations: Arc<RwLock<HashMap<Uuid, DeviceManagementOperation>>>,
}

impl InMemoryOperationStore {
    pub fn new() -> Self {
        Self {
            operations: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub async fn count(&self) -> usize {
        self.operations.read().await.len()
    }
}

impl Default for InMemoryOperationStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl OperationRepository for InMemoryOperationStore {
    async fn create(&self, operation: DeviceManagementOperation) -> Result<(), StoreError> {
        let mut operations = self.operations.write().await;
        if operations.contains_key(&operation.operation_id) {
            return Err(StoreError::Duplicate {
                entity: "operation",
                id: operation.operation_id.to_string(),
            });
        }
        operations.insert(operation.operation_id, operation);
        Ok(())
    }

    async fn find(&self, operation_id: Uuid) -> Result<Option<DeviceManagementOperation>, StoreError> {
        Ok(self.operations.read().await.get(&operation_id).cloned())
    }

    async fn update(&self, mut operation: DeviceManagementOperation) -> Result<(), StoreError> {
        let mut operations = self.operations.write().await;
        let stored = operations
            .get_mut(&operation.operation_id)
            .ok_or_else(|| StoreError::NotFound {
                entity: "operation",
                id: operation.operation_id.to_string(),
            })?;
        if stored.version != operation.version {
            return Err(StoreError::Conflict {
                entity: "operation",
                id: operation.operation_id.to_string(),
                expected: operation.version,
                found: stored.version,
            });
        }
        operation.version += 1;
        *stored = operation;
        Ok(())
    }
}
