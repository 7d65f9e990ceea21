//! Persistence boundaries — task records and proxy snapshots.
//!
//! Durability is owned by external collaborators. The engine calls `save`
//! on every transition it makes durable but never waits for the write:
//! saves are spawned fire-and-forget and logged on failure.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::StoreError;
use crate::proxy::{ProxyEndpoint, ProxyStats};
use crate::task::Task;

/// Durable task records.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Persist the current state of a task record.
    async fn save(&self, task: &Task) -> Result<(), StoreError>;

    /// Load a task record by id.
    async fn load(&self, id: Uuid) -> Result<Option<Task>, StoreError>;
}

/// Proxy list source and stat snapshot sink.
#[async_trait]
pub trait ProxyStore: Send + Sync {
    /// Load the initial proxy list.
    async fn load(&self) -> Result<Vec<ProxyEndpoint>, StoreError>;

    /// Persist a health/stat snapshot of the pool.
    async fn save_snapshot(&self, stats: &[ProxyStats]) -> Result<(), StoreError>;
}

/// Fire-and-forget persistence of a task record.
pub(crate) fn persist_task(store: Option<Arc<dyn TaskStore>>, task: Task) {
    if let Some(store) = store {
        tokio::spawn(async move {
            if let Err(e) = store.save(&task).await {
                tracing::warn!(task_id = %task.id, error = %e, "Failed to persist task");
            }
        });
    }
}

/// In-memory task store. Useful for tests and proxyless demos; everything
/// is lost on drop.
#[derive(Debug, Default)]
pub struct MemoryTaskStore {
    tasks: RwLock<HashMap<Uuid, Task>>,
}

impl MemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records currently held.
    pub async fn len(&self) -> usize {
        self.tasks.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.tasks.read().await.is_empty()
    }
}

#[async_trait]
impl TaskStore for MemoryTaskStore {
    async fn save(&self, task: &Task) -> Result<(), StoreError> {
        self.tasks.write().await.insert(task.id, task.clone());
        Ok(())
    }

    async fn load(&self, id: Uuid) -> Result<Option<Task>, StoreError> {
        Ok(self.tasks.read().await.get(&id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskSpec;

    #[tokio::test]
    async fn memory_store_round_trip() {
        let store = MemoryTaskStore::new();
        let task = Task::from_spec(TaskSpec::new("books", "https://example.com/books"))
            .expect("valid spec");

        store.save(&task).await.unwrap();
        let loaded = store.load(task.id).await.unwrap().expect("present");
        assert_eq!(loaded.id, task.id);
        assert_eq!(loaded.target_url, "https://example.com/books");

        let missing = store.load(Uuid::new_v4()).await.unwrap();
        assert!(missing.is_none());
    }
}
