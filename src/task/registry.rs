//! Shared task registry — live statuses, cancellation flags, snapshots.
//!
//! The registry is the single in-process source of truth for task records.
//! Workers and the scheduler mutate entries through `update`, one writer at
//! a time under the lock; everything handed out is a snapshot clone.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::TaskError;
use crate::task::model::{Task, TaskStatus};

struct TaskEntry {
    task: Task,
    /// Cooperative cancellation flag, observed by the owning worker at its
    /// next safe point.
    cancel_requested: Arc<AtomicBool>,
    /// Proxy used by the immediately preceding attempt, excluded from the
    /// next selection.
    last_proxy: Option<Uuid>,
}

/// Tracks all tasks known to the engine.
#[derive(Default)]
pub struct TaskRegistry {
    entries: RwLock<HashMap<Uuid, TaskEntry>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a freshly validated task.
    pub async fn insert(&self, task: Task) {
        let entry = TaskEntry {
            cancel_requested: Arc::new(AtomicBool::new(false)),
            last_proxy: None,
            task,
        };
        self.entries.write().await.insert(entry.task.id, entry);
    }

    /// Drop a task record (submission rollback).
    pub async fn remove(&self, id: Uuid) {
        self.entries.write().await.remove(&id);
    }

    /// Snapshot of a task by id.
    pub async fn get(&self, id: Uuid) -> Result<Task, TaskError> {
        self.entries
            .read()
            .await
            .get(&id)
            .map(|e| e.task.clone())
            .ok_or(TaskError::NotFound { id })
    }

    /// Mutate a task record under the write lock.
    pub async fn update<F, R>(&self, id: Uuid, f: F) -> Result<R, TaskError>
    where
        F: FnOnce(&mut Task) -> R,
    {
        let mut entries = self.entries.write().await;
        let entry = entries.get_mut(&id).ok_or(TaskError::NotFound { id })?;
        Ok(f(&mut entry.task))
    }

    /// Handle to the cooperative cancellation flag.
    pub async fn cancel_flag(&self, id: Uuid) -> Result<Arc<AtomicBool>, TaskError> {
        self.entries
            .read()
            .await
            .get(&id)
            .map(|e| Arc::clone(&e.cancel_requested))
            .ok_or(TaskError::NotFound { id })
    }

    /// Request cooperative cancellation. Idempotent.
    pub async fn request_cancel(&self, id: Uuid) -> Result<(), TaskError> {
        let entries = self.entries.read().await;
        let entry = entries.get(&id).ok_or(TaskError::NotFound { id })?;
        entry.cancel_requested.store(true, Ordering::SeqCst);
        Ok(())
    }

    pub async fn cancel_requested(&self, id: Uuid) -> Result<bool, TaskError> {
        let entries = self.entries.read().await;
        let entry = entries.get(&id).ok_or(TaskError::NotFound { id })?;
        Ok(entry.cancel_requested.load(Ordering::SeqCst))
    }

    /// Record the proxy chosen for the current attempt.
    pub async fn set_last_proxy(&self, id: Uuid, proxy: Option<Uuid>) -> Result<(), TaskError> {
        let mut entries = self.entries.write().await;
        let entry = entries.get_mut(&id).ok_or(TaskError::NotFound { id })?;
        entry.last_proxy = proxy;
        Ok(())
    }

    pub async fn last_proxy(&self, id: Uuid) -> Result<Option<Uuid>, TaskError> {
        let entries = self.entries.read().await;
        let entry = entries.get(&id).ok_or(TaskError::NotFound { id })?;
        Ok(entry.last_proxy)
    }

    /// Snapshots of all tasks, optionally filtered by status.
    pub async fn list(&self, filter: Option<TaskStatus>) -> Vec<Task> {
        self.entries
            .read()
            .await
            .values()
            .filter(|e| filter.is_none_or(|status| e.task.status == status))
            .map(|e| e.task.clone())
            .collect()
    }

    /// Ids of tasks currently in the running state.
    pub async fn running_ids(&self) -> Vec<Uuid> {
        self.entries
            .read()
            .await
            .values()
            .filter(|e| e.task.status == TaskStatus::Running)
            .map(|e| e.task.id)
            .collect()
    }

    pub async fn running_count(&self) -> usize {
        self.entries
            .read()
            .await
            .values()
            .filter(|e| e.task.status == TaskStatus::Running)
            .count()
    }
}
