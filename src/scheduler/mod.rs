//! Scheduler — validated admission, priority dispatch, retry requeues,
//! cancellation.
//!
//! The scheduler owns the pending queue and shares the task registry with
//! the worker pool. A task is removed from the queue before it is handed to
//! a slot, which is what guarantees at most one active execution per task.

mod queue;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{TaskError, ValidationError};
use crate::task::{Task, TaskRegistry, TaskSpec, TaskStatus};

use self::queue::PendingQueue;

/// Observable effect of a cancel call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The task was still pending and is now cancelled.
    Cancelled,
    /// The task is running; cooperative cancellation was requested and the
    /// status flips once the worker acknowledges.
    CancelRequested,
    /// The task had already reached a terminal status. Calling cancel
    /// again is a no-op.
    AlreadyTerminal(TaskStatus),
}

/// Orders pending tasks and hands them to idle worker slots.
pub struct Scheduler {
    registry: Arc<TaskRegistry>,
    queue: Mutex<PendingQueue>,
}

impl Scheduler {
    pub fn new(registry: Arc<TaskRegistry>, queue_capacity: usize) -> Self {
        Self {
            registry,
            queue: Mutex::new(PendingQueue::new(queue_capacity)),
        }
    }

    /// Validate a submission and enqueue the resulting pending task.
    pub async fn submit(&self, spec: TaskSpec) -> Result<Task, ValidationError> {
        let task = Task::from_spec(spec)?;
        self.registry.insert(task.clone()).await;

        let enqueued = {
            let mut queue = self.queue.lock().await;
            queue.push(task.id, task.priority, task.created_at)
        };
        if let Err(e) = enqueued {
            // Roll the registry back so the rejected task leaves no trace.
            self.registry.remove(task.id).await;
            return Err(e);
        }

        info!(
            task_id = %task.id,
            name = %task.name,
            priority = task.priority,
            "Task submitted"
        );
        Ok(task)
    }

    /// Remove and return the highest-priority eligible task.
    ///
    /// An empty queue yields `None`; that is the normal idle signal, not
    /// an error.
    pub async fn next(&self) -> Option<Task> {
        loop {
            let id = {
                let mut queue = self.queue.lock().await;
                queue.pop(Instant::now())
            }?;

            match self.registry.get(id).await {
                Ok(task) => return Some(task),
                // Rolled back or externally pruned between enqueue and pop.
                Err(TaskError::NotFound { .. }) => {
                    debug!(task_id = %id, "Dropping queued id with no registry entry");
                    continue;
                }
                Err(_) => continue,
            }
        }
    }

    /// Reinsert a retryable task with its visibility delayed by `delay`.
    ///
    /// A running attempt is reset to pending; a task that never left
    /// pending (proxy exhaustion before dispatch) is re-delayed as-is.
    pub async fn requeue(&self, task: &Task, delay: Duration) -> Result<(), TaskError> {
        self.registry
            .update(task.id, |t| {
                if t.status == TaskStatus::Running {
                    t.transition_to(TaskStatus::Pending)
                } else {
                    Ok(())
                }
            })
            .await??;

        let mut queue = self.queue.lock().await;
        queue.push_delayed(task.id, task.priority, task.created_at, delay);
        debug!(task_id = %task.id, delay_ms = delay.as_millis() as u64, "Task requeued");
        Ok(())
    }

    /// Cancel a task. Idempotent: repeated calls observe the same effect.
    pub async fn cancel(&self, id: Uuid) -> Result<CancelOutcome, TaskError> {
        let task = self.registry.get(id).await?;
        if task.status.is_terminal() {
            return Ok(CancelOutcome::AlreadyTerminal(task.status));
        }

        let removed = {
            let mut queue = self.queue.lock().await;
            queue.remove(id)
        };

        if removed {
            self.registry
                .update(id, |t| t.transition_to(TaskStatus::Cancelled))
                .await??;
            info!(task_id = %id, "Task cancelled while pending");
            return Ok(CancelOutcome::Cancelled);
        }

        // Already picked up (or mid-handoff): flag it and let the worker
        // acknowledge at its next safe point.
        self.registry.request_cancel(id).await?;
        info!(task_id = %id, "Cancellation requested for running task");
        Ok(CancelOutcome::CancelRequested)
    }

    /// Promote matured delayed requeues. Called by the maintenance tick;
    /// `next()` also promotes on its own.
    pub async fn promote_delayed(&self) {
        let mut queue = self.queue.lock().await;
        queue.promote(Instant::now());
    }

    /// Number of queued tasks (live + delayed).
    pub async fn queue_len(&self) -> usize {
        self.queue.lock().await.len()
    }
}
