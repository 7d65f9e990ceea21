//! Priority queue with delayed-visibility requeues.
//!
//! Ordering: highest priority first, FIFO within a priority (earliest
//! `created_at`, then submission sequence for same-instant ties). Retried
//! tasks sit in a delay list and are promoted into the live heap once
//! their backoff elapses.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::Instant;
use uuid::Uuid;

use crate::error::ValidationError;

#[derive(Debug, Clone, PartialEq, Eq)]
struct QueueEntry {
    id: Uuid,
    priority: i32,
    created_at: DateTime<Utc>,
    seq: u64,
}

impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Max-heap: greater sorts out first.
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.created_at.cmp(&self.created_at))
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug)]
struct DelayedEntry {
    ready_at: Instant,
    entry: QueueEntry,
}

/// Pending-task queue. Not synchronized; the scheduler wraps it in a lock.
#[derive(Debug)]
pub(crate) struct PendingQueue {
    heap: BinaryHeap<QueueEntry>,
    delayed: Vec<DelayedEntry>,
    seq: u64,
    capacity: usize,
}

impl PendingQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            heap: BinaryHeap::new(),
            delayed: Vec::new(),
            seq: 0,
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.heap.len() + self.delayed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn next_entry(&mut self, id: Uuid, priority: i32, created_at: DateTime<Utc>) -> QueueEntry {
        self.seq += 1;
        QueueEntry {
            id,
            priority,
            created_at,
            seq: self.seq,
        }
    }

    /// Enqueue a new submission. Capacity is enforced here only; requeues
    /// of already-admitted tasks always fit.
    pub fn push(
        &mut self,
        id: Uuid,
        priority: i32,
        created_at: DateTime<Utc>,
    ) -> Result<(), ValidationError> {
        if self.len() >= self.capacity {
            return Err(ValidationError::QueueFull {
                capacity: self.capacity,
            });
        }
        let entry = self.next_entry(id, priority, created_at);
        self.heap.push(entry);
        Ok(())
    }

    /// Re-enqueue a retrying task, invisible until `delay` elapses.
    pub fn push_delayed(
        &mut self,
        id: Uuid,
        priority: i32,
        created_at: DateTime<Utc>,
        delay: Duration,
    ) {
        let entry = self.next_entry(id, priority, created_at);
        self.delayed.push(DelayedEntry {
            ready_at: Instant::now() + delay,
            entry,
        });
    }

    /// Move matured delayed entries into the live heap.
    pub fn promote(&mut self, now: Instant) {
        let mut index = 0;
        while index < self.delayed.len() {
            if self.delayed[index].ready_at <= now {
                let ready = self.delayed.swap_remove(index);
                self.heap.push(ready.entry);
            } else {
                index += 1;
            }
        }
    }

    /// Remove and return the best eligible task id.
    pub fn pop(&mut self, now: Instant) -> Option<Uuid> {
        self.promote(now);
        self.heap.pop().map(|entry| entry.id)
    }

    /// Remove a queued or delayed task (cancellation). Returns whether the
    /// task was present.
    pub fn remove(&mut self, id: Uuid) -> bool {
        let before = self.len();
        let kept: BinaryHeap<QueueEntry> =
            self.heap.drain().filter(|entry| entry.id != id).collect();
        self.heap = kept;
        self.delayed.retain(|delayed| delayed.entry.id != id);
        self.len() < before
    }

    #[cfg(test)]
    pub fn delayed_len(&self) -> usize {
        self.delayed.len()
    }
}
