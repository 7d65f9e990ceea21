//! Metrics boundary — fire-and-forget engine events.
//!
//! The engine emits a [`MetricEvent`] at every externally observable state
//! change; sinks turn them into counters, timers, or dashboard pushes. The
//! engine never blocks on a sink, so implementations must be cheap and
//! non-blocking (queue internally if delivery is slow).

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// An engine event worth counting.
#[derive(Debug, Clone, PartialEq)]
pub enum MetricEvent {
    /// A submission passed validation and entered the queue.
    TaskSubmitted,
    /// A worker slot picked a task up and invoked the executor.
    TaskDispatched,
    /// An attempt finished successfully.
    TaskSucceeded { duration: Duration, items_scraped: u64 },
    /// A task exhausted its retry budget (or was abandoned at shutdown).
    TaskFailed { kind: String },
    /// A retryable failure was re-enqueued.
    TaskRetried { retry_count: u32 },
    /// A task reached the cancelled state.
    TaskCancelled,
    /// A proxy crossed the consecutive-failure threshold.
    ProxyMarkedUnhealthy,
    /// An unhealthy proxy was restored by a passive success or a probe.
    ProxyRestored,
}

/// Sink for engine events. Must never block the caller.
pub trait MetricsSink: Send + Sync {
    fn record(&self, event: MetricEvent);
}

/// Sink that drops every event.
#[derive(Debug, Default)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn record(&self, _event: MetricEvent) {}
}

/// Sink that keeps atomic counters per event class. Used by tests and as a
/// cheap in-process view for `pool_stats`-style dashboards.
#[derive(Debug, Default)]
pub struct CountingMetrics {
    submitted: AtomicU64,
    dispatched: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    retried: AtomicU64,
    cancelled: AtomicU64,
    proxies_marked_unhealthy: AtomicU64,
    proxies_restored: AtomicU64,
}

impl CountingMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn submitted(&self) -> u64 {
        self.submitted.load(Ordering::Relaxed)
    }

    pub fn dispatched(&self) -> u64 {
        self.dispatched.load(Ordering::Relaxed)
    }

    pub fn succeeded(&self) -> u64 {
        self.succeeded.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    pub fn retried(&self) -> u64 {
        self.retried.load(Ordering::Relaxed)
    }

    pub fn cancelled(&self) -> u64 {
        self.cancelled.load(Ordering::Relaxed)
    }

    pub fn proxies_marked_unhealthy(&self) -> u64 {
        self.proxies_marked_unhealthy.load(Ordering::Relaxed)
    }

    pub fn proxies_restored(&self) -> u64 {
        self.proxies_restored.load(Ordering::Relaxed)
    }
}

impl MetricsSink for CountingMetrics {
    fn record(&self, event: MetricEvent) {
        let counter = match event {
            MetricEvent::TaskSubmitted => &self.submitted,
            MetricEvent::TaskDispatched => &self.dispatched,
            MetricEvent::TaskSucceeded { .. } => &self.succeeded,
            MetricEvent::TaskFailed { .. } => &self.failed,
            MetricEvent::TaskRetried { .. } => &self.retried,
            MetricEvent::TaskCancelled => &self.cancelled,
            MetricEvent::ProxyMarkedUnhealthy => &self.proxies_marked_unhealthy,
            MetricEvent::ProxyRestored => &self.proxies_restored,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}
