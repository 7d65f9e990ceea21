//! Worker pool — fixed execution slots over the shared scheduler.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{Mutex, RwLock, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

use crate::executor::Executor;
use crate::metrics::MetricsSink;
use crate::proxy::ProxyPool;
use crate::scheduler::Scheduler;
use crate::store::TaskStore;
use crate::task::{RetryPolicy, TaskRegistry};
use crate::worker::runner;

/// Shared dependencies for slot execution.
#[derive(Clone)]
pub struct WorkerDeps {
    pub scheduler: Arc<Scheduler>,
    pub registry: Arc<TaskRegistry>,
    pub proxies: Arc<ProxyPool>,
    pub executor: Arc<dyn Executor>,
    pub store: Option<Arc<dyn TaskStore>>,
    pub metrics: Arc<dyn MetricsSink>,
    pub retry_policy: RetryPolicy,
    /// Per-attempt executor timeout.
    pub task_timeout: Duration,
    /// Idle sleep between queue polls.
    pub idle_poll_interval: Duration,
    /// Floor for requeue delays caused by proxy exhaustion.
    pub proxy_cooldown: Duration,
}

/// Live state of one slot, shared between its loop and `pool_stats`.
pub(crate) struct SlotState {
    pub(crate) index: usize,
    current_task: RwLock<Option<Uuid>>,
    tasks_completed: AtomicU64,
    tasks_failed: AtomicU64,
    busy_ms: AtomicU64,
}

impl SlotState {
    fn new(index: usize) -> Self {
        Self {
            index,
            current_task: RwLock::new(None),
            tasks_completed: AtomicU64::new(0),
            tasks_failed: AtomicU64::new(0),
            busy_ms: AtomicU64::new(0),
        }
    }

    pub(crate) async fn set_current(&self, task: Option<Uuid>) {
        *self.current_task.write().await = task;
    }

    pub(crate) fn record_completed(&self, busy: Duration) {
        self.tasks_completed.fetch_add(1, Ordering::Relaxed);
        self.busy_ms.fetch_add(busy.as_millis() as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_failed(&self, busy: Duration) {
        self.tasks_failed.fetch_add(1, Ordering::Relaxed);
        self.busy_ms.fetch_add(busy.as_millis() as u64, Ordering::Relaxed);
    }

    async fn snapshot(&self) -> WorkerSlotStats {
        WorkerSlotStats {
            slot: self.index,
            current_task_id: *self.current_task.read().await,
            tasks_completed: self.tasks_completed.load(Ordering::Relaxed),
            tasks_failed: self.tasks_failed.load(Ordering::Relaxed),
            busy_ms: self.busy_ms.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of one worker slot.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerSlotStats {
    pub slot: usize,
    pub current_task_id: Option<Uuid>,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub busy_ms: u64,
}

/// Snapshot of the whole pool.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerPoolStats {
    pub capacity: usize,
    pub busy: usize,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub slots: Vec<WorkerSlotStats>,
}

/// Fixed pool of worker slots. Slots are tokio tasks running
/// [`runner::slot_loop`]; the pool owns their lifecycle.
pub struct WorkerPool {
    deps: WorkerDeps,
    slots: Vec<Arc<SlotState>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    shutdown_tx: watch::Sender<bool>,
    started: AtomicBool,
}

impl WorkerPool {
    pub fn new(capacity: usize, deps: WorkerDeps) -> Self {
        let capacity = capacity.max(1);
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            deps,
            slots: (0..capacity).map(|i| Arc::new(SlotState::new(i))).collect(),
            handles: Mutex::new(Vec::new()),
            shutdown_tx,
            started: AtomicBool::new(false),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Spawn the slot loops. Calling start twice is a no-op.
    pub async fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            warn!("Worker pool already started");
            return;
        }

        let mut handles = self.handles.lock().await;
        for state in &self.slots {
            let handle = tokio::spawn(runner::slot_loop(
                Arc::clone(state),
                self.deps.clone(),
                self.shutdown_tx.subscribe(),
            ));
            handles.push(handle);
        }
        info!(capacity = self.slots.len(), "Worker pool started");
    }

    /// Tell all slots to stop pulling work.
    pub fn signal_shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Wait up to `grace` for every slot loop to finish. On expiry the
    /// remaining loops are aborted (in-flight executor futures are dropped)
    /// and `false` is returned.
    pub async fn join_with_grace(&self, grace: Duration) -> bool {
        let drained: Vec<JoinHandle<()>> = {
            let mut handles = self.handles.lock().await;
            handles.drain(..).collect()
        };
        if drained.is_empty() {
            return true;
        }

        let aborts: Vec<_> = drained.iter().map(|h| h.abort_handle()).collect();
        let joined = tokio::time::timeout(grace, futures::future::join_all(drained)).await;
        match joined {
            Ok(_) => true,
            Err(_) => {
                warn!("Shutdown grace expired, aborting worker slots");
                for abort in aborts {
                    abort.abort();
                }
                // Aborted loops never clear their own slot state.
                for state in &self.slots {
                    state.set_current(None).await;
                }
                false
            }
        }
    }

    /// Non-blocking snapshot for the dashboard layer.
    pub async fn stats(&self) -> WorkerPoolStats {
        let mut slots = Vec::with_capacity(self.slots.len());
        for state in &self.slots {
            slots.push(state.snapshot().await);
        }
        WorkerPoolStats {
            capacity: self.slots.len(),
            busy: slots.iter().filter(|s| s.current_task_id.is_some()).count(),
            tasks_completed: slots.iter().map(|s| s.tasks_completed).sum(),
            tasks_failed: slots.iter().map(|s| s.tasks_failed).sum(),
            slots,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    use crate::config::ProxyConfig;
    use crate::error::ExecutorError;
    use crate::executor::{ExecutionReport, ExecutionRequest};
    use crate::metrics::NoopMetrics;
    use crate::task::TaskSpec;

    /// Executor that parks until released, tracking its concurrency
    /// high-water mark.
    struct GatedExecutor {
        release: tokio::sync::Notify,
        in_flight: AtomicUsize,
        peak: AtomicUsize,
    }

    impl GatedExecutor {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                release: tokio::sync::Notify::new(),
                in_flight: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl Executor for GatedExecutor {
        async fn execute(
            &self,
            _request: ExecutionRequest,
        ) -> Result<ExecutionReport, ExecutorError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            self.release.notified().await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(ExecutionReport {
                items_scraped: 1,
                artifact_ref: None,
            })
        }
    }

    fn deps(executor: Arc<dyn Executor>) -> (WorkerDeps, Arc<Scheduler>) {
        let registry = Arc::new(TaskRegistry::new());
        let scheduler = Arc::new(Scheduler::new(Arc::clone(&registry), 64));
        let deps = WorkerDeps {
            scheduler: Arc::clone(&scheduler),
            registry,
            proxies: Arc::new(ProxyPool::new(ProxyConfig::default())),
            executor,
            store: None,
            metrics: Arc::new(NoopMetrics),
            retry_policy: RetryPolicy {
                base_delay: Duration::from_millis(5),
                max_delay: Duration::from_millis(20),
                multiplier: 2.0,
                jitter: false,
            },
            task_timeout: Duration::from_secs(5),
            idle_poll_interval: Duration::from_millis(10),
            proxy_cooldown: Duration::from_millis(10),
        };
        (deps, scheduler)
    }

    #[tokio::test]
    async fn running_tasks_never_exceed_capacity() {
        let executor = GatedExecutor::new();
        let (deps, scheduler) = deps(Arc::clone(&executor) as Arc<dyn Executor>);
        let registry = Arc::clone(&deps.registry);
        let pool = WorkerPool::new(2, deps);
        pool.start().await;

        for _ in 0..5 {
            scheduler
                .submit(TaskSpec::new("t", "https://example.com"))
                .await
                .unwrap();
        }

        // Let both slots saturate.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(registry.running_count().await, 2);
        assert_eq!(executor.peak.load(Ordering::SeqCst), 2);

        // Release everything and drain.
        for _ in 0..16 {
            executor.release.notify_waiters();
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        assert!(executor.peak.load(Ordering::SeqCst) <= 2);

        pool.signal_shutdown();
        executor.release.notify_waiters();
        assert!(pool.join_with_grace(Duration::from_secs(1)).await);
    }

    #[tokio::test]
    async fn start_twice_is_a_noop() {
        let executor = GatedExecutor::new();
        let (deps, _scheduler) = deps(executor as Arc<dyn Executor>);
        let pool = WorkerPool::new(1, deps);
        pool.start().await;
        pool.start().await;
        assert_eq!(pool.handles.lock().await.len(), 1);

        pool.signal_shutdown();
        assert!(pool.join_with_grace(Duration::from_secs(1)).await);
    }

    #[tokio::test]
    async fn stats_reflect_busy_slots() {
        let executor = GatedExecutor::new();
        let (deps, scheduler) = deps(Arc::clone(&executor) as Arc<dyn Executor>);
        let pool = WorkerPool::new(1, deps);
        pool.start().await;

        scheduler
            .submit(TaskSpec::new("t", "https://example.com"))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(80)).await;

        let stats = pool.stats().await;
        assert_eq!(stats.capacity, 1);
        assert_eq!(stats.busy, 1);
        assert!(stats.slots[0].current_task_id.is_some());

        executor.release.notify_waiters();
        tokio::time::sleep(Duration::from_millis(80)).await;
        let stats = pool.stats().await;
        assert_eq!(stats.busy, 0);
        assert_eq!(stats.tasks_completed, 1);

        pool.signal_shutdown();
        assert!(pool.join_with_grace(Duration::from_secs(1)).await);
    }
}
