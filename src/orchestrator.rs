//! Orchestrator facade — owns the scheduler, worker pool, and proxy pool.
//!
//! The API/dashboard layer talks to this type only: `submit`, `cancel`,
//! `get_status`, `list`, `pool_stats`, `proxy_stats`, plus lifecycle
//! (`start`, `shutdown`). Everything returned is a snapshot; nothing here
//! blocks on executor calls.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::OrchestratorConfig;
use crate::error::{Error, Result, TaskError};
use crate::executor::Executor;
use crate::metrics::{MetricEvent, MetricsSink, NoopMetrics};
use crate::proxy::{ProxyPool, ProxyPoolStats, ProxyProber};
use crate::scheduler::{CancelOutcome, Scheduler};
use crate::store::{self, ProxyStore, TaskStore};
use crate::task::{Task, TaskRegistry, TaskSpec, TaskStatus};
use crate::worker::{WorkerDeps, WorkerPool, WorkerPoolStats};

/// External collaborators wired into the engine.
#[derive(Clone)]
pub struct EngineDeps {
    pub executor: Arc<dyn Executor>,
    pub task_store: Option<Arc<dyn TaskStore>>,
    pub proxy_store: Option<Arc<dyn ProxyStore>>,
    pub metrics: Arc<dyn MetricsSink>,
    pub prober: Option<Arc<dyn ProxyProber>>,
}

impl EngineDeps {
    pub fn new(executor: Arc<dyn Executor>) -> Self {
        Self {
            executor,
            task_store: None,
            proxy_store: None,
            metrics: Arc::new(NoopMetrics),
            prober: None,
        }
    }

    pub fn with_task_store(mut self, store: Arc<dyn TaskStore>) -> Self {
        self.task_store = Some(store);
        self
    }

    pub fn with_proxy_store(mut self, store: Arc<dyn ProxyStore>) -> Self {
        self.proxy_store = Some(store);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn with_prober(mut self, prober: Arc<dyn ProxyProber>) -> Self {
        self.prober = Some(prober);
        self
    }
}

/// Combined queue + worker snapshot for the dashboard layer.
#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub queue_size: usize,
    pub workers: WorkerPoolStats,
}

/// Central orchestrator for automation tasks.
pub struct Orchestrator {
    config: OrchestratorConfig,
    deps: EngineDeps,
    registry: Arc<TaskRegistry>,
    scheduler: Arc<Scheduler>,
    proxies: Arc<ProxyPool>,
    workers: WorkerPool,
    accepting: AtomicBool,
    started: AtomicBool,
    maintenance: Mutex<Option<JoinHandle<()>>>,
}

impl Orchestrator {
    pub fn new(config: OrchestratorConfig, deps: EngineDeps) -> Self {
        let registry = Arc::new(TaskRegistry::new());
        let scheduler = Arc::new(Scheduler::new(Arc::clone(&registry), config.queue_capacity));
        let proxies = Arc::new(ProxyPool::new(config.proxy.clone()));

        let worker_deps = WorkerDeps {
            scheduler: Arc::clone(&scheduler),
            registry: Arc::clone(&registry),
            proxies: Arc::clone(&proxies),
            executor: Arc::clone(&deps.executor),
            store: deps.task_store.clone(),
            metrics: Arc::clone(&deps.metrics),
            retry_policy: config.retry.clone(),
            task_timeout: config.task_timeout,
            idle_poll_interval: config.idle_poll_interval,
            proxy_cooldown: config.proxy.cooldown,
        };
        let workers = WorkerPool::new(config.worker_pool_size, worker_deps);

        Self {
            config,
            deps,
            registry,
            scheduler,
            proxies,
            workers,
            accepting: AtomicBool::new(true),
            started: AtomicBool::new(false),
            maintenance: Mutex::new(None),
        }
    }

    /// The proxy pool, e.g. for loading a proxy list file before `start`.
    pub fn proxies(&self) -> &Arc<ProxyPool> {
        &self.proxies
    }

    /// Start the worker slots and the maintenance loop. Idempotent.
    pub async fn start(&self) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            warn!("Orchestrator already started");
            return Ok(());
        }

        if let Some(proxy_store) = &self.deps.proxy_store {
            match proxy_store.load().await {
                Ok(list) => {
                    let mut added = 0;
                    for endpoint in list {
                        if self.proxies.add(endpoint).await {
                            added += 1;
                        }
                    }
                    info!(count = added, "Loaded proxies from store");
                }
                Err(e) => warn!(error = %e, "Proxy store load failed, starting with empty pool"),
            }
        }

        self.workers.start().await;

        let handle = spawn_maintenance_loop(
            Arc::clone(&self.scheduler),
            Arc::clone(&self.proxies),
            self.deps.clone(),
            self.config.clone(),
        );
        *self.maintenance.lock().await = Some(handle);

        info!(
            workers = self.config.worker_pool_size,
            proxies = self.proxies.len().await,
            "Orchestrator started"
        );
        Ok(())
    }

    /// Validate and enqueue a task.
    pub async fn submit(&self, spec: TaskSpec) -> Result<Task> {
        if !self.accepting.load(Ordering::SeqCst) {
            return Err(TaskError::ShuttingDown.into());
        }

        let task = self.scheduler.submit(spec).await.map_err(Error::from)?;
        self.deps.metrics.record(MetricEvent::TaskSubmitted);
        store::persist_task(self.deps.task_store.clone(), task.clone());
        Ok(task)
    }

    /// Cancel a task. Pending tasks cancel immediately; running tasks are
    /// flagged and finish cancelling at the worker's next safe point.
    pub async fn cancel(&self, id: Uuid) -> Result<CancelOutcome> {
        let outcome = self.scheduler.cancel(id).await?;
        if outcome == CancelOutcome::Cancelled {
            self.deps.metrics.record(MetricEvent::TaskCancelled);
            if let Ok(task) = self.registry.get(id).await {
                store::persist_task(self.deps.task_store.clone(), task);
            }
        }
        Ok(outcome)
    }

    /// Current snapshot of a task.
    pub async fn get_status(&self, id: Uuid) -> Result<Task> {
        Ok(self.registry.get(id).await?)
    }

    /// Snapshots of all known tasks, optionally filtered by status.
    pub async fn list(&self, filter: Option<TaskStatus>) -> Vec<Task> {
        self.registry.list(filter).await
    }

    /// Queue and worker-slot snapshot.
    pub async fn pool_stats(&self) -> PoolStats {
        PoolStats {
            queue_size: self.scheduler.queue_len().await,
            workers: self.workers.stats().await,
        }
    }

    /// Proxy pool snapshot.
    pub async fn proxy_stats(&self) -> ProxyPoolStats {
        self.proxies.stats().await
    }

    /// Stop accepting work, signal cooperative cancellation, wait up to the
    /// configured grace period, then abandon whatever is still running.
    /// Never blocks indefinitely.
    pub async fn shutdown(&self) {
        if !self.accepting.swap(false, Ordering::SeqCst) {
            debug!("Shutdown already in progress");
            return;
        }
        info!("Orchestrator shutting down");

        self.workers.signal_shutdown();
        for id in self.registry.running_ids().await {
            let _ = self.registry.request_cancel(id).await;
        }

        let clean = self.workers.join_with_grace(self.config.shutdown_grace).await;
        if !clean {
            for id in self.registry.running_ids().await {
                let message = TaskError::ShutdownAbandoned { id }.to_string();
                let updated = self
                    .registry
                    .update(id, |t| {
                        t.transition_to(TaskStatus::Failed).map(|()| {
                            t.error_message = Some(message.clone());
                            t.clone()
                        })
                    })
                    .await;
                if let Ok(Ok(snapshot)) = updated {
                    warn!(task_id = %id, "Task abandoned at shutdown");
                    self.deps.metrics.record(MetricEvent::TaskFailed {
                        kind: "shutdown_abandoned".to_string(),
                    });
                    store::persist_task(self.deps.task_store.clone(), snapshot);
                }
            }
        }

        if let Some(handle) = self.maintenance.lock().await.take() {
            handle.abort();
        }

        if let Some(proxy_store) = &self.deps.proxy_store {
            let snapshot = self.proxies.snapshot().await;
            if let Err(e) = proxy_store.save_snapshot(&snapshot).await {
                warn!(error = %e, "Final proxy snapshot failed");
            }
        }

        info!("Orchestrator stopped");
    }
}

/// Background maintenance: promote matured retries, probe cooled-down
/// proxies, persist periodic stat snapshots.
fn spawn_maintenance_loop(
    scheduler: Arc<Scheduler>,
    proxies: Arc<ProxyPool>,
    deps: EngineDeps,
    config: OrchestratorConfig,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        debug!(
            interval_ms = config.maintenance_interval.as_millis() as u64,
            "Maintenance loop started"
        );

        let mut tick = tokio::time::interval(config.maintenance_interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut last_snapshot = Instant::now();

        loop {
            tick.tick().await;

            scheduler.promote_delayed().await;

            if let Some(prober) = &deps.prober {
                let sweep = proxies.run_probe_sweep(prober.as_ref()).await;
                if sweep.restored > 0 {
                    info!(restored = sweep.restored, "Probe sweep restored proxies");
                    for _ in 0..sweep.restored {
                        deps.metrics.record(MetricEvent::ProxyRestored);
                    }
                }
            }

            if let Some(proxy_store) = &deps.proxy_store {
                if last_snapshot.elapsed() >= config.proxy.snapshot_interval {
                    last_snapshot = Instant::now();
                    let snapshot = proxies.snapshot().await;
                    if let Err(e) = proxy_store.save_snapshot(&snapshot).await {
                        warn!(error = %e, "Proxy snapshot failed");
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    use crate::error::ExecutorError;
    use crate::executor::{ExecutionReport, ExecutionRequest};

    struct OkExecutor;

    #[async_trait]
    impl Executor for OkExecutor {
        async fn execute(
            &self,
            _request: ExecutionRequest,
        ) -> std::result::Result<ExecutionReport, ExecutorError> {
            Ok(ExecutionReport::default())
        }
    }

    fn orchestrator() -> Orchestrator {
        Orchestrator::new(
            OrchestratorConfig::default(),
            EngineDeps::new(Arc::new(OkExecutor)),
        )
    }

    #[tokio::test]
    async fn submit_before_start_queues_work() {
        let engine = orchestrator();
        let task = engine
            .submit(TaskSpec::new("t", "https://example.com"))
            .await
            .unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(engine.pool_stats().await.queue_size, 1);
    }

    #[tokio::test]
    async fn submit_after_shutdown_is_rejected() {
        let engine = orchestrator();
        engine.shutdown().await;

        let err = engine
            .submit(TaskSpec::new("t", "https://example.com"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Task(TaskError::ShuttingDown)));
    }

    #[tokio::test]
    async fn shutdown_is_idempotent() {
        let engine = orchestrator();
        engine.start().await.unwrap();
        engine.shutdown().await;
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn get_status_unknown_task_errors() {
        let engine = orchestrator();
        assert!(matches!(
            engine.get_status(Uuid::new_v4()).await,
            Err(Error::Task(TaskError::NotFound { .. }))
        ));
    }

    #[tokio::test]
    async fn stats_are_snapshots() {
        let engine = orchestrator();
        let stats = engine.pool_stats().await;
        assert_eq!(stats.queue_size, 0);
        assert_eq!(stats.workers.capacity, 5);

        let proxy_stats = engine.proxy_stats().await;
        assert_eq!(proxy_stats.total, 0);
    }
}
