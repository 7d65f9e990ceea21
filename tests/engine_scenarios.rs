//! End-to-end scenarios for the orchestration engine: dispatch ordering,
//! retry recovery, cancellation, proxy routing, and shutdown abandonment.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use uuid::Uuid;

use drover::config::{OrchestratorConfig, ProxyConfig};
use drover::error::ExecutorError;
use drover::executor::{ExecutionReport, ExecutionRequest, Executor};
use drover::metrics::{CountingMetrics, MetricsSink};
use drover::task::{RetryPolicy, TaskSpec, TaskStatus};
use drover::{CancelOutcome, EngineDeps, Orchestrator, Task};

const WAIT: Duration = Duration::from_secs(5);

/// Opt-in tracing for debugging failures: `RUST_LOG=debug cargo test`.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

/// Executor with a per-URL script of responses. URLs without a script (or
/// with an exhausted one) succeed with a one-item report.
struct ScriptedExecutor {
    script: Mutex<HashMap<String, VecDeque<Result<ExecutionReport, ExecutorError>>>>,
    executed: Mutex<Vec<String>>,
    proxied_calls: AtomicUsize,
    direct_calls: AtomicUsize,
}

impl ScriptedExecutor {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(HashMap::new()),
            executed: Mutex::new(Vec::new()),
            proxied_calls: AtomicUsize::new(0),
            direct_calls: AtomicUsize::new(0),
        })
    }

    fn script_for(&self, url: &str, responses: Vec<Result<ExecutionReport, ExecutorError>>) {
        self.script
            .lock()
            .unwrap()
            .insert(url.to_string(), responses.into());
    }

    fn executed(&self) -> Vec<String> {
        self.executed.lock().unwrap().clone()
    }
}

#[async_trait]
impl Executor for ScriptedExecutor {
    async fn execute(&self, request: ExecutionRequest) -> Result<ExecutionReport, ExecutorError> {
        self.executed.lock().unwrap().push(request.target_url.clone());
        if request.proxy.is_some() {
            self.proxied_calls.fetch_add(1, Ordering::SeqCst);
        } else {
            self.direct_calls.fetch_add(1, Ordering::SeqCst);
        }

        let scripted = self
            .script
            .lock()
            .unwrap()
            .get_mut(&request.target_url)
            .and_then(|queue| queue.pop_front());
        match scripted {
            Some(result) => result,
            None => Ok(ExecutionReport {
                items_scraped: 1,
                artifact_ref: None,
            }),
        }
    }
}

/// Executor that parks until released (or forever).
struct ParkedExecutor {
    release: tokio::sync::Notify,
    calls: AtomicUsize,
}

impl ParkedExecutor {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            release: tokio::sync::Notify::new(),
            calls: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl Executor for ParkedExecutor {
    async fn execute(&self, _request: ExecutionRequest) -> Result<ExecutionReport, ExecutorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.release.notified().await;
        Ok(ExecutionReport {
            items_scraped: 1,
            artifact_ref: None,
        })
    }
}

fn fast_config(workers: usize) -> OrchestratorConfig {
    OrchestratorConfig {
        worker_pool_size: workers,
        queue_capacity: 64,
        task_timeout: Duration::from_millis(500),
        idle_poll_interval: Duration::from_millis(10),
        maintenance_interval: Duration::from_millis(20),
        shutdown_grace: Duration::from_millis(150),
        retry: RetryPolicy {
            base_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(40),
            multiplier: 2.0,
            jitter: false,
        },
        proxy: ProxyConfig {
            cooldown: Duration::from_millis(20),
            snapshot_interval: Duration::from_secs(3600),
            ..ProxyConfig::default()
        },
    }
}

/// Poll until the task reaches a terminal status. Panics on timeout.
async fn wait_terminal(engine: &Orchestrator, id: Uuid) -> Task {
    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        let task = engine.get_status(id).await.unwrap();
        if task.is_terminal() {
            return task;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "task {id} still {} after {WAIT:?}",
            task.status
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Poll until the task reaches `status`. Panics on timeout.
async fn wait_status(engine: &Orchestrator, id: Uuid, status: TaskStatus) {
    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        let current = engine.get_status(id).await.unwrap().status;
        if current == status {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "task {id} stuck at {current}, wanted {status}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Poll until exactly `expected` tasks have `status`. Panics on timeout.
async fn wait_status_count(engine: &Orchestrator, status: TaskStatus, expected: usize) {
    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        let count = engine.list(Some(status)).await.len();
        if count == expected {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "saw {count} tasks with status {status}, wanted {expected}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn dispatch_order_is_priority_then_fifo() {
    init_tracing();
    let executor = ScriptedExecutor::new();
    let engine = Orchestrator::new(
        fast_config(1),
        EngineDeps::new(Arc::clone(&executor) as Arc<dyn Executor>),
    );

    // Submit before starting so a single slot drains a settled queue.
    let first_low = engine
        .submit(TaskSpec::new("low-a", "https://example.com/low-a").with_priority(1))
        .await
        .unwrap();
    let high = engine
        .submit(TaskSpec::new("high", "https://example.com/high").with_priority(5))
        .await
        .unwrap();
    let second_low = engine
        .submit(TaskSpec::new("low-b", "https://example.com/low-b").with_priority(1))
        .await
        .unwrap();

    engine.start().await.unwrap();
    wait_status_count(&engine, TaskStatus::Success, 3).await;

    assert_eq!(
        executor.executed(),
        vec![
            "https://example.com/high".to_string(),
            "https://example.com/low-a".to_string(),
            "https://example.com/low-b".to_string(),
        ]
    );

    // Exactly one terminal status each, worker ownership released.
    for id in [high.id, first_low.id, second_low.id] {
        let task = engine.get_status(id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Success);
        assert!(task.completed_at.is_some());
        assert!(task.worker_id.is_none());
    }

    engine.shutdown().await;
}

#[tokio::test]
async fn flaky_executor_recovers_within_budget() {
    init_tracing();
    let executor = ScriptedExecutor::new();
    let url = "https://example.com/flaky";
    executor.script_for(
        url,
        vec![
            Err(ExecutorError::Timeout {
                timeout: Duration::from_millis(500),
            }),
            Err(ExecutorError::Timeout {
                timeout: Duration::from_millis(500),
            }),
            Ok(ExecutionReport {
                items_scraped: 7,
                artifact_ref: Some("batch-3".to_string()),
            }),
        ],
    );

    let engine = Orchestrator::new(
        fast_config(1),
        EngineDeps::new(Arc::clone(&executor) as Arc<dyn Executor>),
    );
    engine.start().await.unwrap();

    let task = engine
        .submit(TaskSpec::new("flaky", url).with_max_retries(3))
        .await
        .unwrap();

    let finished = wait_terminal(&engine, task.id).await;
    assert_eq!(finished.status, TaskStatus::Success);
    assert_eq!(finished.retry_count, 2);
    assert_eq!(finished.items_scraped, 7);
    assert!(finished.error_message.is_none());
    assert!(finished.retry_count <= finished.max_retries);
    assert_eq!(executor.executed().len(), 3);

    engine.shutdown().await;
}

#[tokio::test]
async fn persistent_failure_ends_failed_with_last_error() {
    init_tracing();
    let executor = ScriptedExecutor::new();
    let url = "https://example.com/hostile";
    executor.script_for(
        url,
        vec![
            Err(ExecutorError::Network("connection reset".to_string())),
            Err(ExecutorError::Network("connection reset".to_string())),
            Err(ExecutorError::Blocked("captcha wall".to_string())),
        ],
    );

    let metrics = Arc::new(CountingMetrics::new());
    let engine = Orchestrator::new(
        fast_config(1),
        EngineDeps::new(Arc::clone(&executor) as Arc<dyn Executor>)
            .with_metrics(Arc::clone(&metrics) as Arc<dyn MetricsSink>),
    );
    engine.start().await.unwrap();

    let task = engine
        .submit(TaskSpec::new("hostile", url).with_max_retries(2))
        .await
        .unwrap();

    let finished = wait_terminal(&engine, task.id).await;
    assert_eq!(finished.status, TaskStatus::Failed);
    assert_eq!(finished.retry_count, 2);
    // Initial attempt plus two retries, nothing more.
    assert_eq!(executor.executed().len(), 3);
    assert!(
        finished
            .error_message
            .as_deref()
            .unwrap()
            .contains("captcha wall"),
        "last failure not preserved: {:?}",
        finished.error_message
    );
    assert_eq!(metrics.retried(), 2);
    assert_eq!(metrics.failed(), 1);

    engine.shutdown().await;
}

#[tokio::test]
async fn cancel_running_task_is_cooperative_and_idempotent() {
    init_tracing();
    let executor = ParkedExecutor::new();
    let engine = Orchestrator::new(
        fast_config(1),
        EngineDeps::new(Arc::clone(&executor) as Arc<dyn Executor>),
    );
    engine.start().await.unwrap();

    let task = engine
        .submit(TaskSpec::new("parked", "https://example.com/parked"))
        .await
        .unwrap();
    wait_status(&engine, task.id, TaskStatus::Running).await;

    // Running: only a flag is set.
    let outcome = engine.cancel(task.id).await.unwrap();
    assert_eq!(outcome, CancelOutcome::CancelRequested);
    assert_eq!(
        engine.get_status(task.id).await.unwrap().status,
        TaskStatus::Running
    );

    // Executor returns; the worker observes the flag and discards the
    // (successful) late result.
    executor.release.notify_waiters();
    let cancelled = wait_terminal(&engine, task.id).await;
    assert_eq!(cancelled.status, TaskStatus::Cancelled);
    assert_eq!(cancelled.items_scraped, 0);

    // Second cancel changes nothing.
    assert_eq!(
        engine.cancel(task.id).await.unwrap(),
        CancelOutcome::AlreadyTerminal(TaskStatus::Cancelled)
    );
    let after = engine.get_status(task.id).await.unwrap();
    assert_eq!(after.status, TaskStatus::Cancelled);
    assert_eq!(after.completed_at, cancelled.completed_at);

    engine.shutdown().await;
}

#[tokio::test]
async fn cancel_pending_task_never_dispatches() {
    init_tracing();
    let executor = ScriptedExecutor::new();
    let engine = Orchestrator::new(
        fast_config(1),
        EngineDeps::new(Arc::clone(&executor) as Arc<dyn Executor>),
    );

    let task = engine
        .submit(TaskSpec::new("doomed", "https://example.com/doomed"))
        .await
        .unwrap();
    assert_eq!(
        engine.cancel(task.id).await.unwrap(),
        CancelOutcome::Cancelled
    );

    engine.start().await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(
        engine.get_status(task.id).await.unwrap().status,
        TaskStatus::Cancelled
    );
    assert!(executor.executed().is_empty());

    engine.shutdown().await;
}

#[tokio::test]
async fn shutdown_abandons_running_tasks_after_grace() {
    init_tracing();
    let executor = ParkedExecutor::new();
    let metrics = Arc::new(CountingMetrics::new());
    let engine = Orchestrator::new(
        fast_config(2),
        EngineDeps::new(Arc::clone(&executor) as Arc<dyn Executor>)
            .with_metrics(Arc::clone(&metrics) as Arc<dyn MetricsSink>),
    );
    engine.start().await.unwrap();

    let running_a = engine
        .submit(TaskSpec::new("a", "https://example.com/a"))
        .await
        .unwrap();
    let running_b = engine
        .submit(TaskSpec::new("b", "https://example.com/b"))
        .await
        .unwrap();
    let queued = engine
        .submit(TaskSpec::new("c", "https://example.com/c"))
        .await
        .unwrap();

    wait_status_count(&engine, TaskStatus::Running, 2).await;

    // Never released: the grace period must expire.
    engine.shutdown().await;

    for id in [running_a.id, running_b.id] {
        let task = engine.get_status(id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert!(
            task.error_message
                .as_deref()
                .unwrap()
                .contains("abandoned during shutdown"),
            "unexpected error: {:?}",
            task.error_message
        );
    }

    // The queued task was never dispatched after shutdown began.
    assert_eq!(
        engine.get_status(queued.id).await.unwrap().status,
        TaskStatus::Pending
    );
    assert_eq!(executor.calls.load(Ordering::SeqCst), 2);
    assert_eq!(metrics.failed(), 2);
    assert_eq!(engine.pool_stats().await.workers.busy, 0);
}

#[tokio::test]
async fn attempts_are_routed_through_healthy_proxies() {
    init_tracing();
    let executor = ScriptedExecutor::new();
    let config = OrchestratorConfig {
        proxy: ProxyConfig {
            mandatory: true,
            cooldown: Duration::from_millis(20),
            snapshot_interval: Duration::from_secs(3600),
            ..ProxyConfig::default()
        },
        ..fast_config(2)
    };
    let engine = Orchestrator::new(
        config,
        EngineDeps::new(Arc::clone(&executor) as Arc<dyn Executor>),
    );
    engine
        .proxies()
        .load_from_lines(["10.0.0.1:8080", "10.0.0.2:8080"])
        .await;
    engine.start().await.unwrap();

    for i in 0..4 {
        engine
            .submit(TaskSpec::new("p", format!("https://example.com/page/{i}")))
            .await
            .unwrap();
    }

    wait_status_count(&engine, TaskStatus::Success, 4).await;

    assert_eq!(executor.proxied_calls.load(Ordering::SeqCst), 4);
    assert_eq!(executor.direct_calls.load(Ordering::SeqCst), 0);

    let stats = engine.proxy_stats().await;
    assert_eq!(stats.total, 2);
    assert_eq!(stats.healthy, 2);
    assert_eq!(stats.total_requests, 4);
    assert!(stats.success_rate > 0.0);

    engine.shutdown().await;
}

#[tokio::test]
async fn mandatory_proxies_with_empty_pool_fail_fast() {
    init_tracing();
    let executor = ScriptedExecutor::new();
    let config = OrchestratorConfig {
        proxy: ProxyConfig {
            mandatory: true,
            snapshot_interval: Duration::from_secs(3600),
            ..ProxyConfig::default()
        },
        ..fast_config(1)
    };
    let engine = Orchestrator::new(
        config,
        EngineDeps::new(Arc::clone(&executor) as Arc<dyn Executor>),
    );
    engine.start().await.unwrap();

    let task = engine
        .submit(TaskSpec::new("stranded", "https://example.com/stranded"))
        .await
        .unwrap();

    let finished = wait_terminal(&engine, task.id).await;
    assert_eq!(finished.status, TaskStatus::Failed);
    assert!(
        finished
            .error_message
            .as_deref()
            .unwrap()
            .contains("proxy pool is empty")
    );
    // The executor was never reached.
    assert!(executor.executed().is_empty());

    engine.shutdown().await;
}

#[tokio::test]
async fn validated_config_reaches_the_executor() {
    init_tracing();
    let executor = ScriptedExecutor::new();
    let engine = Orchestrator::new(
        fast_config(1),
        EngineDeps::new(Arc::clone(&executor) as Arc<dyn Executor>),
    );
    engine.start().await.unwrap();

    let task = engine
        .submit(
            TaskSpec::new("books", "https://example.com/books").with_config(json!({
                "item_selector": "article.product_pod",
                "fields": { "title": "h3 a", "price": ".price_color" },
                "max_pages": 3
            })),
        )
        .await
        .unwrap();
    assert_eq!(task.config.max_pages, Some(3));

    // Unknown keys never enter the queue.
    let err = engine
        .submit(
            TaskSpec::new("bad", "https://example.com/bad")
                .with_config(json!({ "item_selektor": "oops" })),
        )
        .await
        .unwrap_err();
    assert!(err.to_string().contains("invalid task config"));

    let finished = wait_terminal(&engine, task.id).await;
    assert_eq!(finished.status, TaskStatus::Success);

    engine.shutdown().await;
}
