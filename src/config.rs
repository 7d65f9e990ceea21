//! Configuration types.

use std::time::Duration;

use crate::proxy::RotationStrategy;
use crate::task::RetryPolicy;

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Number of worker slots executing tasks concurrently.
    pub worker_pool_size: usize,
    /// Maximum number of queued (pending + delayed) tasks.
    pub queue_capacity: usize,
    /// Per-attempt executor timeout. A slower attempt is classified as a
    /// retryable timeout and the slot is reclaimed.
    pub task_timeout: Duration,
    /// How long an idle slot sleeps before polling the queue again.
    pub idle_poll_interval: Duration,
    /// Interval of the maintenance loop (delayed-task promotion, proxy
    /// probe sweeps, stat snapshots).
    pub maintenance_interval: Duration,
    /// How long `shutdown` waits for running attempts before abandoning them.
    pub shutdown_grace: Duration,
    /// Backoff policy applied to retryable failures.
    pub retry: RetryPolicy,
    /// Proxy pool behavior.
    pub proxy: ProxyConfig,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            worker_pool_size: 5,
            queue_capacity: 1000,
            task_timeout: Duration::from_secs(300),
            idle_poll_interval: Duration::from_millis(250),
            maintenance_interval: Duration::from_secs(5),
            shutdown_grace: Duration::from_secs(30),
            retry: RetryPolicy::default(),
            proxy: ProxyConfig::default(),
        }
    }
}

/// Proxy pool configuration.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// When true, a task cannot be dispatched without a proxy and an empty
    /// or fully-unhealthy pool is an error. When false, deployments may run
    /// with no proxies at all and attempts fall back to direct connections.
    pub mandatory: bool,
    /// Selection policy among healthy proxies.
    pub rotation: RotationStrategy,
    /// Consecutive failures after which a proxy is marked unhealthy.
    pub unhealthy_threshold: u32,
    /// How long an unhealthy proxy rests before it becomes eligible for a
    /// recovery probe.
    pub cooldown: Duration,
    /// URL probed to verify a proxy is usable again.
    pub probe_url: String,
    /// Timeout applied to a single probe request.
    pub probe_timeout: Duration,
    /// Maximum concurrent probes in one sweep.
    pub probe_concurrency: usize,
    /// Smoothing factor for the response-time / success-rate moving averages.
    pub ema_alpha: f64,
    /// How often proxy stat snapshots are handed to the proxy store.
    pub snapshot_interval: Duration,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            mandatory: false,
            rotation: RotationStrategy::Weighted,
            unhealthy_threshold: 3,
            cooldown: Duration::from_secs(60),
            probe_url: "https://httpbin.org/ip".to_string(),
            probe_timeout: Duration::from_secs(10),
            probe_concurrency: 10,
            ema_alpha: 0.3,
            snapshot_interval: Duration::from_secs(60),
        }
    }
}
