//! Error types for the orchestration engine.

use std::time::Duration;

use uuid::Uuid;

/// Top-level error type for the engine.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Executor error: {0}")]
    Executor(#[from] ExecutorError),

    #[error("Proxy error: {0}")]
    Proxy(#[from] ProxyError),

    #[error("Task error: {0}")]
    Task(#[from] TaskError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

/// Rejected submissions. Surfaced synchronously to the submitter and never
/// retried — a task that fails validation never enters the queue.
#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    #[error("target_url must not be empty")]
    EmptyTargetUrl,

    #[error("priority {priority} outside allowed range [{min}, {max}]")]
    PriorityOutOfRange { priority: i32, min: i32, max: i32 },

    #[error("max_retries {requested} exceeds the cap of {cap}")]
    RetryBudgetTooLarge { requested: u32, cap: u32 },

    #[error("invalid task config: {reason}")]
    InvalidConfig { reason: String },

    #[error("task queue is full (capacity {capacity})")]
    QueueFull { capacity: usize },
}

/// Failures reported by the external executor, classified by kind.
/// All kinds are retryable per policy.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ExecutorError {
    #[error("execution timed out after {timeout:?}")]
    Timeout { timeout: Duration },

    #[error("network failure: {0}")]
    Network(String),

    #[error("target blocked the request: {0}")]
    Blocked(String),

    #[error("page did not match expected structure: {0}")]
    InvalidPage(String),
}

impl ExecutorError {
    /// Short classification label used in logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Timeout { .. } => "timeout",
            Self::Network(_) => "network",
            Self::Blocked(_) => "blocked",
            Self::InvalidPage(_) => "invalid_page",
        }
    }
}

/// Proxy pool errors.
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("no healthy proxy available ({total} known, all unhealthy)")]
    NoHealthy { total: usize },

    #[error("proxy pool is empty and proxy use is mandatory")]
    PoolEmpty,

    #[error("unknown proxy {id}")]
    UnknownProxy { id: Uuid },

    #[error("invalid proxy format: {line}")]
    InvalidFormat { line: String },

    #[error("probe of {addr} failed: {reason}")]
    ProbeFailed { addr: String, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Task lifecycle errors.
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("task {id} not found")]
    NotFound { id: Uuid },

    #[error("task {id} cannot transition from {from} to {to}")]
    InvalidTransition { id: Uuid, from: String, to: String },

    #[error("task {id} abandoned during shutdown")]
    ShutdownAbandoned { id: Uuid },

    #[error("engine is shutting down, submissions are closed")]
    ShuttingDown,
}

/// Persistence-layer failures. The store implementation is external; the
/// engine only logs these, it never fails a task over them.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("save failed: {0}")]
    Save(String),

    #[error("load failed: {0}")]
    Load(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for the engine.
pub type Result<T> = std::result::Result<T, Error>;
