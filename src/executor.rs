//! Executor boundary — the browser-automation collaborator.
//!
//! The engine treats execution as an opaque, potentially slow, fallible
//! operation: it hands over the target, the validated config, and the
//! selected proxy, and gets back either a report or a classified error.
//! Page interaction, DOM extraction, and data cleaning all live behind
//! this trait.

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::ExecutorError;
use crate::proxy::ProxyEndpoint;
use crate::task::{TaskConfig, TaskType};

/// One unit of work handed to the executor.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub task_id: Uuid,
    pub target_url: String,
    pub task_type: TaskType,
    pub config: TaskConfig,
    /// Egress proxy for this attempt, if one was assigned.
    pub proxy: Option<ProxyEndpoint>,
}

/// Result of a successful execution.
#[derive(Debug, Clone, Default)]
pub struct ExecutionReport {
    /// Number of items the executor extracted.
    pub items_scraped: u64,
    /// Opaque reference to where the extracted payload was handed off
    /// (e.g. a staging location for the cleaning pipeline).
    pub artifact_ref: Option<String>,
}

/// External executor. Implementations may block for seconds to tens of
/// seconds; the engine bounds every call with its per-task timeout and
/// discards results that arrive after the slot has moved on.
#[async_trait]
pub trait Executor: Send + Sync {
    async fn execute(&self, request: ExecutionRequest) -> Result<ExecutionReport, ExecutorError>;
}
