//! Task model and validated configuration.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{TaskError, ValidationError};

/// Lowest accepted submission priority.
pub const PRIORITY_MIN: i32 = -100;
/// Highest accepted submission priority.
pub const PRIORITY_MAX: i32 = 100;
/// Hard cap on per-task retry budgets.
pub const RETRY_BUDGET_CAP: u32 = 10;
/// Upper bound on `max_pages` in a task config.
pub const MAX_PAGES_CAP: u32 = 1000;

/// Lifecycle status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Queued (or delayed for a retry), waiting for a worker slot.
    Pending,
    /// An attempt is executing on a worker slot.
    Running,
    /// Terminal: an attempt completed successfully.
    Success,
    /// Terminal: the retry budget is exhausted or the task was abandoned.
    Failed,
    /// Terminal: cancelled before or during execution.
    Cancelled,
}

impl TaskStatus {
    /// Check if this status allows transitioning to another status.
    pub fn can_transition_to(&self, target: TaskStatus) -> bool {
        use TaskStatus::*;

        matches!(
            (self, target),
            // From Pending. Failed covers tasks abandoned before dispatch
            // (mandatory proxies with an empty pool, exhausted preflight
            // retries).
            (Pending, Running) | (Pending, Cancelled) | (Pending, Failed) |
            // From Running: terminal outcomes, or back to Pending on requeue
            (Running, Success) | (Running, Failed) |
            (Running, Cancelled) | (Running, Pending)
        )
    }

    /// Check if this is a terminal status.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failed | Self::Cancelled)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

/// Kind of automation work a task performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    #[default]
    Scrape,
    Navigate,
    FormFill,
    Login,
    Custom,
}

impl std::fmt::Display for TaskType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Scrape => "scrape",
            Self::Navigate => "navigate",
            Self::FormFill => "form_fill",
            Self::Login => "login",
            Self::Custom => "custom",
        };
        write!(f, "{s}")
    }
}

/// A navigation action the executor can perform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum NavigationStep {
    Navigate { url: String },
    Click { selector: String },
    Fill { selector: String, value: String },
    Wait { ms: u64 },
    Scroll,
}

/// Validated executor options.
///
/// Submissions carry config as free-form JSON; it is parsed into this
/// struct up front so malformed or unknown keys are rejected with a
/// `ValidationError` instead of surfacing mid-execution.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TaskConfig {
    /// CSS selector for the repeating item on the page.
    pub item_selector: Option<String>,
    /// Field name → CSS selector map for per-item extraction.
    pub fields: BTreeMap<String, String>,
    /// Number of pages to walk (pagination). Zero is rejected.
    pub max_pages: Option<u32>,
    /// Delay between page loads, in milliseconds.
    pub page_delay_ms: Option<u64>,
    /// Selector the executor waits for before extracting.
    pub wait_for_selector: Option<String>,
    /// Scripted actions for navigation-style tasks.
    pub steps: Vec<NavigationStep>,
}

impl TaskConfig {
    /// Parse and validate a config value from a submission.
    ///
    /// `Null` means "no options". Unknown keys, wrong types, and
    /// out-of-range values are all rejected here.
    pub fn from_value(value: &serde_json::Value) -> Result<Self, ValidationError> {
        if value.is_null() {
            return Ok(Self::default());
        }

        let config: Self = serde_json::from_value(value.clone()).map_err(|e| {
            ValidationError::InvalidConfig {
                reason: e.to_string(),
            }
        })?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ValidationError> {
        if let Some(pages) = self.max_pages {
            if pages == 0 || pages > MAX_PAGES_CAP {
                return Err(ValidationError::InvalidConfig {
                    reason: format!("max_pages must be within 1..={MAX_PAGES_CAP}, got {pages}"),
                });
            }
        }
        for step in &self.steps {
            if let NavigationStep::Navigate { url } = step {
                if url.trim().is_empty() {
                    return Err(ValidationError::InvalidConfig {
                        reason: "navigate step requires a non-empty url".to_string(),
                    });
                }
            }
        }
        Ok(())
    }
}

/// A submission payload, before validation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSpec {
    pub name: String,
    pub target_url: String,
    #[serde(default)]
    pub task_type: TaskType,
    /// Free-form executor options, validated into [`TaskConfig`] on submit.
    #[serde(default)]
    pub config: serde_json::Value,
    #[serde(default)]
    pub priority: i32,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_max_retries() -> u32 {
    3
}

impl TaskSpec {
    pub fn new(name: impl Into<String>, target_url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            target_url: target_url.into(),
            task_type: TaskType::default(),
            config: serde_json::Value::Null,
            priority: 0,
            max_retries: default_max_retries(),
        }
    }

    pub fn with_type(mut self, task_type: TaskType) -> Self {
        self.task_type = task_type;
        self
    }

    pub fn with_config(mut self, config: serde_json::Value) -> Self {
        self.config = config;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }
}

/// A tracked unit of automation work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub name: String,
    pub target_url: String,
    pub task_type: TaskType,
    pub config: TaskConfig,
    pub priority: i32,
    pub status: TaskStatus,
    pub retry_count: u32,
    pub max_retries: u32,
    /// Owning worker slot while running, cleared otherwise.
    pub worker_id: Option<usize>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub items_scraped: u64,
}

impl Task {
    /// Validate a submission and build the pending task record.
    pub fn from_spec(spec: TaskSpec) -> Result<Self, ValidationError> {
        if spec.target_url.trim().is_empty() {
            return Err(ValidationError::EmptyTargetUrl);
        }
        if spec.priority < PRIORITY_MIN || spec.priority > PRIORITY_MAX {
            return Err(ValidationError::PriorityOutOfRange {
                priority: spec.priority,
                min: PRIORITY_MIN,
                max: PRIORITY_MAX,
            });
        }
        if spec.max_retries > RETRY_BUDGET_CAP {
            return Err(ValidationError::RetryBudgetTooLarge {
                requested: spec.max_retries,
                cap: RETRY_BUDGET_CAP,
            });
        }
        let config = TaskConfig::from_value(&spec.config)?;

        Ok(Self {
            id: Uuid::new_v4(),
            name: spec.name,
            target_url: spec.target_url,
            task_type: spec.task_type,
            config,
            priority: spec.priority,
            status: TaskStatus::Pending,
            retry_count: 0,
            max_retries: spec.max_retries,
            worker_id: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            error_message: None,
            items_scraped: 0,
        })
    }

    /// Transition to a new status, stamping timestamps and clearing the
    /// worker assignment when leaving `Running`.
    pub fn transition_to(&mut self, target: TaskStatus) -> Result<(), TaskError> {
        if !self.status.can_transition_to(target) {
            return Err(TaskError::InvalidTransition {
                id: self.id,
                from: self.status.to_string(),
                to: target.to_string(),
            });
        }

        if self.status == TaskStatus::Running && target != TaskStatus::Running {
            self.worker_id = None;
        }

        match target {
            TaskStatus::Running => {
                // Each attempt stamps its own start.
                self.started_at = Some(Utc::now());
            }
            TaskStatus::Success | TaskStatus::Failed | TaskStatus::Cancelled => {
                self.completed_at = Some(Utc::now());
            }
            TaskStatus::Pending => {}
        }

        self.status = target;
        Ok(())
    }

    /// Duration of the last attempt window, once the task is terminal.
    pub fn duration(&self) -> Option<chrono::Duration> {
        match (self.started_at, self.completed_at) {
            (Some(start), Some(end)) => Some(end - start),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}
