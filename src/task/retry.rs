//! Retry state machine — pure transition logic, no I/O.
//!
//! Every attempt feeds its classified outcome into [`RetryMachine`], which
//! deterministically yields what the engine should do next: finalize, wait
//! and requeue, give up, or acknowledge cancellation. Keeping this free of
//! I/O makes the recovery behavior testable without executing anything.

use std::time::Duration;

/// Backoff policy for retryable failures.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Base delay; the first retry waits `base_delay * multiplier`.
    pub base_delay: Duration,
    /// Ceiling applied after exponentiation.
    pub max_delay: Duration,
    /// Exponential growth factor.
    pub multiplier: f64,
    /// Scale each delay by a uniform factor in [0.5, 1.5].
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
            jitter: false,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry_count` (1-indexed):
    /// `base_delay * multiplier^retry_count`, capped at `max_delay`.
    pub fn delay_for(&self, retry_count: u32) -> Duration {
        use rand::Rng;

        let exp = retry_count.min(16) as i32;
        let mut secs = self.base_delay.as_secs_f64() * self.multiplier.powi(exp);
        if self.jitter {
            secs *= rand::thread_rng().gen_range(0.5..1.5);
        }
        Duration::from_secs_f64(secs.min(self.max_delay.as_secs_f64()))
    }
}

/// Attempt states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryState {
    /// Created or requeued, not yet dispatched.
    Init,
    /// Executor call in flight.
    Running,
    /// Terminal: attempt succeeded.
    Success,
    /// Attempt failed, classification pending budget check.
    Failed,
    /// Budget remains; a delayed requeue was decided.
    Retry,
    /// Terminal: budget exhausted, task is failed for good.
    Fallback,
    /// Terminal: cooperative cancellation acknowledged.
    Cancelled,
}

impl RetryState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Fallback | Self::Cancelled)
    }
}

/// Classified outcome of one executor attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    Success,
    Failure { error: String },
    Cancelled,
}

/// What the engine should do with the task next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Finalize as `success`.
    Completed,
    /// Requeue with the given visibility delay; `retry_count` is the new
    /// (already incremented) attempt counter and `error` the failure that
    /// triggered the retry.
    RetryAfter {
        delay: Duration,
        retry_count: u32,
        error: String,
    },
    /// Finalize as `failed`, preserving the last error.
    GiveUp { error: String },
    /// Finalize as `cancelled`.
    Cancelled,
}

/// Per-attempt state machine.
#[derive(Debug, Clone)]
pub struct RetryMachine {
    state: RetryState,
    retry_count: u32,
    max_retries: u32,
    policy: RetryPolicy,
}

impl RetryMachine {
    /// Build a machine for a task about to be dispatched. `retry_count`
    /// carries over from previous attempts of the same task.
    pub fn new(retry_count: u32, max_retries: u32, policy: RetryPolicy) -> Self {
        Self {
            state: RetryState::Init,
            retry_count,
            max_retries,
            policy,
        }
    }

    pub fn state(&self) -> RetryState {
        self.state
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    /// `INIT → RUNNING` on dispatch.
    pub fn dispatch(&mut self) {
        debug_assert_eq!(self.state, RetryState::Init);
        self.state = RetryState::Running;
    }

    /// Feed the attempt outcome and get the next action.
    ///
    /// Deterministic: the same prior state and outcome always yield the
    /// same next state (the jitter knob only perturbs the delay width).
    pub fn observe(&mut self, outcome: AttemptOutcome) -> RetryDecision {
        debug_assert_eq!(self.state, RetryState::Running);

        match outcome {
            AttemptOutcome::Success => {
                self.state = RetryState::Success;
                RetryDecision::Completed
            }
            AttemptOutcome::Cancelled => {
                self.state = RetryState::Cancelled;
                RetryDecision::Cancelled
            }
            AttemptOutcome::Failure { error } => {
                self.state = RetryState::Failed;
                if self.retry_count < self.max_retries {
                    self.retry_count += 1;
                    self.state = RetryState::Retry;
                    RetryDecision::RetryAfter {
                        delay: self.policy.delay_for(self.retry_count),
                        retry_count: self.retry_count,
                        error,
                    }
                } else {
                    self.state = RetryState::Fallback;
                    RetryDecision::GiveUp { error }
                }
            }
        }
    }
}
