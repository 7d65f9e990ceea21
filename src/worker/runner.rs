//! Per-slot execution loop.
//!
//! A slot pulls one task at a time, routes it through a proxy, invokes the
//! executor bounded by the per-task timeout, classifies the outcome, and
//! applies the retry machine's decision. No lock is held across the
//! executor call; all shared-state mutation happens before and after it.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::error::{ExecutorError, ProxyError};
use crate::executor::{ExecutionReport, ExecutionRequest};
use crate::metrics::MetricEvent;
use crate::proxy::{HealthTransition, ProxyEndpoint};
use crate::store;
use crate::task::{AttemptOutcome, RetryDecision, RetryMachine, Task, TaskStatus};
use crate::worker::pool::{SlotState, WorkerDeps};

/// Run one slot until shutdown is signalled.
pub(crate) async fn slot_loop(
    state: Arc<SlotState>,
    deps: WorkerDeps,
    mut shutdown: watch::Receiver<bool>,
) {
    debug!(slot = state.index, "Worker slot started");

    loop {
        if *shutdown.borrow() {
            break;
        }

        match deps.scheduler.next().await {
            Some(task) => run_attempt(&state, &deps, task).await,
            None => {
                // Empty queue is the normal idle signal.
                tokio::select! {
                    _ = tokio::time::sleep(deps.idle_poll_interval) => {}
                    _ = shutdown.changed() => {}
                }
            }
        }
    }

    debug!(slot = state.index, "Worker slot stopped");
}

/// Execute one attempt of `task` on this slot.
async fn run_attempt(state: &SlotState, deps: &WorkerDeps, task: Task) {
    let task_id = task.id;

    // Cancellation may have landed between pop and dispatch; acknowledge it
    // before doing any work.
    if deps.registry.cancel_requested(task_id).await.unwrap_or(false) {
        finalize(state, deps, task_id, RetryDecision::Cancelled, None, Duration::ZERO).await;
        return;
    }

    // Proxy selection. A missing pool entry for the previous attempt just
    // means no exclusion.
    let previous = deps.registry.last_proxy(task_id).await.unwrap_or(None);
    let proxy = match deps.proxies.acquire(previous).await {
        Ok(proxy) => proxy,
        Err(e @ ProxyError::PoolEmpty) => {
            // Proxies are mandatory and there are none: nothing to wait for.
            error!(task_id = %task_id, error = %e, "Dispatch impossible");
            finalize(
                state,
                deps,
                task_id,
                RetryDecision::GiveUp {
                    error: e.to_string(),
                },
                None,
                Duration::ZERO,
            )
            .await;
            return;
        }
        Err(e) => {
            // No healthy proxy right now. Consumes a retry like any other
            // failure, but waits at least the proxy cooldown so the probe
            // sweep has a chance to restore one.
            warn!(task_id = %task_id, error = %e, "No proxy available for attempt");
            let mut machine =
                RetryMachine::new(task.retry_count, task.max_retries, deps.retry_policy.clone());
            machine.dispatch();
            let decision = match machine.observe(AttemptOutcome::Failure {
                error: e.to_string(),
            }) {
                RetryDecision::RetryAfter {
                    delay,
                    retry_count,
                    error,
                } => RetryDecision::RetryAfter {
                    delay: delay.max(deps.proxy_cooldown),
                    retry_count,
                    error,
                },
                other => other,
            };
            finalize(state, deps, task_id, decision, None, Duration::ZERO).await;
            return;
        }
    };

    // Mark running and record the attempt's proxy for next-attempt exclusion.
    let transitioned = deps
        .registry
        .update(task_id, |t| {
            t.transition_to(TaskStatus::Running).map(|()| {
                t.worker_id = Some(state.index);
                t.clone()
            })
        })
        .await;
    let running = match transitioned {
        Ok(Ok(snapshot)) => snapshot,
        Ok(Err(e)) => {
            warn!(task_id = %task_id, error = %e, "Skipping dispatch");
            return;
        }
        Err(e) => {
            warn!(task_id = %task_id, error = %e, "Task vanished before dispatch");
            return;
        }
    };
    let _ = deps
        .registry
        .set_last_proxy(task_id, proxy.as_ref().map(|p| p.id))
        .await;

    state.set_current(Some(task_id)).await;
    deps.metrics.record(MetricEvent::TaskDispatched);
    store::persist_task(deps.store.clone(), running.clone());
    info!(
        task_id = %task_id,
        slot = state.index,
        attempt = running.retry_count + 1,
        proxy = proxy.as_ref().map(|p| p.display_addr()).unwrap_or_else(|| "direct".to_string()),
        "Attempt started"
    );

    // The executor call itself: bounded, no locks held. A call that outlives
    // the timeout is dropped; whatever it would have returned is discarded.
    let request = build_request(&running, proxy.clone());
    let started = std::time::Instant::now();
    let result = tokio::time::timeout(deps.task_timeout, deps.executor.execute(request)).await;
    let elapsed = started.elapsed();

    let (report, failure): (Option<ExecutionReport>, Option<ExecutorError>) = match result {
        Ok(Ok(report)) => (Some(report), None),
        Ok(Err(e)) => (None, Some(e)),
        Err(_) => (
            None,
            Some(ExecutorError::Timeout {
                timeout: deps.task_timeout,
            }),
        ),
    };

    if let Some(e) = &failure {
        warn!(
            task_id = %task_id,
            kind = e.kind(),
            elapsed_ms = elapsed.as_millis() as u64,
            error = %e,
            "Attempt failed"
        );
    }

    // Proxy outcome first, so health state is current before any requeue.
    if let Some(proxy) = &proxy {
        let success = failure.is_none();
        let latency = success.then_some(elapsed);
        match deps.proxies.report(proxy.id, success, latency).await {
            Ok(HealthTransition::BecameUnhealthy) => {
                deps.metrics.record(MetricEvent::ProxyMarkedUnhealthy);
            }
            Ok(HealthTransition::BecameHealthy) => {
                deps.metrics.record(MetricEvent::ProxyRestored);
            }
            Ok(HealthTransition::Unchanged) => {}
            Err(e) => warn!(task_id = %task_id, error = %e, "Proxy report failed"),
        }
    }

    // Safe point: a cancellation observed here wins over the attempt result;
    // a late success is discarded rather than resurrecting the task.
    let cancelled = deps.registry.cancel_requested(task_id).await.unwrap_or(false);
    let outcome = if cancelled {
        AttemptOutcome::Cancelled
    } else {
        match &failure {
            None => AttemptOutcome::Success,
            Some(e) => AttemptOutcome::Failure {
                error: e.to_string(),
            },
        }
    };

    let mut machine =
        RetryMachine::new(running.retry_count, running.max_retries, deps.retry_policy.clone());
    machine.dispatch();
    let decision = machine.observe(outcome);

    finalize(state, deps, task_id, decision, report, elapsed).await;
}

fn build_request(task: &Task, proxy: Option<ProxyEndpoint>) -> ExecutionRequest {
    ExecutionRequest {
        task_id: task.id,
        target_url: task.target_url.clone(),
        task_type: task.task_type,
        config: task.config.clone(),
        proxy,
    }
}

/// Apply a retry decision: finalize the task or hand it back to the
/// scheduler, persist the new state, and emit metrics.
async fn finalize(
    state: &SlotState,
    deps: &WorkerDeps,
    task_id: uuid::Uuid,
    decision: RetryDecision,
    report: Option<ExecutionReport>,
    elapsed: Duration,
) {
    let result = match decision {
        RetryDecision::Completed => {
            let items = report.as_ref().map(|r| r.items_scraped).unwrap_or(0);
            let updated = deps
                .registry
                .update(task_id, |t| {
                    t.transition_to(TaskStatus::Success).map(|()| {
                        t.items_scraped = items;
                        t.error_message = None;
                        t.clone()
                    })
                })
                .await;
            state.record_completed(elapsed);
            deps.metrics.record(MetricEvent::TaskSucceeded {
                duration: elapsed,
                items_scraped: items,
            });
            info!(task_id = %task_id, items_scraped = items, "Task succeeded");
            updated
        }
        RetryDecision::RetryAfter {
            delay,
            retry_count,
            error,
        } => {
            let updated = deps
                .registry
                .update(task_id, |t| {
                    t.retry_count = retry_count;
                    t.error_message = Some(error.clone());
                    Ok(t.clone())
                })
                .await;
            if let Ok(Ok(snapshot)) = &updated {
                if let Err(e) = deps.scheduler.requeue(snapshot, delay).await {
                    error!(task_id = %task_id, error = %e, "Requeue failed");
                }
            }
            deps.metrics.record(MetricEvent::TaskRetried { retry_count });
            warn!(
                task_id = %task_id,
                retry_count,
                delay_ms = delay.as_millis() as u64,
                "Attempt failed, retrying"
            );
            state.record_failed(elapsed);
            updated
        }
        RetryDecision::GiveUp { error } => {
            let updated = deps
                .registry
                .update(task_id, |t| {
                    let kind = error.clone();
                    t.transition_to(TaskStatus::Failed).map(|()| {
                        t.error_message = Some(kind);
                        t.clone()
                    })
                })
                .await;
            state.record_failed(elapsed);
            deps.metrics.record(MetricEvent::TaskFailed {
                kind: error.clone(),
            });
            error!(task_id = %task_id, error = %error, "Task failed permanently");
            updated
        }
        RetryDecision::Cancelled => {
            let updated = deps
                .registry
                .update(task_id, |t| {
                    t.transition_to(TaskStatus::Cancelled).map(|()| t.clone())
                })
                .await;
            deps.metrics.record(MetricEvent::TaskCancelled);
            info!(task_id = %task_id, "Task cancelled");
            updated
        }
    };

    match result {
        Ok(Ok(snapshot)) => store::persist_task(deps.store.clone(), snapshot),
        Ok(Err(e)) => warn!(task_id = %task_id, error = %e, "Finalize transition rejected"),
        Err(e) => warn!(task_id = %task_id, error = %e, "Finalize lost the task"),
    }

    state.set_current(None).await;
}
