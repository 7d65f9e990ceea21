//! Shared proxy pool — selection, outcome reporting, health state.
//!
//! All health and performance mutation flows through [`ProxyPool::report`]
//! and the probe path; nothing else touches proxy stats. Each operation is
//! one critical section under the pool lock, and the lock is never held
//! across executor or probe I/O.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use tokio::sync::{Mutex, Semaphore};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::ProxyConfig;
use crate::error::ProxyError;
use crate::proxy::model::{ProxyEndpoint, ProxyPoolStats, ProxyStats};
use crate::proxy::probe::ProxyProber;
use crate::proxy::rotation::{SelectionView, select};

/// Health flip produced by a report or probe, for metrics emission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthTransition {
    Unchanged,
    BecameUnhealthy,
    BecameHealthy,
}

/// Result of one probe sweep over cooled-down unhealthy proxies.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProbeSweep {
    pub probed: usize,
    pub restored: usize,
}

struct ProxyEntry {
    endpoint: ProxyEndpoint,
    is_healthy: bool,
    /// Smoothed latency in seconds.
    response_time: Option<f64>,
    /// Smoothed success percentage.
    success_rate: f64,
    total_requests: u64,
    consecutive_failures: u32,
    unhealthy_since: Option<Instant>,
    last_used: Option<DateTime<Utc>>,
    last_check: Option<DateTime<Utc>>,
}

impl ProxyEntry {
    fn new(endpoint: ProxyEndpoint) -> Self {
        Self {
            endpoint,
            is_healthy: true,
            response_time: None,
            success_rate: 0.0,
            total_requests: 0,
            consecutive_failures: 0,
            unhealthy_since: None,
            last_used: None,
            last_check: None,
        }
    }

    fn record_latency(&mut self, latency: Duration, alpha: f64) {
        let observed = latency.as_secs_f64();
        self.response_time = Some(match self.response_time {
            Some(current) => alpha * observed + (1.0 - alpha) * current,
            None => observed,
        });
    }

    fn record_outcome(&mut self, success: bool, alpha: f64) {
        let observed = if success { 100.0 } else { 0.0 };
        self.success_rate = if self.total_requests == 0 {
            observed
        } else {
            alpha * observed + (1.0 - alpha) * self.success_rate
        };
        self.total_requests += 1;
    }

    fn stats(&self) -> ProxyStats {
        ProxyStats {
            addr: self.endpoint.display_addr(),
            country: self.endpoint.country.clone(),
            is_healthy: self.is_healthy,
            response_time: self.response_time,
            success_rate: self.success_rate,
            total_requests: self.total_requests,
            consecutive_failures: self.consecutive_failures,
            last_used: self.last_used,
            last_check: self.last_check,
        }
    }

    fn selection_view(&self) -> SelectionView {
        SelectionView {
            total_requests: self.total_requests,
            response_time: self.response_time,
            success_rate: self.success_rate,
        }
    }
}

struct PoolState {
    entries: Vec<ProxyEntry>,
    rr_cursor: usize,
}

/// Pool of rotating egress proxies.
pub struct ProxyPool {
    state: Mutex<PoolState>,
    config: ProxyConfig,
}

impl ProxyPool {
    pub fn new(config: ProxyConfig) -> Self {
        Self {
            state: Mutex::new(PoolState {
                entries: Vec::new(),
                rr_cursor: 0,
            }),
            config,
        }
    }

    /// Add a proxy. Duplicate host:port pairs are ignored.
    pub async fn add(&self, endpoint: ProxyEndpoint) -> bool {
        let mut state = self.state.lock().await;
        if state
            .entries
            .iter()
            .any(|e| e.endpoint.same_endpoint(&endpoint))
        {
            return false;
        }
        debug!(proxy = %endpoint.display_addr(), "Added proxy");
        state.entries.push(ProxyEntry::new(endpoint));
        true
    }

    /// Load proxies from an iterator of list lines. Invalid lines are
    /// logged and skipped; returns the number added.
    pub async fn load_from_lines<I, S>(&self, lines: I) -> usize
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut added = 0;
        for line in lines {
            match ProxyEndpoint::parse(line.as_ref()) {
                Ok(Some(endpoint)) => {
                    if self.add(endpoint).await {
                        added += 1;
                    }
                }
                Ok(None) => {}
                Err(e) => warn!(error = %e, "Skipping proxy list line"),
            }
        }
        added
    }

    /// Load a newline-delimited proxy list file.
    pub async fn load_from_file(&self, path: impl AsRef<Path>) -> Result<usize, ProxyError> {
        let path = path.as_ref();
        let contents = tokio::fs::read_to_string(path).await?;
        let added = self.load_from_lines(contents.lines()).await;
        info!(count = added, path = %path.display(), "Loaded proxies from file");
        Ok(added)
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.state.lock().await.entries.is_empty()
    }

    pub async fn healthy_count(&self) -> usize {
        self.state
            .lock()
            .await
            .entries
            .iter()
            .filter(|e| e.is_healthy)
            .count()
    }

    /// Select a proxy for an attempt.
    ///
    /// `exclude` is the proxy used by the task's immediately preceding
    /// attempt; it is skipped unless it is the only healthy choice left.
    /// With proxies optional (the default), an empty or fully-unhealthy
    /// pool yields `Ok(None)` and the attempt connects directly; with
    /// `mandatory` set, those cases are errors.
    pub async fn acquire(&self, exclude: Option<Uuid>) -> Result<Option<ProxyEndpoint>, ProxyError> {
        let mut state = self.state.lock().await;

        if state.entries.is_empty() {
            if self.config.mandatory {
                return Err(ProxyError::PoolEmpty);
            }
            return Ok(None);
        }

        let healthy: Vec<usize> = state
            .entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.is_healthy)
            .map(|(i, _)| i)
            .collect();

        if healthy.is_empty() {
            if self.config.mandatory {
                return Err(ProxyError::NoHealthy {
                    total: state.entries.len(),
                });
            }
            return Ok(None);
        }

        let mut candidates: Vec<usize> = healthy
            .iter()
            .copied()
            .filter(|&i| exclude != Some(state.entries[i].endpoint.id))
            .collect();
        if candidates.is_empty() {
            // The previous proxy is the only healthy one; reuse beats failing.
            candidates = healthy;
        }

        let views: Vec<SelectionView> = candidates
            .iter()
            .map(|&i| state.entries[i].selection_view())
            .collect();
        let mut cursor = state.rr_cursor;
        let picked = select(self.config.rotation, &views, &mut cursor).expect("non-empty");
        state.rr_cursor = cursor;

        let entry = &mut state.entries[candidates[picked]];
        entry.last_used = Some(Utc::now());
        debug!(proxy = %entry.endpoint.display_addr(), "Selected proxy");
        Ok(Some(entry.endpoint.clone()))
    }

    /// Report the outcome of an attempt routed through `id`.
    ///
    /// Health moves at most one way per call: a failing report can only
    /// mark the proxy unhealthy, a successful one can only restore it.
    pub async fn report(
        &self,
        id: Uuid,
        success: bool,
        latency: Option<Duration>,
    ) -> Result<HealthTransition, ProxyError> {
        let mut state = self.state.lock().await;
        let entry = state
            .entries
            .iter_mut()
            .find(|e| e.endpoint.id == id)
            .ok_or(ProxyError::UnknownProxy { id })?;

        entry.record_outcome(success, self.config.ema_alpha);
        if let Some(latency) = latency {
            entry.record_latency(latency, self.config.ema_alpha);
        }

        if success {
            entry.consecutive_failures = 0;
            if !entry.is_healthy {
                // Passive recovery: a live attempt made it through.
                entry.is_healthy = true;
                entry.unhealthy_since = None;
                info!(proxy = %entry.endpoint.display_addr(), "Proxy restored by live traffic");
                return Ok(HealthTransition::BecameHealthy);
            }
            return Ok(HealthTransition::Unchanged);
        }

        entry.consecutive_failures += 1;
        if entry.is_healthy && entry.consecutive_failures >= self.config.unhealthy_threshold {
            entry.is_healthy = false;
            entry.unhealthy_since = Some(Instant::now());
            warn!(
                proxy = %entry.endpoint.display_addr(),
                failures = entry.consecutive_failures,
                "Proxy marked unhealthy"
            );
            return Ok(HealthTransition::BecameUnhealthy);
        }
        Ok(HealthTransition::Unchanged)
    }

    /// Unhealthy proxies whose cooldown has elapsed, due for a probe.
    pub async fn probe_candidates(&self) -> Vec<ProxyEndpoint> {
        let state = self.state.lock().await;
        state
            .entries
            .iter()
            .filter(|e| {
                !e.is_healthy
                    && e.unhealthy_since
                        .is_some_and(|since| since.elapsed() >= self.config.cooldown)
            })
            .map(|e| e.endpoint.clone())
            .collect()
    }

    /// Record a probe attempt. Success restores the proxy; failure restarts
    /// its cooldown.
    pub async fn record_probe(
        &self,
        id: Uuid,
        latency: Option<Duration>,
    ) -> Result<HealthTransition, ProxyError> {
        let mut state = self.state.lock().await;
        let entry = state
            .entries
            .iter_mut()
            .find(|e| e.endpoint.id == id)
            .ok_or(ProxyError::UnknownProxy { id })?;

        entry.last_check = Some(Utc::now());
        match latency {
            Some(latency) => {
                entry.record_latency(latency, self.config.ema_alpha);
                entry.consecutive_failures = 0;
                if !entry.is_healthy {
                    entry.is_healthy = true;
                    entry.unhealthy_since = None;
                    info!(proxy = %entry.endpoint.display_addr(), "Proxy restored by probe");
                    return Ok(HealthTransition::BecameHealthy);
                }
                Ok(HealthTransition::Unchanged)
            }
            None => {
                if !entry.is_healthy {
                    entry.unhealthy_since = Some(Instant::now());
                }
                Ok(HealthTransition::Unchanged)
            }
        }
    }

    /// Probe every cooled-down unhealthy proxy, with bounded concurrency.
    pub async fn run_probe_sweep(&self, prober: &dyn ProxyProber) -> ProbeSweep {
        let candidates = self.probe_candidates().await;
        if candidates.is_empty() {
            return ProbeSweep::default();
        }

        debug!(count = candidates.len(), "Probing cooled-down proxies");
        let limit = Arc::new(Semaphore::new(self.config.probe_concurrency.max(1)));

        let probes = candidates.iter().map(|endpoint| {
            let limit = Arc::clone(&limit);
            async move {
                let _permit = limit.acquire().await.expect("semaphore open");
                match prober.probe(endpoint).await {
                    Ok(latency) => (endpoint.id, Some(latency)),
                    Err(e) => {
                        debug!(proxy = %endpoint.display_addr(), error = %e, "Probe failed");
                        (endpoint.id, None)
                    }
                }
            }
        });

        let mut sweep = ProbeSweep {
            probed: candidates.len(),
            restored: 0,
        };
        for (id, latency) in join_all(probes).await {
            if let Ok(HealthTransition::BecameHealthy) = self.record_probe(id, latency).await {
                sweep.restored += 1;
            }
        }
        sweep
    }

    /// Aggregate pool statistics.
    pub async fn stats(&self) -> ProxyPoolStats {
        let state = self.state.lock().await;
        let total = state.entries.len();
        let healthy = state.entries.iter().filter(|e| e.is_healthy).count();
        let total_requests: u64 = state.entries.iter().map(|e| e.total_requests).sum();

        let rated: Vec<f64> = state
            .entries
            .iter()
            .filter(|e| e.total_requests > 0)
            .map(|e| e.success_rate)
            .collect();
        let success_rate = if rated.is_empty() {
            0.0
        } else {
            rated.iter().sum::<f64>() / rated.len() as f64
        };

        let timed: Vec<f64> = state
            .entries
            .iter()
            .filter(|e| e.is_healthy)
            .filter_map(|e| e.response_time)
            .collect();
        let avg_response_time = if timed.is_empty() {
            None
        } else {
            Some(timed.iter().sum::<f64>() / timed.len() as f64)
        };

        ProxyPoolStats {
            total,
            healthy,
            unhealthy: total - healthy,
            total_requests,
            success_rate,
            avg_response_time,
        }
    }

    /// Per-proxy stat snapshot, for persistence and dashboards.
    pub async fn snapshot(&self) -> Vec<ProxyStats> {
        self.state
            .lock()
            .await
            .entries
            .iter()
            .map(ProxyEntry::stats)
            .collect()
    }
}
