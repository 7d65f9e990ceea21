//! Rotation strategies for proxy selection.
//!
//! Selection is pure: strategies rank candidate views and return an index
//! into the candidate slice. The pool applies health filtering and the
//! previous-proxy exclusion before calling in here.

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Available rotation strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RotationStrategy {
    RoundRobin,
    Random,
    LeastUsed,
    Fastest,
    #[default]
    Weighted,
}

/// Per-candidate fields a strategy may rank on.
#[derive(Debug, Clone, Copy)]
pub(crate) struct SelectionView {
    pub total_requests: u64,
    /// Smoothed latency in seconds, if observed.
    pub response_time: Option<f64>,
    /// Smoothed success percentage.
    pub success_rate: f64,
}

impl SelectionView {
    /// Weighted-random weight: `success_rate / (1 + response_time)`.
    /// Unused proxies get a median default rate so they get tried, and a
    /// floor keeps consistently failing proxies selectable at all.
    fn weight(&self) -> f64 {
        let rate = if self.total_requests == 0 {
            50.0
        } else {
            self.success_rate.max(1.0)
        };
        rate / (1.0 + self.response_time.unwrap_or(0.0))
    }
}

/// Pick a candidate index, or `None` when the slice is empty.
///
/// `cursor` is the round-robin position, advanced only by that strategy.
pub(crate) fn select(
    strategy: RotationStrategy,
    candidates: &[SelectionView],
    cursor: &mut usize,
) -> Option<usize> {
    if candidates.is_empty() {
        return None;
    }

    let index = match strategy {
        RotationStrategy::RoundRobin => {
            let index = *cursor % candidates.len();
            *cursor = (*cursor + 1) % candidates.len();
            index
        }
        RotationStrategy::Random => rand::thread_rng().gen_range(0..candidates.len()),
        RotationStrategy::LeastUsed => candidates
            .iter()
            .enumerate()
            .min_by_key(|(_, c)| c.total_requests)
            .map(|(i, _)| i)
            .expect("non-empty"),
        RotationStrategy::Fastest => {
            // Prefer proxies with latency data; fall back to random.
            let timed = candidates
                .iter()
                .enumerate()
                .filter(|(_, c)| c.response_time.is_some())
                .min_by(|(_, a), (_, b)| {
                    a.response_time
                        .partial_cmp(&b.response_time)
                        .unwrap_or(std::cmp::Ordering::Equal)
                });
            match timed {
                Some((i, _)) => i,
                None => rand::thread_rng().gen_range(0..candidates.len()),
            }
        }
        RotationStrategy::Weighted => weighted_pick(candidates),
    };

    Some(index)
}

fn weighted_pick(candidates: &[SelectionView]) -> usize {
    let weights: Vec<f64> = candidates.iter().map(SelectionView::weight).collect();
    let total: f64 = weights.iter().sum();
    if total <= 0.0 {
        return rand::thread_rng().gen_range(0..candidates.len());
    }

    let mut roll = rand::thread_rng().gen_range(0.0..total);
    for (i, weight) in weights.iter().enumerate() {
        if roll < *weight {
            return i;
        }
        roll -= weight;
    }
    candidates.len() - 1
}
