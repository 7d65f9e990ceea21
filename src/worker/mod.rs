//! Worker pool — bounded concurrent task execution.
//!
//! Core components:
//! - `pool` — fixed set of slots, lifecycle (start / shutdown signal / join)
//! - `runner` — per-slot loop: pull, acquire proxy, execute, classify,
//!   apply the retry decision

pub mod pool;
pub(crate) mod runner;

pub use pool::{WorkerDeps, WorkerPool, WorkerPoolStats, WorkerSlotStats};
