//! Proxy subsystem — rotating egress pool with health tracking.
//!
//! Components:
//! - `model` — endpoint type, list-format parsing, stat snapshots
//! - `rotation` — selection strategies (weighted random by default)
//! - `pool` — shared pool: acquire, outcome reporting, cooldown/probe recovery
//! - `probe` — active probing behind the `ProxyProber` trait

pub mod model;
pub mod pool;
pub mod probe;
pub mod rotation;

pub use model::{ProxyEndpoint, ProxyPoolStats, ProxyScheme, ProxyStats};
pub use pool::{HealthTransition, ProbeSweep, ProxyPool};
pub use probe::{HttpProber, ProxyProber};
pub use rotation::RotationStrategy;
