//! Active and passive health checking.
//!
//! Each balancer owns one [`HealthChecker`]. The checker keeps a table
//! of targets, combines active probes and passive traffic signals into
//! per-target verdicts, and broadcasts every verdict change on the event
//! bus so all workers converge on the same view.
//!
//! A [`HealthRegistry`] shared by every checker of a worker remembers
//! the last verdict per address. When a balancer is rebuilt, its fresh
//! checker seeds target state from the registry instead of assuming
//! everything is healthy again.

pub mod checker;
pub mod config;

pub use checker::{HealthChecker, HealthError, HealthRegistry, HealthResult};
pub use config::{ActiveCheckConfig, HealthCheckConfig, PassiveCheckConfig, ProbeType};
