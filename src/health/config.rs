//! Health-check configuration types.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Health-check configuration of one upstream.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthCheckConfig {
    /// Active probing.
    pub active: ActiveCheckConfig,

    /// Passive traffic accounting.
    pub passive: PassiveCheckConfig,
}

/// Active probe settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ActiveCheckConfig {
    /// Whether probes run at all. Off by default; passive accounting is
    /// always armed.
    pub enabled: bool,

    /// Probe interval.
    #[serde(with = "humantime_serde")]
    pub interval: Duration,

    /// Per-probe timeout.
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,

    /// Consecutive probe successes before an unhealthy target recovers.
    pub healthy_threshold: u32,

    /// Consecutive probe failures before a healthy target is marked
    /// unhealthy.
    pub unhealthy_threshold: u32,

    /// Probe type.
    pub probe: ProbeType,
}

impl Default for ActiveCheckConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval: Duration::from_secs(10),
            timeout: Duration::from_secs(2),
            healthy_threshold: 2,
            unhealthy_threshold: 3,
            probe: ProbeType::default(),
        }
    }
}

/// Probe type for active checks.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProbeType {
    /// TCP connect.
    #[default]
    Tcp,
    /// HTTP GET with an expected status set.
    Http {
        /// Path to request.
        path: String,
        /// Status codes counting as healthy. Empty accepts any status.
        expected_status: Vec<u16>,
    },
}

/// Passive accounting settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PassiveCheckConfig {
    /// HTTP statuses observed on live traffic that count as failures.
    pub unhealthy_http_statuses: Vec<u16>,

    /// Consecutive failures before a target is marked unhealthy.
    pub unhealthy_threshold: u32,

    /// Consecutive successes before a target recovers.
    pub healthy_threshold: u32,
}

impl Default for PassiveCheckConfig {
    fn default() -> Self {
        Self {
            unhealthy_http_statuses: vec![429, 500, 503],
            unhealthy_threshold: 3,
            healthy_threshold: 2,
        }
    }
}
