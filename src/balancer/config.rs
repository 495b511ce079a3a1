//! Upstream configuration types.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::health::HealthCheckConfig;

use super::error::{BalancerError, BalancerResult};

/// Default wheel size for new upstreams.
pub const DEFAULT_SLOTS: u32 = 10_000;

/// Request attribute an upstream hashes on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HashInput {
    /// No consistent hashing; peers are picked by weighted rotation.
    #[default]
    None,
    /// The authenticated consumer, falling back to the credential.
    Consumer,
    /// The client address.
    Ip,
    /// A named request header.
    Header,
}

/// A named pool of backends, addressed collectively by its name.
///
/// Upstreams are created, updated, and deleted by the control plane;
/// the core only ever reads them.
#[derive(Debug, Clone, PartialEq)]
pub struct Upstream {
    /// Unique id.
    pub id: Uuid,
    /// Unique name, matched against request target hosts.
    pub name: String,
    /// Ring wheel size.
    pub slots: u32,
    /// Seed for the deterministic wheel permutation. Workers sharing a
    /// seed build identical wheels.
    pub order_seed: u64,
    /// Primary hash input.
    pub hash_on: HashInput,
    /// Fallback hash input, consulted when the primary yields nothing.
    pub hash_fallback: HashInput,
    /// Header name for `hash_on = header`.
    pub hash_on_header: Option<String>,
    /// Header name for `hash_fallback = header`.
    pub hash_fallback_header: Option<String>,
    /// Health-check settings for this upstream's balancer.
    pub healthchecks: HealthCheckConfig,
}

impl Upstream {
    /// Create an upstream with a fresh id and default settings.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            slots: DEFAULT_SLOTS,
            order_seed: 0,
            hash_on: HashInput::None,
            hash_fallback: HashInput::None,
            hash_on_header: None,
            hash_fallback_header: None,
            healthchecks: HealthCheckConfig::default(),
        }
    }
}

/// Declarative upstream definition, as written in gateway configuration
/// files.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    /// Upstream name.
    pub name: String,
    /// Ring wheel size.
    pub slots: u32,
    /// Wheel permutation seed.
    pub order_seed: u64,
    /// Primary hash input.
    pub hash_on: HashInput,
    /// Fallback hash input.
    pub hash_fallback: HashInput,
    /// Header name for the primary input.
    pub hash_on_header: Option<String>,
    /// Header name for the fallback input.
    pub hash_fallback_header: Option<String>,
    /// Health-check settings.
    pub healthchecks: HealthCheckConfig,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            slots: DEFAULT_SLOTS,
            order_seed: 0,
            hash_on: HashInput::None,
            hash_fallback: HashInput::None,
            hash_on_header: None,
            hash_fallback_header: None,
            healthchecks: HealthCheckConfig::default(),
        }
    }
}

impl UpstreamConfig {
    /// Validate and convert into a runtime [`Upstream`] with a fresh id.
    ///
    /// # Errors
    ///
    /// Returns an error for an empty name, a zero wheel size, or a
    /// header hash input without a header name.
    pub fn into_upstream(self) -> BalancerResult<Upstream> {
        if self.name.is_empty() {
            return Err(BalancerError::InvalidUpstream(
                self.name,
                "name must not be empty".to_string(),
            ));
        }
        if self.slots == 0 {
            return Err(BalancerError::InvalidUpstream(
                self.name,
                "slots must be positive".to_string(),
            ));
        }
        if self.hash_on == HashInput::Header && self.hash_on_header.is_none() {
            return Err(BalancerError::InvalidUpstream(
                self.name,
                "hash-on = header requires hash_on_header".to_string(),
            ));
        }
        if self.hash_fallback == HashInput::Header && self.hash_fallback_header.is_none() {
            return Err(BalancerError::InvalidUpstream(
                self.name,
                "hash-fallback = header requires hash_fallback_header".to_string(),
            ));
        }
        Ok(Upstream {
            id: Uuid::new_v4(),
            name: self.name,
            slots: self.slots,
            order_seed: self.order_seed,
            hash_on: self.hash_on,
            hash_fallback: self.hash_fallback,
            hash_on_header: self.hash_on_header,
            hash_fallback_header: self.hash_fallback_header,
            healthchecks: self.healthchecks,
        })
    }
}

/// Tunables of a [`super::BalancerCore`].
#[derive(Debug, Clone, Copy)]
pub struct CoreOptions {
    /// Port assigned to literal-address targets that carry none.
    pub default_port: u16,
}

impl Default for CoreOptions {
    fn default() -> Self {
        Self { default_port: 80 }
    }
}
