//! Normalised targets and the per-request target record.

use std::net::IpAddr;
use std::sync::Arc;

use crate::store::TargetRecord;

use super::error::{BalancerError, BalancerResult};
use super::registry::Balancer;

/// One normalised entry of an upstream's target history.
///
/// Derived from a [`TargetRecord`]: the raw `host:port` string is split,
/// and a synthetic `order` key makes the history totally ordered in the
/// same way on every worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    /// Host name or literal address.
    pub name: String,
    /// Port.
    pub port: u16,
    /// Weight; `0` removes the entry named by `name:port`.
    pub weight: u32,
    /// `created_at` and record id, concatenated. Lexicographic order of
    /// this key is creation order.
    pub order: String,
}

impl Target {
    /// Normalise a store record.
    ///
    /// # Errors
    ///
    /// Returns [`BalancerError::InvalidTarget`] when the raw string is
    /// not `host:port` with a numeric port.
    pub fn from_record(record: &TargetRecord) -> BalancerResult<Self> {
        let (name, port) = split_host_port(&record.target)?;
        Ok(Self {
            name,
            port,
            weight: record.weight,
            // Zero-padded so lexicographic equals numeric ordering.
            order: format!("{:020}:{}", record.created_at.timestamp_micros(), record.id),
        })
    }
}

/// Split `host:port`, accepting bracketed IPv6 literals.
fn split_host_port(raw: &str) -> BalancerResult<(String, u16)> {
    let (host, port) = raw.rsplit_once(':').ok_or_else(|| {
        BalancerError::InvalidTarget(raw.to_string(), "missing port".to_string())
    })?;
    let port: u16 = port.parse().map_err(|_| {
        BalancerError::InvalidTarget(raw.to_string(), format!("invalid port '{port}'"))
    })?;
    let host = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);
    if host.is_empty() {
        return Err(BalancerError::InvalidTarget(
            raw.to_string(),
            "empty host".to_string(),
        ));
    }
    Ok((host.to_string(), port))
}

/// Kind of host carried by a request target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetType {
    /// A name to be matched against upstreams, then DNS.
    Name,
    /// A literal IPv4 address.
    Ipv4,
    /// A literal IPv6 address.
    Ipv6,
}

/// Mutable per-request record threaded through the proxy pipeline.
///
/// The pipeline fills `host`, `port`, `target_type`, and `try_count`;
/// [`super::BalancerCore::execute`] writes `ip`, `port`, and `hostname`
/// back. The balancer reference and hash value picked on the first
/// attempt are kept so retries stay on the objects the request started
/// with, even if the registry entry is replaced mid-flight.
#[derive(Debug, Clone)]
pub struct RequestTarget {
    /// Host as requested: upstream name, DNS name, or literal address.
    pub host: String,
    /// Requested port; replaced by the selected peer's port.
    pub port: Option<u16>,
    /// What `host` is.
    pub target_type: TargetType,
    /// `0` on the first attempt, incremented per retry by the pipeline.
    pub try_count: u32,
    /// Hash key, memoised on the first attempt. A caller (for instance a
    /// session-pinning filter) may pre-set it.
    pub hash_value: Option<u32>,
    /// Selected peer address.
    pub ip: Option<IpAddr>,
    /// Host name to present to the selected peer.
    pub hostname: Option<String>,
    pub(crate) balancer: Option<Arc<Balancer>>,
}

impl RequestTarget {
    /// Target addressed by name.
    #[must_use]
    pub fn name(host: impl Into<String>, port: Option<u16>) -> Self {
        Self::new(host, port, TargetType::Name)
    }

    /// Target with an explicit kind.
    #[must_use]
    pub fn new(host: impl Into<String>, port: Option<u16>, target_type: TargetType) -> Self {
        Self {
            host: host.into(),
            port,
            target_type,
            try_count: 0,
            hash_value: None,
            ip: None,
            hostname: None,
            balancer: None,
        }
    }

    /// Target holding a literal address.
    #[must_use]
    pub fn literal(ip: IpAddr, port: Option<u16>) -> Self {
        let target_type = match ip {
            IpAddr::V4(_) => TargetType::Ipv4,
            IpAddr::V6(_) => TargetType::Ipv6,
        };
        Self::new(ip.to_string(), port, target_type)
    }

    /// Whether a balancer was picked on an earlier attempt.
    #[must_use]
    pub fn has_balancer(&self) -> bool {
        self.balancer.is_some()
    }
}
