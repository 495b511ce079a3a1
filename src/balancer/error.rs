//! Balancer error types.

use thiserror::Error;
use uuid::Uuid;

use crate::dns::DnsError;
use crate::health::HealthError;
use crate::ring::RingError;
use crate::store::StoreError;

/// Errors raised by the balancer core.
#[derive(Debug, Error)]
pub enum BalancerError {
    /// The upstream id is not in the store.
    #[error("upstream {0} not found")]
    UpstreamNotFound(Uuid),

    /// The upstream exists but no balancer is registered for it.
    #[error("no balancer registered for upstream {0}")]
    BalancerNotFound(Uuid),

    /// An upstream definition the core cannot work with.
    #[error("upstream '{0}' is invalid: {1}")]
    InvalidUpstream(String, String),

    /// A target string that is not `host:port`.
    #[error("invalid target '{0}': {1}")]
    InvalidTarget(String, String),

    /// Store failure.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Ring failure.
    #[error(transparent)]
    Ring(#[from] RingError),

    /// DNS failure.
    #[error(transparent)]
    Dns(#[from] DnsError),

    /// Health-checker failure.
    #[error(transparent)]
    Health(#[from] HealthError),
}

/// Result type for balancer operations.
pub type BalancerResult<T> = Result<T, BalancerError>;

/// Failure of a single request's peer resolution.
///
/// Split by the HTTP status the gateway should answer with: 503 when no
/// peer can serve the request right now, 500 for internal errors.
#[derive(Debug, Error)]
pub enum ExecuteError {
    /// The ring holds no healthy peer.
    #[error("failure to get a peer from the ring-balancer")]
    NoPeers,

    /// The target name does not resolve.
    #[error("name resolution failed")]
    NameResolution,

    /// Anything else.
    #[error("{0}")]
    Internal(String),
}

impl ExecuteError {
    /// HTTP status the gateway should answer with.
    #[must_use]
    pub fn status(&self) -> u16 {
        match self {
            Self::NoPeers | Self::NameResolution => 503,
            Self::Internal(_) => 500,
        }
    }
}
