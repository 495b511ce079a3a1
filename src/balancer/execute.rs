//! Per-request peer resolution.

use tracing::{debug, trace};

use crate::dns::DnsError;
use crate::ring::RingError;

use super::error::ExecuteError;
use super::hash::{create_hash, RequestContext};
use super::target::{RequestTarget, TargetType};
use super::BalancerCore;

impl BalancerCore {
    /// Resolve a request target to a concrete peer.
    ///
    /// The hot path. Literal addresses pass straight through. Names are
    /// matched against the upstreams; a match selects a peer from that
    /// upstream's ring, anything else falls back to plain DNS. On
    /// success `ip`, `port`, and `hostname` are written into `target`.
    ///
    /// Retries (`try_count > 0`) reuse the balancer and hash captured on
    /// the first attempt and keep DNS in cache-only mode, so a retrying
    /// request neither re-queries authoritative DNS nor migrates to a
    /// rebuilt balancer mid-flight.
    ///
    /// # Errors
    ///
    /// [`ExecuteError::status`] maps failures to the HTTP status the
    /// gateway should answer with: 503 when no peer is available or the
    /// name does not exist, 500 otherwise.
    pub async fn execute(
        &self,
        target: &mut RequestTarget,
        ctx: &RequestContext,
    ) -> Result<(), ExecuteError> {
        if target.target_type != TargetType::Name {
            let ip = target
                .host
                .parse()
                .map_err(|_| ExecuteError::Internal(format!("invalid address '{}'", target.host)))?;
            target.ip = Some(ip);
            target.port = Some(target.port.unwrap_or(self.options.default_port));
            target.hostname = Some(target.host.clone());
            return Ok(());
        }

        let dns_cache_only = target.try_count != 0;

        if target.try_count == 0 {
            match self.get_balancer(&target.host, false).await {
                Ok(Some(balancer)) => {
                    if target.hash_value.is_none() {
                        target.hash_value = create_hash(balancer.upstream(), ctx);
                    }
                    target.balancer = Some(balancer);
                },
                Ok(None) => {
                    trace!(host = %target.host, "host matches no upstream, using dns");
                },
                Err(e) => return Err(ExecuteError::Internal(e.to_string())),
            }
        }

        if let Some(balancer) = target.balancer.clone() {
            let hash_value = target.hash_value;
            match balancer.get_peer(hash_value, target.try_count, dns_cache_only) {
                Ok(peer) => {
                    debug!(
                        upstream = %balancer.upstream().name,
                        peer = %peer.ip,
                        port = peer.port,
                        try_count = target.try_count,
                        "peer selected"
                    );
                    target.ip = Some(peer.ip);
                    target.port = Some(peer.port);
                    target.hostname = Some(peer.hostname);
                    target.hash_value = hash_value;
                    self.stats.record_selection(true);
                    Ok(())
                },
                Err(RingError::NoPeersAvailable) => {
                    self.stats.record_selection(false);
                    Err(ExecuteError::NoPeers)
                },
                Err(e) => {
                    self.stats.record_selection(false);
                    Err(ExecuteError::Internal(e.to_string()))
                },
            }
        } else {
            let port = target.port.unwrap_or(self.options.default_port);
            self.stats.record_dns_fallback();
            match self.dns.resolve(&target.host, port, dns_cache_only).await {
                Ok(addr) => {
                    target.ip = Some(addr.ip());
                    target.port = Some(addr.port());
                    target.hostname = Some(target.host.clone());
                    Ok(())
                },
                Err(DnsError::NameError) => Err(ExecuteError::NameResolution),
                Err(e) => Err(ExecuteError::Internal(e.to_string())),
            }
        }
    }
}
