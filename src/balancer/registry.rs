//! Balancer registry: creation, lookup, teardown.

use std::net::IpAddr;
use std::sync::{Arc, Mutex, RwLock};

use tracing::{debug, info};
use uuid::Uuid;

use crate::bus::{BusCallback, EventBus, HealthAction};
use crate::dns::Resolve;
use crate::health::{HealthChecker, HealthRegistry};
use crate::ring::{AddressInfo, Peer, Ring, RingEvent, RingOptions, RingResult};

use super::config::Upstream;
use super::error::{BalancerError, BalancerResult};
use super::target::Target;
use super::BalancerCore;

/// One upstream's ring balancer with its bound health checker.
///
/// Auxiliary state whose lifetime must match the balancer (the checker,
/// the bus callback) lives in the struct itself, so dropping the last
/// `Arc<Balancer>` reclaims everything: the checker's probe task is
/// aborted and the weak bus subscription dies with the callback.
pub struct Balancer {
    upstream: Upstream,
    ring: RwLock<Ring>,
    replayed: Mutex<Vec<Target>>,
    checker: Arc<HealthChecker>,
    bus: Arc<EventBus>,
    dns: Arc<dyn Resolve>,
    bus_callback: Mutex<Option<Arc<BusCallback>>>,
}

impl Balancer {
    fn new(
        upstream: Upstream,
        dns: Arc<dyn Resolve>,
        bus: Arc<EventBus>,
        health_registry: HealthRegistry,
    ) -> Self {
        let checker = Arc::new(HealthChecker::new(
            &upstream.name,
            upstream.healthchecks.clone(),
            Arc::clone(&bus),
            health_registry,
        ));
        let ring = Ring::new(RingOptions {
            slots: upstream.slots,
            order_seed: upstream.order_seed,
        });
        Self {
            upstream,
            ring: RwLock::new(ring),
            replayed: Mutex::new(Vec::new()),
            checker,
            bus,
            dns,
            bus_callback: Mutex::new(None),
        }
    }

    /// The upstream this balancer was built for.
    #[must_use]
    pub fn upstream(&self) -> &Upstream {
        &self.upstream
    }

    /// The bound health checker.
    #[must_use]
    pub fn checker(&self) -> &HealthChecker {
        &self.checker
    }

    /// Snapshot of the history entries already replayed into the ring.
    #[must_use]
    pub fn replayed_history(&self) -> Vec<Target> {
        self.replayed.lock().expect("history lock poisoned").clone()
    }

    /// Snapshot of the ring's current addresses.
    #[must_use]
    pub fn addresses(&self) -> Vec<AddressInfo> {
        self.ring.read().expect("ring lock poisoned").addresses()
    }

    /// Select a peer for a request.
    ///
    /// `dns_cache_only` is part of the selection contract carried over
    /// from the pipeline; this ring resolves names when targets are
    /// added, so selection itself never queries DNS in either mode.
    pub fn get_peer(
        &self,
        hash: Option<u32>,
        try_count: u32,
        _dns_cache_only: bool,
    ) -> RingResult<Peer> {
        self.ring
            .read()
            .expect("ring lock poisoned")
            .get_peer(hash, try_count)
    }

    /// Flip one peer's health flag directly.
    pub fn set_peer_status(&self, healthy: bool, ip: IpAddr, port: u16) {
        let result = self
            .ring
            .read()
            .expect("ring lock poisoned")
            .set_peer_status(healthy, ip, port);
        if let Err(e) = result {
            // The address may have left the ring while the verdict was
            // in flight.
            debug!(upstream = %self.upstream.name, error = %e, "stale peer status dropped");
        }
    }

    /// Passive signal from live traffic: an HTTP response was observed.
    pub fn report_http_status(&self, ip: IpAddr, port: u16, status: u16) {
        self.checker.report_http_status(ip, port, status);
    }

    /// Passive signal from live traffic: a connection attempt failed.
    pub fn report_tcp_failure(&self, ip: IpAddr, port: u16) {
        self.checker.report_tcp_failure(ip, port);
    }

    /// Replay history entries into the ring, recording each applied
    /// entry. Entries with weight zero remove their `host:port`.
    pub(crate) async fn apply_history(&self, entries: &[Target]) -> BalancerResult<()> {
        for entry in entries {
            if entry.weight > 0 {
                let ips = self.resolve_member(&entry.name).await?;
                self.ring
                    .write()
                    .expect("ring lock poisoned")
                    .add_host(&entry.name, entry.port, entry.weight, &ips)?;
            } else {
                self.ring
                    .write()
                    .expect("ring lock poisoned")
                    .remove_host(&entry.name, entry.port);
            }
            self.replayed
                .lock()
                .expect("history lock poisoned")
                .push(entry.clone());
        }
        Ok(())
    }

    async fn resolve_member(&self, name: &str) -> BalancerResult<Vec<IpAddr>> {
        if let Ok(ip) = name.parse::<IpAddr>() {
            return Ok(vec![ip]);
        }
        let mut ips = self.dns.resolve_all(name, false).await?;
        // Sorted so every worker builds the same wheel from the same
        // answer set, whatever order the resolver returned it in.
        ips.sort();
        Ok(ips)
    }

    /// Stop the checker and drop the bus subscription.
    ///
    /// Safe to call more than once. In-flight requests holding this
    /// balancer can still select among the peers it already has.
    pub(crate) fn stop(&self) {
        self.checker.stop();
        if let Some(callback) = self
            .bus_callback
            .lock()
            .expect("callback lock poisoned")
            .take()
        {
            self.bus.unregister(self.checker.source(), &callback);
        }
    }
}

impl std::fmt::Debug for Balancer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Balancer")
            .field("upstream", &self.upstream.name)
            .field("ring", &self.ring.read().expect("ring lock poisoned"))
            .finish()
    }
}

impl BalancerCore {
    /// Build a balancer for `upstream` and publish it in the registry.
    ///
    /// Any previously registered balancer for the same id is replaced
    /// and stopped.
    ///
    /// # Errors
    ///
    /// Fails when the history cannot be fetched or replayed; nothing is
    /// published in that case.
    pub async fn create_balancer(&self, upstream: &Upstream) -> BalancerResult<Arc<Balancer>> {
        let _guard = self.lock_upstream(upstream.id).await;
        self.build_and_publish(upstream, None).await
    }

    /// Creation pipeline. Callers must hold the per-upstream lock.
    ///
    /// The balancer becomes visible to readers only after the history
    /// replayed and the checker is bound, so a registered balancer is
    /// never half-built.
    pub(crate) async fn build_and_publish(
        &self,
        upstream: &Upstream,
        history: Option<Arc<Vec<Target>>>,
    ) -> BalancerResult<Arc<Balancer>> {
        if upstream.slots == 0 {
            return Err(BalancerError::InvalidUpstream(
                upstream.name.clone(),
                "slots must be positive".to_string(),
            ));
        }

        let history = match history {
            Some(history) => history,
            None => self.fetch_target_history(upstream.id).await?,
        };

        let balancer = Arc::new(Balancer::new(
            upstream.clone(),
            Arc::clone(&self.dns),
            Arc::clone(&self.bus),
            self.health_registry.clone(),
        ));
        balancer.apply_history(&history).await?;
        self.attach_healthchecker(&balancer);

        let previous = self
            .balancers
            .write()
            .expect("registry lock poisoned")
            .insert(upstream.id, Arc::clone(&balancer));
        if let Some(previous) = previous {
            previous.stop();
        }
        self.stats.record_build();
        info!(
            upstream = %upstream.name,
            slots = upstream.slots,
            targets = history.len(),
            "balancer ready"
        );
        Ok(balancer)
    }

    /// Wire the checker to the balancer.
    ///
    /// Runs after the initial replay: the population pass seeds every
    /// address that is already in the ring, and only then is the
    /// membership callback installed, so replayed targets are not added
    /// to the checker twice.
    fn attach_healthchecker(&self, balancer: &Arc<Balancer>) {
        {
            let ring = balancer.ring.read().expect("ring lock poisoned");
            for address in ring.addresses() {
                if address.weight == 0 {
                    continue;
                }
                balancer
                    .checker
                    .add_target(address.ip, address.port, &address.hostname);
                // Another worker may already have condemned this peer.
                if balancer.checker.target_status(address.ip, address.port) == Some(false) {
                    let _ = ring.set_peer_status(false, address.ip, address.port);
                }
            }
        }

        let weak = Arc::downgrade(balancer);
        let callback: Arc<BusCallback> = Arc::new(move |event| {
            if let Some(balancer) = weak.upgrade() {
                balancer.set_peer_status(
                    event.action == HealthAction::Healthy,
                    event.ip,
                    event.port,
                );
            }
        });
        self.bus.register_weak(balancer.checker.source(), &callback);
        *balancer
            .bus_callback
            .lock()
            .expect("callback lock poisoned") = Some(callback);

        let checker = Arc::clone(&balancer.checker);
        balancer
            .ring
            .write()
            .expect("ring lock poisoned")
            .set_callback(Arc::new(move |event| match event {
                RingEvent::Added { ip, port, hostname } => {
                    checker.add_target(*ip, *port, hostname);
                },
                RingEvent::Removed { ip, port, .. } => {
                    checker.remove_target(*ip, *port);
                },
            }));
    }

    /// Registered balancer for an upstream id, if any.
    #[must_use]
    pub fn balancer(&self, upstream_id: Uuid) -> Option<Arc<Balancer>> {
        self.balancers
            .read()
            .expect("registry lock poisoned")
            .get(&upstream_id)
            .cloned()
    }

    /// Balancer serving the upstream called `host`.
    ///
    /// `Ok(None)` means the name matches no upstream and the caller
    /// should fall through to plain DNS. A known upstream without a
    /// registered balancer gets one created lazily, unless `no_create`
    /// is set.
    ///
    /// # Errors
    ///
    /// Propagates load failures; with `no_create`, a missing balancer is
    /// an error.
    pub async fn get_balancer(
        &self,
        host: &str,
        no_create: bool,
    ) -> BalancerResult<Option<Arc<Balancer>>> {
        let Some(upstream) = self.get_upstream_by_name(host).await? else {
            return Ok(None);
        };
        if let Some(balancer) = self.balancer(upstream.id) {
            return Ok(Some(balancer));
        }
        if no_create {
            return Err(BalancerError::BalancerNotFound(upstream.id));
        }

        let _guard = self.lock_upstream(upstream.id).await;
        // Another request may have won the race while we waited.
        if let Some(balancer) = self.balancer(upstream.id) {
            return Ok(Some(balancer));
        }
        let balancer = self.build_and_publish(&upstream, None).await?;
        Ok(Some(balancer))
    }

    /// Drop the registry entry for an upstream, stopping its checker.
    pub(crate) fn remove_balancer(&self, upstream_id: Uuid) -> Option<Arc<Balancer>> {
        let removed = self
            .balancers
            .write()
            .expect("registry lock poisoned")
            .remove(&upstream_id);
        if let Some(balancer) = &removed {
            balancer.stop();
            debug!(upstream = %balancer.upstream.name, "balancer removed");
        }
        removed
    }
}
