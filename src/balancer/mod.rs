//! # Balancer core
//!
//! Coordinates upstream configuration, per-upstream rings, target
//! history replay, health checking, and per-request peer selection.
//!
//! ## State model
//!
//! An upstream's target log is append-only history, not current state.
//! Every worker replays the same ordered log into a fresh ring and, by
//! construction, arrives at the same wheel; health verdicts then flow
//! over the event bus to keep the workers' views converged. The
//! registry maps upstream ids to fully built balancers; a balancer is
//! either absent or complete, never half-initialised.

mod config;
mod error;
mod events;
mod execute;
mod hash;
mod loader;
mod registry;
mod target;

pub use config::{CoreOptions, HashInput, Upstream, UpstreamConfig, DEFAULT_SLOTS};
pub use error::{BalancerError, BalancerResult, ExecuteError};
pub use events::CrudOp;
pub use hash::{create_hash, RequestContext};
pub use registry::Balancer;
pub use target::{RequestTarget, Target, TargetType};

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use tracing::{error, info, warn};
use uuid::Uuid;

use crate::bus::EventBus;
use crate::cache::CacheLayer;
use crate::dns::Resolve;
use crate::health::HealthRegistry;
use crate::store::ConfigStore;

/// Hot-path counters.
#[derive(Debug, Default)]
pub struct CoreStats {
    balancers_built: AtomicU64,
    balancers_rebuilt: AtomicU64,
    peers_selected: AtomicU64,
    selection_failures: AtomicU64,
    dns_fallbacks: AtomicU64,
}

impl CoreStats {
    fn record_build(&self) {
        self.balancers_built.fetch_add(1, Ordering::Relaxed);
    }

    fn record_rebuild(&self) {
        self.balancers_rebuilt.fetch_add(1, Ordering::Relaxed);
    }

    fn record_selection(&self, success: bool) {
        if success {
            self.peers_selected.fetch_add(1, Ordering::Relaxed);
        } else {
            self.selection_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn record_dns_fallback(&self) {
        self.dns_fallbacks.fetch_add(1, Ordering::Relaxed);
    }

    /// Point-in-time copy of the counters.
    #[must_use]
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            balancers_built: self.balancers_built.load(Ordering::Relaxed),
            balancers_rebuilt: self.balancers_rebuilt.load(Ordering::Relaxed),
            peers_selected: self.peers_selected.load(Ordering::Relaxed),
            selection_failures: self.selection_failures.load(Ordering::Relaxed),
            dns_fallbacks: self.dns_fallbacks.load(Ordering::Relaxed),
        }
    }
}

/// Counter values captured by [`CoreStats::snapshot`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Balancers built, including rebuilds.
    pub balancers_built: u64,
    /// Rebuilds forced by history divergence.
    pub balancers_rebuilt: u64,
    /// Successful peer selections.
    pub peers_selected: u64,
    /// Selections that found no peer.
    pub selection_failures: u64,
    /// Requests resolved over plain DNS.
    pub dns_fallbacks: u64,
}

/// The upstream load-balancing core of one worker.
///
/// All collaborators are injected; the core holds no global state.
/// Cheap to share as `Arc<BalancerCore>` between the request pipeline
/// and the event dispatcher.
pub struct BalancerCore {
    store: Arc<dyn ConfigStore>,
    dns: Arc<dyn Resolve>,
    bus: Arc<EventBus>,
    cache: CacheLayer,
    health_registry: HealthRegistry,
    balancers: RwLock<HashMap<Uuid, Arc<Balancer>>>,
    /// Per-upstream guards serialising creation and event-driven
    /// mutation; lookups stay lock-free on these.
    locks: Mutex<HashMap<Uuid, Arc<tokio::sync::Mutex<()>>>>,
    options: CoreOptions,
    stats: CoreStats,
}

impl BalancerCore {
    /// Create a core with injected collaborators.
    #[must_use]
    pub fn new(
        store: Arc<dyn ConfigStore>,
        dns: Arc<dyn Resolve>,
        bus: Arc<EventBus>,
        options: CoreOptions,
    ) -> Self {
        Self {
            store,
            dns,
            bus,
            cache: CacheLayer::new(),
            health_registry: HealthRegistry::new(),
            balancers: RwLock::new(HashMap::new()),
            locks: Mutex::new(HashMap::new()),
            options,
            stats: CoreStats::default(),
        }
    }

    /// Pre-build a balancer for every known upstream.
    ///
    /// Run once at worker start so the first request does not pay
    /// creation latency. Per-upstream failures are logged and skipped.
    ///
    /// # Errors
    ///
    /// Fails only when the upstream index itself cannot be loaded.
    pub async fn init(&self) -> BalancerResult<()> {
        let index = self.get_all_upstreams().await?;
        info!(upstreams = index.len(), "initialising balancers");
        for (name, id) in index.iter() {
            match self.get_upstream_by_id(*id).await {
                Ok(Some(upstream)) => {
                    if let Err(e) = self.create_balancer(&upstream).await {
                        error!(upstream = %name, error = %e, "failed to build balancer");
                    }
                },
                Ok(None) => warn!(upstream = %name, "listed upstream not found"),
                Err(e) => error!(upstream = %name, error = %e, "failed to load upstream"),
            }
        }
        Ok(())
    }

    /// Push an externally determined health verdict for one peer.
    ///
    /// The checker broadcasts the verdict on the bus, which flips the
    /// peer's status in this worker's ring and in every other worker
    /// subscribed to the same upstream.
    ///
    /// # Errors
    ///
    /// Fails when no balancer is registered for the upstream or the
    /// peer is not a known target.
    pub fn post_health(
        &self,
        upstream_id: Uuid,
        ip: IpAddr,
        port: u16,
        healthy: bool,
    ) -> BalancerResult<()> {
        let balancer = self
            .balancer(upstream_id)
            .ok_or(BalancerError::BalancerNotFound(upstream_id))?;
        balancer.checker().set_target_status(ip, port, healthy)?;
        Ok(())
    }

    /// Counter snapshot.
    #[must_use]
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Number of registered balancers.
    #[must_use]
    pub fn balancer_count(&self) -> usize {
        self.balancers.read().expect("registry lock poisoned").len()
    }

    pub(crate) async fn lock_upstream(&self, id: Uuid) -> tokio::sync::OwnedMutexGuard<()> {
        let mutex = {
            let mut locks = self.locks.lock().expect("lock table poisoned");
            Arc::clone(
                locks
                    .entry(id)
                    .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(()))),
            )
        };
        mutex.lock_owned().await
    }

    pub(crate) fn forget_upstream_lock(&self, id: Uuid) {
        self.locks.lock().expect("lock table poisoned").remove(&id);
    }
}

impl std::fmt::Debug for BalancerCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BalancerCore")
            .field("balancers", &self.balancer_count())
            .field("options", &self.options)
            .finish()
    }
}
