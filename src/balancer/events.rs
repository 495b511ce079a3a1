//! Reactions to configuration change events.
//!
//! Events arrive from the control plane through the worker event
//! channel, already serialised per upstream by the per-id lock. Handler
//! errors are logged and swallowed; an event is always acknowledged so
//! one broken upstream cannot block the stream for the others.

use std::sync::Arc;

use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::store::TargetRecord;

use super::config::Upstream;
use super::error::BalancerResult;
use super::registry::Balancer;
use super::BalancerCore;

/// Change kind carried by a configuration event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrudOp {
    /// Entity created.
    Create,
    /// Entity updated.
    Update,
    /// Entity deleted.
    Delete,
}

impl BalancerCore {
    /// Handle a target change for some upstream.
    ///
    /// Every operation on the target log is an append, so all three
    /// kinds route the same way: drop the cached history and reconcile
    /// the balancer against the fresh one.
    pub async fn on_target_event(&self, op: CrudOp, target: &TargetRecord) {
        debug!(?op, upstream = %target.upstream_id, target = %target.target, "target event");
        self.cache.invalidate_history(target.upstream_id);

        let upstream = match self.get_upstream_by_id(target.upstream_id).await {
            Ok(Some(upstream)) => upstream,
            Ok(None) => {
                warn!(upstream = %target.upstream_id, "target event for unknown upstream");
                return;
            },
            Err(e) => {
                error!(upstream = %target.upstream_id, error = %e, "failed to load upstream");
                return;
            },
        };

        let _guard = self.lock_upstream(upstream.id).await;
        let Some(balancer) = self.balancer(upstream.id) else {
            debug!(upstream = %upstream.name, "no balancer yet, target event ignored");
            return;
        };
        if let Err(e) = self.check_target_history(&upstream, &balancer).await {
            error!(upstream = %upstream.name, error = %e, "failed to reconcile target history");
        }
    }

    /// Reconcile a balancer with the store's current target history.
    ///
    /// Three outcomes: nothing changed (equal length, equal final order
    /// key), the history grew (replay only the new tail), or the history
    /// diverged under the balancer's feet (an entry was edited or
    /// reordered). A ring cannot unwind applied entries in place, so
    /// divergence tears the balancer down and builds a fresh one from
    /// the full new history.
    pub(crate) async fn check_target_history(
        &self,
        upstream: &Upstream,
        balancer: &Arc<Balancer>,
    ) -> BalancerResult<()> {
        let new_history = self.fetch_target_history(upstream.id).await?;
        let old_history = balancer.replayed_history();

        if new_history.len() == old_history.len()
            && new_history.last().map(|t| &t.order) == old_history.last().map(|t| &t.order)
        {
            return Ok(());
        }

        let last_equal = old_history
            .iter()
            .zip(new_history.iter())
            .take_while(|(old, new)| old.order == new.order)
            .count();

        if last_equal == old_history.len() {
            debug!(
                upstream = %upstream.name,
                new_entries = new_history.len() - last_equal,
                "replaying target history tail"
            );
            balancer.apply_history(&new_history[last_equal..]).await?;
            return Ok(());
        }

        info!(
            upstream = %upstream.name,
            equal_prefix = last_equal,
            "target history diverged, rebuilding balancer"
        );
        balancer.stop();
        self.stats.record_rebuild();
        self.build_and_publish(upstream, Some(new_history)).await?;
        Ok(())
    }

    /// Handle an upstream create, update, or delete.
    pub async fn on_upstream_event(&self, op: CrudOp, upstream_id: Uuid) {
        debug!(?op, upstream = %upstream_id, "upstream event");
        match op {
            CrudOp::Create => {
                self.cache.invalidate_index();
                let _guard = self.lock_upstream(upstream_id).await;
                self.recreate_balancer(upstream_id).await;
            },
            CrudOp::Update => {
                self.cache.invalidate_index();
                self.cache.invalidate_upstream(upstream_id);
                self.cache.invalidate_history(upstream_id);
                let _guard = self.lock_upstream(upstream_id).await;
                self.remove_balancer(upstream_id);
                self.recreate_balancer(upstream_id).await;
            },
            CrudOp::Delete => {
                self.cache.invalidate_index();
                self.cache.invalidate_upstream(upstream_id);
                self.cache.invalidate_history(upstream_id);
                {
                    let _guard = self.lock_upstream(upstream_id).await;
                    self.remove_balancer(upstream_id);
                }
                self.forget_upstream_lock(upstream_id);
            },
        }
    }

    /// Fetch the current upstream record and build its balancer. Caller
    /// holds the per-upstream lock.
    async fn recreate_balancer(&self, upstream_id: Uuid) {
        match self.get_upstream_by_id(upstream_id).await {
            Ok(Some(upstream)) => {
                if let Err(e) = self.build_and_publish(&upstream, None).await {
                    error!(upstream = %upstream.name, error = %e, "failed to build balancer");
                }
            },
            Ok(None) => {
                warn!(upstream = %upstream_id, "upstream event for unknown upstream");
            },
            Err(e) => {
                error!(upstream = %upstream_id, error = %e, "failed to load upstream");
            },
        }
    }
}
