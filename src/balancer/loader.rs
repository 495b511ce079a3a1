//! Cache-routed loading of upstreams and target histories.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;
use uuid::Uuid;

use super::config::Upstream;
use super::error::BalancerResult;
use super::target::Target;
use super::BalancerCore;

impl BalancerCore {
    /// Map of every upstream name to its id.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub async fn get_all_upstreams(&self) -> BalancerResult<Arc<HashMap<String, Uuid>>> {
        if let Some(index) = self.cache.index() {
            return Ok(index);
        }
        let upstreams = self.store.list_upstreams().await?;
        let index: Arc<HashMap<String, Uuid>> = Arc::new(
            upstreams
                .into_iter()
                .map(|upstream| (upstream.name, upstream.id))
                .collect(),
        );
        debug!(count = index.len(), "loaded upstream index");
        self.cache.store_index(Arc::clone(&index));
        Ok(index)
    }

    /// Upstream record by id; `Ok(None)` when the id is unknown.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub async fn get_upstream_by_id(&self, id: Uuid) -> BalancerResult<Option<Arc<Upstream>>> {
        if let Some(upstream) = self.cache.upstream(id) {
            return Ok(Some(upstream));
        }
        match self.store.find_upstream(id).await? {
            Some(upstream) => {
                let upstream = Arc::new(upstream);
                self.cache.store_upstream(Arc::clone(&upstream));
                Ok(Some(upstream))
            },
            None => Ok(None),
        }
    }

    /// Upstream record by name.
    ///
    /// `Ok(None)` is the distinguished "no such upstream" answer that
    /// sends request resolution down the plain-DNS path; it is not an
    /// error.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub async fn get_upstream_by_name(
        &self,
        name: &str,
    ) -> BalancerResult<Option<Arc<Upstream>>> {
        let index = self.get_all_upstreams().await?;
        match index.get(name) {
            None => Ok(None),
            Some(id) => self.get_upstream_by_id(*id).await,
        }
    }

    /// Normalised target history of an upstream, sorted ascending by
    /// order key.
    ///
    /// # Errors
    ///
    /// Propagates store failures and malformed target strings.
    pub(crate) async fn fetch_target_history(
        &self,
        upstream_id: Uuid,
    ) -> BalancerResult<Arc<Vec<Target>>> {
        if let Some(history) = self.cache.history(upstream_id) {
            return Ok(history);
        }
        let records = self.store.list_targets(upstream_id).await?;
        let mut history = records
            .iter()
            .map(Target::from_record)
            .collect::<BalancerResult<Vec<Target>>>()?;
        history.sort_by(|a, b| a.order.cmp(&b.order));
        let history = Arc::new(history);
        debug!(upstream = %upstream_id, entries = history.len(), "loaded target history");
        self.cache.store_history(upstream_id, Arc::clone(&history));
        Ok(history)
    }
}
