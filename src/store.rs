//! Configuration store access.
//!
//! Upstreams and targets live in an external store owned by the control
//! plane. The core reads them through the narrow [`ConfigStore`] trait
//! and never writes; mutations arrive as events (see
//! [`crate::balancer::BalancerCore::on_upstream_event`]).
//!
//! [`MemoryStore`] is a complete in-process implementation, used by the
//! test suite and by embedders that configure upstreams statically.

use std::sync::Mutex;

use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::balancer::Upstream;
use crate::BoxFuture;

/// Errors raised by a configuration store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The store could not be reached or answered abnormally.
    #[error("configuration store unavailable: {0}")]
    Unavailable(String),

    /// The store returned a record the core cannot use.
    #[error("malformed record: {0}")]
    Malformed(String),
}

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// One entry of an upstream's target change log, as persisted.
///
/// Targets are history, not state: a record is never edited, and a
/// weight of zero marks the removal of a previously added `host:port`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetRecord {
    /// Upstream this entry belongs to.
    pub upstream_id: Uuid,
    /// Unique id of the entry.
    pub id: Uuid,
    /// Creation timestamp; together with `id` it orders the log.
    pub created_at: DateTime<Utc>,
    /// Raw `host:port` string.
    pub target: String,
    /// Weight, `0` meaning removal.
    pub weight: u32,
}

impl TargetRecord {
    /// Create a record stamped with the current time.
    #[must_use]
    pub fn new(upstream_id: Uuid, target: impl Into<String>, weight: u32) -> Self {
        Self {
            upstream_id,
            id: Uuid::new_v4(),
            created_at: Utc::now(),
            target: target.into(),
            weight,
        }
    }
}

/// Read-only access to upstream and target entities.
pub trait ConfigStore: Send + Sync {
    /// All upstreams.
    fn list_upstreams(&self) -> BoxFuture<'_, StoreResult<Vec<Upstream>>>;

    /// The upstream with the given id, if any.
    fn find_upstream(&self, id: Uuid) -> BoxFuture<'_, StoreResult<Option<Upstream>>>;

    /// The full target log of one upstream, in store order.
    fn list_targets(&self, upstream_id: Uuid) -> BoxFuture<'_, StoreResult<Vec<TargetRecord>>>;
}

/// In-memory [`ConfigStore`].
#[derive(Debug, Default)]
pub struct MemoryStore {
    upstreams: Mutex<Vec<Upstream>>,
    targets: Mutex<Vec<TargetRecord>>,
}

impl MemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace an upstream.
    pub fn put_upstream(&self, upstream: Upstream) {
        let mut upstreams = self.upstreams.lock().expect("store lock poisoned");
        upstreams.retain(|u| u.id != upstream.id);
        upstreams.push(upstream);
    }

    /// Delete an upstream and its target log.
    pub fn delete_upstream(&self, id: Uuid) {
        self.upstreams
            .lock()
            .expect("store lock poisoned")
            .retain(|u| u.id != id);
        self.targets
            .lock()
            .expect("store lock poisoned")
            .retain(|t| t.upstream_id != id);
    }

    /// Append a target record to the log.
    pub fn push_target(&self, record: TargetRecord) {
        self.targets
            .lock()
            .expect("store lock poisoned")
            .push(record);
    }

    /// Replace the whole target log of one upstream.
    ///
    /// Test helper for simulating a log whose tail was rewritten by
    /// another worker (a divergence the balancer must detect).
    pub fn replace_targets(&self, upstream_id: Uuid, records: Vec<TargetRecord>) {
        let mut targets = self.targets.lock().expect("store lock poisoned");
        targets.retain(|t| t.upstream_id != upstream_id);
        targets.extend(records);
    }
}

impl ConfigStore for MemoryStore {
    fn list_upstreams(&self) -> BoxFuture<'_, StoreResult<Vec<Upstream>>> {
        Box::pin(async move {
            Ok(self.upstreams.lock().expect("store lock poisoned").clone())
        })
    }

    fn find_upstream(&self, id: Uuid) -> BoxFuture<'_, StoreResult<Option<Upstream>>> {
        Box::pin(async move {
            let upstreams = self.upstreams.lock().expect("store lock poisoned");
            Ok(upstreams.iter().find(|u| u.id == id).cloned())
        })
    }

    fn list_targets(&self, upstream_id: Uuid) -> BoxFuture<'_, StoreResult<Vec<TargetRecord>>> {
        Box::pin(async move {
            let targets = self.targets.lock().expect("store lock poisoned");
            Ok(targets
                .iter()
                .filter(|t| t.upstream_id == upstream_id)
                .cloned()
                .collect())
        })
    }
}
