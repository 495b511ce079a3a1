//! Multi-level cache for upstream configuration.
//!
//! Three levels with separate invalidation so one change does not flush
//! unrelated state:
//!
//! * the name index (`name` to upstream id), dropped on any upstream
//!   create, update, or delete;
//! * upstream records, dropped per id on update or delete;
//! * target histories, dropped per id on any target change and on
//!   upstream update or delete.
//!
//! Invalidation is local to this worker. Other workers receive the same
//! configuration event through the bus and invalidate their own layer.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use uuid::Uuid;

use crate::balancer::{Target, Upstream};

/// Worker-local cache of store entities.
#[derive(Debug, Default)]
pub struct CacheLayer {
    index: RwLock<Option<Arc<HashMap<String, Uuid>>>>,
    upstreams: RwLock<HashMap<Uuid, Arc<Upstream>>>,
    histories: RwLock<HashMap<Uuid, Arc<Vec<Target>>>>,
}

impl CacheLayer {
    /// Create an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached name index, if loaded.
    #[must_use]
    pub fn index(&self) -> Option<Arc<HashMap<String, Uuid>>> {
        self.index.read().expect("cache lock poisoned").clone()
    }

    /// Store the name index.
    pub fn store_index(&self, index: Arc<HashMap<String, Uuid>>) {
        *self.index.write().expect("cache lock poisoned") = Some(index);
    }

    /// Drop the name index.
    pub fn invalidate_index(&self) {
        *self.index.write().expect("cache lock poisoned") = None;
    }

    /// Cached upstream record, if loaded.
    #[must_use]
    pub fn upstream(&self, id: Uuid) -> Option<Arc<Upstream>> {
        self.upstreams
            .read()
            .expect("cache lock poisoned")
            .get(&id)
            .cloned()
    }

    /// Store an upstream record.
    pub fn store_upstream(&self, upstream: Arc<Upstream>) {
        self.upstreams
            .write()
            .expect("cache lock poisoned")
            .insert(upstream.id, upstream);
    }

    /// Drop one upstream record.
    pub fn invalidate_upstream(&self, id: Uuid) {
        self.upstreams
            .write()
            .expect("cache lock poisoned")
            .remove(&id);
    }

    /// Cached target history, if loaded.
    #[must_use]
    pub fn history(&self, upstream_id: Uuid) -> Option<Arc<Vec<Target>>> {
        self.histories
            .read()
            .expect("cache lock poisoned")
            .get(&upstream_id)
            .cloned()
    }

    /// Store a target history.
    pub fn store_history(&self, upstream_id: Uuid, history: Arc<Vec<Target>>) {
        self.histories
            .write()
            .expect("cache lock poisoned")
            .insert(upstream_id, history);
    }

    /// Drop one target history.
    pub fn invalidate_history(&self, upstream_id: Uuid) {
        self.histories
            .write()
            .expect("cache lock poisoned")
            .remove(&upstream_id);
    }
}
