//! Cross-worker event bus with weak subscriptions.
//!
//! Health verdicts are replicated between workers by posting
//! [`HealthEvent`]s under a source string. Subscriptions are held weakly:
//! the bus stores a [`Weak`] reference to the callback, so a subscriber
//! that drops its callback `Arc` is unregistered automatically on the
//! next post. The balancer relies on this to tie the lifetime of its
//! status callback to the balancer itself.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex, Weak};

use tracing::trace;

/// Direction of a health verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthAction {
    /// The peer passed its threshold and accepts traffic again.
    Healthy,
    /// The peer failed its threshold and must not receive traffic.
    Unhealthy,
}

/// A health verdict for one peer, broadcast across workers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthEvent {
    /// Verdict direction.
    pub action: HealthAction,
    /// Peer address.
    pub ip: IpAddr,
    /// Peer port.
    pub port: u16,
    /// Host name the peer was registered under.
    pub hostname: String,
}

/// Callback invoked for every event posted under a subscribed source.
pub type BusCallback = dyn Fn(&HealthEvent) + Send + Sync;

/// In-process publish/subscribe channel for health verdicts.
///
/// One bus instance is shared by every checker and balancer of a worker.
#[derive(Default)]
pub struct EventBus {
    subscribers: Mutex<HashMap<String, Vec<Weak<BusCallback>>>>,
}

impl EventBus {
    /// Create an empty bus.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe `callback` to events posted under `source`.
    ///
    /// Only a weak reference is retained. The caller must keep the `Arc`
    /// alive for as long as it wants to receive events.
    pub fn register_weak(&self, source: &str, callback: &Arc<BusCallback>) {
        let mut subscribers = self.subscribers.lock().expect("bus lock poisoned");
        subscribers
            .entry(source.to_string())
            .or_default()
            .push(Arc::downgrade(callback));
    }

    /// Drop the subscription of `callback` under `source`.
    ///
    /// A no-op if the callback was never registered or already pruned.
    pub fn unregister(&self, source: &str, callback: &Arc<BusCallback>) {
        let mut subscribers = self.subscribers.lock().expect("bus lock poisoned");
        if let Some(list) = subscribers.get_mut(source) {
            let target = Arc::downgrade(callback);
            list.retain(|weak| !Weak::ptr_eq(weak, &target));
            if list.is_empty() {
                subscribers.remove(source);
            }
        }
    }

    /// Post an event to every live subscriber of `source`.
    ///
    /// Dead subscriptions are pruned on the way. Callbacks run on the
    /// caller's thread, outside the bus lock.
    pub fn post(&self, source: &str, event: &HealthEvent) {
        let callbacks: Vec<Arc<BusCallback>> = {
            let mut subscribers = self.subscribers.lock().expect("bus lock poisoned");
            match subscribers.get_mut(source) {
                None => Vec::new(),
                Some(list) => {
                    let live: Vec<Arc<BusCallback>> =
                        list.iter().filter_map(Weak::upgrade).collect();
                    list.retain(|weak| weak.strong_count() > 0);
                    if list.is_empty() {
                        subscribers.remove(source);
                    }
                    live
                },
            }
        };

        trace!(source, ?event.action, ip = %event.ip, port = event.port, "posting health event");
        for callback in callbacks {
            callback(event);
        }
    }

    /// Number of live subscriptions under `source`.
    #[must_use]
    pub fn subscriber_count(&self, source: &str) -> usize {
        let subscribers = self.subscribers.lock().expect("bus lock poisoned");
        subscribers
            .get(source)
            .map_or(0, |list| list.iter().filter(|w| w.strong_count() > 0).count())
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let subscribers = self.subscribers.lock().expect("bus lock poisoned");
        f.debug_struct("EventBus")
            .field("sources", &subscribers.keys().collect::<Vec<_>>())
            .finish()
    }
}
