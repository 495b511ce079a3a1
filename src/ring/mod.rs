//! Weighted consistent-hash ring.
//!
//! A [`Ring`] assigns the slots of a fixed-size wheel to peer addresses
//! in proportion to their weight. Peer selection either follows a 32-bit
//! hash key (consistent hashing: equal keys land on equal peers for a
//! given membership) or sweeps the wheel with a rotating pointer
//! (weighted distribution without a key).
//!
//! The ring is a plain data structure. It never blocks and performs no
//! I/O; hostname resolution happens before hosts are added. Callers wrap
//! it in a lock and keep awaits outside.

mod wheel;

use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use thiserror::Error;
use tracing::debug;

/// Ring errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RingError {
    /// Every slot is empty or every peer is marked unhealthy.
    #[error("No peers are available")]
    NoPeersAvailable,

    /// A status update referenced an address the ring does not hold.
    #[error("address {0}:{1} is not in the ring")]
    UnknownAddress(IpAddr, u16),

    /// A host was added with an empty address list.
    #[error("host '{0}' resolved to no addresses")]
    NoAddresses(String),
}

/// Result type for ring operations.
pub type RingResult<T> = Result<T, RingError>;

/// Construction parameters for a [`Ring`].
#[derive(Debug, Clone, Copy)]
pub struct RingOptions {
    /// Number of wheel slots.
    pub slots: u32,
    /// Seed for the deterministic wheel permutation.
    pub order_seed: u64,
}

/// Membership change reported to the ring callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RingEvent {
    /// An address joined the ring.
    Added {
        /// Peer address.
        ip: IpAddr,
        /// Peer port.
        port: u16,
        /// Host name the address belongs to.
        hostname: String,
    },
    /// An address left the ring.
    Removed {
        /// Peer address.
        ip: IpAddr,
        /// Peer port.
        port: u16,
        /// Host name the address belonged to.
        hostname: String,
    },
}

/// Callback invoked on every membership change.
pub type RingCallback = Arc<dyn Fn(&RingEvent) + Send + Sync>;

/// A selected peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Peer {
    /// Peer address.
    pub ip: IpAddr,
    /// Peer port.
    pub port: u16,
    /// Host name to present to the peer (SNI, Host header).
    pub hostname: String,
}

/// One address currently in the ring, as reported by [`Ring::addresses`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressInfo {
    /// This address's share of its host's weight.
    pub weight: u32,
    /// Peer address.
    pub ip: IpAddr,
    /// Peer port.
    pub port: u16,
    /// Host name the address belongs to.
    pub hostname: String,
}

#[derive(Debug)]
struct Host {
    name: String,
    port: u16,
    weight: u32,
}

#[derive(Debug)]
struct Address {
    ip: IpAddr,
    port: u16,
    hostname: String,
    weight: u32,
    healthy: AtomicBool,
}

/// Weighted consistent-hash ring over a set of `host:port` members.
pub struct Ring {
    slots: u32,
    order_seed: u64,
    hosts: Vec<Host>,
    addresses: Vec<Address>,
    /// Slot index to address index. Empty while no weighted address exists.
    wheel: Vec<usize>,
    pointer: AtomicUsize,
    callback: Option<RingCallback>,
}

impl Ring {
    /// Create an empty ring.
    #[must_use]
    pub fn new(options: RingOptions) -> Self {
        Self {
            slots: options.slots.max(1),
            order_seed: options.order_seed,
            hosts: Vec::new(),
            addresses: Vec::new(),
            wheel: Vec::new(),
            pointer: AtomicUsize::new(0),
            callback: None,
        }
    }

    /// Number of wheel slots.
    #[must_use]
    pub fn slots(&self) -> u32 {
        self.slots
    }

    /// Install the membership callback.
    ///
    /// Only changes made after installation are reported; members added
    /// earlier are not replayed into the callback.
    pub fn set_callback(&mut self, callback: RingCallback) {
        self.callback = Some(callback);
    }

    /// Add `name:port` with the given weight, backed by `ips`.
    ///
    /// The weight is the member's total share: it is divided across the
    /// resolved addresses, so a name with many records gets no more of
    /// the wheel than a same-weight name with one.
    ///
    /// Adding a member that is already present updates its weight and
    /// keeps its addresses; the change log uses repeated additions as
    /// weight changes.
    ///
    /// # Errors
    ///
    /// Returns [`RingError::NoAddresses`] for a new member with an empty
    /// address list.
    pub fn add_host(
        &mut self,
        name: &str,
        port: u16,
        weight: u32,
        ips: &[IpAddr],
    ) -> RingResult<()> {
        if let Some(host) = self
            .hosts
            .iter_mut()
            .find(|h| h.name == name && h.port == port)
        {
            host.weight = weight;
            let count = self
                .addresses
                .iter()
                .filter(|a| a.hostname == name && a.port == port)
                .count();
            let shares = wheel::split_weight(weight, count);
            for (address, share) in self
                .addresses
                .iter_mut()
                .filter(|a| a.hostname == name && a.port == port)
                .zip(shares)
            {
                address.weight = share;
            }
            debug!(host = name, port, weight, "updated ring member weight");
            self.rebuild_wheel();
            return Ok(());
        }

        if ips.is_empty() {
            return Err(RingError::NoAddresses(name.to_string()));
        }

        self.hosts.push(Host {
            name: name.to_string(),
            port,
            weight,
        });
        let shares = wheel::split_weight(weight, ips.len());
        for (ip, share) in ips.iter().zip(shares) {
            self.addresses.push(Address {
                ip: *ip,
                port,
                hostname: name.to_string(),
                weight: share,
                healthy: AtomicBool::new(true),
            });
            if let Some(callback) = &self.callback {
                callback(&RingEvent::Added {
                    ip: *ip,
                    port,
                    hostname: name.to_string(),
                });
            }
        }
        debug!(host = name, port, weight, addresses = ips.len(), "added ring member");
        self.rebuild_wheel();
        Ok(())
    }

    /// Remove `name:port` and all of its addresses.
    ///
    /// Removing an unknown member is a no-op.
    pub fn remove_host(&mut self, name: &str, port: u16) {
        let before = self.hosts.len();
        self.hosts.retain(|h| !(h.name == name && h.port == port));
        if self.hosts.len() == before {
            return;
        }

        let mut removed = Vec::new();
        self.addresses.retain(|a| {
            if a.hostname == name && a.port == port {
                removed.push(RingEvent::Removed {
                    ip: a.ip,
                    port: a.port,
                    hostname: a.hostname.clone(),
                });
                false
            } else {
                true
            }
        });
        if let Some(callback) = &self.callback {
            for event in &removed {
                callback(event);
            }
        }
        debug!(host = name, port, addresses = removed.len(), "removed ring member");
        self.rebuild_wheel();
    }

    /// Select a peer.
    ///
    /// With a hash the walk starts at the key's slot, so equal keys map
    /// to equal peers for a given membership. Without one, a rotating
    /// pointer sweeps the wheel and weights fall out of the slot counts.
    /// `try_count` skips past the peers already handed to earlier
    /// attempts of the same request; unhealthy peers are skipped always.
    ///
    /// # Errors
    ///
    /// Returns [`RingError::NoPeersAvailable`] when no healthy weighted
    /// address exists.
    pub fn get_peer(&self, hash: Option<u32>, try_count: u32) -> RingResult<Peer> {
        if self.wheel.is_empty() {
            return Err(RingError::NoPeersAvailable);
        }
        let slots = self.wheel.len();
        let start = match hash {
            Some(h) => (h as usize) % slots,
            None => self.pointer.fetch_add(1, Ordering::Relaxed) % slots,
        };

        // Distinct healthy addresses in wheel order from the start slot.
        let wanted = try_count as usize;
        let mut seen = vec![false; self.addresses.len()];
        let mut healthy = Vec::new();
        for offset in 0..slots {
            let index = self.wheel[(start + offset) % slots];
            if seen[index] {
                continue;
            }
            seen[index] = true;
            if self.addresses[index].healthy.load(Ordering::Acquire) {
                healthy.push(index);
                if healthy.len() > wanted {
                    break;
                }
            }
        }
        if healthy.is_empty() {
            return Err(RingError::NoPeersAvailable);
        }

        let address = &self.addresses[healthy[wanted % healthy.len()]];
        Ok(Peer {
            ip: address.ip,
            port: address.port,
            hostname: address.hostname.clone(),
        })
    }

    /// Flip the health flag of one address.
    ///
    /// # Errors
    ///
    /// Returns [`RingError::UnknownAddress`] if the address is not in
    /// the ring (it may have been removed while a verdict was in
    /// flight).
    pub fn set_peer_status(&self, healthy: bool, ip: IpAddr, port: u16) -> RingResult<()> {
        match self
            .addresses
            .iter()
            .find(|a| a.ip == ip && a.port == port)
        {
            Some(address) => {
                address.healthy.store(healthy, Ordering::Release);
                Ok(())
            },
            None => Err(RingError::UnknownAddress(ip, port)),
        }
    }

    /// Snapshot of every address currently in the ring.
    #[must_use]
    pub fn addresses(&self) -> Vec<AddressInfo> {
        self.addresses
            .iter()
            .map(|a| AddressInfo {
                weight: a.weight,
                ip: a.ip,
                port: a.port,
                hostname: a.hostname.clone(),
            })
            .collect()
    }

    fn rebuild_wheel(&mut self) {
        let weights: Vec<u32> = self.addresses.iter().map(|a| a.weight).collect();
        let counts = wheel::allocate(self.slots, &weights);

        let mut assignment = Vec::with_capacity(self.slots as usize);
        for (index, count) in counts.iter().enumerate() {
            for _ in 0..*count {
                assignment.push(index);
            }
        }
        if assignment.is_empty() {
            self.wheel.clear();
            return;
        }

        let order = wheel::permutation(self.slots as usize, self.order_seed);
        let mut new_wheel = vec![0; self.slots as usize];
        for (position, slot) in order.into_iter().enumerate() {
            new_wheel[slot] = assignment[position];
        }
        self.wheel = new_wheel;
    }
}

impl std::fmt::Debug for Ring {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ring")
            .field("slots", &self.slots)
            .field("hosts", &self.hosts.len())
            .field("addresses", &self.addresses.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::net::Ipv4Addr;

    fn ip(last: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(10, 0, 0, last))
    }

    fn ring(slots: u32) -> Ring {
        Ring::new(RingOptions {
            slots,
            order_seed: 1,
        })
    }

    #[test]
    fn test_empty_ring_has_no_peers() {
        let r = ring(10);
        assert_eq!(r.get_peer(None, 0), Err(RingError::NoPeersAvailable));
    }

    #[test]
    fn test_weighted_distribution() {
        let mut r = ring(30);
        r.add_host("a", 80, 10, &[ip(1)]).unwrap();
        r.add_host("b", 80, 20, &[ip(2)]).unwrap();

        let mut counts: HashMap<IpAddr, u32> = HashMap::new();
        for _ in 0..300 {
            let peer = r.get_peer(None, 0).unwrap();
            *counts.entry(peer.ip).or_default() += 1;
        }
        // Exact 1:2 split over full pointer sweeps.
        assert_eq!(counts[&ip(1)], 100);
        assert_eq!(counts[&ip(2)], 200);
    }

    #[test]
    fn test_multi_record_host_keeps_its_configured_share() {
        let mut r = ring(40);
        r.add_host("multi", 80, 10, &[ip(1), ip(2)]).unwrap();
        r.add_host("single", 80, 10, &[ip(3)]).unwrap();

        // The host weight is split across its records, not multiplied
        // by them.
        let by_host: HashMap<&str, u32> = {
            let mut sums: HashMap<&str, u32> = HashMap::new();
            for a in &r.addresses {
                *sums.entry(a.hostname.as_str()).or_default() += a.weight;
            }
            sums
        };
        assert_eq!(by_host["multi"], 10);
        assert_eq!(by_host["single"], 10);

        // Equal weights get equal aggregate traffic over full sweeps.
        let mut counts: HashMap<IpAddr, u32> = HashMap::new();
        for _ in 0..400 {
            let peer = r.get_peer(None, 0).unwrap();
            *counts.entry(peer.ip).or_default() += 1;
        }
        assert_eq!(counts[&ip(1)] + counts[&ip(2)], 200);
        assert_eq!(counts[&ip(3)], 200);
    }

    #[test]
    fn test_hash_is_sticky() {
        let mut r = ring(100);
        r.add_host("a", 80, 1, &[ip(1)]).unwrap();
        r.add_host("b", 80, 1, &[ip(2)]).unwrap();

        let first = r.get_peer(Some(0xdead_beef), 0).unwrap();
        for _ in 0..10 {
            assert_eq!(r.get_peer(Some(0xdead_beef), 0).unwrap(), first);
        }
    }

    #[test]
    fn test_same_seed_same_wheel() {
        let build = || {
            let mut r = ring(64);
            r.add_host("a", 80, 3, &[ip(1)]).unwrap();
            r.add_host("b", 80, 7, &[ip(2)]).unwrap();
            r
        };
        let (r1, r2) = (build(), build());
        for key in 0..64u32 {
            assert_eq!(
                r1.get_peer(Some(key), 0).unwrap(),
                r2.get_peer(Some(key), 0).unwrap()
            );
        }
    }

    #[test]
    fn test_retry_moves_to_next_peer() {
        let mut r = ring(16);
        r.add_host("a", 80, 1, &[ip(1)]).unwrap();
        r.add_host("b", 80, 1, &[ip(2)]).unwrap();

        let first = r.get_peer(Some(5), 0).unwrap();
        let second = r.get_peer(Some(5), 1).unwrap();
        assert_ne!(first.ip, second.ip);

        // With both peers exhausted the walk wraps around.
        let third = r.get_peer(Some(5), 2).unwrap();
        assert_eq!(third.ip, first.ip);
    }

    #[test]
    fn test_unhealthy_peer_is_skipped() {
        let mut r = ring(16);
        r.add_host("a", 80, 1, &[ip(1)]).unwrap();
        r.add_host("b", 80, 1, &[ip(2)]).unwrap();

        r.set_peer_status(false, ip(1), 80).unwrap();
        for key in 0..32u32 {
            assert_eq!(r.get_peer(Some(key), 0).unwrap().ip, ip(2));
        }

        r.set_peer_status(false, ip(2), 80).unwrap();
        assert_eq!(r.get_peer(None, 0), Err(RingError::NoPeersAvailable));

        r.set_peer_status(true, ip(1), 80).unwrap();
        assert_eq!(r.get_peer(None, 0).unwrap().ip, ip(1));
    }

    #[test]
    fn test_remove_unknown_host_is_noop() {
        let mut r = ring(16);
        r.add_host("a", 80, 1, &[ip(1)]).unwrap();
        r.remove_host("nope", 80);
        assert_eq!(r.addresses().len(), 1);
    }

    #[test]
    fn test_re_add_updates_weight() {
        let mut r = ring(30);
        r.add_host("a", 80, 10, &[ip(1)]).unwrap();
        r.add_host("b", 80, 10, &[ip(2)]).unwrap();
        r.add_host("a", 80, 20, &[ip(1)]).unwrap();

        let info: HashMap<IpAddr, u32> = r
            .addresses()
            .into_iter()
            .map(|a| (a.ip, a.weight))
            .collect();
        assert_eq!(info[&ip(1)], 20);
        assert_eq!(info[&ip(2)], 10);
    }

    #[test]
    fn test_callback_sees_membership_changes() {
        use std::sync::Mutex;

        let mut r = ring(16);
        r.add_host("early", 80, 1, &[ip(9)]).unwrap();

        let events: Arc<Mutex<Vec<RingEvent>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        r.set_callback(Arc::new(move |event| {
            sink.lock().unwrap().push(event.clone());
        }));

        r.add_host("a", 80, 1, &[ip(1)]).unwrap();
        r.remove_host("a", 80);

        let seen = events.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert!(matches!(seen[0], RingEvent::Added { ip: i, .. } if i == ip(1)));
        assert!(matches!(seen[1], RingEvent::Removed { ip: i, .. } if i == ip(1)));
    }

    #[test]
    fn test_status_for_unknown_address() {
        let r = ring(16);
        assert!(matches!(
            r.set_peer_status(false, ip(1), 80),
            Err(RingError::UnknownAddress(..))
        ));
    }
}
