//! # Corridor Balancer
//!
//! The upstream load-balancing core of the Corridor gateway. Given an
//! outbound request whose target host is a logical *upstream* name rather
//! than a literal address, this crate selects a concrete peer to connect
//! to, subject to weighted ring-balancing, consistent hashing, DNS
//! resolution, and active/passive health checks, and keeps that selection
//! state consistent with a configuration store whose contents change at
//! runtime.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   execute()   ┌──────────────┐   get_peer()    ┌──────┐
//! │   request    │──────────────▶│ BalancerCore │────────────────▶│ Ring │
//! │   pipeline   │               │  (registry)  │                 └──────┘
//! └──────────────┘               └──────┬───────┘                     ▲
//!                                       │ config events               │
//!                     ┌─────────────────┼─────────────────┐           │
//!                     ▼                 ▼                 ▼           │
//!               ┌───────────┐    ┌───────────┐    ┌─────────────┐    │
//!               │ CacheLayer│    │ConfigStore│    │HealthChecker│────┘
//!               └───────────┘    └───────────┘    └─────────────┘
//! ```
//!
//! [`balancer::BalancerCore`] is constructed once per worker with its
//! collaborators injected: a [`store::ConfigStore`], a [`dns::Resolve`]
//! implementation, and a shared [`bus::EventBus`]. There is no hidden
//! global state; tests build a fresh core with in-memory fakes.

pub mod balancer;
pub mod bus;
pub mod cache;
pub mod dns;
pub mod health;
pub mod ring;
pub mod store;

pub use balancer::{
    BalancerCore, BalancerError, CoreOptions, CrudOp, ExecuteError, HashInput, RequestContext,
    RequestTarget, TargetType, Upstream,
};
pub use bus::{EventBus, HealthAction, HealthEvent};
pub use dns::{CachingDns, DnsError, Resolve, StaticDns, SystemDns};
pub use health::{HealthCheckConfig, HealthChecker};
pub use ring::{Ring, RingError, RingOptions};
pub use store::{ConfigStore, MemoryStore, TargetRecord};

/// Boxed future returned by the async collaborator traits.
///
/// The traits stay object-safe this way, so collaborators can be injected
/// as `Arc<dyn Trait>` values.
pub type BoxFuture<'a, T> =
    std::pin::Pin<Box<dyn std::future::Future<Output = T> + Send + 'a>>;
