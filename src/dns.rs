//! DNS resolution with a retry-aware cache.
//!
//! The core never talks to a resolver library directly. It goes through
//! the [`Resolve`] trait, whose `cache_only` flag carries a contract from
//! the request pipeline: on the first attempt of a request the resolver
//! may query authoritatively, on retries it must serve whatever it
//! already holds, even if stale. Re-querying on a retry would churn the
//! cache while the caller is still working off the answer it got the
//! first time.
//!
//! [`SystemDns`] resolves through the operating system's configured
//! servers. [`CachingDns`] layers the TTL cache and the `cache_only`
//! behavior on top of any inner resolver. [`StaticDns`] is a programmable
//! table for tests.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::debug;
use trust_dns_resolver::error::ResolveErrorKind;
use trust_dns_resolver::system_conf::read_system_conf;
use trust_dns_resolver::TokioAsyncResolver;

use crate::BoxFuture;

/// DNS resolution errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DnsError {
    /// The name does not exist (NXDOMAIN).
    #[error("dns server error: 3 name error")]
    NameError,

    /// The lookup failed for a reason other than NXDOMAIN.
    #[error("dns lookup failed: {0}")]
    Lookup(String),

    /// A cache-only resolution found no usable record.
    #[error("no cached dns record for '{0}'")]
    CacheMiss(String),
}

/// Result type for DNS operations.
pub type DnsResult<T> = Result<T, DnsError>;

/// Narrow resolver interface injected into the core.
pub trait Resolve: Send + Sync {
    /// Resolve `host` to all of its addresses.
    ///
    /// With `cache_only` set, only records the resolver already holds may
    /// be used; the authoritative lookup is skipped.
    fn resolve_all<'a>(
        &'a self,
        host: &'a str,
        cache_only: bool,
    ) -> BoxFuture<'a, DnsResult<Vec<IpAddr>>>;

    /// Resolve `host` to a single socket address.
    fn resolve<'a>(
        &'a self,
        host: &'a str,
        port: u16,
        cache_only: bool,
    ) -> BoxFuture<'a, DnsResult<SocketAddr>> {
        Box::pin(async move {
            let ips = self.resolve_all(host, cache_only).await?;
            match ips.first() {
                Some(ip) => Ok(SocketAddr::new(*ip, port)),
                None => Err(DnsError::NameError),
            }
        })
    }
}

impl<T: Resolve + ?Sized> Resolve for std::sync::Arc<T> {
    fn resolve_all<'a>(
        &'a self,
        host: &'a str,
        cache_only: bool,
    ) -> BoxFuture<'a, DnsResult<Vec<IpAddr>>> {
        (**self).resolve_all(host, cache_only)
    }
}

/// Resolver backed by the system configuration.
pub struct SystemDns {
    resolver: TokioAsyncResolver,
}

impl SystemDns {
    /// Build a resolver from `/etc/resolv.conf` (or the platform
    /// equivalent).
    ///
    /// # Errors
    ///
    /// Returns an error if the system resolver configuration cannot be
    /// read.
    pub fn from_system_conf() -> DnsResult<Self> {
        let (conf, opts) =
            read_system_conf().map_err(|e| DnsError::Lookup(e.to_string()))?;
        Ok(Self {
            resolver: TokioAsyncResolver::tokio(conf, opts),
        })
    }
}

impl Resolve for SystemDns {
    fn resolve_all<'a>(
        &'a self,
        host: &'a str,
        _cache_only: bool,
    ) -> BoxFuture<'a, DnsResult<Vec<IpAddr>>> {
        Box::pin(async move {
            match self.resolver.lookup_ip(host).await {
                Ok(lookup) => {
                    let ips: Vec<IpAddr> = lookup.iter().collect();
                    if ips.is_empty() {
                        Err(DnsError::NameError)
                    } else {
                        Ok(ips)
                    }
                },
                Err(e) => match e.kind() {
                    ResolveErrorKind::NoRecordsFound { .. } => Err(DnsError::NameError),
                    _ => Err(DnsError::Lookup(e.to_string())),
                },
            }
        })
    }
}

struct CacheEntry {
    ips: Vec<IpAddr>,
    expires_at: Instant,
}

/// TTL cache in front of another resolver.
///
/// Fresh entries are served directly. Expired entries are re-queried on a
/// first attempt but served stale on a cache-only (retry) resolution, so
/// a retrying request keeps the answer it started with.
pub struct CachingDns<R> {
    inner: R,
    ttl: Duration,
    entries: Mutex<HashMap<String, CacheEntry>>,
}

impl<R: Resolve> CachingDns<R> {
    /// Wrap `inner` with a cache holding records for `ttl`.
    pub fn new(inner: R, ttl: Duration) -> Self {
        Self {
            inner,
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn cached(&self, host: &str, allow_stale: bool) -> Option<Vec<IpAddr>> {
        let entries = self.entries.lock().expect("dns cache lock poisoned");
        entries.get(host).and_then(|entry| {
            if allow_stale || entry.expires_at > Instant::now() {
                Some(entry.ips.clone())
            } else {
                None
            }
        })
    }

    fn store(&self, host: &str, ips: Vec<IpAddr>) {
        let mut entries = self.entries.lock().expect("dns cache lock poisoned");
        entries.insert(
            host.to_string(),
            CacheEntry {
                ips,
                expires_at: Instant::now() + self.ttl,
            },
        );
    }
}

impl<R: Resolve> Resolve for CachingDns<R> {
    fn resolve_all<'a>(
        &'a self,
        host: &'a str,
        cache_only: bool,
    ) -> BoxFuture<'a, DnsResult<Vec<IpAddr>>> {
        Box::pin(async move {
            if cache_only {
                return self
                    .cached(host, true)
                    .ok_or_else(|| DnsError::CacheMiss(host.to_string()));
            }
            if let Some(ips) = self.cached(host, false) {
                return Ok(ips);
            }
            let ips = self.inner.resolve_all(host, false).await?;
            debug!(host, count = ips.len(), "cached dns answer");
            self.store(host, ips.clone());
            Ok(ips)
        })
    }
}

/// Programmable resolver for tests.
///
/// Records are set explicitly; every authoritative lookup is counted so
/// tests can assert that retries stayed on the cache-only path.
#[derive(Default)]
pub struct StaticDns {
    records: Mutex<HashMap<String, Vec<IpAddr>>>,
    lookups: std::sync::atomic::AtomicU64,
}

impl StaticDns {
    /// Create an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the addresses for `host`, replacing any previous entry.
    pub fn set(&self, host: &str, ips: Vec<IpAddr>) {
        self.records
            .lock()
            .expect("static dns lock poisoned")
            .insert(host.to_string(), ips);
    }

    /// Remove the entry for `host`, making it resolve to NXDOMAIN.
    pub fn remove(&self, host: &str) {
        self.records
            .lock()
            .expect("static dns lock poisoned")
            .remove(host);
    }

    /// Number of lookups served so far.
    #[must_use]
    pub fn lookup_count(&self) -> u64 {
        self.lookups.load(std::sync::atomic::Ordering::Relaxed)
    }
}

impl Resolve for StaticDns {
    fn resolve_all<'a>(
        &'a self,
        host: &'a str,
        _cache_only: bool,
    ) -> BoxFuture<'a, DnsResult<Vec<IpAddr>>> {
        Box::pin(async move {
            self.lookups
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            let records = self.records.lock().expect("static dns lock poisoned");
            match records.get(host) {
                Some(ips) if !ips.is_empty() => Ok(ips.clone()),
                _ => Err(DnsError::NameError),
            }
        })
    }
}
