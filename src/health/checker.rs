//! Health-checker engine.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, warn};

use super::config::{ActiveCheckConfig, HealthCheckConfig, ProbeType};
use crate::bus::{EventBus, HealthAction, HealthEvent};

/// Health-checker errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HealthError {
    /// A verdict was posted for a target the checker does not hold.
    #[error("target {0} is not registered with the health checker")]
    UnknownTarget(SocketAddr),
}

/// Result type for checker operations.
pub type HealthResult<T> = Result<T, HealthError>;

/// Worker-wide memory of the last verdict per address.
///
/// Verdicts outlive any single checker, so a rebuilt balancer inherits
/// the state its predecessor (or another worker) had already reached.
#[derive(Debug, Clone, Default)]
pub struct HealthRegistry {
    verdicts: Arc<Mutex<HashMap<SocketAddr, bool>>>,
}

impl HealthRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Remember the verdict for an address.
    pub fn record(&self, addr: SocketAddr, healthy: bool) {
        self.verdicts
            .lock()
            .expect("health registry lock poisoned")
            .insert(addr, healthy);
    }

    /// Last known verdict for an address, if any.
    #[must_use]
    pub fn known(&self, addr: SocketAddr) -> Option<bool> {
        self.verdicts
            .lock()
            .expect("health registry lock poisoned")
            .get(&addr)
            .copied()
    }
}

#[derive(Debug)]
struct TargetHealth {
    hostname: String,
    healthy: AtomicBool,
    consecutive_failures: AtomicU32,
    consecutive_successes: AtomicU32,
}

struct Shared {
    source: String,
    config: HealthCheckConfig,
    bus: Arc<EventBus>,
    registry: HealthRegistry,
    targets: Mutex<HashMap<SocketAddr, Arc<TargetHealth>>>,
}

impl Shared {
    fn broadcast(&self, addr: SocketAddr, hostname: &str, healthy: bool) {
        self.registry.record(addr, healthy);
        self.bus.post(
            &self.source,
            &HealthEvent {
                action: if healthy {
                    HealthAction::Healthy
                } else {
                    HealthAction::Unhealthy
                },
                ip: addr.ip(),
                port: addr.port(),
                hostname: hostname.to_string(),
            },
        );
    }

    /// Count one observation and broadcast if a threshold flipped the
    /// verdict.
    fn record_result(
        &self,
        addr: SocketAddr,
        success: bool,
        healthy_threshold: u32,
        unhealthy_threshold: u32,
    ) {
        let target = {
            let targets = self.targets.lock().expect("checker lock poisoned");
            match targets.get(&addr) {
                Some(target) => Arc::clone(target),
                None => return,
            }
        };

        if success {
            target.consecutive_failures.store(0, Ordering::Relaxed);
            let successes = target.consecutive_successes.fetch_add(1, Ordering::Relaxed) + 1;
            if successes >= healthy_threshold && !target.healthy.swap(true, Ordering::AcqRel) {
                debug!(target = %addr, "target recovered");
                self.broadcast(addr, &target.hostname, true);
            }
        } else {
            target.consecutive_successes.store(0, Ordering::Relaxed);
            let failures = target.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
            if failures >= unhealthy_threshold && target.healthy.swap(false, Ordering::AcqRel) {
                warn!(target = %addr, failures, "target marked unhealthy");
                self.broadcast(addr, &target.hostname, false);
            }
        }
    }
}

/// Combines active probes and passive signals into per-target verdicts.
///
/// Owned by exactly one balancer; dropping the checker aborts its probe
/// task.
pub struct HealthChecker {
    shared: Arc<Shared>,
    probe_task: Mutex<Option<JoinHandle<()>>>,
}

impl HealthChecker {
    /// Create a checker for the upstream called `name`.
    ///
    /// When active probing is enabled in `config`, a probe task is
    /// spawned immediately; this requires a tokio runtime context.
    #[must_use]
    pub fn new(
        name: &str,
        config: HealthCheckConfig,
        bus: Arc<EventBus>,
        registry: HealthRegistry,
    ) -> Self {
        let shared = Arc::new(Shared {
            source: format!("healthcheck:{name}"),
            config,
            bus,
            registry,
            targets: Mutex::new(HashMap::new()),
        });

        // A zero interval counts as disabled.
        let active = &shared.config.active;
        let probe_task = if active.enabled && !active.interval.is_zero() {
            Some(spawn_probe_task(Arc::clone(&shared)))
        } else {
            None
        };

        Self {
            shared,
            probe_task: Mutex::new(probe_task),
        }
    }

    /// Bus source this checker broadcasts under.
    #[must_use]
    pub fn source(&self) -> &str {
        &self.shared.source
    }

    /// Register a target.
    ///
    /// The initial verdict is seeded from the worker-wide registry, so
    /// an address another checker already marked unhealthy starts out
    /// unhealthy here too. Re-adding a known target keeps its state.
    pub fn add_target(&self, ip: IpAddr, port: u16, hostname: &str) {
        let addr = SocketAddr::new(ip, port);
        let mut targets = self.shared.targets.lock().expect("checker lock poisoned");
        targets.entry(addr).or_insert_with(|| {
            let healthy = self.shared.registry.known(addr).unwrap_or(true);
            debug!(target = %addr, hostname, healthy, "watching target");
            Arc::new(TargetHealth {
                hostname: hostname.to_string(),
                healthy: AtomicBool::new(healthy),
                consecutive_failures: AtomicU32::new(0),
                consecutive_successes: AtomicU32::new(0),
            })
        });
    }

    /// Forget a target. Unknown targets are ignored.
    pub fn remove_target(&self, ip: IpAddr, port: u16) {
        let addr = SocketAddr::new(ip, port);
        self.shared
            .targets
            .lock()
            .expect("checker lock poisoned")
            .remove(&addr);
    }

    /// Current verdict for a target, if it is registered.
    #[must_use]
    pub fn target_status(&self, ip: IpAddr, port: u16) -> Option<bool> {
        let targets = self.shared.targets.lock().expect("checker lock poisoned");
        targets
            .get(&SocketAddr::new(ip, port))
            .map(|t| t.healthy.load(Ordering::Acquire))
    }

    /// Number of registered targets.
    #[must_use]
    pub fn target_count(&self) -> usize {
        self.shared
            .targets
            .lock()
            .expect("checker lock poisoned")
            .len()
    }

    /// Passive signal: an HTTP response was observed on live traffic.
    pub fn report_http_status(&self, ip: IpAddr, port: u16, status: u16) {
        let passive = &self.shared.config.passive;
        let success = !passive.unhealthy_http_statuses.contains(&status);
        self.shared.record_result(
            SocketAddr::new(ip, port),
            success,
            passive.healthy_threshold,
            passive.unhealthy_threshold,
        );
    }

    /// Passive signal: a connection attempt failed on live traffic.
    pub fn report_tcp_failure(&self, ip: IpAddr, port: u16) {
        let passive = &self.shared.config.passive;
        self.shared.record_result(
            SocketAddr::new(ip, port),
            false,
            passive.healthy_threshold,
            passive.unhealthy_threshold,
        );
    }

    /// Explicit verdict, bypassing thresholds.
    ///
    /// Counters reset and the verdict is broadcast unconditionally, so
    /// every worker converges even if this one already agreed.
    ///
    /// # Errors
    ///
    /// Returns [`HealthError::UnknownTarget`] if the target is not
    /// registered.
    pub fn set_target_status(&self, ip: IpAddr, port: u16, healthy: bool) -> HealthResult<()> {
        let addr = SocketAddr::new(ip, port);
        let target = {
            let targets = self.shared.targets.lock().expect("checker lock poisoned");
            targets
                .get(&addr)
                .cloned()
                .ok_or(HealthError::UnknownTarget(addr))?
        };
        target.consecutive_failures.store(0, Ordering::Relaxed);
        target.consecutive_successes.store(0, Ordering::Relaxed);
        target.healthy.store(healthy, Ordering::Release);
        self.shared.broadcast(addr, &target.hostname, healthy);
        Ok(())
    }

    /// Stop probing and clear all target state.
    pub fn stop(&self) {
        if let Some(handle) = self
            .probe_task
            .lock()
            .expect("checker lock poisoned")
            .take()
        {
            handle.abort();
        }
        self.shared
            .targets
            .lock()
            .expect("checker lock poisoned")
            .clear();
    }
}

impl Drop for HealthChecker {
    fn drop(&mut self) {
        if let Some(handle) = self
            .probe_task
            .lock()
            .expect("checker lock poisoned")
            .take()
        {
            handle.abort();
        }
    }
}

impl std::fmt::Debug for HealthChecker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthChecker")
            .field("source", &self.shared.source)
            .field("targets", &self.target_count())
            .finish()
    }
}

fn spawn_probe_task(shared: Arc<Shared>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let active = shared.config.active.clone();
        let mut interval = tokio::time::interval(active.interval);
        interval.tick().await;

        loop {
            interval.tick().await;
            let targets: Vec<SocketAddr> = {
                let map = shared.targets.lock().expect("checker lock poisoned");
                map.keys().copied().collect()
            };
            for addr in targets {
                let healthy = probe(&active, addr).await;
                shared.record_result(
                    addr,
                    healthy,
                    active.healthy_threshold,
                    active.unhealthy_threshold,
                );
            }
        }
    })
}

async fn probe(config: &ActiveCheckConfig, addr: SocketAddr) -> bool {
    match &config.probe {
        ProbeType::Tcp => probe_tcp(config, addr).await.is_ok(),
        ProbeType::Http {
            path,
            expected_status,
        } => probe_http(config, addr, path, expected_status).await.is_ok(),
    }
}

async fn probe_tcp(config: &ActiveCheckConfig, addr: SocketAddr) -> Result<(), String> {
    match timeout(config.timeout, TcpStream::connect(addr)).await {
        Ok(Ok(_)) => Ok(()),
        Ok(Err(e)) => Err(format!("connection failed: {e}")),
        Err(_) => Err("connection timeout".to_string()),
    }
}

async fn probe_http(
    config: &ActiveCheckConfig,
    addr: SocketAddr,
    path: &str,
    expected_status: &[u16],
) -> Result<(), String> {
    let mut stream = match timeout(config.timeout, TcpStream::connect(addr)).await {
        Ok(Ok(s)) => s,
        Ok(Err(e)) => return Err(format!("connection failed: {e}")),
        Err(_) => return Err("connection timeout".to_string()),
    };

    let request = format!(
        "GET {} HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n",
        path,
        addr.ip()
    );
    if let Err(e) = stream.write_all(request.as_bytes()).await {
        return Err(format!("failed to send probe: {e}"));
    }

    let mut reader = BufReader::new(stream);
    let mut status_line = String::new();
    match timeout(config.timeout, reader.read_line(&mut status_line)).await {
        Ok(Ok(_)) => {},
        Ok(Err(e)) => return Err(format!("failed to read response: {e}")),
        Err(_) => return Err("read timeout".to_string()),
    }

    let parts: Vec<&str> = status_line.split_whitespace().collect();
    if parts.len() < 2 {
        return Err(format!("invalid probe response: {status_line}"));
    }
    let status: u16 = parts[1]
        .parse()
        .map_err(|_| format!("invalid status code: {}", parts[1]))?;

    if expected_status.is_empty() || expected_status.contains(&status) {
        Ok(())
    } else {
        Err(format!("unexpected probe status: {status}"))
    }
}
