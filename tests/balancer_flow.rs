//! End-to-end tests of the balancer core against in-memory fakes.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use uuid::Uuid;

use corridor_balancer::balancer::{
    BalancerCore, BalancerError, CoreOptions, CrudOp, ExecuteError, HashInput, RequestContext,
    RequestTarget, TargetType, Upstream,
};
use corridor_balancer::bus::EventBus;
use corridor_balancer::dns::{CachingDns, Resolve, StaticDns};
use corridor_balancer::store::{ConfigStore, MemoryStore, TargetRecord};

struct TestEnv {
    core: BalancerCore,
    store: Arc<MemoryStore>,
    dns: Arc<StaticDns>,
    #[allow(dead_code)]
    bus: Arc<EventBus>,
}

fn env() -> TestEnv {
    let store = Arc::new(MemoryStore::new());
    let dns = Arc::new(StaticDns::new());
    let bus = Arc::new(EventBus::new());
    let core = BalancerCore::new(
        Arc::clone(&store) as Arc<dyn ConfigStore>,
        Arc::clone(&dns) as Arc<dyn Resolve>,
        Arc::clone(&bus),
        CoreOptions::default(),
    );
    TestEnv {
        core,
        store,
        dns,
        bus,
    }
}

fn ip(last: u8) -> IpAddr {
    IpAddr::V4(std::net::Ipv4Addr::new(198, 51, 100, last))
}

fn record(upstream_id: Uuid, target: &str, weight: u32, secs: i64) -> TargetRecord {
    TargetRecord {
        upstream_id,
        id: Uuid::new_v4(),
        created_at: Utc.timestamp_opt(secs, 0).unwrap(),
        target: target.to_string(),
        weight,
    }
}

/// Upstream with two weighted targets, `a:80` at 10 and `b:80` at 20.
fn seed_two_targets(env: &TestEnv) -> Upstream {
    let upstream = Upstream {
        slots: 30,
        ..Upstream::new("svc")
    };
    env.store.put_upstream(upstream.clone());
    env.store.push_target(record(upstream.id, "a:80", 10, 1));
    env.store.push_target(record(upstream.id, "b:80", 20, 2));
    env.dns.set("a", vec![ip(1)]);
    env.dns.set("b", vec![ip(2)]);
    upstream
}

async fn resolve_once(core: &BalancerCore, host: &str) -> RequestTarget {
    let mut target = RequestTarget::name(host, None);
    core.execute(&mut target, &RequestContext::new())
        .await
        .unwrap();
    target
}

#[tokio::test]
async fn literal_ip_passes_through() {
    let env = env();

    let mut target = RequestTarget::new("10.0.0.5", Some(8080), TargetType::Ipv4);
    env.core
        .execute(&mut target, &RequestContext::new())
        .await
        .unwrap();

    assert_eq!(target.ip, Some("10.0.0.5".parse().unwrap()));
    assert_eq!(target.port, Some(8080));
    assert_eq!(target.hostname.as_deref(), Some("10.0.0.5"));
    // Neither the upstream registry nor DNS was consulted.
    assert_eq!(env.core.balancer_count(), 0);
    assert_eq!(env.dns.lookup_count(), 0);
}

#[tokio::test]
async fn literal_ip_default_port_is_configurable() {
    let store = Arc::new(MemoryStore::new());
    let core = BalancerCore::new(
        Arc::clone(&store) as Arc<dyn ConfigStore>,
        Arc::new(StaticDns::new()) as Arc<dyn Resolve>,
        Arc::new(EventBus::new()),
        CoreOptions { default_port: 8000 },
    );

    let mut target = RequestTarget::new("10.0.0.5", None, TargetType::Ipv4);
    core.execute(&mut target, &RequestContext::new())
        .await
        .unwrap();
    assert_eq!(target.port, Some(8000));
}

#[tokio::test]
async fn unknown_name_falls_back_to_dns() {
    let env = env();
    env.dns
        .set("example.com", vec!["93.184.216.34".parse().unwrap()]);

    let mut target = RequestTarget::name("example.com", Some(443));
    env.core
        .execute(&mut target, &RequestContext::new())
        .await
        .unwrap();

    assert_eq!(target.ip, Some("93.184.216.34".parse().unwrap()));
    assert_eq!(target.port, Some(443));
    assert_eq!(target.hostname.as_deref(), Some("example.com"));
    assert_eq!(env.core.balancer_count(), 0);
}

#[tokio::test]
async fn nxdomain_maps_to_503() {
    let env = env();

    let mut target = RequestTarget::name("missing.example", Some(80));
    let err = env
        .core
        .execute(&mut target, &RequestContext::new())
        .await
        .unwrap_err();

    assert!(matches!(err, ExecuteError::NameResolution));
    assert_eq!(err.status(), 503);
    assert_eq!(err.to_string(), "name resolution failed");
}

#[tokio::test]
async fn balanced_upstream_first_try() {
    let env = env();
    seed_two_targets(&env);

    let mut counts: HashMap<IpAddr, u32> = HashMap::new();
    for _ in 0..300 {
        let target = resolve_once(&env.core, "svc").await;
        *counts.entry(target.ip.unwrap()).or_default() += 1;
    }

    // The balancer was created lazily on the first request.
    assert_eq!(env.core.balancer_count(), 1);
    // 1:2 weight split, exact over full wheel sweeps.
    assert_eq!(counts[&ip(1)], 100);
    assert_eq!(counts[&ip(2)], 200);
}

#[tokio::test]
async fn weight_zero_removes_target() {
    let env = env();
    let upstream = seed_two_targets(&env);
    resolve_once(&env.core, "svc").await;

    let removal = record(upstream.id, "a:80", 0, 3);
    env.store.push_target(removal.clone());
    env.core.on_target_event(CrudOp::Update, &removal).await;

    for _ in 0..30 {
        let target = resolve_once(&env.core, "svc").await;
        assert_eq!(target.ip, Some(ip(2)));
    }
    let balancer = env.core.get_balancer("svc", true).await.unwrap().unwrap();
    let addresses = balancer.addresses();
    assert_eq!(addresses.len(), 1);
    assert_eq!(addresses[0].ip, ip(2));
}

#[tokio::test]
async fn unchanged_history_is_a_no_op() {
    let env = env();
    let upstream = seed_two_targets(&env);
    resolve_once(&env.core, "svc").await;

    let before = env.core.get_balancer("svc", true).await.unwrap().unwrap();
    let replayed_before = before.replayed_history();

    // Same log in the store; the event must not touch the balancer.
    let last = record(upstream.id, "b:80", 20, 2);
    env.core.on_target_event(CrudOp::Update, &last).await;

    let after = env.core.get_balancer("svc", true).await.unwrap().unwrap();
    assert!(Arc::ptr_eq(&before, &after));
    assert_eq!(after.replayed_history(), replayed_before);
    assert_eq!(env.core.stats().balancers_rebuilt, 0);
}

#[tokio::test]
async fn appended_history_replays_only_the_tail() {
    let env = env();
    let upstream = seed_two_targets(&env);
    resolve_once(&env.core, "svc").await;
    let before = env.core.get_balancer("svc", true).await.unwrap().unwrap();

    env.dns.set("c", vec![ip(3)]);
    let appended = record(upstream.id, "c:80", 5, 3);
    env.store.push_target(appended.clone());
    env.core.on_target_event(CrudOp::Create, &appended).await;

    // Forward-only growth keeps the same balancer object.
    let after = env.core.get_balancer("svc", true).await.unwrap().unwrap();
    assert!(Arc::ptr_eq(&before, &after));
    assert_eq!(after.replayed_history().len(), 3);
    assert_eq!(after.addresses().len(), 3);
    assert_eq!(env.core.stats().balancers_rebuilt, 0);
}

#[tokio::test]
async fn diverged_history_forces_rebuild() {
    let env = env();
    let upstream = seed_two_targets(&env);
    resolve_once(&env.core, "svc").await;
    let before = env.core.get_balancer("svc", true).await.unwrap().unwrap();

    // Rewrite the tail: the first entry survives, the second changes.
    let first = env.store.list_targets(upstream.id).await.unwrap()[0].clone();
    let rewritten = record(upstream.id, "b:80", 30, 4);
    env.store
        .replace_targets(upstream.id, vec![first, rewritten.clone()]);
    env.core.on_target_event(CrudOp::Update, &rewritten).await;

    let after = env.core.get_balancer("svc", true).await.unwrap().unwrap();
    assert!(!Arc::ptr_eq(&before, &after));
    assert_eq!(env.core.stats().balancers_rebuilt, 1);
    // The old balancer's checker was stopped.
    assert_eq!(before.checker().target_count(), 0);
    assert!(after.checker().target_count() > 0);
}

#[tokio::test]
async fn health_event_propagates_to_selection() {
    let env = env();
    let upstream = seed_two_targets(&env);
    resolve_once(&env.core, "svc").await;

    env.core
        .post_health(upstream.id, ip(2), 80, false)
        .unwrap();
    for _ in 0..30 {
        let target = resolve_once(&env.core, "svc").await;
        assert_eq!(target.ip, Some(ip(1)));
    }

    env.core.post_health(upstream.id, ip(2), 80, true).unwrap();
    let mut seen: HashMap<IpAddr, u32> = HashMap::new();
    for _ in 0..30 {
        let target = resolve_once(&env.core, "svc").await;
        *seen.entry(target.ip.unwrap()).or_default() += 1;
    }
    assert!(seen.contains_key(&ip(2)));
}

#[tokio::test]
async fn passive_signals_condemn_and_recover_a_peer() {
    let env = env();
    seed_two_targets(&env);
    resolve_once(&env.core, "svc").await;
    let balancer = env.core.get_balancer("svc", true).await.unwrap().unwrap();

    // Three consecutive failures hit the default passive threshold.
    balancer.report_tcp_failure(ip(2), 80);
    balancer.report_http_status(ip(2), 80, 503);
    balancer.report_tcp_failure(ip(2), 80);

    for _ in 0..30 {
        let target = resolve_once(&env.core, "svc").await;
        assert_eq!(target.ip, Some(ip(1)));
    }

    // Two observed successes bring it back.
    balancer.report_http_status(ip(2), 80, 200);
    balancer.report_http_status(ip(2), 80, 200);
    let mut seen: HashMap<IpAddr, u32> = HashMap::new();
    for _ in 0..30 {
        let target = resolve_once(&env.core, "svc").await;
        *seen.entry(target.ip.unwrap()).or_default() += 1;
    }
    assert!(seen.contains_key(&ip(2)));
}

#[tokio::test]
async fn post_health_without_balancer_is_an_error() {
    let env = env();
    let err = env
        .core
        .post_health(Uuid::new_v4(), ip(1), 80, true)
        .unwrap_err();
    assert!(matches!(err, BalancerError::BalancerNotFound(_)));
}

#[tokio::test]
async fn empty_history_yields_no_peers() {
    let env = env();
    env.store.put_upstream(Upstream::new("empty"));

    let mut target = RequestTarget::name("empty", Some(80));
    let err = env
        .core
        .execute(&mut target, &RequestContext::new())
        .await
        .unwrap_err();

    assert!(matches!(err, ExecuteError::NoPeers));
    assert_eq!(err.status(), 503);
    assert_eq!(
        err.to_string(),
        "failure to get a peer from the ring-balancer"
    );
    // The balancer itself exists; it just has nothing to offer.
    assert_eq!(env.core.balancer_count(), 1);
}

#[tokio::test]
async fn upstream_delete_tears_everything_down() {
    let env = env();
    let upstream = seed_two_targets(&env);
    resolve_once(&env.core, "svc").await;
    let balancer = env.core.get_balancer("svc", true).await.unwrap().unwrap();

    env.store.delete_upstream(upstream.id);
    env.core
        .on_upstream_event(CrudOp::Delete, upstream.id)
        .await;

    assert_eq!(env.core.balancer_count(), 0);
    assert_eq!(balancer.checker().target_count(), 0);
    // The name no longer resolves through the upstream path.
    let mut target = RequestTarget::name("svc", Some(80));
    let err = env
        .core
        .execute(&mut target, &RequestContext::new())
        .await
        .unwrap_err();
    assert!(matches!(err, ExecuteError::NameResolution));
}

#[tokio::test]
async fn upstream_update_recreates_the_balancer() {
    let env = env();
    let mut upstream = seed_two_targets(&env);
    resolve_once(&env.core, "svc").await;
    let before = env.core.get_balancer("svc", true).await.unwrap().unwrap();

    upstream.slots = 60;
    env.store.put_upstream(upstream.clone());
    env.core
        .on_upstream_event(CrudOp::Update, upstream.id)
        .await;

    let after = env.core.get_balancer("svc", true).await.unwrap().unwrap();
    assert!(!Arc::ptr_eq(&before, &after));
    assert_eq!(after.upstream().slots, 60);
    assert_eq!(before.checker().target_count(), 0);
}

#[tokio::test]
async fn upstream_create_event_builds_eagerly() {
    let env = env();
    let upstream = seed_two_targets(&env);
    // Warm the name index so the event has something to invalidate.
    env.core.get_all_upstreams().await.unwrap();

    env.core
        .on_upstream_event(CrudOp::Create, upstream.id)
        .await;
    assert_eq!(env.core.balancer_count(), 1);
}

#[tokio::test]
async fn create_delete_create_round_trips() {
    let env = env();
    let upstream = seed_two_targets(&env);

    let first = env.core.create_balancer(&upstream).await.unwrap();
    let addresses_before = first.addresses();

    env.core
        .on_upstream_event(CrudOp::Delete, upstream.id)
        .await;
    assert_eq!(env.core.balancer_count(), 0);

    let second = env.core.create_balancer(&upstream).await.unwrap();
    assert_eq!(second.addresses(), addresses_before);
}

#[tokio::test]
async fn incremental_replay_equals_full_replay() {
    // Worker one sees the log grow in two steps; worker two reads it
    // whole. Both must end up with the same addresses.
    let incremental = env();
    let upstream = seed_two_targets(&incremental);
    resolve_once(&incremental.core, "svc").await;

    incremental.dns.set("c", vec![ip(3)]);
    let appended = record(upstream.id, "c:80", 5, 3);
    incremental.store.push_target(appended.clone());
    incremental
        .core
        .on_target_event(CrudOp::Create, &appended)
        .await;

    let fresh = env();
    fresh.store.put_upstream(upstream.clone());
    for target in incremental.store.list_targets(upstream.id).await.unwrap() {
        fresh.store.push_target(target);
    }
    fresh.dns.set("a", vec![ip(1)]);
    fresh.dns.set("b", vec![ip(2)]);
    fresh.dns.set("c", vec![ip(3)]);
    resolve_once(&fresh.core, "svc").await;

    let grown = incremental
        .core
        .get_balancer("svc", true)
        .await
        .unwrap()
        .unwrap();
    let whole = fresh.core.get_balancer("svc", true).await.unwrap().unwrap();
    assert_eq!(grown.addresses(), whole.addresses());
    assert_eq!(grown.replayed_history(), whole.replayed_history());
}

#[tokio::test]
async fn replayed_history_matches_the_store() {
    let env = env();
    let upstream = seed_two_targets(&env);
    resolve_once(&env.core, "svc").await;

    let balancer = env.core.get_balancer("svc", true).await.unwrap().unwrap();
    let records = env.store.list_targets(upstream.id).await.unwrap();
    let mut expected: Vec<_> = records
        .iter()
        .map(|r| corridor_balancer::balancer::Target::from_record(r).unwrap())
        .collect();
    expected.sort_by(|a, b| a.order.cmp(&b.order));

    assert_eq!(balancer.replayed_history(), expected);
}

#[tokio::test]
async fn retries_use_cached_dns_and_captured_balancer() {
    let store = Arc::new(MemoryStore::new());
    let inner = Arc::new(StaticDns::new());
    let dns = Arc::new(CachingDns::new(
        Arc::clone(&inner),
        Duration::from_secs(60),
    ));
    let bus = Arc::new(EventBus::new());
    let core = BalancerCore::new(
        Arc::clone(&store) as Arc<dyn ConfigStore>,
        Arc::clone(&dns) as Arc<dyn Resolve>,
        bus,
        CoreOptions::default(),
    );
    inner.set("plain.example", vec![ip(7)]);

    // Plain-DNS path: the first attempt queries, the retry must not.
    let mut target = RequestTarget::name("plain.example", Some(80));
    core.execute(&mut target, &RequestContext::new())
        .await
        .unwrap();
    let after_first = inner.lookup_count();
    assert!(after_first >= 1);

    target.try_count = 1;
    core.execute(&mut target, &RequestContext::new())
        .await
        .unwrap();
    assert_eq!(inner.lookup_count(), after_first);
    assert_eq!(target.ip, Some(ip(7)));
}

#[tokio::test]
async fn retry_keeps_the_balancer_captured_on_first_attempt() {
    let env = env();
    let upstream = seed_two_targets(&env);

    let mut target = RequestTarget::name("svc", None);
    env.core
        .execute(&mut target, &RequestContext::new())
        .await
        .unwrap();
    assert!(target.has_balancer());

    // The registry entry disappears mid-flight; the retry still works
    // off the balancer captured on the first attempt.
    env.core
        .on_upstream_event(CrudOp::Delete, upstream.id)
        .await;
    target.try_count = 1;
    env.core
        .execute(&mut target, &RequestContext::new())
        .await
        .unwrap();
    assert!(target.ip.is_some());
}

#[tokio::test]
async fn consistent_hash_pins_clients_across_workers() {
    let build = || async {
        let e = env();
        let upstream = Upstream {
            slots: 100,
            hash_on: HashInput::Ip,
            ..Upstream::new("svc")
        };
        // Share one id across both workers.
        e.store.put_upstream(Upstream {
            id: Uuid::from_u128(7),
            ..upstream
        });
        e.store
            .push_target(record(Uuid::from_u128(7), "a:80", 1, 1));
        e.store
            .push_target(record(Uuid::from_u128(7), "b:80", 1, 2));
        e.dns.set("a", vec![ip(1)]);
        e.dns.set("b", vec![ip(2)]);
        e
    };

    let worker_one = build().await;
    let worker_two = build().await;
    let ctx = RequestContext::new().with_client_addr("203.0.113.9".parse().unwrap());

    let mut first = RequestTarget::name("svc", None);
    worker_one.core.execute(&mut first, &ctx).await.unwrap();
    let mut second = RequestTarget::name("svc", None);
    worker_two.core.execute(&mut second, &ctx).await.unwrap();

    assert_eq!(first.ip, second.ip);
    assert!(first.hash_value.is_some());
    assert_eq!(first.hash_value, second.hash_value);
}

#[tokio::test]
async fn init_prewarms_every_upstream() {
    let env = env();
    seed_two_targets(&env);
    let other = Upstream::new("other");
    env.store.put_upstream(other.clone());
    env.store.push_target(record(other.id, "c:80", 1, 1));
    env.dns.set("c", vec![ip(3)]);

    env.core.init().await.unwrap();
    assert_eq!(env.core.balancer_count(), 2);
    assert_eq!(env.core.stats().balancers_built, 2);
}

#[tokio::test]
async fn init_skips_upstreams_that_fail_to_build() {
    let env = env();
    seed_two_targets(&env);
    // This upstream's only target cannot be resolved.
    let broken = Upstream::new("broken");
    env.store.put_upstream(broken.clone());
    env.store
        .push_target(record(broken.id, "ghost.internal:80", 1, 1));

    env.core.init().await.unwrap();
    assert_eq!(env.core.balancer_count(), 1);
    assert!(env.core.get_balancer("svc", true).await.is_ok());
}

#[tokio::test]
async fn get_upstream_by_name_distinguishes_unknown_from_error() {
    let env = env();
    seed_two_targets(&env);

    let found = env.core.get_upstream_by_name("svc").await.unwrap();
    assert!(found.is_some());
    let missing = env.core.get_upstream_by_name("nope").await.unwrap();
    assert!(missing.is_none());
}

#[tokio::test]
async fn rebuilt_balancer_inherits_health_verdicts() {
    let env = env();
    let upstream = seed_two_targets(&env);
    resolve_once(&env.core, "svc").await;

    env.core
        .post_health(upstream.id, ip(2), 80, false)
        .unwrap();

    // Force a full rebuild through an upstream update.
    env.core
        .on_upstream_event(CrudOp::Update, upstream.id)
        .await;

    // The fresh balancer starts with the verdict its predecessor had.
    for _ in 0..30 {
        let target = resolve_once(&env.core, "svc").await;
        assert_eq!(target.ip, Some(ip(1)));
    }
}
