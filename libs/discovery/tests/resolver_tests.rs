#![allow(clippy::unwrap_used, clippy::expect_used)]

//! Resolver behaviour against the in-memory store, including simulated outages.

use std::sync::Arc;
use std::time::Duration;

use discovery::{
    AddressList, AddressUpdater, DiscoveryError, InMemoryStore, ReconnectPolicy, Registrar,
    RegistrarConfig, Resolver, ResolverConfig, WatchEvent,
};
use parking_lot::Mutex;

const WAIT: Duration = Duration::from_secs(5);

/// Records every list handed to the balancer.
#[derive(Default)]
struct Recorder {
    lists: Mutex<Vec<Vec<String>>>,
}

impl Recorder {
    fn count(&self) -> usize {
        self.lists.lock().len()
    }

    fn last(&self) -> Vec<String> {
        self.lists.lock().last().cloned().unwrap_or_default()
    }

    fn all(&self) -> Vec<Vec<String>> {
        self.lists.lock().clone()
    }
}

impl AddressUpdater for Recorder {
    fn update_addresses(&self, list: &AddressList) {
        self.lists.lock().push(list.to_strings());
    }
}

fn fast_policy() -> ReconnectPolicy {
    ReconnectPolicy::default()
        .with_initial_backoff(Duration::from_millis(10))
        .with_max_backoff(Duration::from_millis(50))
        .with_min_interval(Duration::from_millis(10))
}

fn config() -> ResolverConfig {
    ResolverConfig::new("svc")
        .with_health_check_interval(None)
        .with_reconnect(fast_policy())
}

async fn resolve(store: &InMemoryStore, recorder: &Arc<Recorder>) -> Resolver {
    Resolver::resolve(Arc::new(store.connector()), config(), recorder.clone())
        .await
        .unwrap()
}

async fn until(what: &str, mut cond: impl FnMut() -> bool) {
    let reached = tokio::time::timeout(WAIT, async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(reached.is_ok(), "timed out waiting for {what}");
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| (*s).to_owned()).collect()
}

#[tokio::test]
async fn initial_snapshot_is_published_before_returning() {
    let store = InMemoryStore::new();
    store.put("svc/1.1.1.1:1", "1.1.1.1:1");
    store.put("svc/2.2.2.2:2", "2.2.2.2:2");
    store.put("other/3.3.3.3:3", "3.3.3.3:3");

    let recorder = Arc::new(Recorder::default());
    let resolver = resolve(&store, &recorder).await;

    assert_eq!(recorder.all(), vec![strings(&["1.1.1.1:1", "2.2.2.2:2"])]);
    assert_eq!(resolver.addresses().version(), 1);
    assert_eq!(resolver.addresses().to_strings(), strings(&["1.1.1.1:1", "2.2.2.2:2"]));
}

#[tokio::test]
async fn empty_prefix_still_publishes_once() {
    let store = InMemoryStore::new();
    let recorder = Arc::new(Recorder::default());
    let resolver = resolve(&store, &recorder).await;

    assert_eq!(recorder.all(), vec![Vec::<String>::new()]);
    assert!(resolver.addresses().is_empty());
}

#[tokio::test]
async fn events_after_snapshot_are_applied_in_order() {
    let store = InMemoryStore::new();
    let recorder = Arc::new(Recorder::default());
    let resolver = resolve(&store, &recorder).await;

    store.put("svc/1.1.1.1:1", "1.1.1.1:1");
    store.put("svc/2.2.2.2:2", "2.2.2.2:2");
    store.delete("svc/1.1.1.1:1");

    until("three updates", || recorder.count() == 4).await;
    assert_eq!(
        recorder.all(),
        vec![
            vec![],
            strings(&["1.1.1.1:1"]),
            strings(&["1.1.1.1:1", "2.2.2.2:2"]),
            strings(&["2.2.2.2:2"]),
        ]
    );
    assert_eq!(resolver.addresses().version(), 4);
}

#[tokio::test]
async fn duplicate_put_publishes_once() {
    let store = InMemoryStore::new();
    let recorder = Arc::new(Recorder::default());
    let _resolver = resolve(&store, &recorder).await;

    store.put("svc/1.1.1.1:1", "1.1.1.1:1");
    store.put("svc/1.1.1.1:1", "1.1.1.1:1");
    // Marker so we know both duplicates went through the loop.
    store.put("svc/2.2.2.2:2", "2.2.2.2:2");

    until("marker", || recorder.last().len() == 2).await;
    assert_eq!(recorder.count(), 3);
}

#[tokio::test]
async fn batch_publishes_once_for_net_change() {
    let store = InMemoryStore::new();
    store.put("svc/1.1.1.1:1", "1.1.1.1:1");
    let recorder = Arc::new(Recorder::default());
    let _resolver = resolve(&store, &recorder).await;

    store.apply_batch(vec![
        WatchEvent::Put {
            key: "svc/2.2.2.2:2".to_owned(),
            value: "2.2.2.2:2".to_owned(),
        },
        WatchEvent::Delete {
            key: "svc/1.1.1.1:1".to_owned(),
        },
        WatchEvent::Put {
            key: "svc/3.3.3.3:3".to_owned(),
            value: "3.3.3.3:3".to_owned(),
        },
    ]);

    until("batch applied", || recorder.count() == 2).await;
    assert_eq!(recorder.last(), strings(&["2.2.2.2:2", "3.3.3.3:3"]));

    // A batch that cancels itself out publishes nothing.
    store.apply_batch(vec![
        WatchEvent::Put {
            key: "svc/4.4.4.4:4".to_owned(),
            value: "4.4.4.4:4".to_owned(),
        },
        WatchEvent::Delete {
            key: "svc/4.4.4.4:4".to_owned(),
        },
    ]);
    store.put("svc/5.5.5.5:5", "5.5.5.5:5");
    until("marker", || recorder.last().contains(&"5.5.5.5:5".to_owned())).await;
    assert_eq!(recorder.count(), 3);
}

#[tokio::test]
async fn malformed_delete_keeps_list_and_loop_alive() {
    let store = InMemoryStore::new();
    store.put("svc/1.1.1.1:1", "1.1.1.1:1");
    store.put("svc/garbage", "1.1.1.1:1");
    let recorder = Arc::new(Recorder::default());
    let resolver = resolve(&store, &recorder).await;

    store.delete("svc/garbage");
    store.put("svc/2.2.2.2:2", "2.2.2.2:2");

    until("loop still running", || resolver.addresses().len() == 2).await;
    assert_eq!(
        resolver.addresses().to_strings(),
        strings(&["1.1.1.1:1", "2.2.2.2:2"])
    );
}

#[tokio::test]
async fn outage_keeps_stale_list_then_converges() {
    let store = InMemoryStore::new();
    store.put("svc/1.1.1.1:1", "1.1.1.1:1");
    store.put("svc/2.2.2.2:2", "2.2.2.2:2");
    let recorder = Arc::new(Recorder::default());
    let resolver = resolve(&store, &recorder).await;

    store.set_reachable(false);
    // Changes the resolver cannot see while the store is down.
    store.delete("svc/1.1.1.1:1");
    store.put("svc/3.3.3.3:3", "3.3.3.3:3");
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(resolver.addresses().to_strings(), strings(&["1.1.1.1:1", "2.2.2.2:2"]));
    assert_eq!(recorder.count(), 1);

    store.set_reachable(true);
    until("post-outage snapshot", || {
        resolver.addresses().to_strings() == strings(&["2.2.2.2:2", "3.3.3.3:3"])
    })
    .await;

    // Exactly one reconciling publish, and the list was never empty.
    assert_eq!(recorder.count(), 2);
    assert!(recorder.all().iter().all(|l| !l.is_empty()));

    // Watch is live again.
    store.put("svc/4.4.4.4:4", "4.4.4.4:4");
    until("live update", || resolver.addresses().len() == 3).await;
}

#[tokio::test]
async fn closed_watch_is_reopened_without_publishing() {
    let store = InMemoryStore::new();
    store.put("svc/1.1.1.1:1", "1.1.1.1:1");
    let recorder = Arc::new(Recorder::default());
    let resolver = resolve(&store, &recorder).await;
    let connects = store.connect_count();

    store.close_watches();
    until("reconnect", || store.connect_count() > connects && store.watcher_count() == 1).await;
    assert_eq!(recorder.count(), 1);

    store.put("svc/2.2.2.2:2", "2.2.2.2:2");
    until("update after reconnect", || resolver.addresses().len() == 2).await;
}

#[tokio::test]
async fn resolve_now_reconciles_without_duplicates() {
    let store = InMemoryStore::new();
    store.put("svc/1.1.1.1:1", "1.1.1.1:1");
    let recorder = Arc::new(Recorder::default());
    let resolver = resolve(&store, &recorder).await;
    let revision = store.revision();

    resolver.resolve_now();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(recorder.count(), 1);
    assert_eq!(store.revision(), revision);

    store.put("svc/2.2.2.2:2", "2.2.2.2:2");
    until("update after resync", || recorder.count() == 2).await;
    assert_eq!(recorder.last(), strings(&["1.1.1.1:1", "2.2.2.2:2"]));
}

#[tokio::test]
async fn initial_read_failure_is_reported() {
    let store = InMemoryStore::new();
    store.set_reachable(false);
    let recorder = Arc::new(Recorder::default());

    let err = Resolver::resolve(Arc::new(store.connector()), config(), recorder.clone())
        .await
        .unwrap_err();
    assert!(matches!(err, DiscoveryError::StoreUnreachable { .. }));
    assert_eq!(recorder.count(), 0);
}

#[tokio::test]
async fn close_stops_updates() {
    let store = InMemoryStore::new();
    let recorder = Arc::new(Recorder::default());
    let resolver = resolve(&store, &recorder).await;

    resolver.close().await;
    resolver.close().await;

    store.put("svc/1.1.1.1:1", "1.1.1.1:1");
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(recorder.count(), 1);
    assert_eq!(store.watcher_count(), 0);
}

#[tokio::test]
async fn follows_registrar_lifecycle() {
    let store = InMemoryStore::new();
    let recorder = Arc::new(Recorder::default());
    let resolver = resolve(&store, &recorder).await;

    let reg = Registrar::register(
        Arc::new(store.connector()),
        RegistrarConfig::new("svc", "10.0.0.7", 9000)
            .with_keepalive_interval(Duration::from_millis(100))
            .with_reconnect(fast_policy()),
    )
    .await
    .unwrap();
    until("registration seen", || resolver.addresses().len() == 1).await;
    assert_eq!(resolver.addresses().to_strings(), strings(&["10.0.0.7:9000"]));

    reg.deregister().await.unwrap();
    until("deregistration seen", || resolver.addresses().is_empty()).await;

    resolver.close().await;
}

#[tokio::test]
async fn nested_service_names_are_rejected() {
    let store = InMemoryStore::new();
    store.put("ab/8.8.8.8:8", "8.8.8.8:8");

    let nested = Registrar::register(
        Arc::new(store.connector()),
        RegistrarConfig::new("a/b", "9.9.9.9", 9),
    )
    .await;
    assert!(matches!(nested, Err(DiscoveryError::InvalidConfig(_))));
    assert_eq!(store.get("a/b/9.9.9.9:9"), None);

    let recorder = Arc::new(Recorder::default());
    let nested = Resolver::resolve(
        Arc::new(store.connector()),
        ResolverConfig::new("a/b"),
        recorder.clone(),
    )
    .await;
    assert!(matches!(nested, Err(DiscoveryError::InvalidConfig(_))));

    let resolver = Resolver::resolve(
        Arc::new(store.connector()),
        ResolverConfig::new("a").with_health_check_interval(None),
        recorder.clone(),
    )
    .await
    .unwrap();
    assert!(resolver.addresses().is_empty());
    resolver.close().await;
}

#[tokio::test]
async fn health_probe_leaves_healthy_watch_alone() {
    let store = InMemoryStore::new();
    store.put("svc/1.1.1.1:1", "1.1.1.1:1");
    let recorder = Arc::new(Recorder::default());
    let resolver = Resolver::resolve(
        Arc::new(store.connector()),
        config().with_health_check_interval(Some(Duration::from_millis(20))),
        recorder.clone(),
    )
    .await
    .unwrap();
    let connects = store.connect_count();

    // Healthy probes do not trigger reconnects.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(store.connect_count(), connects);

    store.set_reachable(false);
    tokio::time::sleep(Duration::from_millis(100)).await;
    store.set_reachable(true);
    until("reconnect", || store.connect_count() > connects).await;
    assert_eq!(resolver.addresses().to_strings(), strings(&["1.1.1.1:1"]));
}
