#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use kindex_api::{informers, start, AnyLister, ApiControl, ApiError, ApiResult, ApiWatcher, ControlOptions, HasSyncedFn, InformerFn};
use kindex_core::{index, Pod, Service};
use kindex_kubehub::mock::MockClient;
use kindex_kubehub::{ClusterClient, ListOptions};
use kindex_store::ModifiedClock;

type Factory = fn(ListOptions) -> InformerFn;

struct Consumer {
    name: &'static str,
    wants: Vec<(&'static str, Factory)>,
    listers: Mutex<HashMap<String, AnyLister>>,
    synced: Mutex<Option<HasSyncedFn>>,
    clock: Mutex<Option<ModifiedClock>>,
    strict_pods: bool,
}

impl Consumer {
    fn new(name: &'static str, wants: Vec<(&'static str, Factory)>) -> Arc<Self> {
        Arc::new(Self {
            name,
            wants,
            listers: Mutex::new(HashMap::new()),
            synced: Mutex::new(None),
            clock: Mutex::new(None),
            strict_pods: false,
        })
    }

    fn lister(&self, watch: &str) -> Option<AnyLister> {
        self.listers.lock().expect("lock").get(watch).cloned()
    }

    fn has_synced(&self) -> bool {
        self.synced.lock().expect("lock").as_ref().map(|f| f()).unwrap_or(false)
    }
}

impl ApiWatcher for Consumer {
    fn name(&self) -> &str {
        self.name
    }

    fn informers(&self) -> Vec<(String, InformerFn)> {
        self.wants.iter().map(|(n, f)| (n.to_string(), f(ListOptions::new()))).collect()
    }

    fn set_lister(&self, watch: &str, lister: AnyLister) -> ApiResult<()> {
        if self.strict_pods && watch == "pod" {
            lister.clone().into_services(watch)?;
        }
        self.listers.lock().expect("lock").insert(watch.to_string(), lister);
        Ok(())
    }

    fn set_has_synced(&self, synced: HasSyncedFn) {
        *self.synced.lock().expect("lock") = Some(synced);
    }

    fn set_modified(&self, clock: ModifiedClock) {
        *self.clock.lock().expect("lock") = Some(clock);
    }
}

fn pod(name: &str, ip: &str) -> Pod {
    Pod { name: name.into(), namespace: "ns1".into(), resource_version: "1".into(), pod_ip: ip.into(), deleting: false }
}

fn opts() -> ControlOptions {
    ControlOptions { sync_timeout: Duration::from_secs(2), relist_pause: Duration::from_millis(10) }
}

fn as_consumers(list: &[&Arc<Consumer>]) -> Vec<Arc<dyn ApiWatcher>> {
    list.iter().map(|c| Arc::clone(*c) as Arc<dyn ApiWatcher>).collect()
}

#[tokio::test]
async fn shared_watch_is_started_once_and_both_consumers_read_it() {
    let client = Arc::new(MockClient::new());
    client.pods.set_items(vec![pod("web-1", "10.0.0.5")], "5");
    let first = Consumer::new("first", vec![("pod", informers::pods as Factory)]);
    let second = Consumer::new("second", vec![("pod", informers::pods as Factory)]);

    let control = start(client.clone() as Arc<dyn ClusterClient>, as_consumers(&[&first, &second]), opts())
        .await
        .expect("start");
    assert!(control.has_synced());
    assert_eq!(control.watch_names(), vec!["pod"]);
    assert_eq!(client.pods.list_calls(), 1);
    assert_eq!(client.requested(kindex_core::ResourceKind::Pod).len(), 1);

    let a = first.lister("pod").expect("first lister").into_pods("pod").expect("pods");
    let b = second.lister("pod").expect("second lister").into_pods("pod").expect("pods");
    assert!(a.same_store(&b));
    let hits_a: Vec<String> = a.by_index(index::POD_IP, "10.0.0.5").iter().map(|p| p.name.clone()).collect();
    let hits_b: Vec<String> = b.by_index(index::POD_IP, "10.0.0.5").iter().map(|p| p.name.clone()).collect();
    assert_eq!(hits_a, vec!["web-1".to_string()]);
    assert_eq!(hits_a, hits_b);

    control.stop().expect("first stop");
    control.join().await;
}

#[tokio::test]
async fn every_consumer_sees_every_watch_but_gates_only_on_its_own() {
    let client = Arc::new(MockClient::new());
    client.services.hold_lists(true);
    let pods_only = Consumer::new("pods", vec![("pod", informers::pods as Factory)]);
    let services = Consumer::new("services", vec![("service", informers::services as Factory)]);
    let reader = Consumer::new("reader", Vec::new());

    let control = ApiControl::build(
        client.clone() as Arc<dyn ClusterClient>,
        as_consumers(&[&pods_only, &services, &reader]),
        &opts(),
    );
    control.run().expect("run");
    assert!(!control.wait_for_sync(Duration::from_millis(300)).await);

    assert!(pods_only.has_synced());
    assert!(!services.has_synced());
    assert!(reader.has_synced(), "a consumer without watches has nothing to wait for");
    assert!(!control.has_synced());

    for c in [&pods_only, &services, &reader] {
        assert!(c.lister("pod").is_some());
        assert!(c.lister("service").is_some());
        assert!(c.clock.lock().expect("lock").is_some());
    }
    let svc = reader.lister("service").expect("service").into_services("service").expect("typed");
    assert!(svc.get("ns1/anything").is_none());

    control.stop().expect("stop");
    tokio::time::timeout(Duration::from_secs(1), control.join()).await.expect("controllers exit promptly");
}

#[tokio::test]
async fn second_run_spawns_nothing() {
    let client = Arc::new(MockClient::new());
    let consumer = Consumer::new("pods", vec![("pod", informers::pods as Factory)]);
    let control = start(client.clone() as Arc<dyn ClusterClient>, as_consumers(&[&consumer]), opts()).await.expect("start");
    assert_eq!(client.pods.list_calls(), 1);

    assert!(matches!(control.run(), Err(ApiError::AlreadyRunning)));
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(client.pods.list_calls(), 1);

    control.stop().expect("stop");
    control.join().await;
}

#[tokio::test]
async fn second_stop_reports_shutdown_in_progress() {
    let client = Arc::new(MockClient::new());
    let consumer = Consumer::new("pods", vec![("pod", informers::pods as Factory)]);
    let control = start(client as Arc<dyn ClusterClient>, as_consumers(&[&consumer]), opts()).await.expect("start");

    assert!(control.stop().is_ok());
    assert!(matches!(control.stop(), Err(ApiError::ShutdownInProgress)));
    control.join().await;
    assert!(matches!(control.stop(), Err(ApiError::ShutdownInProgress)));
}

#[tokio::test]
async fn clock_is_shared_and_advanced_by_significant_changes() {
    let client = Arc::new(MockClient::new());
    let consumer = Consumer::new("svc", vec![("service", informers::services as Factory)]);
    let control = start(client.clone() as Arc<dyn ClusterClient>, as_consumers(&[&consumer]), opts())
        .await
        .expect("start");
    assert_eq!(control.modified(), 0);

    client.services.send(kindex_core::WatchEvent::Added(Service {
        name: "svc-a".into(),
        namespace: "ns1".into(),
        resource_version: "2".into(),
        cluster_ips: vec!["10.0.0.1".into()],
        ..Default::default()
    }));
    for _ in 0..100 {
        if control.modified() > 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let seen = consumer.clock.lock().expect("lock").clone().expect("clock");
    assert!(control.modified() > 0);
    assert_eq!(seen.modified(), control.modified());

    control.stop().expect("stop");
    control.join().await;
}

#[tokio::test]
async fn rejected_lister_fails_the_run() {
    let client = Arc::new(MockClient::new());
    let owner = Consumer::new("owner", vec![("pod", informers::pods as Factory)]);
    let picky = Arc::new(Consumer {
        name: "picky",
        wants: Vec::new(),
        listers: Mutex::new(HashMap::new()),
        synced: Mutex::new(None),
        clock: Mutex::new(None),
        strict_pods: true,
    });
    let control = ApiControl::build(client as Arc<dyn ClusterClient>, as_consumers(&[&owner, &picky]), &opts());
    match control.run() {
        Err(ApiError::UnexpectedLister { name, .. }) => assert_eq!(name, "pod"),
        other => panic!("expected UnexpectedLister, got {:?}", other),
    }
    control.join().await;
}
