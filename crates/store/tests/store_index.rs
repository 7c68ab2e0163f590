#![forbid(unsafe_code)]

use std::sync::Arc;

use kindex_core::{index, CacheObject, IndexName, Pod, Service};
use kindex_store::{indexers, IndexFn, IndexKeys, Lister, Store, StoreError};
use smallvec::smallvec;

fn pod(ns: &str, name: &str, ip: &str, rv: &str) -> Pod {
    Pod { name: name.into(), namespace: ns.into(), resource_version: rv.into(), pod_ip: ip.into(), deleting: false }
}

fn svc(ns: &str, name: &str, cluster_ip: &str, external: &[&str], rv: &str) -> Service {
    Service {
        name: name.into(),
        namespace: ns.into(),
        resource_version: rv.into(),
        cluster_ips: vec![cluster_ip.into()],
        external_ips: external.iter().map(|s| s.to_string()).collect(),
        service_type: "ClusterIP".into(),
        ..Default::default()
    }
}

fn pod_store() -> Store<Pod> {
    Store::with_indexers(indexers::pod_indexers()).expect("indexers")
}

fn svc_store() -> Store<Service> {
    Store::with_indexers(indexers::service_indexers()).expect("indexers")
}

#[test]
fn pod_ip_index_finds_listed_pod() {
    let store = pod_store();
    store.upsert(pod("ns1", "web-1", "10.0.0.5", "1"));
    store.upsert(pod("ns1", "web-2", "10.0.0.6", "1"));

    let hits = store.by_index(index::POD_IP, "10.0.0.5");
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].key(), "ns1/web-1");
}

#[test]
fn external_ip_added_by_update_becomes_indexed() {
    let store = svc_store();
    store.upsert(svc("ns1", "svc-a", "10.0.0.1", &[], "1"));
    assert_eq!(store.index_keys(index::SVC_IP), vec!["10.0.0.1".to_string()]);
    assert!(store.by_index(index::SVC_IP, "1.2.3.4").is_empty());

    let prev = store.upsert(svc("ns1", "svc-a", "10.0.0.1", &["1.2.3.4"], "2"));
    assert_eq!(prev.map(|p| p.resource_version.clone()).as_deref(), Some("1"));
    let hits = store.by_index(index::SVC_IP, "1.2.3.4");
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].key(), "ns1/svc-a");
    assert_eq!(store.by_index(index::SVC_IP, "10.0.0.1").len(), 1);
    assert_eq!(store.len(), 1);
}

#[test]
fn upsert_then_get_reads_own_write() {
    let store = pod_store();
    store.upsert(pod("ns1", "web-1", "10.0.0.5", "1"));
    store.upsert(pod("ns1", "web-1", "10.0.0.7", "2"));
    let got = store.get("ns1/web-1").expect("present");
    assert_eq!(got.pod_ip, "10.0.0.7");
    assert_eq!(got.resource_version, "2");
    // Old IP no longer points at the pod.
    assert!(store.by_index(index::POD_IP, "10.0.0.5").is_empty());
}

#[test]
fn delete_removes_object_from_every_index() {
    let store = svc_store();
    store.upsert(svc("ns1", "svc-a", "10.0.0.1", &["1.2.3.4", "5.6.7.8"], "1"));
    store.upsert(svc("ns1", "svc-b", "10.0.0.2", &["1.2.3.4"], "1"));

    let removed = store.delete("ns1/svc-a").expect("was present");
    assert_eq!(removed.name, "svc-a");
    assert!(store.get("ns1/svc-a").is_none());
    assert!(store.by_index(index::SVC_IP, "10.0.0.1").is_empty());
    assert!(store.by_index(index::SVC_IP, "5.6.7.8").is_empty());
    assert!(store.by_index(index::SVC_NAME_NAMESPACE, "ns1/svc-a").is_empty());
    let shared = store.by_index(index::SVC_IP, "1.2.3.4");
    assert_eq!(shared.len(), 1);
    assert_eq!(shared[0].name, "svc-b");

    let mut keys = store.index_keys(index::SVC_IP);
    keys.sort();
    assert_eq!(keys, vec!["1.2.3.4".to_string(), "10.0.0.2".to_string()]);
    assert!(store.delete("ns1/svc-a").is_none());
}

#[test]
fn unknown_index_or_key_reads_empty() {
    let store = pod_store();
    store.upsert(pod("ns1", "web-1", "10.0.0.5", "1"));
    assert!(store.by_index(IndexName::new("NoSuchIndex"), "10.0.0.5").is_empty());
    assert!(store.by_index(index::POD_IP, "192.168.0.1").is_empty());
}

#[test]
fn retain_drops_unlisted_keys_and_their_postings() {
    let store = pod_store();
    store.upsert(pod("ns1", "a", "10.0.0.1", "1"));
    store.upsert(pod("ns1", "b", "10.0.0.2", "1"));
    store.upsert(pod("ns2", "c", "10.0.0.3", "1"));

    let removed = store.retain(|k| k != "ns1/b");
    assert_eq!(removed.len(), 1);
    assert_eq!(removed[0].name, "b");
    assert!(store.by_index(index::POD_IP, "10.0.0.2").is_empty());
    assert_eq!(store.len(), 2);
}

#[test]
fn custom_indexer_is_backfilled_and_conflicts_are_rejected() {
    let store = Arc::new(pod_store());
    store.upsert(pod("ns1", "a", "10.0.0.1", "1"));
    store.upsert(pod("ns2", "b", "10.0.0.2", "1"));
    let lister = Lister::new(Arc::clone(&store));

    let by_ns: IndexFn<Pod> = Arc::new(|p: &Pod| -> IndexKeys { smallvec![p.namespace.clone()] });
    const BY_NAMESPACE: IndexName = IndexName::new("ByNamespace");
    lister.add_indexer(BY_NAMESPACE, by_ns.clone()).expect("first registration");
    assert_eq!(lister.by_index(BY_NAMESPACE, "ns2").len(), 1);

    store.upsert(pod("ns2", "c", "10.0.0.3", "1"));
    assert_eq!(lister.by_index(BY_NAMESPACE, "ns2").len(), 2);

    assert_eq!(lister.add_indexer(BY_NAMESPACE, by_ns), Err(StoreError::IndexConflict(BY_NAMESPACE)));
    assert_eq!(
        lister.add_indexer(index::POD_IP, Arc::new(indexers::pod_ip)),
        Err(StoreError::IndexConflict(index::POD_IP))
    );
}

#[test]
fn concurrent_readers_never_see_dangling_index_entries() {
    let store = Arc::new(pod_store());
    let writer = {
        let store = Arc::clone(&store);
        std::thread::spawn(move || {
            for i in 0..2000u32 {
                let name = format!("p{}", i % 16);
                store.upsert(pod("ns", &name, &format!("10.0.{}.{}", i % 4, i % 16), &i.to_string()));
                if i % 3 == 0 {
                    store.delete(&format!("ns/{}", name));
                }
            }
        })
    };
    let readers: Vec<_> = (0..4)
        .map(|_| {
            let store = Arc::clone(&store);
            std::thread::spawn(move || {
                for i in 0..2000u32 {
                    let ip = format!("10.0.{}.{}", i % 4, i % 16);
                    for p in store.by_index(index::POD_IP, &ip) {
                        assert_eq!(p.pod_ip, ip);
                    }
                }
            })
        })
        .collect();
    writer.join().expect("writer");
    for r in readers {
        r.join().expect("reader");
    }
    for key in store.index_keys(index::POD_IP) {
        for p in store.by_index(index::POD_IP, &key) {
            assert!(store.get(&p.key()).is_some());
        }
    }
}
