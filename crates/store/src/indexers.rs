//! Standard index functions for the index catalogue in [`kindex_core::index`].

use std::sync::Arc;

use kindex_core::{index, object_key, CacheObject, Endpoints, IndexName, Pod, Service};
use smallvec::smallvec;

use crate::{IndexFn, IndexKeys};

fn non_empty<'a>(keys: impl IntoIterator<Item = &'a String>) -> IndexKeys {
    keys.into_iter().filter(|k| !k.is_empty()).cloned().collect()
}

pub fn pod_ip(pod: &Pod) -> IndexKeys {
    non_empty([&pod.pod_ip])
}

pub fn service_name_namespace(svc: &Service) -> IndexKeys {
    smallvec![svc.key()]
}

/// Cluster IP(s) followed by external IPs. Headless services contribute none.
pub fn service_ip(svc: &Service) -> IndexKeys {
    let cluster = svc.cluster_ips.iter().filter(|ip| ip.as_str() != kindex_core::objects::CLUSTER_IP_NONE);
    non_empty(cluster.chain(svc.external_ips.iter()))
}

pub fn endpoints_name_namespace(ep: &Endpoints) -> IndexKeys {
    smallvec![object_key(&ep.namespace, &ep.name)]
}

pub fn endpoints_ip(ep: &Endpoints) -> IndexKeys {
    non_empty(ep.ips.iter())
}

pub fn pod_indexers() -> Vec<(IndexName, IndexFn<Pod>)> {
    vec![(index::POD_IP, Arc::new(pod_ip) as IndexFn<Pod>)]
}

pub fn service_indexers() -> Vec<(IndexName, IndexFn<Service>)> {
    vec![
        (index::SVC_NAME_NAMESPACE, Arc::new(service_name_namespace) as IndexFn<Service>),
        (index::SVC_IP, Arc::new(service_ip) as IndexFn<Service>),
    ]
}

pub fn endpoints_indexers() -> Vec<(IndexName, IndexFn<Endpoints>)> {
    vec![
        (index::EP_NAME_NAMESPACE, Arc::new(endpoints_name_namespace) as IndexFn<Endpoints>),
        (index::EP_IP, Arc::new(endpoints_ip) as IndexFn<Endpoints>),
    ]
}
