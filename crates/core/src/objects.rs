//! Canonical projections of the upstream objects.
//!
//! Only the fields lookups need survive the conversion; everything else the
//! API server sends (status conditions, managed fields, specs we never read)
//! is dropped at the edge so the store stays small.

use k8s_openapi::api::core::v1 as corev1;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::{CacheObject, ObjectRef, ResourceKind};

/// Annotation set by the endpoints controller with the time of the change
/// that triggered the last endpoints update.
pub const LAST_CHANGE_TRIGGER_TIME: &str = "endpoints.kubernetes.io/last-change-trigger-time";

/// Cluster IP value marking a headless service.
pub const CLUSTER_IP_NONE: &str = "None";

const DEFAULT_PROTOCOL: &str = "TCP";

struct Meta {
    name: String,
    namespace: String,
    resource_version: String,
}

fn take_meta(meta: &mut ObjectMeta) -> Meta {
    Meta {
        name: meta.name.take().unwrap_or_default(),
        namespace: meta.namespace.take().unwrap_or_default(),
        resource_version: meta.resource_version.take().unwrap_or_default(),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ServicePort {
    pub name: String,
    pub port: i32,
    pub protocol: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct Service {
    pub name: String,
    pub namespace: String,
    pub resource_version: String,
    /// Primary cluster IP first; `"None"` for headless services.
    pub cluster_ips: Vec<String>,
    pub external_ips: Vec<String>,
    pub service_type: String,
    pub external_name: String,
    pub ports: Vec<ServicePort>,
}

impl Service {
    pub fn cluster_ip(&self) -> &str {
        self.cluster_ips.first().map(String::as_str).unwrap_or("")
    }

    pub fn headless(&self) -> bool {
        self.cluster_ip() == CLUSTER_IP_NONE
    }

    pub fn is_external_name(&self) -> bool {
        self.service_type == "ExternalName"
    }
}

impl CacheObject for Service {
    const KIND: ResourceKind = ResourceKind::Service;

    fn name(&self) -> &str { &self.name }
    fn namespace(&self) -> &str { &self.namespace }
    fn resource_version(&self) -> &str { &self.resource_version }
    fn view(&self) -> ObjectRef<'_> { ObjectRef::Service(self) }
}

impl From<corev1::Service> for Service {
    fn from(mut svc: corev1::Service) -> Self {
        let meta = take_meta(&mut svc.metadata);
        let spec = svc.spec.unwrap_or_default();
        let mut cluster_ips = spec.cluster_ips.unwrap_or_default();
        if cluster_ips.is_empty() {
            if let Some(ip) = spec.cluster_ip {
                cluster_ips.push(ip);
            }
        }
        let ports = spec
            .ports
            .unwrap_or_default()
            .into_iter()
            .map(|p| ServicePort {
                name: p.name.unwrap_or_default(),
                port: p.port,
                protocol: p.protocol.unwrap_or_else(|| DEFAULT_PROTOCOL.to_string()),
            })
            .collect();
        Service {
            name: meta.name,
            namespace: meta.namespace,
            resource_version: meta.resource_version,
            cluster_ips,
            external_ips: spec.external_ips.unwrap_or_default(),
            service_type: spec.type_.unwrap_or_else(|| "ClusterIP".to_string()),
            external_name: spec.external_name.unwrap_or_default(),
            ports,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct Pod {
    pub name: String,
    pub namespace: String,
    pub resource_version: String,
    pub pod_ip: String,
    /// A deletion timestamp is set; the pod is terminating.
    pub deleting: bool,
}

impl CacheObject for Pod {
    const KIND: ResourceKind = ResourceKind::Pod;

    fn name(&self) -> &str { &self.name }
    fn namespace(&self) -> &str { &self.namespace }
    fn resource_version(&self) -> &str { &self.resource_version }
    fn view(&self) -> ObjectRef<'_> { ObjectRef::Pod(self) }
}

impl From<corev1::Pod> for Pod {
    fn from(mut pod: corev1::Pod) -> Self {
        let deleting = pod.metadata.deletion_timestamp.is_some();
        let meta = take_meta(&mut pod.metadata);
        Pod {
            name: meta.name,
            namespace: meta.namespace,
            resource_version: meta.resource_version,
            pod_ip: pod.status.and_then(|s| s.pod_ip).unwrap_or_default(),
            deleting,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct EndpointAddress {
    pub ip: String,
    pub hostname: String,
    pub node_name: String,
    /// Name of the pod behind the address, when the target is a pod.
    pub target_pod: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct EndpointPort {
    pub name: String,
    pub port: i32,
    pub protocol: String,
}

/// Address and port lists arrive sorted from the API server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct EndpointSubset {
    pub addresses: Vec<EndpointAddress>,
    pub ports: Vec<EndpointPort>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct Endpoints {
    pub name: String,
    pub namespace: String,
    pub resource_version: String,
    pub subsets: Vec<EndpointSubset>,
    /// Every ready address across all subsets, in subset order.
    pub ips: Vec<String>,
    /// Unix millis parsed from the last-change-trigger-time annotation.
    pub last_change_trigger_ms: Option<i64>,
}

impl CacheObject for Endpoints {
    const KIND: ResourceKind = ResourceKind::Endpoints;

    fn name(&self) -> &str { &self.name }
    fn namespace(&self) -> &str { &self.namespace }
    fn resource_version(&self) -> &str { &self.resource_version }
    fn view(&self) -> ObjectRef<'_> { ObjectRef::Endpoints(self) }
}

impl From<corev1::Endpoints> for Endpoints {
    fn from(mut ep: corev1::Endpoints) -> Self {
        let last_change_trigger_ms = ep
            .metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(LAST_CHANGE_TRIGGER_TIME))
            .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.timestamp_millis());
        let meta = take_meta(&mut ep.metadata);
        let subsets: Vec<EndpointSubset> = ep
            .subsets
            .unwrap_or_default()
            .into_iter()
            .map(|s| EndpointSubset {
                addresses: s
                    .addresses
                    .unwrap_or_default()
                    .into_iter()
                    .map(|a| EndpointAddress {
                        ip: a.ip,
                        hostname: a.hostname.unwrap_or_default(),
                        node_name: a.node_name.unwrap_or_default(),
                        target_pod: a
                            .target_ref
                            .filter(|r| r.kind.as_deref() == Some("Pod"))
                            .and_then(|r| r.name)
                            .unwrap_or_default(),
                    })
                    .collect(),
                ports: s
                    .ports
                    .unwrap_or_default()
                    .into_iter()
                    .map(|p| EndpointPort {
                        name: p.name.unwrap_or_default(),
                        port: p.port,
                        protocol: p.protocol.unwrap_or_else(|| DEFAULT_PROTOCOL.to_string()),
                    })
                    .collect(),
            })
            .collect();
        let ips = subsets
            .iter()
            .flat_map(|s| s.addresses.iter().map(|a| a.ip.clone()))
            .collect();
        Endpoints {
            name: meta.name,
            namespace: meta.namespace,
            resource_version: meta.resource_version,
            subsets,
            ips,
            last_change_trigger_ms,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct Namespace {
    pub name: String,
    pub resource_version: String,
    pub labels: SmallVec<[(String, String); 8]>,
}

impl CacheObject for Namespace {
    const KIND: ResourceKind = ResourceKind::Namespace;

    fn name(&self) -> &str { &self.name }
    fn namespace(&self) -> &str { "" }
    fn resource_version(&self) -> &str { &self.resource_version }
    fn view(&self) -> ObjectRef<'_> { ObjectRef::Namespace(self) }
}

impl From<corev1::Namespace> for Namespace {
    fn from(mut ns: corev1::Namespace) -> Self {
        let labels = ns.metadata.labels.take().unwrap_or_default().into_iter().collect();
        let meta = take_meta(&mut ns.metadata);
        Namespace { name: meta.name, resource_version: meta.resource_version, labels }
    }
}
