//! kindex core types: resource kinds, canonical objects and the shapes
//! exchanged between the list/watch source, the store and the consumers.

#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};

pub mod objects;

pub use objects::{
    Endpoints, EndpointAddress, EndpointPort, EndpointSubset, Namespace, Pod, Service, ServicePort,
};

/// The resource kinds kept in the local view.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Service,
    Pod,
    Endpoints,
    Namespace,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 4] = [
        ResourceKind::Service,
        ResourceKind::Pod,
        ResourceKind::Endpoints,
        ResourceKind::Namespace,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Service => "service",
            ResourceKind::Pod => "pod",
            ResourceKind::Endpoints => "endpoints",
            ResourceKind::Namespace => "namespace",
        }
    }

    /// Namespaces are cluster scoped; every other kind lives in a namespace.
    pub fn namespaced(&self) -> bool {
        !matches!(self, ResourceKind::Namespace)
    }
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown resource kind: {0} (expect service, pod, endpoints or namespace)")]
pub struct UnknownKind(pub String);

impl std::str::FromStr for ResourceKind {
    type Err = UnknownKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "service" | "services" | "svc" => Ok(ResourceKind::Service),
            "pod" | "pods" => Ok(ResourceKind::Pod),
            "endpoints" | "endpoint" | "ep" => Ok(ResourceKind::Endpoints),
            "namespace" | "namespaces" | "ns" => Ok(ResourceKind::Namespace),
            _ => Err(UnknownKind(s.to_string())),
        }
    }
}

/// Identity key of an object: `namespace/name`, or just `name` when cluster scoped.
pub fn object_key(namespace: &str, name: &str) -> String {
    if namespace.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", namespace, name)
    }
}

/// Borrowed view of a cached object, one variant per kind.
#[derive(Debug, Clone, Copy)]
pub enum ObjectRef<'a> {
    Service(&'a Service),
    Pod(&'a Pod),
    Endpoints(&'a Endpoints),
    Namespace(&'a Namespace),
}

impl<'a> ObjectRef<'a> {
    pub fn kind(&self) -> ResourceKind {
        match self {
            ObjectRef::Service(_) => ResourceKind::Service,
            ObjectRef::Pod(_) => ResourceKind::Pod,
            ObjectRef::Endpoints(_) => ResourceKind::Endpoints,
            ObjectRef::Namespace(_) => ResourceKind::Namespace,
        }
    }

    pub fn endpoints(self) -> Option<&'a Endpoints> {
        match self {
            ObjectRef::Endpoints(ep) => Some(ep),
            _ => None,
        }
    }
}

/// A trimmed, kind-specific projection held by the store.
pub trait CacheObject: std::fmt::Debug + Send + Sync + 'static {
    const KIND: ResourceKind;

    fn name(&self) -> &str;
    /// Empty for cluster-scoped kinds.
    fn namespace(&self) -> &str;
    /// Opaque version token assigned by the cluster.
    fn resource_version(&self) -> &str;
    fn view(&self) -> ObjectRef<'_>;

    fn key(&self) -> String {
        object_key(self.namespace(), self.name())
    }
}

/// Full snapshot returned by a list call plus the cursor to resume watching from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListSnapshot<T> {
    pub items: Vec<T>,
    pub resource_version: String,
}

/// Incremental change delivered by a watch stream.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum WatchEvent<T> {
    Added(T),
    Modified(T),
    Deleted(T),
    /// Cursor-only progress marker.
    Bookmark(String),
}

impl<T> WatchEvent<T> {
    pub fn label(&self) -> &'static str {
        match self {
            WatchEvent::Added(_) => "added",
            WatchEvent::Modified(_) => "modified",
            WatchEvent::Deleted(_) => "deleted",
            WatchEvent::Bookmark(_) => "bookmark",
        }
    }
}

/// Name of a secondary index. Shared between the store that maintains an
/// index and every consumer that reads it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct IndexName(&'static str);

impl IndexName {
    pub const fn new(name: &'static str) -> Self {
        Self(name)
    }

    pub fn as_str(&self) -> &'static str {
        self.0
    }
}

impl std::fmt::Display for IndexName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.0)
    }
}

/// Standard index catalogue.
pub mod index {
    use super::IndexName;

    pub const POD_IP: IndexName = IndexName::new("PodIP");
    pub const SVC_NAME_NAMESPACE: IndexName = IndexName::new("NameNamespace");
    pub const SVC_IP: IndexName = IndexName::new("ServiceIP");
    pub const EP_NAME_NAMESPACE: IndexName = IndexName::new("EndpointNameNamespace");
    pub const EP_IP: IndexName = IndexName::new("EndpointsIP");
}

pub mod prelude {
    pub use super::{
        index, object_key, CacheObject, Endpoints, IndexName, ListSnapshot, Namespace, ObjectRef, Pod,
        ResourceKind, Service, WatchEvent,
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_key_joins_namespace_and_name() {
        assert_eq!(object_key("ns1", "web-1"), "ns1/web-1");
        assert_eq!(object_key("", "kube-system"), "kube-system");
    }

    #[test]
    fn resource_kind_parses_aliases() {
        assert_eq!("svc".parse::<ResourceKind>().unwrap(), ResourceKind::Service);
        assert_eq!("Pods".parse::<ResourceKind>().unwrap(), ResourceKind::Pod);
        assert_eq!("ep".parse::<ResourceKind>().unwrap(), ResourceKind::Endpoints);
        assert!("configmap".parse::<ResourceKind>().is_err());
    }

    #[test]
    fn only_namespace_is_cluster_scoped() {
        let scoped: Vec<_> = ResourceKind::ALL.iter().filter(|k| !k.namespaced()).collect();
        assert_eq!(scoped, vec![&ResourceKind::Namespace]);
    }
}
