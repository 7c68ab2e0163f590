//! kindex kubehub – list/watch sources and the per-kind watch controller.

#![forbid(unsafe_code)]

use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use kindex_core::{Endpoints, ListSnapshot, Namespace, Pod, ResourceKind, Service, WatchEvent};
use k8s_openapi::NamespaceResourceScope;
use kube::{
    api::{Api, ListParams, WatchParams},
    Client,
};
use serde::de::DeserializeOwned;
use tracing::debug;

pub mod client;
pub mod controller;
pub mod mock;

pub use client::{connect, ClientSettings, KubeconfigRef, TlsFiles};
pub use controller::{ChangeObserver, Controller, WatchController, DEFAULT_RELIST_PAUSE};

/// Field selector keeping terminal pods out of the pod store.
pub const POD_PHASE_FILTER: &str = "status.phase!=Succeeded,status.phase!=Failed,status.phase!=Unknown";

/// Server-side watch timeout; the stream ends cleanly after it and is re-established.
const WATCH_TIMEOUT_SECS: u32 = 290;

#[derive(Debug, thiserror::Error)]
pub enum WatchError {
    #[error("kube api: {0}")]
    Api(#[from] kube::Error),
    #[error("watch error event ({code}): {message}")]
    Event { code: u16, message: String },
    #[error("{0}")]
    Other(String),
}

pub type WatchStream<T> = BoxStream<'static, Result<WatchEvent<T>, WatchError>>;

/// The list-then-watch primitive for one resource kind.
#[async_trait]
pub trait ListWatch<T>: Send + Sync {
    /// Full snapshot plus the resource version to resume from.
    async fn list(&self) -> Result<ListSnapshot<T>, WatchError>;
    /// Changes after `resource_version`.
    async fn watch(&self, resource_version: &str) -> Result<WatchStream<T>, WatchError>;
}

/// Scope of a list/watch: namespace, label and field selectors.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListOptions {
    pub namespace: Option<String>,
    pub label_selector: Option<String>,
    pub field_selector: Option<String>,
}

impl ListOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn labels(mut self, selector: Option<&str>) -> Self {
        self.label_selector = selector.filter(|s| !s.is_empty()).map(str::to_string);
        self
    }

    pub fn namespace(mut self, ns: Option<&str>) -> Self {
        self.namespace = ns.filter(|s| !s.is_empty()).map(str::to_string);
        self
    }

    pub fn fields(mut self, selector: &str) -> Self {
        self.field_selector = match self.field_selector.take() {
            Some(existing) if !existing.is_empty() => Some(format!("{},{}", existing, selector)),
            _ => Some(selector.to_string()),
        };
        self
    }

    /// Apply the per-kind rules: pods skip terminal phases, namespaces are cluster scoped.
    pub fn for_kind(self, kind: ResourceKind) -> Self {
        match kind {
            ResourceKind::Pod => self.fields(POD_PHASE_FILTER),
            ResourceKind::Namespace => Self { namespace: None, ..self },
            ResourceKind::Service | ResourceKind::Endpoints => self,
        }
    }

    fn list_params(&self) -> ListParams {
        let mut lp = ListParams::default();
        if let Some(l) = &self.label_selector {
            lp = lp.labels(l);
        }
        if let Some(f) = &self.field_selector {
            lp = lp.fields(f);
        }
        lp
    }

    fn watch_params(&self) -> WatchParams {
        let mut wp = WatchParams::default().timeout(WATCH_TIMEOUT_SECS);
        if let Some(l) = &self.label_selector {
            wp = wp.labels(l);
        }
        if let Some(f) = &self.field_selector {
            wp = wp.fields(f);
        }
        wp
    }
}

/// Client handle handed to watch factories: one list/watch source per kind.
pub trait ClusterClient: Send + Sync {
    fn services(&self, opts: ListOptions) -> Arc<dyn ListWatch<Service>>;
    fn pods(&self, opts: ListOptions) -> Arc<dyn ListWatch<Pod>>;
    fn endpoints(&self, opts: ListOptions) -> Arc<dyn ListWatch<Endpoints>>;
    fn namespaces(&self, opts: ListOptions) -> Arc<dyn ListWatch<Namespace>>;
}

/// kube-rs backed [`ClusterClient`].
#[derive(Clone)]
pub struct KubeClient {
    client: Client,
}

impl KubeClient {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn namespaced<K>(&self, kind: ResourceKind, opts: ListOptions) -> Arc<KubeListWatch<K>>
    where
        K: kube::Resource<Scope = NamespaceResourceScope>,
        <K as kube::Resource>::DynamicType: Default,
    {
        let opts = opts.for_kind(kind);
        let api = match opts.namespace.as_deref() {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        };
        Arc::new(KubeListWatch { api, opts, kind })
    }
}

impl ClusterClient for KubeClient {
    fn services(&self, opts: ListOptions) -> Arc<dyn ListWatch<Service>> {
        self.namespaced::<k8s_openapi::api::core::v1::Service>(ResourceKind::Service, opts)
    }

    fn pods(&self, opts: ListOptions) -> Arc<dyn ListWatch<Pod>> {
        self.namespaced::<k8s_openapi::api::core::v1::Pod>(ResourceKind::Pod, opts)
    }

    fn endpoints(&self, opts: ListOptions) -> Arc<dyn ListWatch<Endpoints>> {
        self.namespaced::<k8s_openapi::api::core::v1::Endpoints>(ResourceKind::Endpoints, opts)
    }

    fn namespaces(&self, opts: ListOptions) -> Arc<dyn ListWatch<Namespace>> {
        let opts = opts.for_kind(ResourceKind::Namespace);
        Arc::new(KubeListWatch {
            api: Api::<k8s_openapi::api::core::v1::Namespace>::all(self.client.clone()),
            opts,
            kind: ResourceKind::Namespace,
        })
    }
}

/// List/watch over one typed kube API, projecting every object on arrival.
pub struct KubeListWatch<K> {
    api: Api<K>,
    opts: ListOptions,
    kind: ResourceKind,
}

#[async_trait]
impl<K, T> ListWatch<T> for KubeListWatch<K>
where
    K: kube::Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
    T: From<K> + Send + 'static,
{
    async fn list(&self) -> Result<ListSnapshot<T>, WatchError> {
        let list = self.api.list(&self.opts.list_params()).await?;
        let resource_version = list.metadata.resource_version.unwrap_or_default();
        debug!(kind = %self.kind, count = list.items.len(), rv = %resource_version, "list returned");
        Ok(ListSnapshot { items: list.items.into_iter().map(T::from).collect(), resource_version })
    }

    async fn watch(&self, resource_version: &str) -> Result<WatchStream<T>, WatchError> {
        use kube::api::WatchEvent as KubeEvent;

        let stream = self.api.watch(&self.opts.watch_params(), resource_version).await?;
        let stream = stream.map(|ev| match ev {
            Ok(KubeEvent::Added(o)) => Ok(WatchEvent::Added(T::from(o))),
            Ok(KubeEvent::Modified(o)) => Ok(WatchEvent::Modified(T::from(o))),
            Ok(KubeEvent::Deleted(o)) => Ok(WatchEvent::Deleted(T::from(o))),
            Ok(KubeEvent::Bookmark(b)) => Ok(WatchEvent::Bookmark(b.metadata.resource_version)),
            Ok(KubeEvent::Error(e)) => Err(WatchError::Event { code: e.code, message: e.message }),
            Err(e) => Err(WatchError::Api(e)),
        });
        Ok(stream.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pods_always_exclude_terminal_phases() {
        let opts = ListOptions::new().labels(Some("app=web")).for_kind(ResourceKind::Pod);
        assert_eq!(opts.label_selector.as_deref(), Some("app=web"));
        assert_eq!(opts.field_selector.as_deref(), Some(POD_PHASE_FILTER));
    }

    #[test]
    fn pod_phase_filter_is_appended_to_existing_fields() {
        let opts = ListOptions::new().fields("spec.nodeName=n1").for_kind(ResourceKind::Pod);
        assert_eq!(
            opts.field_selector.as_deref(),
            Some("spec.nodeName=n1,status.phase!=Succeeded,status.phase!=Failed,status.phase!=Unknown")
        );
    }

    #[test]
    fn namespaces_are_never_namespace_scoped() {
        let opts = ListOptions::new().namespace(Some("prod")).for_kind(ResourceKind::Namespace);
        assert_eq!(opts.namespace, None);
        let svc = ListOptions::new().namespace(Some("prod")).for_kind(ResourceKind::Service);
        assert_eq!(svc.namespace.as_deref(), Some("prod"));
        assert_eq!(svc.field_selector, None);
    }

    #[test]
    fn empty_selectors_are_dropped() {
        let opts = ListOptions::new().labels(Some("")).namespace(Some(""));
        assert_eq!(opts, ListOptions::default());
    }
}
