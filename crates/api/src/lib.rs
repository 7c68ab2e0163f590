//! kindex public API: how consumers declare watches and receive shared read handles.
//!
//! Consumers implement [`ApiWatcher`]. [`ApiControl`] merges their watch
//! requests (first registration of a watch name wins), runs one controller per
//! merged watch and hands every consumer the shared [`AnyLister`] handles plus
//! a sync gate over the watches it asked for.

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use kindex_core::{CacheObject, Endpoints, Namespace, Pod, ResourceKind, Service};
use kindex_kubehub::{ClientSettings, ClusterClient, Controller, KubeClient, WatchController};
use kindex_store::{ChangeEvaluator, Lister, ModifiedClock};

pub mod informers;
mod registry;

pub use registry::{start, ApiControl, ControlOptions};

/// Watch names shared between consumers.
pub mod watch {
    pub const SERVICE: &str = "service";
    pub const POD: &str = "pod";
    pub const ENDPOINTS: &str = "endpoints";
    pub const NAMESPACE: &str = "namespace";
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("shutdown already in progress")]
    ShutdownInProgress,
    #[error("watch controllers already running")]
    AlreadyRunning,
    #[error("watch {name:?}: expected a {expected} lister, got {got}")]
    UnexpectedLister { name: String, expected: ResourceKind, got: ResourceKind },
    #[error("client: {0}")]
    Client(String),
}

pub type ApiResult<T> = Result<T, ApiError>;

// ----------------- Shared handles -----------------

/// A [`Lister`] for any of the watched kinds. Replaces runtime downcasts of
/// untyped store handles with an explicit lookup by variant.
#[derive(Debug, Clone)]
pub enum AnyLister {
    Service(Lister<Service>),
    Pod(Lister<Pod>),
    Endpoints(Lister<Endpoints>),
    Namespace(Lister<Namespace>),
}

macro_rules! lister_variant {
    ($variant:ident, $ty:ty, $into:ident) => {
        impl From<Lister<$ty>> for AnyLister {
            fn from(l: Lister<$ty>) -> Self {
                AnyLister::$variant(l)
            }
        }

        impl AnyLister {
            /// The typed lister, or [`ApiError::UnexpectedLister`] naming `watch`.
            pub fn $into(self, watch: &str) -> ApiResult<Lister<$ty>> {
                match self {
                    AnyLister::$variant(l) => Ok(l),
                    other => Err(ApiError::UnexpectedLister {
                        name: watch.to_string(),
                        expected: <$ty as CacheObject>::KIND,
                        got: other.kind(),
                    }),
                }
            }
        }
    };
}

lister_variant!(Service, Service, into_services);
lister_variant!(Pod, Pod, into_pods);
lister_variant!(Endpoints, Endpoints, into_endpoints);
lister_variant!(Namespace, Namespace, into_namespaces);

impl AnyLister {
    pub fn kind(&self) -> ResourceKind {
        match self {
            AnyLister::Service(_) => ResourceKind::Service,
            AnyLister::Pod(_) => ResourceKind::Pod,
            AnyLister::Endpoints(_) => ResourceKind::Endpoints,
            AnyLister::Namespace(_) => ResourceKind::Namespace,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            AnyLister::Service(l) => l.len(),
            AnyLister::Pod(l) => l.len(),
            AnyLister::Endpoints(l) => l.len(),
            AnyLister::Namespace(l) => l.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every cached object as JSON, sorted by identity key.
    pub fn to_json(&self) -> serde_json::Result<serde_json::Value> {
        fn dump<T: CacheObject + serde::Serialize>(l: &Lister<T>) -> serde_json::Result<serde_json::Value> {
            let mut items = l.list();
            items.sort_by_key(|o| o.key());
            let refs: Vec<&T> = items.iter().map(|o| o.as_ref()).collect();
            serde_json::to_value(refs)
        }
        match self {
            AnyLister::Service(l) => dump(l),
            AnyLister::Pod(l) => dump(l),
            AnyLister::Endpoints(l) => dump(l),
            AnyLister::Namespace(l) => dump(l),
        }
    }
}

// ----------------- Consumer registration -----------------

/// What a watch factory gets to build its controller.
#[derive(Clone)]
pub struct WatchContext {
    pub client: Arc<dyn ClusterClient>,
    /// Shared evaluator; advancing it advances the process-wide clock.
    pub evaluator: ChangeEvaluator,
    pub relist_pause: Duration,
}

/// A built watch: the controller to run and the read handle onto its store.
pub struct Informer {
    pub controller: Arc<dyn Controller>,
    pub lister: AnyLister,
}

impl Informer {
    pub fn new<T: CacheObject>(controller: WatchController<T>) -> Self
    where
        AnyLister: From<Lister<T>>,
    {
        let lister = AnyLister::from(controller.lister());
        Self { controller: Arc::new(controller), lister }
    }
}

pub type InformerFn = Box<dyn FnOnce(&WatchContext) -> Informer + Send>;
pub type HasSyncedFn = Arc<dyn Fn() -> bool + Send + Sync>;

/// A consumer of the shared watches.
pub trait ApiWatcher: Send + Sync {
    fn name(&self) -> &str;
    /// Watches this consumer needs, keyed by watch name. May be empty when the
    /// consumer only reads watches other consumers declare.
    fn informers(&self) -> Vec<(String, InformerFn)>;
    /// Called once for every watch that exists, declared by this consumer or not.
    fn set_lister(&self, watch: &str, lister: AnyLister) -> ApiResult<()>;
    /// Gate over the watches this consumer declared.
    fn set_has_synced(&self, synced: HasSyncedFn);
    fn set_modified(&self, _clock: ModifiedClock) {}
}

/// Builds the kube-backed client from transport settings.
pub async fn connect(settings: &ClientSettings) -> ApiResult<Arc<dyn ClusterClient>> {
    let client = kindex_kubehub::connect(settings).await.map_err(|e| ApiError::Client(format!("{:#}", e)))?;
    Ok(Arc::new(KubeClient::new(client)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use kindex_store::Store;

    #[test]
    fn typed_accessors_reject_other_kinds() {
        let pods = AnyLister::from(Lister::new(Arc::new(Store::<Pod>::new())));
        assert!(pods.clone().into_pods(watch::POD).is_ok());
        match pods.into_services(watch::SERVICE) {
            Err(ApiError::UnexpectedLister { name, expected, got }) => {
                assert_eq!(name, "service");
                assert_eq!(expected, ResourceKind::Service);
                assert_eq!(got, ResourceKind::Pod);
            }
            other => panic!("unexpected: {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn json_dump_is_sorted_by_key() {
        let store = Arc::new(Store::<Namespace>::new());
        for name in ["prod", "dev"] {
            store.upsert(Namespace { name: name.into(), resource_version: "1".into(), ..Default::default() });
        }
        let json = AnyLister::from(Lister::new(store)).to_json().expect("json");
        let names: Vec<_> = json.as_array().expect("array").iter().map(|v| v["name"].as_str().unwrap_or("")).collect();
        assert_eq!(names, vec!["dev", "prod"]);
    }
}
