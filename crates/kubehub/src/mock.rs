//! In-memory list/watch sources for tests and local runs.
//!
//! A [`MockListWatch`] serves a scripted snapshot and hands out watch streams
//! fed through [`MockListWatch::send`]. Streams share one feed, so events sent
//! after a relist reach the next watch.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use futures::StreamExt;
use kindex_core::{Endpoints, ListSnapshot, Namespace, Pod, ResourceKind, Service, WatchEvent};
use tokio::sync::mpsc;

use crate::{ClusterClient, ListOptions, ListWatch, WatchError, WatchStream};

enum Feed<T> {
    Event(Result<WatchEvent<T>, WatchError>),
    End,
}

struct Snapshot<T> {
    items: Vec<T>,
    resource_version: String,
    fail_lists: usize,
}

pub struct MockListWatch<T> {
    snapshot: Mutex<Snapshot<T>>,
    hold_lists: AtomicBool,
    list_calls: AtomicUsize,
    watch_cursors: Mutex<Vec<String>>,
    tx: mpsc::UnboundedSender<Feed<T>>,
    rx: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Feed<T>>>>,
}

impl<T> Default for MockListWatch<T> {
    fn default() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            snapshot: Mutex::new(Snapshot { items: Vec::new(), resource_version: "0".into(), fail_lists: 0 }),
            hold_lists: AtomicBool::new(false),
            list_calls: AtomicUsize::new(0),
            watch_cursors: Mutex::new(Vec::new()),
            tx,
            rx: Arc::new(tokio::sync::Mutex::new(rx)),
        }
    }
}

impl<T> MockListWatch<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_items(items: Vec<T>, resource_version: &str) -> Self {
        let mock = Self::default();
        mock.set_items(items, resource_version);
        mock
    }

    /// Replaces what the next list returns.
    pub fn set_items(&self, items: Vec<T>, resource_version: &str) {
        let mut snap = self.snapshot.lock().unwrap_or_else(PoisonError::into_inner);
        snap.items = items;
        snap.resource_version = resource_version.to_string();
    }

    /// The next `n` lists fail.
    pub fn fail_lists(&self, n: usize) {
        self.snapshot.lock().unwrap_or_else(PoisonError::into_inner).fail_lists = n;
    }

    /// While set, lists never return.
    pub fn hold_lists(&self, hold: bool) {
        self.hold_lists.store(hold, Ordering::SeqCst);
    }

    pub fn send(&self, event: WatchEvent<T>) {
        let _ = self.tx.send(Feed::Event(Ok(event)));
    }

    pub fn send_error(&self, err: WatchError) {
        let _ = self.tx.send(Feed::Event(Err(err)));
    }

    /// Ends the current watch stream cleanly, as a server-side timeout would.
    pub fn end_stream(&self) {
        let _ = self.tx.send(Feed::End);
    }

    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    /// Resource versions every watch was opened from, in order.
    pub fn watch_cursors(&self) -> Vec<String> {
        self.watch_cursors.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

#[async_trait]
impl<T> ListWatch<T> for MockListWatch<T>
where
    T: Clone + Send + Sync + 'static,
{
    async fn list(&self) -> Result<ListSnapshot<T>, WatchError> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        if self.hold_lists.load(Ordering::SeqCst) {
            futures::future::pending::<()>().await;
        }
        let mut snap = self.snapshot.lock().unwrap_or_else(PoisonError::into_inner);
        if snap.fail_lists > 0 {
            snap.fail_lists -= 1;
            return Err(WatchError::Other("scripted list failure".into()));
        }
        Ok(ListSnapshot { items: snap.items.clone(), resource_version: snap.resource_version.clone() })
    }

    async fn watch(&self, resource_version: &str) -> Result<WatchStream<T>, WatchError> {
        self.watch_cursors.lock().unwrap_or_else(PoisonError::into_inner).push(resource_version.to_string());
        let rx = Arc::clone(&self.rx);
        let stream = futures::stream::unfold(rx, |rx| async move {
            let next = rx.lock().await.recv().await;
            match next {
                Some(Feed::Event(ev)) => Some((ev, rx)),
                Some(Feed::End) | None => None,
            }
        });
        Ok(stream.boxed())
    }
}

/// [`ClusterClient`] serving one shared mock per kind and recording the
/// options every source was requested with.
#[derive(Default)]
pub struct MockClient {
    pub services: Arc<MockListWatch<Service>>,
    pub pods: Arc<MockListWatch<Pod>>,
    pub endpoints: Arc<MockListWatch<Endpoints>>,
    pub namespaces: Arc<MockListWatch<Namespace>>,
    requested: Mutex<Vec<(ResourceKind, ListOptions)>>,
}

impl MockClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn requested(&self, kind: ResourceKind) -> Vec<ListOptions> {
        self.requested
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|(k, _)| *k == kind)
            .map(|(_, o)| o.clone())
            .collect()
    }

    fn record(&self, kind: ResourceKind, opts: ListOptions) {
        self.requested.lock().unwrap_or_else(PoisonError::into_inner).push((kind, opts.for_kind(kind)));
    }
}

impl ClusterClient for MockClient {
    fn services(&self, opts: ListOptions) -> Arc<dyn ListWatch<Service>> {
        self.record(ResourceKind::Service, opts);
        self.services.clone()
    }

    fn pods(&self, opts: ListOptions) -> Arc<dyn ListWatch<Pod>> {
        self.record(ResourceKind::Pod, opts);
        self.pods.clone()
    }

    fn endpoints(&self, opts: ListOptions) -> Arc<dyn ListWatch<Endpoints>> {
        self.record(ResourceKind::Endpoints, opts);
        self.endpoints.clone()
    }

    fn namespaces(&self, opts: ListOptions) -> Arc<dyn ListWatch<Namespace>> {
        self.record(ResourceKind::Namespace, opts);
        self.namespaces.clone()
    }
}
