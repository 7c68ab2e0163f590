//! Per-kind list-then-watch loop feeding a [`Store`].

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::StreamExt;
use kindex_core::{CacheObject, ListSnapshot, ResourceKind, WatchEvent};
use kindex_store::{ChangeEvaluator, Lister, Store};
use metrics::{counter, histogram};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{ListWatch, WatchError};

pub const DEFAULT_RELIST_PAUSE: Duration = Duration::from_millis(1000);

/// Side channel told about every significant change. `old == None` is an
/// add, `new == None` a delete.
pub trait ChangeObserver<T>: Send + Sync {
    fn on_change(&self, old: Option<&T>, new: Option<&T>);
}

/// Object-safe handle the registry keeps for every running watch.
#[async_trait]
pub trait Controller: Send + Sync {
    fn kind(&self) -> ResourceKind;
    /// True once the first list has been applied; never resets.
    fn has_synced(&self) -> bool;
    /// Runs until `stop` fires. Never starts a list or watch after that.
    async fn run(&self, stop: CancellationToken);
}

pub struct WatchController<T> {
    source: Arc<dyn ListWatch<T>>,
    store: Arc<Store<T>>,
    evaluator: Option<ChangeEvaluator>,
    observer: Option<Arc<dyn ChangeObserver<T>>>,
    synced: AtomicBool,
    relist_pause: Duration,
}

impl<T: CacheObject> WatchController<T> {
    pub fn new(source: Arc<dyn ListWatch<T>>, store: Arc<Store<T>>) -> Self {
        Self {
            source,
            store,
            evaluator: None,
            observer: None,
            synced: AtomicBool::new(false),
            relist_pause: DEFAULT_RELIST_PAUSE,
        }
    }

    pub fn with_evaluator(mut self, evaluator: ChangeEvaluator) -> Self {
        self.evaluator = Some(evaluator);
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn ChangeObserver<T>>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn with_relist_pause(mut self, pause: Duration) -> Self {
        self.relist_pause = pause;
        self
    }

    pub fn store(&self) -> &Arc<Store<T>> {
        &self.store
    }

    pub fn lister(&self) -> Lister<T> {
        Lister::new(Arc::clone(&self.store))
    }

    // Without an evaluator every change counts, but nothing touches the clock.
    fn evaluate(&self, old: Option<&T>, new: Option<&T>) -> bool {
        match &self.evaluator {
            Some(eval) => eval.observe(old, new),
            None => true,
        }
    }

    fn changed(&self, old: Option<&T>, new: Option<&T>) {
        if self.evaluate(old, new) {
            if let Some(observer) = &self.observer {
                observer.on_change(old, new);
            }
        }
    }

    /// Lists, reconciles the store against the snapshot and returns the cursor.
    async fn relist(&self) -> Result<String, WatchError> {
        let started = Instant::now();
        let ListSnapshot { items, resource_version } = self.source.list().await?;
        let count = items.len();
        let mut listed = HashSet::with_capacity(count);
        for obj in items {
            let obj = Arc::new(obj);
            listed.insert(obj.key());
            let old = self.store.upsert(Arc::clone(&obj));
            self.changed(old.as_deref(), Some(obj.as_ref()));
        }
        let gone = self.store.retain(|key| listed.contains(key));
        for obj in &gone {
            self.changed(Some(obj.as_ref()), None);
        }
        let took_ms = started.elapsed().as_secs_f64() * 1000.0;
        histogram!("watch_list_ms", took_ms, "kind" => T::KIND.as_str());
        info!(
            kind = %T::KIND,
            count,
            removed = gone.len(),
            rv = %resource_version,
            took_ms = %format!("{:.1}", took_ms),
            "list applied"
        );
        Ok(resource_version)
    }

    fn apply(&self, event: WatchEvent<T>, cursor: &mut String) {
        counter!("watch_events_total", 1u64, "kind" => T::KIND.as_str(), "event" => event.label());
        match event {
            WatchEvent::Added(obj) => {
                *cursor = obj.resource_version().to_string();
                let obj = Arc::new(obj);
                self.store.upsert(Arc::clone(&obj));
                self.changed(None, Some(obj.as_ref()));
            }
            WatchEvent::Modified(obj) => {
                *cursor = obj.resource_version().to_string();
                let obj = Arc::new(obj);
                let old = self.store.upsert(Arc::clone(&obj));
                self.changed(old.as_deref(), Some(obj.as_ref()));
            }
            WatchEvent::Deleted(obj) => {
                *cursor = obj.resource_version().to_string();
                let old = self.store.delete(&obj.key());
                self.changed(Some(old.as_deref().unwrap_or(&obj)), None);
            }
            WatchEvent::Bookmark(rv) => {
                debug!(kind = %T::KIND, rv = %rv, "bookmark");
                *cursor = rv;
            }
        }
    }

    /// Applies events until the stream closes or yields an error.
    async fn stream(&self, cursor: &mut String) -> Result<(), WatchError> {
        let mut events = self.source.watch(cursor).await?;
        debug!(kind = %T::KIND, rv = %cursor, "watch opened");
        while let Some(event) = events.next().await {
            self.apply(event?, cursor);
        }
        Ok(())
    }
}

#[async_trait]
impl<T: CacheObject> Controller for WatchController<T> {
    fn kind(&self) -> ResourceKind {
        T::KIND
    }

    fn has_synced(&self) -> bool {
        self.synced.load(Ordering::Acquire)
    }

    async fn run(&self, stop: CancellationToken) {
        let kind = T::KIND;
        info!(kind = %kind, "watch controller started");
        while !stop.is_cancelled() {
            let listed = tokio::select! {
                _ = stop.cancelled() => break,
                res = self.relist() => res,
            };
            let failed = match listed {
                Ok(mut cursor) => {
                    if !self.synced.swap(true, Ordering::AcqRel) {
                        info!(kind = %kind, "initial sync complete");
                    }
                    let ended = tokio::select! {
                        _ = stop.cancelled() => break,
                        ended = self.stream(&mut cursor) => ended,
                    };
                    match ended {
                        Ok(()) => {
                            debug!(kind = %kind, rv = %cursor, "watch stream ended");
                            false
                        }
                        Err(e) => {
                            warn!(kind = %kind, rv = %cursor, error = %e, "watch stream failed");
                            true
                        }
                    }
                }
                Err(e) => {
                    warn!(kind = %kind, error = %e, "list failed");
                    true
                }
            };
            counter!("watch_relist_total", 1u64, "kind" => kind.as_str());
            // Hot-loop guard only; retry backoff proper belongs to the client.
            if failed {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = tokio::time::sleep(self.relist_pause) => {}
                }
            }
        }
        info!(kind = %kind, "watch controller stopped");
    }
}
