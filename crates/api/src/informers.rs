//! Standard watch factories: one per kind, each with the catalogue indexes.

use std::sync::Arc;

use kindex_core::{CacheObject, Endpoints, IndexName};
use kindex_kubehub::{ChangeObserver, ListOptions, WatchController};
use kindex_store::{indexers, IndexFn, Store};
use tracing::warn;

use crate::{Informer, InformerFn, WatchContext};

fn indexed<T: CacheObject>(indexers: Vec<(IndexName, IndexFn<T>)>) -> Arc<Store<T>> {
    let store = Store::new();
    for (name, f) in indexers {
        if let Err(e) = store.add_indexer(name, f) {
            warn!(kind = %T::KIND, error = %e, "indexer skipped");
        }
    }
    Arc::new(store)
}

pub fn services(opts: ListOptions) -> InformerFn {
    Box::new(move |ctx: &WatchContext| {
        let ctl = WatchController::new(ctx.client.services(opts), indexed(indexers::service_indexers()))
            .with_evaluator(ctx.evaluator.clone())
            .with_relist_pause(ctx.relist_pause);
        Informer::new(ctl)
    })
}

pub fn pods(opts: ListOptions) -> InformerFn {
    Box::new(move |ctx: &WatchContext| {
        let ctl = WatchController::new(ctx.client.pods(opts), indexed(indexers::pod_indexers()))
            .with_evaluator(ctx.evaluator.clone())
            .with_relist_pause(ctx.relist_pause);
        Informer::new(ctl)
    })
}

/// `observer` is told about every significant change, deletes included.
pub fn endpoints(opts: ListOptions, observer: Option<Arc<dyn ChangeObserver<Endpoints>>>) -> InformerFn {
    Box::new(move |ctx: &WatchContext| {
        let mut ctl = WatchController::new(ctx.client.endpoints(opts), indexed(indexers::endpoints_indexers()))
            .with_evaluator(ctx.evaluator.clone())
            .with_relist_pause(ctx.relist_pause);
        if let Some(observer) = observer {
            ctl = ctl.with_observer(observer);
        }
        Informer::new(ctl)
    })
}

/// Namespaces keep no secondary indexes and never touch the modified clock.
pub fn namespaces(opts: ListOptions) -> InformerFn {
    Box::new(move |ctx: &WatchContext| {
        let ctl = WatchController::new(ctx.client.namespaces(opts), Arc::new(Store::new()))
            .with_relist_pause(ctx.relist_pause);
        Informer::new(ctl)
    })
}
