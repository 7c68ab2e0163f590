//! kindex store: one indexed, concurrently readable object map per resource kind.
//!
//! The watch controller is the only writer. Readers get a [`Lister`], which
//! exposes list/get/index reads and nothing that mutates content.

#![forbid(unsafe_code)]

use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use kindex_core::{CacheObject, IndexName};
use rustc_hash::{FxHashMap, FxHashSet};
use smallvec::SmallVec;
use tracing::debug;

pub mod change;
pub mod indexers;

pub use change::{endpoints_equivalent, is_significant, ChangeEvaluator, ModifiedClock};

/// Keys an object contributes to one index (usually one or two).
pub type IndexKeys = SmallVec<[String; 2]>;

/// Projects an object to zero or more index keys.
pub type IndexFn<T> = Arc<dyn Fn(&T) -> IndexKeys + Send + Sync>;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("indexer conflict: {0} is already registered")]
    IndexConflict(IndexName),
}

struct Inner<T> {
    items: FxHashMap<String, Arc<T>>,
    indexers: FxHashMap<IndexName, IndexFn<T>>,
    indices: FxHashMap<IndexName, FxHashMap<String, FxHashSet<String>>>,
}

impl<T: CacheObject> Inner<T> {
    fn index_add(&mut self, key: &str, obj: &T) {
        for (name, f) in self.indexers.iter() {
            let postings = self.indices.entry(*name).or_default();
            for ik in f(obj) {
                postings.entry(ik).or_default().insert(key.to_string());
            }
        }
    }

    fn index_remove(&mut self, key: &str, obj: &T) {
        for (name, f) in self.indexers.iter() {
            let Some(postings) = self.indices.get_mut(name) else { continue };
            for ik in f(obj) {
                if let Some(set) = postings.get_mut(&ik) {
                    set.remove(key);
                    if set.is_empty() {
                        postings.remove(&ik);
                    }
                }
            }
        }
    }
}

/// Thread-safe primary map plus named secondary indexes.
///
/// Reads share a lock; `upsert`/`delete` take it exclusively and update the
/// primary map and every index in one step, so no reader ever sees an index
/// entry for an object that is no longer present.
pub struct Store<T> {
    inner: RwLock<Inner<T>>,
}

impl<T: CacheObject> Default for Store<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: CacheObject> Store<T> {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner {
                items: FxHashMap::default(),
                indexers: FxHashMap::default(),
                indices: FxHashMap::default(),
            }),
        }
    }

    /// Build a store with a set of indexers already registered.
    pub fn with_indexers(indexers: impl IntoIterator<Item = (IndexName, IndexFn<T>)>) -> Result<Self, StoreError> {
        let store = Self::new();
        for (name, f) in indexers {
            store.add_indexer(name, f)?;
        }
        Ok(store)
    }

    fn read(&self) -> RwLockReadGuard<'_, Inner<T>> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner<T>> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a named index. Objects already present are indexed immediately.
    pub fn add_indexer(&self, name: IndexName, f: IndexFn<T>) -> Result<(), StoreError> {
        let mut inner = self.write();
        if inner.indexers.contains_key(&name) {
            return Err(StoreError::IndexConflict(name));
        }
        let mut postings: FxHashMap<String, FxHashSet<String>> = FxHashMap::default();
        for (key, obj) in inner.items.iter() {
            for ik in f(obj.as_ref()) {
                postings.entry(ik).or_default().insert(key.clone());
            }
        }
        debug!(kind = %T::KIND, index = %name, backfilled = inner.items.len(), "indexer registered");
        inner.indices.insert(name, postings);
        inner.indexers.insert(name, f);
        Ok(())
    }

    /// Insert or replace by identity key. Returns the previous value, if any.
    pub fn upsert(&self, obj: impl Into<Arc<T>>) -> Option<Arc<T>> {
        let obj = obj.into();
        let key = obj.key();
        let mut inner = self.write();
        let old = inner.items.remove(&key);
        if let Some(prev) = old.as_deref() {
            inner.index_remove(&key, prev);
        }
        inner.index_add(&key, &obj);
        inner.items.insert(key, obj);
        old
    }

    /// Remove by identity key, dropping its contributions from every index.
    pub fn delete(&self, key: &str) -> Option<Arc<T>> {
        let mut inner = self.write();
        let old = inner.items.remove(key)?;
        inner.index_remove(key, &old);
        Some(old)
    }

    /// Remove every object whose key fails `keep`. Returns the removed objects.
    pub fn retain(&self, mut keep: impl FnMut(&str) -> bool) -> Vec<Arc<T>> {
        let mut inner = self.write();
        let doomed: Vec<String> = inner.items.keys().filter(|k| !keep(k.as_str())).cloned().collect();
        let mut removed = Vec::with_capacity(doomed.len());
        for key in doomed {
            if let Some(old) = inner.items.remove(&key) {
                inner.index_remove(&key, &old);
                removed.push(old);
            }
        }
        removed
    }

    pub fn list(&self) -> Vec<Arc<T>> {
        self.read().items.values().cloned().collect()
    }

    pub fn keys(&self) -> Vec<String> {
        self.read().items.keys().cloned().collect()
    }

    pub fn get(&self, key: &str) -> Option<Arc<T>> {
        self.read().items.get(key).cloned()
    }

    /// Objects indexed under `key` in `index`; empty when either is unknown.
    pub fn by_index(&self, index: IndexName, key: &str) -> Vec<Arc<T>> {
        let inner = self.read();
        let Some(set) = inner.indices.get(&index).and_then(|p| p.get(key)) else {
            return Vec::new();
        };
        set.iter().filter_map(|k| inner.items.get(k).cloned()).collect()
    }

    /// Every key currently present in `index`.
    pub fn index_keys(&self, index: IndexName) -> Vec<String> {
        self.read().indices.get(&index).map(|p| p.keys().cloned().collect()).unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.read().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Read handle onto a shared [`Store`]. Cheap to clone.
pub struct Lister<T> {
    store: Arc<Store<T>>,
}

impl<T> Clone for Lister<T> {
    fn clone(&self) -> Self {
        Self { store: Arc::clone(&self.store) }
    }
}

impl<T: CacheObject> Lister<T> {
    pub fn new(store: Arc<Store<T>>) -> Self {
        Self { store }
    }

    pub fn list(&self) -> Vec<Arc<T>> { self.store.list() }
    pub fn get(&self, key: &str) -> Option<Arc<T>> { self.store.get(key) }
    pub fn by_index(&self, index: IndexName, key: &str) -> Vec<Arc<T>> { self.store.by_index(index, key) }
    pub fn index_keys(&self, index: IndexName) -> Vec<String> { self.store.index_keys(index) }
    pub fn len(&self) -> usize { self.store.len() }
    pub fn is_empty(&self) -> bool { self.store.is_empty() }

    /// Ask the shared store to maintain an additional named index.
    pub fn add_indexer(&self, name: IndexName, f: IndexFn<T>) -> Result<(), StoreError> {
        self.store.add_indexer(name, f)
    }

    /// True when both handles read the same underlying store.
    pub fn same_store(&self, other: &Lister<T>) -> bool {
        Arc::ptr_eq(&self.store, &other.store)
    }
}

impl<T: CacheObject> std::fmt::Debug for Lister<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lister").field("kind", &T::KIND).field("len", &self.len()).finish()
    }
}
