//! Change-significance evaluation and the process-wide "last modified" clock.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use kindex_core::{CacheObject, EndpointSubset, Endpoints, ObjectRef};
use metrics::counter;
use tracing::debug;

/// Unix seconds of the most recent significant change to any watched kind.
///
/// Cloning shares the same underlying value. Only [`ChangeEvaluator`] moves
/// it forward, and it never moves backwards.
#[derive(Debug, Clone, Default)]
pub struct ModifiedClock(Arc<AtomicI64>);

impl ModifiedClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn modified(&self) -> i64 {
        self.0.load(Ordering::Acquire)
    }

    fn touch(&self, unix: i64) {
        self.0.fetch_max(unix, Ordering::AcqRel);
    }
}

/// Decides whether an old/new pair is worth recording and advances the clock if so.
#[derive(Debug, Clone, Default)]
pub struct ChangeEvaluator {
    clock: ModifiedClock,
}

impl ChangeEvaluator {
    pub fn new(clock: ModifiedClock) -> Self {
        Self { clock }
    }

    pub fn clock(&self) -> &ModifiedClock {
        &self.clock
    }

    /// `old == None` is a pure add, `new == None` a pure delete.
    pub fn observe<T: CacheObject>(&self, old: Option<&T>, new: Option<&T>) -> bool {
        let significant = is_significant(old, new);
        if significant {
            self.clock.touch(chrono::Utc::now().timestamp());
            counter!("store_significant_changes_total", 1u64, "kind" => T::KIND.as_str());
        }
        significant
    }
}

pub fn is_significant<T: CacheObject>(old: Option<&T>, new: Option<&T>) -> bool {
    if let (Some(o), Some(n)) = (old, new) {
        if o.resource_version() == n.resource_version() {
            return false;
        }
    }
    let Some(subject) = new.or(old) else { return false };
    match subject.view() {
        ObjectRef::Service(_) | ObjectRef::Pod(_) => true,
        ObjectRef::Endpoints(_) => !endpoints_equivalent(
            old.and_then(|o| o.view().endpoints()),
            new.and_then(|n| n.view().endpoints()),
        ),
        ObjectRef::Namespace(ns) => {
            debug!(namespace = %ns.name, "namespace changes are not tracked");
            false
        }
    }
}

/// Same ready addresses, hostnames and ports (name, number, protocol),
/// compared positionally. Relies on the API server's canonical ordering.
fn subsets_equivalent(a: &EndpointSubset, b: &EndpointSubset) -> bool {
    if a.addresses.len() != b.addresses.len() || a.ports.len() != b.ports.len() {
        return false;
    }
    let addrs_eq = a
        .addresses
        .iter()
        .zip(&b.addresses)
        .all(|(x, y)| x.ip == y.ip && x.hostname == y.hostname);
    let ports_eq = a
        .ports
        .iter()
        .zip(&b.ports)
        .all(|(x, y)| x.name == y.name && x.port == y.port && x.protocol == y.protocol);
    addrs_eq && ports_eq
}

/// Absent on either side is never equivalent.
pub fn endpoints_equivalent(a: Option<&Endpoints>, b: Option<&Endpoints>) -> bool {
    let (Some(a), Some(b)) = (a, b) else { return false };
    a.subsets.len() == b.subsets.len()
        && a.subsets.iter().zip(&b.subsets).all(|(sa, sb)| subsets_equivalent(sa, sb))
}
