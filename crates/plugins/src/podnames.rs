//! The `podnames` consumer: `<pod>.<namespace>.<zone>` records read from the
//! pod store another consumer watches.

use std::net::IpAddr;
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use kindex_api::{watch, AnyLister, ApiResult, ApiWatcher, HasSyncedFn, InformerFn};
use kindex_core::{index, object_key, CacheObject, Pod};
use kindex_store::Lister;
use tracing::debug;

use crate::query::{self, LookupError, Outcome, QType, Query, RData, Record, Resolver};

pub const NAME: &str = "podnames";

#[derive(Debug, Clone)]
pub struct PodNamesOptions {
    /// The first zone names PTR targets.
    pub zones: Vec<String>,
    pub ttl: u32,
}

impl Default for PodNamesOptions {
    fn default() -> Self {
        Self { zones: vec!["cluster.local.".to_string()], ttl: 5 }
    }
}

pub struct PodNames {
    zones: Vec<String>,
    ttl: u32,
    pods: ArcSwapOption<Lister<Pod>>,
    synced: ArcSwapOption<HasSyncedFn>,
}

impl PodNames {
    pub fn new(opts: PodNamesOptions) -> Self {
        Self {
            zones: opts.zones.iter().map(|z| query::normalize(z)).collect(),
            ttl: opts.ttl,
            pods: ArcSwapOption::empty(),
            synced: ArcSwapOption::empty(),
        }
    }

    pub fn has_synced(&self) -> bool {
        self.synced.load_full().map(|f| f()).unwrap_or(false)
    }

    fn lister(&self) -> Result<Arc<Lister<Pod>>, LookupError> {
        self.pods.load_full().ok_or_else(|| LookupError::ServerFailure("no pod lister registered".into()))
    }

    fn reverse(&self, q: &Query) -> Result<Outcome, LookupError> {
        let Some(ip) = query::reverse_to_ip(&q.name) else { return Ok(Outcome::NameError) };
        let Some(first) = self.zones.first() else { return Ok(Outcome::Pass) };
        let answers = self
            .lister()?
            .by_index(index::POD_IP, &ip.to_string())
            .iter()
            .map(|pod| Record {
                name: q.name.clone(),
                ttl: self.ttl,
                data: RData::Ptr(query::join(&format!("{}.{}", pod.name, pod.namespace), first)),
            })
            .collect();
        Ok(Outcome::Answer(answers))
    }

    fn forward(&self, q: &Query, zone: &str) -> Result<Outcome, LookupError> {
        let Some(sub) = query::strip_zone(&q.name, zone) else { return Ok(Outcome::NameError) };
        // The namespace is the last label; pod names may themselves contain dots.
        let Some((name, ns)) = sub.rsplit_once('.') else { return Ok(Outcome::NameError) };
        let Some(pod) = self.lister()?.get(&object_key(ns, name)) else { return Ok(Outcome::NameError) };
        // Pending pods have no address yet; the name exists without records.
        let Ok(ip) = pod.pod_ip.parse::<IpAddr>() else {
            debug!(pod = %pod.key(), ip = %pod.pod_ip, "pod has no usable address");
            return Ok(Outcome::Answer(Vec::new()));
        };
        let answers = match (q.qtype, ip) {
            (QType::A, IpAddr::V4(_)) | (QType::Aaaa, IpAddr::V6(_)) => vec![Record::address(&q.name, self.ttl, ip)],
            _ => Vec::new(),
        };
        Ok(Outcome::Answer(answers))
    }
}

impl ApiWatcher for PodNames {
    fn name(&self) -> &str {
        NAME
    }

    fn informers(&self) -> Vec<(String, InformerFn)> {
        Vec::new()
    }

    fn set_lister(&self, watch_name: &str, lister: AnyLister) -> ApiResult<()> {
        if watch_name == watch::POD {
            self.pods.store(Some(Arc::new(lister.into_pods(watch_name)?)));
        } else {
            debug!(watch = watch_name, "podnames ignores lister");
        }
        Ok(())
    }

    fn set_has_synced(&self, synced: HasSyncedFn) {
        self.synced.store(Some(Arc::new(synced)));
    }
}

impl Resolver for PodNames {
    fn name(&self) -> &str {
        NAME
    }

    fn resolve(&self, q: &Query) -> Result<Outcome, LookupError> {
        let Some(zone) = query::matches(&self.zones, &q.name) else { return Ok(Outcome::Pass) };
        match q.qtype {
            QType::Ptr if query::is_reverse(&q.name) => self.reverse(q),
            QType::A | QType::Aaaa if !query::is_reverse(&q.name) => self.forward(q, zone),
            _ => Ok(Outcome::Pass),
        }
    }
}
