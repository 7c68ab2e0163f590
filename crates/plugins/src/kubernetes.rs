//! The `kubernetes` consumer: service, endpoint and pod records for a cluster zone.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use kindex_api::{informers, watch, AnyLister, ApiResult, ApiWatcher, HasSyncedFn, InformerFn};
use kindex_core::{index, object_key, CacheObject, Endpoints, Namespace, Pod, Service};
use kindex_kubehub::{ChangeObserver, ListOptions};
use kindex_store::{Lister, ModifiedClock};
use metrics::histogram;
use tracing::debug;

use crate::query::{self, LookupError, Outcome, QType, Query, RData, Record, Resolver};

pub const NAME: &str = "kubernetes";

#[derive(Debug, Clone)]
pub struct KubernetesOptions {
    /// Normalized zones this consumer answers for.
    pub zones: Vec<String>,
    pub ttl: u32,
    pub label_selector: Option<String>,
    pub namespace_label_selector: Option<String>,
    /// Namespaces whose names resolve; empty exposes all.
    pub namespaces: Vec<String>,
    pub init_pod_cache: bool,
    pub init_endpoints_cache: bool,
}

impl Default for KubernetesOptions {
    fn default() -> Self {
        Self {
            zones: vec!["cluster.local.".to_string()],
            ttl: 5,
            label_selector: None,
            namespace_label_selector: None,
            namespaces: Vec::new(),
            init_pod_cache: true,
            init_endpoints_cache: true,
        }
    }
}

/// Read side over the shared listers. Every read is a fresh store lookup;
/// a lister that has not been handed over yet reads as empty.
#[derive(Default)]
pub struct DnsControl {
    svc: ArcSwapOption<Lister<Service>>,
    pod: ArcSwapOption<Lister<Pod>>,
    ep: ArcSwapOption<Lister<Endpoints>>,
    ns: ArcSwapOption<Lister<Namespace>>,
    synced: ArcSwapOption<HasSyncedFn>,
    clock: ArcSwapOption<ModifiedClock>,
}

impl DnsControl {
    pub fn set_lister(&self, watch_name: &str, lister: AnyLister) -> ApiResult<()> {
        match watch_name {
            watch::SERVICE => self.svc.store(Some(Arc::new(lister.into_services(watch_name)?))),
            watch::POD => self.pod.store(Some(Arc::new(lister.into_pods(watch_name)?))),
            watch::ENDPOINTS => self.ep.store(Some(Arc::new(lister.into_endpoints(watch_name)?))),
            watch::NAMESPACE => self.ns.store(Some(Arc::new(lister.into_namespaces(watch_name)?))),
            other => debug!(watch = other, "ignoring unknown lister"),
        }
        Ok(())
    }

    pub fn service_list(&self) -> Vec<Arc<Service>> {
        self.svc.load_full().map(|l| l.list()).unwrap_or_default()
    }

    pub fn endpoints_list(&self) -> Vec<Arc<Endpoints>> {
        self.ep.load_full().map(|l| l.list()).unwrap_or_default()
    }

    /// Services by `namespace/name`.
    pub fn svc_index(&self, key: &str) -> Vec<Arc<Service>> {
        self.svc.load_full().map(|l| l.by_index(index::SVC_NAME_NAMESPACE, key)).unwrap_or_default()
    }

    /// Services by cluster or external IP.
    pub fn svc_index_reverse(&self, ip: &str) -> Vec<Arc<Service>> {
        self.svc.load_full().map(|l| l.by_index(index::SVC_IP, ip)).unwrap_or_default()
    }

    pub fn pod_index(&self, ip: &str) -> Vec<Arc<Pod>> {
        self.pod.load_full().map(|l| l.by_index(index::POD_IP, ip)).unwrap_or_default()
    }

    /// Endpoints by `namespace/name`.
    pub fn ep_index(&self, key: &str) -> Vec<Arc<Endpoints>> {
        self.ep.load_full().map(|l| l.by_index(index::EP_NAME_NAMESPACE, key)).unwrap_or_default()
    }

    pub fn ep_index_reverse(&self, ip: &str) -> Vec<Arc<Endpoints>> {
        self.ep.load_full().map(|l| l.by_index(index::EP_IP, ip)).unwrap_or_default()
    }

    pub fn namespace_by_name(&self, name: &str) -> Option<Arc<Namespace>> {
        self.ns.load_full().and_then(|l| l.get(name))
    }

    pub fn has_synced(&self) -> bool {
        self.synced.load_full().map(|f| f()).unwrap_or(false)
    }

    pub fn modified(&self) -> i64 {
        self.clock.load_full().map(|c| c.modified()).unwrap_or(0)
    }
}

/// Records DNS programming latency for endpoints backing exactly one headless service.
struct ProgrammingLatency {
    control: Arc<DnsControl>,
}

impl ChangeObserver<Endpoints> for ProgrammingLatency {
    fn on_change(&self, old: Option<&Endpoints>, new: Option<&Endpoints>) {
        let Some(ep) = new.or(old) else { return };
        let services = self.control.svc_index(&ep.key());
        if let Some(latency) = programming_latency(&services, ep, chrono::Utc::now().timestamp_millis()) {
            histogram!("dns_programming_duration_seconds", latency, "service_kind" => "headless_with_selector");
        }
    }
}

/// Seconds from the trigger annotation to `now_ms`, when the endpoints back
/// exactly one headless service and carry the annotation.
fn programming_latency(services: &[Arc<Service>], ep: &Endpoints, now_ms: i64) -> Option<f64> {
    let trigger_ms = ep.last_change_trigger_ms?;
    match services {
        [svc] if svc.headless() => Some((now_ms - trigger_ms).max(0) as f64 / 1000.0),
        _ => None,
    }
}

pub struct Kubernetes {
    opts: KubernetesOptions,
    control: Arc<DnsControl>,
}

impl Kubernetes {
    pub fn new(mut opts: KubernetesOptions) -> Self {
        opts.zones = opts.zones.iter().map(|z| query::normalize(z)).collect();
        Self { opts, control: Arc::new(DnsControl::default()) }
    }

    pub fn control(&self) -> &Arc<DnsControl> {
        &self.control
    }

    fn list_options(&self) -> ListOptions {
        ListOptions::new().labels(self.opts.label_selector.as_deref())
    }

    fn namespace_exposed(&self, ns: &str) -> bool {
        if !self.opts.namespaces.is_empty() && !self.opts.namespaces.iter().any(|n| n == ns) {
            return false;
        }
        self.opts.namespace_label_selector.is_none() || self.control.namespace_by_name(ns).is_some()
    }

    /// Forward zone used as the PTR target suffix.
    fn forward_zone(&self) -> Option<&str> {
        self.opts.zones.iter().map(String::as_str).find(|z| !query::is_reverse(z))
    }

    fn reverse(&self, q: &Query) -> Outcome {
        let Some(ip) = query::reverse_to_ip(&q.name) else { return Outcome::NameError };
        let Some(zone) = self.forward_zone() else { return Outcome::NameError };
        let ip = ip.to_string();
        let mut answers = Vec::new();
        for svc in self.control.svc_index_reverse(&ip) {
            if self.namespace_exposed(&svc.namespace) {
                let target = query::join(&format!("{}.{}.svc", svc.name, svc.namespace), zone);
                answers.push(Record { name: q.name.clone(), ttl: self.opts.ttl, data: RData::Ptr(target) });
            }
        }
        for ep in self.control.ep_index_reverse(&ip) {
            if !self.namespace_exposed(&ep.namespace) {
                continue;
            }
            let hosts = ep.subsets.iter().flat_map(|s| &s.addresses).filter(|a| a.ip == ip && !a.hostname.is_empty());
            for addr in hosts {
                let target = query::join(&format!("{}.{}.{}.svc", addr.hostname, ep.name, ep.namespace), zone);
                answers.push(Record { name: q.name.clone(), ttl: self.opts.ttl, data: RData::Ptr(target) });
            }
        }
        Outcome::Answer(answers)
    }

    fn addresses(&self, q: &Query, ips: impl IntoIterator<Item = IpAddr>) -> Vec<Record> {
        ips.into_iter()
            .filter(|ip| matches!((q.qtype, ip), (QType::A, IpAddr::V4(_)) | (QType::Aaaa, IpAddr::V6(_))))
            .map(|ip| Record::address(&q.name, self.opts.ttl, ip))
            .collect()
    }

    fn service(&self, q: &Query, hostname: Option<&str>, name: &str, ns: &str) -> Outcome {
        if !self.namespace_exposed(ns) {
            return Outcome::NameError;
        }
        let key = object_key(ns, name);
        let Some(svc) = self.control.svc_index(&key).into_iter().next() else { return Outcome::NameError };

        if svc.is_external_name() {
            if hostname.is_some() {
                return Outcome::NameError;
            }
            let target = query::normalize(&svc.external_name);
            return Outcome::Answer(vec![Record { name: q.name.clone(), ttl: self.opts.ttl, data: RData::Cname(target) }]);
        }
        if !svc.headless() {
            if hostname.is_some() {
                return Outcome::NameError;
            }
            let ips = svc.cluster_ips.iter().filter_map(|ip| ip.parse::<IpAddr>().ok());
            return Outcome::Answer(self.addresses(q, ips));
        }

        let mut found = false;
        let mut ips = Vec::new();
        for ep in self.control.ep_index(&key) {
            for addr in ep.subsets.iter().flat_map(|s| &s.addresses) {
                if hostname.map_or(true, |h| addr.hostname == h) {
                    found = true;
                    ips.extend(addr.ip.parse::<IpAddr>().ok());
                }
            }
        }
        if hostname.is_some() && !found {
            return Outcome::NameError;
        }
        Outcome::Answer(self.addresses(q, ips))
    }

    fn pod(&self, q: &Query, dashed: &str, ns: &str) -> Outcome {
        if !self.namespace_exposed(ns) {
            return Outcome::NameError;
        }
        let Some(ip) = dashed_ip(dashed) else { return Outcome::NameError };
        if self.opts.init_pod_cache {
            let known = self.control.pod_index(&ip.to_string()).iter().any(|p| p.namespace == ns && !p.deleting);
            if !known {
                return Outcome::NameError;
            }
        }
        Outcome::Answer(self.addresses(q, [ip]))
    }
}

/// `10-0-0-5` or `fd00--1` style pod address labels.
fn dashed_ip(label: &str) -> Option<IpAddr> {
    label
        .replace('-', ".")
        .parse::<Ipv4Addr>()
        .map(IpAddr::V4)
        .or_else(|_| label.replace('-', ":").parse::<Ipv6Addr>().map(IpAddr::V6))
        .ok()
}

impl ApiWatcher for Kubernetes {
    fn name(&self) -> &str {
        NAME
    }

    fn informers(&self) -> Vec<(String, InformerFn)> {
        let mut out = vec![(watch::SERVICE.to_string(), informers::services(self.list_options()))];
        if self.opts.init_pod_cache {
            out.push((watch::POD.to_string(), informers::pods(self.list_options())));
        }
        if self.opts.init_endpoints_cache {
            let observer: Arc<dyn ChangeObserver<Endpoints>> =
                Arc::new(ProgrammingLatency { control: Arc::clone(&self.control) });
            out.push((watch::ENDPOINTS.to_string(), informers::endpoints(self.list_options(), Some(observer))));
        }
        let ns_opts = ListOptions::new().labels(self.opts.namespace_label_selector.as_deref());
        out.push((watch::NAMESPACE.to_string(), informers::namespaces(ns_opts)));
        out
    }

    fn set_lister(&self, watch_name: &str, lister: AnyLister) -> ApiResult<()> {
        self.control.set_lister(watch_name, lister)
    }

    fn set_has_synced(&self, synced: HasSyncedFn) {
        self.control.synced.store(Some(Arc::new(synced)));
    }

    fn set_modified(&self, clock: ModifiedClock) {
        self.control.clock.store(Some(Arc::new(clock)));
    }
}

impl Resolver for Kubernetes {
    fn name(&self) -> &str {
        NAME
    }

    fn resolve(&self, q: &Query) -> Result<Outcome, LookupError> {
        let Some(zone) = query::matches(&self.opts.zones, &q.name) else { return Ok(Outcome::Pass) };
        if query::is_reverse(&q.name) {
            return Ok(match q.qtype {
                QType::Ptr => self.reverse(q),
                QType::A | QType::Aaaa => Outcome::Answer(Vec::new()),
            });
        }
        let Some(sub) = query::strip_zone(&q.name, zone) else { return Ok(Outcome::Answer(Vec::new())) };
        if q.qtype == QType::Ptr {
            return Ok(Outcome::Answer(Vec::new()));
        }
        let labels: Vec<&str> = sub.split('.').collect();
        let outcome = match labels.as_slice() {
            [name, ns, "svc"] => self.service(q, None, name, ns),
            [host, name, ns, "svc"] => self.service(q, Some(*host), name, ns),
            [dashed, ns, "pod"] => self.pod(q, dashed, ns),
            _ => Outcome::NameError,
        };
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service(cluster_ip: &str) -> Arc<Service> {
        Arc::new(Service {
            name: "db".into(),
            namespace: "data".into(),
            cluster_ips: vec![cluster_ip.into()],
            ..Default::default()
        })
    }

    fn endpoints(trigger_ms: Option<i64>) -> Endpoints {
        Endpoints { name: "db".into(), namespace: "data".into(), last_change_trigger_ms: trigger_ms, ..Default::default() }
    }

    #[test]
    fn latency_is_recorded_for_a_single_headless_service() {
        let ep = endpoints(Some(10_000));
        assert_eq!(programming_latency(&[service("None")], &ep, 12_500), Some(2.5));
        // Clock skew never yields a negative sample.
        assert_eq!(programming_latency(&[service("None")], &ep, 9_000), Some(0.0));
    }

    #[test]
    fn latency_is_skipped_otherwise() {
        let ep = endpoints(Some(10_000));
        assert_eq!(programming_latency(&[service("10.0.0.1")], &ep, 12_500), None);
        assert_eq!(programming_latency(&[], &ep, 12_500), None);
        assert_eq!(programming_latency(&[service("None"), service("None")], &ep, 12_500), None);
        assert_eq!(programming_latency(&[service("None")], &endpoints(None), 12_500), None);
    }
}
