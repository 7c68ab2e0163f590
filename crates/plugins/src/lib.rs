//! kindex lookup consumers.
//!
//! Each consumer registers with the watch registry as an
//! [`ApiWatcher`](kindex_api::ApiWatcher) and answers queries as a
//! [`Resolver`]. Reads go straight to the shared stores; nothing is cached here.

#![forbid(unsafe_code)]

pub mod kubernetes;
pub mod podnames;
pub mod query;

pub use kubernetes::{DnsControl, Kubernetes, KubernetesOptions};
pub use podnames::{PodNames, PodNamesOptions};
pub use query::{Chain, LookupError, Outcome, QType, Query, RData, Rcode, Record, Resolver, Response};
