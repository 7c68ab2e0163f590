//! Query/record model, zone matching and reverse-name helpers.

use std::fmt;
use std::fmt::Write as _;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;
use std::sync::Arc;

use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QType {
    A,
    Aaaa,
    Ptr,
}

impl FromStr for QType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "a" => Ok(QType::A),
            "aaaa" => Ok(QType::Aaaa),
            "ptr" => Ok(QType::Ptr),
            other => Err(format!("unsupported query type: {other}")),
        }
    }
}

impl fmt::Display for QType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            QType::A => "A",
            QType::Aaaa => "AAAA",
            QType::Ptr => "PTR",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Query {
    /// Lowercase, fully qualified.
    pub name: String,
    pub qtype: QType,
}

impl Query {
    pub fn new(name: &str, qtype: QType) -> Self {
        Self { name: normalize(name), qtype }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RData {
    A(Ipv4Addr),
    Aaaa(Ipv6Addr),
    Ptr(String),
    Cname(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub name: String,
    pub ttl: u32,
    pub data: RData,
}

impl Record {
    /// A or AAAA depending on the address family.
    pub fn address(name: &str, ttl: u32, ip: IpAddr) -> Self {
        let data = match ip {
            IpAddr::V4(v4) => RData::A(v4),
            IpAddr::V6(v6) => RData::Aaaa(v6),
        };
        Self { name: name.to_string(), ttl, data }
    }
}

impl fmt::Display for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.data {
            RData::A(ip) => write!(f, "{}\t{}\tIN\tA\t{}", self.name, self.ttl, ip),
            RData::Aaaa(ip) => write!(f, "{}\t{}\tIN\tAAAA\t{}", self.name, self.ttl, ip),
            RData::Ptr(target) => write!(f, "{}\t{}\tIN\tPTR\t{}", self.name, self.ttl, target),
            RData::Cname(target) => write!(f, "{}\t{}\tIN\tCNAME\t{}", self.name, self.ttl, target),
        }
    }
}

/// What one resolver says about a query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Authoritative answer; may be empty (name exists, no data of this type).
    Answer(Vec<Record>),
    NameError,
    /// Not ours; let the next resolver try.
    Pass,
}

#[derive(Debug, thiserror::Error)]
pub enum LookupError {
    #[error("server failure: {0}")]
    ServerFailure(String),
}

pub trait Resolver: Send + Sync {
    fn name(&self) -> &str;
    fn resolve(&self, query: &Query) -> Result<Outcome, LookupError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rcode {
    NoError,
    NxDomain,
    ServFail,
    Refused,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub rcode: Rcode,
    pub answers: Vec<Record>,
    /// Resolver that produced the response, if any.
    pub resolver: Option<String>,
}

/// Ordered resolvers; the first outcome other than [`Outcome::Pass`] wins.
#[derive(Default, Clone)]
pub struct Chain {
    resolvers: Vec<Arc<dyn Resolver>>,
}

impl Chain {
    pub fn new(resolvers: Vec<Arc<dyn Resolver>>) -> Self {
        Self { resolvers }
    }

    pub fn resolve(&self, query: &Query) -> Response {
        for r in &self.resolvers {
            let (rcode, answers) = match r.resolve(query) {
                Ok(Outcome::Pass) => continue,
                Ok(Outcome::Answer(answers)) => (Rcode::NoError, answers),
                Ok(Outcome::NameError) => (Rcode::NxDomain, Vec::new()),
                Err(e) => {
                    warn!(resolver = r.name(), qname = %query.name, error = %e, "lookup failed");
                    (Rcode::ServFail, Vec::new())
                }
            };
            debug!(resolver = r.name(), qname = %query.name, qtype = %query.qtype, rcode = ?rcode, answers = answers.len(), "resolved");
            return Response { rcode, answers, resolver: Some(r.name().to_string()) };
        }
        Response { rcode: Rcode::Refused, answers: Vec::new(), resolver: None }
    }
}

/// Lowercase with a trailing dot; empty becomes the root.
pub fn normalize(name: &str) -> String {
    let mut n = name.trim().to_ascii_lowercase();
    if !n.ends_with('.') {
        n.push('.');
    }
    n
}

/// `prefix` qualified by `zone`.
pub fn join(prefix: &str, zone: &str) -> String {
    if zone == "." {
        format!("{prefix}.")
    } else {
        format!("{prefix}.{zone}")
    }
}

fn in_zone(qname: &str, zone: &str) -> bool {
    zone == "." || qname == zone || (qname.ends_with(zone) && qname[..qname.len() - zone.len()].ends_with('.'))
}

/// Most specific zone containing `qname`. Both sides must be normalized.
pub fn matches<'a>(zones: &'a [String], qname: &str) -> Option<&'a str> {
    zones.iter().filter(|z| in_zone(qname, z)).max_by_key(|z| z.len()).map(String::as_str)
}

/// The labels in front of `zone`, without the joining dot. `None` at the apex.
pub fn strip_zone<'a>(qname: &'a str, zone: &str) -> Option<&'a str> {
    if qname == zone {
        return None;
    }
    if zone == "." {
        return Some(qname.trim_end_matches('.'));
    }
    qname.strip_suffix(zone)?.strip_suffix('.').filter(|s| !s.is_empty())
}

pub fn is_reverse(name: &str) -> bool {
    let n = name.trim_end_matches('.');
    n.ends_with(".in-addr.arpa") || n.ends_with(".ip6.arpa")
}

/// Address encoded in an `in-addr.arpa` or `ip6.arpa` name.
pub fn reverse_to_ip(name: &str) -> Option<IpAddr> {
    let name = name.trim_end_matches('.').to_ascii_lowercase();
    if let Some(rest) = name.strip_suffix(".in-addr.arpa") {
        let octets: Vec<&str> = rest.split('.').collect();
        if octets.len() != 4 {
            return None;
        }
        let dotted = octets.iter().rev().copied().collect::<Vec<_>>().join(".");
        return dotted.parse::<Ipv4Addr>().ok().map(IpAddr::V4);
    }
    if let Some(rest) = name.strip_suffix(".ip6.arpa") {
        let nibbles: Vec<&str> = rest.split('.').collect();
        if nibbles.len() != 32 || nibbles.iter().any(|n| n.len() != 1) {
            return None;
        }
        let hex: String = nibbles.iter().rev().copied().collect();
        let groups: Vec<&str> = hex.as_bytes().chunks(4).filter_map(|c| std::str::from_utf8(c).ok()).collect();
        return groups.join(":").parse::<Ipv6Addr>().ok().map(IpAddr::V6);
    }
    None
}

pub fn reverse_name(ip: IpAddr) -> String {
    match ip {
        IpAddr::V4(v4) => {
            let o = v4.octets();
            format!("{}.{}.{}.{}.in-addr.arpa.", o[3], o[2], o[1], o[0])
        }
        IpAddr::V6(v6) => {
            let mut s = String::with_capacity(72);
            for b in v6.octets().iter().rev() {
                let _ = write!(s, "{:x}.{:x}.", b & 0x0f, b >> 4);
            }
            s.push_str("ip6.arpa.");
            s
        }
    }
}
