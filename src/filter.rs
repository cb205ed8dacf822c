//! Host selection.
//!
//! Narrows the fleet to the hosts requested on the command line. Each of the
//! three dimensions (host, cluster, datacenter) accepts several tokens whose
//! matches are unioned; the dimensions are then intersected. A dimension
//! without tokens does not constrain the selection.

use glob::Pattern;
use std::collections::{btree_map::Entry, BTreeMap, BTreeSet};
use std::net::{IpAddr, ToSocketAddrs};
use tracing::{debug, error, warn};

use crate::error::{Error, Result};
use crate::inventory::{HostRecord, HostSet};

/// Characters that turn a host token into a glob pattern.
pub const PATTERN_CHARS: &[char] = &['*', '[', ']', '?'];

/// Filters requested by the user.
#[derive(Debug, Clone, Default)]
pub struct FilterSpec {
    /// Host names, addresses or patterns (`-H`).
    pub hosts: Vec<String>,
    /// Cluster name patterns (`-c`).
    pub clusters: Vec<String>,
    /// Datacenter name patterns (`-d`).
    pub datacenters: Vec<String>,
    /// Keep at most one host per cluster.
    pub one_per_cluster: bool,
}

impl FilterSpec {
    /// Whether any dimension is constrained.
    pub fn is_narrowing(&self) -> bool {
        !(self.hosts.is_empty() && self.clusters.is_empty() && self.datacenters.is_empty())
    }

    /// `datacenter=.., cluster=.., host=..` with `*` for open dimensions.
    pub fn describe(&self) -> String {
        fn tokens(values: &[String]) -> String {
            if values.is_empty() {
                "*".to_string()
            } else {
                values.join(",")
            }
        }
        format!(
            "datacenter={}, cluster={}, host={}",
            tokens(&self.datacenters),
            tokens(&self.clusters),
            tokens(&self.hosts)
        )
    }
}

/// Outcome of host selection.
#[derive(Debug, Clone)]
pub struct Selection {
    /// Selected hosts.
    pub hosts: HostSet,
    /// Set when the selection is the whole, non-empty fleet.
    pub full_fleet: bool,
}

impl Selection {
    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }
}

/// Name resolution used to reconcile host names with inventory addresses.
pub trait Resolver {
    fn resolve(&self, name: &str) -> std::io::Result<Vec<IpAddr>>;
}

/// Resolver backed by the system's name service.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemResolver;

impl Resolver for SystemResolver {
    fn resolve(&self, name: &str) -> std::io::Result<Vec<IpAddr>> {
        Ok((name, 0).to_socket_addrs()?.map(|addr| addr.ip()).collect())
    }
}

/// Split tokens into glob patterns and exact names.
pub fn sift_patterns(tokens: &[String]) -> (BTreeSet<String>, BTreeSet<String>) {
    let mut patterns = BTreeSet::new();
    let mut names = BTreeSet::new();
    for token in tokens {
        if token.contains(PATTERN_CHARS) {
            patterns.insert(token.clone());
        } else {
            names.insert(token.clone());
        }
    }
    (patterns, names)
}

fn compile<'a, I>(patterns: I) -> Result<Vec<Pattern>>
where
    I: IntoIterator<Item = &'a String>,
{
    patterns
        .into_iter()
        .map(|p| {
            Pattern::new(p).map_err(|e| Error::InvalidPattern {
                pattern: p.clone(),
                reason: e.to_string(),
            })
        })
        .collect()
}

fn matches_any(patterns: &[Pattern], value: &str) -> bool {
    patterns.iter().any(|p| p.matches(value))
}

/// Match exact host tokens against the fleet, falling back to DNS in both
/// directions for tokens that do not name a known address.
fn match_exact(
    fleet: &HostSet,
    names: &BTreeSet<String>,
    resolver: &dyn Resolver,
) -> Result<HostSet> {
    let mut matched = fleet.filter(|h| names.contains(&h.address));
    let mut not_found: BTreeSet<String> = names
        .iter()
        .filter(|name| !matched.iter().any(|h| &h.address == *name))
        .cloned()
        .collect();

    // Tokens that are names of hosts registered by address.
    for name in not_found.clone() {
        match resolver.resolve(&name) {
            Ok(addrs) => {
                let ips: Vec<String> = addrs.iter().map(IpAddr::to_string).collect();
                debug!("{} --> {}", name, ips.join(","));
                let hits = fleet.filter(|h| ips.contains(&h.address));
                if !hits.is_empty() {
                    matched = matched.union(&hits);
                    not_found.remove(&name);
                }
            }
            Err(e) => warn!("Cannot resolve {}: {}", name, e),
        }
    }

    // Tokens that are addresses of hosts registered by name.
    if !not_found.is_empty() {
        for host in fleet.iter() {
            if not_found.is_empty() {
                break;
            }
            match resolver.resolve(&host.address) {
                Ok(addrs) => {
                    for ip in addrs {
                        let ip = ip.to_string();
                        debug!("{} --> {}", host.address, ip);
                        if not_found.remove(&ip) {
                            matched.insert(host.clone());
                        }
                    }
                }
                Err(e) => warn!("Cannot resolve {}: {}", host.address, e),
            }
        }
    }

    if !not_found.is_empty() {
        return Err(Error::UnknownHosts(not_found.into_iter().collect()));
    }
    Ok(matched)
}

/// Select the hosts matching `spec` out of `fleet`.
pub fn select(fleet: &HostSet, spec: &FilterSpec, resolver: &dyn Resolver) -> Result<Selection> {
    let (host_patterns, host_names) = sift_patterns(&spec.hosts);
    let mut selected = fleet.clone();

    if !host_patterns.is_empty() || !host_names.is_empty() {
        let mut host_filtered = if host_names.is_empty() {
            HostSet::new()
        } else {
            match_exact(fleet, &host_names, resolver)?
        };
        if !host_patterns.is_empty() {
            debug!("filtering host list with {:?} against host name", host_patterns);
            let patterns = compile(&host_patterns)?;
            host_filtered = host_filtered.union(&fleet.filter(|h| matches_any(&patterns, &h.address)));
        }
        selected = selected.intersection(&host_filtered);
    }

    if !spec.datacenters.is_empty() {
        debug!("filtering host list with {:?} against datacenter name", spec.datacenters);
        let patterns = compile(&spec.datacenters)?;
        selected = selected.intersection(&fleet.filter(|h| matches_any(&patterns, &h.datacenter)));
    }

    if !spec.clusters.is_empty() {
        debug!("filtering host list with {:?} against cluster name", spec.clusters);
        let patterns = compile(&spec.clusters)?;
        selected = selected.intersection(&fleet.filter(|h| matches_any(&patterns, &h.cluster.name)));
    }

    if spec.one_per_cluster {
        selected = one_host_per_cluster(&selected);
    }

    let full_fleet = !fleet.is_empty() && selected == *fleet;
    if full_fleet {
        warn!(
            "No filter narrowed the selection: logs will be collected from all {} hypervisors. \
             Use the -c, -d, -H filters to reduce the collection.",
            fleet.len()
        );
    }

    Ok(Selection {
        hosts: selected,
        full_fleet,
    })
}

/// Decide the hypervisor selection before anything is collected.
///
/// An unavailable inventory is logged and yields `None`, so the run goes on
/// without hypervisors. Selection errors are returned.
pub fn plan_selection(
    fleet: Result<HostSet>,
    spec: &FilterSpec,
    resolver: &dyn Resolver,
) -> Result<Option<Selection>> {
    match fleet {
        Ok(fleet) => select(&fleet, spec, resolver).map(Some),
        Err(e) => {
            error!("{}", e);
            error!("Hypervisor logs will not be collected");
            Ok(None)
        }
    }
}

/// Keep a single host per cluster, preferring the running SPM host.
pub fn one_host_per_cluster(hosts: &HostSet) -> HostSet {
    let mut chosen: BTreeMap<(String, String, String), HostRecord> = BTreeMap::new();
    for host in hosts.iter() {
        let key = (
            host.datacenter.clone(),
            host.cluster.id.clone(),
            host.cluster.name.clone(),
        );
        match chosen.entry(key) {
            Entry::Vacant(entry) => {
                entry.insert(host.clone());
            }
            Entry::Occupied(mut entry) => {
                if host.is_active_spm() && !entry.get().is_active_spm() {
                    entry.insert(host.clone());
                }
            }
        }
    }
    chosen.into_values().collect()
}
