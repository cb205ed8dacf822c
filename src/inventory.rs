//! Fleet inventory model.
//!
//! The inventory is a flat set of [`HostRecord`]s, each describing one
//! hypervisor together with the datacenter and cluster it belongs to. It is
//! produced fresh from an [`InventorySource`] on every run and never mutated
//! afterwards: filtering builds new [`HostSet`]s.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::hash::{Hash, Hasher};
use std::path::Path;
use tracing::debug;

use crate::error::{Error, Result};

/// Number of entries requested per inventory page.
pub const PAGE_SIZE: usize = 100;

/// Reference to the cluster a host belongs to.
///
/// Equality and hashing only consider the identity fields (`id`, `name`);
/// `gluster_enabled` is a capability flag carried along for collection.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClusterRef {
    /// Cluster identifier (empty for the placeholder cluster).
    pub id: String,
    /// Cluster name.
    pub name: String,
    /// Whether the gluster service is enabled on the cluster.
    pub gluster_enabled: bool,
}

impl ClusterRef {
    /// Create a new cluster reference.
    pub fn new(id: impl Into<String>, name: impl Into<String>, gluster_enabled: bool) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            gluster_enabled,
        }
    }
}

impl PartialEq for ClusterRef {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.name == other.name
    }
}

impl Eq for ClusterRef {}

impl Hash for ClusterRef {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
        self.name.hash(state);
    }
}

/// Identity of a host inside the fleet.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HostKey {
    pub datacenter: String,
    pub cluster_id: String,
    pub address: String,
}

/// One hypervisor as reported by the inventory.
///
/// Identity is `(datacenter, cluster id, address)`. The SPM and up flags are
/// attributes observed at fetch time and take no part in equality, so a host
/// whose status flips between observations stays a single set member.
#[derive(Debug, Clone)]
pub struct HostRecord {
    pub datacenter: String,
    pub cluster: ClusterRef,
    pub address: String,
    pub is_spm: bool,
    pub is_up: bool,
}

impl HostRecord {
    pub fn new(
        datacenter: impl Into<String>,
        cluster: ClusterRef,
        address: impl Into<String>,
        is_spm: bool,
        is_up: bool,
    ) -> Self {
        Self {
            datacenter: datacenter.into(),
            cluster,
            address: address.into(),
            is_spm,
            is_up,
        }
    }

    /// Compound identity key of this host.
    pub fn key(&self) -> HostKey {
        HostKey {
            datacenter: self.datacenter.clone(),
            cluster_id: self.cluster.id.clone(),
            address: self.address.clone(),
        }
    }

    /// Whether this host is the running storage pool manager.
    pub fn is_active_spm(&self) -> bool {
        self.is_spm && self.is_up
    }
}

impl PartialEq for HostRecord {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for HostRecord {}

impl Hash for HostRecord {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key().hash(state);
    }
}

impl PartialOrd for HostRecord {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HostRecord {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key().cmp(&other.key())
    }
}

/// A set of hosts keyed by [`HostKey`].
///
/// Iteration follows key order, which keeps "first seen" decisions and
/// listings deterministic.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostSet {
    hosts: BTreeMap<HostKey, HostRecord>,
}

impl HostSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a host, replacing the attributes of an existing host with the
    /// same identity. Returns `true` if the host was not present before.
    pub fn insert(&mut self, host: HostRecord) -> bool {
        self.hosts.insert(host.key(), host).is_none()
    }

    pub fn contains(&self, host: &HostRecord) -> bool {
        self.hosts.contains_key(&host.key())
    }

    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &HostRecord> {
        self.hosts.values()
    }

    /// Hosts present in either set. Attributes from `other` win on overlap.
    pub fn union(&self, other: &HostSet) -> HostSet {
        let mut result = self.clone();
        for host in other.iter() {
            result.insert(host.clone());
        }
        result
    }

    /// Hosts of `self` whose identity is also present in `other`.
    pub fn intersection(&self, other: &HostSet) -> HostSet {
        self.iter().filter(|h| other.contains(h)).cloned().collect()
    }

    /// Hosts of `self` matching `predicate`.
    pub fn filter<F>(&self, mut predicate: F) -> HostSet
    where
        F: FnMut(&HostRecord) -> bool,
    {
        self.iter().filter(|h| predicate(h)).cloned().collect()
    }

    /// Hosts sorted by address, as shown by the `list` command.
    pub fn sorted_by_address(&self) -> Vec<&HostRecord> {
        let mut hosts: Vec<&HostRecord> = self.iter().collect();
        hosts.sort_by(|a, b| a.address.cmp(&b.address));
        hosts
    }
}

impl FromIterator<HostRecord> for HostSet {
    fn from_iter<I: IntoIterator<Item = HostRecord>>(iter: I) -> Self {
        let mut set = HostSet::new();
        for host in iter {
            set.insert(host);
        }
        set
    }
}

impl IntoIterator for HostSet {
    type Item = HostRecord;
    type IntoIter = std::collections::btree_map::IntoValues<HostKey, HostRecord>;

    fn into_iter(self) -> Self::IntoIter {
        self.hosts.into_values()
    }
}

/// Datacenter entry as listed by the inventory source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataCenterEntry {
    pub id: String,
    pub name: String,
}

/// Cluster entry as listed by the inventory source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterEntry {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub gluster_enabled: bool,
    /// Identifier of the owning datacenter, if any.
    #[serde(default)]
    pub datacenter: Option<String>,
}

/// Host entry as listed by the inventory source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostEntry {
    pub address: String,
    #[serde(default)]
    pub name: Option<String>,
    /// Identifier of the owning cluster, if any.
    #[serde(default)]
    pub cluster: Option<String>,
    #[serde(default)]
    pub spm: bool,
    #[serde(default)]
    pub up: bool,
}

/// A paginated source of fleet topology.
///
/// Pages are numbered from 1. An empty page marks the end of a listing.
pub trait InventorySource {
    fn datacenters(&self, page: usize, page_size: usize) -> Result<Vec<DataCenterEntry>>;
    fn clusters(&self, page: usize, page_size: usize) -> Result<Vec<ClusterEntry>>;
    fn hosts(&self, page: usize, page_size: usize) -> Result<Vec<HostEntry>>;
}

/// Fetch every page of a listing.
pub fn paginate<T, F>(mut fetch: F) -> Result<Vec<T>>
where
    F: FnMut(usize, usize) -> Result<Vec<T>>,
{
    let mut all = Vec::new();
    let mut page = 1;
    loop {
        let batch = fetch(page, PAGE_SIZE)?;
        if batch.is_empty() {
            break;
        }
        all.extend(batch);
        page += 1;
    }
    Ok(all)
}

/// Build the fleet host set from an inventory source.
///
/// Clusters without a known datacenter are placed under a placeholder
/// datacenter with an empty name; hosts without a cluster are placed under a
/// placeholder cluster inside that datacenter.
pub fn fetch_fleet(source: &dyn InventorySource) -> Result<HostSet> {
    let datacenters: HashMap<String, String> =
        paginate(|page, size| source.datacenters(page, size))?
            .into_iter()
            .map(|dc| (dc.id, dc.name))
            .collect();

    let mut clusters: HashMap<String, (String, ClusterRef)> = HashMap::new();
    for cluster in paginate(|page, size| source.clusters(page, size))? {
        let datacenter = match &cluster.datacenter {
            Some(id) => match datacenters.get(id) {
                Some(name) => name.clone(),
                None => {
                    debug!(
                        "cluster {} references unknown datacenter {}",
                        cluster.name, id
                    );
                    String::new()
                }
            },
            None => String::new(),
        };
        let reference = ClusterRef::new(&cluster.id, &cluster.name, cluster.gluster_enabled);
        clusters.insert(cluster.id, (datacenter, reference));
    }

    let mut fleet = HostSet::new();
    for host in paginate(|page, size| source.hosts(page, size))? {
        let (datacenter, cluster) = host
            .cluster
            .as_ref()
            .and_then(|id| clusters.get(id))
            .cloned()
            .unwrap_or_default();
        fleet.insert(HostRecord::new(
            datacenter,
            cluster,
            host.address,
            host.spm,
            host.up,
        ));
    }

    debug!("fetched {} hosts from inventory", fleet.len());
    Ok(fleet)
}

/// Inventory snapshot stored as a JSON document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FileInventory {
    #[serde(default)]
    pub datacenters: Vec<DataCenterEntry>,
    #[serde(default)]
    pub clusters: Vec<ClusterEntry>,
    #[serde(default)]
    pub hosts: Vec<HostEntry>,
}

impl FileInventory {
    /// Load a snapshot from disk.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Inventory(format!("cannot read {}: {}", path.display(), e))
        })?;
        serde_json::from_str(&content)
            .map_err(|e| Error::Inventory(format!("cannot parse {}: {}", path.display(), e)))
    }
}

fn page_of<T: Clone>(items: &[T], page: usize, page_size: usize) -> Vec<T> {
    let start = page.saturating_sub(1).saturating_mul(page_size);
    items.iter().skip(start).take(page_size).cloned().collect()
}

impl InventorySource for FileInventory {
    fn datacenters(&self, page: usize, page_size: usize) -> Result<Vec<DataCenterEntry>> {
        Ok(page_of(&self.datacenters, page, page_size))
    }

    fn clusters(&self, page: usize, page_size: usize) -> Result<Vec<ClusterEntry>> {
        Ok(page_of(&self.clusters, page, page_size))
    }

    fn hosts(&self, page: usize, page_size: usize) -> Result<Vec<HostEntry>> {
        Ok(page_of(&self.hosts, page, page_size))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cluster_a() -> ClusterRef {
        ClusterRef::new("c1", "clusterA", false)
    }

    #[test]
    fn test_flags_do_not_split_identity() {
        let mut set = HostSet::new();
        assert!(set.insert(HostRecord::new("dc1", cluster_a(), "h1", true, true)));
        assert!(!set.insert(HostRecord::new("dc1", cluster_a(), "h1", false, false)));

        assert_eq!(set.len(), 1);
        let host = set.iter().next().unwrap();
        assert!(!host.is_spm);
        assert!(!host.is_up);
    }

    #[test]
    fn test_same_address_in_two_clusters_is_two_hosts() {
        let other = ClusterRef::new("c2", "clusterB", false);
        let set: HostSet = vec![
            HostRecord::new("dc1", cluster_a(), "h1", false, true),
            HostRecord::new("dc1", other, "h1", false, true),
        ]
        .into_iter()
        .collect();
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_cluster_identity_ignores_gluster_flag() {
        assert_eq!(
            ClusterRef::new("c1", "clusterA", true),
            ClusterRef::new("c1", "clusterA", false)
        );
    }

    #[test]
    fn test_intersection_keeps_left_attributes() {
        let left: HostSet = vec![HostRecord::new("dc1", cluster_a(), "h1", true, true)]
            .into_iter()
            .collect();
        let right: HostSet = vec![
            HostRecord::new("dc1", cluster_a(), "h1", false, false),
            HostRecord::new("dc1", cluster_a(), "h2", false, true),
        ]
        .into_iter()
        .collect();

        let both = left.intersection(&right);
        assert_eq!(both.len(), 1);
        assert!(both.iter().next().unwrap().is_spm);
    }

    #[test]
    fn test_paginate_stops_on_empty_page() {
        let items: Vec<usize> = (0..250).collect();
        let mut calls = 0;
        let all = paginate(|page, size| {
            calls += 1;
            Ok(page_of(&items, page, size))
        })
        .unwrap();
        assert_eq!(all.len(), 250);
        assert_eq!(calls, 4);
    }

    #[test]
    fn test_fetch_fleet_places_orphans_under_placeholders() {
        let inventory = FileInventory {
            datacenters: vec![DataCenterEntry {
                id: "d1".into(),
                name: "dc1".into(),
            }],
            clusters: vec![
                ClusterEntry {
                    id: "c1".into(),
                    name: "clusterA".into(),
                    gluster_enabled: true,
                    datacenter: Some("d1".into()),
                },
                ClusterEntry {
                    id: "c2".into(),
                    name: "loose".into(),
                    gluster_enabled: false,
                    datacenter: None,
                },
            ],
            hosts: vec![
                HostEntry {
                    address: "h1".into(),
                    name: None,
                    cluster: Some("c1".into()),
                    spm: true,
                    up: true,
                },
                HostEntry {
                    address: "h2".into(),
                    name: None,
                    cluster: Some("c2".into()),
                    spm: false,
                    up: true,
                },
                HostEntry {
                    address: "h3".into(),
                    name: None,
                    cluster: None,
                    spm: false,
                    up: false,
                },
            ],
        };

        let fleet = fetch_fleet(&inventory).unwrap();
        assert_eq!(fleet.len(), 3);

        let by_address: HashMap<&str, &HostRecord> =
            fleet.iter().map(|h| (h.address.as_str(), h)).collect();
        assert_eq!(by_address["h1"].datacenter, "dc1");
        assert!(by_address["h1"].cluster.gluster_enabled);
        assert!(by_address["h1"].is_active_spm());
        assert_eq!(by_address["h2"].datacenter, "");
        assert_eq!(by_address["h2"].cluster.name, "loose");
        assert_eq!(by_address["h3"].datacenter, "");
        assert_eq!(by_address["h3"].cluster.name, "");
    }

    #[test]
    fn test_file_inventory_parses_defaults() {
        let json = r#"{
            "datacenters": [{"id": "d1", "name": "dc1"}],
            "clusters": [{"id": "c1", "name": "clusterA", "datacenter": "d1"}],
            "hosts": [{"address": "10.0.0.1", "cluster": "c1", "up": true}]
        }"#;
        let inventory: FileInventory = serde_json::from_str(json).unwrap();
        assert!(!inventory.clusters[0].gluster_enabled);
        assert!(!inventory.hosts[0].spm);
        assert!(inventory.hosts[0].up);
    }
}
