//! Host and DUT records shared by the inventory store, the reconciler and the
//! device manager.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Lifecycle state of a device host as seen by the core.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HostStatus {
    /// Recorded, provisioning not started yet
    #[default]
    Pending,
    Provisioning,
    Idle,
    Busy,
    /// Last reconciliation could not reach the agent
    Disconnected,
    /// Provisioning failed; see `last_error`
    Error,
}

impl HostStatus {
    pub const ALL: [HostStatus; 6] = [
        HostStatus::Pending,
        HostStatus::Provisioning,
        HostStatus::Idle,
        HostStatus::Busy,
        HostStatus::Disconnected,
        HostStatus::Error,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            HostStatus::Pending => "pending",
            HostStatus::Provisioning => "provisioning",
            HostStatus::Idle => "idle",
            HostStatus::Busy => "busy",
            HostStatus::Disconnected => "disconnected",
            HostStatus::Error => "error",
        }
    }

    /// Status reported by an agent's `/health`. Agents only speak for
    /// `idle`/`busy`; anything else, including a missing value, is `idle`.
    pub fn from_agent_health(raw: Option<&str>) -> Self {
        match raw.map(|s| s.trim().to_ascii_lowercase()).as_deref() {
            Some("busy") => HostStatus::Busy,
            _ => HostStatus::Idle,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DutStatus {
    Running,
    #[default]
    Idle,
    Offline,
}

impl DutStatus {
    pub const ALL: [DutStatus; 3] = [DutStatus::Running, DutStatus::Idle, DutStatus::Offline];

    /// Lenient parse: unknown or missing values become `idle`.
    pub fn normalize(raw: Option<&str>) -> Self {
        match raw.map(|s| s.trim().to_ascii_lowercase()).as_deref() {
            Some("running") => DutStatus::Running,
            Some("offline") => DutStatus::Offline,
            _ => DutStatus::Idle,
        }
    }

    pub fn color(self) -> DutColor {
        match self {
            DutStatus::Running => DutColor::Green,
            DutStatus::Idle => DutColor::Yellow,
            DutStatus::Offline => DutColor::Red,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DutColor {
    Green,
    Yellow,
    Red,
}

/// One device under test attached to a host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "StoredDut")]
pub struct DutInfo {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub status: DutStatus,
    /// Always `status.color()`
    pub color: DutColor,
}

impl DutInfo {
    pub fn new(id: impl Into<String>, kind: impl Into<String>, status: DutStatus) -> Self {
        Self {
            id: id.into(),
            kind: kind.into(),
            status,
            color: status.color(),
        }
    }
}

// Persisted shape: the color is derived again on load.
#[derive(Deserialize)]
struct StoredDut {
    #[serde(default)]
    id: String,
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    status: Option<String>,
}

impl From<StoredDut> for DutInfo {
    fn from(stored: StoredDut) -> Self {
        DutInfo::new(stored.id, stored.kind, DutStatus::normalize(stored.status.as_deref()))
    }
}

/// Canonical DUT block of a host.
///
/// Only buildable through [`DutBlock::from_items`], which keeps
/// `count == items.len()` and `sum(status_counts) == count`. Deserialization
/// goes through the same constructor, so hand-edited snapshots cannot break
/// the invariant either.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "StoredDutBlock")]
pub struct DutBlock {
    count: usize,
    types: BTreeSet<String>,
    items: Vec<DutInfo>,
    status_counts: BTreeMap<DutStatus, usize>,
}

impl DutBlock {
    /// Builds the block from normalized items. `extra_types` are merged into
    /// the type set (the legacy summary shape lists types on its own).
    pub fn from_items<I>(items: Vec<DutInfo>, extra_types: I) -> Self
    where
        I: IntoIterator<Item = String>,
    {
        let mut status_counts: BTreeMap<DutStatus, usize> =
            DutStatus::ALL.iter().map(|s| (*s, 0)).collect();
        for item in &items {
            *status_counts.entry(item.status).or_insert(0) += 1;
        }

        let types = items
            .iter()
            .map(|i| i.kind.trim().to_string())
            .chain(extra_types.into_iter().map(|t| t.trim().to_string()))
            .filter(|t| !t.is_empty())
            .collect();

        Self {
            count: items.len(),
            types,
            items,
            status_counts,
        }
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn types(&self) -> &BTreeSet<String> {
        &self.types
    }

    pub fn items(&self) -> &[DutInfo] {
        &self.items
    }

    pub fn status_counts(&self) -> &BTreeMap<DutStatus, usize> {
        &self.status_counts
    }

    pub fn count_of(&self, status: DutStatus) -> usize {
        self.status_counts.get(&status).copied().unwrap_or(0)
    }
}

impl Default for DutBlock {
    fn default() -> Self {
        DutBlock::from_items(Vec::new(), Vec::new())
    }
}

#[derive(Deserialize)]
struct StoredDutBlock {
    #[serde(default)]
    types: Vec<String>,
    #[serde(default)]
    items: Vec<DutInfo>,
}

impl From<StoredDutBlock> for DutBlock {
    fn from(stored: StoredDutBlock) -> Self {
        DutBlock::from_items(stored.items, stored.types)
    }
}

/// Inventory entry for one device host. The hostname is the inventory key;
/// it is repeated here so API callers get self-describing records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostRecord {
    pub hostname: String,
    pub address: String,
    pub status: HostStatus,
    /// Unix seconds of the last reconciliation attempt, 0 if never polled
    pub last_seen_epoch: i64,
    pub duts: DutBlock,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl HostRecord {
    pub fn new(hostname: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
            address: address.into(),
            status: HostStatus::Pending,
            last_seen_epoch: 0,
            duts: DutBlock::default(),
            last_error: None,
        }
    }
}

pub type HostsMap = BTreeMap<String, HostRecord>;

/// Aggregate view over the inventory, served by `/health` and `/device/stats`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InventoryStats {
    pub host_count: usize,
    /// Every host status is present, zero included
    pub status_counts: BTreeMap<HostStatus, usize>,
    pub total_duts: usize,
}

impl InventoryStats {
    pub fn from_hosts(hosts: &HostsMap) -> Self {
        let mut status_counts: BTreeMap<HostStatus, usize> =
            HostStatus::ALL.iter().map(|s| (*s, 0)).collect();
        let mut total_duts = 0;
        for record in hosts.values() {
            *status_counts.entry(record.status).or_insert(0) += 1;
            total_duts += record.duts.count();
        }
        Self {
            host_count: hosts.len(),
            status_counts,
            total_duts,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dut_status_is_lenient() {
        assert_eq!(DutStatus::normalize(Some("RUNNING")), DutStatus::Running);
        assert_eq!(DutStatus::normalize(Some(" offline ")), DutStatus::Offline);
        assert_eq!(DutStatus::normalize(Some("flashing")), DutStatus::Idle);
        assert_eq!(DutStatus::normalize(None), DutStatus::Idle);
    }

    #[test]
    fn agent_health_defaults_to_idle() {
        assert_eq!(HostStatus::from_agent_health(Some("busy")), HostStatus::Busy);
        assert_eq!(HostStatus::from_agent_health(Some("idle")), HostStatus::Idle);
        assert_eq!(HostStatus::from_agent_health(Some("exploded")), HostStatus::Idle);
        assert_eq!(HostStatus::from_agent_health(None), HostStatus::Idle);
    }

    #[test]
    fn empty_block_has_all_status_keys() {
        let block = DutBlock::default();
        assert_eq!(block.count(), 0);
        assert_eq!(block.status_counts().len(), 3);
        assert!(block.status_counts().values().all(|c| *c == 0));
    }

    #[test]
    fn block_counts_and_types() {
        let block = DutBlock::from_items(
            vec![
                DutInfo::new("a", "CC26x2", DutStatus::Running),
                DutInfo::new("b", "nRF52", DutStatus::Offline),
                DutInfo::new("c", "CC26x2", DutStatus::Running),
            ],
            vec!["".to_string()],
        );
        assert_eq!(block.count(), 3);
        assert_eq!(block.count_of(DutStatus::Running), 2);
        assert_eq!(block.count_of(DutStatus::Idle), 0);
        assert_eq!(block.status_counts().values().sum::<usize>(), block.count());
        let types: Vec<_> = block.types().iter().cloned().collect();
        assert_eq!(types, vec!["CC26x2".to_string(), "nRF52".to_string()]);
    }

    #[test]
    fn stored_block_is_renormalized() {
        // count and colors in the document are stale on purpose
        let yaml = r#"
count: 7
types: [legacy]
items:
  - { id: a, type: X, status: running, color: red }
  - { id: b, status: weird }
status_counts: { running: 5 }
"#;
        let block: DutBlock = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(block.count(), 2);
        assert_eq!(block.items()[0].color, DutColor::Green);
        assert_eq!(block.items()[1].status, DutStatus::Idle);
        assert_eq!(block.count_of(DutStatus::Running), 1);
        assert!(block.types().contains("legacy"));
    }

    #[test]
    fn stats_cover_every_status() {
        let mut hosts = HostsMap::new();
        let mut h1 = HostRecord::new("h1", "10.0.0.1");
        h1.status = HostStatus::Idle;
        h1.duts = DutBlock::from_items(vec![DutInfo::new("d", "", DutStatus::Idle)], Vec::new());
        hosts.insert("h1".into(), h1);
        hosts.insert("h2".into(), HostRecord::new("h2", "10.0.0.2"));

        let stats = InventoryStats::from_hosts(&hosts);
        assert_eq!(stats.host_count, 2);
        assert_eq!(stats.total_duts, 1);
        assert_eq!(stats.status_counts.len(), 6);
        assert_eq!(stats.status_counts[&HostStatus::Idle], 1);
        assert_eq!(stats.status_counts[&HostStatus::Pending], 1);
        assert_eq!(stats.status_counts[&HostStatus::Error], 0);
    }

    #[test]
    fn stats_serialize_with_lowercase_keys() {
        let stats = InventoryStats::from_hosts(&HostsMap::new());
        let json = serde_json::to_value(&stats).unwrap();
        assert_eq!(json["status_counts"]["disconnected"], 0);
        assert_eq!(json["host_count"], 0);
    }
}
