/**
 * INVENTORY STORE - Durable snapshot of the device host fleet
 *
 * ROLE:
 * Loads the host map at startup and rewrites the whole snapshot after every
 * mutation. The document is an Ansible-style inventory so the same file can
 * be handed to the provisioning playbook.
 *
 * FORMAT:
 * ```yaml
 * all:
 *   hosts:
 *     bench-01:
 *       address: 10.0.0.5
 *       status: idle
 *       last_seen_epoch: 1760000000
 *       duts: { ... }
 *   children:            # only in externally-authored files
 *     lab-a:
 *       hosts:
 *         bench-02: { ansible_host: 10.0.1.7 }
 * ```
 *
 * Hosts from `all.hosts` and from every nested `children` group are flattened
 * into one map. Saving always writes the flat `all.hosts` form, through a
 * temp file + rename so a crash never leaves a half-written snapshot.
 */

use crate::models::{DutBlock, HostRecord, HostStatus, HostsMap};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, warn};

#[derive(Debug, thiserror::Error)]
pub enum InventoryError {
    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

#[derive(Debug, Clone)]
pub struct InventoryStore {
    path: PathBuf,
}

impl InventoryStore {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads the snapshot. A missing file is an empty fleet.
    pub async fn load(&self) -> Result<HostsMap, InventoryError> {
        if !self.path.exists() {
            debug!(path = %self.path.display(), "no inventory file, starting empty");
            return Ok(HostsMap::new());
        }
        let text = fs::read_to_string(&self.path).await.map_err(|source| InventoryError::Io {
            path: self.path.clone(),
            source,
        })?;
        parse_inventory(&text)
    }

    /// Rewrites the full snapshot.
    pub async fn save(&self, hosts: &HostsMap) -> Result<(), InventoryError> {
        let text = render_inventory(hosts)?;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await.map_err(|source| InventoryError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let tmp = self.tmp_path();
        fs::write(&tmp, text).await.map_err(|source| InventoryError::Io {
            path: tmp.clone(),
            source,
        })?;
        fs::rename(&tmp, &self.path).await.map_err(|source| InventoryError::Io {
            path: self.path.clone(),
            source,
        })?;
        debug!(path = %self.path.display(), hosts = hosts.len(), "inventory saved");
        Ok(())
    }

    fn tmp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "inventory.yml".into());
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

#[derive(Debug, Default, Deserialize)]
struct InventoryDoc {
    #[serde(default)]
    all: Option<Group>,
}

#[derive(Debug, Default, Deserialize)]
struct Group {
    #[serde(default)]
    hosts: Option<BTreeMap<String, serde_yaml::Value>>,
    #[serde(default)]
    children: Option<BTreeMap<String, Option<Group>>>,
}

/// Host variables as found in the document. Everything is optional because
/// external inventories usually carry only `ansible_host` (or nothing).
#[derive(Debug, Default, Deserialize)]
struct HostVars {
    address: Option<String>,
    ansible_host: Option<String>,
    status: Option<HostStatus>,
    last_seen_epoch: Option<i64>,
    duts: Option<DutBlock>,
    last_error: Option<String>,
}

#[derive(Serialize)]
struct SnapshotDoc<'a> {
    all: SnapshotGroup<'a>,
}

#[derive(Serialize)]
struct SnapshotGroup<'a> {
    hosts: &'a HostsMap,
}

pub fn parse_inventory(text: &str) -> Result<HostsMap, InventoryError> {
    if text.trim().is_empty() {
        return Ok(HostsMap::new());
    }
    let doc: Option<InventoryDoc> = serde_yaml::from_str(text)?;
    let mut hosts = HostsMap::new();
    if let Some(all) = doc.and_then(|d| d.all) {
        collect_group(&all, &mut hosts)?;
    }
    Ok(hosts)
}

fn collect_group(group: &Group, out: &mut HostsMap) -> Result<(), InventoryError> {
    for (hostname, value) in group.hosts.iter().flatten() {
        if out.contains_key(hostname) {
            warn!(host = %hostname, "host listed in several groups, keeping first entry");
            continue;
        }
        let vars: HostVars = if value.is_null() {
            HostVars::default()
        } else {
            serde_yaml::from_value(value.clone())?
        };
        out.insert(hostname.clone(), record_from_vars(hostname, vars));
    }
    for child in group.children.iter().flat_map(|c| c.values()).flatten() {
        collect_group(child, out)?;
    }
    Ok(())
}

fn record_from_vars(hostname: &str, vars: HostVars) -> HostRecord {
    let address = vars
        .address
        .or(vars.ansible_host)
        .unwrap_or_else(|| hostname.to_string());
    HostRecord {
        hostname: hostname.to_string(),
        address,
        status: vars.status.unwrap_or_default(),
        last_seen_epoch: vars.last_seen_epoch.unwrap_or(0),
        duts: vars.duts.unwrap_or_default(),
        last_error: vars.last_error,
    }
}

pub fn render_inventory(hosts: &HostsMap) -> Result<String, InventoryError> {
    Ok(serde_yaml::to_string(&SnapshotDoc {
        all: SnapshotGroup { hosts },
    })?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DutInfo, DutStatus};

    #[test]
    fn empty_document_is_empty_fleet() {
        assert!(parse_inventory("").unwrap().is_empty());
        assert!(parse_inventory("all:\n").unwrap().is_empty());
        assert!(parse_inventory("all:\n  hosts:\n").unwrap().is_empty());
    }

    #[test]
    fn nested_children_are_flattened() {
        let text = r#"
all:
  hosts:
    top:
      address: 10.0.0.1
      status: busy
  children:
    lab_a:
      hosts:
        bench-a1:
          ansible_host: 10.0.1.1
        bench-a2:
      children:
        rack_1:
          hosts:
            bench-r1: { address: 10.0.2.1, status: error, last_error: boom }
    empty_group:
"#;
        let hosts = parse_inventory(text).unwrap();
        assert_eq!(hosts.len(), 4);
        assert_eq!(hosts["top"].status, HostStatus::Busy);
        assert_eq!(hosts["bench-a1"].address, "10.0.1.1");
        assert_eq!(hosts["bench-a1"].status, HostStatus::Pending);
        // no vars at all: the hostname is the address
        assert_eq!(hosts["bench-a2"].address, "bench-a2");
        assert_eq!(hosts["bench-r1"].last_error.as_deref(), Some("boom"));
        assert_eq!(hosts["bench-r1"].hostname, "bench-r1");
    }

    #[test]
    fn first_listing_wins_on_duplicates() {
        let text = r#"
all:
  hosts:
    h1: { address: 1.1.1.1 }
  children:
    g:
      hosts:
        h1: { address: 2.2.2.2 }
"#;
        let hosts = parse_inventory(text).unwrap();
        assert_eq!(hosts["h1"].address, "1.1.1.1");
    }

    #[test]
    fn rendered_snapshot_reads_back() {
        let mut hosts = HostsMap::new();
        let mut rec = HostRecord::new("h1", "10.0.0.5");
        rec.status = HostStatus::Idle;
        rec.last_seen_epoch = 1_760_000_000;
        rec.duts = DutBlock::from_items(
            vec![DutInfo::new("SER1", "CC26x2", DutStatus::Running)],
            Vec::new(),
        );
        hosts.insert("h1".into(), rec);

        let text = render_inventory(&hosts).unwrap();
        assert!(text.starts_with("all:"));
        assert_eq!(parse_inventory(&text).unwrap(), hosts);
    }

    #[test]
    fn malformed_host_vars_are_an_error() {
        let text = "all:\n  hosts:\n    h1: { last_seen_epoch: soon }\n";
        assert!(matches!(parse_inventory(text), Err(InventoryError::Yaml(_))));
    }

    #[tokio::test]
    async fn save_then_load_uses_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = InventoryStore::new(dir.path().join("nested").join("inventory.yml"));
        assert!(store.load().await.unwrap().is_empty());

        let mut hosts = HostsMap::new();
        hosts.insert("h1".into(), HostRecord::new("h1", "10.0.0.5"));
        store.save(&hosts).await.unwrap();

        assert!(store.path().exists());
        assert!(!store.tmp_path().exists());
        assert_eq!(store.load().await.unwrap(), hosts);
    }
}
