/**
 * DEVICE INVENTORY MANAGER - Fleet of device hosts and their DUTs
 *
 * ROLE:
 * Public API over the inventory store, the host reconciler and the
 * provisioning collaborator: add/remove/list hosts, refresh their status from
 * their agents, aggregate stats.
 *
 * LOCKING:
 * - `hosts`: one async mutex over the in-memory map, held only for the
 *   mutation + snapshot write. Never held across agent calls or provisioning.
 * - `host_locks`: one FIFO async mutex per hostname. Refresh, add and remove
 *   of the same hostname queue on it, so a slow refresh can never overwrite a
 *   later one and never interleaves with add/remove of that host. Different
 *   hosts proceed in parallel. An entry is dropped once its host is gone and
 *   nobody else holds it, so the map never outgrows the fleet.
 *
 * ERRORS:
 * Only `HostNotFound`, `DuplicateHost`, `InvalidHost` and storage failures
 * reach callers. Agent failures become `disconnected`, provisioning failures
 * become `error` with the diagnostic kept in `last_error`.
 */

use crate::clock::{system_clock, SharedClock};
use crate::inventory::{InventoryError, InventoryStore};
use crate::models::{HostRecord, HostStatus, HostsMap, InventoryStats};
use crate::provisioner::Provisioner;
use crate::reconciler::{self, AgentApi, HostReconciler};
use crate::state::{new_state, Shared};
use futures::stream::{self, StreamExt};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

pub const DEFAULT_PROVISION_TIMEOUT: Duration = Duration::from_secs(300);
pub const DEFAULT_WORKERS: usize = 8;

#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    #[error("Host not found: {0}")]
    HostNotFound(String),
    #[error("Host already exists: {0}")]
    DuplicateHost(String),
    #[error("Invalid host: {0}")]
    InvalidHost(String),
    #[error("Inventory error: {0}")]
    Inventory(#[from] InventoryError),
}

pub struct DeviceManager {
    hosts: AsyncMutex<HostsMap>,
    store: InventoryStore,
    reconciler: HostReconciler,
    provisioner: Arc<dyn Provisioner>,
    clock: SharedClock,
    host_locks: Shared<HashMap<String, Arc<AsyncMutex<()>>>>,
    workers: usize,
    provision_timeout: Duration,
}

pub type SharedDeviceManager = Arc<DeviceManager>;

impl DeviceManager {
    pub fn new(store: InventoryStore, agent: Arc<dyn AgentApi>, provisioner: Arc<dyn Provisioner>) -> Self {
        Self {
            hosts: AsyncMutex::new(HostsMap::new()),
            store,
            reconciler: HostReconciler::new(agent),
            provisioner,
            clock: system_clock(),
            host_locks: new_state(HashMap::new()),
            workers: DEFAULT_WORKERS,
            provision_timeout: DEFAULT_PROVISION_TIMEOUT,
        }
    }

    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn with_provision_timeout(mut self, timeout: Duration) -> Self {
        self.provision_timeout = timeout;
        self
    }

    /// Replaces the in-memory fleet with the stored snapshot.
    pub async fn load_hosts(&self) -> Result<usize, DeviceError> {
        let loaded = self.store.load().await?;
        let count = loaded.len();
        *self.hosts.lock().await = loaded;
        info!(count, path = %self.store.path().display(), "inventory loaded");
        Ok(count)
    }

    pub async fn list_hosts(&self) -> HostsMap {
        self.hosts.lock().await.clone()
    }

    pub async fn get_host(&self, hostname: &str) -> Result<HostRecord, DeviceError> {
        self.hosts
            .lock()
            .await
            .get(hostname)
            .cloned()
            .ok_or_else(|| DeviceError::HostNotFound(hostname.to_string()))
    }

    /// Records the host as `pending`, provisions it, then settles it on
    /// `idle` or `error`. Duplicates are rejected.
    pub async fn add_host(&self, hostname: &str, address: &str) -> Result<HostRecord, DeviceError> {
        let hostname = hostname.trim();
        let address = address.trim();
        if hostname.is_empty() || hostname.chars().any(char::is_whitespace) {
            return Err(DeviceError::InvalidHost(format!("bad hostname '{hostname}'")));
        }
        if address.is_empty() {
            return Err(DeviceError::InvalidHost(format!("empty address for {hostname}")));
        }

        let lock = self.host_lock(hostname);
        let result = {
            let _serial = lock.lock().await;
            self.add_locked(hostname, address).await
        };
        self.release_host_lock(hostname, lock).await;
        result
    }

    async fn add_locked(&self, hostname: &str, address: &str) -> Result<HostRecord, DeviceError> {
        {
            let mut hosts = self.hosts.lock().await;
            if hosts.contains_key(hostname) {
                return Err(DeviceError::DuplicateHost(hostname.to_string()));
            }
            hosts.insert(hostname.to_string(), HostRecord::new(hostname, address));
            if let Err(e) = self.store.save(&hosts).await {
                hosts.remove(hostname);
                return Err(e.into());
            }
        }
        info!(host = %hostname, %address, "host added");

        self.update_record(hostname, |r| r.status = HostStatus::Provisioning).await?;

        let outcome = tokio::time::timeout(
            self.provision_timeout,
            self.provisioner.provision(hostname, address),
        )
        .await;

        let (status, last_error) = match outcome {
            Ok(Ok(_)) => {
                info!(host = %hostname, "provisioning succeeded");
                (HostStatus::Idle, None)
            }
            Ok(Err(e)) => {
                error!(host = %hostname, error = %e, "provisioning failed");
                (HostStatus::Error, Some(e.to_string()))
            }
            Err(_) => {
                let msg = format!(
                    "provisioning timed out after {}s",
                    self.provision_timeout.as_secs()
                );
                error!(host = %hostname, "{msg}");
                (HostStatus::Error, Some(msg))
            }
        };

        self.update_record(hostname, |r| {
            r.status = status;
            r.last_error = last_error;
        })
        .await
    }

    /// `Ok(true)` when the host existed and the snapshot was rewritten.
    pub async fn remove_host(&self, hostname: &str) -> Result<bool, DeviceError> {
        let lock = self.host_lock(hostname);
        let result = {
            let _serial = lock.lock().await;
            self.remove_locked(hostname).await
        };
        self.release_host_lock(hostname, lock).await;
        result
    }

    async fn remove_locked(&self, hostname: &str) -> Result<bool, DeviceError> {
        let mut hosts = self.hosts.lock().await;
        let Some(removed) = hosts.remove(hostname) else {
            return Ok(false);
        };
        if let Err(e) = self.store.save(&hosts).await {
            hosts.insert(hostname.to_string(), removed);
            return Err(e.into());
        }
        info!(host = %hostname, "host removed");
        Ok(true)
    }

    /// Polls the host's agent and stores the outcome. An unreachable agent
    /// is a `disconnected` record, not an error.
    pub async fn refresh_host_status(&self, hostname: &str) -> Result<HostRecord, DeviceError> {
        let lock = self.host_lock(hostname);
        let result = {
            let _serial = lock.lock().await;
            self.refresh_locked(hostname).await
        };
        self.release_host_lock(hostname, lock).await;
        result
    }

    async fn refresh_locked(&self, hostname: &str) -> Result<HostRecord, DeviceError> {
        let address = self.get_host(hostname).await?.address;
        let observation = self.reconciler.observe(&address).await;
        let now = self.clock.now().unix_timestamp();

        let mut hosts = self.hosts.lock().await;
        let record = hosts
            .get_mut(hostname)
            .ok_or_else(|| DeviceError::HostNotFound(hostname.to_string()))?;
        reconciler::apply(record, observation, now);
        let snapshot = record.clone();

        // the refreshed record stays in memory even if the write fails
        if let Err(e) = self.store.save(&hosts).await {
            warn!(host = %hostname, error = %e, "failed to persist refreshed status");
        }
        debug!(host = %hostname, status = snapshot.status.as_str(), duts = snapshot.duts.count(), "host refreshed");
        Ok(snapshot)
    }

    /// Refreshes every known host, at most `workers` at a time.
    pub async fn refresh_all_statuses(&self) -> HostsMap {
        let names: Vec<String> = self.hosts.lock().await.keys().cloned().collect();

        let results: Vec<(String, Result<HostRecord, DeviceError>)> = stream::iter(names)
            .map(|name| self.refresh_named(name))
            .buffer_unordered(self.workers)
            .collect()
            .await;

        let mut refreshed = HostsMap::new();
        for (name, result) in results {
            match result {
                Ok(record) => {
                    refreshed.insert(name, record);
                }
                // removed while the pass was running
                Err(DeviceError::HostNotFound(_)) => {}
                Err(e) => warn!(host = %name, error = %e, "refresh failed"),
            }
        }
        refreshed
    }

    pub async fn inventory_stats(&self) -> InventoryStats {
        InventoryStats::from_hosts(&*self.hosts.lock().await)
    }

    /// Background reconciliation: a full refresh every `interval`.
    pub fn start_reconcile_loop(manager: SharedDeviceManager, interval: Duration) -> JoinHandle<()> {
        info!(interval_secs = interval.as_secs(), "starting host reconciliation loop");
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let refreshed = manager.refresh_all_statuses().await;
                let disconnected = refreshed
                    .values()
                    .filter(|r| r.status == HostStatus::Disconnected)
                    .count();
                debug!(hosts = refreshed.len(), disconnected, "reconciliation pass done");
            }
        })
    }

    async fn refresh_named(&self, hostname: String) -> (String, Result<HostRecord, DeviceError>) {
        let result = self.refresh_host_status(&hostname).await;
        (hostname, result)
    }

    fn host_lock(&self, hostname: &str) -> Arc<AsyncMutex<()>> {
        self.host_locks
            .lock()
            .entry(hostname.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    /// Drops the per-host lock entry when the host is gone and `lock` is the
    /// last handle besides the map's own.
    async fn release_host_lock(&self, hostname: &str, lock: Arc<AsyncMutex<()>>) {
        if self.hosts.lock().await.contains_key(hostname) {
            return;
        }
        let mut locks = self.host_locks.lock();
        if Arc::strong_count(&lock) == 2 {
            locks.remove(hostname);
        }
    }

    #[cfg(test)]
    fn lock_entries(&self) -> usize {
        self.host_locks.lock().len()
    }

    /// Applies `mutate` and persists. On a failed write the in-memory record
    /// is put back as it was.
    async fn update_record<F>(&self, hostname: &str, mutate: F) -> Result<HostRecord, DeviceError>
    where
        F: FnOnce(&mut HostRecord),
    {
        let mut hosts = self.hosts.lock().await;
        let record = hosts
            .get_mut(hostname)
            .ok_or_else(|| DeviceError::HostNotFound(hostname.to_string()))?;
        let previous = record.clone();
        mutate(record);
        let snapshot = record.clone();
        if let Err(e) = self.store.save(&hosts).await {
            hosts.insert(hostname.to_string(), previous);
            return Err(e.into());
        }
        Ok(snapshot)
    }
}
