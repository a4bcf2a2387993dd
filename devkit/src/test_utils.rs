/*!
Test harness for lnt-core

Wires a real `DeviceManager` (HTTP agent client included) to an inventory
file inside a temporary directory, with a provisioner that only records
calls.
*/

use anyhow::Result;
use async_trait::async_trait;
use lnt_core::devices::{DeviceManager, SharedDeviceManager};
use lnt_core::inventory::InventoryStore;
use lnt_core::provisioner::{ProvisionError, Provisioner};
use lnt_core::reconciler::HttpAgentClient;
use lnt_core::runs::TestRunConfig;
use parking_lot::Mutex;
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

/// Provisioner double: succeeds or fails on demand, optionally after a delay.
#[derive(Clone, Default)]
pub struct StubProvisioner {
    calls: Arc<Mutex<Vec<(String, String)>>>,
    failure: Option<String>,
    delay: Duration,
}

impl StubProvisioner {
    pub fn succeeding() -> Self {
        Self::default()
    }

    pub fn failing(stderr: &str) -> Self {
        Self {
            failure: Some(stderr.to_string()),
            ..Self::default()
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// `(hostname, address)` per call, in call order.
    pub fn calls(&self) -> Vec<(String, String)> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl Provisioner for StubProvisioner {
    async fn provision(&self, hostname: &str, address: &str) -> Result<String, ProvisionError> {
        self.calls.lock().push((hostname.to_string(), address.to_string()));
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        match &self.failure {
            Some(stderr) => Err(ProvisionError::Failed {
                code: Some(2),
                stderr: stderr.clone(),
            }),
            None => Ok(format!("{hostname}: ok=1 changed=0 failed=0")),
        }
    }
}

pub struct TestHarness {
    pub devices: SharedDeviceManager,
    pub provisioner: StubProvisioner,
    pub inventory_path: PathBuf,
    // keeps the directory alive
    _dir: TempDir,
}

impl TestHarness {
    /// Agent timeout of one second, succeeding provisioner.
    pub fn new() -> Result<Self> {
        Self::build(StubProvisioner::succeeding(), Duration::from_secs(1), None)
    }

    pub fn with_provisioner(provisioner: StubProvisioner) -> Result<Self> {
        Self::build(provisioner, Duration::from_secs(1), None)
    }

    pub fn with_agent_timeout(timeout: Duration) -> Result<Self> {
        Self::build(StubProvisioner::succeeding(), timeout, None)
    }

    /// Starts from an inventory file written with `yaml` before loading.
    pub async fn with_inventory(yaml: &str) -> Result<Self> {
        let harness = Self::build(StubProvisioner::succeeding(), Duration::from_secs(1), Some(yaml))?;
        harness.devices.load_hosts().await?;
        Ok(harness)
    }

    fn build(provisioner: StubProvisioner, agent_timeout: Duration, seed: Option<&str>) -> Result<Self> {
        let dir = tempfile::tempdir()?;
        let inventory_path = dir.path().join("inventory.yml");
        if let Some(yaml) = seed {
            std::fs::write(&inventory_path, yaml)?;
        }

        let devices = DeviceManager::new(
            InventoryStore::new(&inventory_path),
            Arc::new(HttpAgentClient::new(8081, agent_timeout)),
            Arc::new(provisioner.clone()),
        )
        .with_workers(4);

        Ok(Self {
            devices: Arc::new(devices),
            provisioner,
            inventory_path,
            _dir: dir,
        })
    }

    /// Fresh store over the same file, to check what was persisted.
    pub fn reopen_store(&self) -> InventoryStore {
        InventoryStore::new(&self.inventory_path)
    }
}

/// Run configuration touching two hosts, with a 1h30m duration.
pub fn sample_run_config() -> TestRunConfig {
    let value = json!({
        "description": "nightly regression",
        "test_duration": "1h 30m",
        "device_hosts": ["bench-01"],
        "firmware_images": {"bench-02": {"dut-1": "/fw/image.bin"}},
        "serial_logs": {"bench-01": {"ttyUSB0": "/logs/bench-01-ttyUSB0.log"}}
    });
    serde_json::from_value(value).unwrap_or_default()
}
