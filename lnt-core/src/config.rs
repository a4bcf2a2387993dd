use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{info, warn};

use crate::reconciler::{DEFAULT_AGENT_PORT, DEFAULT_AGENT_TIMEOUT};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    pub server: ServerConf,
    pub inventory: InventoryConf,
    pub agent: AgentConf,
    pub provisioning: ProvisioningConf,
    pub reconcile: ReconcileConf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConf {
    pub bind: String,
    /// Origins allowed by CORS; empty or "*" allows any
    pub cors_origins: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InventoryConf {
    pub path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConf {
    pub port: u16,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvisioningConf {
    pub enabled: bool,
    pub program: String,
    pub playbook: PathBuf,
    pub timeout_secs: u64,
    pub extra_args: Vec<String>, // ex: ["--ssh-extra-args", "-o StrictHostKeyChecking=no"]
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcileConf {
    /// Hosts polled concurrently by a full refresh
    pub workers: usize,
    /// Period of the background refresh, 0 disables it
    pub interval_secs: u64,
}

impl Default for ServerConf {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:8000".into(),
            cors_origins: vec!["*".into()],
        }
    }
}

impl Default for InventoryConf {
    fn default() -> Self {
        Self { path: PathBuf::from("./data/inventory.yml") }
    }
}

impl Default for AgentConf {
    fn default() -> Self {
        Self {
            port: DEFAULT_AGENT_PORT,
            timeout_secs: DEFAULT_AGENT_TIMEOUT.as_secs(),
        }
    }
}

impl Default for ProvisioningConf {
    fn default() -> Self {
        Self {
            enabled: true,
            program: "ansible-playbook".into(),
            playbook: PathBuf::from("ansible/provision_host.yml"),
            timeout_secs: 300,
            extra_args: Vec::new(),
        }
    }
}

impl Default for ReconcileConf {
    fn default() -> Self {
        Self { workers: 8, interval_secs: 60 }
    }
}

pub fn parse_config(text: &str) -> Result<CoreConfig, serde_yaml::Error> {
    if text.trim().is_empty() {
        return Ok(CoreConfig::default());
    }
    serde_yaml::from_str(text)
}

/// Reads `$LNT_CORE_CONFIG` (default `lnt-core.yaml`). Missing or invalid
/// files fall back to defaults.
pub async fn load_config() -> CoreConfig {
    let path = std::env::var("LNT_CORE_CONFIG").unwrap_or_else(|_| "lnt-core.yaml".into());
    load_config_from(Path::new(&path)).await
}

pub async fn load_config_from(path: &Path) -> CoreConfig {
    if !path.exists() {
        info!(path = %path.display(), "no config file, using defaults");
        return CoreConfig::default();
    }
    let text = match fs::read_to_string(path).await {
        Ok(t) => t,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "unreadable config, using defaults");
            return CoreConfig::default();
        }
    };
    parse_config(&text).unwrap_or_else(|e| {
        warn!(path = %path.display(), error = %e, "invalid config, using defaults");
        CoreConfig::default()
    })
}
