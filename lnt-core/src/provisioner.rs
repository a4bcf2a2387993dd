//! Provisioning collaborator: prepares a freshly added host.
//!
//! The device manager only sees [`Provisioner::provision`]. The shipped
//! implementation runs the Ansible playbook against the inventory snapshot,
//! which already contains the new host when the call happens.

use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, info};

use crate::config::ProvisioningConf;

#[derive(Debug, thiserror::Error)]
pub enum ProvisionError {
    #[error("failed to launch {program}: {source}")]
    Launch {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("provisioning exited with status {code:?}: {stderr}")]
    Failed { code: Option<i32>, stderr: String },
}

#[async_trait]
pub trait Provisioner: Send + Sync {
    /// Returns the tool output on success. Timeouts are enforced by the caller;
    /// implementations must release their resources when the future is dropped.
    async fn provision(&self, hostname: &str, address: &str) -> Result<String, ProvisionError>;
}

/// `ansible-playbook -i <inventory> <playbook> --limit <host> -e ansible_host=<address>`
#[derive(Debug, Clone)]
pub struct AnsibleProvisioner {
    program: String,
    playbook: PathBuf,
    inventory: PathBuf,
    extra_args: Vec<String>,
}

impl AnsibleProvisioner {
    pub fn new(program: impl Into<String>, playbook: impl Into<PathBuf>, inventory: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            playbook: playbook.into(),
            inventory: inventory.into(),
            extra_args: Vec::new(),
        }
    }

    pub fn from_config(conf: &ProvisioningConf, inventory: impl Into<PathBuf>) -> Self {
        Self {
            extra_args: conf.extra_args.clone(),
            ..Self::new(conf.program.clone(), conf.playbook.clone(), inventory)
        }
    }

    pub fn args(&self, hostname: &str, address: &str) -> Vec<String> {
        let mut args = vec![
            "-i".to_string(),
            self.inventory.display().to_string(),
            self.playbook.display().to_string(),
            "--limit".to_string(),
            hostname.to_string(),
            "-e".to_string(),
            format!("ansible_host={address}"),
        ];
        args.extend(self.extra_args.iter().cloned());
        args
    }
}

#[async_trait]
impl Provisioner for AnsibleProvisioner {
    async fn provision(&self, hostname: &str, address: &str) -> Result<String, ProvisionError> {
        let args = self.args(hostname, address);
        info!(host = %hostname, program = %self.program, "provisioning host");
        debug!(?args, "provisioning command");

        let output = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|source| ProvisionError::Launch {
                program: self.program.clone(),
                source,
            })?;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).into_owned())
        } else {
            Err(ProvisionError::Failed {
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            })
        }
    }
}

/// Used when provisioning is disabled in the configuration.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopProvisioner;

#[async_trait]
impl Provisioner for NoopProvisioner {
    async fn provision(&self, hostname: &str, _address: &str) -> Result<String, ProvisionError> {
        debug!(host = %hostname, "provisioning disabled, skipping");
        Ok(String::new())
    }
}
