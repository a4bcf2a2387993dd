/**
 * LNT CORE - Service entry point
 *
 * ROLE: Wires config, inventory store, agent client, provisioner and both
 * managers, starts the reconciliation loop and serves the HTTP API.
 */

use anyhow::{Context, Result};
use lnt_core::clock::system_clock;
use lnt_core::config::load_config;
use lnt_core::devices::{DeviceManager, SharedDeviceManager};
use lnt_core::health::HealthTracker;
use lnt_core::http::{self, AppState};
use lnt_core::inventory::InventoryStore;
use lnt_core::provisioner::{AnsibleProvisioner, NoopProvisioner, Provisioner};
use lnt_core::reconciler::HttpAgentClient;
use lnt_core::runs::{SharedTestManager, TestManager};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // .env is optional
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("lnt_core=info")))
        .init();

    let cfg = load_config().await;
    let clock = system_clock();

    let store = InventoryStore::new(&cfg.inventory.path);
    let agent = Arc::new(HttpAgentClient::new(
        cfg.agent.port,
        Duration::from_secs(cfg.agent.timeout_secs),
    ));

    let provisioner: Arc<dyn Provisioner> = if cfg.provisioning.enabled {
        Arc::new(AnsibleProvisioner::from_config(&cfg.provisioning, &cfg.inventory.path))
    } else {
        warn!("provisioning disabled, new hosts go straight to idle");
        Arc::new(NoopProvisioner)
    };

    let devices: SharedDeviceManager = Arc::new(
        DeviceManager::new(store, agent, provisioner)
            .with_clock(clock.clone())
            .with_workers(cfg.reconcile.workers)
            .with_provision_timeout(Duration::from_secs(cfg.provisioning.timeout_secs)),
    );
    devices
        .load_hosts()
        .await
        .with_context(|| format!("failed to load inventory {}", cfg.inventory.path.display()))?;

    let tests: SharedTestManager = Arc::new(TestManager::new().with_clock(clock.clone()));

    if cfg.reconcile.interval_secs > 0 {
        DeviceManager::start_reconcile_loop(devices.clone(), Duration::from_secs(cfg.reconcile.interval_secs));
    }

    let app_state = AppState {
        devices,
        tests,
        health: HealthTracker::new(&clock),
    };
    let app = http::build_router(app_state, &cfg.server.cors_origins);

    let listener = TcpListener::bind(cfg.server.bind.as_str())
        .await
        .with_context(|| format!("failed to bind {}", cfg.server.bind))?;
    info!(addr = %cfg.server.bind, "listening");
    axum::serve(listener, app).await.context("http server failed")?;
    Ok(())
}
