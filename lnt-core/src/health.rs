use crate::clock::SharedClock;
use crate::devices::DeviceManager;
use crate::models::InventoryStats;
use crate::runs::{TestManager, TestStats};
use serde::Serialize;
use std::time::Instant;
use time::OffsetDateTime;

#[derive(Debug, Serialize)]
pub struct ServiceHealth {
    pub status: &'static str,
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
    pub uptime_seconds: u64,
    pub devices: InventoryStats,
    pub tests: TestStats,
}

#[derive(Clone)]
pub struct HealthTracker {
    start_time: Instant,
    started_at: OffsetDateTime,
}

impl HealthTracker {
    pub fn new(clock: &SharedClock) -> Self {
        Self {
            start_time: Instant::now(),
            started_at: clock.now(),
        }
    }

    pub async fn get_health(&self, devices: &DeviceManager, tests: &TestManager) -> ServiceHealth {
        ServiceHealth {
            status: "ok",
            started_at: self.started_at,
            uptime_seconds: self.start_time.elapsed().as_secs(),
            devices: devices.inventory_stats().await,
            tests: tests.stats(),
        }
    }
}
