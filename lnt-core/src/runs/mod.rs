/**
 * TEST LIFECYCLE MANAGER - State of test runs executed against device hosts
 *
 * ROLE:
 * Starts, updates and stops test runs, derives their expiration from the run
 * configuration and accumulates text logs and serial data per host and port.
 *
 * STATE MACHINE:
 *   running -> passed | failed | cancelled | stopped
 * All four outcomes are terminal: later status changes are ignored and
 * `finished_at` is stamped once.
 *
 * Expiry is only reported (`is_expired`); forcing a stop on expired runs is
 * left to whoever schedules them.
 */

mod duration;
mod record;

pub use duration::{parse_duration, DurationParseError};
pub use record::{
    HostPortMap, LogEntry, LogType, PortMap, TestLogs, TestRecord, TestRunConfig, TestStats,
    TestStatus, TestStore,
};

use crate::clock::{system_clock, SharedClock};
use parking_lot::Mutex;
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Debug, thiserror::Error)]
pub enum TestError {
    #[error("Test not found: {0}")]
    NotFound(u64),
    #[error(transparent)]
    InvalidDuration(#[from] DurationParseError),
}

/// Fields of an update, each applied independently.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TestUpdate {
    pub status: Option<TestStatus>,
    pub log: Option<String>,
    pub serial_logs: Option<HostPortMap>,
    pub streams: Option<HostPortMap>,
}

impl TestUpdate {
    pub fn status(status: TestStatus) -> Self {
        Self { status: Some(status), ..Self::default() }
    }

    pub fn log(line: impl Into<String>) -> Self {
        Self { log: Some(line.into()), ..Self::default() }
    }
}

pub struct TestManager {
    store: Mutex<TestStore>,
    clock: SharedClock,
}

pub type SharedTestManager = Arc<TestManager>;

impl Default for TestManager {
    fn default() -> Self {
        Self::new()
    }
}

impl TestManager {
    pub fn new() -> Self {
        Self {
            store: Mutex::new(TestStore::default()),
            clock: system_clock(),
        }
    }

    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    /// Allocates the next id and seeds a `running` record. A malformed
    /// duration is rejected before any id is consumed.
    pub fn start_test(&self, name: &str, config: Option<TestRunConfig>) -> Result<u64, TestError> {
        let duration_spec = config
            .as_ref()
            .and_then(|c| c.test_duration.as_deref())
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string);
        let duration = duration_spec.as_deref().map(parse_duration).transpose()?;

        let started_at = self.clock.now();
        let expires_at = match (duration, duration_spec.as_deref()) {
            (Some(d), Some(input)) => Some(started_at.checked_add(d).ok_or_else(|| DurationParseError {
                input: input.to_string(),
                reason: "expiration out of range",
            })?),
            _ => None,
        };

        let id = self.store.lock().insert_next(|id| {
            let mut record = TestRecord::new(id, name, started_at);
            if let Some(config) = config {
                record.apply_config(config);
            }
            record.duration_spec = duration_spec.clone();
            record.expires_at = expires_at;
            record
        });

        info!(test_id = id, name, duration = ?duration_spec, "test started");
        Ok(id)
    }

    pub fn update_test(&self, id: u64, update: TestUpdate) -> Result<TestRecord, TestError> {
        let now = self.clock.now();
        let mut store = self.store.lock();
        let record = store.get_mut(id).ok_or(TestError::NotFound(id))?;

        if let Some(line) = update.log {
            record.append_log(now, line);
        }
        if let Some(serial_logs) = update.serial_logs {
            record.merge_serial_logs(serial_logs);
        }
        if let Some(streams) = update.streams {
            record.merge_streams(streams);
        }
        if let Some(status) = update.status {
            if record.transition(status, now) {
                info!(test_id = id, status = status.as_str(), "test status changed");
            } else {
                debug!(test_id = id, current = record.status().as_str(), requested = status.as_str(), "status change ignored");
            }
        }
        Ok(record.clone())
    }

    /// `cancelled` when the reason mentions a cancellation, `stopped`
    /// otherwise. False when the run is unknown or already finished.
    pub fn stop_test(&self, id: u64, reason: &str) -> bool {
        let now = self.clock.now();
        let mut store = self.store.lock();
        let Some(record) = store.get_mut(id) else {
            return false;
        };
        if record.status() != TestStatus::Running {
            return false;
        }

        let status = if reason.to_ascii_lowercase().contains("cancel") {
            TestStatus::Cancelled
        } else {
            TestStatus::Stopped
        };
        record.append_log(now, format!("Stop requested: {reason}"));
        record.transition(status, now);
        info!(test_id = id, status = status.as_str(), reason, "test stopped");
        true
    }

    pub fn get_test(&self, id: u64) -> Result<TestRecord, TestError> {
        self.store.lock().get(id).cloned().ok_or(TestError::NotFound(id))
    }

    pub fn list_tests(&self) -> Vec<TestRecord> {
        self.store.lock().records().cloned().collect()
    }

    pub fn get_test_logs(&self, id: u64, log_type: LogType) -> Result<TestLogs, TestError> {
        let store = self.store.lock();
        let record = store.get(id).ok_or(TestError::NotFound(id))?;
        Ok(TestLogs::select(record, log_type))
    }

    /// False when the run has no expiration.
    pub fn is_expired(&self, id: u64) -> Result<bool, TestError> {
        let now = self.clock.now();
        let store = self.store.lock();
        let record = store.get(id).ok_or(TestError::NotFound(id))?;
        Ok(record.expires_at.is_some_and(|at| now > at))
    }

    pub fn stats(&self) -> TestStats {
        self.store.lock().stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use time::macros::datetime;
    use time::Duration;

    fn manager() -> (TestManager, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(datetime!(2025-05-01 08:00 UTC)));
        (TestManager::new().with_clock(clock.clone()), clock)
    }

    fn config_json(v: serde_json::Value) -> TestRunConfig {
        serde_json::from_value(v).unwrap()
    }

    #[test]
    fn start_without_config() {
        let (tm, _) = manager();
        let id = tm.start_test("t1", None).unwrap();
        assert_eq!(id, 1);
        let rec = tm.get_test(id).unwrap();
        assert_eq!(rec.status(), TestStatus::Running);
        assert_eq!(rec.logs.len(), 1);
        assert!(rec.expires_at.is_none());
        assert!(!tm.is_expired(id).unwrap());
        assert_eq!(tm.start_test("t2", None).unwrap(), 2);
    }

    #[test]
    fn config_derives_hosts_and_expiry() {
        let (tm, clock) = manager();
        let id = tm
            .start_test(
                "t1",
                Some(config_json(serde_json::json!({
                    "description": "nightly",
                    "test_duration": "1h 30m",
                    "device_hosts": ["h0"],
                    "firmware_images": {"h1": {"dut-a": "/fw/a.bin"}},
                    "serial_streams": {"h2": {"ttyUSB0": ""}},
                    "serial_logs": {"h1": {"ttyUSB0": "/logs/h1.log"}, "h3": {}}
                }))),
            )
            .unwrap();

        let rec = tm.get_test(id).unwrap();
        assert_eq!(rec.description.as_deref(), Some("nightly"));
        assert_eq!(rec.duration_spec.as_deref(), Some("1h 30m"));
        assert_eq!(rec.expires_at, Some(rec.started_at + Duration::minutes(90)));
        let hosts: Vec<_> = rec.device_hosts.iter().map(String::as_str).collect();
        assert_eq!(hosts, vec!["h0", "h1", "h2", "h3"]);
        assert_eq!(rec.dut_images["h1"]["dut-a"], "/fw/a.bin");

        assert!(!tm.is_expired(id).unwrap());
        clock.advance(Duration::minutes(90));
        assert!(!tm.is_expired(id).unwrap());
        clock.advance(Duration::seconds(1));
        assert!(tm.is_expired(id).unwrap());
        // expiry is only reported
        assert_eq!(tm.get_test(id).unwrap().status(), TestStatus::Running);
    }

    #[test]
    fn bad_duration_consumes_no_id() {
        let (tm, _) = manager();
        let cfg = config_json(serde_json::json!({"test_duration": "soon"}));
        assert!(matches!(tm.start_test("t", Some(cfg)), Err(TestError::InvalidDuration(_))));
        assert_eq!(tm.start_test("t", None).unwrap(), 1);

        let blank = config_json(serde_json::json!({"test_duration": "  "}));
        let id = tm.start_test("t", Some(blank)).unwrap();
        assert!(tm.get_test(id).unwrap().expires_at.is_none());
    }

    #[test]
    fn out_of_range_expiry_is_rejected() {
        let (tm, _) = manager();
        let cfg = config_json(serde_json::json!({"test_duration": "100000000d"}));
        match tm.start_test("t", Some(cfg)) {
            Err(TestError::InvalidDuration(e)) => assert_eq!(e.reason, "expiration out of range"),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(tm.start_test("t", None).unwrap(), 1);
        assert_eq!(tm.stats().total_tests, 1);
    }

    #[test]
    fn terminal_status_is_idempotent() {
        let (tm, clock) = manager();
        let id = tm.start_test("t1", None).unwrap();
        clock.advance(Duration::minutes(3));
        let passed = tm.update_test(id, TestUpdate::status(TestStatus::Passed)).unwrap();
        let finished = passed.finished_at().unwrap();

        clock.advance(Duration::minutes(3));
        let again = tm.update_test(id, TestUpdate::status(TestStatus::Running)).unwrap();
        assert_eq!(again.status(), TestStatus::Passed);
        assert_eq!(again.finished_at(), Some(finished));
        assert!(!tm.stop_test(id, "cancel"));
    }

    #[test]
    fn log_only_update() {
        let (tm, _) = manager();
        let id = tm.start_test("t1", None).unwrap();
        let before = tm.get_test(id).unwrap();
        let after = tm.update_test(id, TestUpdate::log("flashing dut-1")).unwrap();
        assert_eq!(after.logs.len(), before.logs.len() + 1);
        assert_eq!(after.logs.last().unwrap().message, "flashing dut-1");
        assert_eq!(after.status(), TestStatus::Running);
        assert_eq!(after.finished_at(), None);
    }

    #[test]
    fn combined_update_applies_every_field() {
        let (tm, _) = manager();
        let id = tm.start_test("t1", None).unwrap();
        let update: TestUpdate = serde_json::from_value(serde_json::json!({
            "status": "failed",
            "log": "assertion failed",
            "serial_logs": {"h1": {"ttyUSB0": "/logs/x.log"}},
            "streams": {"h1": {"ttyUSB0": "panic!\n"}}
        }))
        .unwrap();
        let rec = tm.update_test(id, update).unwrap();
        assert_eq!(rec.status(), TestStatus::Failed);
        assert!(rec.finished_at().is_some());
        assert_eq!(rec.serial_streams["h1"]["ttyUSB0"], "panic!\n");
        let messages: Vec<_> = rec.logs.iter().map(|l| l.message.as_str()).collect();
        assert_eq!(messages, vec!["Test 't1' started", "assertion failed", "Test failed"]);
    }

    #[test]
    fn stop_reasons() {
        let (tm, _) = manager();
        let a = tm.start_test("a", None).unwrap();
        let b = tm.start_test("b", None).unwrap();
        assert!(tm.stop_test(a, "Cancelled by operator"));
        assert!(tm.stop_test(b, "bench power loss"));
        assert_eq!(tm.get_test(a).unwrap().status(), TestStatus::Cancelled);
        assert_eq!(tm.get_test(b).unwrap().status(), TestStatus::Stopped);
        assert!(!tm.stop_test(a, "again"));
        assert!(!tm.stop_test(99, "ghost"));
    }

    #[test]
    fn unknown_ids() {
        let (tm, _) = manager();
        assert!(matches!(tm.update_test(7, TestUpdate::log("x")), Err(TestError::NotFound(7))));
        assert!(matches!(tm.get_test_logs(7, LogType::All), Err(TestError::NotFound(7))));
        assert!(matches!(tm.is_expired(7), Err(TestError::NotFound(7))));
    }

    #[test]
    fn stats_count_terminal_runs() {
        let (tm, _) = manager();
        for name in ["a", "b", "c", "d"] {
            tm.start_test(name, None).unwrap();
        }
        tm.update_test(1, TestUpdate::status(TestStatus::Passed)).unwrap();
        tm.stop_test(2, "cancel");
        tm.update_test(3, TestUpdate::status(TestStatus::Failed)).unwrap();

        let stats = tm.stats();
        assert_eq!(stats, TestStats { total_tests: 4, running: 1, finished: 3 });
        assert_eq!(tm.list_tests().len(), 4);
    }

    #[test]
    fn serial_logs_fetched_apart() {
        let (tm, _) = manager();
        let id = tm.start_test("t", None).unwrap();
        let update: TestUpdate = serde_json::from_value(serde_json::json!({
            "serial_logs": {"h1": {"ttyACM0": "/logs/h1-acm0.log"}}
        }))
        .unwrap();
        tm.update_test(id, update).unwrap();

        let logs = tm.get_test_logs(id, LogType::Serial).unwrap();
        assert!(logs.logs.is_none());
        assert_eq!(logs.serial_logs.unwrap()["h1"]["ttyACM0"], "/logs/h1-acm0.log");
        assert_eq!(logs.name, "t");
    }
}
