//! Test run records and their in-memory store.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

/// port (or DUT name) -> data / path
pub type PortMap = BTreeMap<String, String>;
/// hostname -> port -> data / path
pub type HostPortMap = BTreeMap<String, PortMap>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TestStatus {
    Running,
    Passed,
    Failed,
    Cancelled,
    Stopped,
}

impl TestStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, TestStatus::Running)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TestStatus::Running => "running",
            TestStatus::Passed => "passed",
            TestStatus::Failed => "failed",
            TestStatus::Cancelled => "cancelled",
            TestStatus::Stopped => "stopped",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    #[serde(with = "time::serde::rfc3339")]
    pub at: OffsetDateTime,
    pub message: String,
}

impl fmt::Display for LogEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ts = self.at.format(&Rfc3339).map_err(|_| fmt::Error)?;
        write!(f, "[{ts}] {}", self.message)
    }
}

/// Run configuration submitted with `start`. Every section is optional.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TestRunConfig {
    pub description: Option<String>,
    #[serde(alias = "duration")]
    pub test_duration: Option<String>,
    pub device_hosts: Vec<String>,
    /// hostname -> DUT name -> firmware image path
    #[serde(alias = "dut_images")]
    pub firmware_images: HostPortMap,
    pub serial_streams: HostPortMap,
    pub serial_logs: HostPortMap,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TestRecord {
    pub id: u64,
    pub name: String,
    pub description: Option<String>,
    status: TestStatus,
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    finished_at: Option<OffsetDateTime>,
    pub duration_spec: Option<String>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub expires_at: Option<OffsetDateTime>,
    pub logs: Vec<LogEntry>,
    pub device_hosts: BTreeSet<String>,
    pub dut_images: HostPortMap,
    pub serial_streams: HostPortMap,
    pub serial_logs: HostPortMap,
}

impl TestRecord {
    pub(crate) fn new(id: u64, name: &str, started_at: OffsetDateTime) -> Self {
        let mut record = Self {
            id,
            name: name.to_string(),
            description: None,
            status: TestStatus::Running,
            started_at,
            finished_at: None,
            duration_spec: None,
            expires_at: None,
            logs: Vec::new(),
            device_hosts: BTreeSet::new(),
            dut_images: HostPortMap::new(),
            serial_streams: HostPortMap::new(),
            serial_logs: HostPortMap::new(),
        };
        record.append_log(started_at, format!("Test '{name}' started"));
        record
    }

    pub fn status(&self) -> TestStatus {
        self.status
    }

    pub fn finished_at(&self) -> Option<OffsetDateTime> {
        self.finished_at
    }

    pub(crate) fn append_log(&mut self, at: OffsetDateTime, message: impl Into<String>) {
        self.logs.push(LogEntry {
            at,
            message: message.into(),
        });
    }

    /// Applies a status change. Terminal records never change again; the
    /// first terminal status stamps `finished_at` and logs the outcome.
    /// Returns whether the status actually changed.
    pub(crate) fn transition(&mut self, next: TestStatus, at: OffsetDateTime) -> bool {
        if self.status.is_terminal() || self.status == next {
            return false;
        }
        self.status = next;
        if next.is_terminal() {
            self.finished_at = Some(at);
            self.append_log(at, format!("Test {}", next.as_str()));
        }
        true
    }

    /// Serial log files: a new path replaces the previous one for that port.
    pub(crate) fn merge_serial_logs(&mut self, update: HostPortMap) {
        for (host, ports) in update {
            self.serial_logs.entry(host).or_default().extend(ports);
        }
    }

    /// Serial streams accumulate: new data is appended to the port's stream.
    pub(crate) fn merge_streams(&mut self, update: HostPortMap) {
        for (host, ports) in update {
            let streams = self.serial_streams.entry(host).or_default();
            for (port, data) in ports {
                streams.entry(port).or_default().push_str(&data);
            }
        }
    }

    pub(crate) fn apply_config(&mut self, config: TestRunConfig) {
        self.description = config.description;
        self.device_hosts.extend(config.device_hosts);
        self.device_hosts.extend(config.firmware_images.keys().cloned());
        self.device_hosts.extend(config.serial_streams.keys().cloned());
        self.device_hosts.extend(config.serial_logs.keys().cloned());
        self.dut_images = config.firmware_images;
        self.serial_streams = config.serial_streams;
        self.serial_logs = config.serial_logs;
    }
}

/// Which slices `get_test_logs` returns.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogType {
    #[default]
    All,
    Text,
    Serial,
    Streams,
}

/// Logs of one run without the rest of the record, so large stream payloads
/// can be fetched apart from the status poll.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TestLogs {
    pub id: u64,
    pub name: String,
    pub status: TestStatus,
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub finished_at: Option<OffsetDateTime>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logs: Option<Vec<LogEntry>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub serial_logs: Option<HostPortMap>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub serial_streams: Option<HostPortMap>,
}

impl TestLogs {
    pub fn select(record: &TestRecord, log_type: LogType) -> Self {
        let (text, serial, streams) = match log_type {
            LogType::All => (true, true, true),
            LogType::Text => (true, false, false),
            LogType::Serial => (false, true, false),
            LogType::Streams => (false, false, true),
        };
        Self {
            id: record.id,
            name: record.name.clone(),
            status: record.status,
            started_at: record.started_at,
            finished_at: record.finished_at,
            logs: text.then(|| record.logs.clone()),
            serial_logs: serial.then(|| record.serial_logs.clone()),
            serial_streams: streams.then(|| record.serial_streams.clone()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TestStats {
    pub total_tests: usize,
    pub running: usize,
    pub finished: usize,
}

/// Records keyed by id. Ids start at 1 and are never reused.
#[derive(Debug)]
pub struct TestStore {
    tests: BTreeMap<u64, TestRecord>,
    next_id: u64,
}

impl Default for TestStore {
    fn default() -> Self {
        Self {
            tests: BTreeMap::new(),
            next_id: 1,
        }
    }
}

impl TestStore {
    pub fn insert_next(&mut self, build: impl FnOnce(u64) -> TestRecord) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.tests.insert(id, build(id));
        id
    }

    pub fn get(&self, id: u64) -> Option<&TestRecord> {
        self.tests.get(&id)
    }

    pub fn get_mut(&mut self, id: u64) -> Option<&mut TestRecord> {
        self.tests.get_mut(&id)
    }

    pub fn records(&self) -> impl Iterator<Item = &TestRecord> {
        self.tests.values()
    }

    pub fn stats(&self) -> TestStats {
        let running = self.records().filter(|r| r.status == TestStatus::Running).count();
        TestStats {
            total_tests: self.tests.len(),
            running,
            finished: self.tests.len() - running,
        }
    }
}
