//! Host reconciliation: polls a host's agent and turns whatever it answers
//! into the canonical host status + DUT block.
//!
//! Agents speak two DUT dialects (a rich per-item list and a legacy
//! `{count, types}` summary). Both are resolved here, in [`DutsPayload::normalize`];
//! nothing past this module ever sees the wire shapes.

use crate::models::{DutBlock, DutInfo, DutStatus, HostRecord, HostStatus};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Default agent port when the host address carries none.
pub const DEFAULT_AGENT_PORT: u16 = 8081;
/// Timeout applied to each agent call.
pub const DEFAULT_AGENT_TIMEOUT: Duration = Duration::from_secs(5);
/// Larger DUT listings are rejected as malformed.
pub const MAX_DUTS_PER_HOST: usize = 1024;

/// Any failure to obtain a usable answer from an agent. The device manager
/// absorbs all of them into `disconnected`.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("request to {0} timed out")]
    Timeout(String),
    #[error("{url} answered HTTP {status}")]
    Status { url: String, status: u16 },
    #[error("malformed payload from {url}: {message}")]
    Malformed { url: String, message: String },
    #[error("agent reported {0} DUTs, more than {max}", max = MAX_DUTS_PER_HOST)]
    TooManyDuts(usize),
}

/// `GET /health` body.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AgentHealth {
    #[serde(default)]
    pub status: Option<Value>,
}

impl AgentHealth {
    pub fn host_status(&self) -> HostStatus {
        HostStatus::from_agent_health(self.status.as_ref().and_then(Value::as_str))
    }
}

/// One entry of the rich DUT listing. Identifiers may come as numbers.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AgentDut {
    #[serde(default)]
    pub id: Option<Value>,
    #[serde(default)]
    pub serial: Option<Value>,
    #[serde(default)]
    pub name: Option<Value>,
    #[serde(rename = "type", default)]
    pub kind: Option<Value>,
    #[serde(default)]
    pub status: Option<Value>,
}

/// `GET /duts` body, either dialect. `count` is mandatory in the summary so
/// that an arbitrary object is not mistaken for an empty host.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum DutsPayload {
    Items {
        items: Vec<AgentDut>,
    },
    Summary {
        count: usize,
        #[serde(default)]
        types: Vec<String>,
    },
}

impl DutsPayload {
    pub fn normalize(self) -> Result<DutBlock, AgentError> {
        let reported = match &self {
            DutsPayload::Items { items } => items.len(),
            DutsPayload::Summary { count, .. } => *count,
        };
        if reported > MAX_DUTS_PER_HOST {
            return Err(AgentError::TooManyDuts(reported));
        }

        let block = match self {
            DutsPayload::Items { items } => {
                let mut normalized = Vec::with_capacity(items.len());
                for dut in items {
                    let position = normalized.len() + 1;
                    let id = scalar_text(&dut.id)
                        .or_else(|| scalar_text(&dut.serial))
                        .or_else(|| scalar_text(&dut.name))
                        .unwrap_or_else(|| format!("dut-{position}"));
                    let kind = scalar_text(&dut.kind).unwrap_or_default();
                    let status =
                        DutStatus::normalize(dut.status.as_ref().and_then(Value::as_str));
                    normalized.push(DutInfo::new(id, kind, status));
                }
                DutBlock::from_items(normalized, Vec::new())
            }
            DutsPayload::Summary { count, types } => {
                let items: Vec<DutInfo> = (1..=count)
                    .map(|position| {
                        let kind = types
                            .get(position - 1)
                            .or_else(|| if types.len() == 1 { types.first() } else { None })
                            .cloned()
                            .unwrap_or_default();
                        DutInfo::new(format!("dut-{position}"), kind, DutStatus::Idle)
                    })
                    .collect();
                DutBlock::from_items(items, types)
            }
        };
        Ok(block)
    }
}

fn scalar_text(value: &Option<Value>) -> Option<String> {
    match value {
        Some(Value::String(s)) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    }
}

/// Outbound calls to a host agent. `address` is the host record's address.
#[async_trait]
pub trait AgentApi: Send + Sync {
    async fn health(&self, address: &str) -> Result<AgentHealth, AgentError>;
    async fn duts(&self, address: &str) -> Result<DutsPayload, AgentError>;
}

/// reqwest-backed agent client.
#[derive(Debug, Clone)]
pub struct HttpAgentClient {
    client: reqwest::Client,
    port: u16,
    timeout: Duration,
}

impl HttpAgentClient {
    pub fn new(port: u16, timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            port,
            timeout,
        }
    }

    /// `http://host:port` for bare addresses, unchanged for full URLs,
    /// `http://ip:port` when the address already names a socket.
    pub fn base_url(&self, address: &str) -> String {
        let address = address.trim().trim_end_matches('/');
        if address.contains("://") {
            address.to_string()
        } else if address.parse::<SocketAddr>().is_ok() {
            format!("http://{address}")
        } else {
            format!("http://{address}:{}", self.port)
        }
    }

    async fn get_json<T: DeserializeOwned>(&self, address: &str, path: &str) -> Result<T, AgentError> {
        let url = format!("{}{path}", self.base_url(address));
        let response = self
            .client
            .get(&url)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| classify(&url, e))?;

        if !response.status().is_success() {
            return Err(AgentError::Status {
                url,
                status: response.status().as_u16(),
            });
        }

        let bytes = response.bytes().await.map_err(|e| classify(&url, e))?;
        serde_json::from_slice(&bytes).map_err(|e| AgentError::Malformed {
            url,
            message: e.to_string(),
        })
    }
}

fn classify(url: &str, e: reqwest::Error) -> AgentError {
    if e.is_timeout() {
        AgentError::Timeout(url.to_string())
    } else {
        AgentError::Request {
            url: url.to_string(),
            source: e,
        }
    }
}

impl Default for HttpAgentClient {
    fn default() -> Self {
        Self::new(DEFAULT_AGENT_PORT, DEFAULT_AGENT_TIMEOUT)
    }
}

#[async_trait]
impl AgentApi for HttpAgentClient {
    async fn health(&self, address: &str) -> Result<AgentHealth, AgentError> {
        self.get_json(address, "/health").await
    }

    async fn duts(&self, address: &str) -> Result<DutsPayload, AgentError> {
        self.get_json(address, "/duts").await
    }
}

/// Result of one reconciliation pass against an agent.
#[derive(Debug, Clone)]
pub enum Observation {
    Reachable { status: HostStatus, duts: DutBlock },
    Unreachable { reason: String },
}

#[derive(Clone)]
pub struct HostReconciler {
    agent: Arc<dyn AgentApi>,
}

impl HostReconciler {
    pub fn new(agent: Arc<dyn AgentApi>) -> Self {
        Self { agent }
    }

    /// Health then DUT enumeration. Never fails: errors become `Unreachable`.
    pub async fn observe(&self, address: &str) -> Observation {
        let health = match self.agent.health(address).await {
            Ok(h) => h,
            Err(e) => return mark_unreachable(address, e),
        };
        let duts = match self.agent.duts(address).await {
            Ok(d) => d,
            Err(e) => return mark_unreachable(address, e),
        };
        let duts = match duts.normalize() {
            Ok(block) => block,
            Err(e) => return mark_unreachable(address, e),
        };
        let observation = Observation::Reachable {
            status: health.host_status(),
            duts,
        };
        debug!(%address, "agent reachable");
        observation
    }
}

fn mark_unreachable(address: &str, e: AgentError) -> Observation {
    warn!(%address, error = %e, "agent unreachable");
    Observation::Unreachable {
        reason: e.to_string(),
    }
}

/// Folds an observation into a host record. An unreachable host keeps its
/// last known DUT block.
pub fn apply(record: &mut HostRecord, observation: Observation, now_epoch: i64) {
    record.last_seen_epoch = now_epoch;
    match observation {
        Observation::Reachable { status, duts } => {
            record.status = status;
            record.duts = duts;
            record.last_error = None;
        }
        Observation::Unreachable { reason } => {
            record.status = HostStatus::Disconnected;
            record.last_error = Some(reason);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::DutColor;
    use serde_json::json;

    fn payload(v: Value) -> DutsPayload {
        serde_json::from_value(v).unwrap()
    }

    #[test]
    fn positional_fallback_id() {
        let block = payload(json!({
            "items": [
                {"id": "A1", "type": "CC26x2", "status": "idle"},
                {"status": "running"},
                {"serial": "SER-3", "status": "offline"}
            ]
        }))
        .normalize()
        .unwrap();

        assert_eq!(block.count(), 3);
        assert_eq!(block.items()[1].id, "dut-2");
        assert_eq!(block.items()[1].color, DutColor::Green);
        assert_eq!(block.items()[2].id, "SER-3");
        assert_eq!(block.items()[2].color, DutColor::Red);
    }

    #[test]
    fn id_precedence_is_id_serial_name() {
        let block = payload(json!({
            "items": [
                {"id": "i", "serial": "s", "name": "n"},
                {"serial": "s", "name": "n"},
                {"name": "n"},
                {"id": "", "serial": "  ", "name": 42}
            ]
        }))
        .normalize()
        .unwrap();
        let ids: Vec<_> = block.items().iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["i", "s", "n", "42"]);
    }

    #[test]
    fn unknown_dut_status_is_idle() {
        let block = payload(json!({"items": [{"id": "x", "status": "melting"}, {"id": "y", "status": 3}]}))
            .normalize()
            .unwrap();
        assert!(block.items().iter().all(|d| d.status == DutStatus::Idle));
        assert_eq!(block.count_of(DutStatus::Idle), 2);
    }

    #[test]
    fn legacy_summary_shape() {
        let block = payload(json!({"count": 2, "types": ["CC26x2"]})).normalize().unwrap();

        assert_eq!(block.count(), 2);
        assert_eq!(block.items().len(), 2);
        for (n, dut) in block.items().iter().enumerate() {
            assert_eq!(dut.id, format!("dut-{}", n + 1));
            assert_eq!(dut.status, DutStatus::Idle);
            assert_eq!(dut.color, DutColor::Yellow);
            assert_eq!(dut.kind, "CC26x2");
        }
        assert_eq!(block.count_of(DutStatus::Running), 0);
        assert_eq!(block.count_of(DutStatus::Idle), 2);
        assert_eq!(block.count_of(DutStatus::Offline), 0);
        assert_eq!(block.types().len(), 1);
    }

    #[test]
    fn legacy_summary_with_per_item_types() {
        let block = payload(json!({"count": 3, "types": ["a", "b"]})).normalize().unwrap();
        let kinds: Vec<_> = block.items().iter().map(|d| d.kind.as_str()).collect();
        assert_eq!(kinds, vec!["a", "b", ""]);
        assert_eq!(block.types().len(), 2);
    }

    #[test]
    fn invariants_hold_for_both_shapes() {
        for v in [
            json!({"items": []}),
            json!({"items": [{"status": "running"}, {"status": "offline"}, {}]}),
            json!({"count": 0}),
            json!({"count": 5, "types": []}),
        ] {
            let block = payload(v).normalize().unwrap();
            assert_eq!(block.count(), block.items().len());
            assert_eq!(block.status_counts().values().sum::<usize>(), block.count());
        }
    }

    #[test]
    fn shapeless_objects_are_rejected() {
        for v in [
            json!({}),
            json!({"items": "garbage"}),
            json!({"items": null}),
            json!({"types": ["a"]}),
            json!("items"),
        ] {
            assert!(serde_json::from_value::<DutsPayload>(v.clone()).is_err(), "{v} should not parse");
        }
    }

    #[test]
    fn oversized_listing_is_rejected() {
        let huge = payload(json!({"count": u64::MAX}));
        assert!(matches!(huge.normalize(), Err(AgentError::TooManyDuts(_))));

        let at_limit = payload(json!({"count": MAX_DUTS_PER_HOST})).normalize().unwrap();
        assert_eq!(at_limit.count(), MAX_DUTS_PER_HOST);
    }

    #[test]
    fn base_url_forms() {
        let client = HttpAgentClient::new(9000, Duration::from_secs(1));
        assert_eq!(client.base_url("10.0.0.5"), "http://10.0.0.5:9000");
        assert_eq!(client.base_url("bench-01.lab"), "http://bench-01.lab:9000");
        assert_eq!(client.base_url("10.0.0.5:8100"), "http://10.0.0.5:8100");
        assert_eq!(client.base_url("https://agent.lab/"), "https://agent.lab");
    }

    #[test]
    fn apply_unreachable_keeps_duts() {
        let mut record = HostRecord::new("h1", "10.0.0.5");
        let duts = payload(json!({"count": 1})).normalize().unwrap();
        apply(
            &mut record,
            Observation::Reachable { status: HostStatus::Busy, duts: duts.clone() },
            100,
        );
        assert_eq!(record.status, HostStatus::Busy);
        assert_eq!(record.last_seen_epoch, 100);

        apply(&mut record, Observation::Unreachable { reason: "refused".into() }, 200);
        assert_eq!(record.status, HostStatus::Disconnected);
        assert_eq!(record.last_seen_epoch, 200);
        assert_eq!(record.duts, duts);
        assert_eq!(record.last_error.as_deref(), Some("refused"));
    }

    struct DeadAgent;

    #[async_trait]
    impl AgentApi for DeadAgent {
        async fn health(&self, _address: &str) -> Result<AgentHealth, AgentError> {
            Err(AgentError::Timeout("http://dead/health".into()))
        }
        async fn duts(&self, _address: &str) -> Result<DutsPayload, AgentError> {
            unreachable!("duts must not be polled after a failed health check")
        }
    }

    struct BoastfulAgent;

    #[async_trait]
    impl AgentApi for BoastfulAgent {
        async fn health(&self, _address: &str) -> Result<AgentHealth, AgentError> {
            Ok(AgentHealth { status: Some(json!("idle")) })
        }
        async fn duts(&self, _address: &str) -> Result<DutsPayload, AgentError> {
            Ok(DutsPayload::Summary { count: usize::MAX, types: Vec::new() })
        }
    }

    #[tokio::test]
    async fn oversized_listing_marks_host_unreachable() {
        let reconciler = HostReconciler::new(Arc::new(BoastfulAgent));
        match reconciler.observe("bench").await {
            Observation::Unreachable { reason } => assert!(reason.contains("DUTs")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn failed_health_short_circuits() {
        let reconciler = HostReconciler::new(Arc::new(DeadAgent));
        match reconciler.observe("dead").await {
            Observation::Unreachable { reason } => assert!(reason.contains("timed out")),
            other => panic!("unexpected {other:?}"),
        }
    }
}
