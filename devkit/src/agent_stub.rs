/*!
Stub device agent

Serves `GET /health` and `GET /duts` on an ephemeral local port. Answers,
artificial latency and HTTP status can be changed while the server runs;
every request is counted.
*/

use anyhow::Result;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

#[derive(Debug)]
struct Script {
    health: Value,
    duts: Value,
    delay: Duration,
    status: StatusCode,
}

#[derive(Clone)]
struct StubState {
    script: Arc<Mutex<Script>>,
    requests: Arc<AtomicUsize>,
}

/// Agent server bound to `127.0.0.1:0`; aborted on drop.
pub struct StubAgent {
    addr: SocketAddr,
    state: StubState,
    task: JoinHandle<()>,
}

impl StubAgent {
    /// Idle agent with no DUTs.
    pub async fn start() -> Result<Self> {
        Self::with_answers(json!({"status": "idle"}), json!({"items": []})).await
    }

    pub async fn with_answers(health: Value, duts: Value) -> Result<Self> {
        let state = StubState {
            script: Arc::new(Mutex::new(Script {
                health,
                duts,
                delay: Duration::ZERO,
                status: StatusCode::OK,
            })),
            requests: Arc::new(AtomicUsize::new(0)),
        };

        let app = Router::new()
            .route("/health", get(health_handler))
            .route("/duts", get(duts_handler))
            .with_state(state.clone());

        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let task = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                tracing::warn!(error = %e, "stub agent stopped");
            }
        });

        Ok(Self { addr, state, task })
    }

    /// Address to register the host with, scheme included.
    pub fn address(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn socket_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn set_health(&self, health: Value) {
        self.state.script.lock().health = health;
    }

    pub fn set_duts(&self, duts: Value) {
        self.state.script.lock().duts = duts;
    }

    /// Every answer waits this long before being sent.
    pub fn set_delay(&self, delay: Duration) {
        self.state.script.lock().delay = delay;
    }

    /// Non-2xx status answers with the status and an empty JSON object.
    pub fn set_status(&self, status: StatusCode) {
        self.state.script.lock().status = status;
    }

    pub fn requests(&self) -> usize {
        self.state.requests.load(Ordering::SeqCst)
    }
}

impl Drop for StubAgent {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn health_handler(State(state): State<StubState>) -> Response {
    answer(&state, |s| s.health.clone()).await
}

async fn duts_handler(State(state): State<StubState>) -> Response {
    answer(&state, |s| s.duts.clone()).await
}

async fn answer(state: &StubState, pick: impl FnOnce(&Script) -> Value) -> Response {
    state.requests.fetch_add(1, Ordering::SeqCst);
    let (body, delay, status) = {
        let script = state.script.lock();
        (pick(&script), script.delay, script.status)
    };
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }
    if status.is_success() {
        (status, Json(body)).into_response()
    } else {
        (status, Json(json!({}))).into_response()
    }
}

/// A local address nothing listens on: the port is released right after
/// being reserved.
pub fn unreachable_address() -> String {
    let port = std::net::TcpListener::bind("127.0.0.1:0")
        .and_then(|l| l.local_addr())
        .map(|a| a.port())
        .unwrap_or(9);
    format!("http://127.0.0.1:{port}")
}
