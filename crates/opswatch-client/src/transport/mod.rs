//! Transport abstraction for MCP sessions.
//!
//! Three substrates implement one interface: [`EventStreamTransport`] (SSE
//! read stream + HTTP POST writes), [`RequestResponseTransport`] (one HTTP
//! round trip per call), and [`LocalProcessTransport`] (newline-framed JSON
//! over a child process's stdio).
//!
//! The connection contract: every convenience operation (`list_tools`,
//! `call_tool`) opens a session, performs the operation, and closes the
//! session, even on error paths. Callers that need to amortize the
//! handshake hold a [`Session`] through `open_session` and close it
//! themselves (or via [`crate::Client::with_session`]).

mod event_stream;
mod local_process;
mod request_response;

pub use event_stream::{EventStreamConfig, EventStreamTransport};
pub use local_process::{LocalProcessConfig, LocalProcessTransport};
pub use request_response::{RequestResponseConfig, RequestResponseTransport};

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::debug;

use opswatch_core::OpsResult;

/// Transport variants supported by the client core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// Server-push event stream over an HTTP substrate
    EventStream,
    /// Conventional request/response round trips
    RequestResponse,
    /// Locally spawned server child process
    LocalProcess,
}

/// An initialized, scoped connection to one MCP server.
///
/// Sessions are handshaken at open. `close` must be idempotent and is
/// guaranteed to run on every exit path when callers go through the scoped
/// helpers.
#[async_trait]
pub trait Session: Send + Sync + std::fmt::Debug {
    /// List tool names advertised by the server.
    async fn list_tools(&self) -> OpsResult<Vec<String>>;

    /// List tools with full metadata.
    async fn list_tool_entries(&self) -> OpsResult<Vec<crate::rpc::ToolEntry>>;

    /// Invoke a tool by name.
    async fn call_tool(&self, name: &str, args: Value) -> OpsResult<Value>;

    /// Release the session. Idempotent.
    async fn close(&self) -> OpsResult<()>;
}

/// Transport over which MCP sessions operate.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open and initialize a session, bounded by the connect timeout.
    /// A deadline expiry surfaces as `Timeout`, not `Connection`.
    async fn open_session(&self) -> OpsResult<Box<dyn Session>>;

    /// Open a session, list tool names, close the session.
    async fn list_tools(&self) -> OpsResult<Vec<String>> {
        let session = self.open_session().await?;
        let result = session.list_tools().await;
        let close_result = session.close().await;
        let names = result?;
        close_result?;
        Ok(names)
    }

    /// Open a session, call one tool, close the session.
    async fn call_tool(&self, name: &str, args: Value) -> OpsResult<Value> {
        let session = self.open_session().await?;
        let result = session.call_tool(name, args).await;
        let close_result = session.close().await;
        let value = result?;
        close_result?;
        Ok(value)
    }

    /// Cached health probe; see [`HealthCache`].
    async fn is_healthy(&self) -> bool;

    /// Release underlying resources. Idempotent.
    async fn close(&self) -> OpsResult<()>;

    /// The variant this transport implements.
    fn kind(&self) -> TransportKind;

    /// Endpoint identifier (URL or command line) for diagnostics.
    fn endpoint(&self) -> &str;
}

/// Shared health-probe cache used by all transports.
///
/// Probing runs `list_tools` against a fresh session; the boolean result is
/// cached for the configured interval (default 60 s) to bound probing cost.
#[derive(Debug)]
pub(crate) struct HealthCache {
    interval: Duration,
    state: Mutex<Option<(Instant, bool)>>,
}

impl HealthCache {
    pub(crate) fn new(interval: Duration) -> Self {
        Self {
            interval,
            state: Mutex::new(None),
        }
    }

    /// Return the cached verdict, or run `probe` and cache its result.
    pub(crate) async fn check<F, Fut>(&self, probe: F) -> bool
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        let mut state = self.state.lock().await;
        if let Some((at, verdict)) = *state {
            if at.elapsed() < self.interval {
                return verdict;
            }
        }
        let verdict = probe().await;
        *state = Some((Instant::now(), verdict));
        verdict
    }

    /// Drop the cached verdict so the next check probes again.
    pub(crate) async fn invalidate(&self) {
        *self.state.lock().await = None;
    }
}

/// Run a session-scoped operation against a transport with guaranteed
/// session teardown, returning the operation result.
///
/// Teardown errors never mask the operation error: when both fail, the
/// operation error wins and the close failure is logged.
pub async fn with_session<T, F, Fut>(transport: &dyn Transport, f: F) -> OpsResult<T>
where
    F: FnOnce(Arc<dyn Session>) -> Fut,
    Fut: std::future::Future<Output = OpsResult<T>>,
{
    let session: Arc<dyn Session> = Arc::from(transport.open_session().await?);
    let result = f(Arc::clone(&session)).await;
    if let Err(close_err) = session.close().await {
        if result.is_ok() {
            return Err(close_err);
        }
        debug!(error = %close_err, "session close failed after operation error");
    }
    result
}
