//! Local-process transport: a child MCP server speaking newline-framed
//! JSON-RPC on stdin/stdout.
//!
//! Child lifecycle is tied to session scope: opening a session spawns the
//! process, closing the session terminates it. stderr is drained to tracing
//! for diagnostics only.
//!
//! Interior mutability follows the hybrid pattern used across the client:
//! parking_lot mutexes for maps that never cross an await, tokio mutexes for
//! the child handle and stdin writer which do.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex as SyncMutex;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{oneshot, Mutex as AsyncMutex};
use tokio::time::timeout;
use tracing::{debug, warn};

use opswatch_core::{OpsError, OpsResult, TransportIssue};

use crate::rpc::{
    call_tool_params, InitializeParams, JsonRpcRequest, JsonRpcResponse, ToolEntry,
    ToolsListResult,
};
use crate::transport::{HealthCache, Session, Transport, TransportKind};

/// Configuration for the local-process transport.
#[derive(Debug, Clone)]
pub struct LocalProcessConfig {
    /// Command to execute
    pub command: String,
    /// Arguments passed to the command
    pub args: Vec<String>,
    /// Extra environment variables for the child
    pub env: Vec<(String, String)>,
    /// Working directory for the child
    pub working_directory: Option<String>,
    /// Timeout for spawn + initialize handshake
    pub connect_timeout: Duration,
    /// Timeout for each request/response exchange
    pub request_timeout: Duration,
    /// Health-probe cache interval
    pub health_check_interval: Duration,
}

impl Default for LocalProcessConfig {
    fn default() -> Self {
        Self {
            command: String::new(),
            args: Vec::new(),
            env: Vec::new(),
            working_directory: None,
            connect_timeout: Duration::from_secs(30),
            request_timeout: Duration::from_secs(30),
            health_check_interval: Duration::from_secs(60),
        }
    }
}

type PendingMap = Arc<SyncMutex<HashMap<i64, oneshot::Sender<JsonRpcResponse>>>>;

/// Session over a spawned child process.
#[derive(Debug)]
struct LocalProcessSession {
    child: AsyncMutex<Option<Child>>,
    stdin: AsyncMutex<Option<ChildStdin>>,
    pending: PendingMap,
    next_id: AtomicI64,
    request_timeout: Duration,
    closed: AtomicBool,
    reader: SyncMutex<Option<tokio::task::JoinHandle<()>>>,
    stderr_drain: SyncMutex<Option<tokio::task::JoinHandle<()>>>,
    command: String,
}

impl LocalProcessSession {
    async fn request(&self, method: &str, params: Option<Value>) -> OpsResult<Value> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(OpsError::connection("session is closed").with_operation(method));
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id, tx);

        let request = JsonRpcRequest::new(id, method, params);
        let mut line = serde_json::to_string(&request)
            .map_err(|e| OpsError::validation(format!("cannot serialize request: {e}")))?;
        line.push('\n');

        {
            let mut stdin = self.stdin.lock().await;
            let Some(writer) = stdin.as_mut() else {
                self.pending.lock().remove(&id);
                return Err(OpsError::connection("child stdin is closed").with_operation(method));
            };
            if let Err(e) = writer.write_all(line.as_bytes()).await {
                self.pending.lock().remove(&id);
                return Err(OpsError::connection(format!("write to child failed: {e}"))
                    .with_operation(method));
            }
            if let Err(e) = writer.flush().await {
                self.pending.lock().remove(&id);
                return Err(OpsError::connection(format!("flush to child failed: {e}"))
                    .with_operation(method));
            }
        }

        match timeout(self.request_timeout, rx).await {
            Ok(Ok(response)) => response.into_result(method),
            Ok(Err(_)) => Err(OpsError::connection("child closed the response channel")
                .with_operation(method)),
            Err(_) => {
                self.pending.lock().remove(&id);
                Err(OpsError::timeout(format!(
                    "no response from {} within {:?}",
                    self.command, self.request_timeout
                ))
                .with_operation(method))
            }
        }
    }

    fn spawn_reader(
        pending: PendingMap,
        stdout: tokio::process::ChildStdout,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        let line = line.trim();
                        if line.is_empty() {
                            continue;
                        }
                        match serde_json::from_str::<JsonRpcResponse>(line) {
                            Ok(response) => {
                                let id = match &response.id {
                                    Some(crate::rpc::RequestId::Number(n)) => Some(*n),
                                    _ => None,
                                };
                                if let Some(id) = id {
                                    if let Some(tx) = pending.lock().remove(&id) {
                                        let _ = tx.send(response);
                                    } else {
                                        debug!(id, "dropping response with no pending request");
                                    }
                                } else {
                                    debug!("ignoring message without numeric id");
                                }
                            }
                            Err(e) => {
                                warn!(error = %e, "ignoring unparseable line from child");
                            }
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!(error = %e, "child stdout read failed");
                        break;
                    }
                }
            }
            // Wake every waiter; the child is gone.
            pending.lock().clear();
        })
    }
}

#[async_trait]
impl Session for LocalProcessSession {
    async fn list_tools(&self) -> OpsResult<Vec<String>> {
        Ok(self
            .list_tool_entries()
            .await?
            .into_iter()
            .map(|t| t.name)
            .collect())
    }

    async fn list_tool_entries(&self) -> OpsResult<Vec<ToolEntry>> {
        let result = self.request("tools/list", None).await?;
        let parsed: ToolsListResult = serde_json::from_value(result)
            .map_err(|e| OpsError::server(format!("malformed tools/list result: {e}")))?;
        Ok(parsed.tools)
    }

    async fn call_tool(&self, name: &str, args: Value) -> OpsResult<Value> {
        self.request("tools/call", Some(call_tool_params(name, &args)))
            .await
    }

    async fn close(&self) -> OpsResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        // Teardown may fail in several places; keep the first meaningful
        // error and continue releasing everything else.
        let mut first_error: Option<OpsError> = None;

        if let Some(handle) = self.reader.lock().take() {
            handle.abort();
        }
        if let Some(handle) = self.stderr_drain.lock().take() {
            handle.abort();
        }
        self.stdin.lock().await.take();
        if let Some(mut child) = self.child.lock().await.take() {
            if let Err(e) = child.kill().await {
                first_error.get_or_insert_with(|| {
                    OpsError::transport(
                        TransportIssue::Other,
                        format!("failed to terminate child: {e}"),
                    )
                });
            }
        }
        self.pending.lock().clear();
        debug!(command = %self.command, "local process session closed");
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

/// Transport that spawns a local MCP server per session.
#[derive(Debug)]
pub struct LocalProcessTransport {
    config: LocalProcessConfig,
    health: HealthCache,
    endpoint: String,
    closed: AtomicBool,
}

impl LocalProcessTransport {
    /// Create a new transport.
    ///
    /// # Errors
    /// Returns a `Transport/InvalidConfig` error when the command is empty.
    pub fn new(config: LocalProcessConfig) -> OpsResult<Self> {
        if config.command.trim().is_empty() {
            return Err(OpsError::transport(
                TransportIssue::InvalidConfig,
                "local process transport requires a command",
            ));
        }
        let endpoint = if config.args.is_empty() {
            config.command.clone()
        } else {
            format!("{} {}", config.command, config.args.join(" "))
        };
        let health_interval = config.health_check_interval;
        Ok(Self {
            config,
            health: HealthCache::new(health_interval),
            endpoint,
            closed: AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl Transport for LocalProcessTransport {
    async fn open_session(&self) -> OpsResult<Box<dyn Session>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(OpsError::connection("transport is closed"));
        }

        let mut command = Command::new(&self.config.command);
        command
            .args(&self.config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (key, value) in &self.config.env {
            command.env(key, value);
        }
        if let Some(dir) = &self.config.working_directory {
            command.current_dir(dir);
        }

        let mut child = command.spawn().map_err(|e| {
            OpsError::connection(format!("failed to spawn {}: {e}", self.config.command))
        })?;

        let stdout = child.stdout.take().ok_or_else(|| {
            OpsError::connection("child process has no stdout handle")
        })?;
        let stdin = child.stdin.take().ok_or_else(|| {
            OpsError::connection("child process has no stdin handle")
        })?;
        let stderr = child.stderr.take();

        let pending: PendingMap = Arc::new(SyncMutex::new(HashMap::new()));
        let reader = LocalProcessSession::spawn_reader(Arc::clone(&pending), stdout);

        let stderr_drain = stderr.map(|stderr| {
            let command_name = self.config.command.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(command = %command_name, "child stderr: {line}");
                }
            })
        });

        let session = LocalProcessSession {
            child: AsyncMutex::new(Some(child)),
            stdin: AsyncMutex::new(Some(stdin)),
            pending,
            next_id: AtomicI64::new(1),
            request_timeout: self.config.request_timeout,
            closed: AtomicBool::new(false),
            reader: SyncMutex::new(Some(reader)),
            stderr_drain: SyncMutex::new(stderr_drain),
            command: self.config.command.clone(),
        };

        // Initialize handshake, bounded by the connect timeout.
        let init = timeout(
            self.config.connect_timeout,
            session.request(
                "initialize",
                Some(serde_json::to_value(InitializeParams::default()).unwrap_or(Value::Null)),
            ),
        )
        .await;
        match init {
            Ok(Ok(_)) => Ok(Box::new(session)),
            Ok(Err(e)) => {
                let _ = session.close().await;
                Err(e.with_operation("initialize"))
            }
            Err(_) => {
                let _ = session.close().await;
                Err(OpsError::timeout(format!(
                    "initialize handshake with {} timed out after {:?}",
                    self.config.command, self.config.connect_timeout
                )))
            }
        }
    }

    async fn is_healthy(&self) -> bool {
        if self.closed.load(Ordering::SeqCst) {
            return false;
        }
        self.health
            .check(|| async { self.list_tools().await.is_ok() })
            .await
    }

    async fn close(&self) -> OpsResult<()> {
        self.closed.store(true, Ordering::SeqCst);
        self.health.invalidate().await;
        Ok(())
    }

    fn kind(&self) -> TransportKind {
        TransportKind::LocalProcess
    }

    fn endpoint(&self) -> &str {
        &self.endpoint
    }
}
