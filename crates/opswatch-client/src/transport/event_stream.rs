//! Event-stream transport: server-push SSE reads paired with HTTP POST
//! writes.
//!
//! The client opens a long-lived `text/event-stream` GET, then issues
//! JSON-RPC requests on a paired POST channel. Responses arrive either
//! inline on the POST reply or asynchronously as SSE frames correlated by
//! request id. The `initialize` handshake runs before any tool call.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex as SyncMutex;
use reqwest::header;
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::time::timeout;
use tracing::{debug, warn};

use opswatch_core::{OpsError, OpsResult, TransportIssue};

use crate::rpc::{
    call_tool_params, InitializeParams, JsonRpcRequest, JsonRpcResponse, RequestId, ToolEntry,
    ToolsListResult,
};
use crate::transport::{HealthCache, Session, Transport, TransportKind};

/// Configuration for the event-stream transport.
#[derive(Debug, Clone)]
pub struct EventStreamConfig {
    /// Base URL of the MCP server
    pub base_url: String,
    /// SSE endpoint path relative to the base URL
    pub sse_path: String,
    /// POST endpoint path relative to the base URL
    pub post_path: String,
    /// Timeout for connect + initialize
    pub connect_timeout: Duration,
    /// Timeout for each request/response exchange
    pub request_timeout: Duration,
    /// Health-probe cache interval
    pub health_check_interval: Duration,
    /// Bearer token, when the server requires one
    pub auth_token: Option<String>,
    /// Extra headers on every request
    pub headers: Vec<(String, String)>,
    /// User agent string
    pub user_agent: String,
}

impl Default for EventStreamConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            sse_path: "/sse".to_string(),
            post_path: "/rpc".to_string(),
            connect_timeout: Duration::from_secs(30),
            request_timeout: Duration::from_secs(30),
            health_check_interval: Duration::from_secs(60),
            auth_token: None,
            headers: Vec::new(),
            user_agent: concat!("opswatch-client/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

type PendingMap = Arc<SyncMutex<HashMap<i64, oneshot::Sender<JsonRpcResponse>>>>;

/// Parse accumulated SSE text into complete events, delivering each `data:`
/// payload that parses as a JSON-RPC response to its pending waiter.
fn drain_sse_buffer(buffer: &mut String, pending: &PendingMap) {
    while let Some(pos) = buffer.find("\n\n") {
        let event_text = buffer[..pos].to_string();
        buffer.drain(..pos + 2);

        let mut data_lines = Vec::new();
        for line in event_text.lines() {
            if let Some(rest) = line.strip_prefix("data:") {
                data_lines.push(rest.trim_start());
            }
            // `event:`, `id:`, `retry:` and comment lines are irrelevant to
            // call correlation.
        }
        if data_lines.is_empty() {
            continue;
        }
        let payload = data_lines.join("\n");
        match serde_json::from_str::<JsonRpcResponse>(&payload) {
            Ok(response) => {
                if let Some(RequestId::Number(id)) = response.id {
                    if let Some(tx) = pending.lock().remove(&id) {
                        let _ = tx.send(response);
                    } else {
                        debug!(id, "dropping SSE response with no pending request");
                    }
                }
            }
            Err(e) => debug!(error = %e, "ignoring non-response SSE frame"),
        }
    }
}

/// One session over the event-stream transport.
#[derive(Debug)]
struct EventStreamSession {
    http: reqwest::Client,
    post_url: String,
    pending: PendingMap,
    next_id: AtomicI64,
    request_timeout: Duration,
    closed: AtomicBool,
    reader: SyncMutex<Option<tokio::task::JoinHandle<()>>>,
}

impl EventStreamSession {
    async fn request(&self, method: &str, params: Option<Value>) -> OpsResult<Value> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(OpsError::connection("session is closed").with_operation(method));
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id, tx);

        let request = JsonRpcRequest::new(id, method, params);
        let post = self.http.post(&self.post_url).json(&request).send();

        let exchange = async {
            let response = post.await.map_err(|e| {
                if e.is_timeout() {
                    OpsError::timeout(format!("post failed: {e}"))
                } else {
                    OpsError::connection(format!("post failed: {e}"))
                }
            })?;
            let status = response.status();
            if status.is_server_error() {
                return Err(OpsError::server(format!("server returned {status}")));
            }
            // Some servers answer inline instead of over the stream.
            if let Ok(body) = response.json::<JsonRpcResponse>().await {
                if matches!(body.id, Some(RequestId::Number(n)) if n == id) {
                    return Ok(Some(body));
                }
            }
            Ok(None)
        };

        let result = timeout(self.request_timeout, async {
            match exchange.await? {
                Some(inline) => Ok(inline),
                None => rx.await.map_err(|_| {
                    OpsError::connection("event stream closed before the response arrived")
                }),
            }
        })
        .await;

        match result {
            Ok(Ok(response)) => {
                // Inline responses leave their correlation entry behind.
                self.pending.lock().remove(&id);
                response.into_result(method)
            }
            Ok(Err(e)) => {
                self.pending.lock().remove(&id);
                Err(e.with_operation(method).with_server_url(&self.post_url))
            }
            Err(_) => {
                self.pending.lock().remove(&id);
                Err(OpsError::timeout(format!(
                    "{method} did not complete within {:?}",
                    self.request_timeout
                ))
                .with_operation(method)
                .with_server_url(&self.post_url))
            }
        }
    }
}

#[async_trait]
impl Session for EventStreamSession {
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
        if let Some(handle) = self.reader.lock().take() {
            handle.abort();
        }
        self.pending.lock().clear();
        debug!(url = %self.post_url, "event stream session closed");
        Ok(())
    }
}

/// Transport reading a server-push event stream and writing request frames
/// on a paired POST channel.
#[derive(Debug)]
pub struct EventStreamTransport {
    config: EventStreamConfig,
    http: reqwest::Client,
    health: HealthCache,
    closed: AtomicBool,
    sse_url: String,
    post_url: String,
}

impl EventStreamTransport {
    /// Create a new transport.
    ///
    /// # Errors
    /// Returns `Transport/InvalidConfig` for an empty or unparseable base URL.
    pub fn new(config: EventStreamConfig) -> OpsResult<Self> {
        if config.base_url.trim().is_empty() {
            return Err(OpsError::transport(
                TransportIssue::InvalidConfig,
                "event stream transport requires a base URL",
            ));
        }
        url::Url::parse(&config.base_url).map_err(|e| {
            OpsError::transport(
                TransportIssue::InvalidConfig,
                format!("invalid base URL {}: {e}", config.base_url),
            )
        })?;

        let mut default_headers = header::HeaderMap::new();
        for (key, value) in &config.headers {
            let name = header::HeaderName::try_from(key.as_str()).map_err(|e| {
                OpsError::transport(TransportIssue::InvalidConfig, format!("bad header name: {e}"))
            })?;
            let value = header::HeaderValue::try_from(value.as_str()).map_err(|e| {
                OpsError::transport(TransportIssue::InvalidConfig, format!("bad header value: {e}"))
            })?;
            default_headers.insert(name, value);
        }
        if let Some(token) = &config.auth_token {
            let value = header::HeaderValue::try_from(format!("Bearer {token}")).map_err(|e| {
                OpsError::transport(TransportIssue::InvalidConfig, format!("bad auth token: {e}"))
            })?;
            default_headers.insert(header::AUTHORIZATION, value);
        }

        let http = reqwest::Client::builder()
            .user_agent(&config.user_agent)
            .default_headers(default_headers)
            .connect_timeout(config.connect_timeout)
            .build()
            .map_err(|e| {
                OpsError::transport(
                    TransportIssue::InvalidConfig,
                    format!("cannot build http client: {e}"),
                )
            })?;

        let sse_url = format!("{}{}", config.base_url, config.sse_path);
        let post_url = format!("{}{}", config.base_url, config.post_path);
        let health_interval = config.health_check_interval;
        Ok(Self {
            config,
            http,
            health: HealthCache::new(health_interval),
            closed: AtomicBool::new(false),
            sse_url,
            post_url,
        })
    }
}

#[async_trait]
impl Transport for EventStreamTransport {
    async fn open_session(&self) -> OpsResult<Box<dyn Session>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(OpsError::connection("transport is closed"));
        }

        // Establish the SSE stream first; the paired POST channel is useless
        // without it.
        let connect = async {
            let response = self
                .http
                .get(&self.sse_url)
                .header(header::ACCEPT, "text/event-stream")
                .header(header::CACHE_CONTROL, "no-cache")
                .send()
                .await
                .map_err(|e| {
                    if e.is_timeout() {
                        OpsError::timeout(format!("sse connect failed: {e}"))
                    } else {
                        OpsError::connection(format!("sse connect failed: {e}"))
                    }
                })?;
            if !response.status().is_success() {
                return Err(OpsError::connection(format!(
                    "sse endpoint returned {}",
                    response.status()
                )));
            }
            Ok(response)
        };

        let response = match timeout(self.config.connect_timeout, connect).await {
            Ok(result) => result.map_err(|e| e.with_server_url(&self.sse_url))?,
            Err(_) => {
                return Err(OpsError::timeout(format!(
                    "sse connect to {} timed out after {:?}",
                    self.sse_url, self.config.connect_timeout
                )));
            }
        };

        let pending: PendingMap = Arc::new(SyncMutex::new(HashMap::new()));
        let reader_pending = Arc::clone(&pending);
        let sse_url = self.sse_url.clone();
        let reader = tokio::spawn(async move {
            let mut stream = response.bytes_stream();
            let mut buffer = String::new();
            while let Some(chunk) = stream.next().await {
                match chunk {
                    Ok(bytes) => {
                        buffer.push_str(&String::from_utf8_lossy(&bytes));
                        drain_sse_buffer(&mut buffer, &reader_pending);
                    }
                    Err(e) => {
                        warn!(url = %sse_url, error = %e, "sse stream read failed");
                        break;
                    }
                }
            }
            // Stream ended: fail every waiter by dropping its sender.
            reader_pending.lock().clear();
            debug!(url = %sse_url, "sse stream ended");
        });

        let session = EventStreamSession {
            http: self.http.clone(),
            post_url: self.post_url.clone(),
            pending,
            next_id: AtomicI64::new(1),
            request_timeout: self.config.request_timeout,
            closed: AtomicBool::new(false),
            reader: SyncMutex::new(Some(reader)),
        };

        // Protocol handshake before any tool call.
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
                Err(e)
            }
            Err(_) => {
                let _ = session.close().await;
                Err(OpsError::timeout(format!(
                    "initialize handshake with {} timed out after {:?}",
                    self.post_url, self.config.connect_timeout
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
        TransportKind::EventStream
    }

    fn endpoint(&self) -> &str {
        &self.config.base_url
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pending_with(id: i64) -> (PendingMap, oneshot::Receiver<JsonRpcResponse>) {
        let pending: PendingMap = Arc::new(SyncMutex::new(HashMap::new()));
        let (tx, rx) = oneshot::channel();
        pending.lock().insert(id, tx);
        (pending, rx)
    }

    #[test]
    fn empty_base_url_is_rejected() {
        let err = EventStreamTransport::new(EventStreamConfig::default()).unwrap_err();
        assert!(!err.is_retryable());
    }

    #[test]
    fn sse_buffer_routes_by_request_id() {
        let (pending, mut rx) = pending_with(7);
        let mut buffer = String::from(
            "event: message\ndata: {\"jsonrpc\":\"2.0\",\"id\":7,\"result\":{\"ok\":true}}\n\npartial",
        );
        drain_sse_buffer(&mut buffer, &pending);
        assert_eq!(buffer, "partial");
        let response = rx.try_recv().unwrap();
        assert_eq!(response.result.unwrap()["ok"], true);
        assert!(pending.lock().is_empty());
    }

    #[test]
    fn sse_buffer_joins_multi_line_data() {
        let (pending, mut rx) = pending_with(1);
        let mut buffer = String::from(
            "data: {\"jsonrpc\":\"2.0\",\ndata: \"id\":1,\"result\":null}\n\n",
        );
        drain_sse_buffer(&mut buffer, &pending);
        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn sse_buffer_ignores_unknown_ids_and_comments() {
        let (pending, mut rx) = pending_with(3);
        let mut buffer = String::from(
            ": keep-alive\n\ndata: {\"jsonrpc\":\"2.0\",\"id\":99,\"result\":null}\n\n",
        );
        drain_sse_buffer(&mut buffer, &pending);
        assert!(rx.try_recv().is_err());
        assert_eq!(pending.lock().len(), 1);
    }

    #[test]
    fn urls_are_composed_from_paths() {
        let transport = EventStreamTransport::new(EventStreamConfig {
            base_url: "http://localhost:8082".into(),
            ..EventStreamConfig::default()
        })
        .unwrap();
        assert_eq!(transport.sse_url, "http://localhost:8082/sse");
        assert_eq!(transport.post_url, "http://localhost:8082/rpc");
        assert_eq!(transport.kind(), TransportKind::EventStream);
    }

    #[tokio::test]
    async fn unreachable_server_yields_retryable_error() {
        let transport = EventStreamTransport::new(EventStreamConfig {
            base_url: "http://127.0.0.1:9".into(),
            connect_timeout: Duration::from_millis(300),
            request_timeout: Duration::from_millis(300),
            ..EventStreamConfig::default()
        })
        .unwrap();
        let err = transport.open_session().await.unwrap_err();
        assert!(err.is_retryable(), "got non-retryable {err}");
    }
}
