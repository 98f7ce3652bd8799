//! Request/response transport: one HTTP round trip per JSON-RPC call.
//!
//! Stateless per call and firewall-friendly. The session handshake is a
//! plain `initialize` POST; teardown invokes the closer returned at open
//! (a DELETE against the session endpoint when the server hands out a
//! session id, a no-op otherwise).

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex as SyncMutex;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde_json::Value;
use tokio::time::timeout;
use tracing::{debug, warn};

use opswatch_core::{OpsError, OpsResult, TransportIssue};

use crate::config::TransportSettings;
use crate::rpc::{
    call_tool_params, InitializeParams, JsonRpcRequest, JsonRpcResponse, ToolEntry,
    ToolsListResult,
};
use crate::transport::{HealthCache, Session, Transport, TransportKind};

/// Header carrying the server-assigned session id.
const SESSION_ID_HEADER: &str = "mcp-session-id";

/// Configuration for the request/response transport.
#[derive(Debug, Clone)]
pub struct RequestResponseConfig {
    /// RPC endpoint URL
    pub url: String,
    /// Timeout for connect + initialize
    pub connect_timeout: Duration,
    /// Timeout for each round trip
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

impl Default for RequestResponseConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            connect_timeout: Duration::from_secs(30),
            request_timeout: Duration::from_secs(30),
            health_check_interval: Duration::from_secs(60),
            auth_token: None,
            headers: Vec::new(),
            user_agent: concat!("opswatch-client/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

impl RequestResponseConfig {
    /// Derive a config from the shared transport settings.
    pub fn from_settings(url: impl Into<String>, settings: &TransportSettings) -> Self {
        Self {
            url: url.into(),
            connect_timeout: settings.connect_timeout,
            request_timeout: settings.read_timeout,
            headers: settings
                .custom_headers
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            ..Self::default()
        }
    }
}

fn map_reqwest_error(e: &reqwest::Error, operation: &str) -> OpsError {
    let err = if e.is_timeout() {
        OpsError::timeout(format!("request timed out: {e}"))
    } else if e.is_connect() {
        OpsError::connection(format!("connection failed: {e}"))
    } else if let Some(status) = e.status() {
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            OpsError::authentication(format!("server rejected credentials: {status}"))
        } else if status.is_server_error() {
            OpsError::server(format!("server returned {status}"))
        } else {
            OpsError::transport(TransportIssue::Other, format!("http error: {e}"))
        }
    } else {
        OpsError::transport(TransportIssue::Other, format!("http error: {e}"))
    };
    err.with_operation(operation)
}

/// One session over the request/response transport.
#[derive(Debug)]
struct RequestResponseSession {
    http: reqwest::Client,
    url: String,
    session_id: Option<String>,
    request_timeout: Duration,
    next_id: AtomicI64,
    closed: AtomicBool,
}

impl RequestResponseSession {
    async fn round_trip(&self, method: &str, params: Option<Value>) -> OpsResult<Value> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(OpsError::connection("session is closed").with_operation(method));
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let request = JsonRpcRequest::new(id, method, params);

        let mut builder = self.http.post(&self.url).json(&request);
        if let Some(session_id) = &self.session_id {
            builder = builder.header(SESSION_ID_HEADER, session_id);
        }

        let send = async {
            let response = builder
                .send()
                .await
                .map_err(|e| map_reqwest_error(&e, method))?;
            let status = response.status();
            if status == reqwest::StatusCode::UNAUTHORIZED
                || status == reqwest::StatusCode::FORBIDDEN
            {
                return Err(OpsError::authentication(format!(
                    "server rejected credentials: {status}"
                ))
                .with_operation(method)
                .with_server_url(&self.url));
            }
            if status.is_server_error() {
                return Err(OpsError::server(format!("server returned {status}"))
                    .with_operation(method)
                    .with_server_url(&self.url));
            }
            response
                .json::<JsonRpcResponse>()
                .await
                .map_err(|e| map_reqwest_error(&e, method))
        };

        let response = match timeout(self.request_timeout, send).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(OpsError::timeout(format!(
                    "{method} did not complete within {:?}",
                    self.request_timeout
                ))
                .with_operation(method)
                .with_server_url(&self.url));
            }
        };
        response.into_result(method)
    }
}

#[async_trait]
impl Session for RequestResponseSession {
    async fn list_tools(&self) -> OpsResult<Vec<String>> {
        Ok(self
            .list_tool_entries()
            .await?
            .into_iter()
            .map(|t| t.name)
            .collect())
    }

    async fn list_tool_entries(&self) -> OpsResult<Vec<ToolEntry>> {
        let result = self.round_trip("tools/list", None).await?;
        let parsed: ToolsListResult = serde_json::from_value(result)
            .map_err(|e| OpsError::server(format!("malformed tools/list result: {e}")))?;
        Ok(parsed.tools)
    }

    async fn call_tool(&self, name: &str, args: Value) -> OpsResult<Value> {
        self.round_trip("tools/call", Some(call_tool_params(name, &args)))
            .await
    }

    async fn close(&self) -> OpsResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        // The transport's closer: servers that issued a session id expect a
        // DELETE at teardown; best-effort, failures are logged only.
        if let Some(session_id) = &self.session_id {
            let result = self
                .http
                .delete(&self.url)
                .header(SESSION_ID_HEADER, session_id)
                .send()
                .await;
            if let Err(e) = result {
                debug!(error = %e, "session delete failed during teardown");
            }
        }
        Ok(())
    }
}

/// Transport performing one HTTP round trip per call.
#[derive(Debug)]
pub struct RequestResponseTransport {
    config: RequestResponseConfig,
    http: reqwest::Client,
    health: HealthCache,
    closed: AtomicBool,
    /// Session ids seen, for diagnostics
    last_session_id: SyncMutex<Option<String>>,
}

impl RequestResponseTransport {
    /// Create a new transport.
    ///
    /// # Errors
    /// Returns `Transport/InvalidConfig` for an empty or unparseable URL.
    pub fn new(config: RequestResponseConfig) -> OpsResult<Self> {
        if config.url.trim().is_empty() {
            return Err(OpsError::transport(
                TransportIssue::InvalidConfig,
                "request/response transport requires a URL",
            ));
        }
        url::Url::parse(&config.url).map_err(|e| {
            OpsError::transport(
                TransportIssue::InvalidConfig,
                format!("invalid URL {}: {e}", config.url),
            )
        })?;

        let mut headers = HeaderMap::new();
        for (key, value) in &config.headers {
            let name = HeaderName::try_from(key.as_str()).map_err(|e| {
                OpsError::transport(TransportIssue::InvalidConfig, format!("bad header name: {e}"))
            })?;
            let value = HeaderValue::try_from(value.as_str()).map_err(|e| {
                OpsError::transport(TransportIssue::InvalidConfig, format!("bad header value: {e}"))
            })?;
            headers.insert(name, value);
        }
        if let Some(token) = &config.auth_token {
            let value = HeaderValue::try_from(format!("Bearer {token}")).map_err(|e| {
                OpsError::transport(TransportIssue::InvalidConfig, format!("bad auth token: {e}"))
            })?;
            headers.insert(reqwest::header::AUTHORIZATION, value);
        }

        let http = reqwest::Client::builder()
            .user_agent(&config.user_agent)
            .default_headers(headers)
            .connect_timeout(config.connect_timeout)
            .build()
            .map_err(|e| {
                OpsError::transport(
                    TransportIssue::InvalidConfig,
                    format!("cannot build http client: {e}"),
                )
            })?;

        let health_interval = config.health_check_interval;
        Ok(Self {
            config,
            http,
            health: HealthCache::new(health_interval),
            closed: AtomicBool::new(false),
            last_session_id: SyncMutex::new(None),
        })
    }

    /// The most recent server-assigned session id, for diagnostics.
    pub fn last_session_id(&self) -> Option<String> {
        self.last_session_id.lock().clone()
    }
}

#[async_trait]
impl Transport for RequestResponseTransport {
    async fn open_session(&self) -> OpsResult<Box<dyn Session>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(OpsError::connection("transport is closed"));
        }

        let init_request = JsonRpcRequest::new(
            0,
            "initialize",
            Some(serde_json::to_value(InitializeParams::default()).unwrap_or(Value::Null)),
        );

        let handshake = async {
            let response = self
                .http
                .post(&self.config.url)
                .json(&init_request)
                .send()
                .await
                .map_err(|e| map_reqwest_error(&e, "initialize"))?;
            let session_id = response
                .headers()
                .get(SESSION_ID_HEADER)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            let status = response.status();
            if !status.is_success() {
                return Err(OpsError::connection(format!(
                    "initialize returned {status}"
                ))
                .with_server_url(&self.config.url));
            }
            let body: JsonRpcResponse = response
                .json()
                .await
                .map_err(|e| map_reqwest_error(&e, "initialize"))?;
            body.into_result("initialize")?;
            Ok(session_id)
        };

        let session_id = match timeout(self.config.connect_timeout, handshake).await {
            Ok(result) => result.map_err(|e: OpsError| e.with_server_url(&self.config.url))?,
            Err(_) => {
                return Err(OpsError::timeout(format!(
                    "initialize handshake with {} timed out after {:?}",
                    self.config.url, self.config.connect_timeout
                )));
            }
        };

        if session_id.is_some() {
            *self.last_session_id.lock() = session_id.clone();
        } else {
            warn!(url = %self.config.url, "server issued no session id; continuing stateless");
        }

        Ok(Box::new(RequestResponseSession {
            http: self.http.clone(),
            url: self.config.url.clone(),
            session_id,
            request_timeout: self.config.request_timeout,
            next_id: AtomicI64::new(1),
            closed: AtomicBool::new(false),
        }))
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
        TransportKind::RequestResponse
    }

    fn endpoint(&self) -> &str {
        &self.config.url
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_url_is_rejected() {
        let err = RequestResponseTransport::new(RequestResponseConfig::default()).unwrap_err();
        assert!(!err.is_retryable());
    }

    #[test]
    fn invalid_url_is_rejected() {
        let err = RequestResponseTransport::new(RequestResponseConfig {
            url: "not a url".into(),
            ..RequestResponseConfig::default()
        })
        .unwrap_err();
        assert_eq!(err.kind.label(), "transport");
    }

    #[test]
    fn from_settings_carries_timeouts_and_headers() {
        let mut settings = TransportSettings::default();
        settings.connect_timeout = Duration::from_secs(5);
        settings
            .custom_headers
            .insert("x-team".into(), "ops".into());
        let config = RequestResponseConfig::from_settings("http://localhost:9000/rpc", &settings);
        assert_eq!(config.connect_timeout, Duration::from_secs(5));
        assert_eq!(config.headers, vec![("x-team".into(), "ops".into())]);
    }

    #[tokio::test]
    async fn unreachable_server_yields_retryable_error() {
        // Port 9 (discard) is almost certainly closed.
        let transport = RequestResponseTransport::new(RequestResponseConfig {
            url: "http://127.0.0.1:9/rpc".into(),
            connect_timeout: Duration::from_millis(300),
            request_timeout: Duration::from_millis(300),
            ..RequestResponseConfig::default()
        })
        .unwrap();
        let err = transport.open_session().await.unwrap_err();
        assert!(err.is_retryable(), "got non-retryable {err}");
    }

    #[tokio::test]
    async fn closed_transport_refuses_sessions() {
        let transport = RequestResponseTransport::new(RequestResponseConfig {
            url: "http://127.0.0.1:9/rpc".into(),
            ..RequestResponseConfig::default()
        })
        .unwrap();
        transport.close().await.unwrap();
        assert!(transport.open_session().await.is_err());
    }
}
