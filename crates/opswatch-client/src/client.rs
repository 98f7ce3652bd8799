//! Unified MCP client: one transport plus policy.
//!
//! The client layers retry, a client-wide concurrency cap, per-operation
//! metrics, and tool discovery over a [`Transport`]. Every attempt of a
//! retried operation opens a fresh session; session reuse across operations
//! goes through [`Client::with_session`].

use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::Semaphore;
use tokio::time::timeout;
use tracing::{debug, error, warn};

use opswatch_core::{OpsError, OpsResult};

use crate::catalog::{ToolCatalog, ToolInfo};
use crate::config::ClientConfig;
use crate::metrics::ClientMetrics;
use crate::transport::{Session, Transport};

/// Uniform envelope returned to AI workflows that execute proposed tools.
#[derive(Debug, Clone, Serialize)]
pub struct ProposalOutcome {
    /// Whether the tool executed successfully
    pub success: bool,
    /// Tool result on success
    pub data: Option<Value>,
    /// Error record on failure
    pub error: Option<opswatch_core::ErrorRecord>,
    /// The tool that was invoked
    pub tool_used: String,
}

/// MCP client with transport abstraction, retry, and metrics.
pub struct Client {
    config: ClientConfig,
    transport: Arc<dyn Transport>,
    metrics: Arc<ClientMetrics>,
    semaphore: Arc<Semaphore>,
}

impl Client {
    /// Create a client over the given transport.
    ///
    /// # Errors
    /// Returns a `Configuration` error when the config tree is invalid.
    pub fn new(transport: Arc<dyn Transport>, config: ClientConfig) -> OpsResult<Self> {
        config.validate_strict()?;
        let semaphore = Arc::new(Semaphore::new(config.max_concurrent_requests));
        Ok(Self {
            config,
            transport,
            metrics: Arc::new(ClientMetrics::default()),
            semaphore,
        })
    }

    /// The client configuration.
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// The underlying transport.
    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// The metrics collector.
    pub fn metrics(&self) -> &Arc<ClientMetrics> {
        &self.metrics
    }

    /// Execute `op` with retry under the client-wide concurrency cap.
    ///
    /// Retries apply only to retryable error kinds; the delay between
    /// attempts comes from the retry policy. `max_retries = 0` means exactly
    /// one attempt. Each invocation of `op` is expected to open its own
    /// session, and each attempt is bounded by the client timeout.
    pub async fn execute_with_retry<T, F, Fut>(&self, operation: &str, mut op: F) -> OpsResult<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = OpsResult<T>>,
    {
        let _permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|_| OpsError::connection("client is shutting down"))?;

        let max_retries = self.config.retry_policy.max_retries;
        let mut attempt: u32 = 0;
        loop {
            let started = Instant::now();
            let result = match timeout(self.config.timeout, op()).await {
                Ok(result) => result,
                Err(_) => Err(OpsError::timeout(format!(
                    "{operation} exceeded the client deadline of {:?}",
                    self.config.timeout
                ))),
            };
            let elapsed = started.elapsed();

            match result {
                Ok(value) => {
                    self.metrics.record_success(operation, elapsed).await;
                    debug!(operation, elapsed_ms = elapsed.as_millis() as u64, "operation succeeded");
                    return Ok(value);
                }
                Err(err) => {
                    self.metrics
                        .record_failure(operation, elapsed, err.kind.label())
                        .await;
                    if err.is_retryable() && attempt < max_retries {
                        let delay = self.config.retry_policy.delay_for(attempt);
                        warn!(
                            operation,
                            attempt = attempt + 1,
                            delay_ms = delay.as_millis() as u64,
                            error = %err,
                            "operation failed, retrying"
                        );
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                        continue;
                    }
                    error!(operation, attempts = attempt + 1, error = %err, "operation failed");
                    return Err(err
                        .with_operation(operation)
                        .with_retry_count(attempt)
                        .with_server_url(self.transport.endpoint()));
                }
            }
        }
    }

    /// List tool names from the server.
    ///
    /// # Errors
    /// Propagates transport errors after retries are exhausted.
    pub async fn list_tools(&self) -> OpsResult<Vec<String>> {
        let transport = Arc::clone(&self.transport);
        self.execute_with_retry("list_tools", move || {
            let transport = Arc::clone(&transport);
            async move { transport.list_tools().await }
        })
        .await
    }

    /// Call a tool on the server.
    ///
    /// # Errors
    /// Propagates transport and tool errors after retries are exhausted.
    pub async fn call_tool(&self, name: &str, args: Value) -> OpsResult<Value> {
        let transport = Arc::clone(&self.transport);
        let tool = name.to_string();
        let operation = format!("call_tool({name})");
        self.execute_with_retry(&operation, move || {
            let transport = Arc::clone(&transport);
            let tool = tool.clone();
            let args = args.clone();
            async move { transport.call_tool(&tool, args).await }
        })
        .await
    }

    /// Run several operations against one session with guaranteed teardown.
    ///
    /// # Errors
    /// Propagates the closure's error; session close failures surface only
    /// when the closure succeeded.
    pub async fn with_session<T, F, Fut>(&self, f: F) -> OpsResult<T>
    where
        F: FnOnce(Arc<dyn Session>) -> Fut,
        Fut: std::future::Future<Output = OpsResult<T>>,
    {
        crate::transport::with_session(self.transport.as_ref(), f).await
    }

    /// Discover the tool catalog, enriching names with whatever per-tool
    /// metadata the server provides. Absent metadata is filled with
    /// defaults (`mcp_server: "unknown"`, empty parameter schema).
    ///
    /// # Errors
    /// Propagates transport errors after retries are exhausted.
    pub async fn discover_tools(&self) -> OpsResult<ToolCatalog> {
        let transport = Arc::clone(&self.transport);
        let entries = self
            .execute_with_retry("discover_tools", move || {
                let transport = Arc::clone(&transport);
                async move {
                    let session = transport.open_session().await?;
                    let result = session.list_tool_entries().await;
                    let close_result = session.close().await;
                    let entries = result?;
                    close_result?;
                    Ok(entries)
                }
            })
            .await?;

        let mut catalog = ToolCatalog::new();
        for entry in entries {
            catalog.insert(ToolInfo::from_entry(entry, None));
        }
        Ok(catalog)
    }

    /// Execute a proposed tool, wrapping the result in a uniform envelope
    /// suitable for AI workflows. This never returns `Err`; failures are
    /// folded into the envelope.
    pub async fn execute_proposed_tool(&self, name: &str, args: Value) -> ProposalOutcome {
        match self.call_tool(name, args).await {
            Ok(data) => ProposalOutcome {
                success: true,
                data: Some(data),
                error: None,
                tool_used: name.to_string(),
            },
            Err(err) => ProposalOutcome {
                success: false,
                data: None,
                error: Some(err.to_record()),
                tool_used: name.to_string(),
            },
        }
    }

    /// Whether the underlying transport currently probes healthy.
    pub async fn is_healthy(&self) -> bool {
        self.transport.is_healthy().await
    }

    /// Metrics snapshot.
    pub async fn metrics_summary(&self) -> Value {
        self.metrics.summary().await
    }

    /// Close the client and its transport. Idempotent.
    ///
    /// # Errors
    /// Propagates transport close failures.
    pub async fn close(&self) -> OpsResult<()> {
        self.transport.close().await
    }
}
