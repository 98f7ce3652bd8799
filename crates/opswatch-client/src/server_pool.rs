//! Multi-server pool with load balancing and priority failover.
//!
//! Each named server owns its own [`ConnectionPool`]. Tool calls go to the
//! preferred server first; on failure the pool walks the remaining healthy
//! servers in precedence order (priority 1 first, ties by insertion order)
//! until one succeeds or all are exhausted.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex as SyncMutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use opswatch_core::{OpsError, OpsResult};

use crate::config::TransportSettings;
use crate::metrics::ClientMetrics;
use crate::pool::{default_transport_factory, ConnectionPool, PoolConfig, TransportFactory};

/// Internal cap on a single server health probe.
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Load-balancing strategies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalanceStrategy {
    /// Rotate through candidates
    #[default]
    RoundRobin,
    /// Prefer the candidate with the fewest live connections
    LeastConnections,
    /// Pick uniformly at random
    Random,
    /// Rotate with per-server weights
    WeightedRoundRobin,
}

/// Configuration of one server in the pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerDescriptor {
    /// Server name, unique within the pool
    pub name: String,
    /// Candidate URLs; never empty
    pub urls: Vec<String>,
    /// Load-balancing weight (≥ 1)
    pub weight: u32,
    /// Failover precedence: 1 is tried first
    pub priority: u32,
    /// Connection pool size for this server
    pub max_connections: usize,
    /// Health probe interval
    #[serde(with = "opswatch_core::serde_duration")]
    pub health_check_interval: Duration,
    /// Per-operation timeout on this server
    #[serde(with = "opswatch_core::serde_duration")]
    pub timeout: Duration,
}

impl ServerDescriptor {
    /// Create a descriptor with defaults for everything but name and URLs.
    ///
    /// # Errors
    /// Returns a `Validation` error for an empty URL list.
    pub fn new(name: impl Into<String>, urls: Vec<String>) -> OpsResult<Self> {
        let descriptor = Self {
            name: name.into(),
            urls,
            weight: 1,
            priority: 1,
            max_connections: 10,
            health_check_interval: Duration::from_secs(60),
            timeout: Duration::from_secs(30),
        };
        descriptor.validate()?;
        Ok(descriptor)
    }

    /// Validate field ranges.
    ///
    /// # Errors
    /// Returns a `Validation` error naming the offending field.
    pub fn validate(&self) -> OpsResult<()> {
        if self.urls.is_empty() {
            return Err(OpsError::validation(format!(
                "server '{}' must have at least one URL",
                self.name
            )));
        }
        if self.weight < 1 {
            return Err(OpsError::validation("weight must be at least 1"));
        }
        if self.priority < 1 {
            return Err(OpsError::validation("priority must be at least 1"));
        }
        if self.max_connections < 1 {
            return Err(OpsError::validation("max_connections must be at least 1"));
        }
        Ok(())
    }

    /// Set the failover precedence.
    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    /// Set the load-balancing weight.
    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }
}

struct ServerSlot {
    descriptor: ServerDescriptor,
    pool: Arc<ConnectionPool>,
    healthy: SyncMutex<bool>,
    url_cursor: AtomicUsize,
}

/// Pool of named servers with load balancing and failover.
pub struct ServerPool {
    /// Slots ordered by precedence (priority, then insertion order)
    servers: Vec<Arc<ServerSlot>>,
    strategy: LoadBalanceStrategy,
    metrics: Arc<ClientMetrics>,
    server_cursor: AtomicUsize,
    health_task: SyncMutex<Option<tokio::task::JoinHandle<()>>>,
    health_check_interval: Duration,
}

impl ServerPool {
    /// Create a server pool with the default transport factory.
    ///
    /// # Errors
    /// Returns a `Validation` error when any descriptor is invalid or a
    /// name is duplicated.
    pub fn new(
        descriptors: Vec<ServerDescriptor>,
        strategy: LoadBalanceStrategy,
    ) -> OpsResult<Arc<Self>> {
        Self::with_factory(descriptors, strategy, default_transport_factory())
    }

    /// Create a server pool with a custom transport factory.
    ///
    /// # Errors
    /// Returns a `Validation` error when any descriptor is invalid or a
    /// name is duplicated.
    pub fn with_factory(
        descriptors: Vec<ServerDescriptor>,
        strategy: LoadBalanceStrategy,
        factory: TransportFactory,
    ) -> OpsResult<Arc<Self>> {
        let mut seen = std::collections::HashSet::new();
        for descriptor in &descriptors {
            descriptor.validate()?;
            if !seen.insert(descriptor.name.clone()) {
                return Err(OpsError::validation(format!(
                    "duplicate server name '{}'",
                    descriptor.name
                )));
            }
        }

        // Stable sort keeps insertion order among equal priorities.
        let mut ordered: Vec<ServerDescriptor> = descriptors;
        ordered.sort_by_key(|d| d.priority);

        let health_check_interval = ordered
            .iter()
            .map(|d| d.health_check_interval)
            .min()
            .unwrap_or(Duration::from_secs(60));

        let servers = ordered
            .into_iter()
            .map(|descriptor| {
                let pool = ConnectionPool::with_factory(
                    PoolConfig {
                        max_size: descriptor.max_connections,
                        health_check_interval: descriptor.health_check_interval,
                        transport: TransportSettings::default(),
                        ..PoolConfig::default()
                    },
                    Arc::clone(&factory),
                );
                Arc::new(ServerSlot {
                    descriptor,
                    pool,
                    healthy: SyncMutex::new(true),
                    url_cursor: AtomicUsize::new(0),
                })
            })
            .collect();

        Ok(Arc::new(Self {
            servers,
            strategy,
            metrics: Arc::new(ClientMetrics::default()),
            server_cursor: AtomicUsize::new(0),
            health_task: SyncMutex::new(None),
            health_check_interval,
        }))
    }

    /// The pool's metrics collector.
    pub fn metrics(&self) -> &Arc<ClientMetrics> {
        &self.metrics
    }

    fn slot(&self, name: &str) -> Option<&Arc<ServerSlot>> {
        self.servers.iter().find(|s| s.descriptor.name == name)
    }

    /// Current health verdict per server.
    pub fn server_health(&self) -> BTreeMap<String, bool> {
        self.servers
            .iter()
            .map(|s| (s.descriptor.name.clone(), *s.healthy.lock()))
            .collect()
    }

    /// A healthy server name: the given one when it is healthy, otherwise
    /// one chosen by the load-balance strategy (or `None`).
    pub fn healthy_server(&self, name: Option<&str>) -> Option<String> {
        if let Some(name) = name {
            let slot = self.slot(name)?;
            return slot.healthy.lock().then(|| name.to_string());
        }
        let healthy: Vec<&Arc<ServerSlot>> =
            self.servers.iter().filter(|s| *s.healthy.lock()).collect();
        if healthy.is_empty() {
            return None;
        }
        let chosen = match self.strategy {
            LoadBalanceStrategy::RoundRobin => {
                let index = self.server_cursor.fetch_add(1, Ordering::Relaxed);
                healthy[index % healthy.len()]
            }
            LoadBalanceStrategy::Random => healthy[fastrand::usize(..healthy.len())],
            LoadBalanceStrategy::WeightedRoundRobin => {
                let total: u32 = healthy.iter().map(|s| s.descriptor.weight).sum();
                let mut slot = (self.server_cursor.fetch_add(1, Ordering::Relaxed) as u32) % total;
                let mut pick = healthy[0];
                for candidate in &healthy {
                    if slot < candidate.descriptor.weight {
                        pick = candidate;
                        break;
                    }
                    slot -= candidate.descriptor.weight;
                }
                pick
            }
            // Precedence order approximates least load without async state.
            LoadBalanceStrategy::LeastConnections => healthy[0],
        };
        Some(chosen.descriptor.name.clone())
    }

    /// Select a URL from a server's candidate list per the strategy.
    fn select_url(&self, slot: &ServerSlot) -> String {
        let urls = &slot.descriptor.urls;
        match self.strategy {
            LoadBalanceStrategy::RoundRobin | LoadBalanceStrategy::WeightedRoundRobin => {
                let index = slot.url_cursor.fetch_add(1, Ordering::Relaxed);
                urls[index % urls.len()].clone()
            }
            LoadBalanceStrategy::Random => urls[fastrand::usize(..urls.len())].clone(),
            LoadBalanceStrategy::LeastConnections => urls[0].clone(),
        }
    }

    async fn execute_on_server(
        &self,
        slot: &Arc<ServerSlot>,
        tool_name: &str,
        arguments: &Value,
    ) -> OpsResult<Value> {
        let server = &slot.descriptor.name;
        if !*slot.healthy.lock() {
            return Err(OpsError::connection(format!("server '{server}' is not healthy"))
                .with_operation(tool_name));
        }
        let url = self.select_url(slot);
        let conn = slot.pool.acquire(&url, Some(server)).await?;
        let started = std::time::Instant::now();
        let operation = format!("call_tool({tool_name})@{server}");
        let result = timeout(
            slot.descriptor.timeout,
            conn.transport.call_tool(tool_name, arguments.clone()),
        )
        .await;
        let elapsed = started.elapsed();

        let outcome = match result {
            Ok(Ok(value)) => {
                self.metrics.record_success(&operation, elapsed).await;
                Ok(value)
            }
            Ok(Err(err)) => {
                self.metrics
                    .record_failure(&operation, elapsed, err.kind.label())
                    .await;
                Err(err.with_server_url(&url))
            }
            Err(_) => {
                let err = OpsError::timeout(format!(
                    "tool '{tool_name}' timed out after {:?} on '{server}'",
                    slot.descriptor.timeout
                ))
                .with_server_url(&url);
                self.metrics
                    .record_failure(&operation, elapsed, err.kind.label())
                    .await;
                Err(err)
            }
        };
        slot.pool.release(&conn).await;
        outcome
    }

    /// Execute a tool call with failover.
    ///
    /// The preferred server is tried first (when healthy); on failure the
    /// remaining healthy servers are tried in precedence order.
    ///
    /// # Errors
    /// Returns a `Validation` error for an unknown preferred server and a
    /// `Server` error when every server failed.
    pub async fn execute_tool_call(
        &self,
        preferred_server: &str,
        tool_name: &str,
        arguments: Value,
    ) -> OpsResult<Value> {
        let preferred = self
            .slot(preferred_server)
            .ok_or_else(|| OpsError::validation(format!("unknown server '{preferred_server}'")))?;

        match self.execute_on_server(preferred, tool_name, &arguments).await {
            Ok(value) => return Ok(value),
            Err(e) => {
                warn!(server = %preferred_server, tool = %tool_name, error = %e, "preferred server failed, failing over");
            }
        }

        for slot in &self.servers {
            if slot.descriptor.name == preferred_server || !*slot.healthy.lock() {
                continue;
            }
            match self.execute_on_server(slot, tool_name, &arguments).await {
                Ok(value) => {
                    debug!(server = %slot.descriptor.name, tool = %tool_name, "failover succeeded");
                    return Ok(value);
                }
                Err(e) => {
                    warn!(server = %slot.descriptor.name, tool = %tool_name, error = %e, "failover attempt failed");
                }
            }
        }

        Err(OpsError::server(format!(
            "all servers failed to execute tool {tool_name}"
        ))
        .with_operation(tool_name))
    }

    /// Probe every server once, toggling its health flag. A server marked
    /// unhealthy becomes eligible again after a successful probe.
    pub async fn check_server_health(&self) {
        for slot in &self.servers {
            let server = &slot.descriptor.name;
            let url = &slot.descriptor.urls[0];
            let verdict = match slot.pool.acquire(url, Some(server)).await {
                Ok(conn) => {
                    let probe = timeout(PROBE_TIMEOUT, conn.transport.list_tools()).await;
                    slot.pool.release(&conn).await;
                    matches!(probe, Ok(Ok(_)))
                }
                Err(e) => {
                    debug!(server = %server, error = %e, "health probe could not acquire a connection");
                    false
                }
            };
            let mut healthy = slot.healthy.lock();
            if *healthy != verdict {
                if verdict {
                    info!(server = %server, "server recovered");
                } else {
                    warn!(server = %server, "server marked unhealthy");
                }
            }
            *healthy = verdict;
        }
    }

    /// Start the background health loop. No-op when already running.
    pub fn start_health_checking(self: &Arc<Self>) {
        let mut task = self.health_task.lock();
        if task.as_ref().is_some_and(|t| !t.is_finished()) {
            return;
        }
        let pool = Arc::clone(self);
        let interval = self.health_check_interval;
        *task = Some(tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                pool.check_server_health().await;
            }
        }));
        info!("started server pool health checking");
    }

    /// Stop the background health loop.
    pub fn stop_health_checking(&self) {
        if let Some(task) = self.health_task.lock().take() {
            task.abort();
            info!("stopped server pool health checking");
        }
    }

    /// Close every per-server connection pool. Idempotent.
    pub async fn close(&self) {
        self.stop_health_checking();
        for slot in &self.servers {
            slot.pool.close().await;
        }
        info!("server pool closed");
    }

    /// Pool statistics.
    pub async fn stats(&self) -> Value {
        let mut pools = BTreeMap::new();
        for slot in &self.servers {
            pools.insert(slot.descriptor.name.clone(), slot.pool.stats().await);
        }
        let health = self.server_health();
        serde_json::json!({
            "total_servers": self.servers.len(),
            "healthy_servers": health.values().filter(|h| **h).count(),
            "server_health": health,
            "connection_pools": pools,
        })
    }

    /// Force a server's health flag; probes may override it later.
    pub fn set_server_health(&self, name: &str, healthy: bool) {
        if let Some(slot) = self.slot(name) {
            *slot.healthy.lock() = healthy;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::HashMap;

    use crate::transport::{Session, Transport, TransportKind};

    /// Transport whose behavior is keyed by URL substring.
    struct KeyedTransport {
        endpoint: String,
        failing: bool,
    }

    #[async_trait]
    impl Transport for KeyedTransport {
        async fn open_session(&self) -> OpsResult<Box<dyn Session>> {
            Err(OpsError::connection("no sessions in tests"))
        }

        async fn list_tools(&self) -> OpsResult<Vec<String>> {
            if self.failing {
                Err(OpsError::connection("probe refused"))
            } else {
                Ok(vec!["list_items".into()])
            }
        }

        async fn call_tool(&self, name: &str, _args: Value) -> OpsResult<Value> {
            if self.failing {
                Err(OpsError::connection("call refused"))
            } else {
                Ok(serde_json::json!({"tool": name, "served_by": self.endpoint}))
            }
        }

        async fn is_healthy(&self) -> bool {
            !self.failing
        }

        async fn close(&self) -> OpsResult<()> {
            Ok(())
        }

        fn kind(&self) -> TransportKind {
            TransportKind::RequestResponse
        }

        fn endpoint(&self) -> &str {
            &self.endpoint
        }
    }

    fn keyed_factory(failing_hosts: Vec<&'static str>) -> TransportFactory {
        let failing: HashMap<String, ()> =
            failing_hosts.into_iter().map(|h| (h.to_string(), ())).collect();
        Arc::new(move |url, _settings| {
            let fails = failing.keys().any(|host| url.contains(host));
            Ok(Arc::new(KeyedTransport {
                endpoint: url.to_string(),
                failing: fails,
            }) as Arc<dyn Transport>)
        })
    }

    fn descriptor(name: &str, url: &str, priority: u32) -> ServerDescriptor {
        ServerDescriptor::new(name, vec![url.to_string()])
            .unwrap()
            .with_priority(priority)
    }

    #[test]
    fn empty_urls_are_rejected() {
        assert!(ServerDescriptor::new("a", vec![]).is_err());
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let result = ServerPool::new(
            vec![
                descriptor("a", "http://a/rpc", 1),
                descriptor("a", "http://b/rpc", 2),
            ],
            LoadBalanceStrategy::RoundRobin,
        );
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn failover_walks_to_the_next_healthy_server() {
        let pool = ServerPool::with_factory(
            vec![
                descriptor("A", "http://server-a/rpc", 1),
                descriptor("B", "http://server-b/rpc", 2),
            ],
            LoadBalanceStrategy::RoundRobin,
            keyed_factory(vec!["server-a"]),
        )
        .unwrap();

        let result = pool
            .execute_tool_call("A", "list_items", serde_json::json!({}))
            .await
            .unwrap();
        assert!(result["served_by"].as_str().unwrap().contains("server-b"));

        // A's attempt is a recorded failure, B's a recorded success.
        let a_stats = pool.metrics().operation_stats("call_tool(list_items)@A").await.unwrap();
        assert_eq!(a_stats.failed_requests, 1);
        let b_stats = pool.metrics().operation_stats("call_tool(list_items)@B").await.unwrap();
        assert_eq!(b_stats.successful_requests, 1);

        // A health probe marks A unhealthy.
        pool.check_server_health().await;
        assert_eq!(pool.server_health()["A"], false);
        assert_eq!(pool.server_health()["B"], true);
    }

    #[tokio::test]
    async fn all_servers_failing_raises_server_error() {
        let pool = ServerPool::with_factory(
            vec![
                descriptor("A", "http://server-a/rpc", 1),
                descriptor("B", "http://server-b/rpc", 2),
            ],
            LoadBalanceStrategy::RoundRobin,
            keyed_factory(vec!["server-a", "server-b"]),
        )
        .unwrap();

        let err = pool
            .execute_tool_call("A", "list_items", serde_json::json!({}))
            .await
            .unwrap_err();
        assert_eq!(err.kind.label(), "server");
        assert!(err.message.contains("all servers failed"));
    }

    #[tokio::test]
    async fn unknown_preferred_server_is_a_validation_error() {
        let pool = ServerPool::with_factory(
            vec![descriptor("A", "http://server-a/rpc", 1)],
            LoadBalanceStrategy::RoundRobin,
            keyed_factory(vec![]),
        )
        .unwrap();
        let err = pool
            .execute_tool_call("nope", "t", Value::Null)
            .await
            .unwrap_err();
        assert_eq!(err.kind.label(), "validation");
    }

    #[tokio::test]
    async fn unhealthy_servers_are_skipped_during_failover() {
        let pool = ServerPool::with_factory(
            vec![
                descriptor("A", "http://server-a/rpc", 1),
                descriptor("B", "http://server-b/rpc", 2),
                descriptor("C", "http://server-c/rpc", 3),
            ],
            LoadBalanceStrategy::RoundRobin,
            keyed_factory(vec!["server-a"]),
        )
        .unwrap();
        // B is administratively down; failover must land on C.
        pool.set_server_health("B", false);

        let result = pool
            .execute_tool_call("A", "t", Value::Null)
            .await
            .unwrap();
        assert!(result["served_by"].as_str().unwrap().contains("server-c"));
        assert!(pool.metrics().operation_stats("call_tool(t)@B").await.is_none());
    }

    #[tokio::test]
    async fn recovered_server_becomes_eligible_after_probe() {
        let pool = ServerPool::with_factory(
            vec![descriptor("A", "http://server-a/rpc", 1)],
            LoadBalanceStrategy::RoundRobin,
            keyed_factory(vec![]),
        )
        .unwrap();
        pool.set_server_health("A", false);
        assert!(pool.healthy_server(Some("A")).is_none());

        pool.check_server_health().await;
        assert_eq!(pool.healthy_server(Some("A")).as_deref(), Some("A"));
    }

    #[tokio::test]
    async fn round_robin_rotates_across_healthy_servers() {
        let pool = ServerPool::with_factory(
            vec![
                descriptor("A", "http://server-a/rpc", 1),
                descriptor("B", "http://server-b/rpc", 1),
            ],
            LoadBalanceStrategy::RoundRobin,
            keyed_factory(vec![]),
        )
        .unwrap();
        let first = pool.healthy_server(None).unwrap();
        let second = pool.healthy_server(None).unwrap();
        assert_ne!(first, second);
    }

    #[tokio::test]
    async fn stats_report_per_server_pools() {
        let pool = ServerPool::with_factory(
            vec![descriptor("A", "http://server-a/rpc", 1)],
            LoadBalanceStrategy::RoundRobin,
            keyed_factory(vec![]),
        )
        .unwrap();
        pool.execute_tool_call("A", "t", Value::Null).await.unwrap();
        let stats = pool.stats().await;
        assert_eq!(stats["total_servers"], 1);
        assert_eq!(stats["healthy_servers"], 1);
        assert!(stats["connection_pools"]["A"]["total_created"].as_u64().unwrap() >= 1);
        pool.close().await;
    }
}
