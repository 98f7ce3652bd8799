//! Bounded connection pool.
//!
//! Availability is organized as a single queue shared by every URL; a
//! per-URL index exists for diagnostics only. A released connection is
//! either back on the available queue or destroyed, never both, and the
//! pool never holds more than `max_size` live connections.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex as SyncMutex;
use serde_json::Value;
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use uuid::Uuid;

use opswatch_core::{OpsError, OpsResult};

use crate::config::TransportSettings;
use crate::transport::{
    EventStreamConfig, EventStreamTransport, RequestResponseConfig, RequestResponseTransport,
    Transport,
};

/// Internal cap on a single health probe.
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Pool configuration.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum number of live connections
    pub max_size: usize,
    /// Idle time after which a connection is destroyed
    pub max_idle_time: Duration,
    /// Interval of the background health loop
    pub health_check_interval: Duration,
    /// Transport settings used when creating connections
    pub transport: TransportSettings,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_size: 10,
            max_idle_time: Duration::from_secs(300),
            health_check_interval: Duration::from_secs(60),
            transport: TransportSettings::default(),
        }
    }
}

#[derive(Debug)]
struct ConnectionMeta {
    last_used: Instant,
    use_count: u64,
    healthy: bool,
}

/// A pooled connection with reuse metadata.
pub struct PooledConnection {
    id: Uuid,
    /// Transport backing this connection
    pub transport: Arc<dyn Transport>,
    /// Server this connection belongs to
    pub server_name: String,
    /// URL the connection was created for
    pub url: String,
    /// Creation instant
    pub created_at: Instant,
    meta: SyncMutex<ConnectionMeta>,
}

impl PooledConnection {
    fn new(transport: Arc<dyn Transport>, server_name: String, url: String) -> Self {
        Self {
            id: Uuid::new_v4(),
            transport,
            server_name,
            url,
            created_at: Instant::now(),
            meta: SyncMutex::new(ConnectionMeta {
                last_used: Instant::now(),
                use_count: 0,
                healthy: true,
            }),
        }
    }

    /// Update `last_used` and bump the use counter.
    pub fn touch(&self) {
        let mut meta = self.meta.lock();
        meta.last_used = Instant::now();
        meta.use_count += 1;
    }

    /// Age since creation.
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Time since the connection was last used.
    pub fn idle_time(&self) -> Duration {
        self.meta.lock().last_used.elapsed()
    }

    /// Times this connection was handed out.
    pub fn use_count(&self) -> u64 {
        self.meta.lock().use_count
    }

    /// Current health verdict.
    pub fn is_healthy(&self) -> bool {
        self.meta.lock().healthy
    }

    /// Set the health verdict.
    pub fn set_healthy(&self, healthy: bool) {
        self.meta.lock().healthy = healthy;
    }
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("id", &self.id)
            .field("server_name", &self.server_name)
            .field("url", &self.url)
            .field("use_count", &self.use_count())
            .field("healthy", &self.is_healthy())
            .finish()
    }
}

/// Factory producing a transport for a URL.
pub type TransportFactory =
    Arc<dyn Fn(&str, &TransportSettings) -> OpsResult<Arc<dyn Transport>> + Send + Sync>;

/// Create the default factory: URLs with an `/sse` path get the
/// event-stream transport, all other HTTP URLs the request/response one.
pub fn default_transport_factory() -> TransportFactory {
    Arc::new(|url, settings| {
        if url.contains("/sse") {
            let base = url.trim_end_matches("/sse").to_string();
            let transport = EventStreamTransport::new(EventStreamConfig {
                base_url: base,
                connect_timeout: settings.connect_timeout,
                request_timeout: settings.read_timeout,
                ..EventStreamConfig::default()
            })?;
            Ok(Arc::new(transport) as Arc<dyn Transport>)
        } else {
            let transport =
                RequestResponseTransport::new(RequestResponseConfig::from_settings(url, settings))?;
            Ok(Arc::new(transport) as Arc<dyn Transport>)
        }
    })
}

#[derive(Default)]
struct PoolState {
    connections: HashMap<Uuid, Arc<PooledConnection>>,
    available: VecDeque<Uuid>,
    url_index: HashMap<String, Vec<Uuid>>,
    total_created: u64,
    total_destroyed: u64,
    closed: bool,
}

impl PoolState {
    /// Remove a connection from every tracking structure. Idempotent:
    /// returns the connection only the first time.
    fn detach(&mut self, id: Uuid) -> Option<Arc<PooledConnection>> {
        let conn = self.connections.remove(&id)?;
        self.available.retain(|&a| a != id);
        if let Some(ids) = self.url_index.get_mut(&conn.url) {
            ids.retain(|&a| a != id);
            if ids.is_empty() {
                self.url_index.remove(&conn.url);
            }
        }
        self.total_destroyed += 1;
        Some(conn)
    }
}

/// Bounded store of reusable connections.
pub struct ConnectionPool {
    config: PoolConfig,
    factory: TransportFactory,
    state: AsyncMutex<PoolState>,
    health_task: SyncMutex<Option<tokio::task::JoinHandle<()>>>,
}

impl ConnectionPool {
    /// Create a pool with the default transport factory.
    pub fn new(config: PoolConfig) -> Arc<Self> {
        Self::with_factory(config, default_transport_factory())
    }

    /// Create a pool with a custom transport factory.
    pub fn with_factory(config: PoolConfig, factory: TransportFactory) -> Arc<Self> {
        Arc::new(Self {
            config,
            factory,
            state: AsyncMutex::new(PoolState::default()),
            health_task: SyncMutex::new(None),
        })
    }

    /// Acquire a connection for `url`.
    ///
    /// Reuses an idle, healthy, non-expired connection when one exists,
    /// creates a new one while below `max_size`, and fails otherwise.
    ///
    /// # Errors
    /// Returns a `Connection` error when the pool is exhausted or closed,
    /// or when the factory fails.
    pub async fn acquire(
        &self,
        url: &str,
        server_name: Option<&str>,
    ) -> OpsResult<Arc<PooledConnection>> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Err(OpsError::connection("connection pool is closed"));
        }

        // Reuse from the single available queue, destroying stale entries
        // as they surface.
        while let Some(id) = state.available.pop_front() {
            let Some(conn) = state.connections.get(&id).cloned() else {
                continue;
            };
            if conn.is_healthy() && conn.idle_time() <= self.config.max_idle_time {
                conn.touch();
                debug!(url = %conn.url, id = %conn.id, "reusing pooled connection");
                return Ok(conn);
            }
            if let Some(stale) = state.detach(id) {
                Self::shutdown_transport(&stale).await;
            }
        }

        if state.connections.len() < self.config.max_size {
            let transport = (self.factory)(url, &self.config.transport)?;
            let conn = Arc::new(PooledConnection::new(
                transport,
                server_name.unwrap_or("default").to_string(),
                url.to_string(),
            ));
            conn.touch();
            state.connections.insert(conn.id, Arc::clone(&conn));
            state.url_index.entry(conn.url.clone()).or_default().push(conn.id);
            state.total_created += 1;
            debug!(url, id = %conn.id, "created pooled connection");
            return Ok(conn);
        }

        Err(OpsError::connection(format!(
            "connection pool exhausted (max_size={})",
            self.config.max_size
        )))
    }

    /// Return a connection to the pool. Healthy connections go back on the
    /// available queue; anything else is destroyed.
    pub async fn release(&self, conn: &Arc<PooledConnection>) {
        let mut state = self.state.lock().await;
        let tracked = state.connections.contains_key(&conn.id);
        if tracked && conn.is_healthy() && !state.closed {
            conn.touch();
            state.available.push_back(conn.id);
            return;
        }
        if let Some(conn) = state.detach(conn.id) {
            drop(state);
            Self::shutdown_transport(&conn).await;
        }
    }

    /// Destroy connections that are unhealthy or idle beyond the limit.
    pub async fn cleanup(&self) {
        let mut state = self.state.lock().await;
        let expired: Vec<Uuid> = state
            .connections
            .values()
            .filter(|c| !c.is_healthy() || c.idle_time() > self.config.max_idle_time)
            .map(|c| c.id)
            .collect();
        let mut dropped = Vec::new();
        for id in expired {
            if let Some(conn) = state.detach(id) {
                dropped.push(conn);
            }
        }
        drop(state);
        let count = dropped.len();
        for conn in dropped {
            Self::shutdown_transport(&conn).await;
        }
        if count > 0 {
            debug!(count, "cleaned up expired connections");
        }
    }

    /// Probe every connection with `list_tools`, toggling health flags.
    pub async fn check_connection_health(&self) {
        let connections: Vec<Arc<PooledConnection>> = {
            let state = self.state.lock().await;
            state.connections.values().cloned().collect()
        };
        for conn in connections {
            let verdict = match timeout(PROBE_TIMEOUT, conn.transport.list_tools()).await {
                Ok(Ok(_)) => true,
                Ok(Err(e)) => {
                    debug!(url = %conn.url, error = %e, "connection probe failed");
                    false
                }
                Err(_) => {
                    debug!(url = %conn.url, "connection probe timed out");
                    false
                }
            };
            conn.set_healthy(verdict);
        }
    }

    /// Start the background health loop. No-op when already running.
    pub fn start_health_checking(self: &Arc<Self>) {
        let mut slot = self.health_task.lock();
        if slot.as_ref().is_some_and(|t| !t.is_finished()) {
            return;
        }
        let pool = Arc::clone(self);
        let interval = self.config.health_check_interval;
        *slot = Some(tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                pool.check_connection_health().await;
                pool.cleanup().await;
            }
        }));
        info!("started connection pool health checking");
    }

    /// Stop the background health loop.
    pub fn stop_health_checking(&self) {
        if let Some(task) = self.health_task.lock().take() {
            task.abort();
            info!("stopped connection pool health checking");
        }
    }

    /// Close the pool: stop the health loop, destroy every connection,
    /// clear state. Calling close twice is a no-op the second time.
    pub async fn close(&self) {
        self.stop_health_checking();
        let drained: Vec<Arc<PooledConnection>> = {
            let mut state = self.state.lock().await;
            if state.closed {
                return;
            }
            state.closed = true;
            let ids: Vec<Uuid> = state.connections.keys().copied().collect();
            ids.into_iter().filter_map(|id| state.detach(id)).collect()
        };
        for conn in drained {
            Self::shutdown_transport(&conn).await;
        }
        info!("connection pool closed");
    }

    /// Pool statistics, including the per-URL diagnostic index.
    pub async fn stats(&self) -> Value {
        let state = self.state.lock().await;
        let per_url: BTreeMap<String, usize> = state
            .url_index
            .iter()
            .map(|(url, ids)| (url.clone(), ids.len()))
            .collect();
        serde_json::json!({
            "total_connections": state.connections.len(),
            "available_connections": state.available.len(),
            "total_created": state.total_created,
            "total_destroyed": state.total_destroyed,
            "max_size": self.config.max_size,
            "connections_per_url": per_url,
        })
    }

    async fn shutdown_transport(conn: &Arc<PooledConnection>) {
        if let Err(e) = conn.transport.close().await {
            warn!(url = %conn.url, error = %e, "error destroying connection");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use crate::transport::{Session, TransportKind};

    #[derive(Default)]
    struct NullTransport {
        healthy: AtomicBool,
        closes: AtomicUsize,
        endpoint: String,
    }

    impl NullTransport {
        fn factory(created: Arc<AtomicUsize>) -> TransportFactory {
            Arc::new(move |url, _settings| {
                created.fetch_add(1, Ordering::SeqCst);
                Ok(Arc::new(NullTransport {
                    healthy: AtomicBool::new(true),
                    closes: AtomicUsize::new(0),
                    endpoint: url.to_string(),
                }) as Arc<dyn Transport>)
            })
        }
    }

    #[async_trait]
    impl Transport for NullTransport {
        async fn open_session(&self) -> OpsResult<Box<dyn Session>> {
            Err(OpsError::connection("null transport has no sessions"))
        }

        async fn list_tools(&self) -> OpsResult<Vec<String>> {
            if self.healthy.load(Ordering::SeqCst) {
                Ok(vec![])
            } else {
                Err(OpsError::connection("unhealthy"))
            }
        }

        async fn is_healthy(&self) -> bool {
            self.healthy.load(Ordering::SeqCst)
        }

        async fn close(&self) -> OpsResult<()> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn kind(&self) -> TransportKind {
            TransportKind::RequestResponse
        }

        fn endpoint(&self) -> &str {
            &self.endpoint
        }
    }

    fn small_pool(max_size: usize) -> (Arc<ConnectionPool>, Arc<AtomicUsize>) {
        let created = Arc::new(AtomicUsize::new(0));
        let pool = ConnectionPool::with_factory(
            PoolConfig {
                max_size,
                ..PoolConfig::default()
            },
            NullTransport::factory(Arc::clone(&created)),
        );
        (pool, created)
    }

    #[tokio::test]
    async fn acquire_reuses_released_connections() {
        let (pool, created) = small_pool(4);
        let conn = pool.acquire("http://a/rpc", None).await.unwrap();
        let first_id = conn.id;
        pool.release(&conn).await;

        let again = pool.acquire("http://a/rpc", None).await.unwrap();
        assert_eq!(again.id, first_id);
        assert_eq!(created.load(Ordering::SeqCst), 1);
        assert!(again.use_count() >= 2);
    }

    #[tokio::test]
    async fn pool_never_exceeds_max_size() {
        let (pool, created) = small_pool(2);
        let a = pool.acquire("http://a/rpc", None).await.unwrap();
        let _b = pool.acquire("http://a/rpc", None).await.unwrap();

        let err = pool.acquire("http://a/rpc", None).await.unwrap_err();
        assert!(err.message.contains("exhausted"));
        assert_eq!(created.load(Ordering::SeqCst), 2);

        // Releasing frees a slot.
        pool.release(&a).await;
        pool.acquire("http://a/rpc", None).await.unwrap();
    }

    #[tokio::test]
    async fn unhealthy_connections_are_destroyed_on_release() {
        let (pool, _created) = small_pool(2);
        let conn = pool.acquire("http://a/rpc", None).await.unwrap();
        conn.set_healthy(false);
        pool.release(&conn).await;

        let stats = pool.stats().await;
        assert_eq!(stats["total_connections"], 0);
        assert_eq!(stats["total_destroyed"], 1);
    }

    #[tokio::test]
    async fn cleanup_removes_unhealthy_connections() {
        let (pool, _created) = small_pool(4);
        let a = pool.acquire("http://a/rpc", None).await.unwrap();
        let b = pool.acquire("http://b/rpc", None).await.unwrap();
        pool.release(&a).await;
        pool.release(&b).await;

        a.set_healthy(false);
        pool.cleanup().await;

        let stats = pool.stats().await;
        assert_eq!(stats["total_connections"], 1);
        assert_eq!(stats["available_connections"], 1);
        assert_eq!(stats["connections_per_url"]["http://b/rpc"], 1);
    }

    #[tokio::test]
    async fn health_probe_toggles_flags() {
        let shared = Arc::new(NullTransport {
            healthy: AtomicBool::new(true),
            closes: AtomicUsize::new(0),
            endpoint: "http://a/rpc".into(),
        });
        let transport = Arc::clone(&shared);
        let factory: TransportFactory = Arc::new(move |_url, _settings| {
            Ok(Arc::clone(&transport) as Arc<dyn Transport>)
        });
        let pool = ConnectionPool::with_factory(PoolConfig::default(), factory);

        let conn = pool.acquire("http://a/rpc", None).await.unwrap();
        pool.check_connection_health().await;
        assert!(conn.is_healthy());

        shared.healthy.store(false, Ordering::SeqCst);
        pool.check_connection_health().await;
        assert!(!conn.is_healthy());

        shared.healthy.store(true, Ordering::SeqCst);
        pool.check_connection_health().await;
        assert!(conn.is_healthy());
    }

    #[tokio::test]
    async fn close_twice_is_a_noop() {
        let (pool, _created) = small_pool(2);
        let conn = pool.acquire("http://a/rpc", None).await.unwrap();
        pool.release(&conn).await;

        pool.close().await;
        let stats = pool.stats().await;
        assert_eq!(stats["total_connections"], 0);
        let destroyed = stats["total_destroyed"].as_u64().unwrap();

        pool.close().await;
        let stats = pool.stats().await;
        assert_eq!(stats["total_destroyed"].as_u64().unwrap(), destroyed);

        // A closed pool refuses new work.
        assert!(pool.acquire("http://a/rpc", None).await.is_err());
    }

    #[tokio::test]
    async fn release_after_close_destroys_connection() {
        let (pool, _created) = small_pool(2);
        let conn = pool.acquire("http://a/rpc", None).await.unwrap();
        pool.close().await;
        pool.release(&conn).await;
        let stats = pool.stats().await;
        assert_eq!(stats["available_connections"], 0);
    }
}
