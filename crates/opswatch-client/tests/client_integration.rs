//! Integration tests for the client core: retry exhaustion, server-pool
//! failover, and the session-scope guarantee.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use opswatch_client::pool::TransportFactory;
use opswatch_client::rpc::ToolEntry;
use opswatch_client::{
    Client, ClientConfig, LoadBalanceStrategy, RetryConfig, ServerDescriptor, ServerPool, Session,
    Transport, TransportKind,
};
use opswatch_core::{OpsError, OpsResult};

/// Transport that counts session opens/closes and fails a scripted number
/// of operations before succeeding.
struct CountingTransport {
    opens: Arc<AtomicUsize>,
    closes: Arc<AtomicUsize>,
    failures_left: Arc<AtomicUsize>,
    endpoint: String,
}

impl CountingTransport {
    fn new(failures: usize) -> Arc<Self> {
        Arc::new(Self {
            opens: Arc::new(AtomicUsize::new(0)),
            closes: Arc::new(AtomicUsize::new(0)),
            failures_left: Arc::new(AtomicUsize::new(failures)),
            endpoint: "mock://server".to_string(),
        })
    }
}

#[derive(Debug)]
struct CountingSession {
    closes: Arc<AtomicUsize>,
    closed: AtomicUsize,
    fail: bool,
}

#[async_trait]
impl Session for CountingSession {
    async fn list_tools(&self) -> OpsResult<Vec<String>> {
        if self.fail {
            Err(OpsError::timeout("scripted timeout"))
        } else {
            Ok(vec!["list_items".to_string()])
        }
    }

    async fn list_tool_entries(&self) -> OpsResult<Vec<ToolEntry>> {
        Ok(vec![])
    }

    async fn call_tool(&self, name: &str, _args: Value) -> OpsResult<Value> {
        if self.fail {
            Err(OpsError::timeout("scripted timeout"))
        } else {
            Ok(serde_json::json!({"tool": name}))
        }
    }

    async fn close(&self) -> OpsResult<()> {
        // Idempotent: only the first close counts.
        if self.closed.fetch_add(1, Ordering::SeqCst) == 0 {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

#[async_trait]
impl Transport for CountingTransport {
    async fn open_session(&self) -> OpsResult<Box<dyn Session>> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        let fail = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        Ok(Box::new(CountingSession {
            closes: Arc::clone(&self.closes),
            closed: AtomicUsize::new(0),
            fail,
        }))
    }

    async fn is_healthy(&self) -> bool {
        true
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

fn fast_config(max_retries: u32) -> ClientConfig {
    ClientConfig {
        retry_policy: RetryConfig {
            max_retries,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(40),
            backoff_factor: 2.0,
            jitter: false,
        },
        ..ClientConfig::default()
    }
}

#[tokio::test]
async fn retry_exhaustion_observes_timeout_after_three_attempts() {
    // max_retries=2, transport times out three times: the caller sees the
    // timeout after exactly three attempts and three recorded failures.
    let transport = CountingTransport::new(usize::MAX);
    let opens = Arc::clone(&transport.opens);
    let closes = Arc::clone(&transport.closes);
    let client = Client::new(transport as Arc<dyn Transport>, fast_config(2)).unwrap();

    let err = client
        .call_tool("list_items", Value::Null)
        .await
        .unwrap_err();
    assert_eq!(err.kind.label(), "timeout");
    assert_eq!(err.retry_count, 2);
    assert_eq!(opens.load(Ordering::SeqCst), 3);
    // Every session was closed exactly once.
    assert_eq!(closes.load(Ordering::SeqCst), 3);

    let stats = client
        .metrics()
        .operation_stats("call_tool(list_items)")
        .await
        .unwrap();
    assert_eq!(stats.failed_requests, 3);
    assert_eq!(stats.errors.get("timeout"), Some(&3));
}

#[tokio::test]
async fn retry_delays_follow_the_backoff_curve() {
    let policy = RetryConfig {
        max_retries: 2,
        base_delay: Duration::from_millis(10),
        max_delay: Duration::from_secs(30),
        backoff_factor: 2.0,
        jitter: false,
    };
    // The delay sequence between attempts 1→2 and 2→3.
    assert_eq!(policy.delay_for(0), Duration::from_millis(10));
    assert_eq!(policy.delay_for(1), Duration::from_millis(20));
}

#[tokio::test]
async fn sessions_close_even_when_operations_fail() {
    let transport = CountingTransport::new(0);
    let opens = Arc::clone(&transport.opens);
    let closes = Arc::clone(&transport.closes);
    let client = Client::new(transport as Arc<dyn Transport>, fast_config(0)).unwrap();

    // Closure error path: the session still gets torn down.
    let result: OpsResult<()> = client
        .with_session(|_session| async { Err(OpsError::validation("caller bug")) })
        .await;
    assert!(result.is_err());
    assert_eq!(opens.load(Ordering::SeqCst), 1);
    assert_eq!(closes.load(Ordering::SeqCst), 1);

    // Success path closes exactly once too.
    let tools = client
        .with_session(|session| async move { session.list_tools().await })
        .await
        .unwrap();
    assert_eq!(tools, vec!["list_items".to_string()]);
    assert_eq!(closes.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn concurrent_calls_respect_the_client_cap() {
    let transport = CountingTransport::new(0);
    let config = ClientConfig {
        max_concurrent_requests: 2,
        ..fast_config(0)
    };
    let client = Arc::new(Client::new(transport as Arc<dyn Transport>, config).unwrap());

    let calls: Vec<_> = (0..8)
        .map(|_| {
            let client = Arc::clone(&client);
            tokio::spawn(async move { client.list_tools().await })
        })
        .collect();
    for call in calls {
        call.await.unwrap().unwrap();
    }
    let summary = client.metrics_summary().await;
    assert_eq!(summary["total_requests"], 8);
    assert_eq!(summary["failed_requests"], 0);
}

/// Factory building transports that fail for URLs containing "bad".
fn split_factory() -> TransportFactory {
    Arc::new(|url, _settings| {
        let failures = if url.contains("bad") { usize::MAX } else { 0 };
        Ok(CountingTransport::new(failures) as Arc<dyn Transport>)
    })
}

#[tokio::test]
async fn server_pool_fails_over_to_healthy_backup() {
    let servers = vec![
        ServerDescriptor::new("A", vec!["http://bad-primary/rpc".to_string()]).unwrap(),
        ServerDescriptor::new("B", vec!["http://good-backup/rpc".to_string()])
            .unwrap()
            .with_priority(2),
    ];
    let pool =
        ServerPool::with_factory(servers, LoadBalanceStrategy::RoundRobin, split_factory())
            .unwrap();

    let result = pool
        .execute_tool_call("A", "list_items", serde_json::json!({}))
        .await
        .unwrap();
    assert_eq!(result["tool"], "list_items");

    // A recorded a failure, B a success; the probe marks A unhealthy.
    let a = pool
        .metrics()
        .operation_stats("call_tool(list_items)@A")
        .await
        .unwrap();
    assert_eq!(a.failed_requests, 1);
    let b = pool
        .metrics()
        .operation_stats("call_tool(list_items)@B")
        .await
        .unwrap();
    assert_eq!(b.successful_requests, 1);

    pool.check_server_health().await;
    let health = pool.server_health();
    assert!(!health["A"]);
    assert!(health["B"]);
    pool.close().await;
}
