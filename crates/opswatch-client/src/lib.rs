//! MCP client core for the opswatch platform.
//!
//! The crate layers policy over a transport abstraction:
//!
//! - [`transport`]: one interface, three substrates: event-stream (SSE),
//!   request/response (HTTP), and local-process (child stdio)
//! - [`client`]: the unified call surface with retry, a concurrency cap,
//!   tool discovery, and the proposal-execution envelope
//! - [`pool`]: bounded connection reuse with idle eviction and a health loop
//! - [`server_pool`]: multi-server load balancing and priority failover
//! - [`metrics`], [`health`], [`perf`]: observability components
//! - [`config`]: the validated configuration tree (file, env, programmatic)
//!
//! ```no_run
//! use std::sync::Arc;
//! use opswatch_client::config::ClientConfig;
//! use opswatch_client::transport::{RequestResponseConfig, RequestResponseTransport};
//! use opswatch_client::Client;
//!
//! # async fn example() -> opswatch_core::OpsResult<()> {
//! let transport = RequestResponseTransport::new(RequestResponseConfig {
//!     url: "http://localhost:8082/rpc".into(),
//!     ..RequestResponseConfig::default()
//! })?;
//! let client = Client::new(Arc::new(transport), ClientConfig::default())?;
//! let tools = client.list_tools().await?;
//! println!("{} tools available", tools.len());
//! # Ok(())
//! # }
//! ```

pub mod catalog;
pub mod client;
pub mod config;
pub mod health;
pub mod metrics;
pub mod perf;
pub mod pool;
pub mod rpc;
pub mod server_pool;
pub mod transport;

pub use catalog::{ToolCatalog, ToolInfo};
pub use client::{Client, ProposalOutcome};
pub use config::{ClientConfig, MonitoringSettings, RetryConfig, Secret, TransportSettings};
pub use health::{HealthCheckResult, HealthChecker, HealthProbe, HealthStatus};
pub use metrics::{ClientMetrics, OperationStats, RequestMetrics};
pub use perf::{AlertSeverity, PerformanceAlert, PerformanceTracker, Trend};
pub use pool::{ConnectionPool, PoolConfig, PooledConnection, TransportFactory};
pub use server_pool::{LoadBalanceStrategy, ServerDescriptor, ServerPool};
pub use transport::{
    EventStreamConfig, EventStreamTransport, LocalProcessConfig, LocalProcessTransport,
    RequestResponseConfig, RequestResponseTransport, Session, Transport, TransportKind,
};
