//! opswatch: event-driven operational monitoring and AI triage.
//!
//! This facade re-exports the three subsystem crates: `core` (data model
//! and error taxonomy), [`client`] (MCP client core: transports, pooling,
//! failover, metrics), and [`engine`] (checking-point engine and workflow
//! state machine).
//!
//! Most applications only need the [`prelude`].

pub use opswatch_client as client;
pub use opswatch_core as core;
pub use opswatch_engine as engine;

/// The commonly used surface, importable in one line.
pub mod prelude {
    pub use opswatch_core::{
        Action, AiAction, CheckOutcome, CheckResult, ErrorKind, MonitoringData, MonitoringKind,
        OpsError, OpsResult, Payload, ProcessingStatus, WorkflowState,
    };

    pub use opswatch_client::{
        Client, ClientConfig, ConnectionPool, EventStreamTransport, HealthChecker,
        LoadBalanceStrategy, LocalProcessTransport, RequestResponseTransport, ServerDescriptor,
        ServerPool, Transport, TransportKind,
    };

    pub use opswatch_engine::{
        ActionDispatcher, CheckingPoint, Engine, EngineConfig, FetchParams, PointKind, PointSpec,
        PromptRegistry, PromptTemplate, Registry, WorkflowResult, WorkflowRunner,
    };
}
