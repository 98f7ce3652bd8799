//! Checking-point engine for the opswatch platform.
//!
//! Observations flow through a fixed pipeline: sources are polled on each
//! point's schedule, items fan out to every applicable checking point,
//! results are reordered into priority order with stop-on-match semantics,
//! and follow-ups split into deterministic actions (dispatched directly)
//! and AI proposals (driven through the workflow state machine, which
//! mediates policy, human approval, and MCP tool execution).
//!
//! ```no_run
//! use std::sync::Arc;
//! use opswatch_engine::dispatch::{ActionDispatcher, LoggingSink};
//! use opswatch_engine::engine::{Engine, EngineConfig};
//! use opswatch_engine::point::FetchParams;
//! use opswatch_engine::points::{StaticFeed, UrgentTaskPoint};
//! use opswatch_engine::prompt::{PromptRegistry, PromptTemplate};
//! use opswatch_engine::registry::Registry;
//! use opswatch_engine::workflow::{
//!     AllowAllPolicy, AutoApprovalGate, TemplateProposalSource, WorkflowRunner,
//! };
//!
//! # async fn example(executor: Arc<dyn opswatch_engine::workflow::ToolExecutor>) {
//! let prompts = Arc::new(PromptRegistry::new());
//! prompts.register(PromptTemplate::new("clickup_urgent_task_triage", "Triage {task_id}"));
//!
//! let registry = Arc::new(Registry::new());
//! let feed = Arc::new(StaticFeed::new());
//! registry.register(Arc::new(UrgentTaskPoint::new(feed))).unwrap();
//!
//! let runner = Arc::new(WorkflowRunner::new(
//!     Arc::new(TemplateProposalSource::new(Arc::clone(&prompts))),
//!     Arc::new(AllowAllPolicy),
//!     Arc::new(AutoApprovalGate),
//!     executor,
//! ));
//! let dispatcher = Arc::new(ActionDispatcher::new(Arc::new(LoggingSink)));
//! let engine = Engine::new(registry, dispatcher, runner, EngineConfig::default());
//! engine.run(FetchParams::default()).await;
//! # }
//! ```

pub mod dispatch;
pub mod engine;
pub mod point;
pub mod points;
pub mod prompt;
pub mod registry;
pub mod workflow;

pub use dispatch::{ActionDispatcher, ActionHandler, ActionSink, DispatchReport};
pub use engine::{CycleReport, Engine, EngineConfig, EngineStats, ItemReport};
pub use point::{CheckingPoint, FetchParams, PointKind, PointSpec};
pub use prompt::{PromptRegistry, PromptTemplate};
pub use registry::{Registry, RegistryError};
pub use workflow::{
    ApprovalGate, ApprovalSignal, ChannelApprovalGate, PolicyDecision, PolicyGate, ProposalSource,
    ToolExecutor, ToolProposal, WorkflowResult, WorkflowRunner,
};
