//! Deterministic action dispatch.
//!
//! The dispatcher resolves an action's `kind` tag to a handler from its
//! table. Unknown tags are logged and skipped; handler failures are reported
//! to the caller (who appends them to the item's errors) without blocking
//! subsequent actions. Each (item, checking point, action name) executes at
//! most once per engine lifetime.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex as SyncMutex;
use serde_json::Value;
use tracing::{debug, warn};

use opswatch_core::{Action, MonitoringData, OpsResult};

/// Handler for one action kind.
#[async_trait]
pub trait ActionHandler: Send + Sync {
    /// Execute the action against the item.
    async fn execute(&self, data: &MonitoringData, action: &Action) -> OpsResult<()>;
}

/// Observer for executed side effects.
///
/// Production sinks forward to the real integrations; tests record.
#[async_trait]
pub trait ActionSink: Send + Sync {
    /// Record one executed side effect.
    async fn emit(&self, kind: &str, data_id: &str, parameters: &BTreeMap<String, Value>);
}

/// Sink that logs every side effect through tracing.
#[derive(Default)]
pub struct LoggingSink;

#[async_trait]
impl ActionSink for LoggingSink {
    async fn emit(&self, kind: &str, data_id: &str, parameters: &BTreeMap<String, Value>) {
        debug!(kind, data_id, ?parameters, "action executed");
    }
}

/// Sink that records side effects in memory.
#[derive(Default)]
pub struct RecordingSink {
    records: SyncMutex<Vec<(String, String, BTreeMap<String, Value>)>>,
}

impl RecordingSink {
    /// Recorded (kind, data_id, parameters) triples in execution order.
    pub fn records(&self) -> Vec<(String, String, BTreeMap<String, Value>)> {
        self.records.lock().clone()
    }
}

#[async_trait]
impl ActionSink for RecordingSink {
    async fn emit(&self, kind: &str, data_id: &str, parameters: &BTreeMap<String, Value>) {
        self.records
            .lock()
            .push((kind.to_string(), data_id.to_string(), parameters.clone()));
    }
}

/// Handler that forwards the action to a sink. Covers the built-in kinds
/// (status updates, notifications, tag additions) whose real side effects
/// live behind the sink seam.
pub struct SinkHandler {
    sink: Arc<dyn ActionSink>,
}

impl SinkHandler {
    /// Create a handler around a sink.
    pub fn new(sink: Arc<dyn ActionSink>) -> Self {
        Self { sink }
    }
}

#[async_trait]
impl ActionHandler for SinkHandler {
    async fn execute(&self, data: &MonitoringData, action: &Action) -> OpsResult<()> {
        self.sink.emit(&action.kind, data.id(), &action.parameters).await;
        Ok(())
    }
}

/// Outcome of dispatching one action list.
#[derive(Debug, Default)]
pub struct DispatchReport {
    /// Actions that executed successfully
    pub executed: Vec<String>,
    /// Actions skipped: unknown kind or already executed
    pub skipped: Vec<String>,
    /// Action name + error message per failure
    pub failures: Vec<(String, String)>,
}

/// Resolves action kinds to handlers and enforces at-most-once execution.
pub struct ActionDispatcher {
    handlers: HashMap<String, Arc<dyn ActionHandler>>,
    executed: SyncMutex<HashSet<(String, String, String)>>,
}

impl ActionDispatcher {
    /// Dispatcher with the built-in handler table wired to a sink.
    pub fn new(sink: Arc<dyn ActionSink>) -> Self {
        let mut dispatcher = Self::empty();
        let handler: Arc<dyn ActionHandler> = Arc::new(SinkHandler::new(sink));
        for kind in ["status_update", "notification", "tag_addition"] {
            dispatcher.handlers.insert(kind.to_string(), Arc::clone(&handler));
        }
        dispatcher
    }

    /// Dispatcher with no handlers registered.
    pub fn empty() -> Self {
        Self {
            handlers: HashMap::new(),
            executed: SyncMutex::new(HashSet::new()),
        }
    }

    /// Register a handler for an action kind, replacing any existing one.
    pub fn register_handler(&mut self, kind: impl Into<String>, handler: Arc<dyn ActionHandler>) {
        self.handlers.insert(kind.into(), handler);
    }

    /// Execute `actions` in list order for one (item, checking point).
    ///
    /// Failures never block later actions; they are collected in the
    /// report for the engine to append to the item's errors.
    pub async fn dispatch(
        &self,
        cp_name: &str,
        data: &MonitoringData,
        actions: &[Action],
    ) -> DispatchReport {
        let mut report = DispatchReport::default();
        for action in actions {
            let key = (
                data.id().to_string(),
                cp_name.to_string(),
                action.name.clone(),
            );
            {
                let mut executed = self.executed.lock();
                if executed.contains(&key) {
                    debug!(action = %action.name, item = %data.id(), "action already executed, skipping");
                    report.skipped.push(action.name.clone());
                    continue;
                }
                executed.insert(key);
            }

            let Some(handler) = self.handlers.get(&action.kind) else {
                warn!(kind = %action.kind, action = %action.name, "no handler for action kind, skipping");
                report.skipped.push(action.name.clone());
                continue;
            };

            match handler.execute(data, action).await {
                Ok(()) => report.executed.push(action.name.clone()),
                Err(e) => {
                    warn!(action = %action.name, error = %e, "action handler failed");
                    report.failures.push((action.name.clone(), e.to_string()));
                }
            }
        }
        report
    }
}
