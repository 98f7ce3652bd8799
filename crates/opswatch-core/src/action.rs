//! Deterministic actions and AI workflow proposals.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{OpsError, OpsResult};

/// A deterministic side effect the engine executes directly.
///
/// The `kind` tag resolves to a handler in the dispatcher table; `name`
/// identifies the action instance for at-most-once bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    /// Handler tag, e.g. "status_update", "notification", "tag_addition"
    pub kind: String,
    /// Action instance name, unique per (item, checking point)
    pub name: String,
    /// Handler parameters
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub parameters: BTreeMap<String, Value>,
}

impl Action {
    /// Create a new action.
    pub fn new(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            name: name.into(),
            parameters: BTreeMap::new(),
        }
    }

    /// Attach a parameter.
    pub fn with_parameter(mut self, key: impl Into<String>, value: Value) -> Self {
        self.parameters.insert(key.into(), value);
        self
    }
}

/// Declarative description of a desired AI workflow run.
///
/// The dispatcher never executes these directly; they are handed to the
/// workflow state machine which mediates policy, approval, and MCP execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AiAction {
    /// Action instance name
    pub name: String,
    /// Action type tag
    pub action_type: String,
    /// Workflow to run
    pub workflow_name: String,
    /// Checking point that proposed this action
    pub cp_name: String,
    /// Overall run timeout
    #[serde(with = "crate::serde_duration")]
    pub timeout: Duration,
    /// Retry attempts at EXECUTION_FAILED
    pub retry_attempts: u32,
    /// Delay between retries
    #[serde(with = "crate::serde_duration")]
    pub retry_delay: Duration,
    /// Workflow parameters
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub parameters: BTreeMap<String, Value>,
    /// Prompt template the AI layer renders
    pub prompt_template_id: Option<String>,
    /// Variables for the prompt template
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub prompt_variables: BTreeMap<String, Value>,
    /// Agent role requested for the run
    pub agent_role: Option<String>,
    /// Whether a human must approve before execution
    pub approval_required: bool,
    /// How long to wait for approval
    #[serde(with = "crate::serde_duration")]
    pub approval_timeout: Duration,
    /// Scheduling priority
    pub priority: u8,
    /// Earliest time the run may start, when deferred
    pub scheduled_at: Option<DateTime<Utc>>,
}

impl AiAction {
    /// Create a new proposal with defaults matching an immediate,
    /// non-approval-gated run.
    ///
    /// # Errors
    /// Returns a `Validation` error when `workflow_name` is empty.
    pub fn new(
        name: impl Into<String>,
        workflow_name: impl Into<String>,
        cp_name: impl Into<String>,
    ) -> OpsResult<Self> {
        let workflow_name = workflow_name.into();
        if workflow_name.trim().is_empty() {
            return Err(OpsError::validation("workflow_name cannot be empty"));
        }
        Ok(Self {
            name: name.into(),
            action_type: "ai_workflow".into(),
            workflow_name,
            cp_name: cp_name.into(),
            timeout: Duration::from_secs(600),
            retry_attempts: 0,
            retry_delay: Duration::from_secs(5),
            parameters: BTreeMap::new(),
            prompt_template_id: None,
            prompt_variables: BTreeMap::new(),
            agent_role: None,
            approval_required: false,
            approval_timeout: Duration::from_secs(300),
            priority: 5,
            scheduled_at: None,
        })
    }

    /// Attach a workflow parameter.
    pub fn with_parameter(mut self, key: impl Into<String>, value: Value) -> Self {
        self.parameters.insert(key.into(), value);
        self
    }

    /// Attach a prompt variable.
    pub fn with_prompt_variable(mut self, key: impl Into<String>, value: Value) -> Self {
        self.prompt_variables.insert(key.into(), value);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn action_builder_collects_parameters() {
        let action = Action::new("status_update", "add_urgent_tag")
            .with_parameter("entity_id", Value::from("task-1"))
            .with_parameter("add_tags", serde_json::json!(["urgent"]));
        assert_eq!(action.kind, "status_update");
        assert_eq!(action.parameters.len(), 2);
    }

    #[test]
    fn ai_action_requires_workflow_name() {
        assert!(AiAction::new("triage", "", "cp").is_err());
        assert!(AiAction::new("triage", "  ", "cp").is_err());
        let action = AiAction::new("triage", "urgent_task_triage", "cp").unwrap();
        assert!(!action.approval_required);
        assert_eq!(action.priority, 5);
    }

    #[test]
    fn ai_action_round_trips_through_json() {
        let action = AiAction::new("triage", "urgent_task_triage", "cp")
            .unwrap()
            .with_prompt_variable("task_id", Value::from("task-1"));
        let json = serde_json::to_string(&action).unwrap();
        let back: AiAction = serde_json::from_str(&json).unwrap();
        assert_eq!(back.workflow_name, "urgent_task_triage");
        assert_eq!(back.timeout, Duration::from_secs(600));
        assert_eq!(
            back.prompt_variables.get("task_id"),
            Some(&Value::from("task-1"))
        );
    }
}
