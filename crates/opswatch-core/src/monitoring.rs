//! Monitoring data envelope and per-source payload models.
//!
//! Every observation pulled from an external system is wrapped in a
//! [`MonitoringData`] envelope before it enters the checking-point pipeline.
//! The envelope carries identity, provenance, and processing state; the
//! payload is a typed record per source family.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{OpsError, OpsResult};

/// Kinds of monitoring data the system can process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MonitoringKind {
    /// A task observed in a ClickUp workspace
    ClickupTask,
    /// A message observed in a Slack channel
    SlackMessage,
    /// An alert email pulled from an inbox
    EmailAlert,
    /// An inbound webhook delivery
    WebhookEvent,
    /// Free-form payload for custom sources
    Custom,
}

impl MonitoringKind {
    /// All kinds, in declaration order.
    pub fn all() -> [MonitoringKind; 5] {
        [
            Self::ClickupTask,
            Self::SlackMessage,
            Self::EmailAlert,
            Self::WebhookEvent,
            Self::Custom,
        ]
    }

    /// Stable serde string value.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ClickupTask => "clickup_task",
            Self::SlackMessage => "slack_message",
            Self::EmailAlert => "email_alert",
            Self::WebhookEvent => "webhook_event",
            Self::Custom => "custom",
        }
    }
}

/// Processing lifecycle of a monitoring data item.
///
/// Status is monotone: `pending → processing → {completed|skipped|failed}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingStatus {
    /// Not yet picked up by the engine
    Pending,
    /// Owned by a dispatch pipeline
    Processing,
    /// Fully processed
    Completed,
    /// Intentionally not processed
    Skipped,
    /// Processing failed
    Failed,
}

impl ProcessingStatus {
    /// Whether this status ends the item's lifecycle.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Skipped | Self::Failed)
    }

    /// Whether the transition `self → next` is legal.
    pub fn can_advance_to(&self, next: ProcessingStatus) -> bool {
        match self {
            Self::Pending => matches!(
                next,
                Self::Processing | Self::Completed | Self::Skipped | Self::Failed
            ),
            Self::Processing => next.is_terminal(),
            _ => false,
        }
    }
}

/// Status block of a ClickUp task.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskStatus {
    /// Status label, e.g. "open", "in progress", "completed"
    pub status: String,
    /// Display color, when the source provides one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
}

/// Structured ClickUp task payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClickUpTask {
    /// Task ID in the source system
    pub id: String,
    /// Task name
    pub name: String,
    /// Task description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Task status block
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<TaskStatus>,
    /// Priority label ("urgent", "high", ...)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<String>,
    /// Assignee user IDs
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub assignees: Vec<String>,
    /// Due date, when set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub due_date: Option<DateTime<Utc>>,
    /// Task tags
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    /// Custom field values keyed by field name
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub custom_fields: BTreeMap<String, Value>,
    /// Link back to the task
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Containing list ID
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub list_id: Option<String>,
}

/// Structured Slack message payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SlackMessage {
    /// Message timestamp, the Slack-native identifier
    pub ts: String,
    /// Channel ID the message was posted in
    pub channel: String,
    /// Author user ID
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    /// Message text
    #[serde(default)]
    pub text: String,
    /// Parent thread timestamp for replies
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_ts: Option<String>,
    /// User IDs mentioned in the message
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mentions: Vec<String>,
    /// Reaction names on the message
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub reactions: Vec<String>,
}

/// Structured email alert payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EmailAlert {
    /// Message-ID header
    pub message_id: String,
    /// Sender address
    pub sender: String,
    /// Subject line
    #[serde(default)]
    pub subject: String,
    /// Plain-text body
    #[serde(default)]
    pub body: String,
    /// When the message was received
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub received_at: Option<DateTime<Utc>>,
    /// Selected headers
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
}

/// Inbound webhook delivery payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WebhookEvent {
    /// Event name reported by the sender
    pub event: String,
    /// Raw delivery body
    #[serde(default)]
    pub body: Value,
}

/// Typed payload variants, one per [`MonitoringKind`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum Payload {
    /// ClickUp task
    ClickupTask(ClickUpTask),
    /// Slack message
    SlackMessage(SlackMessage),
    /// Email alert
    EmailAlert(EmailAlert),
    /// Webhook delivery
    WebhookEvent(WebhookEvent),
    /// Free-form JSON payload
    Custom(Value),
}

impl Payload {
    /// The kind this payload belongs to.
    pub fn kind(&self) -> MonitoringKind {
        match self {
            Self::ClickupTask(_) => MonitoringKind::ClickupTask,
            Self::SlackMessage(_) => MonitoringKind::SlackMessage,
            Self::EmailAlert(_) => MonitoringKind::EmailAlert,
            Self::WebhookEvent(_) => MonitoringKind::WebhookEvent,
            Self::Custom(_) => MonitoringKind::Custom,
        }
    }
}

/// Envelope wrapping an observation from an external source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitoringData {
    /// Unique identifier within a run; immutable after creation
    id: String,
    /// Kind tag, always consistent with the payload variant
    pub kind: MonitoringKind,
    /// Origin system identifier, e.g. "clickup"
    pub source: String,
    /// Typed payload
    pub payload: Payload,
    /// When the observation was captured
    pub captured_at: DateTime<Utc>,
    /// When processing finished; set exactly once, at terminal status
    pub processed_at: Option<DateTime<Utc>>,
    /// Processing lifecycle status
    pub status: ProcessingStatus,
    /// Processing errors, append-only
    pub errors: Vec<String>,
    /// Free-form annotation channel
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
}

impl MonitoringData {
    /// Create a new pending item.
    ///
    /// # Errors
    /// Returns a `Validation` error when `id` or `source` is empty.
    pub fn new(id: impl Into<String>, source: impl Into<String>, payload: Payload) -> OpsResult<Self> {
        let id = id.into().trim().to_string();
        let source = source.into().trim().to_string();
        if id.is_empty() {
            return Err(OpsError::validation("monitoring data id cannot be empty"));
        }
        if source.is_empty() {
            return Err(OpsError::validation("monitoring data source cannot be empty"));
        }
        Ok(Self {
            id,
            kind: payload.kind(),
            source,
            payload,
            captured_at: Utc::now(),
            processed_at: None,
            status: ProcessingStatus::Pending,
            errors: Vec::new(),
            metadata: BTreeMap::new(),
        })
    }

    /// The item's immutable identifier.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Advance the processing status.
    ///
    /// # Errors
    /// Returns a `Validation` error when the transition would move backwards
    /// or out of a terminal status.
    pub fn advance(&mut self, next: ProcessingStatus) -> OpsResult<()> {
        if !self.status.can_advance_to(next) {
            return Err(OpsError::validation(format!(
                "illegal status transition {:?} -> {:?} for item {}",
                self.status, next, self.id
            )));
        }
        self.status = next;
        if next.is_terminal() {
            self.processed_at = Some(Utc::now());
        }
        Ok(())
    }

    /// Mark the item terminal with the given status and stamp `processed_at`.
    ///
    /// # Errors
    /// Returns a `Validation` error for non-terminal statuses or illegal
    /// transitions.
    pub fn mark_processed(&mut self, status: ProcessingStatus) -> OpsResult<()> {
        if !status.is_terminal() {
            return Err(OpsError::validation(format!(
                "mark_processed requires a terminal status, got {status:?}"
            )));
        }
        self.advance(status)
    }

    /// Append a processing error. A pending item becomes `failed`.
    pub fn add_error(&mut self, error: impl Into<String>) {
        self.errors.push(error.into());
        if self.status == ProcessingStatus::Pending {
            self.status = ProcessingStatus::Failed;
            self.processed_at = Some(Utc::now());
        }
    }

    /// Read a dotted-path field out of a `Custom` or `WebhookEvent` payload.
    ///
    /// Returns `None` for typed payloads and missing paths.
    pub fn data_field(&self, path: &str) -> Option<&Value> {
        let root = match &self.payload {
            Payload::Custom(v) => v,
            Payload::WebhookEvent(w) => &w.body,
            _ => return None,
        };
        let mut current = root;
        for key in path.split('.') {
            current = current.get(key)?;
        }
        Some(current)
    }

    /// Task identifier, when this item wraps a task.
    pub fn task_id(&self) -> Option<&str> {
        match &self.payload {
            Payload::ClickupTask(task) => Some(task.id.as_str()),
            _ => self.data_field("task_id").and_then(Value::as_str),
        }
    }

    /// User identifier, when this item involves a user.
    pub fn user_id(&self) -> Option<&str> {
        match &self.payload {
            Payload::SlackMessage(msg) => msg.user.as_deref(),
            _ => self.data_field("user_id").and_then(Value::as_str),
        }
    }

    /// Compact snapshot for logs and diagnostics.
    pub fn summary(&self) -> Value {
        serde_json::json!({
            "id": self.id,
            "kind": self.kind.as_str(),
            "source": self.source,
            "status": self.status,
            "captured_at": self.captured_at.to_rfc3339(),
            "has_errors": !self.errors.is_empty(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task_item(id: &str) -> MonitoringData {
        MonitoringData::new(
            id,
            "clickup",
            Payload::ClickupTask(ClickUpTask {
                id: id.trim_start_matches("clickup_").to_string(),
                name: "Fix build".into(),
                ..Default::default()
            }),
        )
        .unwrap()
    }

    #[test]
    fn new_rejects_empty_identity() {
        let payload = Payload::Custom(Value::Null);
        assert!(MonitoringData::new("", "src", payload.clone()).is_err());
        assert!(MonitoringData::new("  ", "src", payload.clone()).is_err());
        assert!(MonitoringData::new("id", "", payload).is_err());
    }

    #[test]
    fn kind_is_derived_from_payload() {
        let item = task_item("clickup_1");
        assert_eq!(item.kind, MonitoringKind::ClickupTask);
        assert_eq!(item.task_id(), Some("1"));
    }

    #[test]
    fn status_is_monotone() {
        let mut item = task_item("clickup_1");
        item.advance(ProcessingStatus::Processing).unwrap();
        item.advance(ProcessingStatus::Completed).unwrap();
        assert!(item.processed_at.is_some());
        // No way out of a terminal state.
        assert!(item.advance(ProcessingStatus::Processing).is_err());
        assert!(item.advance(ProcessingStatus::Failed).is_err());
    }

    #[test]
    fn pending_can_terminate_directly() {
        let mut item = task_item("clickup_2");
        item.mark_processed(ProcessingStatus::Skipped).unwrap();
        assert_eq!(item.status, ProcessingStatus::Skipped);
        assert!(item.processed_at.is_some());
    }

    #[test]
    fn add_error_fails_pending_items() {
        let mut item = task_item("clickup_3");
        item.add_error("fetch exploded");
        assert_eq!(item.status, ProcessingStatus::Failed);
        assert_eq!(item.errors.len(), 1);
        assert!(item.processed_at.is_some());
    }

    #[test]
    fn add_error_keeps_processing_status() {
        let mut item = task_item("clickup_4");
        item.advance(ProcessingStatus::Processing).unwrap();
        item.add_error("action failed");
        assert_eq!(item.status, ProcessingStatus::Processing);
        assert_eq!(item.errors.len(), 1);
    }

    #[test]
    fn data_field_walks_custom_payloads() {
        let item = MonitoringData::new(
            "hook-1",
            "webhook",
            Payload::WebhookEvent(WebhookEvent {
                event: "deploy".into(),
                body: serde_json::json!({"release": {"version": "1.2.3"}}),
            }),
        )
        .unwrap();
        assert_eq!(
            item.data_field("release.version").and_then(Value::as_str),
            Some("1.2.3")
        );
        assert!(item.data_field("release.missing").is_none());
    }

    #[test]
    fn envelope_round_trips_through_json() {
        let item = task_item("clickup_5");
        let json = serde_json::to_string(&item).unwrap();
        let back: MonitoringData = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id(), "clickup_5");
        assert_eq!(back.kind, MonitoringKind::ClickupTask);
        assert_eq!(back.status, ProcessingStatus::Pending);
    }
}
