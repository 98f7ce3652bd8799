//! The checking-point contract.
//!
//! A checking point pulls observations from its source, decides whether each
//! one warrants action, and proposes follow-ups: deterministic actions the
//! engine executes directly plus AI workflow proposals routed through the
//! approval gate. Shared attributes live in [`PointSpec`]; domain behavior
//! is composed in, never inherited.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use opswatch_core::{AiAction, Action, CheckResult, MonitoringData, MonitoringKind, OpsResult};

/// Kind tags for the built-in checking-point families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PointKind {
    /// Urgent ClickUp tasks
    ClickupUrgentTaskCp,
    /// Overdue ClickUp tasks
    ClickupOverdueTaskCp,
    /// ClickUp assignment changes
    ClickupAssignmentCp,
    /// ClickUp status changes
    ClickupStatusChangeCp,
    /// Slack bot mentions
    SlackBotMentionCp,
    /// Slack help requests
    SlackHelpRequestCp,
    /// Slack keyword watches
    SlackKeywordCp,
    /// Email alerts
    EmailAlertCp,
    /// User-defined checking points
    CustomCp,
}

impl PointKind {
    /// Stable serde string value.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ClickupUrgentTaskCp => "clickup_urgent_task_cp",
            Self::ClickupOverdueTaskCp => "clickup_overdue_task_cp",
            Self::ClickupAssignmentCp => "clickup_assignment_cp",
            Self::ClickupStatusChangeCp => "clickup_status_change_cp",
            Self::SlackBotMentionCp => "slack_bot_mention_cp",
            Self::SlackHelpRequestCp => "slack_help_request_cp",
            Self::SlackKeywordCp => "slack_keyword_cp",
            Self::EmailAlertCp => "email_alert_cp",
            Self::CustomCp => "custom_cp",
        }
    }

    /// All kind tags.
    pub fn all() -> Vec<PointKind> {
        vec![
            Self::ClickupUrgentTaskCp,
            Self::ClickupOverdueTaskCp,
            Self::ClickupAssignmentCp,
            Self::ClickupStatusChangeCp,
            Self::SlackBotMentionCp,
            Self::SlackHelpRequestCp,
            Self::SlackKeywordCp,
            Self::EmailAlertCp,
            Self::CustomCp,
        ]
    }

    /// The ClickUp family tags.
    pub fn clickup_kinds() -> Vec<PointKind> {
        vec![
            Self::ClickupUrgentTaskCp,
            Self::ClickupOverdueTaskCp,
            Self::ClickupAssignmentCp,
            Self::ClickupStatusChangeCp,
        ]
    }

    /// The Slack family tags.
    pub fn slack_kinds() -> Vec<PointKind> {
        vec![
            Self::SlackBotMentionCp,
            Self::SlackHelpRequestCp,
            Self::SlackKeywordCp,
        ]
    }

    /// The monitoring-data kind this family consumes; `None` for custom
    /// points, which accept anything.
    pub fn accepted_data_kind(&self) -> Option<MonitoringKind> {
        match self {
            Self::ClickupUrgentTaskCp
            | Self::ClickupOverdueTaskCp
            | Self::ClickupAssignmentCp
            | Self::ClickupStatusChangeCp => Some(MonitoringKind::ClickupTask),
            Self::SlackBotMentionCp | Self::SlackHelpRequestCp | Self::SlackKeywordCp => {
                Some(MonitoringKind::SlackMessage)
            }
            Self::EmailAlertCp => Some(MonitoringKind::EmailAlert),
            Self::CustomCp => None,
        }
    }
}

/// Shared attributes of every checking point.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PointSpec {
    /// Name, unique within a registry
    pub name: String,
    /// Kind tag
    pub kind: PointKind,
    /// Human-readable description
    pub description: String,
    /// Implementation version
    pub version: String,
    /// Whether the point participates in the pipeline
    pub enabled: bool,
    /// Evaluation priority, 1–10; higher runs first
    pub priority: u8,
    /// Whether a match short-circuits lower-priority points for the item
    pub stop_on_match: bool,
    /// Evaluation timeout
    #[serde(with = "opswatch_core::serde_duration")]
    pub timeout: Duration,
    /// In-cycle retry budget for transient fetch/evaluate failures
    pub max_retries: u32,
    /// Whether proposed AI workflows need human approval
    pub approval_required: bool,
    /// How long to wait for approval
    #[serde(with = "opswatch_core::serde_duration")]
    pub approval_timeout: Duration,
    /// Whether this point proposes AI workflows at all
    pub ai_workflow_enabled: bool,
    /// Prompt template consumed by the AI layer
    pub prompt_template_id: Option<String>,
    /// Agent role requested for proposed workflows
    pub agent_role: Option<String>,
    /// Polling interval for this point's source
    #[serde(with = "opswatch_core::serde_duration")]
    pub poll_interval: Duration,
}

impl PointSpec {
    /// Create a spec with pipeline defaults.
    pub fn new(name: impl Into<String>, kind: PointKind) -> Self {
        Self {
            name: name.into(),
            kind,
            description: String::new(),
            version: "1.0.0".to_string(),
            enabled: true,
            priority: 5,
            stop_on_match: false,
            timeout: Duration::from_secs(300),
            max_retries: 3,
            approval_required: false,
            approval_timeout: Duration::from_secs(300),
            ai_workflow_enabled: false,
            prompt_template_id: None,
            agent_role: None,
            poll_interval: Duration::from_secs(60),
        }
    }

    /// Validate shared constraints, returning one message per problem.
    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();
        if self.name.trim().is_empty() {
            problems.push("checking point name cannot be empty".to_string());
        }
        if self.timeout.is_zero() {
            problems.push("timeout must be positive".to_string());
        }
        if !(1..=10).contains(&self.priority) {
            problems.push(format!("priority must be within 1–10, got {}", self.priority));
        }
        if self.ai_workflow_enabled && self.prompt_template_id.is_none() {
            problems.push("ai_workflow_enabled requires a prompt_template_id".to_string());
        }
        problems
    }
}

/// Explicit fetch parameters. Each field has a fixed meaning per family;
/// unknown fields are rejected at deserialization.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct FetchParams {
    /// ClickUp list ids to pull from
    pub list_ids: Vec<String>,
    /// Slack channels to read
    pub channels: Vec<String>,
    /// Mailboxes to poll
    pub mailboxes: Vec<String>,
    /// Maximum items per source
    pub limit: Option<usize>,
    /// Only items observed after this timestamp
    pub since: Option<chrono::DateTime<chrono::Utc>>,
}

/// The checking-point contract.
///
/// `evaluate` is a pure decision function: it never blocks on external I/O
/// beyond light metadata reads its algorithm requires. `fetch` owns all
/// source I/O and must be idempotent on empty sources.
#[async_trait]
pub trait CheckingPoint: Send + Sync {
    /// Shared attributes.
    fn spec(&self) -> &PointSpec;

    /// Capability gate. The default restricts to the family's data kind;
    /// custom points accept every kind.
    fn accepts(&self, kind: MonitoringKind) -> bool {
        match self.spec().kind.accepted_data_kind() {
            Some(accepted) => accepted == kind,
            None => true,
        }
    }

    /// Pull a batch of observations from the source.
    async fn fetch(&self, params: &FetchParams) -> OpsResult<Vec<MonitoringData>>;

    /// Decide whether one observation warrants action.
    async fn evaluate(&self, data: &MonitoringData) -> CheckResult;

    /// Deterministic follow-ups, executed regardless of AI workflows.
    fn immediate_actions(&self, _data: &MonitoringData, _result: &CheckResult) -> Vec<Action> {
        Vec::new()
    }

    /// AI workflow proposals. Empty unless the point both enables AI
    /// workflows and produced an actionable match.
    fn after_process(&self, data: &MonitoringData, result: &CheckResult) -> Vec<AiAction> {
        let spec = self.spec();
        if !spec.ai_workflow_enabled || !result.should_act {
            return Vec::new();
        }
        match self.build_ai_action(data, result) {
            Some(action) => vec![action],
            None => Vec::new(),
        }
    }

    /// Canonical variable set handed to the AI layer. Families extend the
    /// base set with domain keys.
    fn prompt_variables(&self, data: &MonitoringData, result: &CheckResult) -> BTreeMap<String, Value> {
        base_prompt_variables(data, result)
    }

    /// Non-throwing config review: shared constraints plus family rules.
    fn validate_config(&self) -> Vec<String> {
        self.spec().validate()
    }

    /// Assemble the default AI proposal for a match.
    fn build_ai_action(&self, data: &MonitoringData, result: &CheckResult) -> Option<AiAction> {
        let spec = self.spec();
        let mut action = AiAction::new(
            format!("{}_workflow", spec.name),
            format!("{}_triage", spec.kind.as_str()),
            spec.name.clone(),
        )
        .ok()?;
        action.timeout = spec.timeout;
        action.approval_required = spec.approval_required;
        action.approval_timeout = spec.approval_timeout;
        action.priority = spec.priority;
        action.prompt_template_id = spec.prompt_template_id.clone();
        action.agent_role = spec.agent_role.clone();
        action.prompt_variables = self.prompt_variables(data, result);
        Some(action)
    }
}

/// Base prompt variables common to every family.
pub fn base_prompt_variables(data: &MonitoringData, result: &CheckResult) -> BTreeMap<String, Value> {
    let mut variables = BTreeMap::new();
    variables.insert("data_id".to_string(), Value::from(data.id()));
    variables.insert("data_type".to_string(), Value::from(data.kind.as_str()));
    variables.insert("source".to_string(), Value::from(data.source.clone()));
    variables.insert(
        "captured_at".to_string(),
        Value::from(data.captured_at.to_rfc3339()),
    );
    variables.insert("reason".to_string(), Value::from(result.reason.clone()));
    variables.insert("confidence".to_string(), Value::from(result.confidence));
    variables.insert(
        "context".to_string(),
        Value::Object(result.context.clone().into_iter().collect()),
    );
    variables
}

#[cfg(test)]
mod tests {
    use super::*;
    use opswatch_core::Payload;

    struct BareCp {
        spec: PointSpec,
    }

    #[async_trait]
    impl CheckingPoint for BareCp {
        fn spec(&self) -> &PointSpec {
            &self.spec
        }

        async fn fetch(&self, _params: &FetchParams) -> OpsResult<Vec<MonitoringData>> {
            Ok(Vec::new())
        }

        async fn evaluate(&self, data: &MonitoringData) -> CheckResult {
            CheckResult::matched(&self.spec.name, self.spec.kind.as_str(), 0.9, "test")
                .unwrap()
                .with_context("item", Value::from(data.id()))
        }
    }

    fn custom_item() -> MonitoringData {
        MonitoringData::new("item-1", "custom", Payload::Custom(Value::Null)).unwrap()
    }

    #[test]
    fn defaults_match_pipeline_expectations() {
        let spec = PointSpec::new("test_cp", PointKind::CustomCp);
        assert!(spec.enabled);
        assert_eq!(spec.priority, 5);
        assert!(!spec.stop_on_match);
        assert!(spec.validate().is_empty());
    }

    #[test]
    fn validation_flags_each_problem() {
        let mut spec = PointSpec::new("", PointKind::CustomCp);
        spec.timeout = Duration::ZERO;
        spec.priority = 11;
        let problems = spec.validate();
        assert_eq!(problems.len(), 3);

        spec = PointSpec::new("ok", PointKind::CustomCp);
        spec.priority = 0;
        assert_eq!(spec.validate().len(), 1);
        spec.priority = 1;
        assert!(spec.validate().is_empty());
        spec.priority = 10;
        assert!(spec.validate().is_empty());
    }

    #[test]
    fn custom_points_accept_every_kind() {
        let cp = BareCp {
            spec: PointSpec::new("custom", PointKind::CustomCp),
        };
        for kind in MonitoringKind::all() {
            assert!(cp.accepts(kind));
        }
    }

    #[test]
    fn family_gate_restricts_kind() {
        let cp = BareCp {
            spec: PointSpec::new("clickup", PointKind::ClickupUrgentTaskCp),
        };
        assert!(cp.accepts(MonitoringKind::ClickupTask));
        assert!(!cp.accepts(MonitoringKind::SlackMessage));
        assert!(!cp.accepts(MonitoringKind::Custom));
    }

    #[tokio::test]
    async fn after_process_respects_gates() {
        let mut spec = PointSpec::new("cp", PointKind::CustomCp);
        spec.ai_workflow_enabled = false;
        let cp = BareCp { spec };
        let item = custom_item();
        let result = cp.evaluate(&item).await;
        assert!(cp.after_process(&item, &result).is_empty());

        let mut spec = PointSpec::new("cp", PointKind::CustomCp);
        spec.ai_workflow_enabled = true;
        spec.prompt_template_id = Some("custom_triage".into());
        let cp = BareCp { spec };
        let no_act = CheckResult::no_match("cp", "custom_cp", 0.5, "meh").unwrap();
        assert!(cp.after_process(&item, &no_act).is_empty());

        let result = cp.evaluate(&item).await;
        let actions = cp.after_process(&item, &result);
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].workflow_name, "custom_cp_triage");
        assert_eq!(
            actions[0].prompt_variables.get("data_id"),
            Some(&Value::from("item-1"))
        );
        assert_eq!(
            actions[0].prompt_template_id.as_deref(),
            Some("custom_triage")
        );
    }

    #[test]
    fn base_prompt_variables_cover_the_contract() {
        let item = custom_item();
        let result = CheckResult::matched("cp", "custom_cp", 0.7, "why").unwrap();
        let variables = base_prompt_variables(&item, &result);
        for key in ["data_id", "data_type", "source", "captured_at", "reason", "confidence", "context"] {
            assert!(variables.contains_key(key), "missing {key}");
        }
    }

    #[test]
    fn fetch_params_reject_unknown_fields() {
        let raw = serde_json::json!({"list_ids": ["a"], "surprise": true});
        assert!(serde_json::from_value::<FetchParams>(raw).is_err());
        let raw = serde_json::json!({"list_ids": ["a"], "limit": 10});
        let params: FetchParams = serde_json::from_value(raw).unwrap();
        assert_eq!(params.limit, Some(10));
    }
}
