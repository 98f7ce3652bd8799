//! ClickUp task checking points.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;

use opswatch_core::{
    Action, AiAction, CheckResult, ClickUpTask, MonitoringData, MonitoringKind, OpsResult, Payload,
};

use crate::point::{base_prompt_variables, CheckingPoint, FetchParams, PointKind, PointSpec};
use crate::points::{filter_kind, SourceFeed};

/// Statuses that mean a task no longer needs attention.
const CLOSED_STATUSES: [&str; 3] = ["done", "completed", "closed"];

/// Prompt variables common to the ClickUp family.
fn task_prompt_variables(
    data: &MonitoringData,
    result: &CheckResult,
    task: &ClickUpTask,
) -> BTreeMap<String, Value> {
    let mut variables = base_prompt_variables(data, result);
    variables.insert("task_id".into(), Value::from(task.id.clone()));
    variables.insert("task_name".into(), Value::from(task.name.clone()));
    variables.insert(
        "task_description".into(),
        Value::from(task.description.clone().unwrap_or_default()),
    );
    variables.insert(
        "task_priority".into(),
        Value::from(task.priority.clone().unwrap_or_default()),
    );
    variables.insert(
        "task_status".into(),
        Value::from(task.status.as_ref().map(|s| s.status.clone()).unwrap_or_default()),
    );
    variables.insert(
        "task_assignee".into(),
        Value::from(task.assignees.clone()),
    );
    variables.insert(
        "task_due_date".into(),
        task.due_date
            .map(|d| Value::from(d.to_rfc3339()))
            .unwrap_or(Value::from("")),
    );
    variables.insert("task_tags".into(), Value::from(task.tags.clone()));
    variables
}

fn task_payload(data: &MonitoringData) -> Option<&ClickUpTask> {
    match &data.payload {
        Payload::ClickupTask(task) => Some(task),
        _ => None,
    }
}

fn is_closed(task: &ClickUpTask) -> bool {
    task.status
        .as_ref()
        .map(|s| CLOSED_STATUSES.contains(&s.status.to_lowercase().as_str()))
        .unwrap_or(false)
}

/// Configuration of the urgent-task point.
#[derive(Debug, Clone)]
pub struct UrgentTaskConfig {
    /// Keywords that indicate urgency in names, descriptions, and tags
    pub urgent_keywords: Vec<String>,
    /// Priority labels treated as urgent
    pub priority_levels: Vec<String>,
    /// Due-date proximity that counts as urgent
    pub due_date_threshold: Duration,
    /// Penalize tasks without a due date
    pub require_due_date: bool,
    /// Channel for urgent-task notifications
    pub notify_channel: Option<String>,
    /// Whether to notify the first assignee
    pub notify_assignee: bool,
    /// Whether triage should create a follow-up task
    pub create_follow_up: bool,
}

impl Default for UrgentTaskConfig {
    fn default() -> Self {
        Self {
            urgent_keywords: [
                "urgent", "critical", "emergency", "asap", "immediate", "priority",
                "production", "hotfix", "break", "down", "fail", "error",
            ]
            .into_iter()
            .map(str::to_string)
            .collect(),
            priority_levels: vec!["urgent".to_string(), "high".to_string()],
            due_date_threshold: Duration::from_secs(24 * 3600),
            require_due_date: false,
            notify_channel: Some("#alerts".to_string()),
            notify_assignee: true,
            create_follow_up: true,
        }
    }
}

/// Detects ClickUp tasks that need immediate attention: urgent priority,
/// urgency keywords, or a due date inside the threshold.
pub struct UrgentTaskPoint {
    spec: PointSpec,
    config: UrgentTaskConfig,
    feed: Arc<dyn SourceFeed>,
}

impl UrgentTaskPoint {
    /// Create the point over a source feed with default config.
    pub fn new(feed: Arc<dyn SourceFeed>) -> Self {
        Self::with_config(feed, UrgentTaskConfig::default())
    }

    /// Create the point with explicit config.
    pub fn with_config(feed: Arc<dyn SourceFeed>, config: UrgentTaskConfig) -> Self {
        let mut spec = PointSpec::new("clickup_urgent_task_cp", PointKind::ClickupUrgentTaskCp);
        spec.description = "Detects urgent ClickUp tasks that need immediate attention".into();
        spec.priority = 8;
        spec.stop_on_match = true;
        spec.timeout = Duration::from_secs(600);
        spec.ai_workflow_enabled = true;
        spec.prompt_template_id = Some("clickup_urgent_task_triage".into());
        spec.agent_role = Some("dev".into());
        Self { spec, config, feed }
    }

    /// Override the spec, e.g. to adjust priority or approval settings.
    pub fn with_spec(mut self, spec: PointSpec) -> Self {
        self.spec = spec;
        self
    }

    fn score(&self, task: &ClickUpTask) -> (f64, Vec<String>, Vec<String>, Vec<String>) {
        let mut score = 0.0;
        let mut reasons = Vec::new();

        let priority = task.priority.clone().unwrap_or_default().to_lowercase();
        if self.config.priority_levels.iter().any(|p| p == &priority) {
            // The source's top label alone warrants action; lesser levels
            // need corroboration from keywords, tags, or due dates.
            score += if priority == "urgent" { 0.7 } else { 0.4 };
            reasons.push(format!("High priority: {priority}"));
        }

        let text = format!(
            "{} {}",
            task.name,
            task.description.clone().unwrap_or_default()
        )
        .to_lowercase();
        let keyword_matches: Vec<String> = self
            .config
            .urgent_keywords
            .iter()
            .filter(|kw| text.contains(kw.as_str()))
            .cloned()
            .collect();
        if !keyword_matches.is_empty() {
            score += 0.3 * keyword_matches.len() as f64 / self.config.urgent_keywords.len() as f64;
            reasons.push(format!("Urgent keywords: {}", keyword_matches.join(", ")));
        }

        let urgent_tags: Vec<String> = task
            .tags
            .iter()
            .map(|t| t.to_lowercase())
            .filter(|t| self.config.urgent_keywords.contains(t))
            .collect();
        if !urgent_tags.is_empty() {
            score += 0.2;
            reasons.push(format!("Urgent tags: {}", urgent_tags.join(", ")));
        }

        if let Some(due) = task.due_date {
            let hours_until_due = (due - Utc::now()).num_minutes() as f64 / 60.0;
            if hours_until_due <= self.config.due_date_threshold.as_secs_f64() / 3600.0 {
                score += 0.3;
                reasons.push(format!("Due in {hours_until_due:.1} hours"));
            }
        } else if self.config.require_due_date {
            score -= 0.1;
        }

        (score, reasons, keyword_matches, urgent_tags)
    }
}

#[async_trait]
impl CheckingPoint for UrgentTaskPoint {
    fn spec(&self) -> &PointSpec {
        &self.spec
    }

    async fn fetch(&self, params: &FetchParams) -> OpsResult<Vec<MonitoringData>> {
        let items = self.feed.pull(params).await?;
        Ok(filter_kind(items, MonitoringKind::ClickupTask))
    }

    async fn evaluate(&self, data: &MonitoringData) -> CheckResult {
        let kind = self.spec.kind.as_str();
        let Some(task) = task_payload(data) else {
            return CheckResult::skip(&self.spec.name, kind, "not a clickup task payload");
        };

        if is_closed(task) {
            return CheckResult::no_match(&self.spec.name, kind, 1.0, "Task is already completed")
                .unwrap_or_else(|_| CheckResult::skip(&self.spec.name, kind, "invalid"));
        }

        let (score, reasons, keyword_matches, urgent_tags) = self.score(task);
        let confidence = (score * 1.2).clamp(0.0, 1.0);

        if score >= 0.5 {
            let result = CheckResult::matched(
                &self.spec.name,
                kind,
                confidence,
                format!("Task identified as urgent: {}", reasons.join("; ")),
            );
            match result {
                Ok(result) => result
                    .with_context("urgency_score", Value::from(score))
                    .with_context("urgency_reasons", Value::from(reasons))
                    .with_context(
                        "task_priority",
                        Value::from(task.priority.clone().unwrap_or_default()),
                    )
                    .with_context("keyword_matches", Value::from(keyword_matches))
                    .with_context("urgent_tags", Value::from(urgent_tags))
                    .with_suggested_action("triage_task")
                    .with_suggested_action("notify_team"),
                Err(e) => CheckResult::error(&self.spec.name, kind, e.to_string()),
            }
        } else {
            CheckResult::no_match(
                &self.spec.name,
                kind,
                confidence,
                format!("Task does not meet urgency criteria (score: {score:.2})"),
            )
            .map(|r| r.with_context("urgency_score", Value::from(score)))
            .unwrap_or_else(|e| CheckResult::error(&self.spec.name, kind, e.to_string()))
        }
    }

    fn immediate_actions(&self, data: &MonitoringData, result: &CheckResult) -> Vec<Action> {
        if !result.should_act {
            return Vec::new();
        }
        let Some(task) = task_payload(data) else {
            return Vec::new();
        };

        let mut actions = Vec::new();
        actions.push(
            Action::new("status_update", "add_urgent_tag")
                .with_parameter("system", Value::from("clickup"))
                .with_parameter("entity_id", Value::from(task.id.clone()))
                .with_parameter(
                    "new_status",
                    Value::from(task.status.as_ref().map(|s| s.status.clone()).unwrap_or_default()),
                )
                .with_parameter(
                    "reason",
                    Value::from("Marked as urgent by automated monitoring"),
                )
                .with_parameter("add_tags", serde_json::json!(["urgent"])),
        );

        if let Some(channel) = &self.config.notify_channel {
            actions.push(
                Action::new("notification", "notify_urgent_task")
                    .with_parameter("notification_type", Value::from("slack"))
                    .with_parameter("recipient", Value::from(channel.clone()))
                    .with_parameter(
                        "subject",
                        Value::from(format!("Urgent task detected: {}", task.name)),
                    )
                    .with_parameter(
                        "message",
                        Value::from(format!(
                            "Urgent task '{}' (ID: {}) requires immediate attention. Reason: {}",
                            task.name,
                            task.id,
                            result.reason
                        )),
                    ),
            );
        }

        if self.config.notify_assignee {
            if let Some(assignee) = task.assignees.first() {
                actions.push(
                    Action::new("notification", "notify_assignee")
                        .with_parameter("notification_type", Value::from("email"))
                        .with_parameter("recipient", Value::from(assignee.clone()))
                        .with_parameter(
                            "subject",
                            Value::from(format!("Urgent task assigned: {}", task.name)),
                        )
                        .with_parameter(
                            "message",
                            Value::from(format!(
                                "You are assigned an urgent task '{}' that requires immediate attention.",
                                task.name
                            )),
                        ),
                );
            }
        }

        actions
    }

    fn after_process(&self, data: &MonitoringData, result: &CheckResult) -> Vec<AiAction> {
        if !self.spec.ai_workflow_enabled || !result.should_act {
            return Vec::new();
        }
        let Some(mut action) = self.build_ai_action(data, result) else {
            return Vec::new();
        };
        let urgency_level = if result.confidence >= 0.8 { "high" } else { "medium" };
        action = action
            .with_parameter("urgency_level", Value::from(urgency_level))
            .with_parameter(
                "urgency_score",
                result
                    .context
                    .get("urgency_score")
                    .cloned()
                    .unwrap_or(Value::from(0.0)),
            )
            .with_parameter(
                "urgency_reasons",
                result
                    .context
                    .get("urgency_reasons")
                    .cloned()
                    .unwrap_or_else(|| serde_json::json!([])),
            )
            .with_parameter("create_follow_up", Value::from(self.config.create_follow_up));
        vec![action]
    }

    fn prompt_variables(&self, data: &MonitoringData, result: &CheckResult) -> BTreeMap<String, Value> {
        match task_payload(data) {
            Some(task) => task_prompt_variables(data, result, task),
            None => base_prompt_variables(data, result),
        }
    }
}

/// Detects tasks whose due date has passed while they are still active.
pub struct OverdueTaskPoint {
    spec: PointSpec,
    feed: Arc<dyn SourceFeed>,
}

impl OverdueTaskPoint {
    /// Create the point over a source feed.
    pub fn new(feed: Arc<dyn SourceFeed>) -> Self {
        let mut spec = PointSpec::new("clickup_overdue_task_cp", PointKind::ClickupOverdueTaskCp);
        spec.description = "Detects ClickUp tasks past their due date".into();
        spec.priority = 6;
        spec.ai_workflow_enabled = true;
        spec.prompt_template_id = Some("clickup_overdue_task_triage".into());
        spec.agent_role = Some("dev".into());
        Self { spec, feed }
    }

    /// Override the spec.
    pub fn with_spec(mut self, spec: PointSpec) -> Self {
        self.spec = spec;
        self
    }
}

#[async_trait]
impl CheckingPoint for OverdueTaskPoint {
    fn spec(&self) -> &PointSpec {
        &self.spec
    }

    async fn fetch(&self, params: &FetchParams) -> OpsResult<Vec<MonitoringData>> {
        let items = self.feed.pull(params).await?;
        Ok(filter_kind(items, MonitoringKind::ClickupTask))
    }

    async fn evaluate(&self, data: &MonitoringData) -> CheckResult {
        let kind = self.spec.kind.as_str();
        let Some(task) = task_payload(data) else {
            return CheckResult::skip(&self.spec.name, kind, "not a clickup task payload");
        };
        if is_closed(task) {
            return CheckResult::no_match(&self.spec.name, kind, 1.0, "Task is already completed")
                .unwrap_or_else(|_| CheckResult::skip(&self.spec.name, kind, "invalid"));
        }
        let Some(due) = task.due_date else {
            return CheckResult::no_match(&self.spec.name, kind, 1.0, "Task has no due date")
                .unwrap_or_else(|_| CheckResult::skip(&self.spec.name, kind, "invalid"));
        };
        let now = Utc::now();
        if due >= now {
            return CheckResult::no_match(&self.spec.name, kind, 1.0, "Task is not overdue yet")
                .unwrap_or_else(|_| CheckResult::skip(&self.spec.name, kind, "invalid"));
        }

        let overdue_hours = (now - due).num_minutes() as f64 / 60.0;
        // Confidence grows with lateness, saturating at one week.
        let confidence = (0.6 + overdue_hours / (7.0 * 24.0) * 0.4).clamp(0.0, 1.0);
        CheckResult::matched(
            &self.spec.name,
            kind,
            confidence,
            format!("Task is {overdue_hours:.1} hours overdue"),
        )
        .map(|r| {
            r.with_context("overdue_hours", Value::from(overdue_hours))
                .with_suggested_action("escalate_task")
        })
        .unwrap_or_else(|e| CheckResult::error(&self.spec.name, kind, e.to_string()))
    }

    fn immediate_actions(&self, data: &MonitoringData, result: &CheckResult) -> Vec<Action> {
        if !result.should_act {
            return Vec::new();
        }
        let Some(task) = task_payload(data) else {
            return Vec::new();
        };
        vec![Action::new("notification", "notify_overdue_task")
            .with_parameter("notification_type", Value::from("slack"))
            .with_parameter(
                "message",
                Value::from(format!("Task '{}' is overdue. {}", task.name, result.reason)),
            )]
    }

    fn prompt_variables(&self, data: &MonitoringData, result: &CheckResult) -> BTreeMap<String, Value> {
        match task_payload(data) {
            Some(task) => task_prompt_variables(data, result, task),
            None => base_prompt_variables(data, result),
        }
    }
}
