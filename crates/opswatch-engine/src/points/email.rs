//! Email alert checking point.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use opswatch_core::{
    Action, CheckResult, EmailAlert, MonitoringData, MonitoringKind, OpsResult, Payload,
};

use crate::point::{base_prompt_variables, CheckingPoint, FetchParams, PointKind, PointSpec};
use crate::points::{filter_kind, SourceFeed};

fn alert_payload(data: &MonitoringData) -> Option<&EmailAlert> {
    match &data.payload {
        Payload::EmailAlert(alert) => Some(alert),
        _ => None,
    }
}

/// Configuration of the email-alert point.
#[derive(Debug, Clone)]
pub struct EmailAlertConfig {
    /// Keywords that mark a message as an alert
    pub alert_keywords: Vec<String>,
    /// Keywords that raise the urgency tier
    pub urgency_keywords: Vec<String>,
    /// Sender domains treated as trusted monitoring sources
    pub trusted_sender_domains: Vec<String>,
    /// Subject substrings that mark a message as an alert
    pub subject_patterns: Vec<String>,
}

impl Default for EmailAlertConfig {
    fn default() -> Self {
        Self {
            alert_keywords: [
                "alert", "critical", "error", "failure", "failed", "down", "outage",
                "incident", "warning", "exception", "crash", "unavailable",
            ]
            .into_iter()
            .map(str::to_string)
            .collect(),
            urgency_keywords: [
                "critical", "urgent", "immediate", "emergency", "severe", "fatal",
                "production", "outage", "data loss", "security", "breach", "escalate",
            ]
            .into_iter()
            .map(str::to_string)
            .collect(),
            trusted_sender_domains: Vec::new(),
            subject_patterns: Vec::new(),
        }
    }
}

/// Detects alert emails by keywords, sender trust, and subject patterns.
pub struct EmailAlertPoint {
    spec: PointSpec,
    config: EmailAlertConfig,
    feed: Arc<dyn SourceFeed>,
}

impl EmailAlertPoint {
    /// Create the point over a source feed.
    pub fn new(feed: Arc<dyn SourceFeed>, config: EmailAlertConfig) -> Self {
        let mut spec = PointSpec::new("email_alert_cp", PointKind::EmailAlertCp);
        spec.description = "Detects alert emails that need triage".into();
        spec.priority = 7;
        spec.ai_workflow_enabled = true;
        spec.prompt_template_id = Some("email_alert_triage".into());
        spec.agent_role = Some("ops".into());
        Self { spec, config, feed }
    }

    /// Override the spec.
    pub fn with_spec(mut self, spec: PointSpec) -> Self {
        self.spec = spec;
        self
    }

    fn sender_domain(sender: &str) -> Option<&str> {
        sender.rsplit_once('@').map(|(_, domain)| domain)
    }

    fn urgency_tier(found_urgency: usize) -> &'static str {
        match found_urgency {
            0 => "low",
            1 => "high",
            _ => "critical",
        }
    }
}

#[async_trait]
impl CheckingPoint for EmailAlertPoint {
    fn spec(&self) -> &PointSpec {
        &self.spec
    }

    async fn fetch(&self, params: &FetchParams) -> OpsResult<Vec<MonitoringData>> {
        let items = self.feed.pull(params).await?;
        Ok(filter_kind(items, MonitoringKind::EmailAlert))
    }

    async fn evaluate(&self, data: &MonitoringData) -> CheckResult {
        let kind = self.spec.kind.as_str();
        let Some(alert) = alert_payload(data) else {
            return CheckResult::skip(&self.spec.name, kind, "not an email alert payload");
        };

        let haystack = format!("{} {}", alert.subject, alert.body).to_lowercase();
        let found_alert: Vec<String> = self
            .config
            .alert_keywords
            .iter()
            .filter(|kw| haystack.contains(kw.as_str()))
            .cloned()
            .collect();
        let found_urgency: Vec<String> = self
            .config
            .urgency_keywords
            .iter()
            .filter(|kw| haystack.contains(kw.as_str()))
            .cloned()
            .collect();
        let subject_hit = self
            .config
            .subject_patterns
            .iter()
            .any(|p| alert.subject.to_lowercase().contains(&p.to_lowercase()));

        let sender_domain = Self::sender_domain(&alert.sender).unwrap_or("");
        let trusted = self
            .config
            .trusted_sender_domains
            .iter()
            .any(|d| d.eq_ignore_ascii_case(sender_domain));

        if found_alert.is_empty() && !subject_hit {
            return CheckResult::no_match(
                &self.spec.name,
                kind,
                1.0,
                "No alert keywords or subject patterns matched",
            )
            .unwrap_or_else(|_| CheckResult::skip(&self.spec.name, kind, "invalid"));
        }

        let urgency = Self::urgency_tier(found_urgency.len());
        let mut confidence = 0.5 + 0.1 * found_alert.len().min(3) as f64;
        if !found_urgency.is_empty() {
            confidence += 0.1;
        }
        if trusted {
            confidence += 0.1;
        }
        if subject_hit {
            confidence += 0.1;
        }
        let confidence = confidence.clamp(0.0, 1.0);

        CheckResult::matched(
            &self.spec.name,
            kind,
            confidence,
            format!(
                "Email alert detected with {} keywords, urgency: {urgency}",
                found_alert.len()
            ),
        )
        .map(|r| {
            r.with_context("found_alert_keywords", Value::from(found_alert))
                .with_context("found_urgency_keywords", Value::from(found_urgency))
                .with_context("urgency", Value::from(urgency))
                .with_context("sender", Value::from(alert.sender.clone()))
                .with_context("sender_domain", Value::from(sender_domain))
                .with_context("is_trusted_sender", Value::from(trusted))
                .with_context("subject", Value::from(alert.subject.clone()))
                .with_suggested_action("triage_alert")
        })
        .unwrap_or_else(|e| CheckResult::error(&self.spec.name, kind, e.to_string()))
    }

    fn immediate_actions(&self, data: &MonitoringData, result: &CheckResult) -> Vec<Action> {
        if !result.should_act {
            return Vec::new();
        }
        let Some(alert) = alert_payload(data) else {
            return Vec::new();
        };
        vec![Action::new("notification", "notify_email_alert")
            .with_parameter("notification_type", Value::from("slack"))
            .with_parameter("subject", Value::from(alert.subject.clone()))
            .with_parameter(
                "urgency",
                result
                    .context
                    .get("urgency")
                    .cloned()
                    .unwrap_or(Value::from("low")),
            )]
    }

    fn prompt_variables(&self, data: &MonitoringData, result: &CheckResult) -> BTreeMap<String, Value> {
        let mut variables = base_prompt_variables(data, result);
        if let Some(alert) = alert_payload(data) {
            variables.insert("sender".into(), Value::from(alert.sender.clone()));
            variables.insert("subject".into(), Value::from(alert.subject.clone()));
            variables.insert("body".into(), Value::from(alert.body.clone()));
            variables.insert(
                "received_at".into(),
                alert
                    .received_at
                    .map(|d| Value::from(d.to_rfc3339()))
                    .unwrap_or(Value::from("")),
            );
        }
        variables
    }

    fn validate_config(&self) -> Vec<String> {
        let mut problems = self.spec.validate();
        if self.config.alert_keywords.is_empty()
            && self.config.trusted_sender_domains.is_empty()
            && self.config.subject_patterns.is_empty()
        {
            problems.push(
                "email alert point needs at least one alert keyword, sender domain, or subject pattern"
                    .to_string(),
            );
        }
        problems
    }
}
