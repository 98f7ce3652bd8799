//! Slack message checking points.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use opswatch_core::{
    Action, CheckResult, MonitoringData, MonitoringKind, OpsResult, Payload, SlackMessage,
};

use crate::point::{base_prompt_variables, CheckingPoint, FetchParams, PointKind, PointSpec};
use crate::points::{filter_kind, SourceFeed};

fn message_payload(data: &MonitoringData) -> Option<&SlackMessage> {
    match &data.payload {
        Payload::SlackMessage(message) => Some(message),
        _ => None,
    }
}

/// Prompt variables common to the Slack family.
fn message_prompt_variables(
    data: &MonitoringData,
    result: &CheckResult,
    message: &SlackMessage,
) -> BTreeMap<String, Value> {
    let mut variables = base_prompt_variables(data, result);
    variables.insert(
        "user_name".into(),
        Value::from(message.user.clone().unwrap_or_default()),
    );
    variables.insert("channel".into(), Value::from(message.channel.clone()));
    variables.insert("message_text".into(), Value::from(message.text.clone()));
    variables.insert(
        "thread_ts".into(),
        message
            .thread_ts
            .clone()
            .map(Value::from)
            .unwrap_or(Value::from("")),
    );
    variables.insert("timestamp".into(), Value::from(message.ts.clone()));
    variables.insert("mentions".into(), Value::from(message.mentions.clone()));
    variables.insert("reactions".into(), Value::from(message.reactions.clone()));
    variables
}

/// Configuration of the bot-mention point.
#[derive(Debug, Clone)]
pub struct BotMentionConfig {
    /// The bot's user id, e.g. "U0BOT"
    pub bot_user_id: String,
    /// Keywords that mark a mention as a help request
    pub help_keywords: Vec<String>,
    /// Channel for escalation notifications
    pub notify_channel: Option<String>,
}

impl Default for BotMentionConfig {
    fn default() -> Self {
        Self {
            bot_user_id: String::new(),
            help_keywords: ["help", "assist", "support", "stuck", "broken", "question"]
                .into_iter()
                .map(str::to_string)
                .collect(),
            notify_channel: None,
        }
    }
}

/// Detects messages that mention the bot and routes them to triage.
pub struct BotMentionPoint {
    spec: PointSpec,
    config: BotMentionConfig,
    feed: Arc<dyn SourceFeed>,
}

impl BotMentionPoint {
    /// Create the point over a source feed.
    pub fn new(feed: Arc<dyn SourceFeed>, config: BotMentionConfig) -> Self {
        let mut spec = PointSpec::new("slack_bot_mention_cp", PointKind::SlackBotMentionCp);
        spec.description = "Detects Slack messages that mention the bot".into();
        spec.priority = 7;
        spec.ai_workflow_enabled = true;
        spec.prompt_template_id = Some("slack_bot_mention_reply".into());
        spec.agent_role = Some("assistant".into());
        Self { spec, config, feed }
    }

    /// Override the spec.
    pub fn with_spec(mut self, spec: PointSpec) -> Self {
        self.spec = spec;
        self
    }

    fn is_mentioned(&self, message: &SlackMessage) -> bool {
        if self.config.bot_user_id.is_empty() {
            return false;
        }
        message.mentions.iter().any(|m| m == &self.config.bot_user_id)
            || message
                .text
                .contains(&format!("<@{}>", self.config.bot_user_id))
    }
}

#[async_trait]
impl CheckingPoint for BotMentionPoint {
    fn spec(&self) -> &PointSpec {
        &self.spec
    }

    async fn fetch(&self, params: &FetchParams) -> OpsResult<Vec<MonitoringData>> {
        let items = self.feed.pull(params).await?;
        Ok(filter_kind(items, MonitoringKind::SlackMessage))
    }

    async fn evaluate(&self, data: &MonitoringData) -> CheckResult {
        let kind = self.spec.kind.as_str();
        let Some(message) = message_payload(data) else {
            return CheckResult::skip(&self.spec.name, kind, "not a slack message payload");
        };

        if !self.is_mentioned(message) {
            return CheckResult::no_match(&self.spec.name, kind, 1.0, "Bot is not mentioned")
                .unwrap_or_else(|_| CheckResult::skip(&self.spec.name, kind, "invalid"));
        }

        let text = message.text.to_lowercase();
        let help_hits: Vec<String> = self
            .config
            .help_keywords
            .iter()
            .filter(|kw| text.contains(kw.as_str()))
            .cloned()
            .collect();
        let confidence = if help_hits.is_empty() { 0.8 } else { 1.0 };
        let reason = if help_hits.is_empty() {
            "Bot mentioned".to_string()
        } else {
            format!("Bot mentioned with help request: {}", help_hits.join(", "))
        };

        CheckResult::matched(&self.spec.name, kind, confidence, reason)
            .map(|r| {
                r.with_context("help_keywords", Value::from(help_hits))
                    .with_context("channel", Value::from(message.channel.clone()))
                    .with_suggested_action("reply_in_thread")
            })
            .unwrap_or_else(|e| CheckResult::error(&self.spec.name, kind, e.to_string()))
    }

    fn immediate_actions(&self, data: &MonitoringData, result: &CheckResult) -> Vec<Action> {
        if !result.should_act {
            return Vec::new();
        }
        let Some(message) = message_payload(data) else {
            return Vec::new();
        };
        let mut actions = vec![Action::new("tag_addition", "mark_seen")
            .with_parameter("system", Value::from("slack"))
            .with_parameter("channel", Value::from(message.channel.clone()))
            .with_parameter("ts", Value::from(message.ts.clone()))
            .with_parameter("reaction", Value::from("eyes"))];
        if let Some(channel) = &self.config.notify_channel {
            actions.push(
                Action::new("notification", "notify_mention")
                    .with_parameter("notification_type", Value::from("slack"))
                    .with_parameter("recipient", Value::from(channel.clone()))
                    .with_parameter(
                        "message",
                        Value::from(format!(
                            "Bot mentioned in {} by {}",
                            message.channel,
                            message.user.clone().unwrap_or_default()
                        )),
                    ),
            );
        }
        actions
    }

    fn prompt_variables(&self, data: &MonitoringData, result: &CheckResult) -> BTreeMap<String, Value> {
        match message_payload(data) {
            Some(message) => message_prompt_variables(data, result, message),
            None => base_prompt_variables(data, result),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::points::StaticFeed;

    fn message(ts: &str, text: &str, mentions: Vec<&str>) -> MonitoringData {
        MonitoringData::new(
            format!("slack_{ts}"),
            "slack",
            Payload::SlackMessage(SlackMessage {
                ts: ts.to_string(),
                channel: "C01".to_string(),
                user: Some("U123".to_string()),
                text: text.to_string(),
                thread_ts: None,
                mentions: mentions.into_iter().map(str::to_string).collect(),
                reactions: Vec::new(),
            }),
        )
        .unwrap()
    }

    fn point() -> BotMentionPoint {
        BotMentionPoint::new(
            Arc::new(StaticFeed::new()),
            BotMentionConfig {
                bot_user_id: "U0BOT".to_string(),
                ..BotMentionConfig::default()
            },
        )
    }

    #[tokio::test]
    async fn mention_in_list_matches() {
        let cp = point();
        let item = message("1", "hey there", vec!["U0BOT"]);
        let result = cp.evaluate(&item).await;
        assert!(result.is_match());
        assert_eq!(result.confidence, 0.8);
    }

    #[tokio::test]
    async fn inline_mention_with_help_keyword_is_full_confidence() {
        let cp = point();
        let item = message("2", "<@U0BOT> the deploy is broken, help!", vec![]);
        let result = cp.evaluate(&item).await;
        assert!(result.is_match());
        assert_eq!(result.confidence, 1.0);
        let hits = result.context["help_keywords"].as_array().unwrap();
        assert!(hits.len() >= 2);
    }

    #[tokio::test]
    async fn no_mention_is_no_match() {
        let cp = point();
        let item = message("3", "lunch anyone?", vec!["U999"]);
        let result = cp.evaluate(&item).await;
        assert!(!result.is_match());
        assert!(!result.should_act);
    }

    #[tokio::test]
    async fn prompt_variables_carry_message_fields() {
        let cp = point();
        let item = message("4", "<@U0BOT> help", vec![]);
        let result = cp.evaluate(&item).await;
        let variables = cp.prompt_variables(&item, &result);
        assert_eq!(variables["channel"], Value::from("C01"));
        assert_eq!(variables["user_name"], Value::from("U123"));
        assert_eq!(variables["message_text"], Value::from("<@U0BOT> help"));
        assert_eq!(variables["timestamp"], Value::from("4"));
    }

    #[tokio::test]
    async fn capability_gate_is_slack_only() {
        let cp = point();
        assert!(cp.accepts(MonitoringKind::SlackMessage));
        assert!(!cp.accepts(MonitoringKind::ClickupTask));
    }
}
