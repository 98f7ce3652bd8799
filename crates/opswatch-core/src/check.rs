//! Check results produced by checking-point evaluations.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{OpsError, OpsResult};

/// Outcome of one checking-point evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckOutcome {
    /// The checking point matched and may act
    Match,
    /// The checking point evaluated the item and declined
    NoMatch,
    /// Evaluation failed
    Error,
    /// The checking point chose not to evaluate
    Skip,
}

/// Result of evaluating one checking point against one monitoring item.
///
/// Constructors enforce the outcome invariants: `should_act` is only true for
/// matches, confidence is zero for `Error`/`Skip`, and error results always
/// carry a message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckResult {
    /// Name of the checking point that produced this result
    pub cp_name: String,
    /// Kind tag of the checking point
    pub cp_kind: String,
    /// Evaluation outcome
    pub outcome: CheckOutcome,
    /// Whether downstream actions should run
    pub should_act: bool,
    /// Confidence in [0, 1]
    pub confidence: f64,
    /// Human-readable explanation
    #[serde(default)]
    pub reason: String,
    /// Evaluation context handed to prompt building
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub context: BTreeMap<String, Value>,
    /// When the evaluation ran
    pub evaluated_at: DateTime<Utc>,
    /// Evaluation duration in milliseconds
    pub duration_ms: Option<u64>,
    /// Error message; present exactly when the outcome is `Error`
    pub error_message: Option<String>,
    /// Ordered action-name references suggested by the checking point
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub suggested_actions: Vec<String>,
}

impl CheckResult {
    fn base(cp_name: impl Into<String>, cp_kind: impl Into<String>, outcome: CheckOutcome) -> Self {
        Self {
            cp_name: cp_name.into(),
            cp_kind: cp_kind.into(),
            outcome,
            should_act: false,
            confidence: 0.0,
            reason: String::new(),
            context: BTreeMap::new(),
            evaluated_at: Utc::now(),
            duration_ms: None,
            error_message: None,
            suggested_actions: Vec::new(),
        }
    }

    /// A matching result. `should_act` is set.
    ///
    /// # Errors
    /// Returns a `Validation` error when confidence is outside [0, 1].
    pub fn matched(
        cp_name: impl Into<String>,
        cp_kind: impl Into<String>,
        confidence: f64,
        reason: impl Into<String>,
    ) -> OpsResult<Self> {
        if !(0.0..=1.0).contains(&confidence) {
            return Err(OpsError::validation(format!(
                "confidence must be within [0, 1], got {confidence}"
            )));
        }
        let mut result = Self::base(cp_name, cp_kind, CheckOutcome::Match);
        result.should_act = true;
        result.confidence = confidence;
        result.reason = reason.into();
        Ok(result)
    }

    /// A non-matching result.
    ///
    /// # Errors
    /// Returns a `Validation` error when confidence is outside [0, 1].
    pub fn no_match(
        cp_name: impl Into<String>,
        cp_kind: impl Into<String>,
        confidence: f64,
        reason: impl Into<String>,
    ) -> OpsResult<Self> {
        if !(0.0..=1.0).contains(&confidence) {
            return Err(OpsError::validation(format!(
                "confidence must be within [0, 1], got {confidence}"
            )));
        }
        let mut result = Self::base(cp_name, cp_kind, CheckOutcome::NoMatch);
        result.confidence = confidence;
        result.reason = reason.into();
        Ok(result)
    }

    /// An error result. Confidence is forced to zero.
    pub fn error(
        cp_name: impl Into<String>,
        cp_kind: impl Into<String>,
        error_message: impl Into<String>,
    ) -> Self {
        let mut result = Self::base(cp_name, cp_kind, CheckOutcome::Error);
        result.error_message = Some(error_message.into());
        result
    }

    /// A skip result. Confidence is forced to zero.
    pub fn skip(
        cp_name: impl Into<String>,
        cp_kind: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        let mut result = Self::base(cp_name, cp_kind, CheckOutcome::Skip);
        result.reason = reason.into();
        result
    }

    /// Attach a context entry.
    pub fn with_context(mut self, key: impl Into<String>, value: Value) -> Self {
        self.context.insert(key.into(), value);
        self
    }

    /// Append a suggested action name.
    pub fn with_suggested_action(mut self, action: impl Into<String>) -> Self {
        self.suggested_actions.push(action.into());
        self
    }

    /// Record the evaluation duration.
    pub fn with_duration_ms(mut self, duration_ms: u64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }

    /// Whether the outcome is `Match`.
    pub fn is_match(&self) -> bool {
        self.outcome == CheckOutcome::Match
    }

    /// Whether the outcome is `Error`.
    pub fn is_error(&self) -> bool {
        self.outcome == CheckOutcome::Error
    }

    /// Whether the result matched with at least the given confidence.
    pub fn is_high_confidence(&self, threshold: f64) -> bool {
        self.is_match() && self.confidence >= threshold
    }

    /// Compact snapshot for logs and diagnostics.
    pub fn summary(&self) -> Value {
        serde_json::json!({
            "cp_name": self.cp_name,
            "cp_kind": self.cp_kind,
            "outcome": self.outcome,
            "should_act": self.should_act,
            "confidence": self.confidence,
            "reason": self.reason,
            "suggested_actions": self.suggested_actions,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matched_sets_should_act() {
        let result = CheckResult::matched("cp", "custom_cp", 0.9, "looks urgent").unwrap();
        assert!(result.should_act);
        assert!(result.is_match());
        assert!(result.is_high_confidence(0.8));
        assert!(!result.is_high_confidence(0.95));
    }

    #[test]
    fn confidence_bounds_are_enforced() {
        assert!(CheckResult::matched("cp", "custom_cp", 1.0, "edge").is_ok());
        assert!(CheckResult::matched("cp", "custom_cp", 0.0, "edge").is_ok());
        assert!(CheckResult::matched("cp", "custom_cp", 1.01, "too big").is_err());
        assert!(CheckResult::no_match("cp", "custom_cp", -0.1, "negative").is_err());
    }

    #[test]
    fn error_and_skip_have_zero_confidence() {
        let err = CheckResult::error("cp", "custom_cp", "boom");
        assert_eq!(err.confidence, 0.0);
        assert!(!err.should_act);
        assert_eq!(err.error_message.as_deref(), Some("boom"));

        let skip = CheckResult::skip("cp", "custom_cp", "disabled");
        assert_eq!(skip.confidence, 0.0);
        assert!(!skip.should_act);
    }

    #[test]
    fn no_match_never_acts() {
        let result = CheckResult::no_match("cp", "custom_cp", 1.0, "completed already").unwrap();
        assert!(!result.should_act);
        assert_eq!(result.confidence, 1.0);
    }
}
