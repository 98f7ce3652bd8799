//! Foundation types for the opswatch monitoring platform.
//!
//! This crate defines the data model shared by the checking-point engine and
//! the MCP client core:
//!
//! - [`monitoring`]: the `MonitoringData` envelope and per-source payloads
//! - [`check`]: `CheckResult` produced by checking-point evaluations
//! - [`action`]: deterministic actions and AI workflow proposals
//! - [`workflow`]: the workflow lifecycle state enum and transition graph
//! - [`error`]: the structured error taxonomy with retryability rules

pub mod action;
pub mod check;
pub mod error;
pub mod monitoring;
pub mod workflow;

pub use action::{Action, AiAction};
pub use check::{CheckOutcome, CheckResult};
pub use error::{ErrorKind, ErrorRecord, OpsError, OpsResult, TransportIssue};
pub use monitoring::{
    ClickUpTask, EmailAlert, MonitoringData, MonitoringKind, Payload, ProcessingStatus,
    SlackMessage, TaskStatus, WebhookEvent,
};
pub use workflow::{WorkflowState, WorkflowStateCategory};

/// Serialize [`std::time::Duration`] as fractional seconds.
///
/// Keeps config files and action records readable (`"timeout": 600.0`) and
/// matches how intervals are expressed throughout the config tree.
pub mod serde_duration {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    /// Serialize a duration as `f64` seconds.
    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    /// Deserialize a duration from `f64` seconds.
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        if !secs.is_finite() || secs < 0.0 {
            return Err(serde::de::Error::custom(format!(
                "duration must be a non-negative number of seconds, got {secs}"
            )));
        }
        Ok(Duration::from_secs_f64(secs))
    }

    /// Same encoding for optional durations.
    pub mod option {
        use std::time::Duration;

        use serde::{Deserialize, Deserializer, Serializer};

        /// Serialize an optional duration as `f64` seconds or null.
        pub fn serialize<S: Serializer>(
            value: &Option<Duration>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            match value {
                Some(d) => serializer.serialize_some(&d.as_secs_f64()),
                None => serializer.serialize_none(),
            }
        }

        /// Deserialize an optional duration from `f64` seconds or null.
        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<Duration>, D::Error> {
            let secs = Option::<f64>::deserialize(deserializer)?;
            match secs {
                None => Ok(None),
                Some(s) if s.is_finite() && s >= 0.0 => Ok(Some(Duration::from_secs_f64(s))),
                Some(s) => Err(serde::de::Error::custom(format!(
                    "duration must be a non-negative number of seconds, got {s}"
                ))),
            }
        }
    }
}
