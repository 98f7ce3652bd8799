//! Error taxonomy shared across the client and engine crates.
//!
//! Every fallible operation in the MCP client surface returns [`OpsError`].
//! The [`ErrorKind`] carried by the error decides retryability; callers never
//! match on message strings.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Result type alias for client and engine operations.
pub type OpsResult<T> = std::result::Result<T, OpsError>;

/// Transport-layer sub-classification.
///
/// `InvalidConfig` and `Unsupported` are configuration mistakes and therefore
/// non-retryable; everything else on the transport layer is assumed to be a
/// transient substrate problem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportIssue {
    /// Transport configuration is invalid (bad URL, missing command, ...)
    InvalidConfig,
    /// The requested transport variant is not supported
    Unsupported,
    /// Any other transport-layer failure
    Other,
}

/// Error classification for programmatic handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum ErrorKind {
    /// Transport open failed or the network connection was lost
    Connection,
    /// An operation exceeded its deadline
    Timeout,
    /// Credentials were rejected
    Authentication,
    /// The remote server reported a failure (5xx-equivalent)
    Server,
    /// The server does not know the requested tool
    ToolNotFound,
    /// The server reported a tool-level failure
    ToolExecution {
        /// Whether the server marked the failure as transient
        transient: bool,
    },
    /// Invalid configuration
    Configuration,
    /// Invalid input
    Validation,
    /// Transport-layer issue
    Transport {
        /// Sub-classification of the transport issue
        issue: TransportIssue,
    },
}

impl ErrorKind {
    /// Whether an error of this kind may be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Connection | Self::Timeout | Self::Server => true,
            Self::ToolExecution { transient } => *transient,
            Self::Transport { issue } => !matches!(
                issue,
                TransportIssue::InvalidConfig | TransportIssue::Unsupported
            ),
            Self::Authentication
            | Self::ToolNotFound
            | Self::Configuration
            | Self::Validation => false,
        }
    }

    /// Stable snake_case label used in metrics and serialized records.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Connection => "connection",
            Self::Timeout => "timeout",
            Self::Authentication => "authentication",
            Self::Server => "server",
            Self::ToolNotFound => "tool_not_found",
            Self::ToolExecution { .. } => "tool_execution",
            Self::Configuration => "configuration",
            Self::Validation => "validation",
            Self::Transport { .. } => "transport",
        }
    }
}

/// Structured error carried by every fallible client operation.
///
/// The error owns enough context to be logged or exported standalone:
/// the operation that failed, the server URL involved, how many retries
/// were spent, and an optional underlying cause message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpsError {
    /// Error classification
    pub kind: ErrorKind,
    /// Human-readable error message
    pub message: String,
    /// Operation being performed when the error occurred
    pub operation: Option<String>,
    /// Server URL involved, if any
    pub server_url: Option<String>,
    /// Number of retries spent before the error surfaced
    pub retry_count: u32,
    /// Timestamp when the error was created
    pub timestamp: DateTime<Utc>,
    /// Additional key/value context
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub context: BTreeMap<String, String>,
    /// Message of the underlying cause, when wrapping another error
    pub cause: Option<String>,
}

impl OpsError {
    /// Create a new error of the given kind.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            operation: None,
            server_url: None,
            retry_count: 0,
            timestamp: Utc::now(),
            context: BTreeMap::new(),
            cause: None,
        }
    }

    /// Connection failure (retryable).
    pub fn connection(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Connection, message)
    }

    /// Deadline exceeded (retryable).
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    /// Credential rejection (non-retryable).
    pub fn authentication(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Authentication, message)
    }

    /// Remote server failure (retryable).
    pub fn server(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Server, message)
    }

    /// Unknown tool (non-retryable).
    pub fn tool_not_found(tool_name: impl Into<String>) -> Self {
        let tool_name = tool_name.into();
        let mut err = Self::new(
            ErrorKind::ToolNotFound,
            format!("Tool not found: {tool_name}"),
        );
        err.context.insert("tool_name".into(), tool_name);
        err
    }

    /// Tool-level failure; retryable only when the server marks it transient.
    pub fn tool_execution(tool_name: impl Into<String>, reason: impl Into<String>, transient: bool) -> Self {
        let tool_name = tool_name.into();
        let mut err = Self::new(
            ErrorKind::ToolExecution { transient },
            format!("Tool '{tool_name}' failed: {}", reason.into()),
        );
        err.context.insert("tool_name".into(), tool_name);
        err
    }

    /// Invalid configuration (non-retryable).
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Configuration, message)
    }

    /// Invalid input (non-retryable).
    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    /// Transport-layer issue.
    pub fn transport(issue: TransportIssue, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Transport { issue }, message)
    }

    /// Attach the operation name.
    pub fn with_operation(mut self, operation: impl Into<String>) -> Self {
        self.operation = Some(operation.into());
        self
    }

    /// Attach the server URL.
    pub fn with_server_url(mut self, url: impl Into<String>) -> Self {
        self.server_url = Some(url.into());
        self
    }

    /// Record how many retries were spent before this error surfaced.
    pub fn with_retry_count(mut self, count: u32) -> Self {
        self.retry_count = count;
        self
    }

    /// Add a key/value context entry.
    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    /// Record the underlying cause message.
    pub fn with_cause(mut self, cause: impl fmt::Display) -> Self {
        self.cause = Some(cause.to_string());
        self
    }

    /// Whether this error may be retried.
    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }

    /// Flatten into a serializable record for logging and metrics export.
    pub fn to_record(&self) -> ErrorRecord {
        ErrorRecord {
            error_type: self.kind.label().to_string(),
            message: self.message.clone(),
            operation: self.operation.clone(),
            server_url: self.server_url.clone(),
            retry_count: self.retry_count,
            timestamp: self.timestamp,
            is_retryable: self.is_retryable(),
            context: self.context.clone(),
        }
    }
}

impl fmt::Display for OpsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.kind.label(), self.message)?;
        if let Some(op) = &self.operation {
            write!(f, " (operation: {op})")?;
        }
        if let Some(url) = &self.server_url {
            write!(f, " (server: {url})")?;
        }
        if self.retry_count > 0 {
            write!(f, " (retries: {})", self.retry_count)?;
        }
        Ok(())
    }
}

impl std::error::Error for OpsError {}

/// Flat serialized form of an [`OpsError`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorRecord {
    /// Stable error-kind label
    pub error_type: String,
    /// Human-readable message
    pub message: String,
    /// Operation being performed
    pub operation: Option<String>,
    /// Server URL involved
    pub server_url: Option<String>,
    /// Retries spent
    pub retry_count: u32,
    /// When the error occurred
    pub timestamp: DateTime<Utc>,
    /// Whether the error kind is retryable
    pub is_retryable: bool,
    /// Additional context
    pub context: BTreeMap<String, String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryability_follows_kind_table() {
        assert!(OpsError::connection("refused").is_retryable());
        assert!(OpsError::timeout("deadline").is_retryable());
        assert!(OpsError::server("boom").is_retryable());
        assert!(OpsError::tool_execution("t", "flaky", true).is_retryable());

        assert!(!OpsError::authentication("bad token").is_retryable());
        assert!(!OpsError::tool_not_found("t").is_retryable());
        assert!(!OpsError::tool_execution("t", "fatal", false).is_retryable());
        assert!(!OpsError::configuration("bad").is_retryable());
        assert!(!OpsError::validation("bad").is_retryable());
    }

    #[test]
    fn transport_retryability_depends_on_issue() {
        assert!(OpsError::transport(TransportIssue::Other, "reset").is_retryable());
        assert!(!OpsError::transport(TransportIssue::InvalidConfig, "bad url").is_retryable());
        assert!(!OpsError::transport(TransportIssue::Unsupported, "grpc").is_retryable());
    }

    #[test]
    fn record_round_trips_through_json() {
        let err = OpsError::timeout("deadline exceeded")
            .with_operation("call_tool(get_tasks)")
            .with_server_url("http://localhost:8082")
            .with_retry_count(3)
            .with_context("attempt", "final");
        let record = err.to_record();
        assert_eq!(record.error_type, "timeout");
        assert!(record.is_retryable);
        assert_eq!(record.retry_count, 3);

        let json = serde_json::to_string(&record).unwrap();
        let back: ErrorRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back.operation.as_deref(), Some("call_tool(get_tasks)"));
        assert_eq!(back.context.get("attempt").map(String::as_str), Some("final"));
    }

    #[test]
    fn display_includes_operation_and_server() {
        let err = OpsError::connection("refused")
            .with_operation("list_tools")
            .with_server_url("http://a");
        let text = err.to_string();
        assert!(text.contains("connection"));
        assert!(text.contains("list_tools"));
        assert!(text.contains("http://a"));
    }
}
