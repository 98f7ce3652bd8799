//! Client configuration tree.
//!
//! Configuration comes from four sources, later ones taking precedence:
//! built-in defaults, a JSON file, `MCP_CLIENT_*` environment variables,
//! and programmatic overrides. Environment coercion uses an explicit table
//! keyed by field path; unrecognized variables are ignored and malformed
//! values fall back to the default with a warning.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use opswatch_core::serde_duration;
use opswatch_core::{OpsError, OpsResult};

/// Environment variable prefix for configuration overrides.
pub const ENV_PREFIX: &str = "MCP_CLIENT_";

/// Write-only secret wrapper. Debug and serialization redact the value.
#[derive(Clone, PartialEq, Eq, Deserialize)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    /// Wrap a secret value.
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Expose the underlying value. Callers must not log it.
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

impl Serialize for Secret {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str("***")
    }
}

/// Retry policy for client operations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum number of retry attempts (0–10)
    pub max_retries: u32,
    /// Base delay before the first retry
    #[serde(with = "serde_duration")]
    pub base_delay: Duration,
    /// Upper bound on any single delay
    #[serde(with = "serde_duration")]
    pub max_delay: Duration,
    /// Exponential backoff multiplier (≥ 1)
    pub backoff_factor: f64,
    /// Whether to apply ±25% uniform jitter
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_factor: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// Validate field ranges.
    ///
    /// # Errors
    /// Returns a `Configuration` error naming the offending field.
    pub fn validate(&self) -> OpsResult<()> {
        if self.max_retries > 10 {
            return Err(OpsError::configuration(format!(
                "max_retries must be at most 10, got {}",
                self.max_retries
            )));
        }
        if self.base_delay < Duration::from_millis(1) {
            return Err(OpsError::configuration("base_delay must be at least 1ms"));
        }
        if self.backoff_factor < 1.0 {
            return Err(OpsError::configuration(format!(
                "backoff_factor must be at least 1.0, got {}",
                self.backoff_factor
            )));
        }
        Ok(())
    }

    /// Delay before retry `attempt` (0-based).
    ///
    /// Without jitter this is exactly `min(base · factor^attempt, max_delay)`;
    /// with jitter the value is scaled by a uniform factor in [0.75, 1.25].
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exact = self.base_delay.as_secs_f64() * self.backoff_factor.powi(attempt as i32);
        let capped = exact.min(self.max_delay.as_secs_f64());
        let delayed = if self.jitter {
            capped * (0.75 + fastrand::f64() * 0.5)
        } else {
            capped
        };
        Duration::from_secs_f64(delayed.max(0.0))
    }
}

/// Transport-level settings shared by all transport variants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportSettings {
    /// Connection establishment timeout
    #[serde(with = "serde_duration")]
    pub connect_timeout: Duration,
    /// Read timeout for streaming bodies
    #[serde(with = "serde_duration")]
    pub read_timeout: Duration,
    /// Write timeout
    #[serde(with = "serde_duration")]
    pub write_timeout: Duration,
    /// Maximum concurrent connections per transport (1–100)
    pub max_connections: usize,
    /// Whether to keep connections alive between calls
    pub keep_alive: bool,
    /// Whether to verify TLS certificates
    pub verify_tls: bool,
    /// Path to a custom CA certificate
    pub tls_cert_path: Option<String>,
    /// Extra headers sent on every HTTP request
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub custom_headers: BTreeMap<String, String>,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(30),
            read_timeout: Duration::from_secs(60),
            write_timeout: Duration::from_secs(30),
            max_connections: 10,
            keep_alive: true,
            verify_tls: true,
            tls_cert_path: None,
            custom_headers: BTreeMap::new(),
        }
    }
}

impl TransportSettings {
    /// Validate field ranges.
    ///
    /// # Errors
    /// Returns a `Configuration` error naming the offending field.
    pub fn validate(&self) -> OpsResult<()> {
        if self.max_connections == 0 || self.max_connections > 100 {
            return Err(OpsError::configuration(format!(
                "max_connections must be within 1–100, got {}",
                self.max_connections
            )));
        }
        Ok(())
    }
}

/// Metrics, health-checking, and tracing settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitoringSettings {
    /// Whether metrics collection is enabled
    pub enable_metrics: bool,
    /// Metrics aggregation interval
    #[serde(with = "serde_duration")]
    pub metrics_interval: Duration,
    /// Whether background health checking is enabled
    pub enable_health_checking: bool,
    /// Health probe interval
    #[serde(with = "serde_duration")]
    pub health_check_interval: Duration,
    /// Tracing sample rate in [0, 1]
    pub tracing_sample_rate: f64,
}

impl Default for MonitoringSettings {
    fn default() -> Self {
        Self {
            enable_metrics: true,
            metrics_interval: Duration::from_secs(60),
            enable_health_checking: true,
            health_check_interval: Duration::from_secs(60),
            tracing_sample_rate: 1.0,
        }
    }
}

impl MonitoringSettings {
    /// Validate field ranges.
    ///
    /// # Errors
    /// Returns a `Configuration` error naming the offending field.
    pub fn validate(&self) -> OpsResult<()> {
        if !(0.0..=1.0).contains(&self.tracing_sample_rate) {
            return Err(OpsError::configuration(format!(
                "tracing_sample_rate must be within [0, 1], got {}",
                self.tracing_sample_rate
            )));
        }
        Ok(())
    }
}

/// Aggregate client configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Default per-operation timeout
    #[serde(with = "serde_duration")]
    pub timeout: Duration,
    /// Client-wide in-flight operation cap (1–100)
    pub max_concurrent_requests: usize,
    /// Retry policy
    pub retry_policy: RetryConfig,
    /// Transport settings
    pub transport: TransportSettings,
    /// Monitoring settings
    pub monitoring: MonitoringSettings,
    /// API key credential (write-only)
    #[serde(skip_serializing)]
    pub api_key: Option<Secret>,
    /// Bearer token credential (write-only)
    #[serde(skip_serializing)]
    pub auth_token: Option<Secret>,
    /// Whether to pool connections
    pub enable_connection_pooling: bool,
    /// Connection pool size (1–100)
    pub connection_pool_size: usize,
    /// User agent sent on HTTP transports
    pub user_agent: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            max_concurrent_requests: 10,
            retry_policy: RetryConfig::default(),
            transport: TransportSettings::default(),
            monitoring: MonitoringSettings::default(),
            api_key: None,
            auth_token: None,
            enable_connection_pooling: true,
            connection_pool_size: 10,
            user_agent: concat!("opswatch-client/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

impl ClientConfig {
    /// Validate the whole tree.
    ///
    /// # Errors
    /// Returns the first `Configuration` error found.
    pub fn validate_strict(&self) -> OpsResult<()> {
        if self.timeout < Duration::from_millis(1) {
            return Err(OpsError::configuration("timeout must be at least 1ms"));
        }
        if self.max_concurrent_requests == 0 || self.max_concurrent_requests > 100 {
            return Err(OpsError::configuration(format!(
                "max_concurrent_requests must be within 1–100, got {}",
                self.max_concurrent_requests
            )));
        }
        if self.connection_pool_size == 0 || self.connection_pool_size > 100 {
            return Err(OpsError::configuration(format!(
                "connection_pool_size must be within 1–100, got {}",
                self.connection_pool_size
            )));
        }
        self.retry_policy.validate()?;
        self.transport.validate()?;
        self.monitoring.validate()?;
        Ok(())
    }

    /// Non-fatal configuration review.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        if self.timeout > Duration::from_secs(120) {
            warnings.push(format!(
                "high timeout ({:?}) may cause long waits",
                self.timeout
            ));
        }
        if self.max_concurrent_requests > 50 {
            warnings.push(format!(
                "high concurrent request limit ({}) may overwhelm servers",
                self.max_concurrent_requests
            ));
        }
        if self.retry_policy.max_retries > 5 {
            warnings.push(format!(
                "high retry count ({}) may cause long delays",
                self.retry_policy.max_retries
            ));
        }
        if self.monitoring.metrics_interval < Duration::from_secs(10) {
            warnings.push(format!(
                "frequent metrics collection ({:?}) may impact performance",
                self.monitoring.metrics_interval
            ));
        }
        if !self.transport.verify_tls {
            warnings.push("TLS verification is disabled".to_string());
        }
        warnings
    }

    /// Load configuration from a JSON file.
    ///
    /// # Errors
    /// Returns a `Configuration` error when the file is missing, unreadable,
    /// or invalid.
    pub fn from_file(path: impl AsRef<Path>) -> OpsResult<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            OpsError::configuration(format!("cannot read config file {}: {e}", path.display()))
        })?;
        let config: Self = serde_json::from_str(&raw).map_err(|e| {
            OpsError::configuration(format!("invalid config file {}: {e}", path.display()))
        })?;
        config.validate_strict()?;
        Ok(config)
    }

    /// Save configuration to a JSON file. Secrets are never written.
    ///
    /// # Errors
    /// Returns a `Configuration` error when serialization or the write fails.
    pub fn to_file(&self, path: impl AsRef<Path>) -> OpsResult<()> {
        let path = path.as_ref();
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| OpsError::configuration(format!("cannot serialize config: {e}")))?;
        std::fs::write(path, json).map_err(|e| {
            OpsError::configuration(format!("cannot write config file {}: {e}", path.display()))
        })
    }

    /// Build configuration from environment variables with the given prefix.
    ///
    /// Recognized but malformed values log a warning and keep the default.
    pub fn from_env_with_prefix(prefix: &str) -> Self {
        let mut config = Self::default();
        config.apply_env(prefix);
        config
    }

    /// Build configuration from `MCP_CLIENT_*` environment variables.
    pub fn from_env() -> Self {
        Self::from_env_with_prefix(ENV_PREFIX)
    }

    /// Apply environment overrides on top of the current values.
    pub fn apply_env(&mut self, prefix: &str) {
        fn lookup(prefix: &str, name: &str) -> Option<String> {
            std::env::var(format!("{prefix}{name}")).ok()
        }
        fn coerce<T: std::str::FromStr>(prefix: &str, name: &str, slot: &mut T) {
            if let Some(raw) = lookup(prefix, name) {
                match raw.parse::<T>() {
                    Ok(value) => *slot = value,
                    Err(_) => warn!(variable = %format!("{prefix}{name}"), value = %raw, "ignoring malformed environment override"),
                }
            }
        }
        fn coerce_bool(prefix: &str, name: &str, slot: &mut bool) {
            if let Some(raw) = lookup(prefix, name) {
                match raw.to_ascii_lowercase().as_str() {
                    "true" => *slot = true,
                    "false" => *slot = false,
                    _ => warn!(variable = %format!("{prefix}{name}"), value = %raw, "ignoring malformed environment override"),
                }
            }
        }
        fn coerce_secs(prefix: &str, name: &str, slot: &mut Duration) {
            if let Some(raw) = lookup(prefix, name) {
                match raw.parse::<f64>() {
                    Ok(secs) if secs.is_finite() && secs >= 0.0 => {
                        *slot = Duration::from_secs_f64(secs);
                    }
                    _ => warn!(variable = %format!("{prefix}{name}"), value = %raw, "ignoring malformed environment override"),
                }
            }
        }

        // Core settings
        coerce_secs(prefix, "TIMEOUT", &mut self.timeout);
        coerce(prefix, "MAX_CONCURRENT_REQUESTS", &mut self.max_concurrent_requests);
        if let Some(raw) = lookup(prefix, "API_KEY") {
            self.api_key = Some(Secret::new(raw));
        }
        if let Some(raw) = lookup(prefix, "AUTH_TOKEN") {
            self.auth_token = Some(Secret::new(raw));
        }
        coerce_bool(prefix, "ENABLE_CONNECTION_POOLING", &mut self.enable_connection_pooling);
        coerce(prefix, "CONNECTION_POOL_SIZE", &mut self.connection_pool_size);
        coerce(prefix, "USER_AGENT", &mut self.user_agent);

        // Retry policy
        coerce(prefix, "MAX_RETRIES", &mut self.retry_policy.max_retries);
        coerce_secs(prefix, "BASE_DELAY", &mut self.retry_policy.base_delay);
        coerce_secs(prefix, "MAX_DELAY", &mut self.retry_policy.max_delay);
        coerce(prefix, "BACKOFF_FACTOR", &mut self.retry_policy.backoff_factor);
        coerce_bool(prefix, "RETRY_JITTER", &mut self.retry_policy.jitter);

        // Transport settings
        coerce_secs(prefix, "CONNECT_TIMEOUT", &mut self.transport.connect_timeout);
        coerce_secs(prefix, "READ_TIMEOUT", &mut self.transport.read_timeout);
        coerce_secs(prefix, "WRITE_TIMEOUT", &mut self.transport.write_timeout);
        coerce(prefix, "MAX_CONNECTIONS", &mut self.transport.max_connections);
        coerce_bool(prefix, "KEEP_ALIVE", &mut self.transport.keep_alive);
        coerce_bool(prefix, "VERIFY_TLS", &mut self.transport.verify_tls);
        if let Some(raw) = lookup(prefix, "TLS_CERT_PATH") {
            self.transport.tls_cert_path = Some(raw);
        }

        // Monitoring settings
        coerce_bool(prefix, "ENABLE_METRICS", &mut self.monitoring.enable_metrics);
        coerce_secs(prefix, "METRICS_INTERVAL", &mut self.monitoring.metrics_interval);
        coerce_bool(prefix, "ENABLE_HEALTH_CHECKING", &mut self.monitoring.enable_health_checking);
        coerce_secs(prefix, "HEALTH_CHECK_INTERVAL", &mut self.monitoring.health_check_interval);
        coerce(prefix, "TRACING_SAMPLE_RATE", &mut self.monitoring.tracing_sample_rate);
    }

    /// Merge `other` over `self`, `other` taking precedence for every field
    /// that differs from the defaults.
    pub fn merge(&self, other: &Self) -> Self {
        let defaults = Self::default();
        let mut merged = self.clone();

        macro_rules! take {
            ($field:ident) => {
                if other.$field != defaults.$field {
                    merged.$field = other.$field.clone();
                }
            };
        }
        take!(timeout);
        take!(max_concurrent_requests);
        take!(retry_policy);
        take!(transport);
        take!(monitoring);
        take!(enable_connection_pooling);
        take!(connection_pool_size);
        take!(user_agent);
        if other.api_key.is_some() {
            merged.api_key = other.api_key.clone();
        }
        if other.auth_token.is_some() {
            merged.auth_token = other.auth_token.clone();
        }
        merged
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn defaults_validate() {
        ClientConfig::default().validate_strict().unwrap();
        assert!(ClientConfig::default().validate().is_empty());
    }

    #[test]
    fn delay_is_exact_without_jitter() {
        let policy = RetryConfig {
            max_retries: 5,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_secs(30),
            backoff_factor: 2.0,
            jitter: false,
        };
        assert_eq!(policy.delay_for(0), Duration::from_millis(10));
        assert_eq!(policy.delay_for(1), Duration::from_millis(20));
        assert_eq!(policy.delay_for(2), Duration::from_millis(40));
    }

    #[test]
    fn delay_caps_at_max() {
        let policy = RetryConfig {
            max_retries: 10,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(5),
            backoff_factor: 10.0,
            jitter: false,
        };
        assert_eq!(policy.delay_for(4), Duration::from_secs(5));
    }

    #[test]
    fn jitter_stays_within_quarter_band() {
        let policy = RetryConfig {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_factor: 1.0,
            jitter: true,
            ..RetryConfig::default()
        };
        for _ in 0..100 {
            let delay = policy.delay_for(0).as_secs_f64();
            assert!((0.75..=1.25).contains(&delay), "delay {delay} out of band");
        }
    }

    #[test]
    fn range_validation_rejects_out_of_bounds() {
        let mut config = ClientConfig::default();
        config.max_concurrent_requests = 0;
        assert!(config.validate_strict().is_err());
        config.max_concurrent_requests = 101;
        assert!(config.validate_strict().is_err());

        let mut retry = RetryConfig::default();
        retry.max_retries = 11;
        assert!(retry.validate().is_err());
        retry.max_retries = 10;
        retry.backoff_factor = 0.5;
        assert!(retry.validate().is_err());

        let mut monitoring = MonitoringSettings::default();
        monitoring.tracing_sample_rate = 1.5;
        assert!(monitoring.validate().is_err());
    }

    #[test]
    fn file_round_trip_preserves_non_secret_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("client.json");

        let mut config = ClientConfig::default();
        config.timeout = Duration::from_secs(45);
        config.retry_policy.max_retries = 5;
        config.transport.max_connections = 20;
        config.api_key = Some(Secret::new("sk-secret"));
        config.to_file(&path).unwrap();

        // The secret must never land on disk.
        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(!raw.contains("sk-secret"));

        let loaded = ClientConfig::from_file(&path).unwrap();
        assert_eq!(loaded.timeout, Duration::from_secs(45));
        assert_eq!(loaded.retry_policy.max_retries, 5);
        assert_eq!(loaded.transport.max_connections, 20);
        assert!(loaded.api_key.is_none());
    }

    #[test]
    fn merge_prefers_non_default_overrides() {
        let base = ClientConfig {
            timeout: Duration::from_secs(60),
            connection_pool_size: 20,
            ..ClientConfig::default()
        };
        let overlay = ClientConfig {
            max_concurrent_requests: 4,
            ..ClientConfig::default()
        };
        let merged = base.merge(&overlay);
        assert_eq!(merged.timeout, Duration::from_secs(60));
        assert_eq!(merged.connection_pool_size, 20);
        assert_eq!(merged.max_concurrent_requests, 4);
    }

    #[test]
    fn secret_is_redacted_in_debug_output() {
        let secret = Secret::new("hunter2");
        assert_eq!(format!("{secret:?}"), "Secret(***)");
        assert_eq!(secret.expose(), "hunter2");
    }

    #[test]
    fn env_overrides_apply_and_malformed_values_keep_defaults() {
        // Process-global env access: use a prefix unique to this test.
        let prefix = "OPSWATCH_TEST_CFG_";
        std::env::set_var(format!("{prefix}TIMEOUT"), "12.5");
        std::env::set_var(format!("{prefix}MAX_RETRIES"), "7");
        std::env::set_var(format!("{prefix}RETRY_JITTER"), "FALSE");
        std::env::set_var(format!("{prefix}MAX_CONNECTIONS"), "not-a-number");

        let config = ClientConfig::from_env_with_prefix(prefix);
        assert_eq!(config.timeout, Duration::from_secs_f64(12.5));
        assert_eq!(config.retry_policy.max_retries, 7);
        assert!(!config.retry_policy.jitter);
        // Malformed value kept the default.
        assert_eq!(config.transport.max_connections, 10);

        for name in ["TIMEOUT", "MAX_RETRIES", "RETRY_JITTER", "MAX_CONNECTIONS"] {
            std::env::remove_var(format!("{prefix}{name}"));
        }
    }
}
