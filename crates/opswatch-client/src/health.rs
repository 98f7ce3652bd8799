//! Health checking for clients and pools.
//!
//! [`HealthProbe`] is the seam: anything that can enumerate tools can be
//! probed. The [`HealthChecker`] wraps a probe, keeps a bounded history of
//! results, and optionally re-probes on a background interval.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex as SyncMutex;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use opswatch_core::OpsResult;

use crate::config::MonitoringSettings;

/// History depth kept by the checker.
const HISTORY_DEPTH: usize = 100;

/// Health verdicts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    /// Probe succeeded and the server advertises tools
    Healthy,
    /// Probe succeeded but the response looks impaired
    Degraded,
    /// Probe failed
    Unhealthy,
    /// No probe has run yet
    Unknown,
}

/// Result of one health check.
#[derive(Debug, Clone, Serialize)]
pub struct HealthCheckResult {
    /// Verdict
    pub status: HealthStatus,
    /// Probe round-trip time
    #[serde(with = "opswatch_core::serde_duration")]
    pub response_time: Duration,
    /// Error description for non-healthy verdicts
    pub error: Option<String>,
    /// When the probe ran
    pub timestamp: DateTime<Utc>,
    /// Extra details (tool counts, ...)
    pub details: Value,
}

impl HealthCheckResult {
    /// Whether the verdict is `Healthy`.
    pub fn is_healthy(&self) -> bool {
        self.status == HealthStatus::Healthy
    }
}

/// Anything that can be probed for liveness.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    /// Enumerate tools as a liveness probe.
    async fn probe_tools(&self) -> OpsResult<Vec<String>>;
}

#[async_trait]
impl HealthProbe for crate::client::Client {
    async fn probe_tools(&self) -> OpsResult<Vec<String>> {
        self.list_tools().await
    }
}

/// Periodic health checking with bounded history.
pub struct HealthChecker {
    probe: Arc<dyn HealthProbe>,
    settings: MonitoringSettings,
    history: SyncMutex<VecDeque<HealthCheckResult>>,
    last_check: AsyncMutex<Option<DateTime<Utc>>>,
    task: SyncMutex<Option<tokio::task::JoinHandle<()>>>,
}

impl HealthChecker {
    /// Create a checker around a probe.
    pub fn new(probe: Arc<dyn HealthProbe>, settings: MonitoringSettings) -> Arc<Self> {
        Arc::new(Self {
            probe,
            settings,
            history: SyncMutex::new(VecDeque::with_capacity(HISTORY_DEPTH)),
            last_check: AsyncMutex::new(None),
            task: SyncMutex::new(None),
        })
    }

    /// Run one health check. The default timeout is half the configured
    /// check interval.
    pub async fn check_health(&self, probe_timeout: Option<Duration>) -> HealthCheckResult {
        let probe_timeout =
            probe_timeout.unwrap_or_else(|| self.settings.health_check_interval / 2);
        let started = std::time::Instant::now();

        let (status, error, details) = match timeout(probe_timeout, self.probe.probe_tools()).await
        {
            Ok(Ok(tools)) => {
                if tools.is_empty() {
                    (
                        HealthStatus::Degraded,
                        Some("no tools available".to_string()),
                        serde_json::json!({"tools_count": 0}),
                    )
                } else {
                    (
                        HealthStatus::Healthy,
                        None,
                        serde_json::json!({"tools_count": tools.len()}),
                    )
                }
            }
            Ok(Err(e)) => (HealthStatus::Unhealthy, Some(e.to_string()), Value::Null),
            Err(_) => (
                HealthStatus::Unhealthy,
                Some("health check timed out".to_string()),
                Value::Null,
            ),
        };

        let result = HealthCheckResult {
            status,
            response_time: started.elapsed(),
            error,
            timestamp: Utc::now(),
            details,
        };

        {
            let mut history = self.history.lock();
            if history.len() == HISTORY_DEPTH {
                history.pop_front();
            }
            history.push_back(result.clone());
        }
        *self.last_check.lock().await = Some(result.timestamp);

        match result.status {
            HealthStatus::Healthy => {
                debug!(response_time_ms = result.response_time.as_millis() as u64, "health check passed");
            }
            _ => {
                warn!(status = ?result.status, error = ?result.error, "health check failed");
            }
        }
        result
    }

    /// Start continuous checking in the background. No-op when running.
    pub fn start_continuous_checking(self: &Arc<Self>) {
        let mut task = self.task.lock();
        if task.as_ref().is_some_and(|t| !t.is_finished()) {
            return;
        }
        let checker = Arc::clone(self);
        let interval = self.settings.health_check_interval;
        *task = Some(tokio::spawn(async move {
            loop {
                checker.check_health(None).await;
                tokio::time::sleep(interval).await;
            }
        }));
        info!("started continuous health checking");
    }

    /// Stop continuous checking.
    pub fn stop_continuous_checking(&self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
            info!("stopped continuous health checking");
        }
    }

    /// When the last check ran, if any.
    pub async fn last_check(&self) -> Option<DateTime<Utc>> {
        *self.last_check.lock().await
    }

    /// Whether the latest check was healthy. `false` before any check.
    pub fn is_healthy(&self) -> bool {
        self.history
            .lock()
            .back()
            .is_some_and(HealthCheckResult::is_healthy)
    }

    /// Summary over the retained history.
    pub fn health_summary(&self) -> Value {
        let history = self.history.lock();
        let Some(latest) = history.back() else {
            return serde_json::json!({
                "status": "unknown",
                "last_check": Value::Null,
                "checks_count": 0,
                "healthy_checks": 0,
                "unhealthy_checks": 0,
                "average_response_time": 0.0,
            });
        };
        let healthy = history.iter().filter(|r| r.status == HealthStatus::Healthy).count();
        let unhealthy = history.iter().filter(|r| r.status == HealthStatus::Unhealthy).count();
        let degraded = history.iter().filter(|r| r.status == HealthStatus::Degraded).count();
        let avg = history
            .iter()
            .map(|r| r.response_time.as_secs_f64())
            .sum::<f64>()
            / history.len() as f64;
        serde_json::json!({
            "status": latest.status,
            "last_check": latest.timestamp.to_rfc3339(),
            "checks_count": history.len(),
            "healthy_checks": healthy,
            "unhealthy_checks": unhealthy,
            "degraded_checks": degraded,
            "average_response_time": avg,
            "latest_response_time": latest.response_time.as_secs_f64(),
            "latest_error": latest.error,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use opswatch_core::OpsError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct ScriptedProbe {
        /// Outcomes consumed from the front.
        outcomes: SyncMutex<VecDeque<OpsResult<Vec<String>>>>,
        calls: AtomicUsize,
    }

    impl ScriptedProbe {
        fn new(outcomes: Vec<OpsResult<Vec<String>>>) -> Arc<Self> {
            Arc::new(Self {
                outcomes: SyncMutex::new(outcomes.into()),
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl HealthProbe for ScriptedProbe {
        async fn probe_tools(&self) -> OpsResult<Vec<String>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.outcomes
                .lock()
                .pop_front()
                .unwrap_or_else(|| Ok(vec!["tool".into()]))
        }
    }

    #[tokio::test]
    async fn verdicts_follow_probe_outcomes() {
        let probe = ScriptedProbe::new(vec![
            Ok(vec!["a".into()]),
            Ok(vec![]),
            Err(OpsError::connection("down")),
        ]);
        let checker = HealthChecker::new(probe, MonitoringSettings::default());

        assert_eq!(checker.check_health(None).await.status, HealthStatus::Healthy);
        assert!(checker.is_healthy());

        assert_eq!(checker.check_health(None).await.status, HealthStatus::Degraded);
        assert!(!checker.is_healthy());

        let result = checker.check_health(None).await;
        assert_eq!(result.status, HealthStatus::Unhealthy);
        assert!(result.error.unwrap().contains("down"));
    }

    #[tokio::test]
    async fn summary_aggregates_history() {
        let probe = ScriptedProbe::new(vec![
            Ok(vec!["a".into()]),
            Err(OpsError::connection("down")),
            Ok(vec!["a".into()]),
        ]);
        let checker = HealthChecker::new(probe, MonitoringSettings::default());
        for _ in 0..3 {
            checker.check_health(None).await;
        }
        let summary = checker.health_summary();
        assert_eq!(summary["checks_count"], 3);
        assert_eq!(summary["healthy_checks"], 2);
        assert_eq!(summary["unhealthy_checks"], 1);
        assert_eq!(summary["status"], "healthy");
    }

    #[tokio::test]
    async fn empty_history_reports_unknown() {
        let probe = ScriptedProbe::new(vec![]);
        let checker = HealthChecker::new(probe, MonitoringSettings::default());
        let summary = checker.health_summary();
        assert_eq!(summary["status"], "unknown");
        assert!(!checker.is_healthy());
    }

    #[tokio::test]
    async fn history_is_bounded_to_depth() {
        let probe = ScriptedProbe::new(vec![]);
        let checker = HealthChecker::new(probe, MonitoringSettings::default());
        for _ in 0..(HISTORY_DEPTH + 20) {
            checker.check_health(None).await;
        }
        assert_eq!(checker.health_summary()["checks_count"], HISTORY_DEPTH);
    }
}
