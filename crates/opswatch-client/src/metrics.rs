//! Client metrics: global counters, per-operation statistics, and a sliding
//! window of recent requests.
//!
//! A single async mutex guards all state; readers observe a consistent
//! snapshot per call. Counter laws: `total = successes + failures`, and a
//! per-operation average equals `total_duration / count` whenever count > 0.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::info;

/// Default capacity of the recent-request sliding window.
pub const DEFAULT_HISTORY: usize = 1000;

/// Metrics for one recorded request.
#[derive(Debug, Clone, Serialize)]
pub struct RequestMetrics {
    /// Operation name, e.g. "list_tools" or "call_tool(get_tasks)"
    pub operation: String,
    /// Request duration
    #[serde(with = "opswatch_core::serde_duration")]
    pub duration: Duration,
    /// Whether the request succeeded
    pub success: bool,
    /// Error-kind label for failures
    pub error_kind: Option<String>,
    /// Retries spent on this request
    pub retry_count: u32,
    /// When the request finished
    pub finished_at: DateTime<Utc>,
}

/// Aggregated statistics for one operation.
#[derive(Debug, Clone, Default, Serialize)]
pub struct OperationStats {
    /// Total requests recorded
    pub total_requests: u64,
    /// Successful requests
    pub successful_requests: u64,
    /// Failed requests
    pub failed_requests: u64,
    /// Sum of all durations
    #[serde(with = "opswatch_core::serde_duration")]
    pub total_duration: Duration,
    /// Shortest observed duration
    #[serde(with = "opswatch_core::serde_duration::option")]
    pub min_duration: Option<Duration>,
    /// Longest observed duration
    #[serde(with = "opswatch_core::serde_duration::option")]
    pub max_duration: Option<Duration>,
    /// Failure counts per error kind
    pub errors: BTreeMap<String, u64>,
}

impl OperationStats {
    fn update(&mut self, metrics: &RequestMetrics) {
        self.total_requests += 1;
        self.total_duration += metrics.duration;
        if metrics.success {
            self.successful_requests += 1;
        } else {
            self.failed_requests += 1;
            if let Some(kind) = &metrics.error_kind {
                *self.errors.entry(kind.clone()).or_default() += 1;
            }
        }
        self.min_duration = Some(match self.min_duration {
            Some(min) => min.min(metrics.duration),
            None => metrics.duration,
        });
        self.max_duration = Some(match self.max_duration {
            Some(max) => max.max(metrics.duration),
            None => metrics.duration,
        });
    }

    /// Success rate as a percentage.
    pub fn success_rate(&self) -> f64 {
        if self.total_requests == 0 {
            return 0.0;
        }
        self.successful_requests as f64 / self.total_requests as f64 * 100.0
    }

    /// Average duration across all requests.
    pub fn average_duration(&self) -> Duration {
        if self.total_requests == 0 {
            return Duration::ZERO;
        }
        self.total_duration / self.total_requests as u32
    }
}

#[derive(Debug, Default)]
struct MetricsState {
    total_requests: u64,
    successful_requests: u64,
    failed_requests: u64,
    total_duration: Duration,
    operation_stats: HashMap<String, OperationStats>,
    recent: VecDeque<RequestMetrics>,
    error_counts: BTreeMap<String, u64>,
}

/// Metrics collection for one client.
#[derive(Debug)]
pub struct ClientMetrics {
    max_history: usize,
    started_at: Instant,
    state: Mutex<MetricsState>,
}

impl Default for ClientMetrics {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY)
    }
}

impl ClientMetrics {
    /// Create a metrics collector keeping up to `max_history` recent
    /// requests.
    pub fn new(max_history: usize) -> Self {
        Self {
            max_history,
            started_at: Instant::now(),
            state: Mutex::new(MetricsState::default()),
        }
    }

    /// Record one request.
    pub async fn record_request(
        &self,
        operation: &str,
        duration: Duration,
        success: bool,
        error_kind: Option<&str>,
        retry_count: u32,
    ) {
        let metrics = RequestMetrics {
            operation: operation.to_string(),
            duration,
            success,
            error_kind: error_kind.map(str::to_string),
            retry_count,
            finished_at: Utc::now(),
        };

        let mut state = self.state.lock().await;
        state.total_requests += 1;
        state.total_duration += duration;
        if success {
            state.successful_requests += 1;
        } else {
            state.failed_requests += 1;
            if let Some(kind) = error_kind {
                *state.error_counts.entry(kind.to_string()).or_default() += 1;
            }
        }
        state
            .operation_stats
            .entry(operation.to_string())
            .or_default()
            .update(&metrics);
        if state.recent.len() == self.max_history {
            state.recent.pop_front();
        }
        state.recent.push_back(metrics);
    }

    /// Record a success.
    pub async fn record_success(&self, operation: &str, duration: Duration) {
        self.record_request(operation, duration, true, None, 0).await;
    }

    /// Record a failure.
    pub async fn record_failure(&self, operation: &str, duration: Duration, error_kind: &str) {
        self.record_request(operation, duration, false, Some(error_kind), 0)
            .await;
    }

    /// Overall success rate as a percentage.
    pub async fn success_rate(&self) -> f64 {
        let state = self.state.lock().await;
        if state.total_requests == 0 {
            return 0.0;
        }
        state.successful_requests as f64 / state.total_requests as f64 * 100.0
    }

    /// Average response time across all requests.
    pub async fn average_response_time(&self) -> Duration {
        let state = self.state.lock().await;
        if state.total_requests == 0 {
            return Duration::ZERO;
        }
        state.total_duration / state.total_requests as u32
    }

    /// Time since this collector was created.
    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Statistics for one operation.
    pub async fn operation_stats(&self, operation: &str) -> Option<OperationStats> {
        self.state.lock().await.operation_stats.get(operation).cloned()
    }

    /// The most frequent error kinds, descending.
    pub async fn top_errors(&self, limit: usize) -> Vec<(String, u64)> {
        let state = self.state.lock().await;
        let mut errors: Vec<_> = state
            .error_counts
            .iter()
            .map(|(k, v)| (k.clone(), *v))
            .collect();
        errors.sort_by(|a, b| b.1.cmp(&a.1));
        errors.truncate(limit);
        errors
    }

    /// Recent failed requests, oldest first.
    pub async fn recent_errors(&self, limit: usize) -> Vec<RequestMetrics> {
        let state = self.state.lock().await;
        let failed: Vec<_> = state.recent.iter().filter(|r| !r.success).cloned().collect();
        let skip = failed.len().saturating_sub(limit);
        failed.into_iter().skip(skip).collect()
    }

    /// Flat snapshot of every counter.
    pub async fn summary(&self) -> Value {
        let state = self.state.lock().await;
        let operations: BTreeMap<String, Value> = state
            .operation_stats
            .iter()
            .map(|(op, stats)| {
                (
                    op.clone(),
                    serde_json::json!({
                        "total_requests": stats.total_requests,
                        "success_rate": stats.success_rate(),
                        "average_duration": stats.average_duration().as_secs_f64(),
                        "min_duration": stats.min_duration.map(|d| d.as_secs_f64()).unwrap_or(0.0),
                        "max_duration": stats.max_duration.map(|d| d.as_secs_f64()).unwrap_or(0.0),
                        "errors": stats.errors,
                    }),
                )
            })
            .collect();
        let success_rate = if state.total_requests == 0 {
            0.0
        } else {
            state.successful_requests as f64 / state.total_requests as f64 * 100.0
        };
        let average = if state.total_requests == 0 {
            0.0
        } else {
            state.total_duration.as_secs_f64() / state.total_requests as f64
        };
        serde_json::json!({
            "uptime": self.started_at.elapsed().as_secs_f64(),
            "total_requests": state.total_requests,
            "successful_requests": state.successful_requests,
            "failed_requests": state.failed_requests,
            "success_rate": success_rate,
            "average_response_time": average,
            "operation_stats": operations,
            "error_counts": state.error_counts,
        })
    }

    /// Clear all recorded state.
    pub async fn reset(&self) {
        let mut state = self.state.lock().await;
        *state = MetricsState::default();
        info!("client metrics reset");
    }
}
