//! Performance tracking for named operations.
//!
//! Operations are timed via `start_operation`/`end_operation` or recorded
//! directly. Each operation keeps a sliding window of samples; a sample
//! slower than twice the rolling mean raises an alert (warning under 3×,
//! critical beyond).

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::warn;

/// Minimum samples before alerting makes sense.
const MIN_SAMPLES_FOR_ALERTS: usize = 10;

/// Alert severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    /// Sample between 2× and 3× the rolling mean
    Warning,
    /// Sample at least 3× the rolling mean
    Critical,
}

/// A performance degradation alert.
#[derive(Debug, Clone, Serialize)]
pub struct PerformanceAlert {
    /// Operation that degraded
    pub operation: String,
    /// Offending sample duration
    #[serde(with = "opswatch_core::serde_duration")]
    pub duration: Duration,
    /// Rolling mean at the time of the sample
    #[serde(with = "opswatch_core::serde_duration")]
    pub average_duration: Duration,
    /// Severity tier
    pub severity: AlertSeverity,
    /// When the alert fired
    pub timestamp: DateTime<Utc>,
}

/// Performance trend over a recent window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Trend {
    /// Recent samples are faster
    Improving,
    /// Recent samples are slower
    Degrading,
    /// No significant change
    Stable,
}

#[derive(Default)]
struct PerfState {
    windows: HashMap<String, VecDeque<(Instant, Duration)>>,
    active: HashMap<String, Instant>,
    alerts: VecDeque<PerformanceAlert>,
    total_operations: u64,
}

/// Sliding-window operation timing with degradation alerts.
pub struct PerformanceTracker {
    window_size: usize,
    state: Mutex<PerfState>,
    started_at: Instant,
}

impl Default for PerformanceTracker {
    fn default() -> Self {
        Self::new(100)
    }
}

impl PerformanceTracker {
    /// Create a tracker with the given per-operation window size.
    pub fn new(window_size: usize) -> Self {
        Self {
            window_size,
            state: Mutex::new(PerfState::default()),
            started_at: Instant::now(),
        }
    }

    /// Time since this tracker was created.
    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Start timing `operation`.
    pub async fn start_operation(&self, operation: &str) {
        self.state
            .lock()
            .await
            .active
            .insert(operation.to_string(), Instant::now());
    }

    /// Finish timing `operation`, recording its duration. Returns `None`
    /// when the operation was never started.
    pub async fn end_operation(&self, operation: &str) -> Option<Duration> {
        let mut state = self.state.lock().await;
        let started = state.active.remove(operation)?;
        let duration = started.elapsed();
        Self::record(&mut state, self.window_size, operation, duration);
        Some(duration)
    }

    /// Record a duration measured elsewhere.
    pub async fn record_operation_time(&self, operation: &str, duration: Duration) {
        let mut state = self.state.lock().await;
        Self::record(&mut state, self.window_size, operation, duration);
    }

    fn record(state: &mut PerfState, window_size: usize, operation: &str, duration: Duration) {
        let window = state.windows.entry(operation.to_string()).or_default();
        // Alert check runs against the window *before* this sample so a
        // single spike cannot hide behind its own contribution to the mean.
        if window.len() >= MIN_SAMPLES_FOR_ALERTS {
            let mean = window.iter().map(|(_, d)| d.as_secs_f64()).sum::<f64>()
                / window.len() as f64;
            let sample = duration.as_secs_f64();
            if sample > mean * 2.0 {
                let severity = if sample < mean * 3.0 {
                    AlertSeverity::Warning
                } else {
                    AlertSeverity::Critical
                };
                let alert = PerformanceAlert {
                    operation: operation.to_string(),
                    duration,
                    average_duration: Duration::from_secs_f64(mean),
                    severity,
                    timestamp: Utc::now(),
                };
                warn!(
                    operation,
                    duration_ms = duration.as_millis() as u64,
                    average_ms = (mean * 1000.0) as u64,
                    severity = ?severity,
                    "performance degradation"
                );
                if state.alerts.len() == 50 {
                    state.alerts.pop_front();
                }
                state.alerts.push_back(alert);
            }
        }
        let window = state.windows.entry(operation.to_string()).or_default();
        if window.len() == window_size {
            window.pop_front();
        }
        window.push_back((Instant::now(), duration));
        state.total_operations += 1;
    }

    /// Statistics for one operation, or `None` without samples.
    pub async fn performance_stats(&self, operation: &str) -> Option<Value> {
        let state = self.state.lock().await;
        let window = state.windows.get(operation)?;
        if window.is_empty() {
            return None;
        }
        let mut samples: Vec<f64> = window.iter().map(|(_, d)| d.as_secs_f64()).collect();
        let count = samples.len();
        let mean = samples.iter().sum::<f64>() / count as f64;
        let min = samples.iter().cloned().fold(f64::INFINITY, f64::min);
        let max = samples.iter().cloned().fold(0.0_f64, f64::max);
        samples.sort_by(|a, b| a.total_cmp(b));
        let median = samples[count / 2];
        let variance = samples.iter().map(|s| (s - mean).powi(2)).sum::<f64>() / count as f64;
        Some(serde_json::json!({
            "count": count,
            "mean": mean,
            "min": min,
            "max": max,
            "median": median,
            "std_dev": variance.sqrt(),
        }))
    }

    /// Trend over the last `window` of samples, or `None` without enough
    /// data.
    pub async fn performance_trend(&self, operation: &str, window: Duration) -> Option<Trend> {
        let state = self.state.lock().await;
        let samples = state.windows.get(operation)?;
        let cutoff = Instant::now().checked_sub(window)?;
        let recent: Vec<f64> = samples
            .iter()
            .filter(|(at, _)| *at >= cutoff)
            .map(|(_, d)| d.as_secs_f64())
            .collect();
        if recent.len() < MIN_SAMPLES_FOR_ALERTS {
            return None;
        }
        let mid = recent.len() / 2;
        let first = recent[..mid].iter().sum::<f64>() / mid as f64;
        let second = recent[mid..].iter().sum::<f64>() / (recent.len() - mid) as f64;
        Some(if second < first * 0.9 {
            Trend::Improving
        } else if second > first * 1.1 {
            Trend::Degrading
        } else {
            Trend::Stable
        })
    }

    /// Recent alerts, oldest first.
    pub async fn alerts(&self) -> Vec<PerformanceAlert> {
        self.state.lock().await.alerts.iter().cloned().collect()
    }

    /// Comprehensive summary across operations.
    pub async fn summary(&self) -> Value {
        let operations: Vec<String> = {
            let state = self.state.lock().await;
            state.windows.keys().cloned().collect()
        };
        let mut per_operation = serde_json::Map::new();
        for op in operations {
            if let Some(stats) = self.performance_stats(&op).await {
                per_operation.insert(op, stats);
            }
        }
        let state = self.state.lock().await;
        let alerts: Vec<&PerformanceAlert> = state.alerts.iter().rev().take(10).collect();
        serde_json::json!({
            "uptime": self.started_at.elapsed().as_secs_f64(),
            "total_operations": state.total_operations,
            "operations": per_operation,
            "alerts": alerts,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn seed(tracker: &PerformanceTracker, operation: &str, ms: u64, count: usize) {
        for _ in 0..count {
            tracker
                .record_operation_time(operation, Duration::from_millis(ms))
                .await;
        }
    }

    #[tokio::test]
    async fn start_end_measures_duration() {
        let tracker = PerformanceTracker::default();
        tracker.start_operation("op").await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        let duration = tracker.end_operation("op").await.unwrap();
        assert!(duration >= Duration::from_millis(10));
        assert!(tracker.end_operation("op").await.is_none());
    }

    #[tokio::test]
    async fn slow_sample_raises_warning_then_critical() {
        let tracker = PerformanceTracker::default();
        seed(&tracker, "op", 100, 10).await;

        // 2.5x the mean: warning.
        tracker
            .record_operation_time("op", Duration::from_millis(250))
            .await;
        let alerts = tracker.alerts().await;
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].severity, AlertSeverity::Warning);

        // Well past 3x the (slightly shifted) mean: critical.
        tracker
            .record_operation_time("op", Duration::from_millis(1000))
            .await;
        let alerts = tracker.alerts().await;
        assert_eq!(alerts.len(), 2);
        assert_eq!(alerts[1].severity, AlertSeverity::Critical);
    }

    #[tokio::test]
    async fn no_alerts_without_enough_samples() {
        let tracker = PerformanceTracker::default();
        seed(&tracker, "op", 10, 5).await;
        tracker
            .record_operation_time("op", Duration::from_millis(500))
            .await;
        assert!(tracker.alerts().await.is_empty());
    }

    #[tokio::test]
    async fn stats_report_window_shape() {
        let tracker = PerformanceTracker::new(4);
        seed(&tracker, "op", 10, 2).await;
        seed(&tracker, "op", 30, 2).await;
        let stats = tracker.performance_stats("op").await.unwrap();
        assert_eq!(stats["count"], 4);
        assert!((stats["mean"].as_f64().unwrap() - 0.020).abs() < 1e-9);
        assert!((stats["min"].as_f64().unwrap() - 0.010).abs() < 1e-9);
        assert!((stats["max"].as_f64().unwrap() - 0.030).abs() < 1e-9);

        // Window evicts the oldest samples.
        seed(&tracker, "op", 50, 4).await;
        let stats = tracker.performance_stats("op").await.unwrap();
        assert_eq!(stats["count"], 4);
        assert!((stats["mean"].as_f64().unwrap() - 0.050).abs() < 1e-9);
    }

    #[tokio::test]
    async fn trend_detects_degradation() {
        let tracker = PerformanceTracker::default();
        seed(&tracker, "op", 10, 6).await;
        seed(&tracker, "op", 40, 6).await;
        let trend = tracker
            .performance_trend("op", Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(trend, Trend::Degrading);
    }
}
