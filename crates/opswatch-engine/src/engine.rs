//! The checking-point engine: poll → fanout → order → dispatch.
//!
//! All pipeline concurrency is orchestrated here. Polls of distinct points
//! run in parallel while polls of the same point are mutually exclusive;
//! evaluation fans out under a global semaphore; per-item results are
//! reordered into priority order before dispatch regardless of finish
//! order; a bounded in-flight window provides backpressure against slow
//! dispatch.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use parking_lot::Mutex as SyncMutex;
use serde_json::Value;
use tokio::sync::{watch, Semaphore};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use opswatch_core::{
    AiAction, CheckOutcome, CheckResult, MonitoringData, ProcessingStatus,
};

use crate::dispatch::ActionDispatcher;
use crate::point::{CheckingPoint, FetchParams};
use crate::registry::Registry;
use crate::workflow::{WorkflowResult, WorkflowRunner};

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Global bound on concurrent evaluations
    pub max_concurrent_evaluations: usize,
    /// Bound on items in flight; polling pauses at saturation
    pub max_in_flight_items: usize,
    /// Grace window for cooperative shutdown
    pub shutdown_grace: Duration,
    /// Whether item completion waits for proposal workflows to reach a
    /// terminal state (false treats proposals as fire-and-forget)
    pub await_workflows: bool,
    /// Pacing of the continuous run loop
    pub tick_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_evaluations: 10,
            max_in_flight_items: 32,
            shutdown_grace: Duration::from_secs(10),
            await_workflows: true,
            tick_interval: Duration::from_secs(1),
        }
    }
}

/// Counters accumulated across the engine's lifetime.
#[derive(Debug, Default)]
pub struct EngineStats {
    /// Completed polling cycles
    pub cycles: AtomicU64,
    /// Items processed to a terminal status
    pub items_processed: AtomicU64,
    /// Items that terminated as failed
    pub items_failed: AtomicU64,
    /// Fetch invocations that returned an error
    pub fetch_failures: AtomicU64,
    /// Evaluations run (including retries)
    pub evaluations: AtomicU64,
}

impl EngineStats {
    /// Snapshot as JSON.
    pub fn summary(&self) -> Value {
        serde_json::json!({
            "cycles": self.cycles.load(Ordering::Relaxed),
            "items_processed": self.items_processed.load(Ordering::Relaxed),
            "items_failed": self.items_failed.load(Ordering::Relaxed),
            "fetch_failures": self.fetch_failures.load(Ordering::Relaxed),
            "evaluations": self.evaluations.load(Ordering::Relaxed),
        })
    }
}

/// Report for one processed item.
#[derive(Debug)]
pub struct ItemReport {
    /// The item with its terminal status and errors
    pub item: MonitoringData,
    /// Results dispatched, in priority order after the stop-on-match cut
    pub results: Vec<CheckResult>,
    /// Names of deterministic actions that executed
    pub actions_executed: Vec<String>,
    /// Workflow results for awaited proposals
    pub workflow_results: Vec<WorkflowResult>,
    /// Proposals handed off without awaiting (fire-and-forget mode)
    pub workflows_spawned: usize,
}

/// Report for one polling cycle.
#[derive(Debug, Default)]
pub struct CycleReport {
    /// Points polled this cycle
    pub points_polled: Vec<String>,
    /// Fetch errors by point name
    pub fetch_errors: Vec<(String, String)>,
    /// Item reports
    pub items: Vec<ItemReport>,
}

struct PollState {
    guard: Arc<tokio::sync::Mutex<()>>,
    last_poll: Option<Instant>,
}

/// The pipeline scheduler.
pub struct Engine {
    registry: Arc<Registry>,
    dispatcher: Arc<ActionDispatcher>,
    runner: Arc<WorkflowRunner>,
    config: EngineConfig,
    stats: Arc<EngineStats>,
    eval_semaphore: Arc<Semaphore>,
    item_window: Arc<Semaphore>,
    poll_states: SyncMutex<HashMap<String, PollState>>,
    shutdown_tx: watch::Sender<bool>,
}

impl Engine {
    /// Assemble an engine.
    pub fn new(
        registry: Arc<Registry>,
        dispatcher: Arc<ActionDispatcher>,
        runner: Arc<WorkflowRunner>,
        config: EngineConfig,
    ) -> Arc<Self> {
        let (shutdown_tx, _) = watch::channel(false);
        Arc::new(Self {
            eval_semaphore: Arc::new(Semaphore::new(config.max_concurrent_evaluations)),
            item_window: Arc::new(Semaphore::new(config.max_in_flight_items)),
            registry,
            dispatcher,
            runner,
            config,
            stats: Arc::new(EngineStats::default()),
            poll_states: SyncMutex::new(HashMap::new()),
            shutdown_tx,
        })
    }

    /// The engine's registry.
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Lifetime counters.
    pub fn stats(&self) -> &Arc<EngineStats> {
        &self.stats
    }

    /// Validate every registered point, as at engine start.
    ///
    /// # Errors
    /// Returns the offending (name, problems) pairs when any point fails
    /// validation.
    pub fn validate_points(&self) -> Result<(), Vec<(String, Vec<String>)>> {
        let failures = self.registry.validate_all();
        if failures.is_empty() {
            Ok(())
        } else {
            Err(failures)
        }
    }

    fn poll_guard(&self, name: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut states = self.poll_states.lock();
        Arc::clone(
            &states
                .entry(name.to_string())
                .or_insert_with(|| PollState {
                    guard: Arc::new(tokio::sync::Mutex::new(())),
                    last_poll: None,
                })
                .guard,
        )
    }

    fn poll_due(&self, point: &Arc<dyn CheckingPoint>) -> bool {
        let states = self.poll_states.lock();
        match states.get(&point.spec().name).and_then(|s| s.last_poll) {
            Some(at) => at.elapsed() >= point.spec().poll_interval,
            None => true,
        }
    }

    fn note_polled(&self, name: &str) {
        let mut states = self.poll_states.lock();
        if let Some(state) = states.get_mut(name) {
            state.last_poll = Some(Instant::now());
        }
    }

    /// Fetch a batch from one point, honoring its in-cycle retry budget.
    /// At most one poll per point is in flight at any time.
    async fn poll_point(
        &self,
        point: &Arc<dyn CheckingPoint>,
        params: &FetchParams,
    ) -> Result<Vec<MonitoringData>, String> {
        let spec = point.spec();
        let guard = self.poll_guard(&spec.name);
        let Ok(_poll_lock) = guard.try_lock() else {
            debug!(point = %spec.name, "poll already in flight, skipping");
            return Ok(Vec::new());
        };

        let mut last_error = String::new();
        for attempt in 0..=spec.max_retries {
            match point.fetch(params).await {
                Ok(items) => {
                    self.note_polled(&spec.name);
                    debug!(point = %spec.name, count = items.len(), "poll fetched items");
                    return Ok(items);
                }
                Err(e) => {
                    last_error = e.to_string();
                    self.stats.fetch_failures.fetch_add(1, Ordering::Relaxed);
                    if e.is_retryable() && attempt < spec.max_retries {
                        debug!(point = %spec.name, attempt, error = %e, "fetch failed, retrying in-cycle");
                        continue;
                    }
                    break;
                }
            }
        }
        self.note_polled(&spec.name);
        warn!(point = %point.spec().name, error = %last_error, "poll failed");
        Err(last_error)
    }

    /// Evaluate one point against one item, retrying transient errors
    /// within the point's budget and bounding each attempt by the point's
    /// timeout.
    async fn evaluate_with_budget(
        stats: &EngineStats,
        point: &Arc<dyn CheckingPoint>,
        item: &MonitoringData,
    ) -> CheckResult {
        let spec = point.spec();
        let mut result = None;
        for _attempt in 0..=spec.max_retries {
            stats.evaluations.fetch_add(1, Ordering::Relaxed);
            let started = Instant::now();
            let outcome = match timeout(spec.timeout, point.evaluate(item)).await {
                Ok(result) => result,
                Err(_) => CheckResult::error(
                    &spec.name,
                    spec.kind.as_str(),
                    format!("evaluation timed out after {:?}", spec.timeout),
                ),
            }
            .with_duration_ms(started.elapsed().as_millis() as u64);

            let is_error = outcome.outcome == CheckOutcome::Error;
            result = Some(outcome);
            if !is_error {
                break;
            }
        }
        // The loop always assigns at least once.
        result.unwrap_or_else(|| CheckResult::error(&spec.name, spec.kind.as_str(), "not evaluated"))
    }

    /// Process one item through fanout, ordering, and dispatch.
    ///
    /// The item enters pending and leaves with a terminal status and a
    /// stamped `processed_at`.
    pub async fn process_item(&self, mut item: MonitoringData) -> ItemReport {
        // Backpressure: hold a window slot for the item's whole flight.
        let _slot = self.item_window.acquire().await;

        let applicable = self.registry.applicable_for(&item);
        if applicable.is_empty() {
            debug!(item = %item.id(), "no applicable checking points");
            let _ = item.mark_processed(ProcessingStatus::Skipped);
            self.stats.items_processed.fetch_add(1, Ordering::Relaxed);
            return ItemReport {
                item,
                results: Vec::new(),
                actions_executed: Vec::new(),
                workflow_results: Vec::new(),
                workflows_spawned: 0,
            };
        }

        if item.status == ProcessingStatus::Pending {
            let _ = item.advance(ProcessingStatus::Processing);
        }

        // Fanout: evaluate in parallel under the global semaphore, then
        // reassemble in priority order (applicable is already sorted).
        let shared = Arc::new(item.clone());
        let evaluations = applicable.iter().map(|point| {
            let point = Arc::clone(point);
            let item = Arc::clone(&shared);
            let semaphore = Arc::clone(&self.eval_semaphore);
            let stats = Arc::clone(&self.stats);
            async move {
                let _permit = semaphore.acquire().await;
                Self::evaluate_with_budget(&stats, &point, &item).await
            }
        });
        let ordered: Vec<CheckResult> = join_all(evaluations).await;

        // Stop-on-match cut: results after a matching stop_on_match point
        // are omitted entirely.
        let mut kept: Vec<CheckResult> = Vec::new();
        for (point, result) in applicable.iter().zip(ordered) {
            let stops = point.spec().stop_on_match && result.outcome == CheckOutcome::Match;
            kept.push(result);
            if stops {
                debug!(item = %item.id(), point = %point.spec().name, "stop-on-match cut");
                break;
            }
        }

        // Dispatch phase.
        let mut actions_executed = Vec::new();
        let mut proposals: Vec<AiAction> = Vec::new();
        for (point, result) in applicable.iter().zip(kept.iter()) {
            if result.outcome == CheckOutcome::Error {
                if let Some(message) = &result.error_message {
                    item.add_error(format!("{}: {}", result.cp_name, message));
                }
                continue;
            }
            if !result.should_act {
                continue;
            }
            let actions = point.immediate_actions(&item, result);
            let report = self.dispatcher.dispatch(&result.cp_name, &item, &actions).await;
            for (name, error) in &report.failures {
                item.add_error(format!("action {name} failed: {error}"));
            }
            actions_executed.extend(report.executed);
            proposals.extend(point.after_process(&item, result));
        }

        // Enqueue AI proposals.
        let mut workflow_results = Vec::new();
        let mut workflows_spawned = 0usize;
        if self.config.await_workflows {
            for proposal in proposals {
                let result = self.run_proposal(proposal).await;
                workflow_results.push(result);
            }
        } else {
            workflows_spawned = proposals.len();
            for proposal in proposals {
                let runner = Arc::clone(&self.runner);
                tokio::spawn(async move {
                    run_when_scheduled(&runner, proposal).await;
                });
            }
        }

        // Terminal status.
        let failed = !item.errors.is_empty();
        let terminal = if failed {
            ProcessingStatus::Failed
        } else {
            ProcessingStatus::Completed
        };
        if !item.status.is_terminal() {
            let _ = item.mark_processed(terminal);
        }
        self.stats.items_processed.fetch_add(1, Ordering::Relaxed);
        if failed {
            self.stats.items_failed.fetch_add(1, Ordering::Relaxed);
        }

        ItemReport {
            item,
            results: kept,
            actions_executed,
            workflow_results,
            workflows_spawned,
        }
    }

    async fn run_proposal(&self, proposal: AiAction) -> WorkflowResult {
        run_when_scheduled(&self.runner, proposal).await
    }

    /// One polling cycle: fetch from every due point, then process every
    /// fetched item.
    pub async fn run_cycle(&self, params: &FetchParams) -> CycleReport {
        let mut report = CycleReport::default();
        let points = self.registry.all();

        // Parallel polls across distinct points.
        let polls = points
            .iter()
            .filter(|p| p.spec().enabled && self.poll_due(p))
            .map(|point| {
                let point = Arc::clone(point);
                async move {
                    let name = point.spec().name.clone();
                    let outcome = self.poll_point(&point, params).await;
                    (name, outcome)
                }
            });
        let poll_outcomes = join_all(polls).await;

        let mut items = Vec::new();
        for (name, outcome) in poll_outcomes {
            report.points_polled.push(name.clone());
            match outcome {
                Ok(fetched) => items.extend(fetched),
                Err(error) => report.fetch_errors.push((name, error)),
            }
        }

        // Items are independent; process them concurrently. The in-flight
        // window inside process_item bounds memory.
        let processed = join_all(items.into_iter().map(|item| self.process_item(item))).await;
        report.items = processed;

        self.stats.cycles.fetch_add(1, Ordering::Relaxed);
        report
    }

    /// Run cycles until shutdown is requested.
    pub async fn run(&self, params: FetchParams) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        info!("engine started");
        loop {
            if *shutdown_rx.borrow() {
                break;
            }
            let cycle = self.run_cycle(&params).await;
            debug!(
                polled = cycle.points_polled.len(),
                items = cycle.items.len(),
                "cycle finished"
            );
            tokio::select! {
                _ = tokio::time::sleep(self.config.tick_interval) => {}
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }
        info!("engine stopped");
    }

    /// Request cooperative shutdown. In-flight work gets the configured
    /// grace window before the caller should assume it was abandoned.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// The configured grace window for shutdown.
    pub fn shutdown_grace(&self) -> Duration {
        self.config.shutdown_grace
    }
}

/// Honor `scheduled_at` before running a proposal.
async fn run_when_scheduled(runner: &WorkflowRunner, proposal: AiAction) -> WorkflowResult {
    if let Some(at) = proposal.scheduled_at {
        let now = chrono::Utc::now();
        if at > now {
            let wait = (at - now).to_std().unwrap_or(Duration::ZERO);
            debug!(workflow = %proposal.workflow_name, wait_secs = wait.as_secs(), "deferring scheduled proposal");
            tokio::time::sleep(wait).await;
        }
    }
    runner.run(&proposal).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    use opswatch_core::{Action, OpsError, OpsResult, Payload, WorkflowState};

    use crate::dispatch::RecordingSink;
    use crate::point::{PointKind, PointSpec};
    use crate::workflow::tests_support::instant_runner;

    /// Point with scripted fetch items and a fixed evaluation verdict.
    struct ScriptedPoint {
        spec: PointSpec,
        items: SyncMutex<Vec<MonitoringData>>,
        verdict: Verdict,
        evaluations: AtomicUsize,
        fetch_failures_left: AtomicUsize,
    }

    #[derive(Clone, Copy)]
    enum Verdict {
        Match(f64),
        NoMatch,
        Error,
        SlowMatch,
    }

    impl ScriptedPoint {
        fn new(name: &str, priority: u8, verdict: Verdict) -> Self {
            Self::with_retries(name, priority, verdict, 0)
        }

        fn with_retries(name: &str, priority: u8, verdict: Verdict, max_retries: u32) -> Self {
            let mut spec = PointSpec::new(name, PointKind::CustomCp);
            spec.priority = priority;
            spec.max_retries = max_retries;
            Self {
                spec,
                items: SyncMutex::new(Vec::new()),
                verdict,
                evaluations: AtomicUsize::new(0),
                fetch_failures_left: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl crate::point::CheckingPoint for ScriptedPoint {
        fn spec(&self) -> &PointSpec {
            &self.spec
        }

        async fn fetch(&self, _params: &FetchParams) -> OpsResult<Vec<MonitoringData>> {
            if self.fetch_failures_left.load(Ordering::SeqCst) > 0 {
                self.fetch_failures_left.fetch_sub(1, Ordering::SeqCst);
                return Err(OpsError::timeout("source slow"));
            }
            Ok(std::mem::take(&mut *self.items.lock()))
        }

        async fn evaluate(&self, data: &MonitoringData) -> CheckResult {
            self.evaluations.fetch_add(1, Ordering::SeqCst);
            match self.verdict {
                Verdict::Match(confidence) => {
                    CheckResult::matched(&self.spec.name, "custom_cp", confidence, "matched").unwrap()
                }
                Verdict::NoMatch => {
                    CheckResult::no_match(&self.spec.name, "custom_cp", 1.0, "no").unwrap()
                }
                Verdict::Error => CheckResult::error(&self.spec.name, "custom_cp", "boom"),
                Verdict::SlowMatch => {
                    tokio::time::sleep(Duration::from_millis(30)).await;
                    CheckResult::matched(&self.spec.name, "custom_cp", 0.9, format!("slow {}", data.id()))
                        .unwrap()
                }
            }
        }

        fn immediate_actions(&self, _data: &MonitoringData, result: &CheckResult) -> Vec<Action> {
            if result.should_act {
                vec![Action::new("notification", format!("notify_{}", self.spec.name))]
            } else {
                Vec::new()
            }
        }
    }

    fn item(id: &str) -> MonitoringData {
        MonitoringData::new(id, "custom", Payload::Custom(Value::Null)).unwrap()
    }

    fn engine_with(points: Vec<Arc<dyn crate::point::CheckingPoint>>) -> (Arc<Engine>, Arc<RecordingSink>) {
        let registry = Arc::new(Registry::new());
        for point in points {
            registry.register(point).unwrap();
        }
        let sink = Arc::new(RecordingSink::default());
        let dispatcher = Arc::new(ActionDispatcher::new(
            Arc::clone(&sink) as Arc<dyn crate::dispatch::ActionSink>
        ));
        let engine = Engine::new(registry, dispatcher, instant_runner(), EngineConfig::default());
        (engine, sink)
    }

    #[tokio::test]
    async fn item_with_no_applicable_points_is_skipped() {
        let (engine, _sink) = engine_with(vec![]);
        let report = engine.process_item(item("i1")).await;
        assert_eq!(report.item.status, ProcessingStatus::Skipped);
        assert!(report.item.processed_at.is_some());
        assert!(report.results.is_empty());
    }

    #[tokio::test]
    async fn results_arrive_in_priority_order() {
        let slow_high = Arc::new(ScriptedPoint::new("high", 9, Verdict::SlowMatch));
        let fast_low = Arc::new(ScriptedPoint::new("low", 2, Verdict::NoMatch));
        // Register low first: ordering must come from priority, not
        // insertion or finish time.
        let (engine, _sink) = engine_with(vec![fast_low, slow_high]);

        let report = engine.process_item(item("i1")).await;
        let names: Vec<&str> = report.results.iter().map(|r| r.cp_name.as_str()).collect();
        assert_eq!(names, vec!["high", "low"]);
        assert_eq!(report.item.status, ProcessingStatus::Completed);
    }

    #[tokio::test]
    async fn stop_on_match_cuts_lower_priorities() {
        let mut high_spec = PointSpec::new("high", PointKind::CustomCp);
        high_spec.priority = 9;
        high_spec.stop_on_match = true;
        high_spec.max_retries = 0;
        let high = Arc::new(ScriptedPoint {
            spec: high_spec,
            items: SyncMutex::new(Vec::new()),
            verdict: Verdict::Match(0.95),
            evaluations: AtomicUsize::new(0),
            fetch_failures_left: AtomicUsize::new(0),
        });
        let low = Arc::new(ScriptedPoint::new("low", 3, Verdict::Match(0.9)));

        let (engine, sink) = engine_with(vec![high.clone(), low.clone()]);
        let report = engine.process_item(item("i1")).await;

        // Exactly one result dispatched, from the high-priority point.
        assert_eq!(report.results.len(), 1);
        assert_eq!(report.results[0].cp_name, "high");
        assert_eq!(report.actions_executed, vec!["notify_high"]);
        assert_eq!(sink.records().len(), 1);
    }

    #[tokio::test]
    async fn evaluation_errors_fail_the_item() {
        let bad = Arc::new(ScriptedPoint::new("bad", 5, Verdict::Error));
        let (engine, _sink) = engine_with(vec![bad]);

        let report = engine.process_item(item("i1")).await;
        assert_eq!(report.item.status, ProcessingStatus::Failed);
        assert!(!report.item.errors.is_empty());
        assert!(report.item.processed_at.is_some());
        assert_eq!(engine.stats().items_failed.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn evaluation_timeout_becomes_an_error_result() {
        struct HangingPoint {
            spec: PointSpec,
        }
        #[async_trait]
        impl crate::point::CheckingPoint for HangingPoint {
            fn spec(&self) -> &PointSpec {
                &self.spec
            }
            async fn fetch(&self, _params: &FetchParams) -> OpsResult<Vec<MonitoringData>> {
                Ok(Vec::new())
            }
            async fn evaluate(&self, _data: &MonitoringData) -> CheckResult {
                futures::future::pending().await
            }
        }

        let mut spec = PointSpec::new("hang", PointKind::CustomCp);
        spec.timeout = Duration::from_millis(20);
        spec.max_retries = 0;
        let (engine, _sink) = engine_with(vec![Arc::new(HangingPoint { spec })]);

        let report = engine.process_item(item("i1")).await;
        assert_eq!(report.results[0].outcome, CheckOutcome::Error);
        assert!(report.results[0]
            .error_message
            .as_deref()
            .unwrap()
            .contains("timed out"));
        assert_eq!(report.item.status, ProcessingStatus::Failed);
    }

    #[tokio::test]
    async fn transient_evaluation_errors_are_retried_within_budget() {
        struct FlakyPoint {
            spec: PointSpec,
            failures_left: AtomicUsize,
        }
        #[async_trait]
        impl crate::point::CheckingPoint for FlakyPoint {
            fn spec(&self) -> &PointSpec {
                &self.spec
            }
            async fn fetch(&self, _params: &FetchParams) -> OpsResult<Vec<MonitoringData>> {
                Ok(Vec::new())
            }
            async fn evaluate(&self, _data: &MonitoringData) -> CheckResult {
                if self.failures_left.load(Ordering::SeqCst) > 0 {
                    self.failures_left.fetch_sub(1, Ordering::SeqCst);
                    return CheckResult::error(&self.spec.name, "custom_cp", "dependency flapped");
                }
                CheckResult::no_match(&self.spec.name, "custom_cp", 1.0, "fine").unwrap()
            }
        }

        let mut spec = PointSpec::new("flaky", PointKind::CustomCp);
        spec.max_retries = 2;
        let (engine, _sink) = engine_with(vec![Arc::new(FlakyPoint {
            spec,
            failures_left: AtomicUsize::new(2),
        })]);

        let report = engine.process_item(item("i1")).await;
        assert_eq!(report.results[0].outcome, CheckOutcome::NoMatch);
        assert_eq!(report.item.status, ProcessingStatus::Completed);
        // 2 failed attempts + 1 success.
        assert_eq!(engine.stats().evaluations.load(Ordering::Relaxed), 3);
    }

    #[tokio::test]
    async fn cycle_polls_fetches_and_processes() {
        let point = Arc::new(ScriptedPoint::new("src", 5, Verdict::Match(0.9)));
        point.items.lock().extend([item("a"), item("b")]);
        let (engine, _sink) = engine_with(vec![point.clone()]);

        let report = engine.run_cycle(&FetchParams::default()).await;
        assert_eq!(report.points_polled, vec!["src"]);
        assert!(report.fetch_errors.is_empty());
        assert_eq!(report.items.len(), 2);
        for item_report in &report.items {
            assert_eq!(item_report.item.status, ProcessingStatus::Completed);
        }
        assert_eq!(engine.stats().cycles.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn fetch_failures_are_reported_not_fatal() {
        let point = Arc::new(ScriptedPoint::new("src", 5, Verdict::NoMatch));
        point.fetch_failures_left.store(5, Ordering::SeqCst);
        let (engine, _sink) = engine_with(vec![point.clone()]);

        let report = engine.run_cycle(&FetchParams::default()).await;
        assert_eq!(report.fetch_errors.len(), 1);
        assert!(report.fetch_errors[0].1.contains("source slow"));
        // The point stays registered and enabled.
        assert!(engine.registry().get("src").is_some());
    }

    #[tokio::test]
    async fn fetch_retry_budget_recovers_transient_failures() {
        let point = Arc::new(ScriptedPoint::with_retries("src", 5, Verdict::NoMatch, 2));
        point.fetch_failures_left.store(2, Ordering::SeqCst);
        point.items.lock().push(item("a"));
        let (engine, _sink) = engine_with(vec![point.clone()]);

        let report = engine.run_cycle(&FetchParams::default()).await;
        assert!(report.fetch_errors.is_empty());
        assert_eq!(report.items.len(), 1);
    }

    #[tokio::test]
    async fn proposals_run_to_terminal_state_when_awaited() {
        struct ProposingPoint {
            spec: PointSpec,
        }
        #[async_trait]
        impl crate::point::CheckingPoint for ProposingPoint {
            fn spec(&self) -> &PointSpec {
                &self.spec
            }
            async fn fetch(&self, _params: &FetchParams) -> OpsResult<Vec<MonitoringData>> {
                Ok(Vec::new())
            }
            async fn evaluate(&self, _data: &MonitoringData) -> CheckResult {
                CheckResult::matched(&self.spec.name, "custom_cp", 0.9, "go").unwrap()
            }
        }

        let mut spec = PointSpec::new("proposer", PointKind::CustomCp);
        spec.ai_workflow_enabled = true;
        spec.prompt_template_id = Some("custom_triage".into());
        let (engine, _sink) = engine_with(vec![Arc::new(ProposingPoint { spec })]);

        let report = engine.process_item(item("i1")).await;
        assert_eq!(report.workflow_results.len(), 1);
        assert!(report.workflow_results[0].final_state.is_terminal());
        assert_eq!(report.workflow_results[0].final_state, WorkflowState::Completed);
        assert_eq!(report.item.status, ProcessingStatus::Completed);
    }

    #[tokio::test]
    async fn shutdown_stops_the_run_loop() {
        let (engine, _sink) = engine_with(vec![]);
        let run = tokio::spawn({
            let engine = Arc::clone(&engine);
            async move { engine.run(FetchParams::default()).await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        engine.shutdown();
        timeout(Duration::from_secs(2), run).await.unwrap().unwrap();
    }
}
