//! Closure-backed custom checking point.

use std::sync::Arc;

use async_trait::async_trait;

use opswatch_core::{Action, CheckResult, MonitoringData, MonitoringKind, OpsResult};

use crate::point::{CheckingPoint, FetchParams, PointKind, PointSpec};
use crate::points::SourceFeed;

type EvaluateFn = dyn Fn(&MonitoringData) -> CheckResult + Send + Sync;
type ActionsFn = dyn Fn(&MonitoringData, &CheckResult) -> Vec<Action> + Send + Sync;

/// A checking point whose decision logic is supplied as closures.
/// Accepts every monitoring-data kind.
pub struct CustomPoint {
    spec: PointSpec,
    feed: Arc<dyn SourceFeed>,
    evaluate_fn: Arc<EvaluateFn>,
    actions_fn: Option<Arc<ActionsFn>>,
}

impl CustomPoint {
    /// Create a custom point from a name, feed, and decision closure.
    pub fn new(
        name: impl Into<String>,
        feed: Arc<dyn SourceFeed>,
        evaluate_fn: impl Fn(&MonitoringData) -> CheckResult + Send + Sync + 'static,
    ) -> Self {
        Self {
            spec: PointSpec::new(name, PointKind::CustomCp),
            feed,
            evaluate_fn: Arc::new(evaluate_fn),
            actions_fn: None,
        }
    }

    /// Attach an immediate-actions closure.
    pub fn with_actions(
        mut self,
        actions_fn: impl Fn(&MonitoringData, &CheckResult) -> Vec<Action> + Send + Sync + 'static,
    ) -> Self {
        self.actions_fn = Some(Arc::new(actions_fn));
        self
    }

    /// Override the spec.
    pub fn with_spec(mut self, spec: PointSpec) -> Self {
        self.spec = spec;
        self
    }
}

#[async_trait]
impl CheckingPoint for CustomPoint {
    fn spec(&self) -> &PointSpec {
        &self.spec
    }

    fn accepts(&self, _kind: MonitoringKind) -> bool {
        true
    }

    async fn fetch(&self, params: &FetchParams) -> OpsResult<Vec<MonitoringData>> {
        self.feed.pull(params).await
    }

    async fn evaluate(&self, data: &MonitoringData) -> CheckResult {
        (self.evaluate_fn)(data)
    }

    fn immediate_actions(&self, data: &MonitoringData, result: &CheckResult) -> Vec<Action> {
        match &self.actions_fn {
            Some(actions_fn) => actions_fn(data, result),
            None => Vec::new(),
        }
    }
}
