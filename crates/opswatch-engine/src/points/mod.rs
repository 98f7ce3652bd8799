//! Built-in checking-point families.
//!
//! Families are composition helpers around [`crate::point::PointSpec`]; the
//! external systems they watch sit behind the [`SourceFeed`] seam so the
//! engine (and its tests) can run against fixture data.

mod clickup;
mod custom;
mod email;
mod slack;

pub use clickup::{OverdueTaskPoint, UrgentTaskConfig, UrgentTaskPoint};
pub use custom::CustomPoint;
pub use email::{EmailAlertConfig, EmailAlertPoint};
pub use slack::{BotMentionConfig, BotMentionPoint};

use async_trait::async_trait;
use parking_lot::Mutex as SyncMutex;

use opswatch_core::{MonitoringData, MonitoringKind, OpsResult};

use crate::point::FetchParams;

/// Source of monitoring data for a checking point's `fetch`.
#[async_trait]
pub trait SourceFeed: Send + Sync {
    /// Pull a batch of observations. Must be idempotent on empty sources.
    async fn pull(&self, params: &FetchParams) -> OpsResult<Vec<MonitoringData>>;
}

/// Feed backed by an in-memory queue. Each `pull` drains the queue.
#[derive(Default)]
pub struct StaticFeed {
    items: SyncMutex<Vec<MonitoringData>>,
}

impl StaticFeed {
    /// Empty feed.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue items for the next pull.
    pub fn push(&self, items: impl IntoIterator<Item = MonitoringData>) {
        self.items.lock().extend(items);
    }
}

#[async_trait]
impl SourceFeed for StaticFeed {
    async fn pull(&self, params: &FetchParams) -> OpsResult<Vec<MonitoringData>> {
        let mut items = std::mem::take(&mut *self.items.lock());
        if let Some(limit) = params.limit {
            items.truncate(limit);
        }
        Ok(items)
    }
}

/// Keep only items of one kind; fetch contracts are per-family.
pub(crate) fn filter_kind(items: Vec<MonitoringData>, kind: MonitoringKind) -> Vec<MonitoringData> {
    items.into_iter().filter(|i| i.kind == kind).collect()
}
