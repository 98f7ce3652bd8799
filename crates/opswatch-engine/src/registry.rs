//! Checking-point registry.
//!
//! An explicit value constructed at engine init, never a process-wide
//! singleton. Registration is serialized behind a write lock; lookups take
//! the read side and are lock-free with respect to each other.

use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::Value;
use thiserror::Error;
use tracing::{info, warn};

use opswatch_core::MonitoringData;

use crate::point::{CheckingPoint, PointKind};

/// Registry operation errors.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// A point with this name is already registered
    #[error("checking point '{0}' is already registered")]
    Duplicate(String),
    /// No point with this name exists
    #[error("checking point '{0}' is not registered")]
    NotFound(String),
    /// The point's own config validation failed
    #[error("checking point '{name}' has invalid config: {problems:?}")]
    InvalidConfig {
        /// Offending point name
        name: String,
        /// Validation messages
        problems: Vec<String>,
    },
}

#[derive(Default)]
struct RegistryState {
    /// Insertion order is meaningful: it breaks priority ties.
    points: Vec<Arc<dyn CheckingPoint>>,
}

/// Ordered, name-keyed collection of checking points.
#[derive(Default)]
pub struct Registry {
    state: RwLock<RegistryState>,
}

impl Registry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a point after validating its config.
    ///
    /// # Errors
    /// `Duplicate` when the name is taken, `InvalidConfig` when the point's
    /// own validation reports problems.
    pub fn register(&self, point: Arc<dyn CheckingPoint>) -> Result<(), RegistryError> {
        let name = point.spec().name.clone();
        let problems = point.validate_config();
        if !problems.is_empty() {
            warn!(point = %name, ?problems, "rejecting checking point with invalid config");
            return Err(RegistryError::InvalidConfig { name, problems });
        }

        let mut state = self.state.write();
        if state.points.iter().any(|p| p.spec().name == name) {
            return Err(RegistryError::Duplicate(name));
        }
        info!(point = %name, kind = point.spec().kind.as_str(), "registered checking point");
        state.points.push(point);
        Ok(())
    }

    /// Remove a point by name.
    ///
    /// # Errors
    /// `NotFound` when no point has this name.
    pub fn unregister(&self, name: &str) -> Result<(), RegistryError> {
        let mut state = self.state.write();
        let before = state.points.len();
        state.points.retain(|p| p.spec().name != name);
        if state.points.len() == before {
            return Err(RegistryError::NotFound(name.to_string()));
        }
        info!(point = %name, "unregistered checking point");
        Ok(())
    }

    /// Look up a point by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn CheckingPoint>> {
        self.state
            .read()
            .points
            .iter()
            .find(|p| p.spec().name == name)
            .cloned()
    }

    /// All points in insertion order.
    pub fn all(&self) -> Vec<Arc<dyn CheckingPoint>> {
        self.state.read().points.clone()
    }

    /// Points with the given kind tag, in insertion order.
    pub fn by_kind(&self, kind: PointKind) -> Vec<Arc<dyn CheckingPoint>> {
        self.state
            .read()
            .points
            .iter()
            .filter(|p| p.spec().kind == kind)
            .cloned()
            .collect()
    }

    /// Points applicable to an item: enabled, and accepting the item's
    /// kind. Sorted by priority descending, insertion order breaking ties.
    pub fn applicable_for(&self, data: &MonitoringData) -> Vec<Arc<dyn CheckingPoint>> {
        let mut applicable: Vec<Arc<dyn CheckingPoint>> = self
            .state
            .read()
            .points
            .iter()
            .filter(|p| p.spec().enabled && p.accepts(data.kind))
            .cloned()
            .collect();
        // Stable sort keeps insertion order among equal priorities.
        applicable.sort_by(|a, b| b.spec().priority.cmp(&a.spec().priority));
        applicable
    }

    /// Number of registered points.
    pub fn len(&self) -> usize {
        self.state.read().points.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.state.read().points.is_empty()
    }

    /// Per-point snapshot.
    pub fn summary(&self) -> Value {
        let state = self.state.read();
        let points: Vec<Value> = state
            .points
            .iter()
            .map(|p| {
                let spec = p.spec();
                serde_json::json!({
                    "name": spec.name,
                    "kind": spec.kind.as_str(),
                    "enabled": spec.enabled,
                    "priority": spec.priority,
                })
            })
            .collect();
        serde_json::json!({
            "total": points.len(),
            "points": points,
        })
    }

    /// Re-validate every registered point, e.g. at engine start.
    pub fn validate_all(&self) -> Vec<(String, Vec<String>)> {
        self.state
            .read()
            .points
            .iter()
            .map(|p| (p.spec().name.clone(), p.validate_config()))
            .filter(|(_, problems)| !problems.is_empty())
            .collect()
    }
}
