//! Immutable model snapshots shared with the scoring workers

use crate::scoring::{MultivariateScorer, ReferenceSet};
use parking_lot::RwLock;
use std::sync::Arc;

/// Everything the scorers learn from a run: reference distributions and the
/// fitted (or unavailable) multivariate model.
#[derive(Debug)]
pub struct Snapshot {
    pub references: ReferenceSet,
    pub multivariate: MultivariateScorer,
    /// Windows the snapshot was built from
    pub training_windows: usize,
}

/// Holder of the current snapshot.
///
/// Scoring workers take a cheap `Arc` clone; publishing swaps the pointer
/// without touching snapshots already handed out.
#[derive(Debug, Default)]
pub struct ModelStore {
    current: RwLock<Option<Arc<Snapshot>>>,
}

impl ModelStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&self, snapshot: Snapshot) -> Arc<Snapshot> {
        let snapshot = Arc::new(snapshot);
        *self.current.write() = Some(Arc::clone(&snapshot));
        snapshot
    }

    pub fn current(&self) -> Option<Arc<Snapshot>> {
        self.current.read().clone()
    }

    pub fn clear(&self) {
        *self.current.write() = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IsolationForestConfig;

    fn snapshot(windows: usize) -> Snapshot {
        Snapshot {
            references: ReferenceSet::empty(),
            multivariate: MultivariateScorer::new(Vec::new(), IsolationForestConfig::default()),
            training_windows: windows,
        }
    }

    #[test]
    fn test_publish_replaces_without_invalidating_readers() {
        let store = ModelStore::new();
        assert!(store.current().is_none());

        let first = store.publish(snapshot(10));
        let held = store.current().unwrap();
        store.publish(snapshot(20));

        assert_eq!(held.training_windows, 10);
        assert_eq!(first.training_windows, 10);
        assert_eq!(store.current().unwrap().training_windows, 20);

        store.clear();
        assert!(store.current().is_none());
    }
}
