//! Aggregate counter store.
//!
//! Holds exactly one versioned record (e.g. running/finished suite counts)
//! under a fixed id. It is its own versioned stream, reconciled with the
//! same rules as entities and never derived from local entity counts.

use crate::reconciler::{InsertOutcome, Reconciler, UpdateOutcome};
use suitesync_protocol::{ProtocolResult, Record, UpdateChange};

/// A single versioned aggregate record.
#[derive(Debug, Clone)]
pub struct AggregateStore<T: Record> {
    id: &'static str,
    inner: Reconciler<T>,
}

impl<T: Record> AggregateStore<T> {
    /// Creates an empty store for the record with the given well-known id.
    pub fn new(id: &'static str) -> Self {
        Self {
            id,
            inner: Reconciler::new(),
        }
    }

    /// Returns the well-known id.
    pub fn id(&self) -> &'static str {
        self.id
    }

    /// Applies a full snapshot of the counters.
    ///
    /// The record must already carry the well-known id.
    pub fn apply_snapshot(&mut self, record: T) -> InsertOutcome {
        debug_assert_eq!(record.id(), self.id);
        self.inner.apply_insert(record)
    }

    /// Applies a counter delta, whatever id it was addressed to.
    pub fn apply_update(&mut self, mut update: UpdateChange) -> ProtocolResult<UpdateOutcome> {
        update.id = self.id.to_string();
        self.inner.apply_update(update)
    }

    /// Returns the current record.
    pub fn get(&self) -> Option<&T> {
        self.inner.store().get(self.id)
    }

    /// Returns true if a delta is waiting for the first snapshot.
    pub fn has_pending(&self) -> bool {
        self.inner.pending_len() > 0
    }

    /// Discards a delta waiting for the first snapshot.
    pub fn drop_pending(&mut self) -> Option<UpdateChange> {
        self.inner.drop_pending(self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use suitesync_protocol::{Collection, SuiteAggs, SUITE_AGGS_ID};

    fn aggs(version: u64, running: u64, finished: u64) -> SuiteAggs {
        SuiteAggs::from_json(json!({"version": version, "running": running, "finished": finished}))
            .unwrap()
    }

    fn delta(version: u64) -> UpdateChange {
        UpdateChange::new(Collection::SuiteAggs, "whatever", version)
    }

    #[test]
    fn delta_before_snapshot_is_held() {
        let mut store = AggregateStore::new(SUITE_AGGS_ID);
        let outcome = store.apply_update(delta(3).set("running", 4)).unwrap();
        assert_eq!(outcome, UpdateOutcome::Queued);
        assert!(store.has_pending());
        assert!(store.get().is_none());

        store.apply_snapshot(aggs(2, 1, 10));
        let current = store.get().unwrap();
        assert_eq!(current.version, 3);
        assert_eq!(current.running, 4);
        assert_eq!(current.finished, 10);
        assert!(!store.has_pending());
    }

    #[test]
    fn snapshot_after_delta_is_stale() {
        let mut store = AggregateStore::new(SUITE_AGGS_ID);
        store.apply_snapshot(aggs(1, 1, 1));
        store.apply_update(delta(2).set("finished", 2)).unwrap();

        assert_eq!(store.apply_snapshot(aggs(2, 1, 1)), InsertOutcome::Stale);
        assert_eq!(store.get().unwrap().finished, 2);
    }

    #[test]
    fn drop_pending_delta() {
        let mut store: AggregateStore<SuiteAggs> = AggregateStore::new(SUITE_AGGS_ID);
        store.apply_update(delta(2)).unwrap();
        assert!(store.drop_pending().is_some());
        assert!(!store.has_pending());
    }
}
