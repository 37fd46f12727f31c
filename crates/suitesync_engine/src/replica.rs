//! The client-side replica of every synchronized collection.
//!
//! Snapshot rows, live changes and self-heal fetches all land here, so every
//! reader sees one version per id no matter which path delivered it.

use crate::aggregate::AggregateStore;
use crate::error::SyncResult;
use crate::reconciler::{InsertOutcome, Reconciler, UpdateOutcome};
use suitesync_protocol::{
    Attachment, Case, Change, Collection, JsonValue, LogLine, Owner, Record, SnapshotPage, Suite,
    SuiteAggs, UpdateChange, SUITE_AGGS_ID,
};
use tracing::{debug, warn};

/// What applying one change did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeOutcome {
    /// The store changed.
    Applied,
    /// The held version was the same or newer.
    Stale,
    /// The target is unknown; the update was buffered.
    Queued,
}

impl From<InsertOutcome> for ChangeOutcome {
    fn from(outcome: InsertOutcome) -> Self {
        match outcome {
            InsertOutcome::Inserted { .. } => ChangeOutcome::Applied,
            InsertOutcome::Stale => ChangeOutcome::Stale,
        }
    }
}

impl From<UpdateOutcome> for ChangeOutcome {
    fn from(outcome: UpdateOutcome) -> Self {
        match outcome {
            UpdateOutcome::Applied => ChangeOutcome::Applied,
            UpdateOutcome::Stale => ChangeOutcome::Stale,
            UpdateOutcome::Queued => ChangeOutcome::Queued,
        }
    }
}

/// Counts from applying one snapshot page.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PageSummary {
    /// Rows that changed the store.
    pub applied: usize,
    /// Rows the store already held at the same or a newer version.
    pub stale: usize,
    /// Rows that could not be decoded.
    pub rejected: usize,
}

impl PageSummary {
    fn record(&mut self, result: SyncResult<ChangeOutcome>) {
        match result {
            Ok(ChangeOutcome::Applied) => self.applied += 1,
            Ok(_) => self.stale += 1,
            Err(_) => self.rejected += 1,
        }
    }
}

fn insert_into<T: Record>(rec: &mut Reconciler<T>, doc: JsonValue) -> SyncResult<ChangeOutcome> {
    let entity = T::from_json(doc)?;
    Ok(rec.apply_insert(entity).into())
}

/// Every collection's store, the pending queues and the aggregates.
#[derive(Debug, Clone)]
pub struct Replica {
    suites: Reconciler<Suite>,
    cases: Reconciler<Case>,
    logs: Reconciler<LogLine>,
    attachments: Reconciler<Attachment>,
    aggs: AggregateStore<SuiteAggs>,
}

impl Replica {
    /// Creates an empty replica.
    pub fn new() -> Self {
        Self {
            suites: Reconciler::new(),
            cases: Reconciler::new(),
            logs: Reconciler::new(),
            attachments: Reconciler::new(),
            aggs: AggregateStore::new(SUITE_AGGS_ID),
        }
    }

    /// Applies one live change.
    pub fn apply_change(&mut self, change: Change) -> SyncResult<ChangeOutcome> {
        match change {
            Change::Insert(insert) => self.insert_value(insert.collection, insert.doc),
            Change::Update(update) => self.apply_update(update),
        }
    }

    /// Applies a partial update to the collection it names.
    pub fn apply_update(&mut self, update: UpdateChange) -> SyncResult<ChangeOutcome> {
        let outcome = match update.collection {
            Collection::Suites => self.suites.apply_update(update)?,
            Collection::Cases => self.cases.apply_update(update)?,
            Collection::Logs => self.logs.apply_update(update)?,
            Collection::Attachments => self.attachments.apply_update(update)?,
            Collection::SuiteAggs => self.aggs.apply_update(update)?,
        };
        Ok(outcome.into())
    }

    /// Inserts a full document into `collection`.
    ///
    /// Aggregate documents are stored under the well-known id whatever id
    /// they carry.
    pub fn insert_value(
        &mut self,
        collection: Collection,
        doc: JsonValue,
    ) -> SyncResult<ChangeOutcome> {
        match collection {
            Collection::Suites => insert_into(&mut self.suites, doc),
            Collection::Cases => insert_into(&mut self.cases, doc),
            Collection::Logs => insert_into(&mut self.logs, doc),
            Collection::Attachments => insert_into(&mut self.attachments, doc),
            Collection::SuiteAggs => {
                let mut doc = doc;
                if let JsonValue::Object(fields) = &mut doc {
                    fields.insert("id".into(), JsonValue::from(SUITE_AGGS_ID));
                }
                let record = SuiteAggs::from_json(doc)?;
                Ok(self.aggs.apply_snapshot(record).into())
            }
        }
    }

    /// Inserts every row of a snapshot page and its aggregates.
    ///
    /// A row that cannot be decoded is logged and skipped; the rest of the
    /// page still applies.
    pub fn apply_page(&mut self, collection: Collection, page: SnapshotPage) -> PageSummary {
        let mut summary = PageSummary::default();
        for row in page.items {
            let result = self.insert_value(collection, row);
            if let Err(err) = &result {
                warn!(collection = %collection, error = %err, "dropping undecodable snapshot row");
            }
            summary.record(result);
        }
        if let Some(aggs) = page.aggs {
            self.apply_aggs(aggs, &mut summary);
        }
        debug!(collection = %collection, applied = summary.applied, stale = summary.stale,
            rejected = summary.rejected, "snapshot page applied");
        summary
    }

    /// Inserts child rows from a listing.
    pub fn apply_listing(&mut self, collection: Collection, rows: Vec<JsonValue>) -> PageSummary {
        self.apply_page(collection, SnapshotPage::new(rows, None))
    }

    /// Applies only the aggregates of a snapshot page.
    pub fn apply_page_aggs(&mut self, page: SnapshotPage) -> PageSummary {
        let mut summary = PageSummary::default();
        if let Some(aggs) = page.aggs {
            self.apply_aggs(aggs, &mut summary);
        }
        summary
    }

    fn apply_aggs(&mut self, aggs: JsonValue, summary: &mut PageSummary) {
        let result = self.insert_value(Collection::SuiteAggs, aggs);
        if let Err(err) = &result {
            warn!(error = %err, "dropping undecodable aggregates");
        }
        summary.record(result);
    }

    /// Returns true if `collection` holds `id`.
    pub fn contains(&self, collection: Collection, id: &str) -> bool {
        match collection {
            Collection::Suites => self.suites.store().contains(id),
            Collection::Cases => self.cases.store().contains(id),
            Collection::Logs => self.logs.store().contains(id),
            Collection::Attachments => self.attachments.store().contains(id),
            Collection::SuiteAggs => self.aggs.get().is_some(),
        }
    }

    /// Returns the number of buffered updates for `collection`.
    pub fn pending_len(&self, collection: Collection) -> usize {
        match collection {
            Collection::Suites => self.suites.pending_len(),
            Collection::Cases => self.cases.pending_len(),
            Collection::Logs => self.logs.pending_len(),
            Collection::Attachments => self.attachments.pending_len(),
            Collection::SuiteAggs => usize::from(self.aggs.has_pending()),
        }
    }

    /// Returns the ids with buffered updates in `collection`, sorted.
    pub fn pending_ids(&self, collection: Collection) -> Vec<String> {
        match collection {
            Collection::Suites => self.suites.pending_ids(),
            Collection::Cases => self.cases.pending_ids(),
            Collection::Logs => self.logs.pending_ids(),
            Collection::Attachments => self.attachments.pending_ids(),
            Collection::SuiteAggs if self.aggs.has_pending() => vec![SUITE_AGGS_ID.to_string()],
            Collection::SuiteAggs => Vec::new(),
        }
    }

    /// Returns the number of buffered updates across all collections.
    pub fn total_pending(&self) -> usize {
        Collection::ALL.iter().map(|c| self.pending_len(*c)).sum()
    }

    /// Discards the buffered update for `id`. Returns true if one was held.
    pub fn drop_pending(&mut self, collection: Collection, id: &str) -> bool {
        match collection {
            Collection::Suites => self.suites.drop_pending(id).is_some(),
            Collection::Cases => self.cases.drop_pending(id).is_some(),
            Collection::Logs => self.logs.drop_pending(id).is_some(),
            Collection::Attachments => self.attachments.drop_pending(id).is_some(),
            Collection::SuiteAggs => self.aggs.drop_pending().is_some(),
        }
    }

    /// Purges the log lines and attachments hanging off `owner`.
    ///
    /// Returns how many records were removed.
    pub fn purge(&mut self, owner: &Owner) -> usize {
        let logs = match owner {
            Owner::Case(case_id) => self.logs.retain(|l| &l.case_id != case_id),
            Owner::Suite(_) => 0,
        };
        let attachments = self.attachments.retain(|a| !a.belongs_to(owner));
        debug!(?owner, logs, attachments, "purged child records");
        logs + attachments
    }

    /// Every suite, newest first.
    pub fn suites(&self) -> Vec<Suite> {
        self.suites.store().list_all()
    }

    /// Suites that are not soft-deleted, newest first.
    pub fn active_suites(&self) -> Vec<Suite> {
        self.suites.store().list_active()
    }

    /// One suite.
    pub fn suite(&self, id: &str) -> Option<Suite> {
        self.suites.store().get(id).cloned()
    }

    /// The suite counters.
    pub fn suite_aggs(&self) -> Option<SuiteAggs> {
        self.aggs.get().cloned()
    }

    /// Cases of a suite in `idx` order.
    pub fn cases_for_suite(&self, suite_id: &str) -> Vec<Case> {
        self.cases.store().list_where(|c| c.suite_id == suite_id)
    }

    /// One case.
    pub fn case(&self, id: &str) -> Option<Case> {
        self.cases.store().get(id).cloned()
    }

    /// Log lines of a case in `idx` order.
    pub fn logs_for_case(&self, case_id: &str) -> Vec<LogLine> {
        self.logs.store().list_where(|l| l.case_id == case_id)
    }

    /// Live attachments of a suite or case, oldest first.
    pub fn attachments_for(&self, owner: &Owner) -> Vec<Attachment> {
        self.attachments
            .store()
            .list_where(|a| a.belongs_to(owner) && !a.deleted)
    }
}

impl Default for Replica {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use suitesync_protocol::{FeedMessage, InsertChange};

    fn suite(id: &str, version: u64, started_at: i64) -> JsonValue {
        json!({"id": id, "version": version, "status": "started", "started_at": started_at})
    }

    fn log(id: &str, case_id: &str, idx: u64) -> JsonValue {
        json!({"id": id, "case_id": case_id, "idx": idx, "level": "info",
            "message": "hello", "timestamp": 1})
    }

    fn attachment(id: &str, owner: &str, ts: i64) -> JsonValue {
        json!({"id": id, "version": 1, "case_id": owner, "filename": "out.txt",
            "content_type": "text/plain", "size": 3, "timestamp": ts})
    }

    #[test]
    fn dispatch_by_collection() {
        let mut replica = Replica::new();
        let insert = Change::Insert(InsertChange::new(Collection::Suites, "s1", suite("s1", 1, 10)));
        assert_eq!(replica.apply_change(insert).unwrap(), ChangeOutcome::Applied);

        let update = UpdateChange::new(Collection::Suites, "s1", 2).set("name", "nightly");
        assert_eq!(replica.apply_change(Change::Update(update)).unwrap(), ChangeOutcome::Applied);
        assert_eq!(replica.suite("s1").unwrap().name.as_deref(), Some("nightly"));

        let unknown = UpdateChange::new(Collection::Cases, "c1", 2).set("idx", 3);
        assert_eq!(replica.apply_update(unknown).unwrap(), ChangeOutcome::Queued);
        assert_eq!(replica.pending_ids(Collection::Cases), ["c1"]);
        assert_eq!(replica.total_pending(), 1);
    }

    #[test]
    fn aggregate_ids_are_normalized() {
        let mut replica = Replica::new();
        let frame = r#"{"coll":"suite_aggs","id":"counts","update":{"version":4,"running":2}}"#;
        let FeedMessage::Change(change) = FeedMessage::decode(frame).unwrap() else {
            panic!("expected a change");
        };
        assert_eq!(replica.apply_change(change).unwrap(), ChangeOutcome::Queued);
        assert_eq!(replica.pending_ids(Collection::SuiteAggs), [SUITE_AGGS_ID]);

        let page = SnapshotPage::new(vec![], None)
            .with_aggs(json!({"id": "other", "version": 3, "running": 1, "finished": 9}));
        let summary = replica.apply_page(Collection::Suites, page);
        assert_eq!(summary.applied, 1);

        let aggs = replica.suite_aggs().unwrap();
        assert_eq!(aggs.id, SUITE_AGGS_ID);
        assert_eq!((aggs.version, aggs.running, aggs.finished), (4, 2, 9));
        assert_eq!(replica.total_pending(), 0);
    }

    #[test]
    fn page_with_bad_row_applies_the_rest() {
        let mut replica = Replica::new();
        let page = SnapshotPage::new(
            vec![suite("a", 1, 1), json!({"id": "b", "version": 1}), suite("c", 1, 3)],
            Some("d".into()),
        );
        let summary = replica.apply_page(Collection::Suites, page);
        assert_eq!(summary, PageSummary { applied: 2, stale: 0, rejected: 1 });

        let ids: Vec<String> = replica.suites().into_iter().map(|s| s.id).collect();
        assert_eq!(ids, ["c", "a"]);
    }

    #[test]
    fn soft_deleted_suites_leave_active_listing() {
        let mut replica = Replica::new();
        replica.insert_value(Collection::Suites, suite("a", 1, 1)).unwrap();
        replica.insert_value(Collection::Suites, suite("b", 1, 2)).unwrap();
        let delete = UpdateChange::new(Collection::Suites, "b", 2)
            .set("deleted", true)
            .set("deleted_at", 50);
        replica.apply_update(delete).unwrap();

        assert_eq!(replica.suites().len(), 2);
        let active = replica.active_suites();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, "a");
    }

    #[test]
    fn purge_case_children() {
        let mut replica = Replica::new();
        replica.apply_listing(Collection::Logs, vec![log("l2", "c1", 2), log("l1", "c1", 1), log("l3", "c2", 1)]);
        replica.apply_listing(
            Collection::Attachments,
            vec![attachment("a2", "c1", 20), attachment("a1", "c1", 10), attachment("a3", "c2", 5)],
        );

        let ids: Vec<String> = replica.logs_for_case("c1").into_iter().map(|l| l.id).collect();
        assert_eq!(ids, ["l1", "l2"]);
        let owner = Owner::Case("c1".into());
        let ids: Vec<String> = replica.attachments_for(&owner).into_iter().map(|a| a.id).collect();
        assert_eq!(ids, ["a1", "a2"]);

        assert_eq!(replica.purge(&owner), 4);
        assert!(replica.logs_for_case("c1").is_empty());
        assert_eq!(replica.logs_for_case("c2").len(), 1);
        assert_eq!(replica.attachments_for(&Owner::Case("c2".into())).len(), 1);
    }

    #[test]
    fn drop_pending_per_collection() {
        let mut replica = Replica::new();
        replica
            .apply_update(UpdateChange::new(Collection::Logs, "l1", 1))
            .unwrap();
        assert!(!replica.contains(Collection::Logs, "l1"));
        assert!(replica.drop_pending(Collection::Logs, "l1"));
        assert!(!replica.drop_pending(Collection::Logs, "l1"));
        assert_eq!(replica.total_pending(), 0);
    }
}
