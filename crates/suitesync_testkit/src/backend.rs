//! An in-memory stand-in for the reporting server.
//!
//! [`MemoryBackend`] answers snapshot reads from its own tables and pushes
//! change frames to every open feed connection when a test mutates it.
//! Mutations can also be made silently, to model frames lost while a client
//! was disconnected.

use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use suitesync_engine::{
    ChangeFeed, ChildQuery, FeedConnection, SnapshotSource, SyncError, SyncResult,
};
use suitesync_protocol::{
    ApiErrorKind, Change, Collection, FeedMessage, InsertChange, JsonValue, Owner, SnapshotPage,
    UpdateChange, SUITE_AGGS_ID,
};
use tokio::sync::mpsc;

const FEED_CAPACITY: usize = 1024;

#[derive(Default)]
struct Tables {
    rows: HashMap<Collection, BTreeMap<String, JsonValue>>,
}

impl Tables {
    fn table(&mut self, collection: Collection) -> &mut BTreeMap<String, JsonValue> {
        self.rows.entry(collection).or_default()
    }

    fn get(&self, collection: Collection, id: &str) -> Option<&JsonValue> {
        self.rows.get(&collection).and_then(|t| t.get(id))
    }

    fn rows(&self, collection: Collection) -> impl Iterator<Item = &JsonValue> {
        self.rows.get(&collection).into_iter().flat_map(|t| t.values())
    }
}

fn field<'a>(doc: &'a JsonValue, name: &str) -> Option<&'a str> {
    doc.get(name).and_then(JsonValue::as_str)
}

/// An in-memory server implementing both the snapshot API and the feed.
///
/// Pages list rows in id order; the cursor is the id of the first row of
/// the next page.
#[derive(Default)]
pub struct MemoryBackend {
    tables: Mutex<Tables>,
    feeds: Mutex<Vec<mpsc::Sender<String>>>,
    fetch_failures: Mutex<VecDeque<SyncError>>,
    connect_failures: Mutex<VecDeque<SyncError>>,
    page_requests: AtomicUsize,
    entity_requests: AtomicUsize,
    listing_requests: AtomicUsize,
    connects: AtomicUsize,
}

impl MemoryBackend {
    /// Creates an empty backend.
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a document without notifying the feed.
    pub fn seed(&self, collection: Collection, doc: JsonValue) {
        let id = field(&doc, "id").unwrap_or(SUITE_AGGS_ID).to_string();
        self.tables.lock().table(collection).insert(id, doc);
    }

    /// Stores a document and broadcasts an insert frame.
    pub fn insert(&self, collection: Collection, doc: JsonValue) {
        self.seed(collection, doc.clone());
        let id = field(&doc, "id").unwrap_or(SUITE_AGGS_ID).to_string();
        let change = Change::Insert(InsertChange::new(collection, id, doc));
        self.broadcast(FeedMessage::Change(change));
    }

    /// Applies an update to the stored document without notifying the feed.
    ///
    /// Returns the update for later delivery with [`MemoryBackend::deliver`].
    pub fn update_silently(&self, update: UpdateChange) -> UpdateChange {
        let mut tables = self.tables.lock();
        let table = tables.table(update.collection);
        if let Some(JsonValue::Object(fields)) = table.get_mut(&update.id) {
            update.apply_fields(fields);
            fields.insert("version".into(), JsonValue::from(update.version));
        }
        update
    }

    /// Applies an update and broadcasts it.
    pub fn update(&self, update: UpdateChange) {
        let update = self.update_silently(update);
        self.deliver(Change::Update(update));
    }

    /// Removes a document without notifying the feed.
    pub fn remove(&self, collection: Collection, id: &str) -> Option<JsonValue> {
        self.tables.lock().table(collection).remove(id)
    }

    /// Returns the stored document.
    pub fn get(&self, collection: Collection, id: &str) -> Option<JsonValue> {
        self.tables.lock().get(collection, id).cloned()
    }

    /// Broadcasts a change frame without touching the tables.
    pub fn deliver(&self, change: Change) {
        self.broadcast(FeedMessage::Change(change));
    }

    /// Broadcasts the caught-up control frame.
    pub fn caught_up(&self) {
        self.broadcast(FeedMessage::CaughtUp);
    }

    /// Broadcasts a raw frame.
    pub fn send_raw(&self, frame: impl Into<String>) {
        let frame = frame.into();
        self.feeds
            .lock()
            .retain(|tx| tx.try_send(frame.clone()).is_ok());
    }

    /// Drops every open feed connection.
    pub fn disconnect_all(&self) {
        self.feeds.lock().clear();
    }

    /// Makes the next snapshot fetch fail with `error`.
    pub fn fail_next_fetch(&self, error: SyncError) {
        self.fetch_failures.lock().push_back(error);
    }

    /// Makes the next feed connect fail with `error`.
    pub fn fail_next_connect(&self, error: SyncError) {
        self.connect_failures.lock().push_back(error);
    }

    /// Number of open feed connections.
    pub fn open_feeds(&self) -> usize {
        let mut feeds = self.feeds.lock();
        feeds.retain(|tx| !tx.is_closed());
        feeds.len()
    }

    /// Page requests served, including failed ones.
    pub fn page_requests(&self) -> usize {
        self.page_requests.load(Ordering::SeqCst)
    }

    /// Single-entity requests served, including failed ones.
    pub fn entity_requests(&self) -> usize {
        self.entity_requests.load(Ordering::SeqCst)
    }

    /// Child listing requests served, including failed ones.
    pub fn listing_requests(&self) -> usize {
        self.listing_requests.load(Ordering::SeqCst)
    }

    /// Feed connection attempts.
    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    fn broadcast(&self, message: FeedMessage) {
        let frame = message.encode().expect("backend frames always encode");
        self.send_raw(frame);
    }

    fn take_failure(&self) -> SyncResult<()> {
        match self.fetch_failures.lock().pop_front() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl SnapshotSource for MemoryBackend {
    async fn fetch_page(
        &self,
        collection: Collection,
        cursor: Option<&str>,
        limit: u32,
    ) -> SyncResult<SnapshotPage> {
        self.page_requests.fetch_add(1, Ordering::SeqCst);
        self.take_failure()?;

        let tables = self.tables.lock();
        let mut rows = tables
            .rows(collection)
            .filter(|doc| cursor.is_none_or(|c| field(doc, "id").is_some_and(|id| id >= c)));
        let items: Vec<JsonValue> = rows.by_ref().take(limit as usize).cloned().collect();
        let next_id = rows.next().and_then(|doc| field(doc, "id")).map(str::to_string);

        let mut page = SnapshotPage::new(items, next_id);
        if collection == Collection::Suites {
            if let Some(aggs) = tables.get(Collection::SuiteAggs, SUITE_AGGS_ID) {
                page = page.with_aggs(aggs.clone());
            }
        }
        Ok(page)
    }

    async fn fetch_one(&self, collection: Collection, id: &str) -> SyncResult<JsonValue> {
        self.entity_requests.fetch_add(1, Ordering::SeqCst);
        self.take_failure()?;
        self.get(collection, id)
            .ok_or_else(|| {
                SyncError::api(ApiErrorKind::NotFound, format!("fetch {collection}/{id}"))
            })
    }

    async fn fetch_children(&self, query: &ChildQuery) -> SyncResult<Vec<JsonValue>> {
        self.listing_requests.fetch_add(1, Ordering::SeqCst);
        self.take_failure()?;
        let tables = self.tables.lock();
        let rows: Vec<JsonValue> = match query {
            ChildQuery::SuiteCases(suite_id) => tables
                .rows(Collection::Cases)
                .filter(|doc| field(doc, "suite_id") == Some(suite_id.as_str()))
                .cloned()
                .collect(),
            ChildQuery::CaseLogs(case_id) => tables
                .rows(Collection::Logs)
                .filter(|doc| field(doc, "case_id") == Some(case_id.as_str()))
                .cloned()
                .collect(),
            ChildQuery::Attachments(owner) => {
                let (key, id) = match owner {
                    Owner::Suite(id) => ("suite_id", id),
                    Owner::Case(id) => ("case_id", id),
                };
                tables
                    .rows(Collection::Attachments)
                    .filter(|doc| field(doc, key) == Some(id.as_str()))
                    .cloned()
                    .collect()
            }
        };
        Ok(rows)
    }
}

impl ChangeFeed for MemoryBackend {
    async fn connect(&self) -> SyncResult<FeedConnection> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.connect_failures.lock().pop_front() {
            return Err(err);
        }
        let (tx, rx) = mpsc::channel(FEED_CAPACITY);
        self.feeds.lock().push(tx);
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{aggs_doc, case_doc, suite_doc};

    #[tokio::test]
    async fn pages_follow_id_order() {
        let backend = MemoryBackend::new();
        for i in 0..5 {
            backend.seed(Collection::Suites, suite_doc(&format!("s{i}"), i));
        }
        backend.seed(Collection::SuiteAggs, aggs_doc(1, 5, 0));

        let first = backend.fetch_page(Collection::Suites, None, 2).await.unwrap();
        assert_eq!(first.items.len(), 2);
        assert_eq!(first.next_id.as_deref(), Some("s2"));
        assert!(first.aggs.is_some());

        let last = backend.fetch_page(Collection::Suites, Some("s4"), 2).await.unwrap();
        assert_eq!(last.items.len(), 1);
        assert!(last.is_last());
        assert_eq!(backend.page_requests(), 2);
    }

    #[tokio::test]
    async fn mutations_reach_open_feeds() {
        let backend = MemoryBackend::new();
        let mut conn = backend.connect().await.unwrap();

        backend.insert(Collection::Cases, case_doc("c1", "s1", 0));
        backend.update(UpdateChange::new(Collection::Cases, "c1", 2).set("status", "started"));

        let insert = FeedMessage::decode(&conn.recv().await.unwrap()).unwrap();
        assert!(matches!(insert, FeedMessage::Change(Change::Insert(_))));
        let update = FeedMessage::decode(&conn.recv().await.unwrap()).unwrap();
        assert!(matches!(update, FeedMessage::Change(Change::Update(ref u)) if u.version == 2));
        assert_eq!(backend.get(Collection::Cases, "c1").unwrap()["status"], "started");

        backend.disconnect_all();
        assert_eq!(conn.recv().await, None);
    }

    #[tokio::test]
    async fn injected_failures() {
        let backend = MemoryBackend::new();
        backend.fail_next_fetch(SyncError::transport_retryable("reset"));
        assert!(backend.fetch_page(Collection::Suites, None, 1).await.is_err());
        assert!(backend.fetch_page(Collection::Suites, None, 1).await.is_ok());

        let err = backend.fetch_one(Collection::Suites, "nope").await.unwrap_err();
        assert!(err.is_not_found());
    }
}
