//! Transport layer abstraction for snapshot reads and the change feed.

use crate::error::{SyncError, SyncResult};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use suitesync_protocol::{Collection, JsonValue, Owner, SnapshotPage};
use tokio::sync::mpsc;

/// Capacity of mock feed connections.
const MOCK_FEED_CAPACITY: usize = 64;

/// A live change feed connection: raw frames in arrival order.
///
/// The sender side belongs to the transport. A closed channel means the
/// connection dropped.
pub type FeedConnection = mpsc::Receiver<String>;

/// A child listing request.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ChildQuery {
    /// Cases of a suite.
    SuiteCases(String),
    /// Log lines of a case.
    CaseLogs(String),
    /// Attachments of a suite or case.
    Attachments(Owner),
}

impl ChildQuery {
    /// Returns the collection the listing yields.
    pub fn collection(&self) -> Collection {
        match self {
            ChildQuery::SuiteCases(_) => Collection::Cases,
            ChildQuery::CaseLogs(_) => Collection::Logs,
            ChildQuery::Attachments(_) => Collection::Attachments,
        }
    }
}

/// Read access to the REST API.
///
/// Implementations exist for HTTP (`HttpSource`) and for tests.
pub trait SnapshotSource: Send + Sync + 'static {
    /// Fetches one page of `collection`, starting at `cursor`.
    fn fetch_page(
        &self,
        collection: Collection,
        cursor: Option<&str>,
        limit: u32,
    ) -> impl Future<Output = SyncResult<SnapshotPage>> + Send;

    /// Fetches one entity by id.
    fn fetch_one(
        &self,
        collection: Collection,
        id: &str,
    ) -> impl Future<Output = SyncResult<JsonValue>> + Send;

    /// Fetches a child listing.
    fn fetch_children(
        &self,
        query: &ChildQuery,
    ) -> impl Future<Output = SyncResult<Vec<JsonValue>>> + Send;
}

/// A source of change feed connections.
///
/// SSE, WebSocket and RPC streams all adapt to this by forwarding each
/// frame's JSON text into the connection channel.
pub trait ChangeFeed: Send + Sync + 'static {
    /// Opens a new connection.
    fn connect(&self) -> impl Future<Output = SyncResult<FeedConnection>> + Send;
}

impl<S: SnapshotSource> SnapshotSource for Arc<S> {
    fn fetch_page(
        &self,
        collection: Collection,
        cursor: Option<&str>,
        limit: u32,
    ) -> impl Future<Output = SyncResult<SnapshotPage>> + Send {
        (**self).fetch_page(collection, cursor, limit)
    }

    fn fetch_one(
        &self,
        collection: Collection,
        id: &str,
    ) -> impl Future<Output = SyncResult<JsonValue>> + Send {
        (**self).fetch_one(collection, id)
    }

    fn fetch_children(
        &self,
        query: &ChildQuery,
    ) -> impl Future<Output = SyncResult<Vec<JsonValue>>> + Send {
        (**self).fetch_children(query)
    }
}

impl<F: ChangeFeed> ChangeFeed for Arc<F> {
    fn connect(&self) -> impl Future<Output = SyncResult<FeedConnection>> + Send {
        (**self).connect()
    }
}

/// A scripted snapshot source for testing.
#[derive(Debug, Default)]
pub struct MockSource {
    pages: Mutex<VecDeque<SyncResult<SnapshotPage>>>,
    entities: Mutex<HashMap<(Collection, String), SyncResult<JsonValue>>>,
    children: Mutex<HashMap<ChildQuery, Vec<JsonValue>>>,
    requests: Mutex<Vec<String>>,
}

impl MockSource {
    /// Creates a new mock source.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a page response. Responses are served in order; once they run
    /// out every fetch returns an empty last page.
    pub fn push_page(&self, page: SyncResult<SnapshotPage>) {
        self.pages.lock().push_back(page);
    }

    /// Makes an entity available by id.
    pub fn set_entity(&self, collection: Collection, id: impl Into<String>, doc: JsonValue) {
        self.entities.lock().insert((collection, id.into()), Ok(doc));
    }

    /// Makes every fetch of an entity fail with `error`.
    pub fn set_entity_error(
        &self,
        collection: Collection,
        id: impl Into<String>,
        error: SyncError,
    ) {
        self.entities.lock().insert((collection, id.into()), Err(error));
    }

    /// Sets the response for a child listing.
    pub fn set_children(&self, query: ChildQuery, docs: Vec<JsonValue>) {
        self.children.lock().insert(query, docs);
    }

    /// Returns a log of requests served so far.
    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().clone()
    }
}

impl SnapshotSource for MockSource {
    async fn fetch_page(
        &self,
        collection: Collection,
        cursor: Option<&str>,
        limit: u32,
    ) -> SyncResult<SnapshotPage> {
        self.requests
            .lock()
            .push(format!("page {collection} from={} limit={limit}", cursor.unwrap_or("-")));
        let next = self.pages.lock().pop_front();
        next.unwrap_or_else(|| Ok(SnapshotPage::default()))
    }

    async fn fetch_one(&self, collection: Collection, id: &str) -> SyncResult<JsonValue> {
        self.requests.lock().push(format!("one {collection}/{id}"));
        let found = self.entities.lock().get(&(collection, id.to_string())).cloned();
        found.unwrap_or_else(|| {
            Err(SyncError::api(
                suitesync_protocol::ApiErrorKind::NotFound,
                format!("fetch {collection}/{id}"),
            ))
        })
    }

    async fn fetch_children(&self, query: &ChildQuery) -> SyncResult<Vec<JsonValue>> {
        self.requests.lock().push(format!("children {query:?}"));
        let found = self.children.lock().get(query).cloned();
        Ok(found.unwrap_or_default())
    }
}

/// A scripted change feed for testing.
///
/// Scripted connections deliver their frames and then close. Once the
/// script runs out, `connect` opens a live connection fed by [`MockFeed::send`].
#[derive(Debug, Default)]
pub struct MockFeed {
    scripted: Mutex<VecDeque<SyncResult<Vec<String>>>>,
    live: Mutex<Option<mpsc::Sender<String>>>,
    connects: AtomicUsize,
}

impl MockFeed {
    /// Creates a new mock feed.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a connection that delivers `frames` then drops.
    pub fn script_connection(&self, frames: Vec<String>) {
        self.scripted.lock().push_back(Ok(frames));
    }

    /// Queues a failed connection attempt.
    pub fn script_failure(&self, error: SyncError) {
        self.scripted.lock().push_back(Err(error));
    }

    /// Sends a frame on the live connection. Returns false if none is open.
    pub async fn send(&self, frame: impl Into<String>) -> bool {
        let sender = self.live.lock().clone();
        match sender {
            Some(sender) => sender.send(frame.into()).await.is_ok(),
            None => false,
        }
    }

    /// Drops the live connection.
    pub fn disconnect(&self) {
        self.live.lock().take();
    }

    /// Returns how many times `connect` was called.
    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

impl ChangeFeed for MockFeed {
    async fn connect(&self) -> SyncResult<FeedConnection> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let scripted = self.scripted.lock().pop_front();
        match scripted {
            Some(Ok(frames)) => {
                let (tx, rx) = mpsc::channel(frames.len().max(MOCK_FEED_CAPACITY));
                for frame in frames {
                    tx.try_send(frame)
                        .map_err(|e| SyncError::transport_fatal(e.to_string()))?;
                }
                Ok(rx)
            }
            Some(Err(err)) => Err(err),
            None => {
                let (tx, rx) = mpsc::channel(MOCK_FEED_CAPACITY);
                *self.live.lock() = Some(tx);
                Ok(rx)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn mock_source_serves_pages_in_order() {
        let source = MockSource::new();
        source.push_page(Ok(SnapshotPage::new(vec![json!({"id": "a"})], Some("b".into()))));
        source.push_page(Err(SyncError::transport_retryable("boom")));

        let first = source.fetch_page(Collection::Suites, None, 10).await.unwrap();
        assert_eq!(first.next_id.as_deref(), Some("b"));
        assert!(source.fetch_page(Collection::Suites, Some("b"), 10).await.is_err());
        assert!(source
            .fetch_page(Collection::Suites, Some("b"), 10)
            .await
            .unwrap()
            .is_last());
        assert_eq!(source.requests()[1], "page suites from=b limit=10");
    }

    #[tokio::test]
    async fn mock_source_fetch_one_not_found() {
        let source = MockSource::new();
        let err = source.fetch_one(Collection::Cases, "c1").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn scripted_connection_closes_after_frames() {
        let feed = MockFeed::new();
        feed.script_connection(vec!["one".into(), "two".into()]);

        let mut conn = feed.connect().await.unwrap();
        assert_eq!(conn.recv().await.as_deref(), Some("one"));
        assert_eq!(conn.recv().await.as_deref(), Some("two"));
        assert_eq!(conn.recv().await, None);
    }

    #[tokio::test]
    async fn live_connection_until_disconnect() {
        let feed = MockFeed::new();
        feed.script_failure(SyncError::NotConnected);
        assert!(feed.connect().await.is_err());

        let mut conn = feed.connect().await.unwrap();
        assert!(feed.send("hello").await);
        assert_eq!(conn.recv().await.as_deref(), Some("hello"));

        feed.disconnect();
        assert_eq!(conn.recv().await, None);
        assert!(!feed.send("late").await);
        assert_eq!(feed.connect_count(), 2);
    }

    #[test]
    fn child_query_collections() {
        assert_eq!(ChildQuery::SuiteCases("s".into()).collection(), Collection::Cases);
        assert_eq!(ChildQuery::CaseLogs("c".into()).collection(), Collection::Logs);
        assert_eq!(
            ChildQuery::Attachments(Owner::Suite("s".into())).collection(),
            Collection::Attachments
        );
    }
}
