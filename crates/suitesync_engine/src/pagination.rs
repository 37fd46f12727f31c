//! Snapshot pagination.
//!
//! Pages are requested with the cursor the server handed back on the
//! previous page. A page without a next cursor ends the enumeration. The
//! enumeration is not considered complete while updates are still waiting for
//! entities that have not shown up, since a later page may yet deliver them.

use crate::error::SyncResult;
use crate::replica::{PageSummary, Replica};
use crate::transport::SnapshotSource;
use suitesync_protocol::{Collection, SnapshotPage};
use tracing::{debug, info};

/// Cursor state of one paginated enumeration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PageCursor {
    cursor: Option<String>,
    initialized: bool,
    exhausted: bool,
}

impl PageCursor {
    /// Creates a cursor positioned before the first page.
    pub fn new() -> Self {
        Self::default()
    }

    /// The cursor to send with the next request.
    pub fn cursor(&self) -> Option<&str> {
        self.cursor.as_deref()
    }

    /// Returns true once at least one page was received.
    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Returns true once a page came back without a next cursor.
    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    /// Returns true while the enumeration cannot be considered complete.
    pub fn has_more(&self, pending: usize) -> bool {
        !self.initialized || !self.exhausted || pending > 0
    }

    /// Records a received page's next cursor.
    pub fn advance(&mut self, next_id: Option<String>) {
        self.initialized = true;
        match next_id {
            Some(next) => self.cursor = Some(next),
            None => self.exhausted = true,
        }
    }

    /// Goes back to before the first page.
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// A page request derived from the cursor state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRequest {
    /// Collection to list.
    pub collection: Collection,
    /// Resume point; `None` for the first page.
    pub cursor: Option<String>,
    /// Rows per page.
    pub limit: u32,
}

impl PageRequest {
    /// Performs the request.
    pub async fn send<S: SnapshotSource>(&self, source: &S) -> SyncResult<SnapshotPage> {
        source
            .fetch_page(self.collection, self.cursor.as_deref(), self.limit)
            .await
    }
}

/// Drives the snapshot enumeration of one collection into a [`Replica`].
///
/// Requesting and completing a page are separate steps so a caller that
/// fetches on another task can feed results back in order.
#[derive(Debug, Clone)]
pub struct Paginator {
    collection: Collection,
    page_size: u32,
    cursor: PageCursor,
    pages_fetched: u64,
}

impl Paginator {
    /// Creates a paginator for `collection`.
    pub fn new(collection: Collection, page_size: u32) -> Self {
        Self {
            collection,
            page_size: page_size.max(1),
            cursor: PageCursor::new(),
            pages_fetched: 0,
        }
    }

    /// The paginated collection.
    pub fn collection(&self) -> Collection {
        self.collection
    }

    /// The cursor state.
    pub fn cursor(&self) -> &PageCursor {
        &self.cursor
    }

    /// Pages completed since creation.
    pub fn pages_fetched(&self) -> u64 {
        self.pages_fetched
    }

    /// The next page to fetch, or `None` once the cursor is exhausted.
    pub fn next_request(&self) -> Option<PageRequest> {
        if self.cursor.is_exhausted() {
            return None;
        }
        Some(PageRequest {
            collection: self.collection,
            cursor: self.cursor.cursor().map(str::to_string),
            limit: self.page_size,
        })
    }

    /// Applies a fetched page and advances the cursor.
    pub fn complete(&mut self, replica: &mut Replica, page: SnapshotPage) -> PageSummary {
        let next_id = page.next_id.clone();
        let summary = replica.apply_page(self.collection, page);
        self.cursor.advance(next_id);
        self.pages_fetched += 1;
        if self.cursor.is_exhausted() {
            info!(collection = %self.collection, pages = self.pages_fetched, "snapshot exhausted");
        }
        summary
    }

    /// Fetches and applies the next page.
    ///
    /// Once the cursor is exhausted this does nothing and returns an empty
    /// summary.
    pub async fn fetch_next_page<S: SnapshotSource>(
        &mut self,
        source: &S,
        replica: &mut Replica,
    ) -> SyncResult<PageSummary> {
        let Some(request) = self.next_request() else {
            debug!(collection = %self.collection, "fetch skipped, snapshot exhausted");
            return Ok(PageSummary::default());
        };
        let page = request.send(source).await?;
        Ok(self.complete(replica, page))
    }

    /// Returns true while more pages are needed or updates are unresolved.
    pub fn has_more(&self, replica: &Replica) -> bool {
        self.cursor.has_more(replica.pending_len(self.collection))
    }

    /// Starts over from the first page.
    pub fn reset(&mut self) {
        debug!(collection = %self.collection, "pagination restarted");
        self.cursor.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SyncError;
    use crate::transport::MockSource;
    use serde_json::json;
    use suitesync_protocol::UpdateChange;

    fn suites(from: usize, to: usize) -> Vec<serde_json::Value> {
        (from..to)
            .map(|i| {
                json!({"id": format!("s{i:02}"), "version": 1, "status": "finished",
                    "started_at": i as i64})
            })
            .collect()
    }

    fn source_with_25() -> MockSource {
        let source = MockSource::new();
        source.push_page(Ok(SnapshotPage::new(suites(0, 10), Some("s10".into()))));
        source.push_page(Ok(SnapshotPage::new(suites(10, 20), Some("s20".into()))));
        source.push_page(Ok(SnapshotPage::new(suites(20, 25), None)));
        source
    }

    #[test]
    fn cursor_state() {
        let mut cursor = PageCursor::new();
        assert!(cursor.has_more(0));

        cursor.advance(Some("b".into()));
        assert!(cursor.is_initialized());
        assert_eq!(cursor.cursor(), Some("b"));
        assert!(cursor.has_more(0));

        cursor.advance(None);
        assert!(cursor.is_exhausted());
        assert!(!cursor.has_more(0));
        assert!(cursor.has_more(1));

        cursor.reset();
        assert_eq!(cursor, PageCursor::new());
    }

    #[tokio::test]
    async fn converges_in_three_pages() {
        let source = source_with_25();
        let mut replica = Replica::new();
        let mut paginator = Paginator::new(Collection::Suites, 10);

        let mut fetches = 0;
        while paginator.has_more(&replica) {
            paginator.fetch_next_page(&source, &mut replica).await.unwrap();
            fetches += 1;
        }

        assert_eq!(fetches, 3);
        assert_eq!(replica.suites().len(), 25);
        assert_eq!(
            source.requests(),
            [
                "page suites from=- limit=10",
                "page suites from=s10 limit=10",
                "page suites from=s20 limit=10",
            ]
        );
    }

    #[tokio::test]
    async fn pending_update_blocks_exhaustion() {
        let source = source_with_25();
        let mut replica = Replica::new();
        let mut paginator = Paginator::new(Collection::Suites, 10);
        replica
            .apply_update(UpdateChange::new(Collection::Suites, "elsewhere", 3).set("name", "x"))
            .unwrap();

        for _ in 0..3 {
            paginator.fetch_next_page(&source, &mut replica).await.unwrap();
        }
        assert!(paginator.cursor().is_exhausted());
        assert!(paginator.has_more(&replica));
        assert!(paginator.next_request().is_none());

        replica.drop_pending(Collection::Suites, "elsewhere");
        assert!(!paginator.has_more(&replica));
    }

    #[tokio::test]
    async fn pending_update_resolved_by_later_page() {
        let source = source_with_25();
        let mut replica = Replica::new();
        let mut paginator = Paginator::new(Collection::Suites, 10);
        replica
            .apply_update(UpdateChange::new(Collection::Suites, "s22", 2).set("name", "late"))
            .unwrap();

        while paginator.has_more(&replica) {
            paginator.fetch_next_page(&source, &mut replica).await.unwrap();
        }
        assert_eq!(replica.suite("s22").unwrap().name.as_deref(), Some("late"));
    }

    #[tokio::test]
    async fn failed_fetch_keeps_cursor() {
        let source = MockSource::new();
        source.push_page(Ok(SnapshotPage::new(suites(0, 2), Some("s02".into()))));
        source.push_page(Err(SyncError::transport_retryable("reset by peer")));
        let mut replica = Replica::new();
        let mut paginator = Paginator::new(Collection::Suites, 2);

        paginator.fetch_next_page(&source, &mut replica).await.unwrap();
        assert!(paginator.fetch_next_page(&source, &mut replica).await.is_err());
        assert_eq!(paginator.cursor().cursor(), Some("s02"));
        assert_eq!(paginator.pages_fetched(), 1);
    }
}
