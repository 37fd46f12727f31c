//! # suitesync engine
//!
//! Keeps a client-side replica of the dashboard's collections consistent
//! with the server.
//!
//! This crate provides:
//! - Per-collection entity stores with version-monotonic upserts
//! - The change reconciler with its pending-update queue
//! - The single-record aggregate store
//! - Snapshot pagination with the "has more" convergence rule
//! - The change feed subscriber and fixed-interval retry helper
//! - An HTTP snapshot source over a pluggable client
//! - `SyncEngine`, the single-writer reconciliation actor, and its
//!   read-only `EngineHandle`
//!
//! ## Architecture
//!
//! Snapshot pages and live changes flow through the same reconciler:
//! 1. Connect the change feed
//! 2. Enumerate the snapshot from the first page
//! 3. Apply feed changes as they arrive; versions decide which copy wins
//! 4. Fetch entities that updates name but no page delivered
//!
//! On reconnect the snapshot is enumerated again; the feed is never replayed.
//!
//! ## Key Invariants
//!
//! - A version at or below the held one never changes the store
//! - Feed changes apply in arrival order, each without suspension
//! - Only the engine task writes to the replica
//! - "Has more" stays true while any update waits for its entity

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod aggregate;
mod config;
mod engine;
mod error;
mod feed;
mod http;
mod pagination;
mod reconciler;
mod replica;
mod retry;
mod store;
mod transport;

pub use aggregate::AggregateStore;
pub use config::{
    MissingEntityPolicy, RetryConfig, SyncConfig, DEFAULT_PAGE_SIZE, DEFAULT_RETRY_INTERVAL,
};
pub use engine::{EngineHandle, SyncEngine, SyncState, SyncStats};
pub use error::{SyncError, SyncResult};
pub use feed::{subscribe, FeedEvent, FeedSubscriber};
pub use http::{HttpClient, HttpResponse, HttpSource};
pub use pagination::{PageCursor, PageRequest, Paginator};
pub use reconciler::{InsertOutcome, Reconciler, UpdateOutcome};
pub use replica::{ChangeOutcome, PageSummary, Replica};
pub use retry::retry;
pub use store::EntityStore;
pub use transport::{ChangeFeed, ChildQuery, FeedConnection, MockFeed, MockSource, SnapshotSource};
