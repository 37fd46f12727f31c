//! Change feed subscriber.

use crate::error::SyncResult;
use crate::retry::retry;
use crate::transport::{ChangeFeed, FeedConnection};
use std::time::Duration;
use suitesync_protocol::{Change, FeedMessage};
use tracing::{info, warn};

/// A decoded feed event.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedEvent {
    /// A change to apply.
    Change(Change),
    /// The server has flushed everything buffered for this connection.
    CaughtUp,
    /// The connection dropped. Nothing is replayed; the caller must catch up
    /// from a fresh snapshot after reconnecting.
    Closed,
}

/// Reads one feed connection in arrival order.
///
/// Frames that fail to decode are logged and skipped.
#[derive(Debug)]
pub struct FeedSubscriber {
    conn: FeedConnection,
    decode_errors: u64,
}

impl FeedSubscriber {
    /// Wraps an open connection.
    pub fn new(conn: FeedConnection) -> Self {
        Self {
            conn,
            decode_errors: 0,
        }
    }

    /// Waits for the next event.
    ///
    /// Cancel safe: a frame is only consumed once it has been decoded.
    pub async fn next_event(&mut self) -> FeedEvent {
        loop {
            let Some(frame) = self.conn.recv().await else {
                return FeedEvent::Closed;
            };
            match FeedMessage::decode(&frame) {
                Ok(FeedMessage::Change(change)) => return FeedEvent::Change(change),
                Ok(FeedMessage::CaughtUp) => return FeedEvent::CaughtUp,
                Err(err) => {
                    self.decode_errors += 1;
                    warn!(error = %err, len = frame.len(), "dropping undecodable feed frame");
                }
            }
        }
    }

    /// Frames dropped on this connection so far.
    pub fn decode_errors(&self) -> u64 {
        self.decode_errors
    }
}

/// Opens a feed connection, retrying at `interval` while still relevant.
pub async fn subscribe<F: ChangeFeed>(
    feed: &F,
    interval: Duration,
    is_relevant: impl FnMut() -> bool,
) -> SyncResult<FeedSubscriber> {
    let conn = retry(interval, is_relevant, || feed.connect()).await?;
    info!("change feed connected");
    Ok(FeedSubscriber::new(conn))
}
