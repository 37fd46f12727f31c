//! Documents, feed frames and timing helpers shared by the test suites.
//!
//! Document builders produce the minimal JSON the server would send for
//! each kind, so they decode into the typed records without extra fields.

use serde_json::json;
use std::future::Future;
use std::time::Duration;
use suitesync_engine::{RetryConfig, SyncConfig};
use suitesync_protocol::{
    Change, Collection, FeedMessage, InsertChange, JsonValue, Owner, UpdateChange, SUITE_AGGS_ID,
};

/// Base for generated timestamps: 2024-01-01T00:00:00Z in milliseconds.
pub const BASE_TIME: i64 = 1_704_067_200_000;

/// How long [`wait_until`] polls before failing the test.
pub const WAIT_TIMEOUT: Duration = Duration::from_secs(5);

/// A running suite. Later versions start later, so listings stay stable.
pub fn suite_doc(id: &str, version: u64) -> JsonValue {
    json!({
        "id": id,
        "version": version,
        "status": "started",
        "started_at": BASE_TIME + version as i64,
    })
}

/// A created case at position `idx` of its suite.
pub fn case_doc(id: &str, suite_id: &str, idx: u64) -> JsonValue {
    json!({
        "id": id,
        "version": 1,
        "suite_id": suite_id,
        "idx": idx,
        "status": "created",
        "created_at": BASE_TIME + idx as i64,
    })
}

/// An info-level log line.
pub fn log_doc(id: &str, case_id: &str, idx: u64) -> JsonValue {
    json!({
        "id": id,
        "case_id": case_id,
        "idx": idx,
        "level": "info",
        "message": format!("line {idx}"),
        "timestamp": BASE_TIME + idx as i64,
    })
}

/// An attachment hanging off `owner`.
pub fn attachment_doc(id: &str, owner: &Owner) -> JsonValue {
    let mut doc = json!({
        "id": id,
        "version": 1,
        "filename": format!("{id}.png"),
        "content_type": "image/png",
        "size": 1024,
        "timestamp": BASE_TIME,
    });
    let (key, owner_id) = match owner {
        Owner::Suite(id) => ("suite_id", id),
        Owner::Case(id) => ("case_id", id),
    };
    doc[key] = JsonValue::from(owner_id.as_str());
    doc
}

/// The suite counters.
pub fn aggs_doc(version: u64, running: u64, finished: u64) -> JsonValue {
    json!({
        "id": SUITE_AGGS_ID,
        "version": version,
        "running": running,
        "finished": finished,
    })
}

/// An insert frame for `doc`.
pub fn insert_frame(collection: Collection, doc: JsonValue) -> String {
    let id = doc["id"].as_str().unwrap_or(SUITE_AGGS_ID).to_string();
    let change = Change::Insert(InsertChange::new(collection, id, doc));
    FeedMessage::Change(change)
        .encode()
        .expect("insert frames encode")
}

/// An update frame.
pub fn update_frame(update: UpdateChange) -> String {
    FeedMessage::Change(Change::Update(update))
        .encode()
        .expect("update frames encode")
}

/// The caught-up control frame.
pub fn caught_up_frame() -> String {
    FeedMessage::CaughtUp.encode().expect("control frames encode")
}

/// A configuration with a short retry interval, suitable for real-time tests.
pub fn test_config() -> SyncConfig {
    SyncConfig::new("memory://")
        .with_page_size(10)
        .with_retry(RetryConfig::fixed(Duration::from_millis(10)))
}

/// Polls `condition` until it holds.
///
/// # Panics
///
/// Panics if the condition is still false after [`WAIT_TIMEOUT`].
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    let polled = tokio::time::timeout(WAIT_TIMEOUT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(polled.is_ok(), "condition not met within {WAIT_TIMEOUT:?}");
}

/// Awaits `future`, failing the test if it takes longer than [`WAIT_TIMEOUT`].
pub async fn within<T>(future: impl Future<Output = T>) -> T {
    tokio::time::timeout(WAIT_TIMEOUT, future)
        .await
        .expect("future did not complete in time")
}
