//! Change feed frames.
//!
//! Every transport (SSE, WebSocket, RPC stream, polling) delivers the same
//! JSON frames:
//!
//! ```text
//! {"coll": "suites", "id": "s1", "insert": {...full document...}}
//! {"coll": "suites", "id": "s1", "update": {"version": 3, ...}, "deleted": ["result"]}
//! {"caught_up": true}
//! ```

use crate::change::{Change, Fields, InsertChange, JsonValue, UpdateChange};
use crate::collection::Collection;
use crate::error::{ProtocolError, ProtocolResult};
use serde::{Deserialize, Serialize};

/// A decoded change feed message.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedMessage {
    /// An insert or update for one entity.
    Change(Change),
    /// The server has delivered everything it had buffered for this
    /// subscription; the client is now live.
    CaughtUp,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct RawFrame {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    coll: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    insert: Option<JsonValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    update: Option<Fields>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    deleted: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    caught_up: Option<bool>,
}

impl FeedMessage {
    /// Decodes one frame.
    pub fn decode(text: &str) -> ProtocolResult<Self> {
        let raw: RawFrame = serde_json::from_str(text)?;

        if raw.coll.is_none() {
            return match raw.caught_up {
                Some(true) => Ok(FeedMessage::CaughtUp),
                _ => Err(ProtocolError::invalid_message("frame has no collection")),
            };
        }

        let collection: Collection = raw.coll.as_deref().unwrap_or_default().parse()?;
        let id = raw
            .id
            .filter(|id| !id.is_empty())
            .ok_or_else(|| ProtocolError::invalid_message("frame has no id"))?;

        match (raw.insert, raw.update) {
            (Some(doc), None) => {
                let doc = with_frame_id(doc, &id)?;
                Ok(FeedMessage::Change(Change::Insert(InsertChange::new(
                    collection, id, doc,
                ))))
            }
            (None, Some(updated)) => {
                let deleted = raw.deleted.unwrap_or_default();
                let update = UpdateChange::from_wire(collection, id, updated, deleted)?;
                Ok(FeedMessage::Change(Change::Update(update)))
            }
            (Some(_), Some(_)) => Err(ProtocolError::invalid_message(
                "frame carries both insert and update",
            )),
            (None, None) => Err(ProtocolError::invalid_message(
                "frame carries neither insert nor update",
            )),
        }
    }

    /// Encodes the message as a frame.
    pub fn encode(&self) -> ProtocolResult<String> {
        let raw = match self {
            FeedMessage::CaughtUp => RawFrame {
                caught_up: Some(true),
                ..RawFrame::default()
            },
            FeedMessage::Change(Change::Insert(change)) => RawFrame {
                coll: Some(change.collection.as_str().into()),
                id: Some(change.id.clone()),
                insert: Some(change.doc.clone()),
                ..RawFrame::default()
            },
            FeedMessage::Change(Change::Update(change)) => RawFrame {
                coll: Some(change.collection.as_str().into()),
                id: Some(change.id.clone()),
                update: Some(change.wire_fields()),
                deleted: (!change.deleted.is_empty()).then(|| change.deleted.clone()),
                ..RawFrame::default()
            },
        };
        Ok(serde_json::to_string(&raw)?)
    }
}

/// Fills in the document id from the frame, or rejects a mismatch.
fn with_frame_id(doc: JsonValue, id: &str) -> ProtocolResult<JsonValue> {
    let JsonValue::Object(mut fields) = doc else {
        return Err(ProtocolError::invalid_message("insert document is not an object"));
    };
    match fields.get("id").and_then(JsonValue::as_str) {
        Some(doc_id) if doc_id != id => Err(ProtocolError::invalid_message(format!(
            "insert document id {doc_id} does not match frame id {id}"
        ))),
        Some(_) => Ok(JsonValue::Object(fields)),
        None => {
            fields.insert("id".into(), JsonValue::from(id));
            Ok(JsonValue::Object(fields))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decode_insert() {
        let msg = FeedMessage::decode(
            r#"{"coll":"suites","id":"s1","insert":{"version":1,"status":"started","started_at":1}}"#,
        )
        .unwrap();
        let FeedMessage::Change(Change::Insert(change)) = msg else {
            panic!("expected insert");
        };
        assert_eq!(change.collection, Collection::Suites);
        assert_eq!(change.doc["id"], json!("s1"));
    }

    #[test]
    fn decode_update_with_deleted_fields() {
        let msg = FeedMessage::decode(
            r#"{"coll":"cases","id":"c1","update":{"version":3,"status":"finished"},"deleted":["result"]}"#,
        )
        .unwrap();
        let FeedMessage::Change(Change::Update(change)) = msg else {
            panic!("expected update");
        };
        assert_eq!(change.version, 3);
        assert_eq!(change.deleted, ["result"]);
        assert_eq!(change.updated["status"], json!("finished"));
    }

    #[test]
    fn decode_caught_up() {
        assert_eq!(
            FeedMessage::decode(r#"{"caught_up":true}"#).unwrap(),
            FeedMessage::CaughtUp
        );
    }

    #[test]
    fn extra_keys_are_ignored() {
        let msg = FeedMessage::decode(r#"{"seq":9,"coll":"logs","id":"l1","insert":{"id":"l1"}}"#);
        assert!(msg.is_ok());
    }

    #[test]
    fn malformed_frames_are_rejected() {
        let cases = [
            "not json",
            r#"{"id":"s1","insert":{}}"#,
            r#"{"coll":"widgets","id":"s1","insert":{}}"#,
            r#"{"coll":"suites","insert":{}}"#,
            r#"{"coll":"suites","id":"s1"}"#,
            r#"{"coll":"suites","id":"s1","insert":{},"update":{"version":1}}"#,
            r#"{"coll":"suites","id":"s1","update":{"status":"x"}}"#,
            r#"{"coll":"suites","id":"s1","insert":{"id":"s2"}}"#,
            r#"{"coll":"suites","id":"s1","insert":[1]}"#,
        ];
        for frame in cases {
            assert!(FeedMessage::decode(frame).is_err(), "accepted {frame}");
        }
    }

    #[test]
    fn encode_then_decode_update() {
        let update = UpdateChange::new(Collection::Suites, "s1", 7)
            .set("name", "nightly")
            .delete("result");
        let msg = FeedMessage::Change(Change::Update(update));
        let frame = msg.encode().unwrap();
        assert_eq!(FeedMessage::decode(&frame).unwrap(), msg);
    }
}
