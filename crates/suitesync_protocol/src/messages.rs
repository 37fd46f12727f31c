//! REST payloads: snapshot pages and error bodies.

use crate::change::{Fields, JsonValue};
use crate::collection::Collection;
use crate::error::{ProtocolError, ProtocolResult};
use serde::{Deserialize, Serialize};
use std::fmt;

/// One page of a collection listing.
///
/// On the wire the rows live under a key named after the collection:
/// `{"next_id": "...", "suites": [...], "aggs": {...}}`.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SnapshotPage {
    /// Rows on this page, as raw documents.
    pub items: Vec<JsonValue>,
    /// Cursor for the following page; absent on the last page.
    pub next_id: Option<String>,
    /// Aggregate counters at the time the page was produced.
    pub aggs: Option<JsonValue>,
}

impl SnapshotPage {
    /// Creates a page.
    pub fn new(items: Vec<JsonValue>, next_id: Option<String>) -> Self {
        Self {
            items,
            next_id,
            aggs: None,
        }
    }

    /// Attaches aggregate counters.
    pub fn with_aggs(mut self, aggs: JsonValue) -> Self {
        self.aggs = Some(aggs);
        self
    }

    /// Returns true if this is the last page.
    pub fn is_last(&self) -> bool {
        self.next_id.is_none()
    }

    /// Decodes a page body for `collection`.
    pub fn from_json(collection: Collection, body: JsonValue) -> ProtocolResult<Self> {
        let JsonValue::Object(mut fields) = body else {
            return Err(ProtocolError::decoding_failed("page body is not an object"));
        };

        let items = match fields.remove(collection.as_str()) {
            None | Some(JsonValue::Null) => Vec::new(),
            Some(JsonValue::Array(items)) => items,
            Some(_) => {
                return Err(ProtocolError::decoding_failed(format!(
                    "page field {collection} is not a list"
                )))
            }
        };

        let next_id = match fields.remove("next_id") {
            None | Some(JsonValue::Null) => None,
            Some(JsonValue::String(id)) if id.is_empty() => None,
            Some(JsonValue::String(id)) => Some(id),
            Some(_) => return Err(ProtocolError::decoding_failed("next_id is not a string")),
        };

        let aggs = fields.remove("aggs").filter(|v| !v.is_null());

        Ok(Self {
            items,
            next_id,
            aggs,
        })
    }

    /// Encodes the page body for `collection`.
    pub fn to_json(&self, collection: Collection) -> JsonValue {
        let mut fields = Fields::new();
        fields.insert(
            collection.as_str().into(),
            JsonValue::Array(self.items.clone()),
        );
        if let Some(next_id) = &self.next_id {
            fields.insert("next_id".into(), JsonValue::from(next_id.as_str()));
        }
        if let Some(aggs) = &self.aggs {
            fields.insert("aggs".into(), aggs.clone());
        }
        JsonValue::Object(fields)
    }
}

/// Error kinds the REST API reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApiErrorKind {
    /// The request was malformed.
    BadRequest,
    /// The entity does not exist.
    NotFound,
    /// Anything else.
    #[serde(other)]
    Unknown,
}

impl ApiErrorKind {
    /// Best guess from an HTTP status when the body is unreadable.
    pub fn from_status(status: u16) -> Self {
        match status {
            400 => ApiErrorKind::BadRequest,
            404 => ApiErrorKind::NotFound,
            _ => ApiErrorKind::Unknown,
        }
    }

    /// Returns the wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            ApiErrorKind::BadRequest => "bad_request",
            ApiErrorKind::NotFound => "not_found",
            ApiErrorKind::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ApiErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Body of a non-2xx response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiErrorBody {
    /// What went wrong.
    pub error: ApiErrorKind,
}

impl ApiErrorBody {
    /// Decodes an error body, falling back to the HTTP status.
    pub fn from_response(status: u16, body: &[u8]) -> Self {
        serde_json::from_slice(body).unwrap_or(Self {
            error: ApiErrorKind::from_status(status),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn page_reads_collection_key() {
        let page = SnapshotPage::from_json(
            Collection::Suites,
            json!({"next_id": "s10", "suites": [{"id": "s1"}], "aggs": {"version": 2}}),
        )
        .unwrap();
        assert_eq!(page.items.len(), 1);
        assert_eq!(page.next_id.as_deref(), Some("s10"));
        assert_eq!(page.aggs, Some(json!({"version": 2})));
        assert!(!page.is_last());
    }

    #[test]
    fn page_without_rows_or_cursor_is_last() {
        let page = SnapshotPage::from_json(Collection::Suites, json!({"suites": null})).unwrap();
        assert!(page.items.is_empty());
        assert!(page.is_last());

        let page = SnapshotPage::from_json(Collection::Suites, json!({"next_id": ""})).unwrap();
        assert!(page.is_last());
    }

    #[test]
    fn page_rejects_bad_shapes() {
        assert!(SnapshotPage::from_json(Collection::Suites, json!([])).is_err());
        assert!(SnapshotPage::from_json(Collection::Suites, json!({"suites": 3})).is_err());
        assert!(SnapshotPage::from_json(Collection::Suites, json!({"next_id": 3})).is_err());
    }

    #[test]
    fn page_json_roundtrip() {
        let page = SnapshotPage::new(vec![json!({"id": "c1"})], Some("c2".into()))
            .with_aggs(json!({"version": 1}));
        let body = page.to_json(Collection::Cases);
        assert_eq!(SnapshotPage::from_json(Collection::Cases, body).unwrap(), page);
    }

    #[test]
    fn error_body_decoding() {
        let body = ApiErrorBody::from_response(404, br#"{"error":"not_found"}"#);
        assert_eq!(body.error, ApiErrorKind::NotFound);

        let body = ApiErrorBody::from_response(400, b"<html>");
        assert_eq!(body.error, ApiErrorKind::BadRequest);

        let body = ApiErrorBody::from_response(500, br#"{"error":"teapot"}"#);
        assert_eq!(body.error, ApiErrorKind::Unknown);
    }
}
