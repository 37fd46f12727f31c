//! Entity kinds and the capability traits the sync layer relies on.
//!
//! Every synchronized record has an id and a version ([`Record`]). Some
//! kinds can also be soft-deleted ([`SoftDelete`]). Concrete kinds mirror the
//! backend's JSON documents; [`Document`] is an untyped record for callers
//! that only need the field map.

use crate::change::{Fields, JsonValue, UpdateChange};
use crate::error::ProtocolResult;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Id of the single aggregate record for suites.
pub const SUITE_AGGS_ID: &str = "suite_aggs";

/// Milliseconds since the Unix epoch.
pub type Timestamp = i64;

/// A versioned record that can be reconciled.
pub trait Record: Clone + Send + Sync + 'static {
    /// Returns the entity id.
    fn id(&self) -> &str;

    /// Returns the entity version.
    fn version(&self) -> u64;

    /// Total order used when listing a collection.
    fn listing_cmp(&self, other: &Self) -> Ordering {
        self.id().cmp(other.id())
    }

    /// Decodes a record from its JSON document.
    fn from_json(value: JsonValue) -> ProtocolResult<Self>;

    /// Returns a copy with the update applied and the version bumped.
    ///
    /// The caller has already checked that the update is newer.
    fn with_update(&self, update: &UpdateChange) -> ProtocolResult<Self>;
}

/// A record that is hidden from active listings once deleted.
pub trait SoftDelete {
    /// Returns true once the record has been soft-deleted.
    fn is_deleted(&self) -> bool;

    /// When the record was deleted, if known.
    fn deleted_at(&self) -> Option<Timestamp>;
}

/// Applies an update by round-tripping a typed record through its JSON form.
fn apply_json<T: Serialize + DeserializeOwned>(
    record: &T,
    update: &UpdateChange,
) -> ProtocolResult<T> {
    let mut fields = match serde_json::to_value(record)? {
        JsonValue::Object(fields) => fields,
        _ => Fields::new(),
    };
    update.apply_fields(&mut fields);
    fields.insert("version".into(), JsonValue::from(update.version));
    Ok(serde_json::from_value(JsonValue::Object(fields))?)
}

macro_rules! json_record {
    ($ty:ty, |$a:ident, $b:ident| $cmp:expr) => {
        impl Record for $ty {
            fn id(&self) -> &str {
                &self.id
            }

            fn version(&self) -> u64 {
                self.version
            }

            fn listing_cmp(&self, other: &Self) -> Ordering {
                let ($a, $b) = (self, other);
                $cmp
            }

            fn from_json(value: JsonValue) -> ProtocolResult<Self> {
                Ok(serde_json::from_value(value)?)
            }

            fn with_update(&self, update: &UpdateChange) -> ProtocolResult<Self> {
                apply_json(self, update)
            }
        }
    };
}

macro_rules! soft_delete {
    ($ty:ty) => {
        impl SoftDelete for $ty {
            fn is_deleted(&self) -> bool {
                self.deleted
            }

            fn deleted_at(&self) -> Option<Timestamp> {
                self.deleted_at
            }
        }
    };
}

fn is_false(value: &bool) -> bool {
    !*value
}

/// Lifecycle state of a suite.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuiteStatus {
    /// The suite is running.
    Started,
    /// The suite ran to completion.
    Finished,
    /// The reporter went away before finishing.
    Disconnected,
}

/// Outcome of a finished suite.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuiteResult {
    /// All cases passed.
    Passed,
    /// At least one case failed.
    Failed,
}

/// A test suite run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Suite {
    /// Suite id.
    pub id: String,
    /// Entity version.
    pub version: u64,
    /// Soft delete marker.
    #[serde(default, skip_serializing_if = "is_false")]
    pub deleted: bool,
    /// Soft delete time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<Timestamp>,
    /// Display name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Free-form tags.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    /// Number of cases the reporter announced.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub planned_cases: Option<u64>,
    /// Lifecycle state.
    pub status: SuiteStatus,
    /// Outcome, once finished.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<SuiteResult>,
    /// Start time.
    pub started_at: Timestamp,
    /// Finish time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<Timestamp>,
    /// Disconnect time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disconnected_at: Option<Timestamp>,
}

// Newest suites first; ids break ties so the order is total.
json_record!(Suite, |a, b| b
    .started_at
    .cmp(&a.started_at)
    .then_with(|| a.id.cmp(&b.id)));
soft_delete!(Suite);

/// Lifecycle state of a case.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaseStatus {
    /// Announced but not started.
    Created,
    /// Running.
    Started,
    /// Done.
    Finished,
}

/// Outcome of a finished case.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaseResult {
    /// Passed.
    Passed,
    /// Failed an assertion.
    Failed,
    /// Skipped.
    Skipped,
    /// Aborted by the runner.
    Aborted,
    /// Raised an unexpected error.
    Errored,
}

/// A test case within a suite.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Case {
    /// Case id.
    pub id: String,
    /// Entity version.
    pub version: u64,
    /// Owning suite.
    pub suite_id: String,
    /// Display name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Longer description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Free-form tags.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    /// Ordinal within the suite.
    pub idx: u64,
    /// Arbitrary arguments the case was run with.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<Fields>,
    /// Lifecycle state.
    pub status: CaseStatus,
    /// Outcome, once finished.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<CaseResult>,
    /// Creation time.
    pub created_at: Timestamp,
    /// Start time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<Timestamp>,
    /// Finish time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<Timestamp>,
}

json_record!(Case, |a, b| a.idx.cmp(&b.idx).then_with(|| a.id.cmp(&b.id)));

/// Severity of a log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    /// Trace.
    Trace,
    /// Debug.
    Debug,
    /// Info.
    Info,
    /// Warning.
    Warn,
    /// Error.
    Error,
}

/// One line of case output.
///
/// Log lines are insert-only; their version defaults to zero.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogLine {
    /// Line id.
    pub id: String,
    /// Entity version.
    #[serde(default)]
    pub version: u64,
    /// Owning case.
    pub case_id: String,
    /// Ordinal within the case.
    pub idx: u64,
    /// Severity.
    pub level: LogLevel,
    /// Stack trace, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace: Option<String>,
    /// Message text.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Emit time.
    pub timestamp: Timestamp,
}

json_record!(LogLine, |a, b| a.idx.cmp(&b.idx).then_with(|| a.id.cmp(&b.id)));

/// The entity an attachment or log listing hangs off.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Owner {
    /// A suite id.
    Suite(String),
    /// A case id.
    Case(String),
}

/// A file attached to a suite or case.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attachment {
    /// Attachment id.
    pub id: String,
    /// Entity version.
    pub version: u64,
    /// Soft delete marker.
    #[serde(default, skip_serializing_if = "is_false")]
    pub deleted: bool,
    /// Soft delete time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<Timestamp>,
    /// Owning suite, if attached to a suite.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suite_id: Option<String>,
    /// Owning case, if attached to a case.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub case_id: Option<String>,
    /// Original file name.
    pub filename: String,
    /// MIME type.
    pub content_type: String,
    /// Size in bytes.
    pub size: u64,
    /// Upload time.
    pub timestamp: Timestamp,
}

impl Attachment {
    /// Returns true if the attachment hangs off `owner`.
    pub fn belongs_to(&self, owner: &Owner) -> bool {
        match owner {
            Owner::Suite(id) => self.suite_id.as_deref() == Some(id.as_str()),
            Owner::Case(id) => self.case_id.as_deref() == Some(id.as_str()),
        }
    }
}

json_record!(Attachment, |a, b| a
    .timestamp
    .cmp(&b.timestamp)
    .then_with(|| a.id.cmp(&b.id)));
soft_delete!(Attachment);

/// Running and finished suite counts, maintained by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuiteAggs {
    /// Always [`SUITE_AGGS_ID`] once stored.
    #[serde(default = "suite_aggs_id")]
    pub id: String,
    /// Entity version.
    pub version: u64,
    /// Suites currently running.
    #[serde(default)]
    pub running: u64,
    /// Suites that have finished.
    #[serde(default)]
    pub finished: u64,
}

fn suite_aggs_id() -> String {
    SUITE_AGGS_ID.to_string()
}

json_record!(SuiteAggs, |a, b| a.id.cmp(&b.id));

/// An untyped record: id, version, and every other field as JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    /// Entity id.
    pub id: String,
    /// Entity version.
    #[serde(default)]
    pub version: u64,
    /// Every other field.
    #[serde(flatten)]
    pub fields: Fields,
}

impl Document {
    /// Creates a document from an id, version and field map.
    pub fn new(id: impl Into<String>, version: u64, fields: Fields) -> Self {
        Self {
            id: id.into(),
            version,
            fields,
        }
    }

    /// Returns a field value.
    pub fn get(&self, field: &str) -> Option<&JsonValue> {
        self.fields.get(field)
    }
}

impl Record for Document {
    fn id(&self) -> &str {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }

    fn from_json(value: JsonValue) -> ProtocolResult<Self> {
        Ok(serde_json::from_value(value)?)
    }

    fn with_update(&self, update: &UpdateChange) -> ProtocolResult<Self> {
        let mut next = self.clone();
        update.apply_fields(&mut next.fields);
        next.version = update.version;
        Ok(next)
    }
}

impl SoftDelete for Document {
    fn is_deleted(&self) -> bool {
        self.fields
            .get("deleted")
            .and_then(JsonValue::as_bool)
            .unwrap_or(false)
    }

    fn deleted_at(&self) -> Option<Timestamp> {
        self.fields.get("deleted_at").and_then(JsonValue::as_i64)
    }
}
