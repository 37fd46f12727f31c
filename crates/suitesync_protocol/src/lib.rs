//! # suitesync protocol
//!
//! Wire types and change semantics for the suitesync dashboard client.
//!
//! This crate provides:
//! - `Collection` names shared by the REST API and the change feed
//! - Entity kinds (`Suite`, `Case`, `LogLine`, `Attachment`, `SuiteAggs`)
//!   and the `Record` / `SoftDelete` capability traits
//! - `InsertChange` / `UpdateChange` with the pending-update merge rule
//! - Change feed frames and snapshot page bodies
//!
//! This is a pure protocol crate with no I/O operations.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod change;
mod collection;
mod entity;
mod error;
mod feed;
mod messages;

pub use change::{Change, ChangeOp, Fields, InsertChange, JsonValue, UpdateChange};
pub use collection::Collection;
pub use entity::{
    Attachment, Case, CaseResult, CaseStatus, Document, LogLevel, LogLine, Owner, Record,
    SoftDelete, Suite, SuiteAggs, SuiteResult, SuiteStatus, Timestamp, SUITE_AGGS_ID,
};
pub use error::{ProtocolError, ProtocolResult};
pub use feed::FeedMessage;
pub use messages::{ApiErrorBody, ApiErrorKind, SnapshotPage};
