//! Insert and update changes.
//!
//! An [`InsertChange`] carries a full document. An [`UpdateChange`] carries a
//! partial field map plus a list of fields to remove. Field assignment is
//! always applied before field removal, so a field named in both ends up
//! absent.

use crate::collection::Collection;
use crate::error::{ProtocolError, ProtocolResult};

/// Any JSON value. Case args and similar free-form payloads use this.
pub type JsonValue = serde_json::Value;

/// An ordered JSON object.
pub type Fields = serde_json::Map<String, JsonValue>;

/// Keys that an update never assigns or removes through its field map.
const RESERVED_FIELDS: [&str; 2] = ["id", "version"];

/// Kind of change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeOp {
    /// A full document.
    Insert,
    /// A partial field update.
    Update,
}

/// A full document for one entity.
#[derive(Debug, Clone, PartialEq)]
pub struct InsertChange {
    /// Target collection.
    pub collection: Collection,
    /// Entity id.
    pub id: String,
    /// The complete document, including `id` and `version`.
    pub doc: JsonValue,
}

impl InsertChange {
    /// Creates an insert change.
    pub fn new(collection: Collection, id: impl Into<String>, doc: JsonValue) -> Self {
        Self {
            collection,
            id: id.into(),
            doc,
        }
    }
}

/// A partial update for one entity.
#[derive(Debug, Clone, PartialEq)]
pub struct UpdateChange {
    /// Target collection.
    pub collection: Collection,
    /// Entity id.
    pub id: String,
    /// Version the entity has after this update.
    pub version: u64,
    /// Fields to assign. Never contains `version`.
    pub updated: Fields,
    /// Fields to remove after assignment, in order.
    pub deleted: Vec<String>,
}

impl UpdateChange {
    /// Creates an empty update that only bumps the version.
    pub fn new(collection: Collection, id: impl Into<String>, version: u64) -> Self {
        Self {
            collection,
            id: id.into(),
            version,
            updated: Fields::new(),
            deleted: Vec::new(),
        }
    }

    /// Builds an update from its wire form, where `version` lives inside the
    /// `updated` map.
    pub fn from_wire(
        collection: Collection,
        id: impl Into<String>,
        mut updated: Fields,
        deleted: Vec<String>,
    ) -> ProtocolResult<Self> {
        let id = id.into();
        let version = updated
            .remove("version")
            .and_then(|v| v.as_u64())
            .ok_or_else(|| ProtocolError::MissingVersion { id: id.clone() })?;
        Ok(Self {
            collection,
            id,
            version,
            updated,
            deleted,
        })
    }

    /// Returns the `updated` map in wire form, with `version` included.
    pub fn wire_fields(&self) -> Fields {
        let mut fields = self.updated.clone();
        fields.insert("version".into(), JsonValue::from(self.version));
        fields
    }

    /// Adds a field assignment.
    pub fn set(mut self, field: impl Into<String>, value: impl Into<JsonValue>) -> Self {
        self.updated.insert(field.into(), value.into());
        self
    }

    /// Adds a field removal.
    pub fn delete(mut self, field: impl Into<String>) -> Self {
        self.deleted.push(field.into());
        self
    }

    /// Folds two updates for the same entity into one.
    ///
    /// The result is the same whichever order the two arrive in: the elder
    /// (lower version) is overlaid by the newer field by field, the removal
    /// lists are joined elder-then-newer, and the newer version wins.
    /// A field the elder removes but the newer assigns again stays present,
    /// and a field both remove is listed once.
    pub fn merge(self, other: UpdateChange) -> UpdateChange {
        let (elder, newer) = if self.version <= other.version {
            (self, other)
        } else {
            (other, self)
        };

        let mut updated = elder.updated;
        for (field, value) in &newer.updated {
            updated.insert(field.clone(), value.clone());
        }

        let mut deleted: Vec<String> = elder
            .deleted
            .into_iter()
            .filter(|field| !newer.updated.contains_key(field) && !newer.deleted.contains(field))
            .collect();
        deleted.extend(newer.deleted);

        UpdateChange {
            collection: newer.collection,
            id: newer.id,
            version: newer.version,
            updated,
            deleted,
        }
    }

    /// Assigns `updated` then removes `deleted` on a field map.
    ///
    /// `id` and `version` are left alone; the caller owns the version.
    pub fn apply_fields(&self, fields: &mut Fields) {
        for (field, value) in &self.updated {
            if RESERVED_FIELDS.contains(&field.as_str()) {
                continue;
            }
            fields.insert(field.clone(), value.clone());
        }
        for field in &self.deleted {
            if RESERVED_FIELDS.contains(&field.as_str()) {
                continue;
            }
            fields.remove(field);
        }
    }
}

/// A change delivered by a snapshot page or the live feed.
#[derive(Debug, Clone, PartialEq)]
pub enum Change {
    /// Full document.
    Insert(InsertChange),
    /// Partial update.
    Update(UpdateChange),
}

impl Change {
    /// Returns the kind of change.
    pub fn op(&self) -> ChangeOp {
        match self {
            Change::Insert(_) => ChangeOp::Insert,
            Change::Update(_) => ChangeOp::Update,
        }
    }

    /// Returns the target collection.
    pub fn collection(&self) -> Collection {
        match self {
            Change::Insert(c) => c.collection,
            Change::Update(c) => c.collection,
        }
    }

    /// Returns the target entity id.
    pub fn id(&self) -> &str {
        match self {
            Change::Insert(c) => &c.id,
            Change::Update(c) => &c.id,
        }
    }
}
