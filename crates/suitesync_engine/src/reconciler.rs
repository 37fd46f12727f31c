//! Change reconciler.
//!
//! Applies inserts and updates to an [`EntityStore`]. Updates that arrive
//! before their entity are folded into a per-id pending slot and applied as
//! soon as the insert shows up.

use crate::store::EntityStore;
use std::collections::HashMap;
use suitesync_protocol::{ProtocolResult, Record, UpdateChange};
use tracing::{debug, warn};

/// Result of applying an insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// The entity was stored. `pending_applied` is true if a buffered update
    /// was applied on top of it.
    Inserted {
        /// Whether a pending update was drained.
        pending_applied: bool,
    },
    /// The held version was the same or newer; nothing changed.
    Stale,
}

/// Result of applying an update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// The update was applied.
    Applied,
    /// The held version was the same or newer; nothing changed.
    Stale,
    /// The entity is unknown; the update was buffered.
    Queued,
}

/// Reconciles inserts and updates for one collection.
#[derive(Debug, Clone)]
pub struct Reconciler<T: Record> {
    store: EntityStore<T>,
    pending: HashMap<String, UpdateChange>,
}

impl<T: Record> Reconciler<T> {
    /// Creates an empty reconciler.
    pub fn new() -> Self {
        Self {
            store: EntityStore::new(),
            pending: HashMap::new(),
        }
    }

    /// Read access to the underlying store.
    pub fn store(&self) -> &EntityStore<T> {
        &self.store
    }

    /// Applies a full entity.
    ///
    /// A stale insert (held version is the same or newer) is a no-op, so a
    /// re-delivered snapshot row cannot regress a live-updated entity.
    pub fn apply_insert(&mut self, entity: T) -> InsertOutcome {
        if let Some(held) = self.store.get(entity.id()) {
            if held.version() >= entity.version() {
                debug!(id = entity.id(), version = entity.version(), "stale insert dropped");
                return InsertOutcome::Stale;
            }
        }

        let mut entity = entity;
        let mut pending_applied = false;
        if let Some(update) = self.pending.remove(entity.id()) {
            if update.version > entity.version() {
                match entity.with_update(&update) {
                    Ok(updated) => {
                        entity = updated;
                        pending_applied = true;
                    }
                    Err(err) => {
                        warn!(id = %update.id, version = update.version, error = %err,
                            "dropping pending update that does not fit its entity");
                    }
                }
            }
        }

        self.store.upsert(entity);
        InsertOutcome::Inserted { pending_applied }
    }

    /// Applies a partial update.
    ///
    /// Fails only if the update cannot be applied to the typed entity (for
    /// example it removes a required field); the store is left unchanged.
    pub fn apply_update(&mut self, update: UpdateChange) -> ProtocolResult<UpdateOutcome> {
        let Some(held) = self.store.get(&update.id) else {
            debug!(id = %update.id, version = update.version, "update queued for unknown entity");
            let merged = match self.pending.remove(&update.id) {
                // A re-delivery of the update already held.
                Some(existing) if existing.version == update.version => existing,
                Some(existing) => existing.merge(update),
                None => update,
            };
            self.pending.insert(merged.id.clone(), merged);
            return Ok(UpdateOutcome::Queued);
        };

        if update.version <= held.version() {
            debug!(id = %update.id, version = update.version, held = held.version(),
                "stale update dropped");
            return Ok(UpdateOutcome::Stale);
        }

        let updated = held.with_update(&update)?;
        self.store.upsert(updated);
        Ok(UpdateOutcome::Applied)
    }

    /// Returns the buffered update for `id`, if any.
    pub fn pending(&self, id: &str) -> Option<&UpdateChange> {
        self.pending.get(id)
    }

    /// Returns the ids with buffered updates, sorted.
    pub fn pending_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.pending.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Returns the number of ids with buffered updates.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Discards the buffered update for `id`.
    pub fn drop_pending(&mut self, id: &str) -> Option<UpdateChange> {
        self.pending.remove(id)
    }

    /// Removes stored entities not matching `keep`. Returns how many went.
    pub fn retain(&mut self, mut keep: impl FnMut(&T) -> bool) -> usize {
        self.store.retain(|e| keep(e))
    }
}

impl<T: Record> Default for Reconciler<T> {
    fn default() -> Self {
        Self::new()
    }
}
