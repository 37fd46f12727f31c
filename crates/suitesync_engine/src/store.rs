//! Per-collection entity store.

use std::collections::HashMap;
use suitesync_protocol::{Record, SoftDelete};

/// Latest known version of every entity in one collection.
///
/// The store never lets a version go backwards: `upsert` only replaces an
/// entity with a strictly newer one.
#[derive(Debug, Clone)]
pub struct EntityStore<T: Record> {
    entities: HashMap<String, T>,
}

impl<T: Record> EntityStore<T> {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self {
            entities: HashMap::new(),
        }
    }

    /// Stores `entity` if it is new or newer than the held version.
    ///
    /// Returns true if the store changed.
    pub fn upsert(&mut self, entity: T) -> bool {
        match self.entities.get(entity.id()) {
            Some(held) if held.version() >= entity.version() => false,
            _ => {
                self.entities.insert(entity.id().to_string(), entity);
                true
            }
        }
    }

    /// Gets an entity by id.
    pub fn get(&self, id: &str) -> Option<&T> {
        self.entities.get(id)
    }

    /// Checks if an entity exists.
    pub fn contains(&self, id: &str) -> bool {
        self.entities.contains_key(id)
    }

    /// Removes an entity.
    pub fn remove(&mut self, id: &str) -> Option<T> {
        self.entities.remove(id)
    }

    /// Returns every entity in listing order.
    pub fn list_all(&self) -> Vec<T> {
        self.list_where(|_| true)
    }

    /// Returns matching entities in listing order.
    pub fn list_where(&self, mut predicate: impl FnMut(&T) -> bool) -> Vec<T> {
        let mut entities: Vec<T> = self
            .entities
            .values()
            .filter(|e| predicate(e))
            .cloned()
            .collect();
        entities.sort_by(|a, b| a.listing_cmp(b));
        entities
    }

    /// Keeps only entities matching `keep`. Returns how many were purged.
    pub fn retain(&mut self, mut keep: impl FnMut(&T) -> bool) -> usize {
        let before = self.entities.len();
        self.entities.retain(|_, e| keep(e));
        before - self.entities.len()
    }

    /// Returns the number of entities.
    pub fn len(&self) -> usize {
        self.entities.len()
    }

    /// Returns true if the store is empty.
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }
}

impl<T: Record + SoftDelete> EntityStore<T> {
    /// Returns entities that are not soft-deleted, in listing order.
    pub fn list_active(&self) -> Vec<T> {
        self.list_where(|e| !e.is_deleted())
    }
}

impl<T: Record> Default for EntityStore<T> {
    fn default() -> Self {
        Self::new()
    }
}
