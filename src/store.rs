//! Entity lifecycle notifications.
//!
//! The model announces every created and deleted entity to a [`Store`] so a
//! persistence or replication layer can track the live object set without
//! the model knowing about it.

use std::collections::{BTreeSet, HashMap};
use std::sync::Mutex;

use log::trace;

/// The kinds of entities whose lifecycle is announced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    Node,
    Edge,
    Segment,
    BlockPoint,
    Vehicle,
    Scope,
    Balise,
}

/// Receiver for entity lifecycle events.
pub trait Store: Send + Sync {
    fn notify_created(&self, kind: EntityKind, id: usize);
    fn notify_deleted(&self, kind: EntityKind, id: usize);
    /// All currently live ids of a kind, in ascending order.
    fn enumerate(&self, kind: EntityKind) -> Vec<usize>;
}

/// In-memory [`Store`] that just keeps the live id sets.
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<EntityKind, BTreeSet<usize>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Store for MemoryStore {
    fn notify_created(&self, kind: EntityKind, id: usize) {
        trace!("created {:?} {}", kind, id);
        let mut entries = self.entries.lock().unwrap();
        entries.entry(kind).or_default().insert(id);
    }

    fn notify_deleted(&self, kind: EntityKind, id: usize) {
        trace!("deleted {:?} {}", kind, id);
        let mut entries = self.entries.lock().unwrap();
        entries.entry(kind).or_default().remove(&id);
    }

    fn enumerate(&self, kind: EntityKind) -> Vec<usize> {
        let entries = self.entries.lock().unwrap();
        entries
            .get(&kind)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_store_tracks_live_ids() {
        let store = MemoryStore::new();
        store.notify_created(EntityKind::Node, 3);
        store.notify_created(EntityKind::Node, 1);
        store.notify_created(EntityKind::Edge, 2);
        store.notify_deleted(EntityKind::Node, 3);

        assert_eq!(store.enumerate(EntityKind::Node), vec![1]);
        assert_eq!(store.enumerate(EntityKind::Edge), vec![2]);
        assert!(store.enumerate(EntityKind::Scope).is_empty());
    }
}
