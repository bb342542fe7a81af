//! Secondary index from file identity to the file's cached block keys.
//!
//! Supports the evict-on-close path: dropping every cached block of one
//! data file without scanning the whole backing map. Kept consistent with
//! the backing map except during the brief windows of insert and evict.

use std::collections::BTreeSet;
use std::sync::Arc;

use dashmap::DashMap;

use crate::key::BlockKey;

/// `file -> ordered set of that file's cached keys`.
pub(crate) struct FileIndex {
    map: DashMap<Arc<str>, BTreeSet<BlockKey>, ahash::RandomState>,
}

impl FileIndex {
    pub(crate) fn new() -> Self {
        Self {
            map: DashMap::with_hasher(ahash::RandomState::new()),
        }
    }

    pub(crate) fn insert(&self, key: &BlockKey) {
        self.map
            .entry(key.file_arc().clone())
            .or_default()
            .insert(key.clone());
    }

    /// Remove one key; the file's entry goes with its last key.
    pub(crate) fn remove(&self, key: &BlockKey) {
        if let Some(mut set) = self.map.get_mut(key.file()) {
            set.remove(key);
        }
        self.map.remove_if(key.file(), |_, set| set.is_empty());
    }

    /// Snapshot of the file's keys in ascending offset order.
    pub(crate) fn keys_for_file(&self, file: &str) -> Vec<BlockKey> {
        self.map
            .get(file)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    #[cfg(test)]
    fn file_count(&self) -> usize {
        self.map.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_and_snapshot_ordered() {
        let index = FileIndex::new();
        index.insert(&BlockKey::new("f", 8192));
        index.insert(&BlockKey::new("f", 0));
        index.insert(&BlockKey::new("f", 4096));
        index.insert(&BlockKey::new("g", 100));

        let keys = index.keys_for_file("f");
        let offsets: Vec<u64> = keys.iter().map(|k| k.offset()).collect();
        assert_eq!(offsets, vec![0, 4096, 8192]);
        assert_eq!(index.keys_for_file("g").len(), 1);
        assert!(index.keys_for_file("missing").is_empty());
    }

    #[test]
    fn test_remove_drops_empty_file_entry() {
        let index = FileIndex::new();
        let a = BlockKey::new("f", 0);
        let b = BlockKey::new("f", 4096);
        index.insert(&a);
        index.insert(&b);
        assert_eq!(index.file_count(), 1);

        index.remove(&a);
        assert_eq!(index.file_count(), 1);
        index.remove(&b);
        assert_eq!(index.file_count(), 0);
    }

    #[test]
    fn test_remove_missing_is_noop() {
        let index = FileIndex::new();
        index.remove(&BlockKey::new("f", 0));
        assert_eq!(index.file_count(), 0);
    }

    #[test]
    fn test_duplicate_insert_is_noop() {
        let index = FileIndex::new();
        let key = BlockKey::new("f", 0);
        index.insert(&key);
        index.insert(&key);
        assert_eq!(index.keys_for_file("f").len(), 1);
    }
}
