//! In-memory sorted store
//!
//! A `BTreeMap`-backed store for tests and key sets small enough to live
//! in memory. Volatile: contents are lost when the engine goes away.

use std::collections::BTreeMap;

use crate::error::DrumResult;
use crate::store::{MergeOutcome, MergeResolver, SortedStore};

/// Volatile `BTreeMap` store
#[derive(Debug, Default)]
pub struct MemoryStore {
    data: BTreeMap<u64, Vec<u8>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl SortedStore for MemoryStore {
    fn get(&mut self, key: u64) -> DrumResult<Option<Vec<u8>>> {
        Ok(self.data.get(&key).cloned())
    }

    fn put(&mut self, key: u64, value: &[u8]) -> DrumResult<()> {
        self.data.insert(key, value.to_vec());
        Ok(())
    }

    fn merge(&mut self, keys: &[u64], resolver: &mut dyn MergeResolver) -> DrumResult<()> {
        debug_assert!(keys.windows(2).all(|w| w[0] < w[1]));
        for &key in keys {
            let existing = self.data.get(&key).cloned();
            match resolver.resolve(key, existing.as_deref()) {
                MergeOutcome::Put(value) => {
                    self.data.insert(key, value);
                }
                MergeOutcome::Keep => {}
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::test_support::MapResolver;

    #[test]
    fn test_put_get() {
        let mut store = MemoryStore::new();
        store.put(1, b"one").unwrap();
        assert_eq!(store.get(1).unwrap(), Some(b"one".to_vec()));
        assert_eq!(store.get(2).unwrap(), None);
    }

    #[test]
    fn test_merge_sees_existing_values() {
        let mut store = MemoryStore::new();
        store.put(5, b"old").unwrap();
        let mut resolver = MapResolver::new(vec![
            (3, MergeOutcome::Put(b"new3".to_vec())),
            (5, MergeOutcome::Put(b"new5".to_vec())),
            (9, MergeOutcome::Keep),
        ]);
        store.merge(&[3, 5, 9], &mut resolver).unwrap();
        assert_eq!(
            resolver.seen,
            vec![(3, None), (5, Some(b"old".to_vec())), (9, None)]
        );
        assert_eq!(store.get(3).unwrap(), Some(b"new3".to_vec()));
        assert_eq!(store.get(5).unwrap(), Some(b"new5".to_vec()));
        assert_eq!(store.get(9).unwrap(), None);
    }
}
