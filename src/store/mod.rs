//! Backing sorted store contract
//!
//! The store is exclusively owned by the merger. Its defining capability
//! is the bulk `merge`: a single walk over the stored keys in ascending
//! order that lets the merger interleave reads and writes for an ascending
//! stream of input keys, which is the access pattern the whole engine
//! exists to produce.

mod flatfile;
mod memory;

pub use flatfile::FlatFileStore;
pub use memory::MemoryStore;

use crate::error::DrumResult;

/// Decision returned by a [`MergeResolver`] for one input key
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome {
    /// Store this value for the key (insert or overwrite)
    Put(Vec<u8>),
    /// Leave the key untouched
    Keep,
}

/// Per-key callback driven by [`SortedStore::merge`]
pub trait MergeResolver {
    /// Called once per input key, in ascending key order, with the stored
    /// value if the key is present
    fn resolve(&mut self, key: u64, existing: Option<&[u8]>) -> MergeOutcome;
}

/// A sorted `u64 -> bytes` map supporting one-pass bulk merge
pub trait SortedStore: Send {
    /// Point lookup
    fn get(&mut self, key: u64) -> DrumResult<Option<Vec<u8>>>;

    /// Point insert/overwrite
    fn put(&mut self, key: u64, value: &[u8]) -> DrumResult<()>;

    /// Walk the store once in ascending key order, resolving each key in
    /// `keys` against the current contents
    ///
    /// `keys` must be strictly ascending. Keys not mentioned are carried
    /// through unchanged.
    fn merge(&mut self, keys: &[u64], resolver: &mut dyn MergeResolver) -> DrumResult<()>;
}
