//! Lock-free flipping buffer
//!
//! Producers publish operations by building a new immutable snapshot (the
//! old entries plus the new one, with updated byte sums) and installing it
//! with a compare-and-swap; the writer drains by swapping in an empty
//! snapshot. Every snapshot is a fresh allocation, so there is no ABA
//! hazard, and retired snapshots are reclaimed through an epoch guard
//! because a racing producer may still be reading one it lost a CAS on.

use std::sync::atomic::Ordering;

use crossbeam_epoch::{self as epoch, Atomic, Owned};

use crate::entry::InMemoryEntry;

/// An immutable accumulation snapshot for one bucket
///
/// Invariant: `key_bytes`, `val_bytes` and `aux_bytes` equal the summed
/// byte lengths over `entries`. Entry positions are dense indexes into
/// `entries` and reset whenever the buffer is flipped.
#[derive(Debug, Clone, Default)]
pub struct BucketBuffer {
    pub entries: Vec<InMemoryEntry>,
    pub key_bytes: u64,
    pub val_bytes: u64,
    pub aux_bytes: u64,
}

impl BucketBuffer {
    fn appended(&self, mut entry: InMemoryEntry) -> BucketBuffer {
        entry.position = self.entries.len() as u32;
        let key_bytes = self.key_bytes + 8;
        let val_bytes = self.val_bytes + entry.value_len();
        let aux_bytes = self.aux_bytes + entry.aux_len();

        let mut entries = Vec::with_capacity(self.entries.len() + 1);
        entries.extend_from_slice(&self.entries);
        entries.push(entry);

        BucketBuffer {
            entries,
            key_bytes,
            val_bytes,
            aux_bytes,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Fill level of the snapshot a producer just published
#[derive(Debug, Clone, Copy)]
pub struct FillLevel {
    pub entries: usize,
    pub key_bytes: u64,
    pub val_bytes: u64,
    pub aux_bytes: u64,
}

/// Atomically-swappable holder of the current [`BucketBuffer`]
pub(crate) struct FlippingContainer {
    current: Atomic<BucketBuffer>,
}

impl FlippingContainer {
    pub fn new() -> Self {
        Self {
            current: Atomic::new(BucketBuffer::default()),
        }
    }

    /// Publish one entry, retrying the CAS until it wins
    ///
    /// Returns the fill level of the snapshot that was installed. The
    /// entry's position is assigned from the snapshot it lands in.
    pub fn append(&self, entry: InMemoryEntry) -> FillLevel {
        let guard = epoch::pin();
        loop {
            let shared = self.current.load(Ordering::Acquire, &guard);
            let cur = unsafe { shared.deref() };
            let candidate = cur.appended(entry.clone());
            let fill = FillLevel {
                entries: candidate.entries.len(),
                key_bytes: candidate.key_bytes,
                val_bytes: candidate.val_bytes,
                aux_bytes: candidate.aux_bytes,
            };
            match self.current.compare_exchange(
                shared,
                Owned::new(candidate),
                Ordering::AcqRel,
                Ordering::Acquire,
                &guard,
            ) {
                Ok(_) => {
                    unsafe { guard.defer_destroy(shared) };
                    return fill;
                }
                Err(_) => continue,
            }
        }
    }

    /// Swap in an empty buffer and return the displaced one
    ///
    /// An empty drain returns an empty buffer.
    pub fn flip(&self) -> BucketBuffer {
        let guard = epoch::pin();
        let old = self
            .current
            .swap(Owned::new(BucketBuffer::default()), Ordering::AcqRel, &guard);
        // A producer that lost a CAS against this snapshot may still hold a
        // reference under its own pin, so the snapshot is cloned out and
        // destruction deferred.
        let drained = unsafe { old.deref() }.clone();
        unsafe { guard.defer_destroy(old) };
        drained
    }

    pub fn is_empty(&self) -> bool {
        let guard = epoch::pin();
        let shared = self.current.load(Ordering::Acquire, &guard);
        unsafe { shared.deref() }.is_empty()
    }
}

impl Drop for FlippingContainer {
    fn drop(&mut self) {
        // &mut self guarantees no concurrent accessors remain.
        unsafe {
            let guard = epoch::unprotected();
            let shared = self.current.load(Ordering::Relaxed, guard);
            if !shared.is_null() {
                drop(shared.into_owned());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use super::*;
    use crate::entry::Operation;

    fn entry(key: u64, value: &[u8]) -> InMemoryEntry {
        InMemoryEntry::new(Operation::Update, key, Some(value.to_vec()), None)
    }

    #[test]
    fn test_append_assigns_dense_positions() {
        let container = FlippingContainer::new();
        for key in 0..10 {
            container.append(entry(key, b"v"));
        }
        let buffer = container.flip();
        assert_eq!(buffer.len(), 10);
        for (i, e) in buffer.entries.iter().enumerate() {
            assert_eq!(e.position, i as u32);
        }
    }

    #[test]
    fn test_byte_sums_track_entries() {
        let container = FlippingContainer::new();
        container.append(entry(1, b"abc"));
        container.append(InMemoryEntry::new(
            Operation::Check,
            2,
            None,
            Some(vec![1, 2]),
        ));
        let buffer = container.flip();
        assert_eq!(buffer.key_bytes, 16);
        assert_eq!(buffer.val_bytes, 3);
        assert_eq!(buffer.aux_bytes, 2);
    }

    #[test]
    fn test_flip_resets_positions() {
        let container = FlippingContainer::new();
        container.append(entry(1, b"a"));
        container.append(entry(2, b"b"));
        container.flip();
        container.append(entry(3, b"c"));
        let buffer = container.flip();
        assert_eq!(buffer.entries[0].position, 0);
    }

    #[test]
    fn test_empty_flip_returns_empty_buffer() {
        let container = FlippingContainer::new();
        let buffer = container.flip();
        assert!(buffer.is_empty());
        assert_eq!(buffer.key_bytes, 0);
    }

    #[test]
    fn test_concurrent_producers_lose_no_entries() {
        let container = Arc::new(FlippingContainer::new());
        let mut handles = Vec::new();
        for t in 0..4u64 {
            let container = Arc::clone(&container);
            handles.push(thread::spawn(move || {
                for i in 0..250u64 {
                    container.append(entry(t * 1000 + i, b"x"));
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        let buffer = container.flip();
        assert_eq!(buffer.len(), 1000);
        let mut positions: Vec<u32> = buffer.entries.iter().map(|e| e.position).collect();
        positions.sort_unstable();
        assert_eq!(positions, (0..1000u32).collect::<Vec<_>>());
    }

    #[test]
    fn test_concurrent_flips_partition_entries() {
        let container = Arc::new(FlippingContainer::new());
        let producer = {
            let container = Arc::clone(&container);
            thread::spawn(move || {
                for i in 0..500u64 {
                    container.append(entry(i, b"x"));
                }
            })
        };
        let mut total = 0usize;
        for _ in 0..50 {
            total += container.flip().len();
        }
        producer.join().unwrap();
        total += container.flip().len();
        assert_eq!(total, 500);
    }
}
