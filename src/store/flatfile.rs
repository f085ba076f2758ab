//! Default sorted flat-file store
//!
//! One file of `[key:8 BE][len:4 BE][value]` records in ascending key
//! order, plus an in-memory offset index rebuilt at open. `get` is a
//! binary search over the index; `merge` streams the old file and the
//! incoming keys two-pointer style into a temp file and renames it over
//! the store, so a crash mid-merge leaves the previous generation intact.

use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::{DrumError, DrumResult};
use crate::store::{MergeOutcome, MergeResolver, SortedStore};

const RECORD_HEADER_SIZE: u64 = 12;

#[derive(Debug, Clone, Copy)]
struct IndexEntry {
    key: u64,
    /// Offset of the value bytes
    offset: u64,
    len: u32,
}

/// Sorted flat-file store
pub struct FlatFileStore {
    path: PathBuf,
    file: File,
    index: Vec<IndexEntry>,
}

impl FlatFileStore {
    /// Open or create the store file at `path`
    pub fn open(path: impl Into<PathBuf>) -> DrumResult<Self> {
        let path = path.into();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;
        let index = build_index(&path)?;
        debug!(path = %path.display(), keys = index.len(), "opened flat-file store");
        Ok(Self { path, file, index })
    }

    /// Number of keys currently stored
    pub fn key_count(&self) -> usize {
        self.index.len()
    }

    fn tmp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

impl SortedStore for FlatFileStore {
    fn get(&mut self, key: u64) -> DrumResult<Option<Vec<u8>>> {
        let idx = match self.index.binary_search_by_key(&key, |e| e.key) {
            Ok(idx) => idx,
            Err(_) => return Ok(None),
        };
        let entry = self.index[idx];
        self.file.seek(SeekFrom::Start(entry.offset))?;
        let mut value = vec![0u8; entry.len as usize];
        self.file.read_exact(&mut value)?;
        Ok(Some(value))
    }

    fn put(&mut self, key: u64, value: &[u8]) -> DrumResult<()> {
        struct PutResolver<'a>(&'a [u8]);
        impl MergeResolver for PutResolver<'_> {
            fn resolve(&mut self, _key: u64, _existing: Option<&[u8]>) -> MergeOutcome {
                MergeOutcome::Put(self.0.to_vec())
            }
        }
        self.merge(&[key], &mut PutResolver(value))
    }

    fn merge(&mut self, keys: &[u64], resolver: &mut dyn MergeResolver) -> DrumResult<()> {
        debug_assert!(keys.windows(2).all(|w| w[0] < w[1]));

        let tmp_path = self.tmp_path();
        let mut reader = RecordReader::new(BufReader::new(File::open(&self.path)?));
        let mut writer = GenerationWriter::new(BufWriter::new(File::create(&tmp_path)?));

        let mut old = reader.next()?;
        for &key in keys {
            while let Some((old_key, value)) = old.take() {
                if old_key < key {
                    writer.write_record(old_key, &value)?;
                    old = reader.next()?;
                } else {
                    old = Some((old_key, value));
                    break;
                }
            }
            let existing = match &old {
                Some((old_key, value)) if *old_key == key => Some(value.as_slice()),
                _ => None,
            };
            match resolver.resolve(key, existing) {
                MergeOutcome::Put(value) => writer.write_record(key, &value)?,
                MergeOutcome::Keep => {
                    if let Some(value) = existing {
                        writer.write_record(key, value)?;
                    }
                }
            }
            if existing.is_some() {
                old = reader.next()?;
            }
        }
        while let Some((old_key, value)) = old.take() {
            writer.write_record(old_key, &value)?;
            old = reader.next()?;
        }

        let index = writer.finish()?;
        drop(reader);
        fs::rename(&tmp_path, &self.path)?;
        self.file = OpenOptions::new().read(true).write(true).open(&self.path)?;
        self.index = index;
        debug!(path = %self.path.display(), keys = self.index.len(), merged = keys.len(), "flat-file store generation swapped");
        Ok(())
    }
}

struct RecordReader<R: Read> {
    reader: R,
    offset: u64,
}

impl<R: Read> RecordReader<R> {
    fn new(reader: R) -> Self {
        Self { reader, offset: 0 }
    }

    fn next(&mut self) -> DrumResult<Option<(u64, Vec<u8>)>> {
        let mut header = [0u8; RECORD_HEADER_SIZE as usize];
        let filled = read_full(&mut self.reader, &mut header)?;
        if filled == 0 {
            return Ok(None);
        }
        if filled < header.len() {
            return Err(DrumError::Store(format!(
                "truncated record header at offset {}",
                self.offset
            )));
        }
        let key = u64::from_be_bytes([
            header[0], header[1], header[2], header[3], header[4], header[5], header[6], header[7],
        ]);
        let len = u32::from_be_bytes([header[8], header[9], header[10], header[11]]) as usize;
        let mut value = vec![0u8; len];
        if read_full(&mut self.reader, &mut value)? < len {
            return Err(DrumError::Store(format!(
                "truncated value for key {key} at offset {}",
                self.offset
            )));
        }
        self.offset += RECORD_HEADER_SIZE + len as u64;
        Ok(Some((key, value)))
    }
}

struct GenerationWriter<W: Write> {
    writer: W,
    offset: u64,
    index: Vec<IndexEntry>,
}

impl GenerationWriter<BufWriter<File>> {
    fn new(writer: BufWriter<File>) -> Self {
        Self {
            writer,
            offset: 0,
            index: Vec::new(),
        }
    }

    fn write_record(&mut self, key: u64, value: &[u8]) -> DrumResult<()> {
        self.writer.write_all(&key.to_be_bytes())?;
        self.writer.write_all(&(value.len() as u32).to_be_bytes())?;
        self.writer.write_all(value)?;
        self.index.push(IndexEntry {
            key,
            offset: self.offset + RECORD_HEADER_SIZE,
            len: value.len() as u32,
        });
        self.offset += RECORD_HEADER_SIZE + value.len() as u64;
        Ok(())
    }

    fn finish(mut self) -> DrumResult<Vec<IndexEntry>> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;
        Ok(self.index)
    }
}

fn build_index(path: &Path) -> DrumResult<Vec<IndexEntry>> {
    let mut reader = RecordReader::new(BufReader::new(File::open(path)?));
    let mut index = Vec::new();
    let mut offset = 0u64;
    while let Some((key, value)) = reader.next()? {
        index.push(IndexEntry {
            key,
            offset: offset + RECORD_HEADER_SIZE,
            len: value.len() as u32,
        });
        offset += RECORD_HEADER_SIZE + value.len() as u64;
    }
    Ok(index)
}

fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> DrumResult<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;
    use crate::store::test_support::MapResolver;

    #[test]
    fn test_empty_store_misses() {
        let dir = tempdir().unwrap();
        let mut store = FlatFileStore::open(dir.path().join("cache.db")).unwrap();
        assert_eq!(store.get(1).unwrap(), None);
        assert_eq!(store.key_count(), 0);
    }

    #[test]
    fn test_merge_inserts_in_order() {
        let dir = tempdir().unwrap();
        let mut store = FlatFileStore::open(dir.path().join("cache.db")).unwrap();
        let mut resolver = MapResolver::new(vec![
            (2, MergeOutcome::Put(b"two".to_vec())),
            (8, MergeOutcome::Put(b"eight".to_vec())),
        ]);
        store.merge(&[2, 8], &mut resolver).unwrap();
        assert_eq!(store.get(2).unwrap(), Some(b"two".to_vec()));
        assert_eq!(store.get(8).unwrap(), Some(b"eight".to_vec()));
        assert_eq!(store.get(5).unwrap(), None);
    }

    #[test]
    fn test_merge_interleaves_with_existing() {
        let dir = tempdir().unwrap();
        let mut store = FlatFileStore::open(dir.path().join("cache.db")).unwrap();
        store.put(3, b"three").unwrap();
        store.put(7, b"seven").unwrap();

        let mut resolver = MapResolver::new(vec![
            (1, MergeOutcome::Put(b"one".to_vec())),
            (3, MergeOutcome::Put(b"THREE".to_vec())),
            (5, MergeOutcome::Keep),
            (9, MergeOutcome::Put(b"nine".to_vec())),
        ]);
        store.merge(&[1, 3, 5, 9], &mut resolver).unwrap();

        // resolver saw the stored value for 3, nothing for the misses
        assert_eq!(resolver.seen[1], (3, Some(b"three".to_vec())));
        assert_eq!(resolver.seen[2], (5, None));

        // 7 was carried through untouched
        assert_eq!(store.get(1).unwrap(), Some(b"one".to_vec()));
        assert_eq!(store.get(3).unwrap(), Some(b"THREE".to_vec()));
        assert_eq!(store.get(5).unwrap(), None);
        assert_eq!(store.get(7).unwrap(), Some(b"seven".to_vec()));
        assert_eq!(store.get(9).unwrap(), Some(b"nine".to_vec()));
        assert_eq!(store.key_count(), 4);
    }

    #[test]
    fn test_contents_survive_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cache.db");
        {
            let mut store = FlatFileStore::open(&path).unwrap();
            store.put(42, b"answer").unwrap();
        }
        let mut store = FlatFileStore::open(&path).unwrap();
        assert_eq!(store.get(42).unwrap(), Some(b"answer".to_vec()));
    }

    #[test]
    fn test_zero_length_value_roundtrip() {
        let dir = tempdir().unwrap();
        let mut store = FlatFileStore::open(dir.path().join("cache.db")).unwrap();
        store.put(1, b"").unwrap();
        assert_eq!(store.get(1).unwrap(), Some(Vec::new()));
    }

    #[test]
    fn test_randomized_merges_match_model() {
        use std::collections::BTreeMap;

        use rand::rngs::StdRng;
        use rand::{Rng, SeedableRng};

        let dir = tempdir().unwrap();
        let mut store = FlatFileStore::open(dir.path().join("cache.db")).unwrap();
        let mut model: BTreeMap<u64, Vec<u8>> = BTreeMap::new();
        let mut rng = StdRng::seed_from_u64(7);

        for _ in 0..20 {
            let mut batch: Vec<(u64, Vec<u8>)> = (0..20)
                .map(|_| {
                    let key = rng.gen_range(0..500u64);
                    let len = rng.gen_range(0..32usize);
                    let value: Vec<u8> = (0..len).map(|_| rng.gen()).collect();
                    (key, value)
                })
                .collect();
            batch.sort_by_key(|(key, _)| *key);
            batch.dedup_by_key(|(key, _)| *key);

            let keys: Vec<u64> = batch.iter().map(|(key, _)| *key).collect();
            let outcomes = batch
                .iter()
                .map(|(key, value)| (*key, MergeOutcome::Put(value.clone())))
                .collect();
            for (key, value) in &batch {
                model.insert(*key, value.clone());
            }
            store.merge(&keys, &mut MapResolver::new(outcomes)).unwrap();
        }

        for key in 0..500u64 {
            assert_eq!(store.get(key).unwrap(), model.get(&key).cloned());
        }
        assert_eq!(store.key_count(), model.len());
    }
}
