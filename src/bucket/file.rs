//! Bucket file pair
//!
//! Each bucket owns two append-only scratch files, `bucket<i>.kv` and
//! `bucket<i>.aux`, written by the bucket's disk writer and read back and
//! rewound by the merger. All access goes through one mutex around the
//! whole [`BucketFile`]; the cumulative byte counters define the valid
//! prefix of each file (a rewind does not truncate, subsequent batches
//! simply overwrite).

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tracing::trace;

use crate::bucket::record::{self, AuxRecord, KvRecord};
use crate::entry::InMemoryEntry;
use crate::error::{DrumError, DrumResult};

/// Contents of a bucket file pair, read back for a merge pass
pub(crate) struct BucketContents {
    /// kv records in file order; `position` is the record's index here
    pub records: Vec<KvRecord>,
    /// Raw kv bytes; `KvRecord` value offsets index into this
    pub kv_slab: Vec<u8>,
    /// Aux records, position-parallel with `records`
    pub aux_records: Vec<AuxRecord>,
    /// Raw aux bytes
    pub aux_slab: Vec<u8>,
}

/// One bucket's kv/aux file pair plus its byte counters
pub(crate) struct BucketFile {
    bucket: usize,
    kv_path: PathBuf,
    kv: File,
    aux: File,
    kv_bytes_written: u64,
    aux_bytes_written: u64,
}

impl BucketFile {
    /// Create (truncating any stale scratch content) the pair for `bucket`
    pub fn create(dir: &Path, bucket: usize) -> DrumResult<Self> {
        let kv_path = dir.join(format!("bucket{bucket}.kv"));
        let aux_path = dir.join(format!("bucket{bucket}.aux"));
        let kv = open_scratch(&kv_path)?;
        let aux = open_scratch(&aux_path)?;
        Ok(Self {
            bucket,
            kv_path,
            kv,
            aux,
            kv_bytes_written: 0,
            aux_bytes_written: 0,
        })
    }

    pub fn kv_bytes_written(&self) -> u64 {
        self.kv_bytes_written
    }

    pub fn aux_bytes_written(&self) -> u64 {
        self.aux_bytes_written
    }

    /// Whether either cumulative counter has crossed the merge threshold
    pub fn exceeds(&self, threshold: u64) -> bool {
        self.kv_bytes_written > threshold || self.aux_bytes_written > threshold
    }

    /// Append a drained batch, one record pair per entry
    pub fn append_batch(&mut self, entries: &[InMemoryEntry]) -> DrumResult<()> {
        for entry in entries {
            let kv_start = self.kv.stream_position()?;
            let aux_start = self.aux.stream_position()?;

            self.kv
                .write_all(&record::encode_kv(entry.op, entry.key, entry.value.as_deref()))?;
            self.aux
                .write_all(&record::encode_aux(entry.aux.as_deref()))?;

            let kv_written = self.kv.stream_position()? - kv_start;
            let aux_written = self.aux.stream_position()? - aux_start;
            self.kv_bytes_written += kv_written;
            self.aux_bytes_written += aux_written;

            trace!(
                bucket = self.bucket,
                key = entry.key,
                op = ?entry.op,
                kv_written,
                aux_written,
                "fed bucket record"
            );
        }
        Ok(())
    }

    /// Read back the valid prefix of both files
    ///
    /// The write cursors are restored afterwards so a failed merge leaves
    /// the pair exactly as it was.
    pub fn read_back(&mut self) -> DrumResult<BucketContents> {
        let kv_slab = read_prefix(&mut self.kv, self.kv_bytes_written)?;
        let aux_slab = read_prefix(&mut self.aux, self.aux_bytes_written)?;

        let mut records = Vec::new();
        let mut offset = 0usize;
        while offset < kv_slab.len() {
            let rec = record::decode_kv(&kv_slab, offset)?;
            offset += rec.encoded_size();
            records.push(rec);
        }

        let mut aux_records = Vec::new();
        let mut offset = 0usize;
        while offset < aux_slab.len() {
            let rec = record::decode_aux(&aux_slab, offset)?;
            offset += rec.encoded_size();
            aux_records.push(rec);
        }

        if records.len() != aux_records.len() {
            return Err(DrumError::Codec(format!(
                "bucket {} file pair out of step: {} kv records vs {} aux records",
                self.bucket,
                records.len(),
                aux_records.len()
            )));
        }

        Ok(BucketContents {
            records,
            kv_slab,
            aux_records,
            aux_slab,
        })
    }

    /// Rewind both files and zero the counters
    pub fn reset(&mut self) -> DrumResult<()> {
        self.kv.seek(SeekFrom::Start(0))?;
        self.aux.seek(SeekFrom::Start(0))?;
        self.kv_bytes_written = 0;
        self.aux_bytes_written = 0;
        trace!(bucket = self.bucket, path = %self.kv_path.display(), "bucket files rewound");
        Ok(())
    }
}

fn open_scratch(path: &Path) -> DrumResult<File> {
    Ok(OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)?)
}

/// Read the first `len` bytes of `file`, restoring its cursor on every
/// path so a failed read leaves the writer's position untouched
fn read_prefix(file: &mut File, len: u64) -> DrumResult<Vec<u8>> {
    let restore = file.stream_position()?;
    file.seek(SeekFrom::Start(0))?;
    let mut buf = vec![0u8; len as usize];
    let read = file.read_exact(&mut buf);
    file.seek(SeekFrom::Start(restore))?;
    read?;
    Ok(buf)
}
