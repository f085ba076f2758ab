//! Byte codecs for user value and auxiliary types
//!
//! The engine never interprets values or auxiliary data beyond moving their
//! bytes around; codecs are the seam where user types are reduced to byte
//! sequences at enqueue time and restored at dispatch time. `AppendCodec`
//! adds the merge capability that `append_update` needs.

use std::collections::BTreeSet;

use crate::error::{DrumError, DrumResult};

/// Serialization contract for a user value or auxiliary type
pub trait ByteCodec: Send + Sync {
    /// The user type this codec handles
    type Item;

    /// Serialize an item to bytes
    fn to_bytes(&self, item: &Self::Item) -> DrumResult<Vec<u8>>;

    /// Deserialize an item from bytes
    fn from_bytes(&self, bytes: &[u8]) -> DrumResult<Self::Item>;
}

/// Merge capability for `append_update`
///
/// Only required if the caller uses `append_update`; plain codecs are
/// sufficient for the other three operations.
pub trait AppendCodec: ByteCodec {
    /// Merge an incoming value into the value currently stored
    fn merge(&self, existing: Self::Item, incoming: Self::Item) -> DrumResult<Self::Item>;
}

/// Identity codec for raw byte vectors
#[derive(Debug, Clone, Copy, Default)]
pub struct BytesCodec;

impl ByteCodec for BytesCodec {
    type Item = Vec<u8>;

    fn to_bytes(&self, item: &Vec<u8>) -> DrumResult<Vec<u8>> {
        Ok(item.clone())
    }

    fn from_bytes(&self, bytes: &[u8]) -> DrumResult<Vec<u8>> {
        Ok(bytes.to_vec())
    }
}

/// UTF-8 string codec
#[derive(Debug, Clone, Copy, Default)]
pub struct StringCodec;

impl ByteCodec for StringCodec {
    type Item = String;

    fn to_bytes(&self, item: &String) -> DrumResult<Vec<u8>> {
        Ok(item.as_bytes().to_vec())
    }

    fn from_bytes(&self, bytes: &[u8]) -> DrumResult<String> {
        String::from_utf8(bytes.to_vec())
            .map_err(|e| DrumError::Codec(format!("invalid UTF-8 value: {e}")))
    }
}

/// Codec for a sorted set of u64, merged by union
///
/// Encoding is the big-endian concatenation of the members in ascending
/// order, 8 bytes each.
#[derive(Debug, Clone, Copy, Default)]
pub struct U64SetCodec;

impl ByteCodec for U64SetCodec {
    type Item = BTreeSet<u64>;

    fn to_bytes(&self, item: &BTreeSet<u64>) -> DrumResult<Vec<u8>> {
        let mut buf = Vec::with_capacity(item.len() * 8);
        for member in item {
            buf.extend_from_slice(&member.to_be_bytes());
        }
        Ok(buf)
    }

    fn from_bytes(&self, bytes: &[u8]) -> DrumResult<BTreeSet<u64>> {
        if bytes.len() % 8 != 0 {
            return Err(DrumError::Codec(format!(
                "u64 set encoding has trailing {} bytes",
                bytes.len() % 8
            )));
        }
        let mut set = BTreeSet::new();
        for chunk in bytes.chunks_exact(8) {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(chunk);
            set.insert(u64::from_be_bytes(raw));
        }
        Ok(set)
    }
}

impl AppendCodec for U64SetCodec {
    fn merge(&self, mut existing: BTreeSet<u64>, incoming: BTreeSet<u64>) -> DrumResult<BTreeSet<u64>> {
        existing.extend(incoming);
        Ok(existing)
    }
}
