//! Per-field chunk bookkeeping and the on-disk record envelope.

use serde::{Deserialize, Serialize};

/// Bookkeeping for one bulk field, stored inside the owning entity's
/// metadata. The chunk count here is the authoritative source of truth: a
/// chunk is never read or written without consulting it first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldManifest {
    /// Number of chunk records on disk, contiguous from index 0.
    pub chunk_count: u32,
    /// Items per full chunk; only the last chunk may hold fewer.
    pub capacity: u32,
    /// Total items across all chunks as of the last metadata write. May lag
    /// the tail chunk by up to `capacity - 1` items between metadata writes.
    pub item_count: u64,
}

impl FieldManifest {
    #[must_use]
    pub fn empty(capacity: u32) -> Self {
        Self {
            chunk_count: 0,
            capacity,
            item_count: 0,
        }
    }

    /// Index of the tail chunk, if any chunk exists.
    #[must_use]
    pub fn tail_chunk(&self) -> Option<u32> {
        self.chunk_count.checked_sub(1)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.chunk_count == 0
    }
}

/// Compression applied to an envelope payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkEncoding {
    Plain,
    Zstd,
    Lz4,
}

/// Checksummed wrapper around every chunk, metadata, and index record on
/// disk. The checksum covers the encoded (possibly compressed) payload so
/// torn or bit-rotted records are detected before deserialization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordEnvelope {
    pub version: u16,
    pub encoding: ChunkEncoding,
    pub checksum: [u8; 32],
    pub payload: Vec<u8>,
}
