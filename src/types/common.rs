//! Identifiers and small shared value types.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Stable entity identifier supplied by the host (a session id).
pub type EntityId = uuid::Uuid;

/// Content address of a stored blob: a blake3 digest over its bytes.
///
/// The digest doubles as the integrity checksum; two blobs with identical
/// content always share one digest and one stored copy.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlobDigest([u8; 32]);

impl BlobDigest {
    #[must_use]
    pub fn of(bytes: &[u8]) -> Self {
        Self(*blake3::hash(bytes).as_bytes())
    }

    #[must_use]
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// First two hex characters, used to shard the blob namespace so no
    /// single directory accumulates every blob.
    #[must_use]
    pub fn shard(&self) -> String {
        hex::encode(&self.0[..1])
    }

    pub fn parse_hex(text: &str) -> Option<Self> {
        let raw = hex::decode(text).ok()?;
        let bytes: [u8; 32] = raw.try_into().ok()?;
        Some(Self(bytes))
    }
}

impl fmt::Display for BlobDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for BlobDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlobDigest({})", self.to_hex())
    }
}

/// Disk capacity snapshot for the filesystem holding the storage root.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiskSpaceInfo {
    pub total: u64,
    pub available: u64,
    pub used: u64,
    /// Available space in MB, precomputed for display surfaces.
    pub available_mb: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_is_content_derived() {
        let a = BlobDigest::of(b"same bytes");
        let b = BlobDigest::of(b"same bytes");
        let c = BlobDigest::of(b"other bytes");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn hex_roundtrip_and_shard() {
        let digest = BlobDigest::of(b"payload");
        let hex = digest.to_hex();
        assert_eq!(hex.len(), 64);
        assert_eq!(BlobDigest::parse_hex(&hex), Some(digest));
        assert_eq!(digest.shard(), &hex[..2]);
        assert!(BlobDigest::parse_hex("zz").is_none());
    }
}
