//! Filesystem backing store.
//!
//! Owns the physical layout under the storage root and the atomic
//! record-write discipline. Every record (metadata, chunk, blob sidecar,
//! index snapshot) is replaced atomically, so readers observe either the
//! pre- or post-write state and never a torn one.

use std::io::{Cursor, Write};
use std::path::{Path, PathBuf};

use bincode::config::{self, Config};
use bincode::serde::{decode_from_slice, encode_to_vec};

use crate::constants::{
    BLOB_FILE_EXT, BLOB_SIDECAR_EXT, BLOBS_DIR, CHUNK_FILE_EXT, ENTITIES_DIR, ENVELOPE_VERSION,
    INDEX_DIR, JOURNAL_FILE_NAME, METADATA_FILE_NAME, MIN_FREE_SPACE,
};
use crate::error::{Result, VaultError};
use crate::types::{BlobDigest, ChunkEncoding, DiskSpaceInfo, EntityId, RecordEnvelope};

/// Bincode config shared by all record envelopes.
pub(crate) fn record_config() -> impl Config {
    config::standard()
}

/// Compress and wrap an encoded payload into a checksummed envelope.
pub fn seal(payload: &[u8], encoding: ChunkEncoding) -> Result<Vec<u8>> {
    let body = match encoding {
        ChunkEncoding::Plain => payload.to_vec(),
        ChunkEncoding::Zstd => zstd::encode_all(Cursor::new(payload), 0).map_err(VaultError::Io)?,
        ChunkEncoding::Lz4 => lz4_flex::compress_prepend_size(payload),
    };
    let envelope = RecordEnvelope {
        version: ENVELOPE_VERSION,
        encoding,
        checksum: *blake3::hash(&body).as_bytes(),
        payload: body,
    };
    Ok(encode_to_vec(&envelope, record_config())?)
}

/// Unwrap an envelope, verifying version and checksum before decompressing.
pub fn unseal(bytes: &[u8]) -> Result<Vec<u8>> {
    let (envelope, _): (RecordEnvelope, usize) = decode_from_slice(bytes, record_config())?;
    if envelope.version != ENVELOPE_VERSION {
        return Err(VaultError::InvalidEnvelope {
            reason: format!("unsupported record version {}", envelope.version),
        });
    }
    if *blake3::hash(&envelope.payload).as_bytes() != envelope.checksum {
        return Err(VaultError::InvalidEnvelope {
            reason: "record checksum mismatch".into(),
        });
    }
    match envelope.encoding {
        ChunkEncoding::Plain => Ok(envelope.payload),
        ChunkEncoding::Zstd => zstd::decode_all(Cursor::new(&envelope.payload[..]))
            .map_err(|_| VaultError::InvalidEnvelope {
                reason: "zstd payload failed to decode".into(),
            }),
        ChunkEncoding::Lz4 => lz4_flex::decompress_size_prepended(&envelope.payload).map_err(
            |err| VaultError::InvalidEnvelope {
                reason: format!("lz4 payload failed to decode: {err}"),
            },
        ),
    }
}

/// Filesystem namespaces under one storage root.
#[derive(Debug)]
pub struct FsBackend {
    root: PathBuf,
}

impl FsBackend {
    /// Bind to `root`, creating the namespace directories if absent.
    pub fn open(root: &Path) -> Result<Self> {
        fs_err::create_dir_all(root.join(ENTITIES_DIR))?;
        fs_err::create_dir_all(root.join(BLOBS_DIR))?;
        fs_err::create_dir_all(root.join(INDEX_DIR))?;
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn journal_path(&self) -> PathBuf {
        self.root.join(JOURNAL_FILE_NAME)
    }

    #[must_use]
    pub fn entity_dir(&self, id: EntityId) -> PathBuf {
        self.root.join(ENTITIES_DIR).join(id.to_string())
    }

    #[must_use]
    pub fn metadata_path(&self, id: EntityId) -> PathBuf {
        self.entity_dir(id).join(METADATA_FILE_NAME)
    }

    #[must_use]
    pub fn chunk_path(&self, id: EntityId, field: &str, chunk: u32) -> PathBuf {
        self.entity_dir(id)
            .join(field)
            .join(format!("chunk-{chunk:05}.{CHUNK_FILE_EXT}"))
    }

    #[must_use]
    pub fn blob_path(&self, digest: &BlobDigest) -> PathBuf {
        self.root
            .join(BLOBS_DIR)
            .join(digest.shard())
            .join(format!("{}.{BLOB_FILE_EXT}", digest.to_hex()))
    }

    #[must_use]
    pub fn blob_sidecar_path(&self, digest: &BlobDigest) -> PathBuf {
        self.root
            .join(BLOBS_DIR)
            .join(digest.shard())
            .join(format!("{}.{BLOB_SIDECAR_EXT}", digest.to_hex()))
    }

    #[must_use]
    pub fn index_path(&self, name: &str) -> PathBuf {
        self.root.join(INDEX_DIR).join(name)
    }

    /// Atomically create or replace the record at `path`.
    pub fn write_record(&self, path: &Path, bytes: &[u8]) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs_err::create_dir_all(parent)?;
        }
        let mut file = atomic_write_file::AtomicWriteFile::options().open(path)?;
        file.write_all(bytes)?;
        file.commit()?;
        Ok(())
    }

    /// Read a record; a missing file is an explicit `None`, never an error.
    pub fn read_record(&self, path: &Path) -> Result<Option<Vec<u8>>> {
        match fs_err::read(path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    /// Remove a record, reporting whether it existed.
    pub fn remove_record(&self, path: &Path) -> Result<bool> {
        match fs_err::remove_file(path) {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    /// Remove an entity's whole namespace (metadata plus every chunk).
    pub fn remove_entity_dir(&self, id: EntityId) -> Result<bool> {
        let dir = self.entity_dir(id);
        match fs_err::remove_dir_all(&dir) {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    /// Entity ids present on disk, in directory order.
    pub fn list_entity_ids(&self) -> Result<Vec<EntityId>> {
        let mut ids = Vec::new();
        for entry in fs_err::read_dir(self.root.join(ENTITIES_DIR))? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name();
            match name.to_str().and_then(|n| n.parse::<EntityId>().ok()) {
                Some(id) => ids.push(id),
                None => {
                    tracing::warn!(dir = ?name, "skipping unrecognized entity directory");
                }
            }
        }
        Ok(ids)
    }

    /// Digests of every blob sidecar on disk.
    pub fn list_blob_digests(&self) -> Result<Vec<BlobDigest>> {
        let mut digests = Vec::new();
        let blobs_root = self.root.join(BLOBS_DIR);
        for shard in fs_err::read_dir(&blobs_root)? {
            let shard = shard?;
            if !shard.file_type()?.is_dir() {
                continue;
            }
            for entry in fs_err::read_dir(shard.path())? {
                let entry = entry?;
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) != Some(BLOB_SIDECAR_EXT) {
                    continue;
                }
                let stem = path.file_stem().and_then(|s| s.to_str());
                match stem.and_then(BlobDigest::parse_hex) {
                    Some(digest) => digests.push(digest),
                    None => {
                        tracing::warn!(path = %path.display(), "skipping unrecognized blob sidecar");
                    }
                }
            }
        }
        Ok(digests)
    }

    /// Disk capacity snapshot for the filesystem holding the root.
    pub fn disk_space(&self) -> Result<DiskSpaceInfo> {
        let available = fs2::available_space(&self.root)?;
        let total = fs2::total_space(&self.root)?;
        Ok(DiskSpaceInfo {
            total,
            available,
            used: total.saturating_sub(available),
            available_mb: available / (1024 * 1024),
        })
    }

    /// Refuse writes that would dip below the free-space reserve.
    pub fn check_free_space(&self, required: u64) -> Result<()> {
        let available = fs2::available_space(&self.root)?;
        let needed = required.saturating_add(MIN_FREE_SPACE);
        if available < needed {
            return Err(VaultError::InsufficientSpace {
                available_mb: available / (1024 * 1024),
                required_mb: needed / (1024 * 1024),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn seal_unseal_roundtrip_all_encodings() {
        let payload = b"the quick brown fox".repeat(64);
        for encoding in [ChunkEncoding::Plain, ChunkEncoding::Zstd, ChunkEncoding::Lz4] {
            let sealed = seal(&payload, encoding).expect("seal");
            let opened = unseal(&sealed).expect("unseal");
            assert_eq!(opened, payload);
        }
    }

    #[test]
    fn unseal_rejects_tampered_payload() {
        let sealed = seal(b"immutable", ChunkEncoding::Plain).expect("seal");
        let mut tampered = sealed.clone();
        let last = tampered.len() - 1;
        tampered[last] ^= 0xFF;
        let err = unseal(&tampered).expect_err("tampering must be detected");
        assert!(matches!(
            err,
            VaultError::InvalidEnvelope { .. } | VaultError::Decode(_)
        ));
    }

    #[test]
    fn record_write_read_remove() {
        let dir = tempdir().expect("tmp");
        let backend = FsBackend::open(dir.path()).expect("backend");
        let id = EntityId::new_v4();
        let path = backend.chunk_path(id, "screenshots", 3);

        assert_eq!(backend.read_record(&path).expect("read missing"), None);
        backend.write_record(&path, b"chunk bytes").expect("write");
        assert_eq!(
            backend.read_record(&path).expect("read"),
            Some(b"chunk bytes".to_vec())
        );
        assert!(backend.remove_record(&path).expect("remove"));
        assert!(!backend.remove_record(&path).expect("remove again"));
    }

    #[test]
    fn entity_listing_skips_foreign_dirs() {
        let dir = tempdir().expect("tmp");
        let backend = FsBackend::open(dir.path()).expect("backend");
        let id = EntityId::new_v4();
        backend
            .write_record(&backend.metadata_path(id), b"meta")
            .expect("write meta");
        fs_err::create_dir_all(dir.path().join(ENTITIES_DIR).join("not-a-uuid"))
            .expect("foreign dir");

        let ids = backend.list_entity_ids().expect("list");
        assert_eq!(ids, vec![id]);
    }

    #[test]
    fn blob_paths_are_sharded() {
        let dir = tempdir().expect("tmp");
        let backend = FsBackend::open(dir.path()).expect("backend");
        let digest = BlobDigest::of(b"sharded");
        let path = backend.blob_path(&digest);
        let shard_dir = path.parent().expect("shard dir");
        assert_eq!(
            shard_dir.file_name().and_then(|n| n.to_str()),
            Some(digest.shard().as_str())
        );
    }
}
