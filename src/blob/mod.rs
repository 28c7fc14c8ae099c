//! Content-addressed blob store for binary attachments.
//!
//! Identity is a blake3 digest over the bytes, so identical screenshots or
//! audio segments are stored exactly once no matter how many entities
//! reference them. Each blob carries a sidecar reference table; physical
//! deletion is deferred to an explicit garbage-collection sweep so a
//! remove-then-re-add burst never thrashes the disk.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use bincode::serde::{decode_from_slice, encode_to_vec};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::cache::{BoundedCache, CacheKey, CachedValue};
use crate::constants::{BLOB_CACHE_LIMIT_BYTES, BLOB_CACHE_TTL, FREE_SPACE_CHECK_THRESHOLD};
use crate::error::Result;
use crate::io::backend::record_config;
use crate::io::FsBackend;
use crate::queue::{JobOutcome, JobPayload, Priority, WriteQueue};
use crate::types::BlobDigest;

/// Per-blob reference table, persisted next to the content bytes.
///
/// `anonymous` counts `put` calls not yet claimed by an owner; the first
/// `add_reference` for a new owner consumes one anonymous count, so a
/// recording pipeline that does `put` followed by `append_item` ends up with
/// exactly one reference per owning entity field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobSidecar {
    pub owners: BTreeSet<String>,
    pub anonymous: u64,
    pub bytes: u64,
    pub created_at: DateTime<Utc>,
    /// Set when the reference count reaches zero; cleared when it rises
    /// again. Gates the deferred GC grace period.
    pub zero_since: Option<DateTime<Utc>>,
}

impl BlobSidecar {
    #[must_use]
    pub fn ref_count(&self) -> u64 {
        self.anonymous + self.owners.len() as u64
    }
}

/// Result of one garbage-collection sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GcReport {
    pub removed: Vec<BlobDigest>,
    pub reclaimed_bytes: u64,
    /// Blobs still referenced (or inside the grace period) after the sweep.
    pub surviving: usize,
}

pub struct BlobStore {
    backend: Arc<FsBackend>,
    queue: Arc<WriteQueue>,
    cache: Arc<BoundedCache<CachedValue>>,
    table: Mutex<HashMap<BlobDigest, BlobSidecar>>,
    gc_grace: Duration,
}

impl BlobStore {
    /// Load the reference table from every sidecar on disk.
    pub fn open(
        backend: Arc<FsBackend>,
        queue: Arc<WriteQueue>,
        cache: Arc<BoundedCache<CachedValue>>,
        gc_grace: Duration,
    ) -> Result<Self> {
        let mut table = HashMap::new();
        for digest in backend.list_blob_digests()? {
            let path = backend.blob_sidecar_path(&digest);
            let Some(bytes) = backend.read_record(&path)? else {
                continue;
            };
            match decode_from_slice::<BlobSidecar, _>(&bytes, record_config()) {
                Ok((sidecar, _)) => {
                    table.insert(digest, sidecar);
                }
                Err(err) => {
                    tracing::warn!(blob = %digest, error = %err, "skipping undecodable sidecar");
                }
            }
        }
        tracing::debug!(blob.count = table.len(), "blob reference table loaded");
        Ok(Self {
            backend,
            queue,
            cache,
            table: Mutex::new(table),
            gc_grace,
        })
    }

    fn table_mut(&self) -> std::sync::MutexGuard<'_, HashMap<BlobDigest, BlobSidecar>> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Store bytes under their content address, deduplicating identical
    /// content. The reference count is only bumped after the bytes are
    /// durably on disk, so a failed write leaves no orphan reference.
    pub fn put(&self, bytes: &[u8]) -> Result<BlobDigest> {
        let digest = BlobDigest::of(bytes);

        let already_stored = self.table_mut().contains_key(&digest);
        if !already_stored {
            if bytes.len() as u64 >= FREE_SPACE_CHECK_THRESHOLD {
                self.backend.check_free_space(bytes.len() as u64)?;
            }
            let ticket = self.queue.enqueue(
                JobPayload::WriteBlob {
                    digest,
                    bytes: bytes.to_vec(),
                },
                Priority::Critical,
            )?;
            // Durability before accounting.
            ticket.wait_applied()?;
        }

        let sidecar = {
            let mut table = self.table_mut();
            let entry = table.entry(digest).or_insert_with(|| BlobSidecar {
                owners: BTreeSet::new(),
                anonymous: 0,
                bytes: bytes.len() as u64,
                created_at: Utc::now(),
                zero_since: None,
            });
            entry.anonymous += 1;
            entry.zero_since = None;
            entry.clone()
        };
        self.persist_sidecar(digest, &sidecar)?;

        if bytes.len() <= BLOB_CACHE_LIMIT_BYTES {
            self.cache.set(
                CacheKey::blob(&digest),
                CachedValue::Blob(Arc::new(bytes.to_vec())),
                bytes.len(),
                Some(BLOB_CACHE_TTL),
            );
        }
        tracing::debug!(blob = %digest, blob.bytes = bytes.len(), blob.dedup = already_stored, "blob put");
        Ok(digest)
    }

    /// Fetch blob bytes; a missing digest is `Ok(None)` because callers must
    /// tolerate races with garbage collection.
    pub fn get(&self, digest: &BlobDigest) -> Result<Option<Vec<u8>>> {
        if let Some(CachedValue::Blob(bytes)) = self.cache.get(&CacheKey::blob(digest)) {
            return Ok(Some(bytes.as_ref().clone()));
        }
        let Some(bytes) = self.backend.read_record(&self.backend.blob_path(digest))? else {
            return Ok(None);
        };
        if bytes.len() <= BLOB_CACHE_LIMIT_BYTES {
            self.cache.set(
                CacheKey::blob(digest),
                CachedValue::Blob(Arc::new(bytes.clone())),
                bytes.len(),
                Some(BLOB_CACHE_TTL),
            );
        }
        Ok(Some(bytes))
    }

    #[must_use]
    pub fn contains(&self, digest: &BlobDigest) -> bool {
        self.table_mut().contains_key(digest)
    }

    #[must_use]
    pub fn ref_count(&self, digest: &BlobDigest) -> Option<u64> {
        self.table_mut().get(digest).map(BlobSidecar::ref_count)
    }

    /// Record that `owner` (an entity field) references this blob. Idempotent
    /// per owner; the first claim consumes one anonymous `put` count.
    pub fn add_reference(&self, digest: &BlobDigest, owner: &str) -> Result<()> {
        let sidecar = {
            let mut table = self.table_mut();
            let Some(entry) = table.get_mut(digest) else {
                return Err(crate::error::VaultError::BlobNotFound {
                    digest: digest.to_hex(),
                });
            };
            if entry.owners.insert(owner.to_string()) && entry.anonymous > 0 {
                entry.anonymous -= 1;
            }
            entry.zero_since = None;
            entry.clone()
        };
        self.persist_sidecar(*digest, &sidecar)
    }

    /// Drop `owner`'s reference. At zero the blob becomes GC-eligible after
    /// the grace period but is not deleted here.
    pub fn remove_reference(&self, digest: &BlobDigest, owner: &str) -> Result<()> {
        let sidecar = {
            let mut table = self.table_mut();
            let Some(entry) = table.get_mut(digest) else {
                // Tolerate double-removal races the same way get() tolerates
                // missing blobs.
                return Ok(());
            };
            entry.owners.remove(owner);
            if entry.ref_count() == 0 && entry.zero_since.is_none() {
                entry.zero_since = Some(Utc::now());
            }
            entry.clone()
        };
        self.persist_sidecar(*digest, &sidecar)
    }

    /// Delete blobs whose reference count has been zero for at least the
    /// grace period. Returns what was removed for observability.
    pub fn collect_garbage(&self) -> Result<GcReport> {
        let now = Utc::now();
        let grace = chrono::Duration::from_std(self.gc_grace).unwrap_or_else(|_| {
            chrono::Duration::zero()
        });

        let victims: Vec<(BlobDigest, u64)> = {
            let table = self.table_mut();
            table
                .iter()
                .filter(|(_, sidecar)| {
                    sidecar.ref_count() == 0
                        && sidecar
                            .zero_since
                            .is_some_and(|since| now - since >= grace)
                })
                .map(|(digest, sidecar)| (*digest, sidecar.bytes))
                .collect()
        };

        let mut report = GcReport::default();
        for (digest, bytes) in victims {
            let ticket = self
                .queue
                .enqueue(JobPayload::DeleteBlob { digest }, Priority::Normal)?;
            match ticket.wait()? {
                JobOutcome::Applied | JobOutcome::Superseded => {
                    self.table_mut().remove(&digest);
                    self.cache.delete(&CacheKey::blob(&digest));
                    report.removed.push(digest);
                    report.reclaimed_bytes += bytes;
                }
                JobOutcome::Failed(reason) => {
                    tracing::warn!(blob = %digest, reason = %reason, "blob deletion failed; keeping entry");
                }
            }
        }
        report.surviving = self.table_mut().len();
        tracing::info!(
            gc.removed = report.removed.len(),
            gc.reclaimed_bytes = report.reclaimed_bytes,
            gc.surviving = report.surviving,
            "blob garbage collection"
        );
        Ok(report)
    }

    fn persist_sidecar(&self, digest: BlobDigest, sidecar: &BlobSidecar) -> Result<()> {
        let bytes = encode_to_vec(sidecar, record_config())?;
        // Rapid reference churn for one digest coalesces to a single write.
        self.queue.enqueue(
            JobPayload::WriteBlobSidecar { digest, bytes },
            Priority::Normal,
        )?;
        Ok(())
    }
}
