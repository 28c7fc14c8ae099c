//! `SessionVault`: the composition root owning every storage component.
//!
//! Hosts construct one engine per storage root and share it by reference;
//! there are no process-wide singletons. The engine wires the cache, write
//! queue, blob store, entity store, and index manager together, recovers
//! journaled writes on open, and closes the index's eventual-consistency
//! window before serving reads.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant};

use crossbeam_channel::Receiver;

use crate::blob::{BlobStore, GcReport};
use crate::cache::{BoundedCache, CacheStats, CachedValue};
use crate::constants::DEFAULT_CACHE_MAX_BYTES;
use crate::error::{Result, VaultError};
use crate::index::{IndexHealthReport, IndexManager};
use crate::io::FsBackend;
use crate::lock::DirLock;
use crate::queue::{FailedJob, QueueConfig, QueueStats, WriteQueue};
use crate::store::{EntityStore, FieldSpec};
use crate::types::{
    AppendOutcome, BlobDigest, BulkItem, DiskSpaceInfo, EntityId, EntityMetadata, EntityRecord,
    LoadOptions, LoadedEntity, SearchCriteria, SearchOutcome,
};

/// When zero-referenced blobs are physically deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcPolicy {
    /// Only inside an explicit `collect_garbage()` call.
    OnDemand,
    /// Cooperatively after mutations, at most once per interval.
    Interval(Duration),
}

/// Host-supplied engine configuration: storage root, bulk-field shape, and
/// tuning knobs.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub root: PathBuf,
    pub fields: BTreeMap<String, FieldSpec>,
    pub cache_max_bytes: usize,
    pub queue: QueueConfig,
    pub gc_policy: GcPolicy,
    /// Zero-referenced blobs younger than this survive a sweep.
    pub gc_grace: Duration,
}

impl EngineConfig {
    /// Bare configuration with no bulk fields declared.
    #[must_use]
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        Self {
            root: root.into(),
            fields: BTreeMap::new(),
            cache_max_bytes: DEFAULT_CACHE_MAX_BYTES,
            queue: QueueConfig::default(),
            gc_policy: GcPolicy::OnDemand,
            gc_grace: Duration::ZERO,
        }
    }

    /// The session-recorder shape: screenshots, audio transcript segments,
    /// and video markers as bulk fields.
    #[must_use]
    pub fn recorder<P: Into<PathBuf>>(root: P) -> Self {
        Self::new(root)
            .with_bulk_field("screenshots", 20)
            .with_bulk_field("audio_segments", 20)
            .with_bulk_field("video_markers", 20)
    }

    #[must_use]
    pub fn with_bulk_field<S: Into<String>>(mut self, name: S, chunk_capacity: u32) -> Self {
        self.fields
            .insert(name.into(), FieldSpec { chunk_capacity });
        self
    }

    #[must_use]
    pub fn with_cache_max_bytes(mut self, bytes: usize) -> Self {
        self.cache_max_bytes = bytes;
        self
    }

    #[must_use]
    pub fn with_gc_policy(mut self, policy: GcPolicy) -> Self {
        self.gc_policy = policy;
        self
    }

    #[must_use]
    pub fn with_gc_grace(mut self, grace: Duration) -> Self {
        self.gc_grace = grace;
        self
    }
}

/// Storage engine handle. All methods take `&self`; the engine is safe to
/// share across threads behind an `Arc`.
pub struct SessionVault {
    _lock: DirLock,
    backend: Arc<FsBackend>,
    cache: Arc<BoundedCache<CachedValue>>,
    queue: Arc<WriteQueue>,
    blobs: Arc<BlobStore>,
    index: Arc<RwLock<IndexManager>>,
    store: EntityStore,
    gc_policy: GcPolicy,
    last_gc: Mutex<Instant>,
    closed: AtomicBool,
}

impl std::fmt::Debug for SessionVault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionVault")
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

impl SessionVault {
    /// Open with the session-recorder field shape.
    pub fn open<P: AsRef<Path>>(root: P) -> Result<Self> {
        Self::open_with(EngineConfig::recorder(root.as_ref()))
    }

    /// Open with an explicit configuration. Acquires the storage lock,
    /// replays journaled writes, and catches the index up to metadata.
    pub fn open_with(config: EngineConfig) -> Result<Self> {
        fs_err::create_dir_all(&config.root)?;
        let lock = DirLock::acquire(&config.root)?;
        let backend = Arc::new(FsBackend::open(&config.root)?);
        let cache = Arc::new(BoundedCache::new(config.cache_max_bytes));
        let queue = Arc::new(WriteQueue::open(
            Arc::clone(&backend),
            config.queue.clone(),
        )?);
        // Recovered jobs must land before the first metadata scan.
        queue.flush()?;

        let blobs = Arc::new(BlobStore::open(
            Arc::clone(&backend),
            Arc::clone(&queue),
            Arc::clone(&cache),
            config.gc_grace,
        )?);
        let index = Arc::new(RwLock::new(IndexManager::load(
            &backend,
            Arc::clone(&queue),
        )?));
        let store = EntityStore::new(
            Arc::clone(&backend),
            Arc::clone(&cache),
            Arc::clone(&queue),
            Arc::clone(&blobs),
            Arc::clone(&index),
            config.fields.clone(),
        );

        let metadata = store.load_all_metadata()?;
        let floor = metadata.iter().map(|m| m.sequence).max().unwrap_or(0);
        store.set_sequence_floor(floor);
        {
            let mut index = index.write().unwrap_or_else(PoisonError::into_inner);
            if index.is_degraded() {
                index.rebuild_all(&metadata)?;
            } else {
                index.catch_up(&metadata)?;
            }
        }

        tracing::info!(
            root = %config.root.display(),
            entities = metadata.len(),
            queue.recovered = queue.stats().recovered,
            "storage engine opened"
        );
        Ok(Self {
            _lock: lock,
            backend,
            cache,
            queue,
            blobs,
            index,
            store,
            gc_policy: config.gc_policy,
            last_gc: Mutex::new(Instant::now()),
            closed: AtomicBool::new(false),
        })
    }

    // --- entity lifecycle ---------------------------------------------------

    pub fn load_all_metadata(&self) -> Result<Vec<EntityMetadata>> {
        self.store.load_all_metadata()
    }

    pub fn load_full(&self, id: EntityId) -> Result<LoadedEntity> {
        self.store.load_full(id, LoadOptions::default())
    }

    pub fn load_full_with(&self, id: EntityId, options: LoadOptions) -> Result<LoadedEntity> {
        self.store.load_full(id, options)
    }

    pub fn save(&self, record: EntityRecord) -> Result<EntityMetadata> {
        let saved = self.store.save(record)?;
        self.maybe_collect_garbage();
        Ok(saved)
    }

    pub fn append_item(&self, id: EntityId, field: &str, item: BulkItem) -> Result<AppendOutcome> {
        let outcome = self.store.append_item(id, field, item)?;
        self.maybe_collect_garbage();
        Ok(outcome)
    }

    pub fn delete(&self, id: EntityId) -> Result<()> {
        self.store.delete(id)?;
        self.maybe_collect_garbage();
        Ok(())
    }

    // --- search -------------------------------------------------------------

    /// Resolve criteria to ranked entity ids. Falls back to a correct linear
    /// scan whenever the index reports inconsistency.
    pub fn search(&self, criteria: &SearchCriteria) -> Result<SearchOutcome> {
        let attempt = {
            let index = self.index.read().unwrap_or_else(PoisonError::into_inner);
            index.search(criteria)
        };
        match attempt {
            Ok(outcome) => Ok(outcome),
            Err(VaultError::IndexInconsistent { reason }) => {
                tracing::warn!(reason = %reason, "search falling back to linear scan");
                self.store.scan_search(criteria)
            }
            Err(other) => Err(other),
        }
    }

    /// Whether every entity's latest mutation has been applied to the index.
    pub fn index_caught_up(&self) -> Result<bool> {
        let metadata = self.store.load_all_metadata()?;
        let index = self.index.read().unwrap_or_else(PoisonError::into_inner);
        Ok(index.is_caught_up(&metadata))
    }

    pub fn check_health(&self) -> IndexHealthReport {
        self.index
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .check_health()
    }

    /// Recovery path after a failed health check.
    pub fn rebuild_index(&self) -> Result<()> {
        let metadata = self.store.load_all_metadata()?;
        self.index
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .rebuild_all(&metadata)
    }

    // --- attachments --------------------------------------------------------

    pub fn put_blob(&self, bytes: &[u8]) -> Result<BlobDigest> {
        self.blobs.put(bytes)
    }

    pub fn get_blob(&self, digest: &BlobDigest) -> Result<Option<Vec<u8>>> {
        self.blobs.get(digest)
    }

    pub fn add_blob_reference(&self, digest: &BlobDigest, owner: &str) -> Result<()> {
        self.blobs.add_reference(digest, owner)
    }

    pub fn remove_blob_reference(&self, digest: &BlobDigest, owner: &str) -> Result<()> {
        self.blobs.remove_reference(digest, owner)
    }

    pub fn blob_ref_count(&self, digest: &BlobDigest) -> Option<u64> {
        self.blobs.ref_count(digest)
    }

    pub fn collect_garbage(&self) -> Result<GcReport> {
        self.blobs.collect_garbage()
    }

    fn maybe_collect_garbage(&self) {
        let GcPolicy::Interval(every) = self.gc_policy else {
            return;
        };
        let mut last = self.last_gc.lock().unwrap_or_else(PoisonError::into_inner);
        if last.elapsed() < every {
            return;
        }
        *last = Instant::now();
        drop(last);
        if let Err(err) = self.blobs.collect_garbage() {
            tracing::warn!(error = %err, "cooperative blob GC failed");
        }
    }

    // --- diagnostics and tuning --------------------------------------------

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    pub fn clear_cache(&self) {
        self.cache.clear();
    }

    pub fn set_cache_size(&self, bytes: usize) {
        self.cache.set_max_bytes(bytes);
    }

    pub fn queue_stats(&self) -> QueueStats {
        self.queue.stats()
    }

    /// Channel of jobs that exhausted their retries; hosts surface these as
    /// dismissible notifications rather than blocking anything.
    pub fn failure_events(&self) -> Receiver<FailedJob> {
        self.queue.failure_events()
    }

    pub fn pause_writes(&self) {
        self.queue.pause();
    }

    pub fn resume_writes(&self) {
        self.queue.resume();
    }

    pub fn disk_space(&self) -> Result<DiskSpaceInfo> {
        self.backend.disk_space()
    }

    /// Block until every accepted write has been applied.
    pub fn flush(&self) -> Result<()> {
        self.queue.flush()
    }

    /// Drain pending writes within the configured bound and release the
    /// storage lock.
    pub fn shutdown(self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        self.queue.shutdown()
    }
}

impl Drop for SessionVault {
    fn drop(&mut self) {
        if !self.closed.load(Ordering::Acquire) {
            // Dropped without an explicit shutdown; the queue's own Drop
            // drains with the default bound.
            tracing::debug!("engine dropped without explicit shutdown");
        }
    }
}
