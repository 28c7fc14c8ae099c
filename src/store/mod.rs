//! Chunked entity store.
//!
//! Each entity is one small metadata record plus numbered chunk records per
//! bulk field. Reads are cache-fronted; every write is staged in the cache
//! first (readers never see pre-write state after a write is accepted) and
//! then enqueued. Appends touch the tail chunk only, so the cost of adding a
//! screenshot to a two-hour session is one chunk rewrite, not a full-entity
//! rewrite. After every successful mutation the index manager is notified.

pub mod chunks;

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Instant;

use chrono::Utc;

use crate::blob::BlobStore;
use crate::cache::{BoundedCache, CacheKey, CachedValue};
use crate::constants::{DEFAULT_CHUNK_CAPACITY, FREE_SPACE_CHECK_THRESHOLD};
use crate::error::{Result, VaultError};
use crate::index::IndexManager;
use crate::io::FsBackend;
use crate::queue::{JobPayload, Priority, WriteQueue};
use crate::types::{
    AppendOutcome, BlobDigest, BulkItem, ChunkFault, EntityId, EntityMetadata, EntityRecord,
    FieldManifest, LoadOptions, LoadedEntity, SearchCriteria, SearchEngineKind, SearchOutcome,
};

/// Host declaration of one bulk field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldSpec {
    pub chunk_capacity: u32,
}

impl Default for FieldSpec {
    fn default() -> Self {
        Self {
            chunk_capacity: DEFAULT_CHUNK_CAPACITY,
        }
    }
}

fn owner_key(id: EntityId, field: &str) -> String {
    format!("{id}/{field}")
}

pub struct EntityStore {
    backend: Arc<FsBackend>,
    cache: Arc<BoundedCache<CachedValue>>,
    queue: Arc<WriteQueue>,
    blobs: Arc<BlobStore>,
    index: Arc<RwLock<IndexManager>>,
    fields: BTreeMap<String, FieldSpec>,
    /// Per-entity write serialization on top of the queue's per-key ordering.
    locks: Mutex<HashMap<EntityId, Arc<Mutex<()>>>>,
    sequence: AtomicU64,
}

impl EntityStore {
    pub fn new(
        backend: Arc<FsBackend>,
        cache: Arc<BoundedCache<CachedValue>>,
        queue: Arc<WriteQueue>,
        blobs: Arc<BlobStore>,
        index: Arc<RwLock<IndexManager>>,
        fields: BTreeMap<String, FieldSpec>,
    ) -> Self {
        Self {
            backend,
            cache,
            queue,
            blobs,
            index,
            fields,
            locks: Mutex::new(HashMap::new()),
            sequence: AtomicU64::new(0),
        }
    }

    /// Raise the mutation counter above every sequence already on disk;
    /// called once during engine open.
    pub fn set_sequence_floor(&self, floor: u64) {
        self.sequence.fetch_max(floor, Ordering::AcqRel);
    }

    fn next_sequence(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::AcqRel) + 1
    }

    fn field_spec(&self, field: &str) -> Result<FieldSpec> {
        self.fields
            .get(field)
            .copied()
            .ok_or_else(|| VaultError::UnknownField {
                field: field.to_string(),
            })
    }

    fn entity_lock(&self, id: EntityId) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(id).or_default())
    }

    fn index_write(&self) -> std::sync::RwLockWriteGuard<'_, IndexManager> {
        self.index.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Metadata for one entity, cache-first. `Ok(None)` when absent.
    pub fn load_metadata(&self, id: EntityId) -> Result<Option<Arc<EntityMetadata>>> {
        let key = CacheKey::metadata(id);
        if let Some(CachedValue::Metadata(meta)) = self.cache.get(&key) {
            return Ok(Some(meta));
        }
        let Some(bytes) = self.backend.read_record(&self.backend.metadata_path(id))? else {
            return Ok(None);
        };
        let metadata = chunks::decode_metadata(&bytes).map_err(|err| {
            VaultError::CorruptMetadata {
                entity: id,
                reason: err.to_string(),
            }
        })?;
        let metadata = Arc::new(metadata);
        self.cache.set(
            key,
            CachedValue::Metadata(Arc::clone(&metadata)),
            bytes.len(),
            None,
        );
        Ok(Some(metadata))
    }

    fn read_metadata_quiet(&self, id: EntityId) -> Option<EntityMetadata> {
        match self.load_metadata(id) {
            Ok(Some(meta)) => Some((*meta).clone()),
            Ok(None) => None,
            Err(err) => {
                tracing::warn!(entity = %id, error = %err, "skipping unreadable metadata");
                None
            }
        }
    }

    /// The fast path: every entity's metadata, no chunk IO whatsoever.
    /// Unreadable records are skipped (and logged) so one corrupt entity
    /// cannot hide the rest. Newest sessions first.
    pub fn load_all_metadata(&self) -> Result<Vec<EntityMetadata>> {
        let ids = self.backend.list_entity_ids()?;

        #[cfg(feature = "parallel_load")]
        let mut metas: Vec<EntityMetadata> = {
            use rayon::prelude::*;
            ids.par_iter()
                .filter_map(|id| self.read_metadata_quiet(*id))
                .collect()
        };
        #[cfg(not(feature = "parallel_load"))]
        let mut metas: Vec<EntityMetadata> = ids
            .iter()
            .filter_map(|id| self.read_metadata_quiet(*id))
            .collect();

        metas.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        Ok(metas)
    }

    fn load_chunk(&self, id: EntityId, field: &str, chunk: u32) -> Result<Arc<Vec<BulkItem>>> {
        let key = CacheKey::chunk(id, field, chunk);
        if let Some(CachedValue::Chunk(items)) = self.cache.get(&key) {
            return Ok(items);
        }
        let path = self.backend.chunk_path(id, field, chunk);
        let Some(bytes) = self.backend.read_record(&path)? else {
            return Err(VaultError::CorruptChunk {
                entity: id,
                field: field.to_string(),
                chunk,
                reason: "chunk record missing from backing store".into(),
            });
        };
        let items = chunks::decode_chunk(&bytes).map_err(|err| VaultError::CorruptChunk {
            entity: id,
            field: field.to_string(),
            chunk,
            reason: err.to_string(),
        })?;
        let items = Arc::new(items);
        self.cache.set(
            key,
            CachedValue::Chunk(Arc::clone(&items)),
            bytes.len(),
            None,
        );
        Ok(items)
    }

    /// Load metadata plus every chunk of every bulk field, resolving blob
    /// references. Corrupt chunks are reported per-chunk so partial entities
    /// still render.
    pub fn load_full(&self, id: EntityId, options: LoadOptions) -> Result<LoadedEntity> {
        let metadata = self
            .load_metadata(id)?
            .ok_or(VaultError::EntityNotFound { id })?;

        let mut loaded = LoadedEntity {
            metadata: Some((*metadata).clone()),
            ..LoadedEntity::default()
        };

        for (field, manifest) in &metadata.manifests {
            let mut items = Vec::with_capacity(manifest.item_count as usize);
            for chunk in 0..manifest.chunk_count {
                match self.load_chunk(id, field, chunk) {
                    Ok(chunk_items) => items.extend(chunk_items.iter().cloned()),
                    Err(VaultError::CorruptChunk { reason, .. }) => {
                        tracing::warn!(
                            entity = %id,
                            field = %field,
                            chunk,
                            reason = %reason,
                            "chunk unreadable; returning partial entity"
                        );
                        loaded.faults.push(ChunkFault {
                            field: field.clone(),
                            chunk,
                            reason,
                        });
                    }
                    Err(other) => return Err(other),
                }
            }
            loaded.fields.insert(field.clone(), items);
        }

        if options.resolve_attachments {
            let mut digests: BTreeSet<BlobDigest> = loaded
                .fields
                .values()
                .flatten()
                .filter_map(|item| item.attachment)
                .collect();
            if let Some(preview) = metadata.preview {
                digests.insert(preview);
            }
            for digest in digests {
                match self.blobs.get(&digest)? {
                    Some(bytes) => {
                        loaded.attachments.insert(digest, bytes);
                    }
                    None => {
                        // GC races are tolerated; the reference simply stays
                        // unresolved.
                        tracing::warn!(blob = %digest, "attachment missing during full load");
                    }
                }
            }
        }

        Ok(loaded)
    }

    /// Full rewrite of one entity. Used for major edits; appends should use
    /// [`append_item`](Self::append_item) instead.
    pub fn save(&self, record: EntityRecord) -> Result<EntityMetadata> {
        for field in record.fields.keys() {
            self.field_spec(field)?;
        }
        let id = record.metadata.id;
        let lock = self.entity_lock(id);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);

        let old_meta = match self.load_metadata(id) {
            Ok(existing) => existing,
            Err(err) => {
                tracing::warn!(entity = %id, error = %err, "overwriting unreadable metadata");
                None
            }
        };
        let old_refs = old_meta
            .as_ref()
            .map(|meta| self.collect_attachments(meta))
            .unwrap_or_default();

        let mut metadata = record.metadata;
        metadata.sequence = self.next_sequence();
        metadata.updated_at = Utc::now();

        // Re-chunk every bulk field and rebuild the manifests from scratch.
        let mut encoded_chunks: Vec<(String, u32, Vec<u8>, Arc<Vec<BulkItem>>)> = Vec::new();
        let mut manifests: BTreeMap<String, FieldManifest> = BTreeMap::new();
        let mut total_bytes = 0u64;
        for (field, items) in &record.fields {
            let spec = self.field_spec(field)?;
            let planned = chunks::plan_chunks(items, spec.chunk_capacity);
            for (idx, slice) in planned.iter().enumerate() {
                let bytes = chunks::encode_chunk(slice)?;
                total_bytes += bytes.len() as u64;
                encoded_chunks.push((
                    field.clone(),
                    idx as u32,
                    bytes,
                    Arc::new(slice.to_vec()),
                ));
            }
            manifests.insert(
                field.clone(),
                FieldManifest {
                    chunk_count: planned.len() as u32,
                    capacity: spec.chunk_capacity,
                    item_count: items.len() as u64,
                },
            );
        }
        metadata.manifests = manifests;
        let encoded_meta = chunks::encode_metadata(&metadata)?;
        total_bytes += encoded_meta.len() as u64;

        if total_bytes >= FREE_SPACE_CHECK_THRESHOLD {
            self.backend.check_free_space(total_bytes)?;
        }

        // Reference accounting before any write is enqueued.
        let new_refs = self.record_attachments(&metadata, &record.fields);
        for (owner, digest) in new_refs.difference(&old_refs) {
            self.blobs.add_reference(digest, owner)?;
        }
        for (owner, digest) in old_refs.difference(&new_refs) {
            self.blobs.remove_reference(digest, owner)?;
        }

        // Stage the post-write state in the cache, then enqueue.
        let metadata_arc = Arc::new(metadata.clone());
        self.cache.set(
            CacheKey::metadata(id),
            CachedValue::Metadata(Arc::clone(&metadata_arc)),
            encoded_meta.len(),
            None,
        );
        for (field, idx, bytes, items) in &encoded_chunks {
            self.cache.set(
                CacheKey::chunk(id, field, *idx),
                CachedValue::Chunk(Arc::clone(items)),
                bytes.len(),
                None,
            );
        }
        // Drop cache entries and records for chunks past the new tail.
        if let Some(old) = old_meta.as_ref() {
            for (field, old_manifest) in &old.manifests {
                let new_count = metadata
                    .manifests
                    .get(field)
                    .map_or(0, |m| m.chunk_count);
                for idx in new_count..old_manifest.chunk_count {
                    self.cache.delete(&CacheKey::chunk(id, field, idx));
                    self.queue.enqueue(
                        JobPayload::DeleteChunk {
                            entity: id,
                            field: field.clone(),
                            chunk: idx,
                        },
                        Priority::Normal,
                    )?;
                }
            }
        }

        for (field, idx, bytes, _) in encoded_chunks {
            self.queue.enqueue(
                JobPayload::WriteChunk {
                    entity: id,
                    field,
                    chunk: idx,
                    bytes,
                },
                Priority::Normal,
            )?;
        }
        self.queue.enqueue(
            JobPayload::WriteMetadata {
                entity: id,
                bytes: encoded_meta,
            },
            Priority::Normal,
        )?;

        self.index_write().update_entity(&metadata)?;
        tracing::debug!(entity = %id, sequence = metadata.sequence, "entity saved");
        Ok(metadata)
    }

    /// Cheap incremental write: append one item to a bulk field, rewriting
    /// only the tail chunk (plus the metadata record when a chunk rolls
    /// over). Fails with `EntityNotFound` before any write if the entity is
    /// missing.
    pub fn append_item(&self, id: EntityId, field: &str, item: BulkItem) -> Result<AppendOutcome> {
        let spec = self.field_spec(field)?;
        let lock = self.entity_lock(id);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);

        let metadata = self
            .load_metadata(id)?
            .ok_or(VaultError::EntityNotFound { id })?;
        let mut metadata = (*metadata).clone();
        let mut manifest = metadata
            .manifests
            .get(field)
            .cloned()
            .unwrap_or_else(|| FieldManifest::empty(spec.chunk_capacity));

        let (target_chunk, mut items, created) = match manifest.tail_chunk() {
            None => (0, Vec::new(), true),
            Some(tail) => {
                let tail_items = self.load_chunk(id, field, tail)?;
                if tail_items.len() < manifest.capacity as usize {
                    (tail, (*tail_items).clone(), false)
                } else {
                    (tail + 1, Vec::new(), true)
                }
            }
        };

        if let Some(digest) = item.attachment {
            self.blobs.add_reference(&digest, &owner_key(id, field))?;
        }
        items.push(item);

        if created {
            manifest.chunk_count = target_chunk + 1;
        }
        manifest.item_count += 1;
        let item_count = manifest.item_count;
        metadata.manifests.insert(field.to_string(), manifest);
        metadata.sequence = self.next_sequence();
        metadata.updated_at = Utc::now();

        let encoded_chunk = chunks::encode_chunk(&items)?;
        let encoded_meta = chunks::encode_metadata(&metadata)?;

        let items_arc = Arc::new(items);
        self.cache.set(
            CacheKey::chunk(id, field, target_chunk),
            CachedValue::Chunk(Arc::clone(&items_arc)),
            encoded_chunk.len(),
            None,
        );
        self.cache.set(
            CacheKey::metadata(id),
            CachedValue::Metadata(Arc::new(metadata.clone())),
            encoded_meta.len(),
            None,
        );

        self.queue.enqueue(
            JobPayload::WriteChunk {
                entity: id,
                field: field.to_string(),
                chunk: target_chunk,
                bytes: encoded_chunk,
            },
            Priority::Normal,
        )?;
        if created {
            // Chunk count changed; the manifest must follow it to disk.
            self.queue.enqueue(
                JobPayload::WriteMetadata {
                    entity: id,
                    bytes: encoded_meta,
                },
                Priority::Normal,
            )?;
        }

        self.index_write().update_entity(&metadata)?;
        tracing::debug!(
            entity = %id,
            field = %field,
            chunk = target_chunk,
            created,
            "item appended"
        );
        Ok(AppendOutcome {
            chunk: target_chunk,
            created_chunk: created,
            item_count,
        })
    }

    /// Delete an entity: dereference its attachments, drop queued writes it
    /// owns, remove its namespace, and clear it from cache and index.
    pub fn delete(&self, id: EntityId) -> Result<()> {
        let lock = self.entity_lock(id);
        {
            let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);

            // A corrupt metadata record must not make the entity undeletable;
            // it only loses the reference walk.
            let metadata = match self.load_metadata(id) {
                Ok(Some(meta)) => Some(meta),
                Ok(None) => return Err(VaultError::EntityNotFound { id }),
                Err(err) => {
                    tracing::warn!(entity = %id, error = %err, "deleting entity with unreadable metadata");
                    None
                }
            };

            if let Some(metadata) = &metadata {
                for (owner, digest) in self.collect_attachments(metadata) {
                    self.blobs.remove_reference(&digest, &owner)?;
                }
            }

            // Invalidate before the delete job is acknowledged as enqueued.
            self.cache.remove_owner(&id.to_string());
            self.queue.purge_entity(id);
            self.queue
                .enqueue(JobPayload::DeleteEntity { entity: id }, Priority::Normal)?;
            self.index_write().delete_entity(id)?;
        }
        self.locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
        log::info!("entity {id} deleted");
        Ok(())
    }

    /// Correct-but-slow fallback used while the index is degraded: evaluate
    /// the criteria with a linear scan over metadata.
    pub fn scan_search(&self, criteria: &SearchCriteria) -> Result<SearchOutcome> {
        let start = Instant::now();
        let metas = self.load_all_metadata()?;
        let matching: Vec<EntityId> = metas
            .iter()
            .filter(|meta| matches_criteria(meta, criteria))
            .map(|meta| meta.id)
            .collect();
        let total = matching.len();
        let mut ids = matching;
        ids.truncate(criteria.limit);
        Ok(SearchOutcome {
            ids,
            total,
            engine: SearchEngineKind::LinearScan,
            elapsed_ms: start.elapsed().as_millis(),
        })
    }

    /// Every (owner, digest) pair the entity currently references, walking
    /// its chunks tolerantly (a corrupt chunk loses at most its own refs).
    fn collect_attachments(&self, metadata: &EntityMetadata) -> BTreeSet<(String, BlobDigest)> {
        let mut refs = BTreeSet::new();
        for (field, manifest) in &metadata.manifests {
            let owner = owner_key(metadata.id, field);
            for chunk in 0..manifest.chunk_count {
                match self.load_chunk(metadata.id, field, chunk) {
                    Ok(items) => {
                        for item in items.iter() {
                            if let Some(digest) = item.attachment {
                                refs.insert((owner.clone(), digest));
                            }
                        }
                    }
                    Err(err) => {
                        tracing::warn!(
                            entity = %metadata.id,
                            field = %field,
                            chunk,
                            error = %err,
                            "skipping unreadable chunk during reference walk"
                        );
                    }
                }
            }
        }
        if let Some(preview) = metadata.preview {
            refs.insert((owner_key(metadata.id, "preview"), preview));
        }
        refs
    }

    fn record_attachments(
        &self,
        metadata: &EntityMetadata,
        fields: &BTreeMap<String, Vec<BulkItem>>,
    ) -> BTreeSet<(String, BlobDigest)> {
        let mut refs = BTreeSet::new();
        for (field, items) in fields {
            let owner = owner_key(metadata.id, field);
            for item in items {
                if let Some(digest) = item.attachment {
                    refs.insert((owner.clone(), digest));
                }
            }
        }
        if let Some(preview) = metadata.preview {
            refs.insert((owner_key(metadata.id, "preview"), preview));
        }
        refs
    }
}

fn matches_criteria(meta: &EntityMetadata, criteria: &SearchCriteria) -> bool {
    let mut checks: Vec<bool> = Vec::new();
    for tag in &criteria.tags {
        checks.push(meta.tags.iter().any(|t| t == tag));
    }
    if let Some(category) = &criteria.category {
        checks.push(meta.category.as_deref() == Some(category.as_str()));
    }
    if let Some(sub) = &criteria.sub_category {
        checks.push(meta.sub_category.as_deref() == Some(sub.as_str()));
    }
    if let Some(status) = &criteria.status {
        checks.push(meta.status == *status);
    }
    if let Some((since, until)) = &criteria.date_range {
        checks.push(meta.started_at >= *since && meta.started_at <= *until);
    }
    if let Some(text) = criteria.text.as_deref().filter(|t| !t.trim().is_empty()) {
        let needle = text.to_lowercase();
        let mut haystack = meta.name.to_lowercase();
        if let Some(notes) = &meta.notes {
            haystack.push(' ');
            haystack.push_str(&notes.to_lowercase());
        }
        if let Some(category) = &meta.category {
            haystack.push(' ');
            haystack.push_str(&category.to_lowercase());
        }
        checks.push(haystack.contains(&needle));
    }

    if checks.is_empty() {
        return true;
    }
    match criteria.operator {
        crate::types::BoolOperator::And => checks.iter().all(|c| *c),
        crate::types::BoolOperator::Or => checks.iter().any(|c| *c),
        crate::types::BoolOperator::Not => !checks.iter().any(|c| *c),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::QueueConfig;
    use std::time::Duration;
    use tempfile::tempdir;

    struct Fixture {
        backend: Arc<FsBackend>,
        queue: Arc<WriteQueue>,
        cache: Arc<BoundedCache<CachedValue>>,
        store: EntityStore,
    }

    fn fixture(root: &std::path::Path, capacity: u32) -> Fixture {
        let backend = Arc::new(FsBackend::open(root).expect("backend"));
        let queue = Arc::new(
            WriteQueue::open(Arc::clone(&backend), QueueConfig::default()).expect("queue"),
        );
        let cache = Arc::new(BoundedCache::default());
        let blobs = Arc::new(
            BlobStore::open(
                Arc::clone(&backend),
                Arc::clone(&queue),
                Arc::clone(&cache),
                Duration::ZERO,
            )
            .expect("blobs"),
        );
        let index = Arc::new(RwLock::new(
            IndexManager::load(&backend, Arc::clone(&queue)).expect("index"),
        ));
        let mut fields = BTreeMap::new();
        fields.insert(
            "screenshots".to_string(),
            FieldSpec {
                chunk_capacity: capacity,
            },
        );
        fields.insert(
            "audio_segments".to_string(),
            FieldSpec {
                chunk_capacity: capacity,
            },
        );
        let store = EntityStore::new(
            Arc::clone(&backend),
            Arc::clone(&cache),
            Arc::clone(&queue),
            blobs,
            index,
            fields,
        );
        Fixture {
            backend,
            queue,
            cache,
            store,
        }
    }

    fn item(id: &str) -> BulkItem {
        BulkItem::new(id, Utc::now()).with_payload(serde_json::json!({ "label": id }))
    }

    #[test]
    fn append_rolls_over_exactly_at_capacity() {
        let dir = tempdir().expect("tmp");
        let fx = fixture(dir.path(), 3);
        let meta = EntityMetadata::new("capacity check");
        let id = meta.id;
        fx.store.save(EntityRecord::new(meta)).expect("save");

        for i in 0..3 {
            let outcome = fx
                .store
                .append_item(id, "screenshots", item(&format!("s{i}")))
                .expect("append");
            assert_eq!(outcome.chunk, 0);
            assert_eq!(outcome.created_chunk, i == 0);
        }
        // The fourth item is the first to create chunk 1.
        let outcome = fx
            .store
            .append_item(id, "screenshots", item("s3"))
            .expect("append rollover");
        assert_eq!(outcome.chunk, 1);
        assert!(outcome.created_chunk);
        assert_eq!(outcome.item_count, 4);

        let loaded = fx
            .store
            .load_full(id, LoadOptions::default())
            .expect("load");
        assert_eq!(loaded.item_count("screenshots"), 4);
        let manifest = &loaded.metadata.expect("meta").manifests["screenshots"];
        assert_eq!(manifest.chunk_count, 2);
        fx.queue.shutdown().expect("shutdown");
    }

    #[test]
    fn append_to_missing_entity_fails_before_writes() {
        let dir = tempdir().expect("tmp");
        let fx = fixture(dir.path(), 3);
        let ghost = EntityId::new_v4();
        let err = fx
            .store
            .append_item(ghost, "screenshots", item("x"))
            .expect_err("must fail");
        assert!(matches!(err, VaultError::EntityNotFound { .. }));
        assert_eq!(fx.queue.stats().pending, 0);
        fx.queue.shutdown().expect("shutdown");
    }

    #[test]
    fn undeclared_field_is_rejected() {
        let dir = tempdir().expect("tmp");
        let fx = fixture(dir.path(), 3);
        let meta = EntityMetadata::new("shape check");
        let id = meta.id;
        fx.store.save(EntityRecord::new(meta)).expect("save");

        let err = fx
            .store
            .append_item(id, "keystrokes", item("x"))
            .expect_err("undeclared field");
        assert!(matches!(err, VaultError::UnknownField { .. }));
        fx.queue.shutdown().expect("shutdown");
    }

    #[test]
    fn save_load_roundtrip_survives_cold_cache() {
        let dir = tempdir().expect("tmp");
        let fx = fixture(dir.path(), 3);

        let mut meta = EntityMetadata::new("roundtrip");
        meta.tags = vec!["focus".into()];
        meta.notes = Some("deep work block".into());
        let id = meta.id;
        let mut record = EntityRecord::new(meta);
        record.fields.insert(
            "screenshots".into(),
            (0..7).map(|i| item(&format!("shot-{i}"))).collect(),
        );
        fx.store.save(record.clone()).expect("save");
        fx.queue.flush().expect("flush");
        fx.cache.clear();

        let loaded = fx
            .store
            .load_full(id, LoadOptions::default())
            .expect("load");
        assert!(loaded.faults.is_empty());
        assert_eq!(loaded.fields["screenshots"], record.fields["screenshots"]);
        let meta = loaded.metadata.expect("meta");
        assert_eq!(meta.manifests["screenshots"].chunk_count, 3);
        assert_eq!(meta.manifests["screenshots"].item_count, 7);
        fx.queue.shutdown().expect("shutdown");
    }

    #[test]
    fn metadata_scan_never_touches_chunks() {
        let dir = tempdir().expect("tmp");
        let fx = fixture(dir.path(), 3);

        let meta = EntityMetadata::new("scan");
        let id = meta.id;
        let mut record = EntityRecord::new(meta);
        record.fields.insert(
            "screenshots".into(),
            (0..9).map(|i| item(&i.to_string())).collect(),
        );
        fx.store.save(record).expect("save");
        fx.queue.flush().expect("flush");
        fx.cache.clear();

        // Make every chunk record unreadable; the metadata scan must not care.
        for chunk in 0..3 {
            fx.backend
                .write_record(&fx.backend.chunk_path(id, "screenshots", chunk), b"garbage")
                .expect("corrupt");
        }
        let metas = fx.store.load_all_metadata().expect("scan");
        assert_eq!(metas.len(), 1);
        assert_eq!(metas[0].item_count("screenshots"), 9);
        fx.queue.shutdown().expect("shutdown");
    }

    #[test]
    fn corrupt_chunk_yields_partial_entity() {
        let dir = tempdir().expect("tmp");
        let fx = fixture(dir.path(), 3);

        let meta = EntityMetadata::new("partial");
        let id = meta.id;
        let mut record = EntityRecord::new(meta);
        record.fields.insert(
            "screenshots".into(),
            (0..9).map(|i| item(&i.to_string())).collect(),
        );
        fx.store.save(record).expect("save");
        fx.queue.flush().expect("flush");
        fx.cache.clear();

        fx.backend
            .write_record(&fx.backend.chunk_path(id, "screenshots", 1), b"bitrot")
            .expect("corrupt");

        let loaded = fx
            .store
            .load_full(id, LoadOptions::default())
            .expect("load");
        assert_eq!(loaded.faults.len(), 1);
        assert_eq!(loaded.faults[0].field, "screenshots");
        assert_eq!(loaded.faults[0].chunk, 1);
        // Chunks 0 and 2 still load: 6 of 9 items.
        assert_eq!(loaded.item_count("screenshots"), 6);
        fx.queue.shutdown().expect("shutdown");
    }

    #[test]
    fn delete_cascades_and_rejects_followups() {
        let dir = tempdir().expect("tmp");
        let fx = fixture(dir.path(), 3);

        let meta = EntityMetadata::new("doomed");
        let id = meta.id;
        fx.store.save(EntityRecord::new(meta)).expect("save");
        fx.store
            .append_item(id, "audio_segments", item("seg"))
            .expect("append");
        fx.store.delete(id).expect("delete");
        fx.queue.flush().expect("flush");

        assert!(
            fx.backend
                .read_record(&fx.backend.metadata_path(id))
                .expect("read")
                .is_none()
        );
        let err = fx
            .store
            .append_item(id, "audio_segments", item("late"))
            .expect_err("append after delete");
        assert!(matches!(err, VaultError::EntityNotFound { .. }));
        fx.queue.shutdown().expect("shutdown");
    }

    #[test]
    fn append_ordering_is_preserved() {
        let dir = tempdir().expect("tmp");
        let fx = fixture(dir.path(), 4);

        let meta = EntityMetadata::new("ordering");
        let id = meta.id;
        fx.store.save(EntityRecord::new(meta)).expect("save");
        for i in 0..10 {
            fx.store
                .append_item(id, "screenshots", item(&format!("shot-{i:02}")))
                .expect("append");
        }
        fx.queue.flush().expect("flush");
        fx.cache.clear();

        let loaded = fx
            .store
            .load_full(id, LoadOptions::default())
            .expect("load");
        let ids: Vec<&str> = loaded.fields["screenshots"]
            .iter()
            .map(|i| i.id.as_str())
            .collect();
        let expected: Vec<String> = (0..10).map(|i| format!("shot-{i:02}")).collect();
        assert_eq!(ids, expected.iter().map(String::as_str).collect::<Vec<_>>());
        fx.queue.shutdown().expect("shutdown");
    }

    #[test]
    fn linear_scan_matches_tags_and_text() {
        let dir = tempdir().expect("tmp");
        let fx = fixture(dir.path(), 3);

        let mut a = EntityMetadata::new("billing escalation");
        a.tags = vec!["urgent".into(), "billing".into()];
        let mut b = EntityMetadata::new("standup notes");
        b.tags = vec!["urgent".into()];
        let a_id = a.id;
        fx.store.save(EntityRecord::new(a)).expect("save a");
        fx.store.save(EntityRecord::new(b)).expect("save b");
        fx.queue.flush().expect("flush");

        let outcome = fx
            .store
            .scan_search(&SearchCriteria {
                tags: vec!["urgent".into(), "billing".into()],
                ..SearchCriteria::default()
            })
            .expect("scan");
        assert_eq!(outcome.ids, vec![a_id]);
        assert_eq!(outcome.engine, SearchEngineKind::LinearScan);
        fx.queue.shutdown().expect("shutdown");
    }
}
