//! End-to-end engine scenarios: lifecycle, chunking, deduplication, and
//! operational surfaces.

use chrono::Utc;
use sessionvault_core::{
    BulkItem, EngineConfig, EntityMetadata, EntityRecord, EntityStatus, SessionVault,
    VaultError,
};
use tempfile::tempdir;

fn shot(id: &str) -> BulkItem {
    BulkItem::new(id, Utc::now()).with_payload(serde_json::json!({
        "relativeTime": 1.5,
        "display": "main",
    }))
}

#[test]
fn save_then_load_full_roundtrips() {
    let dir = tempdir().expect("tmp");
    let vault = SessionVault::open(dir.path()).expect("open");

    let mut meta = EntityMetadata::new("pairing session");
    meta.category = Some("work".into());
    meta.tags = vec!["rust".into()];
    meta.notes = Some("storage engine review".into());
    meta.status = EntityStatus::Completed;
    let id = meta.id;

    let mut record = EntityRecord::new(meta);
    record.fields.insert(
        "screenshots".into(),
        (0..45).map(|i| shot(&format!("shot-{i}"))).collect(),
    );
    record.fields.insert(
        "audio_segments".into(),
        (0..7).map(|i| shot(&format!("seg-{i}"))).collect(),
    );
    vault.save(record.clone()).expect("save");
    vault.flush().expect("flush");

    let loaded = vault.load_full(id).expect("load");
    assert!(loaded.faults.is_empty());
    assert_eq!(loaded.fields["screenshots"], record.fields["screenshots"]);
    assert_eq!(loaded.fields["audio_segments"], record.fields["audio_segments"]);

    let meta = loaded.metadata.expect("metadata");
    // 45 items at capacity 20: chunks of 20/20/5.
    assert_eq!(meta.manifests["screenshots"].chunk_count, 3);
    assert_eq!(meta.manifests["screenshots"].item_count, 45);
    assert_eq!(meta.status, EntityStatus::Completed);
    vault.shutdown().expect("shutdown");
}

#[test]
fn metadata_survives_reopen_without_bulk_contents() {
    let dir = tempdir().expect("tmp");
    let total = 40usize;
    {
        let vault = SessionVault::open(dir.path()).expect("open");
        for i in 0..total {
            let meta = EntityMetadata::new(format!("session {i}"));
            let id = meta.id;
            vault.save(EntityRecord::new(meta)).expect("save");
            for j in 0..3 {
                vault
                    .append_item(id, "screenshots", shot(&format!("s{i}-{j}")))
                    .expect("append");
            }
        }
        vault.flush().expect("flush");
        vault.shutdown().expect("shutdown");
    }

    let vault = SessionVault::open(dir.path()).expect("reopen");
    let metas = vault.load_all_metadata().expect("scan");
    assert_eq!(metas.len(), total);
    for meta in &metas {
        // The fast path carries bookkeeping, never items.
        assert_eq!(meta.item_count("screenshots"), 3);
    }
    vault.shutdown().expect("shutdown");
}

#[test]
fn identical_attachments_stored_once_and_gc_works() {
    let dir = tempdir().expect("tmp");
    let vault = SessionVault::open(dir.path()).expect("open");

    // The same frame bytes attached to five different sessions.
    fastrand::seed(42);
    let frame: Vec<u8> = (0..64 * 1024).map(|_| fastrand::u8(..)).collect();
    let mut ids = Vec::new();
    for i in 0..5 {
        let meta = EntityMetadata::new(format!("viewer {i}"));
        let id = meta.id;
        vault.save(EntityRecord::new(meta)).expect("save");

        let digest = vault.put_blob(&frame).expect("put");
        vault
            .append_item(id, "screenshots", shot(&format!("s{i}")).with_attachment(digest))
            .expect("append");
        ids.push((id, digest));
    }
    vault.flush().expect("flush");

    let digest = ids[0].1;
    assert!(ids.iter().all(|(_, d)| *d == digest), "one digest for all");
    assert_eq!(vault.blob_ref_count(&digest), Some(5));

    // Deleting four of five leaves the blob intact.
    for (id, _) in ids.iter().take(4) {
        vault.delete(*id).expect("delete");
    }
    vault.flush().expect("flush");
    assert_eq!(vault.blob_ref_count(&digest), Some(1));
    assert!(vault.get_blob(&digest).expect("get").is_some());
    assert!(vault.collect_garbage().expect("gc").removed.is_empty());

    // The fifth delete makes it GC-eligible.
    vault.delete(ids[4].0).expect("delete last");
    vault.flush().expect("flush");
    let report = vault.collect_garbage().expect("gc");
    assert_eq!(report.removed, vec![digest]);
    vault.flush().expect("flush");
    assert_eq!(vault.get_blob(&digest).expect("get"), None);
    vault.shutdown().expect("shutdown");
}

#[test]
fn append_is_visible_before_flush() {
    let dir = tempdir().expect("tmp");
    let vault = SessionVault::open(dir.path()).expect("open");

    let meta = EntityMetadata::new("live recording");
    let id = meta.id;
    vault.save(EntityRecord::new(meta)).expect("save");
    vault
        .append_item(id, "audio_segments", shot("seg-0"))
        .expect("append");

    // Readers see the post-write state through the cache immediately.
    let loaded = vault.load_full(id).expect("load");
    assert_eq!(loaded.item_count("audio_segments"), 1);
    vault.shutdown().expect("shutdown");
}

#[test]
fn operational_surfaces_report() {
    let dir = tempdir().expect("tmp");
    let vault = SessionVault::open(dir.path()).expect("open");

    let meta = EntityMetadata::new("ops");
    let id = meta.id;
    vault.save(EntityRecord::new(meta)).expect("save");
    vault
        .append_item(id, "screenshots", shot("s0"))
        .expect("append");
    vault.flush().expect("flush");

    let cache = vault.cache_stats();
    assert!(cache.resident_bytes > 0);
    assert!(cache.max_bytes > 0);

    let queue = vault.queue_stats();
    assert_eq!(queue.pending, 0);
    assert!(queue.completed > 0);

    let disk = vault.disk_space().expect("disk");
    assert!(disk.total >= disk.available);

    vault.set_cache_size(1024);
    assert!(vault.cache_stats().resident_bytes <= 1024);
    vault.clear_cache();
    assert_eq!(vault.cache_stats().entries, 0);

    // Cold read path still works after a full cache clear.
    assert_eq!(vault.load_full(id).expect("load").item_count("screenshots"), 1);
    vault.shutdown().expect("shutdown");
}

#[test]
fn unknown_field_and_missing_entity_are_structural_errors() {
    let dir = tempdir().expect("tmp");
    let vault = SessionVault::open(dir.path()).expect("open");

    let meta = EntityMetadata::new("shape");
    let id = meta.id;
    vault.save(EntityRecord::new(meta)).expect("save");

    assert!(matches!(
        vault.append_item(id, "clipboard_events", shot("x")),
        Err(VaultError::UnknownField { .. })
    ));
    assert!(matches!(
        vault.load_full(sessionvault_core::EntityId::new_v4()),
        Err(VaultError::EntityNotFound { .. })
    ));
    assert!(matches!(
        vault.delete(sessionvault_core::EntityId::new_v4()),
        Err(VaultError::EntityNotFound { .. })
    ));
    vault.shutdown().expect("shutdown");
}

#[test]
fn second_open_on_same_root_is_refused() {
    let dir = tempdir().expect("tmp");
    let vault = SessionVault::open(dir.path()).expect("open");
    let err = SessionVault::open(dir.path()).expect_err("second opener");
    assert!(matches!(err, VaultError::Lock(_)));
    vault.shutdown().expect("shutdown");
}

#[test]
fn custom_field_shape_is_honored() {
    let dir = tempdir().expect("tmp");
    let config = EngineConfig::new(dir.path())
        .with_bulk_field("frames", 4)
        .with_cache_max_bytes(8 * 1024 * 1024);
    let vault = SessionVault::open_with(config).expect("open");

    let meta = EntityMetadata::new("tiny chunks");
    let id = meta.id;
    vault.save(EntityRecord::new(meta)).expect("save");
    for i in 0..9 {
        vault
            .append_item(id, "frames", shot(&i.to_string()))
            .expect("append");
    }
    vault.flush().expect("flush");

    let loaded = vault.load_full(id).expect("load");
    let manifest = &loaded.metadata.as_ref().expect("meta").manifests["frames"];
    // 9 items at capacity 4: 4/4/1.
    assert_eq!(manifest.chunk_count, 3);
    assert_eq!(loaded.item_count("frames"), 9);
    vault.shutdown().expect("shutdown");
}
