//! Crash recovery: journaled writes left behind by a dead process are
//! reprocessed exactly once on the next open.

use std::sync::Arc;

use sessionvault_core::store::chunks::encode_metadata;
use sessionvault_core::{
    EntityMetadata, EntityRecord, FsBackend, JobPayload, Priority, QueueConfig, SessionVault,
    WriteQueue,
};
use tempfile::tempdir;

#[test]
fn paused_writes_survive_a_simulated_crash() {
    let dir = tempdir().expect("tmp");
    let mut meta = EntityMetadata::new("recovered session");
    meta.sequence = 1;
    let id = meta.id;

    // A queue with an accepted-but-unapplied job, then a process death: the
    // job exists only in the journal.
    {
        let backend = Arc::new(FsBackend::open(dir.path()).expect("backend"));
        let queue = WriteQueue::open(Arc::clone(&backend), QueueConfig::default())
            .expect("queue");
        queue.pause();
        queue
            .enqueue(
                JobPayload::WriteMetadata {
                    entity: id,
                    bytes: encode_metadata(&meta).expect("encode"),
                },
                Priority::Normal,
            )
            .expect("enqueue");
        assert_eq!(queue.stats().pending, 1);
        // No shutdown, no drain: the worker never applies the job.
        std::mem::forget(queue);
    }

    // First reopen replays the journaled job.
    {
        let vault = SessionVault::open(dir.path()).expect("reopen");
        let metas = vault.load_all_metadata().expect("scan");
        assert_eq!(metas.len(), 1);
        assert_eq!(metas[0].id, id);
        assert_eq!(metas[0].name, "recovered session");
        assert_eq!(vault.queue_stats().recovered, 1);

        // The recovered entity is searchable: the open-time catch-up indexed
        // it from its metadata sequence.
        assert!(vault.index_caught_up().expect("caught up"));
        vault.shutdown().expect("shutdown");
    }

    // Second reopen finds a drained journal: exactly once, not twice.
    let vault = SessionVault::open(dir.path()).expect("third open");
    assert_eq!(vault.queue_stats().recovered, 0);
    assert_eq!(vault.load_all_metadata().expect("scan").len(), 1);
    vault.shutdown().expect("shutdown");
}

#[test]
fn reopen_after_clean_shutdown_recovers_nothing() {
    let dir = tempdir().expect("tmp");
    {
        let vault = SessionVault::open(dir.path()).expect("open");
        for i in 0..5 {
            let meta = EntityMetadata::new(format!("clean {i}"));
            vault.save(EntityRecord::new(meta)).expect("save");
        }
        vault.shutdown().expect("shutdown");
    }

    let vault = SessionVault::open(dir.path()).expect("reopen");
    assert_eq!(vault.queue_stats().recovered, 0);
    assert_eq!(vault.load_all_metadata().expect("scan").len(), 5);
    vault.shutdown().expect("shutdown");
}

#[test]
fn failed_shutdown_jobs_stay_recoverable() {
    let dir = tempdir().expect("tmp");
    let meta = EntityMetadata::new("late write");
    let id = meta.id;

    {
        let backend = Arc::new(FsBackend::open(dir.path()).expect("backend"));
        let queue = WriteQueue::open(Arc::clone(&backend), QueueConfig::default())
            .expect("queue");
        queue.pause();
        queue
            .enqueue(
                JobPayload::WriteMetadata {
                    entity: id,
                    bytes: encode_metadata(&meta).expect("encode"),
                },
                Priority::Low,
            )
            .expect("enqueue");
        // Paused + zero budget: the drain cannot apply the job in time.
        let err = queue.shutdown_within(std::time::Duration::ZERO);
        assert!(err.is_err(), "shutdown must report the stranded job");
    }

    let vault = SessionVault::open(dir.path()).expect("reopen");
    assert_eq!(vault.queue_stats().recovered, 1);
    assert_eq!(vault.load_all_metadata().expect("scan").len(), 1);
    vault.shutdown().expect("shutdown");
}
