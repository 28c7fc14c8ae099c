//! Search behavior through the public engine API.

use chrono::{Duration as ChronoDuration, Utc};
use sessionvault_core::{
    BoolOperator, EntityMetadata, EntityRecord, EntityStatus, SearchCriteria, SearchEngineKind,
    SessionVault,
};
use tempfile::tempdir;

fn session(vault: &SessionVault, name: &str, tags: &[&str], category: Option<&str>) -> EntityMetadata {
    let mut meta = EntityMetadata::new(name);
    meta.tags = tags.iter().map(|t| (*t).to_string()).collect();
    meta.category = category.map(str::to_string);
    vault
        .save(EntityRecord::new(meta))
        .expect("save session")
}

#[test]
fn and_intersects_tag_sets() {
    let dir = tempdir().expect("tmp");
    let vault = SessionVault::open(dir.path()).expect("open");

    session(&vault, "escalation call", &["urgent"], None);
    let both = session(&vault, "billing dispute", &["urgent", "billing"], None);

    let outcome = vault
        .search(&SearchCriteria {
            tags: vec!["urgent".into(), "billing".into()],
            operator: BoolOperator::And,
            ..SearchCriteria::default()
        })
        .expect("search");
    assert_eq!(outcome.ids, vec![both.id]);
    assert_eq!(outcome.engine, SearchEngineKind::Postings);
    vault.shutdown().expect("shutdown");
}

#[test]
fn free_text_ranks_and_filters_combine() {
    let dir = tempdir().expect("tmp");
    let vault = SessionVault::open(dir.path()).expect("open");

    let mut meta = EntityMetadata::new("storage engine deep dive");
    meta.notes = Some("chunked writes and cache eviction".into());
    meta.tags = vec!["engineering".into()];
    let target = meta.id;
    vault.save(EntityRecord::new(meta)).expect("save");

    session(&vault, "storage closet cleanup", &["chores"], None);
    session(&vault, "standup", &["engineering"], None);

    let outcome = vault
        .search(&SearchCriteria {
            text: Some("storage cache".into()),
            tags: vec!["engineering".into()],
            operator: BoolOperator::And,
            ..SearchCriteria::default()
        })
        .expect("search");
    assert_eq!(outcome.ids, vec![target]);
    vault.shutdown().expect("shutdown");
}

#[test]
fn date_range_and_status_filters() {
    let dir = tempdir().expect("tmp");
    let vault = SessionVault::open(dir.path()).expect("open");

    let mut old = EntityMetadata::new("archived sprint");
    old.started_at = Utc::now() - ChronoDuration::days(30);
    old.status = EntityStatus::Archived;
    vault.save(EntityRecord::new(old)).expect("save old");

    let mut fresh = EntityMetadata::new("current sprint");
    fresh.status = EntityStatus::Active;
    let fresh_id = fresh.id;
    vault.save(EntityRecord::new(fresh)).expect("save fresh");

    let outcome = vault
        .search(&SearchCriteria {
            date_range: Some((Utc::now() - ChronoDuration::days(7), Utc::now())),
            status: Some(EntityStatus::Active),
            operator: BoolOperator::And,
            ..SearchCriteria::default()
        })
        .expect("search");
    assert_eq!(outcome.ids, vec![fresh_id]);
    vault.shutdown().expect("shutdown");
}

#[test]
fn results_resolve_through_entity_store() {
    let dir = tempdir().expect("tmp");
    let vault = SessionVault::open(dir.path()).expect("open");

    let found = session(&vault, "review notes", &["review"], Some("work"));
    let outcome = vault
        .search(&SearchCriteria {
            category: Some("work".into()),
            ..SearchCriteria::default()
        })
        .expect("search");

    // Search returns ids; the caller resolves them via the store.
    let loaded = vault.load_full(outcome.ids[0]).expect("resolve");
    assert_eq!(loaded.metadata.expect("meta").id, found.id);
    vault.shutdown().expect("shutdown");
}

#[test]
fn deleted_entities_leave_the_index() {
    let dir = tempdir().expect("tmp");
    let vault = SessionVault::open(dir.path()).expect("open");

    let doomed = session(&vault, "temp", &["scratch"], None);
    assert_eq!(
        vault
            .search(&SearchCriteria {
                tags: vec!["scratch".into()],
                ..SearchCriteria::default()
            })
            .expect("before")
            .total,
        1
    );

    vault.delete(doomed.id).expect("delete");
    assert_eq!(
        vault
            .search(&SearchCriteria {
                tags: vec!["scratch".into()],
                ..SearchCriteria::default()
            })
            .expect("after")
            .total,
        0
    );
    vault.flush().expect("flush");
    assert!(vault.index_caught_up().expect("caught up"));
    vault.shutdown().expect("shutdown");
}

#[test]
fn corrupt_index_snapshot_rebuilds_on_open() {
    let dir = tempdir().expect("tmp");
    let keep;
    {
        let vault = SessionVault::open(dir.path()).expect("open");
        keep = session(&vault, "survivor", &["keep"], None);
        vault.flush().expect("flush");
        vault.shutdown().expect("shutdown");
    }

    // Trash the persisted snapshot; open must fall back to a rebuild from
    // metadata instead of serving wrong results.
    let snapshot = dir.path().join("index").join("postings.svx");
    std::fs::write(&snapshot, b"not a snapshot").expect("corrupt");

    let vault = SessionVault::open(dir.path()).expect("reopen");
    let outcome = vault
        .search(&SearchCriteria {
            tags: vec!["keep".into()],
            ..SearchCriteria::default()
        })
        .expect("search");
    assert_eq!(outcome.ids, vec![keep.id]);
    assert!(vault.check_health().healthy);
    vault.shutdown().expect("shutdown");
}

#[test]
fn empty_criteria_list_recent_first() {
    let dir = tempdir().expect("tmp");
    let vault = SessionVault::open(dir.path()).expect("open");

    let mut early = EntityMetadata::new("early");
    early.started_at = Utc::now() - ChronoDuration::hours(2);
    vault.save(EntityRecord::new(early)).expect("save early");
    let late = session(&vault, "late", &[], None);

    let outcome = vault.search(&SearchCriteria::default()).expect("search");
    assert_eq!(outcome.total, 2);
    assert_eq!(outcome.ids[0], late.id);
    vault.shutdown().expect("shutdown");
}
