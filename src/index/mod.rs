//! Inverted multi-field index over entity metadata.
//!
//! One posting list per scalar field (tag, category, sub-category, status), a
//! day-bucketed structure for date ranges, and tf-weighted term postings for
//! full text. Updates are remove-then-insert, so replaying a metadata version
//! is idempotent. The whole structure persists as an lz4 snapshot through
//! low-priority queue jobs and can always be rebuilt from metadata alone.

pub mod text;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Instant;

use bincode::serde::{decode_from_slice, encode_to_vec};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::constants::INDEX_SNAPSHOT_NAME;
use crate::error::{Result, VaultError};
use crate::io::backend::{record_config, seal, unseal};
use crate::io::FsBackend;
use crate::queue::{JobPayload, Priority, WriteQueue};
use crate::types::{
    BoolOperator, ChunkEncoding, EntityId, EntityMetadata, SearchCriteria, SearchEngineKind,
    SearchOutcome,
};

const SECONDS_PER_DAY: i64 = 86_400;

/// Reverse map entry: everything one entity contributed, kept so updates can
/// remove the old postings exactly.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct DocPostings {
    tags: SmallVec<[String; 4]>,
    category: Option<String>,
    sub_category: Option<String>,
    status: String,
    day: i64,
    started_at_ts: i64,
    terms: BTreeMap<String, u32>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct IndexState {
    tags: BTreeMap<String, BTreeSet<EntityId>>,
    categories: BTreeMap<String, BTreeSet<EntityId>>,
    sub_categories: BTreeMap<String, BTreeSet<EntityId>>,
    statuses: BTreeMap<String, BTreeSet<EntityId>>,
    days: BTreeMap<i64, BTreeSet<EntityId>>,
    terms: BTreeMap<String, BTreeMap<EntityId, u32>>,
    documents: BTreeMap<EntityId, DocPostings>,
    /// Last metadata sequence applied per entity; the explicit form of the
    /// index's eventual-consistency window.
    applied: BTreeMap<EntityId, u64>,
}

/// Outcome of a health check over the posting structures.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexHealthReport {
    pub healthy: bool,
    pub entities: usize,
    pub terms: usize,
    pub issues: Vec<String>,
}

pub struct IndexManager {
    queue: Arc<WriteQueue>,
    state: IndexState,
    degraded: bool,
}

impl IndexManager {
    /// Load the persisted snapshot, falling back to an empty (and flagged)
    /// index when the snapshot is missing or unreadable.
    pub fn load(backend: &FsBackend, queue: Arc<WriteQueue>) -> Result<Self> {
        let path = backend.index_path(INDEX_SNAPSHOT_NAME);
        let (state, degraded) = match backend.read_record(&path)? {
            Some(bytes) => match unseal(&bytes)
                .and_then(|raw| Ok(decode_from_slice::<IndexState, _>(&raw, record_config())?))
            {
                Ok((state, _)) => (state, false),
                Err(err) => {
                    tracing::warn!(error = %err, "index snapshot unreadable; rebuild required");
                    (IndexState::default(), true)
                }
            },
            None => (IndexState::default(), false),
        };
        Ok(Self {
            queue,
            state,
            degraded,
        })
    }

    #[must_use]
    pub fn is_degraded(&self) -> bool {
        self.degraded
    }

    #[must_use]
    pub fn entity_count(&self) -> usize {
        self.state.documents.len()
    }

    /// Last metadata sequence this index applied for `id`.
    #[must_use]
    pub fn applied_sequence(&self, id: EntityId) -> Option<u64> {
        self.state.applied.get(&id).copied()
    }

    /// Precise "is the index caught up" check against current metadata.
    #[must_use]
    pub fn is_caught_up(&self, metadata: &[EntityMetadata]) -> bool {
        metadata
            .iter()
            .all(|meta| self.applied_sequence(meta.id) == Some(meta.sequence))
            && self.state.documents.len() == metadata.len()
    }

    /// Replace the entity's postings with ones for its current field values.
    /// Safe to replay: applying the same metadata twice is a no-op.
    pub fn update_entity(&mut self, metadata: &EntityMetadata) -> Result<()> {
        self.insert_postings(metadata);
        self.persist()
    }

    pub fn delete_entity(&mut self, id: EntityId) -> Result<()> {
        self.remove_postings(id);
        self.state.applied.remove(&id);
        self.persist()
    }

    fn remove_postings(&mut self, id: EntityId) {
        let Some(doc) = self.state.documents.remove(&id) else {
            return;
        };
        for tag in &doc.tags {
            prune(&mut self.state.tags, tag, id);
        }
        if let Some(category) = &doc.category {
            prune(&mut self.state.categories, category, id);
        }
        if let Some(sub) = &doc.sub_category {
            prune(&mut self.state.sub_categories, sub, id);
        }
        prune(&mut self.state.statuses, &doc.status, id);
        if let Some(set) = self.state.days.get_mut(&doc.day) {
            set.remove(&id);
            if set.is_empty() {
                self.state.days.remove(&doc.day);
            }
        }
        for term in doc.terms.keys() {
            if let Some(postings) = self.state.terms.get_mut(term) {
                postings.remove(&id);
                if postings.is_empty() {
                    self.state.terms.remove(term);
                }
            }
        }
    }

    /// Evaluate criteria against the posting lists and rank the result.
    pub fn search(&self, criteria: &SearchCriteria) -> Result<SearchOutcome> {
        if self.degraded {
            return Err(VaultError::IndexInconsistent {
                reason: "index is degraded; rebuild pending".into(),
            });
        }
        let start = Instant::now();

        let mut sets: Vec<BTreeSet<EntityId>> = Vec::new();
        let mut text_scores: Option<BTreeMap<EntityId, f64>> = None;

        for tag in &criteria.tags {
            sets.push(self.state.tags.get(tag).cloned().unwrap_or_default());
        }
        if let Some(category) = &criteria.category {
            sets.push(
                self.state
                    .categories
                    .get(category)
                    .cloned()
                    .unwrap_or_default(),
            );
        }
        if let Some(sub) = &criteria.sub_category {
            sets.push(
                self.state
                    .sub_categories
                    .get(sub)
                    .cloned()
                    .unwrap_or_default(),
            );
        }
        if let Some(status) = &criteria.status {
            sets.push(
                self.state
                    .statuses
                    .get(status.as_str())
                    .cloned()
                    .unwrap_or_default(),
            );
        }
        if let Some((since, until)) = &criteria.date_range {
            let lo = since.timestamp();
            let hi = until.timestamp();
            let mut hits = BTreeSet::new();
            for (_, ids) in self
                .state
                .days
                .range(lo.div_euclid(SECONDS_PER_DAY)..=hi.div_euclid(SECONDS_PER_DAY))
            {
                for id in ids {
                    // Buckets are day-granular; refine to the exact bounds.
                    if let Some(doc) = self.state.documents.get(id) {
                        if doc.started_at_ts >= lo && doc.started_at_ts <= hi {
                            hits.insert(*id);
                        }
                    }
                }
            }
            sets.push(hits);
        }
        if let Some(query) = criteria.text.as_deref().filter(|t| !t.trim().is_empty()) {
            let scores = self.score_text(query);
            sets.push(scores.keys().copied().collect());
            text_scores = Some(scores);
        }

        let all_ids: BTreeSet<EntityId> = self.state.documents.keys().copied().collect();
        let combined: BTreeSet<EntityId> = if sets.is_empty() {
            all_ids.clone()
        } else {
            match criteria.operator {
                BoolOperator::And => sets
                    .iter()
                    .skip(1)
                    .fold(sets[0].clone(), |acc, set| {
                        acc.intersection(set).copied().collect()
                    }),
                BoolOperator::Or => sets.iter().flatten().copied().collect(),
                BoolOperator::Not => {
                    let excluded: BTreeSet<EntityId> = sets.iter().flatten().copied().collect();
                    all_ids.difference(&excluded).copied().collect()
                }
            }
        };

        let total = combined.len();
        let mut ranked: Vec<EntityId> = combined.into_iter().collect();
        match &text_scores {
            Some(scores) => {
                // Free-text rank; criteria-only matches sink below scored ones.
                ranked.sort_by(|a, b| {
                    let sa = scores.get(a).copied().unwrap_or(0.0);
                    let sb = scores.get(b).copied().unwrap_or(0.0);
                    sb.partial_cmp(&sa)
                        .unwrap_or(std::cmp::Ordering::Equal)
                        .then_with(|| self.recency(*b).cmp(&self.recency(*a)))
                });
            }
            None => {
                ranked.sort_by_key(|id| std::cmp::Reverse(self.recency(*id)));
            }
        }
        ranked.truncate(criteria.limit);

        Ok(SearchOutcome {
            ids: ranked,
            total,
            engine: SearchEngineKind::Postings,
            elapsed_ms: start.elapsed().as_millis(),
        })
    }

    fn recency(&self, id: EntityId) -> i64 {
        self.state
            .documents
            .get(&id)
            .map_or(i64::MIN, |doc| doc.started_at_ts)
    }

    fn score_text(&self, query: &str) -> BTreeMap<EntityId, f64> {
        let doc_count = self.state.documents.len();
        let mut scores: BTreeMap<EntityId, f64> = BTreeMap::new();
        for token in text::tokenize(query) {
            if let Some(postings) = self.state.terms.get(&token) {
                let df = postings.len();
                for (id, tf) in postings {
                    *scores.entry(*id).or_insert(0.0) += text::score_term(*tf, doc_count, df);
                }
            }
        }
        scores
    }

    /// Drop everything and re-index from current metadata; the recovery path
    /// for a degraded index.
    pub fn rebuild_all(&mut self, metadata: &[EntityMetadata]) -> Result<()> {
        tracing::info!(index.entities = metadata.len(), "rebuilding index");
        self.state = IndexState::default();
        self.degraded = false;
        for meta in metadata {
            self.insert_postings(meta);
        }
        self.persist()
    }

    /// Apply updates for entities whose metadata sequence is ahead of the
    /// index, and drop entities that no longer exist. Used on open to close
    /// the eventual-consistency window left by a previous process.
    pub fn catch_up(&mut self, metadata: &[EntityMetadata]) -> Result<()> {
        let live: BTreeSet<EntityId> = metadata.iter().map(|m| m.id).collect();
        let stale: Vec<EntityId> = self
            .state
            .documents
            .keys()
            .copied()
            .filter(|id| !live.contains(id))
            .collect();
        let mut changed = !stale.is_empty();
        for id in stale {
            self.remove_postings(id);
            self.state.applied.remove(&id);
        }
        for meta in metadata {
            if self.applied_sequence(meta.id) != Some(meta.sequence) {
                self.insert_postings(meta);
                changed = true;
            }
        }
        if changed { self.persist() } else { Ok(()) }
    }

    fn insert_postings(&mut self, metadata: &EntityMetadata) {
        self.remove_postings(metadata.id);

        let mut searchable = metadata.name.clone();
        if let Some(notes) = &metadata.notes {
            searchable.push(' ');
            searchable.push_str(notes);
        }
        if let Some(category) = &metadata.category {
            searchable.push(' ');
            searchable.push_str(category);
        }

        let doc = DocPostings {
            tags: metadata.tags.iter().cloned().collect(),
            category: metadata.category.clone(),
            sub_category: metadata.sub_category.clone(),
            status: metadata.status.as_str().to_string(),
            day: metadata.started_at.timestamp().div_euclid(SECONDS_PER_DAY),
            started_at_ts: metadata.started_at.timestamp(),
            terms: text::term_frequencies(&searchable),
        };

        let id = metadata.id;
        for tag in &doc.tags {
            self.state.tags.entry(tag.clone()).or_default().insert(id);
        }
        if let Some(category) = &doc.category {
            self.state
                .categories
                .entry(category.clone())
                .or_default()
                .insert(id);
        }
        if let Some(sub) = &doc.sub_category {
            self.state
                .sub_categories
                .entry(sub.clone())
                .or_default()
                .insert(id);
        }
        self.state
            .statuses
            .entry(doc.status.clone())
            .or_default()
            .insert(id);
        self.state.days.entry(doc.day).or_default().insert(id);
        for (term, tf) in &doc.terms {
            self.state
                .terms
                .entry(term.clone())
                .or_default()
                .insert(id, *tf);
        }

        self.state.documents.insert(id, doc);
        self.state.applied.insert(id, metadata.sequence);
    }

    /// Cross-check the forward and reverse posting structures.
    pub fn check_health(&mut self) -> IndexHealthReport {
        let mut issues = Vec::new();

        for (tag, ids) in &self.state.tags {
            for id in ids {
                if !self.state.documents.contains_key(id) {
                    issues.push(format!("tag '{tag}' references unknown entity {id}"));
                }
            }
        }
        for (term, postings) in &self.state.terms {
            for id in postings.keys() {
                if !self.state.documents.contains_key(id) {
                    issues.push(format!("term '{term}' references unknown entity {id}"));
                }
            }
        }
        for (id, doc) in &self.state.documents {
            for tag in &doc.tags {
                if !self
                    .state
                    .tags
                    .get(tag)
                    .is_some_and(|set| set.contains(id))
                {
                    issues.push(format!("entity {id} missing from tag '{tag}' postings"));
                }
            }
            if self.state.applied.get(id).is_none() {
                issues.push(format!("entity {id} has no applied sequence"));
            }
        }

        let healthy = issues.is_empty();
        if !healthy {
            tracing::warn!(index.issues = issues.len(), "index health check failed");
            self.degraded = true;
        }
        IndexHealthReport {
            healthy,
            entities: self.state.documents.len(),
            terms: self.state.terms.len(),
            issues,
        }
    }

    fn persist(&self) -> Result<()> {
        let raw = encode_to_vec(&self.state, record_config())?;
        let sealed = seal(&raw, ChunkEncoding::Lz4)?;
        // Snapshot writes coalesce in the low lane; bursts of updates cost
        // one physical write.
        self.queue.enqueue(
            JobPayload::WriteIndex {
                name: INDEX_SNAPSHOT_NAME.to_string(),
                bytes: sealed,
            },
            Priority::Low,
        )?;
        Ok(())
    }
}

fn prune(map: &mut BTreeMap<String, BTreeSet<EntityId>>, key: &str, id: EntityId) {
    if let Some(set) = map.get_mut(key) {
        set.remove(&id);
        if set.is_empty() {
            map.remove(key);
        }
    }
}
