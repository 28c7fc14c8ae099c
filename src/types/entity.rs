//! Entity-facing types: the small metadata record, bulk items, and the
//! results of full loads and appends.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::common::{BlobDigest, EntityId};
use super::manifest::FieldManifest;

/// Lifecycle state of a tracked session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityStatus {
    #[default]
    Active,
    Completed,
    Archived,
}

impl EntityStatus {
    /// Canonical token used in the status posting list.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Archived => "archived",
        }
    }
}

/// Small, frequently-read summary of one entity.
///
/// Stays bounded (tens of KB) no matter how large the bulk payload grows:
/// bulk fields appear only as [`FieldManifest`] bookkeeping, and binary
/// previews only as blob digests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityMetadata {
    pub id: EntityId,
    pub name: String,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub duration_secs: Option<i64>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub sub_category: Option<String>,
    #[serde(default)]
    pub status: EntityStatus,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub notes: Option<String>,
    /// Representative thumbnail, resolved through the blob store on demand.
    #[serde(default)]
    pub preview: Option<BlobDigest>,
    /// Monotonic mutation version. The index manager records the last
    /// sequence it applied per entity, which makes the eventual-consistency
    /// window observable instead of implicit.
    pub sequence: u64,
    pub updated_at: DateTime<Utc>,
    /// Chunk bookkeeping per bulk field.
    #[serde(default)]
    pub manifests: BTreeMap<String, FieldManifest>,
}

impl EntityMetadata {
    /// Fresh metadata for a new entity with a generated id.
    #[must_use]
    pub fn new<S: Into<String>>(name: S) -> Self {
        let now = Utc::now();
        Self {
            id: EntityId::new_v4(),
            name: name.into(),
            started_at: now,
            ended_at: None,
            duration_secs: None,
            category: None,
            sub_category: None,
            status: EntityStatus::default(),
            tags: Vec::new(),
            notes: None,
            preview: None,
            sequence: 0,
            updated_at: now,
            manifests: BTreeMap::new(),
        }
    }

    /// Item count for a bulk field as of the last metadata write.
    #[must_use]
    pub fn item_count(&self, field: &str) -> u64 {
        self.manifests.get(field).map_or(0, |m| m.item_count)
    }

    /// Whether a bulk field holds any items.
    #[must_use]
    pub fn has_field(&self, field: &str) -> bool {
        self.item_count(field) > 0
    }

    #[must_use]
    pub fn has_notes(&self) -> bool {
        self.notes.as_deref().is_some_and(|n| !n.trim().is_empty())
    }
}

/// One element of a bulk field (a screenshot entry, an audio transcript
/// segment, a video marker). The engine interprets only `attachment`; the
/// payload is opaque host data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BulkItem {
    pub id: String,
    pub recorded_at: DateTime<Utc>,
    /// Binary payload stored in the blob store, referenced by digest.
    #[serde(default)]
    pub attachment: Option<BlobDigest>,
    /// Host-defined fields (relative time, transcript text, dimensions, ...).
    #[serde(default)]
    pub payload: Value,
}

impl BulkItem {
    #[must_use]
    pub fn new<S: Into<String>>(id: S, recorded_at: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            recorded_at,
            attachment: None,
            payload: Value::Null,
        }
    }

    #[must_use]
    pub fn with_attachment(mut self, digest: BlobDigest) -> Self {
        self.attachment = Some(digest);
        self
    }

    #[must_use]
    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }
}

/// Full entity as supplied to `save`: metadata plus every bulk field's items.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityRecord {
    pub metadata: EntityMetadata,
    #[serde(default)]
    pub fields: BTreeMap<String, Vec<BulkItem>>,
}

impl EntityRecord {
    #[must_use]
    pub fn new(metadata: EntityMetadata) -> Self {
        Self {
            metadata,
            fields: BTreeMap::new(),
        }
    }
}

/// A chunk that failed to load during a full read. The rest of the entity is
/// still returned so callers can render partial data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkFault {
    pub field: String,
    pub chunk: u32,
    pub reason: String,
}

/// Controls for `load_full`.
#[derive(Debug, Clone, Copy)]
pub struct LoadOptions {
    /// Resolve attachment digests into bytes via the blob store.
    pub resolve_attachments: bool,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            resolve_attachments: true,
        }
    }
}

/// Result of `load_full`: metadata, every readable chunk's items, resolved
/// attachment bytes, and any per-chunk faults encountered along the way.
#[derive(Debug, Clone, Default)]
pub struct LoadedEntity {
    pub metadata: Option<EntityMetadata>,
    pub fields: BTreeMap<String, Vec<BulkItem>>,
    pub attachments: BTreeMap<BlobDigest, Vec<u8>>,
    pub faults: Vec<ChunkFault>,
}

impl LoadedEntity {
    /// Exact item count observed in the loaded chunks (unlike the manifest's
    /// `item_count`, this can never lag).
    #[must_use]
    pub fn item_count(&self, field: &str) -> usize {
        self.fields.get(field).map_or(0, Vec::len)
    }
}

/// Receipt for a single `append_item` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppendOutcome {
    /// Chunk the item landed in.
    pub chunk: u32,
    /// Whether the append rolled over into a freshly created chunk.
    pub created_chunk: bool,
    /// Items in the field after the append.
    pub item_count: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metadata_summary_helpers() {
        let mut meta = EntityMetadata::new("focus block");
        assert!(!meta.has_field("screenshots"));
        assert!(!meta.has_notes());

        meta.manifests.insert(
            "screenshots".to_string(),
            FieldManifest {
                chunk_count: 2,
                capacity: 20,
                item_count: 27,
            },
        );
        meta.notes = Some("retro notes".to_string());

        assert_eq!(meta.item_count("screenshots"), 27);
        assert!(meta.has_field("screenshots"));
        assert!(meta.has_notes());
    }

    #[test]
    fn status_tokens_are_stable() {
        assert_eq!(EntityStatus::Active.as_str(), "active");
        assert_eq!(EntityStatus::Completed.as_str(), "completed");
        assert_eq!(EntityStatus::Archived.as_str(), "archived");
    }
}
