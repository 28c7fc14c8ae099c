//! Public search request/response types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::common::EntityId;
use super::entity::EntityStatus;

/// How multiple criteria combine into one result set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BoolOperator {
    /// Intersect every criterion's candidate set.
    And,
    /// Union every criterion's candidate set.
    Or,
    /// Everything except the union of the criteria.
    Not,
}

impl Default for BoolOperator {
    fn default() -> Self {
        Self::And
    }
}

/// Filter/rank request evaluated against the inverted index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchCriteria {
    /// Free text matched against name, notes, and category.
    #[serde(default)]
    pub text: Option<String>,
    /// Tag criteria; each tag contributes its own candidate set.
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub sub_category: Option<String>,
    #[serde(default)]
    pub status: Option<EntityStatus>,
    /// Inclusive start/end bounds on the entity's start time.
    #[serde(default)]
    pub date_range: Option<(DateTime<Utc>, DateTime<Utc>)>,
    #[serde(default)]
    pub operator: BoolOperator,
    /// Maximum ids returned.
    pub limit: usize,
}

impl Default for SearchCriteria {
    fn default() -> Self {
        Self {
            text: None,
            tags: Vec::new(),
            category: None,
            sub_category: None,
            status: None,
            date_range: None,
            operator: BoolOperator::default(),
            limit: 50,
        }
    }
}

impl SearchCriteria {
    /// True when no criterion is present; such a request lists everything up
    /// to the limit.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.text.as_deref().is_none_or(|t| t.trim().is_empty())
            && self.tags.is_empty()
            && self.category.is_none()
            && self.sub_category.is_none()
            && self.status.is_none()
            && self.date_range.is_none()
    }
}

/// Engine that satisfied a search request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchEngineKind {
    /// Posting-list evaluation (the fast path).
    Postings,
    /// Correct-but-slow linear scan over metadata, used while the index is
    /// degraded or rebuilding.
    LinearScan,
}

/// Ranked search result: entity ids to be resolved through the entity store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchOutcome {
    pub ids: Vec<EntityId>,
    /// Matches before the limit was applied.
    pub total: usize,
    pub engine: SearchEngineKind,
    pub elapsed_ms: u128,
}
