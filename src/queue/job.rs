//! Job, key, and priority types for the write queue.

use std::fmt;
use std::time::Instant;

use crossbeam_channel::Receiver;
use serde::{Deserialize, Serialize};

use crate::error::{Result, VaultError};
use crate::types::{BlobDigest, EntityId};

/// Scheduling class for a queued write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    /// Applied immediately on receipt; a single retry.
    Critical,
    /// Batched within a short window; retried with exponential backoff.
    Normal,
    /// Applied only when no higher-priority work is pending.
    Low,
}

impl Priority {
    /// Total attempts (first try included) this lane allows.
    #[must_use]
    pub fn max_attempts(self) -> u32 {
        match self {
            Self::Critical => 2,
            Self::Normal => 4,
            Self::Low => 6,
        }
    }
}

/// Closed set of deferred write operations. Every payload is a plain
/// backing-store record mutation, so the worker needs nothing beyond the
/// filesystem backend to apply any of them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum JobPayload {
    WriteMetadata {
        entity: EntityId,
        bytes: Vec<u8>,
    },
    WriteChunk {
        entity: EntityId,
        field: String,
        chunk: u32,
        bytes: Vec<u8>,
    },
    DeleteChunk {
        entity: EntityId,
        field: String,
        chunk: u32,
    },
    DeleteEntity {
        entity: EntityId,
    },
    WriteBlob {
        digest: BlobDigest,
        bytes: Vec<u8>,
    },
    WriteBlobSidecar {
        digest: BlobDigest,
        bytes: Vec<u8>,
    },
    /// Removes both the content bytes and the sidecar.
    DeleteBlob {
        digest: BlobDigest,
    },
    WriteIndex {
        name: String,
        bytes: Vec<u8>,
    },
}

impl JobPayload {
    /// Coalescing key: jobs sharing a key collapse to the latest payload.
    #[must_use]
    pub fn key(&self) -> JobKey {
        match self {
            Self::WriteMetadata { entity, .. } => JobKey::Metadata(*entity),
            Self::WriteChunk {
                entity,
                field,
                chunk,
                ..
            }
            | Self::DeleteChunk {
                entity,
                field,
                chunk,
            } => JobKey::Chunk(*entity, field.clone(), *chunk),
            Self::DeleteEntity { entity } => JobKey::Entity(*entity),
            Self::WriteBlob { digest, .. } | Self::DeleteBlob { digest } => {
                JobKey::Blob(*digest)
            }
            Self::WriteBlobSidecar { digest, .. } => JobKey::BlobSidecar(*digest),
            Self::WriteIndex { name, .. } => JobKey::Index(name.clone()),
        }
    }

    /// Approximate payload size, used for disk-space guards and stats.
    #[must_use]
    pub fn weight_bytes(&self) -> usize {
        match self {
            Self::WriteMetadata { bytes, .. }
            | Self::WriteChunk { bytes, .. }
            | Self::WriteBlob { bytes, .. }
            | Self::WriteBlobSidecar { bytes, .. }
            | Self::WriteIndex { bytes, .. } => bytes.len(),
            Self::DeleteChunk { .. } | Self::DeleteEntity { .. } | Self::DeleteBlob { .. } => 0,
        }
    }
}

/// Identifies the backing-store record a job targets.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum JobKey {
    Metadata(EntityId),
    Chunk(EntityId, String, u32),
    Entity(EntityId),
    Blob(BlobDigest),
    BlobSidecar(BlobDigest),
    Index(String),
}

impl JobKey {
    /// Owning entity, when the key belongs to the entity namespace.
    #[must_use]
    pub fn entity(&self) -> Option<EntityId> {
        match self {
            Self::Metadata(id) | Self::Chunk(id, _, _) | Self::Entity(id) => Some(*id),
            Self::Blob(_) | Self::BlobSidecar(_) | Self::Index(_) => None,
        }
    }
}

impl fmt::Display for JobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Metadata(id) => write!(f, "metadata/{id}"),
            Self::Chunk(id, field, chunk) => write!(f, "chunk/{id}/{field}/{chunk}"),
            Self::Entity(id) => write!(f, "entity/{id}"),
            Self::Blob(digest) => write!(f, "blob/{digest}"),
            Self::BlobSidecar(digest) => write!(f, "blob-refs/{digest}"),
            Self::Index(name) => write!(f, "index/{name}"),
        }
    }
}

/// Terminal state of a queued job, delivered through its [`JobTicket`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Applied,
    /// Dropped because a later job (entity delete) made it moot.
    Superseded,
    Failed(String),
}

/// Completion handle returned by `enqueue`.
#[derive(Debug)]
pub struct JobTicket {
    pub(crate) sequence: u64,
    pub(crate) rx: Receiver<JobOutcome>,
}

impl JobTicket {
    #[must_use]
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Block until the job reaches a terminal state.
    pub fn wait(&self) -> Result<JobOutcome> {
        self.rx.recv().map_err(|_| VaultError::QueueClosed)
    }

    /// Block until the job is applied, converting failure into an error.
    pub fn wait_applied(&self) -> Result<()> {
        match self.wait()? {
            JobOutcome::Applied | JobOutcome::Superseded => Ok(()),
            JobOutcome::Failed(reason) => Err(VaultError::QueueExhausted {
                key: format!("job #{}", self.sequence),
                attempts: 0,
                reason,
            }),
        }
    }
}

/// A job that exhausted its retry budget, surfaced on the failure channel
/// with the original payload so callers can re-enqueue or alert.
#[derive(Debug, Clone)]
pub struct FailedJob {
    pub sequence: u64,
    pub key: JobKey,
    pub payload: JobPayload,
    pub attempts: u32,
    pub reason: String,
}

/// Snapshot of queue depth and lifetime counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub pending: usize,
    pub processing: usize,
    pub critical_pending: usize,
    pub normal_pending: usize,
    pub low_pending: usize,
    pub retry_pending: usize,
    pub completed: u64,
    pub failed: u64,
    pub coalesced: u64,
    /// Jobs replayed from the journal after a crash.
    pub recovered: u64,
}

/// Internal queued unit: payload plus scheduling state. Tickets accumulate
/// when coalescing merges jobs for one key.
#[derive(Debug)]
pub(crate) struct QueueJob {
    pub sequence: u64,
    pub payload: JobPayload,
    pub priority: Priority,
    pub attempts: u32,
    pub enqueued_at: Instant,
    pub tickets: Vec<crossbeam_channel::Sender<JobOutcome>>,
    /// Journal sequences superseded into this job via coalescing; completed
    /// alongside it so the journal drains fully.
    pub merged_sequences: Vec<u64>,
}

/// Journaled form of a job (payload + priority), bincode-encoded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct JournaledJob {
    pub payload: JobPayload,
    pub priority: Priority,
}
