//! Error taxonomy for the storage engine.
//!
//! Transient IO failures are retried by the write queue and only surface once
//! retries are exhausted; structural errors (missing entity, corrupt chunk)
//! carry enough context for a caller to recover partially.

use thiserror::Error;

use crate::types::EntityId;

pub type Result<T> = std::result::Result<T, VaultError>;

#[derive(Debug, Error)]
pub enum VaultError {
    #[error("io failure: {0}")]
    Io(#[from] std::io::Error),

    #[error("entity {id} not found")]
    EntityNotFound { id: EntityId },

    #[error("blob {digest} not found")]
    BlobNotFound { digest: String },

    #[error("'{field}' is not a declared bulk field")]
    UnknownField { field: String },

    #[error("chunk {chunk} of field '{field}' on entity {entity} is corrupt: {reason}")]
    CorruptChunk {
        entity: EntityId,
        field: String,
        chunk: u32,
        reason: String,
    },

    #[error("metadata record for entity {entity} is corrupt: {reason}")]
    CorruptMetadata { entity: EntityId, reason: String },

    #[error("record envelope invalid: {reason}")]
    InvalidEnvelope { reason: String },

    #[error("queue journal corruption at offset {offset}: {reason}")]
    JournalCorruption { offset: u64, reason: String },

    #[error("index inconsistent: {reason}")]
    IndexInconsistent { reason: String },

    #[error("write job for {key} exhausted {attempts} attempts: {reason}")]
    QueueExhausted {
        key: String,
        attempts: u32,
        reason: String,
    },

    #[error("write queue is shut down")]
    QueueClosed,

    #[error("storage lock unavailable: {0}")]
    Lock(String),

    #[error("decode failed: {0}")]
    Decode(String),

    #[error("encode failed: {0}")]
    Encode(String),

    #[error(
        "insufficient disk space: {available_mb} MB available, {required_mb} MB required"
    )]
    InsufficientSpace { available_mb: u64, required_mb: u64 },

    #[error("shutdown timed out with {remaining} jobs outstanding")]
    ShutdownTimeout { remaining: usize },
}

impl From<bincode::error::DecodeError> for VaultError {
    fn from(err: bincode::error::DecodeError) -> Self {
        Self::Decode(err.to_string())
    }
}

impl From<bincode::error::EncodeError> for VaultError {
    fn from(err: bincode::error::EncodeError) -> Self {
        Self::Encode(err.to_string())
    }
}
