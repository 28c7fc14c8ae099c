#![deny(clippy::all, clippy::pedantic)]
#![cfg_attr(not(test), deny(clippy::unwrap_used, clippy::expect_used))]
#![cfg_attr(
    test,
    allow(
        clippy::useless_vec,
        clippy::uninlined_format_args,
        clippy::cast_possible_truncation,
        clippy::float_cmp
    )
)]
#![allow(clippy::module_name_repetitions)]
//
// Strategic lint exceptions, allowed project-wide for pragmatic reasons:
//
// Documentation lints: internal/self-documenting functions don't need
// extensive docs; public APIs should still be documented.
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
//
// Cast safety: casts here are bounded by real-world constraints (chunk
// counts, record sizes); try_into() everywhere would add noise, not safety.
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_possible_wrap)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::cast_lossless)]
#![allow(clippy::cast_possible_truncation)]
//
// Style/complexity: storage operations naturally run long; splitting them
// would hurt readability.
#![allow(clippy::too_many_lines)]
#![allow(clippy::too_many_arguments)]
#![allow(clippy::similar_names)]
#![allow(clippy::manual_let_else)]
#![allow(clippy::match_same_arms)]
#![allow(clippy::needless_pass_by_value)]
#![allow(clippy::return_self_not_must_use)]
#![allow(clippy::unnecessary_wraps)]
#![allow(clippy::map_unwrap_or)]
#![allow(clippy::default_trait_access)]
#![allow(clippy::items_after_statements)]

//! Core storage engine for SessionVault.
//!
//! Sessions accumulate large, append-heavy payloads (screenshots, audio
//! transcript segments, video markers) over hours of recording, then must be
//! browsed and searched near-instantly. The engine answers that access
//! pattern with five cooperating components:
//!
//! - a bounded, TTL-aware [`cache`] fronting all reads,
//! - a journaled, priority-laned [`queue`] that owns every backing-store
//!   write,
//! - a content-addressed [`blob`] store deduplicating binary attachments,
//! - a chunked entity [`store`] separating small metadata from paginated
//!   bulk payloads,
//! - an inverted [`index`] for sub-100ms filtered search,
//!
//! all owned by one [`SessionVault`] composition root per storage directory.

/// The sessionvault-core crate version (matches `Cargo.toml`).
pub const SESSIONVAULT_CORE_VERSION: &str = env!("CARGO_PKG_VERSION");

pub mod blob;
pub mod cache;
pub mod constants;
pub mod engine;
pub mod error;
pub mod index;
pub mod io;
mod lock;
pub mod queue;
pub mod store;
pub mod types;

pub use blob::{BlobSidecar, BlobStore, GcReport};
pub use cache::{BoundedCache, CacheKey, CacheStats, CachedValue, KeySpace};
pub use engine::{EngineConfig, GcPolicy, SessionVault};
pub use error::{Result, VaultError};
pub use index::{IndexHealthReport, IndexManager};
pub use io::{FsBackend, QueueJournal};
pub use lock::DirLock;
pub use queue::{
    FailedJob, JobKey, JobOutcome, JobPayload, JobTicket, Priority, QueueConfig, QueueStats,
    WriteQueue,
};
pub use store::{EntityStore, FieldSpec};
pub use types::{
    AppendOutcome, BlobDigest, BoolOperator, BulkItem, ChunkEncoding, ChunkFault, DiskSpaceInfo,
    EntityId, EntityMetadata, EntityRecord, EntityStatus, FieldManifest, LoadOptions, LoadedEntity,
    SearchCriteria, SearchEngineKind, SearchOutcome,
};
