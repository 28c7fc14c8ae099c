//! Layout names, capacities, and tuning defaults for the storage engine.

use std::time::Duration;

/// Version stamp embedded in every record envelope.
pub const ENVELOPE_VERSION: u16 = 1;

/// Lock file guarding single-process ownership of a storage root.
pub const LOCK_FILE_NAME: &str = ".lock";
/// Crash journal for the write queue.
pub const JOURNAL_FILE_NAME: &str = "queue.journal";

pub const ENTITIES_DIR: &str = "entities";
pub const BLOBS_DIR: &str = "blobs";
pub const INDEX_DIR: &str = "index";

/// Metadata record file name inside an entity directory.
pub const METADATA_FILE_NAME: &str = "meta.svm";
/// Chunk file extension (`chunk-00042.svc`).
pub const CHUNK_FILE_EXT: &str = "svc";
/// Blob content file extension.
pub const BLOB_FILE_EXT: &str = "bin";
/// Blob sidecar (reference table) extension.
pub const BLOB_SIDECAR_EXT: &str = "refs";
/// Persisted index snapshot file name.
pub const INDEX_SNAPSHOT_NAME: &str = "postings.svx";

/// Items per chunk unless the host declares a per-field capacity.
pub const DEFAULT_CHUNK_CAPACITY: u32 = 20;

/// Chunk payloads at or above this size are zstd-compressed.
pub const CHUNK_COMPRESS_THRESHOLD: usize = 4 * 1024;

/// Default resident-byte budget for the shared cache.
pub const DEFAULT_CACHE_MAX_BYTES: usize = 64 * 1024 * 1024;
/// Blobs larger than this bypass the cache entirely.
pub const BLOB_CACHE_LIMIT_BYTES: usize = 512 * 1024;
/// Cached blob bytes expire after this long; attachments are bulky and
/// rarely re-read, unlike metadata and tail chunks.
pub const BLOB_CACHE_TTL: Duration = Duration::from_secs(10 * 60);

/// Normal-lane batch window.
pub const BATCH_WINDOW: Duration = Duration::from_millis(100);
/// Base delay for exponential retry backoff.
pub const RETRY_BACKOFF_BASE: Duration = Duration::from_millis(25);
/// Upper bound for a single retry backoff step.
pub const RETRY_BACKOFF_CAP: Duration = Duration::from_secs(2);
/// Default bound on `shutdown()` draining.
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Journal records drained before an in-place compaction is attempted.
pub const JOURNAL_COMPACT_PERIOD: u64 = 256;

/// Minimum free disk space kept in reserve; writes that would dip below this
/// threshold are refused so the OS and other applications keep functioning.
pub const MIN_FREE_SPACE: u64 = 100 * 1024 * 1024;
/// Writes at or above this size trigger an up-front disk space check.
pub const FREE_SPACE_CHECK_THRESHOLD: u64 = 1024 * 1024;
