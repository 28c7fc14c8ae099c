//! Backing-store IO: filesystem layout, atomic record writes, and the write
//! queue's crash journal.

pub mod backend;
pub mod journal;

pub use backend::FsBackend;
pub use journal::{JournalRecord, JournalRecordKind, JournalStats, QueueJournal};
