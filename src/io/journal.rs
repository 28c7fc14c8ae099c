//! Crash journal for the write queue.
//!
//! Append-only record log: one `Enqueued` record per accepted job, one
//! `Completed` record per applied job. On open, `Enqueued` records without a
//! matching `Completed` are the jobs that were pending or mid-flight when the
//! process died; the queue resets them to pending and reprocesses each
//! exactly once. A torn tail record (crash mid-append) is truncated away.

use std::collections::HashSet;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::error::{Result, VaultError};

// Record header: [seq: u64][len: u32][kind: u8][3 reserved][checksum: 32 bytes]
const RECORD_HEADER_SIZE: usize = 48;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JournalRecordKind {
    Enqueued,
    Completed,
}

impl JournalRecordKind {
    fn to_byte(self) -> u8 {
        match self {
            Self::Enqueued => 1,
            Self::Completed => 2,
        }
    }

    fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            1 => Some(Self::Enqueued),
            2 => Some(Self::Completed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalRecord {
    pub sequence: u64,
    pub kind: JournalRecordKind,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JournalStats {
    pub bytes: u64,
    pub appended_since_compact: u64,
    pub last_sequence: u64,
}

#[derive(Debug)]
pub struct QueueJournal {
    file: File,
    path: PathBuf,
    write_offset: u64,
    last_sequence: u64,
    appended_since_compact: u64,
    skip_sync: bool,
}

impl QueueJournal {
    /// Open (or create) the journal and return every valid record in it.
    pub fn open(path: &Path) -> Result<(Self, Vec<JournalRecord>)> {
        let mut file = fs_err::OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(path)?
            .into_parts()
            .0;

        let (records, valid_end) = scan_records(&mut file)?;
        let file_len = file.metadata()?.len();
        if valid_end < file_len {
            // Torn tail from a crash mid-append; drop it so later appends
            // start from a clean boundary.
            tracing::warn!(
                journal.valid_end = valid_end,
                journal.file_len = file_len,
                "truncating torn journal tail"
            );
            file.set_len(valid_end)?;
        }
        file.seek(SeekFrom::Start(valid_end))?;

        let last_sequence = records.iter().map(|r| r.sequence).max().unwrap_or(0);
        let journal = Self {
            file,
            path: path.to_path_buf(),
            write_offset: valid_end,
            last_sequence,
            appended_since_compact: 0,
            skip_sync: false,
        };
        Ok((journal, records))
    }

    /// Append one record and (unless batching) fsync it.
    pub fn append(
        &mut self,
        kind: JournalRecordKind,
        sequence: u64,
        payload: &[u8],
    ) -> Result<()> {
        let payload_len = u32::try_from(payload.len()).map_err(|_| VaultError::Encode(
            "journal payload exceeds u32::MAX bytes".into(),
        ))?;

        let digest = blake3::hash(payload);
        let mut record = Vec::with_capacity(RECORD_HEADER_SIZE + payload.len());
        record.extend_from_slice(&sequence.to_le_bytes());
        record.extend_from_slice(&payload_len.to_le_bytes());
        record.push(kind.to_byte());
        record.extend_from_slice(&[0u8; 3]);
        record.extend_from_slice(digest.as_bytes());
        record.extend_from_slice(payload);

        self.file.seek(SeekFrom::Start(self.write_offset))?;
        self.file.write_all(&record)?;
        if !self.skip_sync {
            self.file.sync_all()?;
        }

        self.write_offset += record.len() as u64;
        self.last_sequence = self.last_sequence.max(sequence);
        self.appended_since_compact += 1;
        tracing::trace!(
            journal.sequence = sequence,
            journal.kind = kind.to_byte(),
            journal.payload_len = payload.len(),
            "journal append"
        );
        Ok(())
    }

    /// Defer fsync to an explicit [`flush`](Self::flush); used while applying
    /// a batch so the batch pays for one sync, not one per record.
    pub fn set_skip_sync(&mut self, skip: bool) {
        self.skip_sync = skip;
    }

    pub fn flush(&mut self) -> Result<()> {
        self.file.sync_all().map_err(Into::into)
    }

    /// Rewrite the journal keeping only `live` records (outstanding jobs).
    /// Called once everything else has drained so the file does not grow
    /// without bound.
    pub fn compact(&mut self, live: &[JournalRecord]) -> Result<()> {
        let mut staged = atomic_write_file::AtomicWriteFile::options().open(&self.path)?;
        for record in live {
            let digest = blake3::hash(&record.payload);
            staged.write_all(&record.sequence.to_le_bytes())?;
            staged.write_all(&u32::try_from(record.payload.len()).map_err(|_| {
                VaultError::Encode("journal payload exceeds u32::MAX bytes".into())
            })?
            .to_le_bytes())?;
            staged.write_all(&[record.kind.to_byte(), 0, 0, 0])?;
            staged.write_all(digest.as_bytes())?;
            staged.write_all(&record.payload)?;
        }
        staged.commit()?;

        let mut file = fs_err::OpenOptions::new()
            .read(true)
            .write(true)
            .open(&self.path)?
            .into_parts()
            .0;
        let end = file.metadata()?.len();
        file.seek(SeekFrom::Start(end))?;
        self.file = file;
        self.write_offset = end;
        self.appended_since_compact = 0;
        tracing::debug!(
            journal.live_records = live.len(),
            journal.bytes = end,
            "journal compacted"
        );
        Ok(())
    }

    #[must_use]
    pub fn stats(&self) -> JournalStats {
        JournalStats {
            bytes: self.write_offset,
            appended_since_compact: self.appended_since_compact,
            last_sequence: self.last_sequence,
        }
    }

    #[must_use]
    pub fn last_sequence(&self) -> u64 {
        self.last_sequence
    }
}

/// Enqueued records that never completed, in original enqueue order.
#[must_use]
pub fn outstanding(records: &[JournalRecord]) -> Vec<JournalRecord> {
    let completed: HashSet<u64> = records
        .iter()
        .filter(|r| r.kind == JournalRecordKind::Completed)
        .map(|r| r.sequence)
        .collect();
    records
        .iter()
        .filter(|r| r.kind == JournalRecordKind::Enqueued && !completed.contains(&r.sequence))
        .cloned()
        .collect()
}

fn scan_records(file: &mut File) -> Result<(Vec<JournalRecord>, u64)> {
    let len = file.metadata()?.len();
    let mut records = Vec::new();
    let mut cursor = 0u64;

    while cursor + RECORD_HEADER_SIZE as u64 <= len {
        file.seek(SeekFrom::Start(cursor))?;
        let mut header = [0u8; RECORD_HEADER_SIZE];
        file.read_exact(&mut header)?;

        let sequence = u64::from_le_bytes(header[..8].try_into().map_err(|_| {
            VaultError::JournalCorruption {
                offset: cursor,
                reason: "invalid sequence header".into(),
            }
        })?);
        let payload_len = u64::from(u32::from_le_bytes(header[8..12].try_into().map_err(
            |_| VaultError::JournalCorruption {
                offset: cursor,
                reason: "invalid length header".into(),
            },
        )?));
        let Some(kind) = JournalRecordKind::from_byte(header[12]) else {
            // Unknown kind byte means a torn or foreign record; everything
            // from here on is untrustworthy.
            tracing::warn!(journal.offset = cursor, "unknown journal record kind");
            break;
        };
        let checksum = &header[16..48];

        if cursor + RECORD_HEADER_SIZE as u64 + payload_len > len {
            tracing::warn!(
                journal.offset = cursor,
                journal.payload_len = payload_len,
                "journal record extends past end of file"
            );
            break;
        }

        let mut payload = vec![0u8; usize::try_from(payload_len).map_err(|_| {
            VaultError::JournalCorruption {
                offset: cursor,
                reason: "record length too large for platform".into(),
            }
        })?];
        file.read_exact(&mut payload)?;
        if blake3::hash(&payload).as_bytes() != checksum {
            tracing::warn!(journal.offset = cursor, "journal record checksum mismatch");
            break;
        }

        records.push(JournalRecord {
            sequence,
            kind,
            payload,
        });
        cursor += RECORD_HEADER_SIZE as u64 + payload_len;
    }

    Ok((records, cursor))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn append_and_reopen() {
        let dir = tempdir().expect("tmp");
        let path = dir.path().join("queue.journal");

        {
            let (mut journal, records) = QueueJournal::open(&path).expect("open");
            assert!(records.is_empty());
            journal
                .append(JournalRecordKind::Enqueued, 1, b"job-one")
                .expect("append 1");
            journal
                .append(JournalRecordKind::Enqueued, 2, b"job-two")
                .expect("append 2");
            journal
                .append(JournalRecordKind::Completed, 1, &[])
                .expect("complete 1");
        }

        let (journal, records) = QueueJournal::open(&path).expect("reopen");
        assert_eq!(records.len(), 3);
        assert_eq!(journal.last_sequence(), 2);

        let pending = outstanding(&records);
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].sequence, 2);
        assert_eq!(pending[0].payload, b"job-two");
    }

    #[test]
    fn torn_tail_is_truncated() {
        let dir = tempdir().expect("tmp");
        let path = dir.path().join("queue.journal");

        {
            let (mut journal, _) = QueueJournal::open(&path).expect("open");
            journal
                .append(JournalRecordKind::Enqueued, 1, b"whole")
                .expect("append");
        }
        // Simulate a crash mid-append: garbage half-header at the tail.
        {
            let mut file = fs_err::OpenOptions::new()
                .append(true)
                .open(&path)
                .expect("append handle");
            file.write_all(&7u64.to_le_bytes()).expect("torn bytes");
        }

        let (journal, records) = QueueJournal::open(&path).expect("reopen");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].payload, b"whole");
        // Tail was cut back to the last valid boundary.
        assert_eq!(journal.stats().bytes, journal.write_offset);

        let file_len = fs_err::metadata(&path).expect("meta").len();
        assert_eq!(file_len, journal.write_offset);
    }

    #[test]
    fn compaction_keeps_only_live_records() {
        let dir = tempdir().expect("tmp");
        let path = dir.path().join("queue.journal");

        let (mut journal, _) = QueueJournal::open(&path).expect("open");
        for seq in 1..=8u64 {
            journal
                .append(JournalRecordKind::Enqueued, seq, format!("job-{seq}").as_bytes())
                .expect("append");
            if seq != 5 {
                journal
                    .append(JournalRecordKind::Completed, seq, &[])
                    .expect("complete");
            }
        }

        let live = vec![JournalRecord {
            sequence: 5,
            kind: JournalRecordKind::Enqueued,
            payload: b"job-5".to_vec(),
        }];
        journal.compact(&live).expect("compact");
        drop(journal);

        let (_, records) = QueueJournal::open(&path).expect("reopen");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].sequence, 5);
        assert_eq!(outstanding(&records).len(), 1);
    }
}
