//! Priority-ordered asynchronous write queue.
//!
//! The only component that touches the backing store with writes. Jobs are
//! journaled on acceptance, routed into three lanes (critical / normal / low),
//! coalesced per key (last writer wins), applied by a single worker thread,
//! and journal-completed once durable. Jobs outstanding in the journal when a
//! process dies are reset to pending on the next open and reprocessed exactly
//! once.

pub mod job;

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use bincode::config::{self, Config};
use bincode::serde::{decode_from_slice, encode_to_vec};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded, unbounded};

use crate::constants::{
    BATCH_WINDOW, DEFAULT_SHUTDOWN_TIMEOUT, JOURNAL_COMPACT_PERIOD, RETRY_BACKOFF_BASE,
    RETRY_BACKOFF_CAP,
};
use crate::error::{Result, VaultError};
use crate::io::journal::{JournalRecordKind, QueueJournal, outstanding};
use crate::io::FsBackend;
use crate::types::EntityId;

pub use job::{FailedJob, JobKey, JobOutcome, JobPayload, JobTicket, Priority, QueueStats};
use job::{JournaledJob, QueueJob};

fn journal_codec() -> impl Config {
    config::standard().with_fixed_int_encoding()
}

/// Tuning knobs for the queue; defaults follow `constants`.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub batch_window: Duration,
    pub shutdown_timeout: Duration,
    pub journal_compact_period: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            batch_window: BATCH_WINDOW,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            journal_compact_period: JOURNAL_COMPACT_PERIOD,
        }
    }
}

enum Command {
    Submit(QueueJob),
    PurgeEntity(EntityId),
    Flush(Sender<()>),
    Shutdown { deadline: Instant, ack: Sender<usize> },
}

struct Shared {
    stats: Mutex<QueueStats>,
    paused: AtomicBool,
    closed: AtomicBool,
    next_sequence: AtomicU64,
    journal: Mutex<QueueJournal>,
    failures_tx: Sender<FailedJob>,
    failures_rx: Receiver<FailedJob>,
}

impl Shared {
    fn stats_mut(&self) -> std::sync::MutexGuard<'_, QueueStats> {
        self.stats.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn journal_mut(&self) -> std::sync::MutexGuard<'_, QueueJournal> {
        self.journal.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Handle to the queue; cheap to share behind an `Arc`.
pub struct WriteQueue {
    tx: Sender<Command>,
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
    config: QueueConfig,
}

impl WriteQueue {
    /// Open the queue against `backend`, replaying any journaled jobs left
    /// over from a previous process.
    pub fn open(backend: Arc<FsBackend>, config: QueueConfig) -> Result<Self> {
        let (journal, records) = QueueJournal::open(&backend.journal_path())?;
        let recovered = outstanding(&records);
        let last_sequence = journal.last_sequence();

        let (failures_tx, failures_rx) = unbounded();
        let shared = Arc::new(Shared {
            stats: Mutex::new(QueueStats::default()),
            paused: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            next_sequence: AtomicU64::new(last_sequence),
            journal: Mutex::new(journal),
            failures_tx,
            failures_rx,
        });

        let (tx, rx) = unbounded();
        let worker = Worker {
            backend,
            shared: Arc::clone(&shared),
            rx,
            config: config.clone(),
            lanes: Lanes::default(),
            retries: Vec::new(),
            normal_deadline: None,
        };
        let handle = std::thread::Builder::new()
            .name("sessionvault-writeq".into())
            .spawn(move || worker.run())
            .map_err(VaultError::Io)?;

        let queue = Self {
            tx,
            shared,
            worker: Mutex::new(Some(handle)),
            config,
        };

        for record in recovered {
            match decode_from_slice::<JournaledJob, _>(&record.payload, journal_codec()) {
                Ok((journaled, _)) => {
                    tracing::info!(
                        job.sequence = record.sequence,
                        job.key = %journaled.payload.key(),
                        "recovering journaled job"
                    );
                    queue.resubmit(record.sequence, journaled.payload, journaled.priority);
                }
                Err(err) => {
                    tracing::warn!(
                        job.sequence = record.sequence,
                        error = %err,
                        "dropping undecodable journaled job"
                    );
                }
            }
        }

        Ok(queue)
    }

    /// Accept a job: journal it, invalidate nothing (callers already did),
    /// and hand it to the worker. Returns a completion ticket.
    pub fn enqueue(&self, payload: JobPayload, priority: Priority) -> Result<JobTicket> {
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(VaultError::QueueClosed);
        }
        let sequence = self.shared.next_sequence.fetch_add(1, Ordering::AcqRel) + 1;
        let journaled = JournaledJob {
            payload: payload.clone(),
            priority,
        };
        let bytes = encode_to_vec(&journaled, journal_codec())?;
        self.shared
            .journal_mut()
            .append(JournalRecordKind::Enqueued, sequence, &bytes)?;

        let (done_tx, done_rx) = bounded(1);
        let job = QueueJob {
            sequence,
            payload,
            priority,
            attempts: 0,
            enqueued_at: Instant::now(),
            tickets: vec![done_tx],
            merged_sequences: Vec::new(),
        };
        self.shared.stats_mut().pending += 1;
        self.tx
            .send(Command::Submit(job))
            .map_err(|_| VaultError::QueueClosed)?;
        Ok(JobTicket {
            sequence,
            rx: done_rx,
        })
    }

    /// Re-inject a journaled job after crash recovery (already journaled, no
    /// ticket holder).
    fn resubmit(&self, sequence: u64, payload: JobPayload, priority: Priority) {
        let job = QueueJob {
            sequence,
            payload,
            priority,
            attempts: 0,
            enqueued_at: Instant::now(),
            tickets: Vec::new(),
            merged_sequences: Vec::new(),
        };
        {
            let mut stats = self.shared.stats_mut();
            stats.pending += 1;
            stats.recovered += 1;
        }
        let _ = self.tx.send(Command::Submit(job));
    }

    /// Drop queued work belonging to `entity` (superseded by its deletion).
    pub fn purge_entity(&self, entity: EntityId) {
        let _ = self.tx.send(Command::PurgeEntity(entity));
    }

    pub fn pause(&self) {
        self.shared.paused.store(true, Ordering::Release);
    }

    pub fn resume(&self) {
        self.shared.paused.store(false, Ordering::Release);
    }

    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.shared.paused.load(Ordering::Acquire)
    }

    /// Synchronously drain every lane (retries included).
    pub fn flush(&self) -> Result<()> {
        let (ack_tx, ack_rx) = bounded(1);
        self.tx
            .send(Command::Flush(ack_tx))
            .map_err(|_| VaultError::QueueClosed)?;
        ack_rx.recv().map_err(|_| VaultError::QueueClosed)
    }

    /// Events for jobs that exhausted their retry budget.
    #[must_use]
    pub fn failure_events(&self) -> Receiver<FailedJob> {
        self.shared.failures_rx.clone()
    }

    #[must_use]
    pub fn stats(&self) -> QueueStats {
        self.shared.stats_mut().clone()
    }

    /// Drain with the configured bound and stop the worker. Jobs still
    /// unfinished at the deadline are reported failed but stay journaled for
    /// recovery on the next open.
    pub fn shutdown(&self) -> Result<()> {
        self.shutdown_within(self.config.shutdown_timeout)
    }

    pub fn shutdown_within(&self, timeout: Duration) -> Result<()> {
        self.shared.closed.store(true, Ordering::Release);
        let handle = {
            let mut guard = self.worker.lock().unwrap_or_else(PoisonError::into_inner);
            guard.take()
        };
        let Some(handle) = handle else {
            return Ok(());
        };

        let (ack_tx, ack_rx) = bounded(1);
        let remaining = match self.tx.send(Command::Shutdown {
            deadline: Instant::now() + timeout,
            ack: ack_tx,
        }) {
            Ok(()) => ack_rx.recv().unwrap_or(0),
            Err(_) => 0,
        };
        if handle.join().is_err() {
            tracing::warn!("write queue worker panicked during shutdown");
        }
        if remaining > 0 {
            return Err(VaultError::ShutdownTimeout { remaining });
        }
        Ok(())
    }
}

impl Drop for WriteQueue {
    fn drop(&mut self) {
        if !self.shared.closed.load(Ordering::Acquire) {
            let _ = self.shutdown();
        }
    }
}

#[derive(Default)]
struct Lane {
    order: VecDeque<JobKey>,
    jobs: HashMap<JobKey, QueueJob>,
}

impl Lane {
    /// Insert with last-writer-wins coalescing. Returns true when an
    /// existing job for the key was replaced.
    fn insert(&mut self, job: QueueJob) -> bool {
        let key = job.payload.key();
        match self.jobs.get_mut(&key) {
            Some(existing) => {
                let mut superseded = std::mem::replace(existing, job);
                existing.tickets.append(&mut superseded.tickets);
                existing
                    .merged_sequences
                    .append(&mut superseded.merged_sequences);
                existing.merged_sequences.push(superseded.sequence);
                // Keep the original queue position so per-key order holds.
                existing.enqueued_at = superseded.enqueued_at;
                true
            }
            None => {
                self.order.push_back(key.clone());
                self.jobs.insert(key, job);
                false
            }
        }
    }

    fn pop_front(&mut self) -> Option<QueueJob> {
        while let Some(key) = self.order.pop_front() {
            if let Some(job) = self.jobs.remove(&key) {
                return Some(job);
            }
        }
        None
    }

    fn remove_entity(&mut self, entity: EntityId) -> Vec<QueueJob> {
        let keys: Vec<JobKey> = self
            .jobs
            .keys()
            .filter(|key| key.entity() == Some(entity))
            .cloned()
            .collect();
        keys.iter().filter_map(|key| self.jobs.remove(key)).collect()
    }

    fn len(&self) -> usize {
        self.jobs.len()
    }
}

#[derive(Default)]
struct Lanes {
    critical: Lane,
    normal: Lane,
    low: Lane,
}

impl Lanes {
    fn lane_mut(&mut self, priority: Priority) -> &mut Lane {
        match priority {
            Priority::Critical => &mut self.critical,
            Priority::Normal => &mut self.normal,
            Priority::Low => &mut self.low,
        }
    }
}

struct RetryEntry {
    due: Instant,
    job: QueueJob,
}

struct Worker {
    backend: Arc<FsBackend>,
    shared: Arc<Shared>,
    rx: Receiver<Command>,
    config: QueueConfig,
    lanes: Lanes,
    retries: Vec<RetryEntry>,
    normal_deadline: Option<Instant>,
}

impl Worker {
    fn run(mut self) {
        loop {
            let timeout = self.next_wakeup();
            match self.rx.recv_timeout(timeout) {
                Ok(Command::Submit(job)) => self.accept(job),
                Ok(Command::PurgeEntity(entity)) => self.purge(entity),
                Ok(Command::Flush(ack)) => {
                    self.drain(None);
                    self.maybe_compact(true);
                    let _ = ack.send(());
                }
                Ok(Command::Shutdown { deadline, ack }) => {
                    self.drain(Some(deadline));
                    let remaining = self.fail_remaining("shutdown timeout elapsed");
                    if remaining == 0 {
                        // Unfinished jobs stay journaled for recovery; only a
                        // fully drained journal may compact away.
                        self.maybe_compact(true);
                    }
                    let _ = ack.send(remaining);
                    return;
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    self.drain(Some(Instant::now() + self.config.shutdown_timeout));
                    self.fail_remaining("queue dropped");
                    return;
                }
            }
            if !self.shared.paused.load(Ordering::Acquire) {
                self.pump();
            }
            self.publish_depths();
        }
    }

    fn next_wakeup(&self) -> Duration {
        let mut deadline: Option<Instant> = None;
        if let Some(normal) = self.normal_deadline {
            deadline = Some(normal);
        }
        if let Some(retry) = self.retries.iter().map(|r| r.due).min() {
            deadline = Some(deadline.map_or(retry, |d| d.min(retry)));
        }
        if self.lanes.low.len() > 0 || self.lanes.critical.len() > 0 {
            // Idle work exists; poll soon even with no timer armed.
            let soon = Instant::now() + self.config.batch_window;
            deadline = Some(deadline.map_or(soon, |d| d.min(soon)));
        }
        match deadline {
            Some(at) => at.saturating_duration_since(Instant::now()),
            None => Duration::from_millis(250),
        }
    }

    fn accept(&mut self, job: QueueJob) {
        if job.priority == Priority::Critical && !self.shared.paused.load(Ordering::Acquire) {
            self.execute(job);
            return;
        }
        let priority = job.priority;
        let coalesced = self.lanes.lane_mut(priority).insert(job);
        if coalesced {
            let mut stats = self.shared.stats_mut();
            stats.coalesced += 1;
            stats.pending = stats.pending.saturating_sub(1);
        }
        if priority == Priority::Normal && self.normal_deadline.is_none() {
            self.normal_deadline = Some(Instant::now() + self.config.batch_window);
        }
    }

    fn purge(&mut self, entity: EntityId) {
        let mut dropped = Vec::new();
        dropped.extend(self.lanes.critical.remove_entity(entity));
        dropped.extend(self.lanes.normal.remove_entity(entity));
        dropped.extend(self.lanes.low.remove_entity(entity));
        let (kept, purged): (Vec<RetryEntry>, Vec<RetryEntry>) = self
            .retries
            .drain(..)
            .partition(|entry| entry.job.payload.key().entity() != Some(entity));
        self.retries = kept;
        dropped.extend(purged.into_iter().map(|entry| entry.job));

        for job in dropped {
            tracing::debug!(job.key = %job.payload.key(), "purging superseded job");
            self.settle(job, JobOutcome::Superseded);
        }
    }

    fn pump(&mut self) {
        self.run_due_retries();

        // Anything parked in the critical lane (accepted while paused) goes
        // first.
        while let Some(job) = self.lanes.critical.pop_front() {
            self.execute(job);
        }

        let normal_due = self
            .normal_deadline
            .is_some_and(|deadline| Instant::now() >= deadline);
        if normal_due {
            self.run_normal_batch();
        }

        // Low lane runs only when no higher-priority work is waiting.
        let idle = self.lanes.normal.len() == 0
            && self.lanes.critical.len() == 0
            && self.rx.is_empty()
            && !self.retries.iter().any(|r| r.due <= Instant::now());
        if idle {
            if let Some(job) = self.lanes.low.pop_front() {
                self.execute(job);
            }
        }
    }

    fn run_due_retries(&mut self) {
        let now = Instant::now();
        let due: Vec<QueueJob> = {
            let (due, pending): (Vec<RetryEntry>, Vec<RetryEntry>) = self
                .retries
                .drain(..)
                .partition(|entry| entry.due <= now);
            self.retries = pending;
            due.into_iter().map(|entry| entry.job).collect()
        };
        for job in due {
            self.execute(job);
        }
    }

    fn run_normal_batch(&mut self) {
        self.normal_deadline = None;
        let batch_len = self.lanes.normal.len();
        if batch_len == 0 {
            return;
        }
        tracing::debug!(queue.batch_len = batch_len, "applying normal batch");
        // One fsync per batch instead of one per record.
        self.shared.journal_mut().set_skip_sync(true);
        while let Some(job) = self.lanes.normal.pop_front() {
            self.execute(job);
        }
        {
            let mut journal = self.shared.journal_mut();
            journal.set_skip_sync(false);
            if let Err(err) = journal.flush() {
                tracing::warn!(error = %err, "journal batch flush failed");
            }
        }
        self.maybe_compact(false);
    }

    fn drain(&mut self, deadline: Option<Instant>) {
        let expired = |deadline: Option<Instant>| {
            deadline.is_some_and(|d| Instant::now() >= d)
        };
        loop {
            // Pull in anything already sent to the channel, even past the
            // deadline, so stranded jobs are counted and reported.
            while let Ok(cmd) = self.rx.try_recv() {
                match cmd {
                    Command::Submit(job) => self.accept(job),
                    Command::PurgeEntity(entity) => self.purge(entity),
                    Command::Flush(ack) => {
                        let _ = ack.send(());
                    }
                    Command::Shutdown { ack, .. } => {
                        let _ = ack.send(0);
                    }
                }
            }
            if expired(deadline) {
                return;
            }

            while let Some(job) = self.lanes.critical.pop_front() {
                self.execute(job);
                if expired(deadline) {
                    return;
                }
            }
            self.normal_deadline = None;
            while let Some(job) = self.lanes.normal.pop_front() {
                self.execute(job);
                if expired(deadline) {
                    return;
                }
            }
            while let Some(job) = self.lanes.low.pop_front() {
                self.execute(job);
                if expired(deadline) {
                    return;
                }
            }

            if self.retries.is_empty() {
                if self.rx.is_empty() {
                    return;
                }
                continue;
            }
            // Honor backoff while draining, but never past the deadline.
            let next_due = self
                .retries
                .iter()
                .map(|r| r.due)
                .min()
                .unwrap_or_else(Instant::now);
            let wake = match deadline {
                Some(d) => next_due.min(d),
                None => next_due,
            };
            std::thread::sleep(wake.saturating_duration_since(Instant::now()));
            self.run_due_retries();
        }
    }

    fn fail_remaining(&mut self, reason: &str) -> usize {
        let mut remaining = Vec::new();
        while let Some(job) = self.lanes.critical.pop_front() {
            remaining.push(job);
        }
        while let Some(job) = self.lanes.normal.pop_front() {
            remaining.push(job);
        }
        while let Some(job) = self.lanes.low.pop_front() {
            remaining.push(job);
        }
        remaining.extend(self.retries.drain(..).map(|entry| entry.job));

        let count = remaining.len();
        for job in remaining {
            // Not journal-completed: the job stays recoverable on next open.
            self.report_failure(&job, reason);
            let mut stats = self.shared.stats_mut();
            stats.pending = stats.pending.saturating_sub(1);
            stats.failed += 1;
            drop(stats);
            for ticket in &job.tickets {
                let _ = ticket.send(JobOutcome::Failed(reason.to_string()));
            }
        }
        count
    }

    fn execute(&mut self, mut job: QueueJob) {
        {
            let mut stats = self.shared.stats_mut();
            stats.processing += 1;
        }
        loop {
            job.attempts += 1;
            match apply(&self.backend, &job.payload) {
                Ok(()) => {
                    self.shared.stats_mut().processing -= 1;
                    self.settle(job, JobOutcome::Applied);
                    return;
                }
                Err(err) if job.attempts < job.priority.max_attempts() => {
                    tracing::warn!(
                        job.key = %job.payload.key(),
                        job.attempts = job.attempts,
                        error = %err,
                        "write job failed; will retry"
                    );
                    if job.priority == Priority::Critical {
                        continue;
                    }
                    let backoff = backoff_delay(job.attempts);
                    self.shared.stats_mut().processing -= 1;
                    self.retries.push(RetryEntry {
                        due: Instant::now() + backoff,
                        job,
                    });
                    return;
                }
                Err(err) => {
                    self.shared.stats_mut().processing -= 1;
                    self.fail(job, err.to_string());
                    return;
                }
            }
        }
    }

    /// Mark a job terminal-successful: journal completion for it and every
    /// sequence coalesced into it, then resolve tickets.
    fn settle(&mut self, job: QueueJob, outcome: JobOutcome) {
        {
            let mut journal = self.shared.journal_mut();
            for seq in job.merged_sequences.iter().chain([&job.sequence]) {
                if let Err(err) = journal.append(JournalRecordKind::Completed, *seq, &[]) {
                    tracing::warn!(error = %err, "journal completion append failed");
                }
            }
        }
        {
            let mut stats = self.shared.stats_mut();
            stats.pending = stats.pending.saturating_sub(1);
            stats.completed += 1;
        }
        for ticket in &job.tickets {
            let _ = ticket.send(outcome.clone());
        }
    }

    fn fail(&mut self, job: QueueJob, reason: String) {
        tracing::error!(
            job.key = %job.payload.key(),
            job.attempts = job.attempts,
            reason = %reason,
            "write job exhausted retries"
        );
        // Journal-complete so the failed payload is not replayed forever; the
        // failure event carries it for the caller to decide.
        {
            let mut journal = self.shared.journal_mut();
            for seq in job.merged_sequences.iter().chain([&job.sequence]) {
                if let Err(err) = journal.append(JournalRecordKind::Completed, *seq, &[]) {
                    tracing::warn!(error = %err, "journal completion append failed");
                }
            }
        }
        {
            let mut stats = self.shared.stats_mut();
            stats.pending = stats.pending.saturating_sub(1);
            stats.failed += 1;
        }
        self.report_failure(&job, &reason);
        for ticket in &job.tickets {
            let _ = ticket.send(JobOutcome::Failed(reason.clone()));
        }
    }

    fn report_failure(&self, job: &QueueJob, reason: &str) {
        let _ = self.shared.failures_tx.send(FailedJob {
            sequence: job.sequence,
            key: job.payload.key(),
            payload: job.payload.clone(),
            attempts: job.attempts,
            reason: reason.to_string(),
        });
    }

    fn maybe_compact(&mut self, force: bool) {
        let pending = self.shared.stats_mut().pending;
        if pending != 0 {
            return;
        }
        let mut journal = self.shared.journal_mut();
        if force || journal.stats().appended_since_compact >= self.config.journal_compact_period {
            if let Err(err) = journal.compact(&[]) {
                tracing::warn!(error = %err, "journal compaction failed");
            }
        }
    }

    fn publish_depths(&self) {
        let mut stats = self.shared.stats_mut();
        stats.critical_pending = self.lanes.critical.len();
        stats.normal_pending = self.lanes.normal.len();
        stats.low_pending = self.lanes.low.len();
        stats.retry_pending = self.retries.len();
    }
}

fn backoff_delay(attempts: u32) -> Duration {
    let factor = 1u32 << attempts.saturating_sub(1).min(8);
    (RETRY_BACKOFF_BASE * factor).min(RETRY_BACKOFF_CAP)
}

/// Apply one payload against the backing store.
fn apply(backend: &FsBackend, payload: &JobPayload) -> Result<()> {
    match payload {
        JobPayload::WriteMetadata { entity, bytes } => {
            backend.write_record(&backend.metadata_path(*entity), bytes)
        }
        JobPayload::WriteChunk {
            entity,
            field,
            chunk,
            bytes,
        } => backend.write_record(&backend.chunk_path(*entity, field, *chunk), bytes),
        JobPayload::DeleteChunk {
            entity,
            field,
            chunk,
        } => {
            backend.remove_record(&backend.chunk_path(*entity, field, *chunk))?;
            Ok(())
        }
        JobPayload::DeleteEntity { entity } => {
            backend.remove_entity_dir(*entity)?;
            Ok(())
        }
        JobPayload::WriteBlob { digest, bytes } => {
            backend.write_record(&backend.blob_path(digest), bytes)
        }
        JobPayload::WriteBlobSidecar { digest, bytes } => {
            backend.write_record(&backend.blob_sidecar_path(digest), bytes)
        }
        JobPayload::DeleteBlob { digest } => {
            backend.remove_record(&backend.blob_path(digest))?;
            backend.remove_record(&backend.blob_sidecar_path(digest))?;
            Ok(())
        }
        JobPayload::WriteIndex { name, bytes } => {
            backend.write_record(&backend.index_path(name), bytes)
        }
    }
}
