// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Durable queue of pending batches.
//!
//! The queue is the single piece of shared mutable state of the engine. Every operation takes
//! one internal lock, so acknowledgements, appends, leases and syncs are serialized and a
//! checkpoint always describes a consistent state.
//!
//! # Entry lifecycle
//!
//! ```text
//!   append ──> pending ──lease──> in-flight ──ack──────────> (acked)
//!                 ^                   │
//!                 └──release(delay)───┤
//!                                     └──dead_letter───────> (dead-lettered)
//! ```
//!
//! Terminal entries leave the queue immediately. Their log bytes are reclaimed once everything
//! before them is terminal too.
//!
//! # Visibility
//!
//! With the disk backing an appended entry is handed to workers only after the next sync has
//! made it durable. A sync happens every `sync_every` changes, on every checkpoint tick, and on
//! close. The memory backing makes entries visible immediately.

mod append_log;
mod checkpoint;
mod dead_letter;

pub use checkpoint::Checkpoint;
pub use dead_letter::DeadLetter;

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::QueueError;
use crate::rate_limit::RateLimits;
use crate::record::Batch;
use append_log::AppendLog;
use dead_letter::DeadLetterStore;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageOptions {
    /// Append log and checkpoint under `dir`.
    Disk {
        dir: PathBuf,
        /// Acknowledged bytes at the head of the log before it is compacted.
        trim_threshold_bytes: u64,
    },
    Memory,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueOptions {
    pub storage: StorageOptions,
    /// Maximum number of unacknowledged entries, in-flight ones included.
    pub capacity: usize,
    /// Evict the oldest pending entry instead of blocking when full.
    pub evict_when_full: bool,
    /// Only ever hand out the oldest entry, so a single consumer sees strict sequence order.
    pub strict_order: bool,
    /// Changes (appends and terminal transitions) between two syncs.
    pub sync_every: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryState {
    Pending,
    InFlight,
}

#[derive(Debug)]
struct Slot {
    offset: u64,
    end: u64,
    batch: Batch,
    state: EntryState,
    not_before: Option<Instant>,
    visible: bool,
}

/// A queued entry, as returned by [`DurableQueue::replay`].
#[derive(Debug, Clone, PartialEq)]
pub struct QueueEntry {
    pub sequence: u64,
    /// Logical write offset of the entry in the append log.
    pub offset: u64,
    /// Serialized size in bytes.
    pub size: u64,
    /// Whether a worker currently holds the entry.
    pub in_flight: bool,
    pub batch: Batch,
}

/// Exclusive hold on one entry for a single send attempt.
///
/// A lease ends with [`DurableQueue::ack`], [`DurableQueue::release`] or
/// [`DurableQueue::dead_letter`]. Until then no other caller can lease the same entry.
#[derive(Debug, Clone, PartialEq)]
pub struct Lease {
    sequence: u64,
    batch: Batch,
}

impl Lease {
    #[must_use]
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    #[must_use]
    pub fn batch(&self) -> &Batch {
        &self.batch
    }

    #[must_use]
    pub fn retry_count(&self) -> u32 {
        self.batch.retry_count()
    }
}

/// Point-in-time view of the queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub depth: usize,
    pub in_flight: usize,
    pub appended: u64,
    pub acked: u64,
    pub retried: u64,
    pub dead_lettered: u64,
    pub evicted: u64,
    pub trimmed_bytes: u64,
    pub appended_offset: u64,
    pub consumed_offset: u64,
}

#[derive(Debug)]
enum Storage {
    Disk {
        dir: PathBuf,
        log: AppendLog,
        trim_threshold_bytes: u64,
    },
    Memory,
}

#[derive(Debug)]
struct QueueState {
    storage: Storage,
    dead_letters: DeadLetterStore,
    slots: BTreeMap<u64, Slot>,
    /// Terminal sequences above the oldest live entry.
    acked_above: BTreeSet<u64>,
    next_sequence: u64,
    appended_offset: u64,
    changes_since_sync: u64,
    closed: bool,
    stats: QueueStats,
}

enum LeasePoll {
    Ready(Lease),
    Wait(Option<Instant>),
    Closed,
}

pub struct DurableQueue {
    options: QueueOptions,
    limits: Arc<RateLimits>,
    state: Mutex<QueueState>,
    readable: Notify,
    writable: Notify,
}

impl DurableQueue {
    /// Opens the queue, replaying every unacknowledged entry of an existing disk queue.
    ///
    /// A corrupted or incomplete tail is truncated with a warning. Any other I/O failure is
    /// returned and the queue does not start.
    pub fn open(options: QueueOptions, limits: Arc<RateLimits>) -> Result<Self, QueueError> {
        let mut state = match &options.storage {
            StorageOptions::Disk {
                dir,
                trim_threshold_bytes,
            } => QueueState::recover(dir, *trim_threshold_bytes)?,
            StorageOptions::Memory => QueueState::new(Storage::Memory, DeadLetterStore::memory()),
        };
        state.sync()?;

        Ok(DurableQueue {
            options,
            limits,
            state: Mutex::new(state),
            readable: Notify::new(),
            writable: Notify::new(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Appends a batch and returns its sequence number.
    ///
    /// Waits for the disk-write budget first. When the queue is full it either evicts the
    /// oldest pending entry or waits for capacity, depending on
    /// [`QueueOptions::evict_when_full`].
    pub async fn append(&self, batch: Batch) -> Result<u64, QueueError> {
        self.append_entry(batch, None).await
    }

    /// Appends a batch whose direct send already failed once. It is leased no earlier than
    /// `retry_after` from now.
    pub async fn append_failed(&self, batch: Batch, retry_after: Duration) -> Result<u64, QueueError> {
        self.append_entry(batch, Some(retry_after)).await
    }

    async fn append_entry(
        &self,
        batch: Batch,
        retry_after: Option<Duration>,
    ) -> Result<u64, QueueError> {
        let payload = batch.to_payload()?;
        if matches!(self.options.storage, StorageOptions::Disk { .. }) {
            self.limits.acquire_disk_write(payload.len() as u64).await;
        }

        loop {
            let writable = self.writable.notified();
            tokio::pin!(writable);
            writable.as_mut().enable();

            {
                let mut state = self.lock();
                if state.closed {
                    return Err(QueueError::Closed);
                }
                if state.slots.len() >= self.options.capacity && self.options.evict_when_full {
                    state.evict_oldest();
                }
                if state.slots.len() < self.options.capacity {
                    let sequence = state.push(batch, &payload, retry_after)?;
                    state.record_change(self.options.sync_every)?;
                    drop(state);
                    self.readable.notify_waiters();
                    return Ok(sequence);
                }
            }

            debug!(
                "QUEUE | Queue full ({} batches), waiting for capacity",
                self.options.capacity
            );
            writable.await;
        }
    }

    /// Leases the next deliverable entry without waiting.
    ///
    /// Returns `None` when nothing is deliverable right now: the queue is empty, every entry
    /// is leased or backing off, or the oldest entry is not yet durable.
    pub fn peek(&self) -> Option<Lease> {
        match self.poll_lease() {
            LeasePoll::Ready(lease) => Some(lease),
            LeasePoll::Wait(_) | LeasePoll::Closed => None,
        }
    }

    /// Waits for the next deliverable entry. Returns `None` once `cancel` fires or the queue
    /// is closed.
    pub async fn next_lease(&self, cancel: &CancellationToken) -> Option<Lease> {
        loop {
            let readable = self.readable.notified();
            tokio::pin!(readable);
            readable.as_mut().enable();

            let wake_at = match self.poll_lease() {
                LeasePoll::Ready(lease) => return Some(lease),
                LeasePoll::Closed => return None,
                LeasePoll::Wait(wake_at) => wake_at,
            };

            tokio::select! {
                () = cancel.cancelled() => return None,
                () = &mut readable => {}
                () = wait_until(wake_at) => {}
            }
        }
    }

    fn poll_lease(&self) -> LeasePoll {
        let mut state = self.lock();
        if state.closed {
            return LeasePoll::Closed;
        }

        let now = Instant::now();
        let mut wake_at: Option<Instant> = None;
        let mut chosen = None;
        for (sequence, slot) in &state.slots {
            if slot.state == EntryState::Pending && slot.visible {
                match slot.not_before {
                    Some(at) if at > now => {
                        wake_at = Some(wake_at.map_or(at, |w| w.min(at)));
                    }
                    _ => {
                        chosen = Some(*sequence);
                        break;
                    }
                }
            }
            if self.options.strict_order {
                break;
            }
        }

        let Some((sequence, slot)) =
            chosen.and_then(|sequence| Some((sequence, state.slots.get_mut(&sequence)?)))
        else {
            return LeasePoll::Wait(wake_at);
        };
        slot.state = EntryState::InFlight;
        LeasePoll::Ready(Lease {
            sequence,
            batch: slot.batch.clone(),
        })
    }

    /// Marks an entry delivered. Acknowledging an unknown or already acknowledged sequence is
    /// a no-op.
    pub fn ack(&self, sequence: u64) -> Result<(), QueueError> {
        let mut state = self.lock();
        if !state.slots.contains_key(&sequence) {
            debug!(
                "QUEUE | Ignoring ack of unknown or already acknowledged seq={}",
                sequence
            );
            return Ok(());
        }
        state.finish(sequence);
        state.stats.acked += 1;
        state.record_change(self.options.sync_every)?;
        drop(state);

        self.writable.notify_waiters();
        self.readable.notify_waiters();
        Ok(())
    }

    /// Returns a leased entry to the queue after a retryable failure.
    ///
    /// The retry count is incremented and the entry is not leased again before `delay` has
    /// elapsed. Returns the new retry count, or `None` if the entry is no longer queued.
    pub fn release(&self, sequence: u64, delay: Duration) -> Option<u32> {
        let retries = {
            let mut state = self.lock();
            let slot = state.slots.get_mut(&sequence)?;
            let retries = slot.batch.retry_count().saturating_add(1);
            slot.batch.set_retry_count(retries);
            slot.state = EntryState::Pending;
            slot.not_before = Some(Instant::now() + delay);
            state.stats.retried += 1;
            retries
        };
        self.readable.notify_waiters();
        Some(retries)
    }

    /// Hands a lease back untouched, for a worker that stops before attempting the send.
    pub fn requeue(&self, sequence: u64) {
        {
            let mut state = self.lock();
            if let Some(slot) = state.slots.get_mut(&sequence) {
                slot.state = EntryState::Pending;
            }
        }
        self.readable.notify_waiters();
    }

    /// Moves an entry to the dead-letter store. It will never be retried.
    pub fn dead_letter(&self, sequence: u64, sink: &str, reason: &str) -> Result<(), QueueError> {
        let mut state = self.lock();
        let Some(slot) = state.slots.get(&sequence) else {
            return Ok(());
        };
        let letter = DeadLetter {
            sequence: Some(sequence),
            retries: slot.batch.retry_count(),
            sink: sink.to_string(),
            reason: reason.to_string(),
            records: slot.batch.records().to_vec(),
        };
        state.dead_letters.push(letter)?;
        state.finish(sequence);
        state.stats.dead_lettered += 1;
        state.record_change(self.options.sync_every)?;
        drop(state);

        self.writable.notify_waiters();
        self.readable.notify_waiters();
        Ok(())
    }

    /// Stores a batch that never entered the queue, after a permanent direct-send failure.
    pub fn record_dead_letter(&self, letter: DeadLetter) -> Result<(), QueueError> {
        let mut state = self.lock();
        state.dead_letters.push(letter)?;
        state.stats.dead_lettered += 1;
        Ok(())
    }

    /// Syncs the log and persists a checkpoint. Entries appended so far become visible.
    pub fn sync(&self) -> Result<Checkpoint, QueueError> {
        let (checkpoint, newly_visible) = self.lock().sync()?;
        if newly_visible {
            self.readable.notify_waiters();
        }
        Ok(checkpoint)
    }

    /// Like [`DurableQueue::sync`], but only when something changed since the last sync.
    pub fn sync_if_dirty(&self) -> Result<Option<Checkpoint>, QueueError> {
        let (checkpoint, newly_visible) = {
            let mut state = self.lock();
            if state.changes_since_sync == 0 {
                return Ok(None);
            }
            state.sync()?
        };
        if newly_visible {
            self.readable.notify_waiters();
        }
        Ok(Some(checkpoint))
    }

    /// Final sync. Afterwards appends fail with [`QueueError::Closed`] and no entry is leased.
    pub fn close(&self) -> Result<Checkpoint, QueueError> {
        let result = {
            let mut state = self.lock();
            state.closed = true;
            state.sync().map(|(checkpoint, _)| checkpoint)
        };
        self.readable.notify_waiters();
        self.writable.notify_waiters();
        result
    }

    /// Closes the queue after a local failure, without the final sync of
    /// [`DurableQueue::close`]. Appends waiting for capacity return [`QueueError::Closed`] and
    /// workers waiting for a lease return `None`.
    pub fn abort(&self) {
        self.lock().closed = true;
        self.readable.notify_waiters();
        self.writable.notify_waiters();
    }

    /// Every unacknowledged entry in sequence order.
    #[must_use]
    pub fn replay(&self) -> Vec<QueueEntry> {
        self.lock()
            .slots
            .iter()
            .map(|(sequence, slot)| QueueEntry {
                sequence: *sequence,
                offset: slot.offset,
                size: slot.end - slot.offset,
                in_flight: slot.state == EntryState::InFlight,
                batch: slot.batch.clone(),
            })
            .collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().slots.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn stats(&self) -> QueueStats {
        let state = self.lock();
        QueueStats {
            depth: state.slots.len(),
            in_flight: state
                .slots
                .values()
                .filter(|slot| slot.state == EntryState::InFlight)
                .count(),
            appended_offset: state.appended_offset,
            consumed_offset: state.consumed_offset(),
            ..state.stats
        }
    }

    pub fn dead_letters(&self) -> Result<Vec<DeadLetter>, QueueError> {
        self.lock().dead_letters.read_all()
    }
}

impl QueueState {
    fn new(storage: Storage, dead_letters: DeadLetterStore) -> Self {
        QueueState {
            storage,
            dead_letters,
            slots: BTreeMap::new(),
            acked_above: BTreeSet::new(),
            next_sequence: 1,
            appended_offset: 0,
            changes_since_sync: 0,
            closed: false,
            stats: QueueStats::default(),
        }
    }

    fn recover(dir: &Path, trim_threshold_bytes: u64) -> Result<Self, QueueError> {
        fs::create_dir_all(dir).map_err(|e| QueueError::io(dir, e))?;
        let saved = checkpoint::load(dir)?.unwrap_or_default();
        let (log, recovered) = AppendLog::open(dir, &saved)?;
        if recovered.truncated_bytes > 0 {
            warn!(
                "QUEUE | Truncated {} bytes of corrupted or incomplete entries from {}",
                recovered.truncated_bytes,
                dir.display()
            );
        }

        let mut state = QueueState::new(
            Storage::Memory,
            DeadLetterStore::open_file(dir)?,
        );
        for record in recovered.records {
            match Batch::from_payload(record.sequence, &record.payload, 0) {
                Ok(batch) => {
                    state.slots.insert(
                        record.sequence,
                        Slot {
                            offset: record.offset,
                            end: record.end,
                            batch,
                            state: EntryState::Pending,
                            not_before: None,
                            visible: true,
                        },
                    );
                }
                Err(e) => {
                    warn!(
                        "QUEUE | Dropping undecodable entry seq={} at offset {}: {}",
                        record.sequence, record.offset, e
                    );
                    state.acked_above.insert(record.sequence);
                }
            }
        }

        state.acked_above.extend(saved.acked_above.iter().copied());
        state.prune_acked_above();
        state.next_sequence = saved
            .next_sequence
            .max(recovered.next_sequence)
            .max(1);
        state.appended_offset = log.end_offset();
        state.storage = Storage::Disk {
            dir: dir.to_path_buf(),
            log,
            trim_threshold_bytes,
        };

        info!(
            "QUEUE | Opened disk queue at {}: {} unacknowledged batches to replay",
            dir.display(),
            state.slots.len()
        );
        Ok(state)
    }

    fn consumed_offset(&self) -> u64 {
        self.slots
            .values()
            .next()
            .map_or(self.appended_offset, |slot| slot.offset)
    }

    fn push(
        &mut self,
        batch: Batch,
        payload: &[u8],
        retry_after: Option<Duration>,
    ) -> Result<u64, QueueError> {
        let sequence = self.next_sequence;
        let (offset, end, visible) = match &mut self.storage {
            Storage::Disk { log, .. } => {
                let (offset, end) = log.append(sequence, payload)?;
                (offset, end, false)
            }
            Storage::Memory => {
                let offset = self.appended_offset;
                (offset, offset + payload.len() as u64, true)
            }
        };

        self.next_sequence += 1;
        self.appended_offset = end;
        self.stats.appended += 1;
        self.slots.insert(
            sequence,
            Slot {
                offset,
                end,
                batch: batch.with_delivery_state(sequence, u32::from(retry_after.is_some())),
                state: EntryState::Pending,
                not_before: retry_after.map(|delay| Instant::now() + delay),
                visible,
            },
        );
        Ok(sequence)
    }

    /// Drops the oldest entry that is not leased. Returns its sequence.
    fn evict_oldest(&mut self) -> Option<u64> {
        let sequence = self
            .slots
            .iter()
            .find(|(_, slot)| slot.state == EntryState::Pending)
            .map(|(sequence, _)| *sequence)?;
        self.finish(sequence);
        self.stats.evicted += 1;
        warn!(
            "QUEUE | Queue full, evicted oldest unacknowledged batch seq={}",
            sequence
        );
        Some(sequence)
    }

    fn finish(&mut self, sequence: u64) {
        if self.slots.remove(&sequence).is_some() {
            self.acked_above.insert(sequence);
            self.prune_acked_above();
        }
    }

    /// Keeps only terminal sequences newer than the oldest live entry: anything older is
    /// already covered by the consumed offset.
    fn prune_acked_above(&mut self) {
        match self.slots.keys().next() {
            Some(&head) => self.acked_above = self.acked_above.split_off(&head),
            None => self.acked_above.clear(),
        }
    }

    fn record_change(&mut self, sync_every: u64) -> Result<(), QueueError> {
        self.changes_since_sync += 1;
        if self.changes_since_sync >= sync_every {
            self.sync()?;
        }
        Ok(())
    }

    /// Returns the checkpoint written and whether entries became visible.
    fn sync(&mut self) -> Result<(Checkpoint, bool), QueueError> {
        let consumed_offset = self.consumed_offset();
        let checkpoint = Checkpoint {
            appended_offset: self.appended_offset,
            consumed_offset,
            next_sequence: self.next_sequence,
            acked_above: self.acked_above.iter().copied().collect(),
            synced_at_ms: Checkpoint::now_ms(),
        };

        if let Storage::Disk {
            dir,
            log,
            trim_threshold_bytes,
        } = &mut self.storage
        {
            log.sync()?;
            checkpoint::store(dir, &checkpoint)?;
            let reclaimable = consumed_offset.saturating_sub(log.base_offset());
            if reclaimable > 0 && (self.slots.is_empty() || reclaimable >= *trim_threshold_bytes) {
                self.stats.trimmed_bytes += log.compact(consumed_offset, self.next_sequence)?;
            }
        }

        let mut newly_visible = false;
        for slot in self.slots.values_mut().filter(|slot| !slot.visible) {
            slot.visible = true;
            newly_visible = true;
        }
        self.changes_since_sync = 0;
        Ok((checkpoint, newly_visible))
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
