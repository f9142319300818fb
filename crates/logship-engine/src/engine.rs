// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The strategy engine, entry point of upstream producers.
//!
//! | strategy      | on submit                                   | workers        |
//! |---------------|---------------------------------------------|----------------|
//! | `backup_only` | send directly, queue the batch on failure   | 1              |
//! | `always_save` | append, blocking while the queue is full    | `ft_procs` (1) |
//! | `concurrent`  | append, blocking while the queue is full    | `ft_procs` (4) |
//!
//! Per-batch delivery failures never reach the caller of [`Engine::submit`]; only local
//! failures of the durable queue do.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::backoff::Backoff;
use crate::checkpoint::CheckpointManager;
use crate::config::{EngineConfig, Strategy};
use crate::error::{EngineError, QueueError};
use crate::queue::{DeadLetter, DurableQueue};
use crate::rate_limit::RateLimits;
use crate::record::Batch;
use crate::sink::Sink;
use crate::worker::{Delivery, WorkerPool};

/// What happened to a submitted batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Accepted {
    /// Delivered by a direct send, never persisted.
    Sent,
    /// Durably queued for the workers.
    Queued { sequence: u64 },
    /// The direct send failed permanently and the batch went to the dead-letter store.
    DeadLettered,
}

/// Point-in-time counters of an engine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineStats {
    pub submitted: u64,
    pub sent_directly: u64,
    pub queued: u64,
    pub acked: u64,
    pub retried: u64,
    pub dead_lettered: u64,
    pub evicted: u64,
    pub queue_depth: usize,
    pub in_flight: usize,
}

#[derive(Debug, Default)]
struct Counters {
    submitted: AtomicU64,
    sent_directly: AtomicU64,
    queued: AtomicU64,
}

struct Tasks {
    workers: WorkerPool,
    checkpoints: CheckpointManager,
}

pub struct Engine {
    config: EngineConfig,
    queue: Arc<DurableQueue>,
    sink: Arc<dyn Sink>,
    limits: Arc<RateLimits>,
    backoff: Backoff,
    cancel: CancellationToken,
    tasks: Mutex<Option<Tasks>>,
    counters: Counters,
}

impl Engine {
    /// Opens the durable queue, replaying what an earlier run left unacknowledged, and spawns
    /// the workers and the checkpoint task. Must be called within a Tokio runtime.
    ///
    /// Fails if the configuration is invalid or the queue cannot be opened.
    pub fn start(config: EngineConfig, sink: Arc<dyn Sink>) -> Result<Self, EngineError> {
        config.validate()?;

        let limits = Arc::new(config.rate_limits());
        let queue = Arc::new(DurableQueue::open(
            config.queue_options(),
            Arc::clone(&limits),
        )?);
        let backoff = config.backoff();
        let cancel = CancellationToken::new();

        let replayed = queue.len();
        let workers = WorkerPool::start(
            config.worker_count(),
            Delivery {
                queue: Arc::clone(&queue),
                sink: Arc::clone(&sink),
                limits: Arc::clone(&limits),
                backoff,
            },
            cancel.clone(),
        );
        let checkpoints =
            CheckpointManager::start(Arc::clone(&queue), config.sync_interval, cancel.clone());

        info!(
            "ENGINE | Started {} sink with strategy {} and {} workers, {} batches to replay",
            sink.name(),
            config.strategy,
            workers.len(),
            replayed
        );

        Ok(Engine {
            config,
            queue,
            sink,
            limits,
            backoff,
            cancel,
            tasks: Mutex::new(Some(Tasks {
                workers,
                checkpoints,
            })),
            counters: Counters::default(),
        })
    }

    /// Hands a batch to the engine.
    ///
    /// Returns once the batch is delivered or durably queued. Under `always_save` and
    /// `concurrent` this waits while the queue is full.
    pub async fn submit(&self, batch: Batch) -> Result<Accepted, EngineError> {
        if self.cancel.is_cancelled() {
            return Err(EngineError::Stopped);
        }
        self.counters.submitted.fetch_add(1, Ordering::Relaxed);

        match self.config.strategy {
            Strategy::BackupOnly => self.send_direct(batch).await,
            Strategy::AlwaysSave | Strategy::Concurrent => {
                let sequence = self.queue.append(batch).await.map_err(stopped_or_queue)?;
                self.counters.queued.fetch_add(1, Ordering::Relaxed);
                Ok(Accepted::Queued { sequence })
            }
        }
    }

    async fn send_direct(&self, batch: Batch) -> Result<Accepted, EngineError> {
        self.limits
            .acquire_send(batch.size_estimate() as u64)
            .await;

        let error = match self.sink.send(&batch).await {
            Ok(()) => {
                self.counters.sent_directly.fetch_add(1, Ordering::Relaxed);
                return Ok(Accepted::Sent);
            }
            Err(error) => error,
        };

        if error.is_retryable() && !self.backoff.exhausted(1) {
            warn!(
                sink = self.sink.name(),
                "ENGINE | Direct send failed, queueing batch for retry: {}",
                error.message()
            );
            let sequence = self
                .queue
                .append_failed(batch, self.backoff.delay(1))
                .await
                .map_err(stopped_or_queue)?;
            self.counters.queued.fetch_add(1, Ordering::Relaxed);
            return Ok(Accepted::Queued { sequence });
        }

        error!(
            sink = self.sink.name(),
            retries = 0,
            "ENGINE | Direct send failed permanently, dead-lettering batch: {}",
            error.message()
        );
        self.queue.record_dead_letter(DeadLetter {
            sequence: None,
            retries: 0,
            sink: self.sink.name().to_string(),
            reason: error.message().to_string(),
            records: batch.records().to_vec(),
        })?;
        Ok(Accepted::DeadLettered)
    }

    /// Stops the engine: workers get `ft_stop_grace_ms` to finish in-flight sends, then the
    /// queue is synced a last time and the sink is closed.
    ///
    /// Unacknowledged batches stay in a disk queue and are replayed by the next start.
    pub async fn shutdown(&self) -> Result<(), EngineError> {
        let tasks = self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(tasks) = tasks else {
            return Err(EngineError::Stopped);
        };

        info!("ENGINE | Shutting down {} sink", self.sink.name());
        self.cancel.cancel();
        let stopped = tasks.workers.stop(self.config.stop_grace).await;
        tasks.checkpoints.stop().await;

        let checkpoint = self.queue.close()?;
        let closed = self
            .sink
            .close()
            .await
            .map_err(|e| EngineError::SinkClose {
                sink: self.sink.name().to_string(),
                message: e.message().to_string(),
            });

        info!(
            "ENGINE | Stopped with {} unacknowledged batches (consumed offset {}, appended offset {})",
            self.queue.len(),
            checkpoint.consumed_offset,
            checkpoint.appended_offset
        );
        stopped?;
        closed
    }

    /// Whether the engine stopped, either by [`Engine::shutdown`] or after a queue failure.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }

    #[must_use]
    pub fn stats(&self) -> EngineStats {
        let queue = self.queue.stats();
        EngineStats {
            submitted: self.counters.submitted.load(Ordering::Relaxed),
            sent_directly: self.counters.sent_directly.load(Ordering::Relaxed),
            queued: self.counters.queued.load(Ordering::Relaxed),
            acked: queue.acked,
            retried: queue.retried,
            dead_lettered: queue.dead_lettered,
            evicted: queue.evicted,
            queue_depth: queue.depth,
            in_flight: queue.in_flight,
        }
    }

    #[must_use]
    pub fn queue(&self) -> &DurableQueue {
        &self.queue
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }
}

fn stopped_or_queue(error: QueueError) -> EngineError {
    match error {
        QueueError::Closed => EngineError::Stopped,
        other => EngineError::Queue(other),
    }
}
