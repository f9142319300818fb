// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Delivery workers.
//!
//! Each worker loops over: lease an entry, wait for the send budget, send, then settle the
//! lease. Settling is an explicit transition of the entry:
//!
//! - success: ack
//! - retryable failure within the retry limit: release with a backoff delay
//! - fatal failure, or retries exhausted: dead-letter
//!
//! Workers stop cooperatively. A worker that is cancelled while waiting for budget hands its
//! lease back; a send already in progress is allowed to finish within the stop grace period.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{timeout_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::backoff::Backoff;
use crate::error::{EngineError, QueueError, SendError};
use crate::queue::{DurableQueue, Lease};
use crate::rate_limit::RateLimits;
use crate::sink::Sink;

/// Everything a worker needs, shared by the whole pool.
#[derive(Clone)]
pub struct Delivery {
    pub queue: Arc<DurableQueue>,
    pub sink: Arc<dyn Sink>,
    pub limits: Arc<RateLimits>,
    pub backoff: Backoff,
}

impl Delivery {
    /// Applies the outcome of one send attempt to the leased entry.
    pub(crate) fn settle(&self, lease: &Lease, result: Result<(), SendError>) -> Result<(), QueueError> {
        let sequence = lease.sequence();
        let error = match result {
            Ok(()) => return self.queue.ack(sequence),
            Err(error) => error,
        };

        let retries = lease.retry_count().saturating_add(1);
        if !error.is_retryable() {
            error!(
                sink = self.sink.name(),
                sequence,
                retries = lease.retry_count(),
                "WORKER | Fatal send error, dead-lettering batch: {}",
                error.message()
            );
            return self
                .queue
                .dead_letter(sequence, self.sink.name(), error.message());
        }

        if self.backoff.exhausted(retries) {
            error!(
                sink = self.sink.name(),
                sequence,
                retries,
                "WORKER | Retries exhausted, dead-lettering batch: {}",
                error.message()
            );
            let reason = format!(
                "retries exhausted after {} attempts: {}",
                retries,
                error.message()
            );
            return self.queue.dead_letter(sequence, self.sink.name(), &reason);
        }

        let delay = self.backoff.delay(retries);
        warn!(
            sink = self.sink.name(),
            sequence,
            retries,
            "WORKER | Send failed, retrying in {:?}: {}",
            delay,
            error.message()
        );
        self.queue.release(sequence, delay);
        Ok(())
    }
}

pub struct WorkerPool {
    cancel: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawns `count` workers. They run until `cancel` fires.
    ///
    /// A worker that hits a queue failure aborts the queue and cancels `cancel` itself: the
    /// queue is shared, so the whole pool and any blocked producer stop with it.
    #[must_use]
    pub fn start(count: usize, delivery: Delivery, cancel: CancellationToken) -> Self {
        let handles = (0..count)
            .map(|id| {
                let delivery = delivery.clone();
                let cancel = cancel.clone();
                tokio::spawn(async move { run(id, delivery, cancel).await })
            })
            .collect();
        WorkerPool { cancel, handles }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Cancels the workers and waits up to `grace` for in-flight sends. Workers still running
    /// after that are aborted; their entries stay unacknowledged.
    pub async fn stop(self, grace: Duration) -> Result<(), EngineError> {
        self.cancel.cancel();
        let deadline = Instant::now() + grace;
        let mut timed_out = false;
        for mut handle in self.handles {
            match timeout_at(deadline, &mut handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!("WORKER | Worker task failed: {}", e),
                Err(_) => {
                    handle.abort();
                    timed_out = true;
                }
            }
        }
        if timed_out {
            warn!(
                "WORKER | Workers did not finish within {:?}, in-flight batches will be replayed",
                grace
            );
            return Err(EngineError::ShutdownTimeout(grace));
        }
        Ok(())
    }
}

async fn run(id: usize, delivery: Delivery, cancel: CancellationToken) {
    debug!("WORKER | Worker {} started", id);
    while let Some(lease) = delivery.queue.next_lease(&cancel).await {
        let bytes = lease.batch().size_estimate() as u64;
        tokio::select! {
            () = cancel.cancelled() => {
                delivery.queue.requeue(lease.sequence());
                break;
            }
            () = delivery.limits.acquire_send(bytes) => {}
        }

        let result = delivery.sink.send(lease.batch()).await;
        if let Err(e) = delivery.settle(&lease, result) {
            error!("WORKER | Durable queue failure, stopping the engine: {}", e);
            delivery.queue.abort();
            cancel.cancel();
            break;
        }
    }
    debug!("WORKER | Worker {} stopped", id);
}
