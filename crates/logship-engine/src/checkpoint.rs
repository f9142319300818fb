// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Time-based checkpointing.
//!
//! The queue already syncs itself every `ft_sync_every` changes. This task covers the other
//! half of the trigger: it syncs at least every `ft_sync_interval_ms`, so entries appended
//! during a quiet period still become durable and visible to workers.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::queue::DurableQueue;

pub struct CheckpointManager {
    handle: JoinHandle<()>,
}

impl CheckpointManager {
    /// Spawns the timer task. It runs until `cancel` fires.
    ///
    /// A failed sync is a local resource failure: the task logs it, closes the queue so no
    /// producer stays blocked on it, and cancels `cancel`, which stops the engine.
    #[must_use]
    pub fn start(queue: Arc<DurableQueue>, every: Duration, cancel: CancellationToken) -> Self {
        let handle = tokio::spawn(run(queue, every, cancel));
        CheckpointManager { handle }
    }

    /// Waits for the task to exit. The caller cancels it first.
    pub async fn stop(self) {
        if let Err(e) = self.handle.await {
            error!("CHECKPOINT | Checkpoint task failed: {}", e);
        }
    }
}

async fn run(queue: Arc<DurableQueue>, every: Duration, cancel: CancellationToken) {
    let mut ticker = interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately.
    ticker.tick().await;

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = ticker.tick() => {
                match queue.sync_if_dirty() {
                    Ok(Some(checkpoint)) => debug!(
                        "CHECKPOINT | Synced queue: appended={} consumed={}",
                        checkpoint.appended_offset, checkpoint.consumed_offset
                    ),
                    Ok(None) => {}
                    Err(e) => {
                        error!(
                            "CHECKPOINT | Failed to persist queue checkpoint, stopping the engine: {}",
                            e
                        );
                        queue.abort();
                        cancel.cancel();
                        break;
                    }
                }
            }
        }
    }
    debug!("CHECKPOINT | Checkpoint task stopped");
}
