// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![allow(clippy::unwrap_used)]

mod common;

use common::{batch, batch_id, wait_for, Behavior, RecordingSink};
use logship_engine::config::{EngineConfig, QueueBacking, Strategy};
use logship_engine::queue::{DurableQueue, QueueOptions, StorageOptions};
use logship_engine::rate_limit::RateLimits;
use logship_engine::Engine;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

fn queue_options(dir: &Path, sync_every: u64) -> QueueOptions {
    QueueOptions {
        storage: StorageOptions::Disk {
            dir: dir.to_path_buf(),
            trim_threshold_bytes: 1024 * 1024,
        },
        capacity: 100,
        evict_when_full: false,
        strict_order: true,
        sync_every,
    }
}

fn engine_config(dir: &Path) -> EngineConfig {
    EngineConfig {
        strategy: Strategy::AlwaysSave,
        backing: QueueBacking::Disk,
        save_log_path: Some(dir.to_path_buf()),
        sync_every: 1,
        sync_interval: Duration::from_millis(20),
        retry_backoff: Duration::from_millis(1),
        max_retry_backoff: Duration::from_millis(10),
        max_retries: 1000,
        stop_grace: Duration::from_secs(1),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_crash_without_checkpoint_replays_every_unacked_entry() {
    let dir = tempfile::tempdir().unwrap();
    {
        let queue = DurableQueue::open(
            queue_options(dir.path(), 1000),
            Arc::new(RateLimits::unlimited()),
        )
        .unwrap();
        for id in 0..5 {
            queue.append(batch(id)).await.unwrap();
        }
        // Dropped without a sync or close, as in a crash.
    }

    let queue = DurableQueue::open(
        queue_options(dir.path(), 1000),
        Arc::new(RateLimits::unlimited()),
    )
    .unwrap();
    let replayed = queue.replay();
    assert_eq!(
        replayed.iter().map(|entry| entry.sequence).collect::<Vec<_>>(),
        [1, 2, 3, 4, 5]
    );
    assert_eq!(
        replayed.iter().map(|entry| batch_id(&entry.batch)).collect::<Vec<_>>(),
        [0, 1, 2, 3, 4]
    );
    assert!(replayed.iter().all(|entry| !entry.in_flight));
}

#[tokio::test]
async fn test_restart_delivers_what_the_previous_run_could_not() {
    let dir = tempfile::tempdir().unwrap();

    let failing = Arc::new(RecordingSink::new(Behavior::Retryable));
    let engine = Engine::start(engine_config(dir.path()), failing.clone()).unwrap();
    for id in 0..5 {
        engine.submit(batch(id)).await.unwrap();
    }
    wait_for(|| failing.attempts() >= 3).await;
    engine.shutdown().await.unwrap();
    assert!(failing.delivered().is_empty());
    assert_eq!(engine.queue().len(), 5);
    drop(engine);

    let sink = Arc::new(RecordingSink::new(Behavior::Succeed));
    let engine = Engine::start(engine_config(dir.path()), sink.clone()).unwrap();
    wait_for(|| sink.delivered().len() == 5).await;
    assert_eq!(sink.delivered(), [0, 1, 2, 3, 4]);

    wait_for(|| engine.queue().is_empty()).await;
    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_checkpointed_acks_are_not_redelivered() {
    let dir = tempfile::tempdir().unwrap();

    let sink = Arc::new(RecordingSink::new(Behavior::Succeed));
    let engine = Engine::start(engine_config(dir.path()), sink.clone()).unwrap();
    for id in 0..5 {
        engine.submit(batch(id)).await.unwrap();
    }
    wait_for(|| engine.stats().acked == 5).await;
    engine.shutdown().await.unwrap();
    drop(engine);

    let sink = Arc::new(RecordingSink::new(Behavior::Succeed));
    let engine = Engine::start(engine_config(dir.path()), sink.clone()).unwrap();
    assert!(engine.queue().is_empty());

    engine.submit(batch(5)).await.unwrap();
    wait_for(|| sink.delivered() == [5]).await;
    assert_eq!(sink.attempts(), 1);
    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_sequences_continue_across_restarts() {
    let dir = tempfile::tempdir().unwrap();
    {
        let queue = DurableQueue::open(
            queue_options(dir.path(), 1),
            Arc::new(RateLimits::unlimited()),
        )
        .unwrap();
        for id in 0..3 {
            queue.append(batch(id)).await.unwrap();
        }
        queue.ack(1).unwrap();
        queue.ack(2).unwrap();
        queue.close().unwrap();
    }

    let queue = DurableQueue::open(
        queue_options(dir.path(), 1),
        Arc::new(RateLimits::unlimited()),
    )
    .unwrap();
    assert_eq!(
        queue.replay().iter().map(|entry| entry.sequence).collect::<Vec<_>>(),
        [3]
    );
    assert_eq!(queue.append(batch(3)).await.unwrap(), 4);
}
