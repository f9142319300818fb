// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![allow(dead_code)]
#![allow(clippy::unwrap_used)]

use async_trait::async_trait;
use logship_engine::error::SendError;
use logship_engine::sink::Sink;
use logship_engine::Batch;
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Behavior {
    Succeed,
    Retryable,
    Fatal,
    /// Every other attempt fails with a retryable error, starting with the first.
    Flaky,
}

/// Sink that records what it delivers and can be told to fail.
pub struct RecordingSink {
    behavior: Mutex<Behavior>,
    latency: Duration,
    attempts: AtomicUsize,
    delivered: Mutex<Vec<u64>>,
    in_flight: Mutex<HashSet<u64>>,
    overlapped: AtomicBool,
}

impl RecordingSink {
    pub fn new(behavior: Behavior) -> Self {
        Self::with_latency(behavior, Duration::ZERO)
    }

    pub fn with_latency(behavior: Behavior, latency: Duration) -> Self {
        RecordingSink {
            behavior: Mutex::new(behavior),
            latency,
            attempts: AtomicUsize::new(0),
            delivered: Mutex::new(Vec::new()),
            in_flight: Mutex::new(HashSet::new()),
            overlapped: AtomicBool::new(false),
        }
    }

    pub fn set_behavior(&self, behavior: Behavior) {
        *self.behavior.lock().unwrap() = behavior;
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Ids of delivered batches, in delivery order.
    pub fn delivered(&self) -> Vec<u64> {
        self.delivered.lock().unwrap().clone()
    }

    pub fn delivery_counts(&self) -> HashMap<u64, usize> {
        let mut counts = HashMap::new();
        for id in self.delivered() {
            *counts.entry(id).or_insert(0) += 1;
        }
        counts
    }

    /// Whether one batch was ever being sent twice at the same time.
    pub fn overlapped(&self) -> bool {
        self.overlapped.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Sink for RecordingSink {
    fn name(&self) -> &str {
        "recording"
    }

    async fn send(&self, batch: &Batch) -> Result<(), SendError> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
        let id = batch_id(batch);
        if !self.in_flight.lock().unwrap().insert(id) {
            self.overlapped.store(true, Ordering::SeqCst);
        }
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        self.in_flight.lock().unwrap().remove(&id);

        let behavior = *self.behavior.lock().unwrap();
        match behavior {
            Behavior::Flaky if attempt % 2 == 0 => {
                Err(SendError::Unclassified("connection reset".to_string()))
            }
            Behavior::Succeed | Behavior::Flaky => {
                self.delivered.lock().unwrap().push(id);
                Ok(())
            }
            Behavior::Retryable => Err(SendError::Retryable("503 Service Unavailable".to_string())),
            Behavior::Fatal => Err(SendError::Fatal("400 Bad Request".to_string())),
        }
    }
}

pub fn batch(id: u64) -> Batch {
    Batch::new(vec![json!({"id": id, "msg": format!("record {id}")})
        .as_object()
        .unwrap()
        .clone()])
}

pub fn batch_id(batch: &Batch) -> u64 {
    batch.records()[0]["id"].as_u64().unwrap()
}

/// Polls `condition` until it holds, failing the test after a few seconds.
pub async fn wait_for(condition: impl Fn() -> bool) {
    tokio::time::timeout(Duration::from_secs(10), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
}
