// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Token-bucket rate limiting.
//!
//! Three independent buckets throttle the engine:
//!
//! - **disk write** (bytes/s): acquired by the durable queue before an append, so a slow disk
//!   budget backpressures ingestion
//! - **network flow** (bytes/s): acquired before every send attempt
//! - **requests** (requests/s): acquired before every send attempt
//!
//! Buckets refill continuously at their configured rate and hold at most one second worth of
//! tokens. A bucket configured with a rate of zero never blocks.

use std::sync::{Mutex, PoisonError};
use tokio::time::{sleep, Duration, Instant};

const REFILL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

#[derive(Debug)]
struct Bucket {
    rate_per_sec: f64,
    capacity: f64,
    state: Mutex<BucketState>,
}

/// A token bucket. `TokenBucket::unlimited()` is a no-op.
#[derive(Debug)]
pub struct TokenBucket {
    bucket: Option<Bucket>,
}

impl TokenBucket {
    /// Creates a bucket refilled with `rate_per_sec` tokens every second. Zero means unlimited.
    #[must_use]
    pub fn new(rate_per_sec: u64) -> Self {
        if rate_per_sec == 0 {
            return Self::unlimited();
        }
        #[allow(clippy::cast_precision_loss)]
        let rate = rate_per_sec as f64;
        let capacity = rate * REFILL_INTERVAL.as_secs_f64();
        TokenBucket {
            bucket: Some(Bucket {
                rate_per_sec: rate,
                capacity,
                state: Mutex::new(BucketState {
                    tokens: capacity,
                    last_refill: Instant::now(),
                }),
            }),
        }
    }

    #[must_use]
    pub fn unlimited() -> Self {
        TokenBucket { bucket: None }
    }

    #[must_use]
    pub fn is_unlimited(&self) -> bool {
        self.bucket.is_none()
    }

    /// Waits until `amount` tokens are available and takes them.
    ///
    /// A request larger than the burst capacity waits for a full bucket and then drives the
    /// balance negative, so the excess is paid back before the next caller proceeds.
    pub async fn acquire(&self, amount: u64) {
        let Some(bucket) = &self.bucket else {
            return;
        };
        if amount == 0 {
            return;
        }
        #[allow(clippy::cast_precision_loss)]
        let amount = amount as f64;
        loop {
            let wait = {
                let mut state = bucket.state.lock().unwrap_or_else(PoisonError::into_inner);
                let now = Instant::now();
                let elapsed = now.duration_since(state.last_refill).as_secs_f64();
                state.tokens = (state.tokens + elapsed * bucket.rate_per_sec).min(bucket.capacity);
                state.last_refill = now;

                let needed = amount.min(bucket.capacity);
                if state.tokens >= needed {
                    state.tokens -= amount;
                    return;
                }
                Duration::from_secs_f64((needed - state.tokens) / bucket.rate_per_sec)
            };
            sleep(wait).await;
        }
    }
}

/// The three limiters shared by the queue and the delivery workers.
#[derive(Debug)]
pub struct RateLimits {
    disk_write: TokenBucket,
    network_flow: TokenBucket,
    requests: TokenBucket,
}

impl RateLimits {
    /// Rates are bytes/s, bytes/s and requests/s. Zero disables a dimension.
    #[must_use]
    pub fn new(disk_write_bytes: u64, network_flow_bytes: u64, requests: u64) -> Self {
        RateLimits {
            disk_write: TokenBucket::new(disk_write_bytes),
            network_flow: TokenBucket::new(network_flow_bytes),
            requests: TokenBucket::new(requests),
        }
    }

    #[must_use]
    pub fn unlimited() -> Self {
        Self::new(0, 0, 0)
    }

    pub async fn acquire_disk_write(&self, bytes: u64) {
        self.disk_write.acquire(bytes).await;
    }

    /// Blocks until a send of `bytes` satisfies both the flow and the request limit.
    pub async fn acquire_send(&self, bytes: u64) {
        self.network_flow.acquire(bytes).await;
        self.requests.acquire(1).await;
    }
}

impl Default for RateLimits {
    fn default() -> Self {
        Self::unlimited()
    }
}
