// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Retry policy for queue entries.
//!
//! Each retryable failure increments the entry's retry count. The entry becomes eligible again
//! after `base * 2^(retries - 1)`, capped at `max_delay`. Once the retry count exceeds
//! `max_retries` the entry is dead-lettered.

use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    base: Duration,
    max_delay: Duration,
    max_retries: u32,
}

impl Backoff {
    #[must_use]
    pub fn new(base: Duration, max_delay: Duration, max_retries: u32) -> Self {
        Backoff {
            base,
            max_delay: max_delay.max(base),
            max_retries,
        }
    }

    /// Delay before the next attempt of an entry that has failed `retries` times.
    #[must_use]
    pub fn delay(&self, retries: u32) -> Duration {
        if retries == 0 {
            return Duration::ZERO;
        }
        // 2^31 already saturates any sane base, keep the shift in range.
        let factor = 1u32 << (retries - 1).min(31);
        self.base
            .checked_mul(factor)
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }

    /// Whether an entry that has failed `retries` times should be dead-lettered.
    #[must_use]
    pub fn exhausted(&self, retries: u32) -> bool {
        retries > self.max_retries
    }

    #[must_use]
    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff::new(Duration::from_millis(100), Duration::from_secs(30), 10)
    }
}
