// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Engine configuration.
//!
//! The engine is configured once at startup from a flat `key -> value` option map, the same
//! shape a sink section of the agent configuration has. Every key is checked against its
//! [`options::OptionSpec`] first; invalid values are rejected, never coerced.
//!
//! ## Units
//!
//! - `ft_write_limit`: MB/s
//! - `flow_rate_limit`: KB/s
//! - `request_rate_limit`: requests/s
//! - `*_ms`: milliseconds
//!
//! ## Worker count
//!
//! `ft_procs` only applies to `always_save` (default 1, which keeps strict delivery order) and
//! `concurrent` (default 4). `backup_only` always runs a single background worker.

pub mod options;

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::backoff::Backoff;
use crate::error::ConfigError;
use crate::queue::{QueueOptions, StorageOptions};
use crate::rate_limit::RateLimits;
use options::{
    ft_spec, validate_options, value_or_default, FT_OPTIONS, KEY_FLOW_RATE_LIMIT,
    KEY_FT_MAX_RETRIES, KEY_FT_MAX_RETRY_BACKOFF_MS, KEY_FT_MEMORY_CHANNEL,
    KEY_FT_MEMORY_CHANNEL_SIZE, KEY_FT_PROCS, KEY_FT_RETRY_BACKOFF_MS, KEY_FT_SAVE_LOG_PATH,
    KEY_FT_STOP_GRACE_MS, KEY_FT_STRATEGY, KEY_FT_SYNC_EVERY, KEY_FT_SYNC_INTERVAL_MS,
    KEY_FT_TRIM_THRESHOLD_BYTES, KEY_FT_WRITE_LIMIT, KEY_REQUEST_RATE_LIMIT,
    STRATEGY_ALWAYS_SAVE, STRATEGY_BACKUP_ONLY, STRATEGY_CONCURRENT,
};

pub const DEFAULT_CONCURRENT_WORKERS: usize = 4;

const BYTES_PER_KB: u64 = 1024;
const BYTES_PER_MB: u64 = 1024 * 1024;

/// How a received batch reaches durable state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum Strategy {
    /// Send directly; only failed batches go to the queue, which may evict its oldest entries.
    #[default]
    BackupOnly,
    /// Persist every batch before delivery, delivered in order by a single worker by default.
    AlwaysSave,
    /// Persist every batch, delivered by a pool of workers without ordering guarantees.
    Concurrent,
}

impl Strategy {
    /// Whether appends block instead of evicting when the queue is full.
    #[must_use]
    pub fn blocks_when_full(self) -> bool {
        !matches!(self, Strategy::BackupOnly)
    }
}

impl AsRef<str> for Strategy {
    fn as_ref(&self) -> &str {
        match self {
            Strategy::BackupOnly => STRATEGY_BACKUP_ONLY,
            Strategy::AlwaysSave => STRATEGY_ALWAYS_SAVE,
            Strategy::Concurrent => STRATEGY_CONCURRENT,
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_ref())
    }
}

impl FromStr for Strategy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            STRATEGY_BACKUP_ONLY => Ok(Strategy::BackupOnly),
            STRATEGY_ALWAYS_SAVE => Ok(Strategy::AlwaysSave),
            STRATEGY_CONCURRENT => Ok(Strategy::Concurrent),
            other => Err(ConfigError::InvalidOption {
                key: KEY_FT_STRATEGY.to_string(),
                value: other.to_string(),
                reason: format!(
                    "must be one of {STRATEGY_BACKUP_ONLY}, {STRATEGY_ALWAYS_SAVE}, {STRATEGY_CONCURRENT}"
                ),
            }),
        }
    }
}

/// Storage behind the durable queue.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum QueueBacking {
    /// Append log on local disk, survives restarts.
    #[default]
    Disk,
    /// Bounded in-memory ring. Unacknowledged batches are lost on crash.
    Memory,
}

/// Validated, immutable engine configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    pub strategy: Strategy,
    pub backing: QueueBacking,
    /// Directory of the disk queue, required for [`QueueBacking::Disk`].
    pub save_log_path: Option<PathBuf>,
    /// Maximum number of unacknowledged batches.
    pub queue_capacity: usize,
    /// Explicit worker count (`ft_procs`), see [`EngineConfig::worker_count`].
    pub workers: Option<usize>,
    /// Queue changes between two syncs.
    pub sync_every: u64,
    /// Maximum time between two syncs.
    pub sync_interval: Duration,
    pub disk_write_limit_bytes: u64,
    pub flow_rate_limit_bytes: u64,
    pub request_rate_limit: u64,
    pub max_retries: u32,
    pub retry_backoff: Duration,
    pub max_retry_backoff: Duration,
    pub trim_threshold_bytes: u64,
    pub stop_grace: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            strategy: Strategy::BackupOnly,
            backing: QueueBacking::Disk,
            save_log_path: None,
            queue_capacity: 100,
            workers: None,
            sync_every: 10,
            sync_interval: Duration::from_millis(1000),
            disk_write_limit_bytes: 0,
            flow_rate_limit_bytes: 0,
            request_rate_limit: 0,
            max_retries: 10,
            retry_backoff: Duration::from_millis(100),
            max_retry_backoff: Duration::from_millis(30_000),
            trim_threshold_bytes: 32 * BYTES_PER_MB,
            stop_grace: Duration::from_millis(5000),
        }
    }
}

impl EngineConfig {
    /// Builds a configuration from an option map, validating every shared `ft_*` key.
    pub fn from_options(options: &HashMap<String, String>) -> Result<Self, ConfigError> {
        validate_options(FT_OPTIONS, options)?;

        let strategy: Strategy = value(options, KEY_FT_STRATEGY)?.parse()?;
        let backing = if value(options, KEY_FT_MEMORY_CHANNEL)? == "true" {
            QueueBacking::Memory
        } else {
            QueueBacking::Disk
        };
        let save_log_path = match value(options, KEY_FT_SAVE_LOG_PATH)? {
            "" => None,
            path => Some(PathBuf::from(path)),
        };
        let workers = optional_number::<usize>(options, KEY_FT_PROCS)?;

        let config = EngineConfig {
            strategy,
            backing,
            save_log_path,
            queue_capacity: number(options, KEY_FT_MEMORY_CHANNEL_SIZE)?,
            workers,
            sync_every: number(options, KEY_FT_SYNC_EVERY)?,
            sync_interval: Duration::from_millis(number(options, KEY_FT_SYNC_INTERVAL_MS)?),
            disk_write_limit_bytes: optional_number::<u64>(options, KEY_FT_WRITE_LIMIT)?
                .unwrap_or(0)
                .saturating_mul(BYTES_PER_MB),
            flow_rate_limit_bytes: optional_number::<u64>(options, KEY_FLOW_RATE_LIMIT)?
                .unwrap_or(0)
                .saturating_mul(BYTES_PER_KB),
            request_rate_limit: optional_number::<u64>(options, KEY_REQUEST_RATE_LIMIT)?
                .unwrap_or(0),
            max_retries: number(options, KEY_FT_MAX_RETRIES)?,
            retry_backoff: Duration::from_millis(number(options, KEY_FT_RETRY_BACKOFF_MS)?),
            max_retry_backoff: Duration::from_millis(number(
                options,
                KEY_FT_MAX_RETRY_BACKOFF_MS,
            )?),
            trim_threshold_bytes: number(options, KEY_FT_TRIM_THRESHOLD_BYTES)?,
            stop_grace: Duration::from_millis(number(options, KEY_FT_STOP_GRACE_MS)?),
        };

        config.validate()?;
        Ok(config)
    }

    /// Checks cross-field constraints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.backing == QueueBacking::Disk
            && self
                .save_log_path
                .as_ref()
                .map_or(true, |p| p.as_os_str().is_empty())
        {
            return Err(ConfigError::MissingOption(KEY_FT_SAVE_LOG_PATH.to_string()));
        }
        if self.queue_capacity == 0 {
            return Err(invalid(KEY_FT_MEMORY_CHANNEL_SIZE, "0", "must be greater than 0"));
        }
        if self.workers == Some(0) {
            return Err(invalid(KEY_FT_PROCS, "0", "must be greater than 0"));
        }
        if self.sync_every == 0 {
            return Err(invalid(KEY_FT_SYNC_EVERY, "0", "must be greater than 0"));
        }
        if self.sync_interval.is_zero() {
            return Err(invalid(KEY_FT_SYNC_INTERVAL_MS, "0", "must be greater than 0"));
        }
        Ok(())
    }

    /// Number of delivery workers the strategy runs.
    #[must_use]
    pub fn worker_count(&self) -> usize {
        match self.strategy {
            Strategy::BackupOnly => 1,
            Strategy::AlwaysSave => self.workers.unwrap_or(1),
            Strategy::Concurrent => self.workers.unwrap_or(DEFAULT_CONCURRENT_WORKERS),
        }
    }

    #[must_use]
    pub fn queue_options(&self) -> QueueOptions {
        let storage = match (&self.backing, &self.save_log_path) {
            (QueueBacking::Disk, Some(dir)) => StorageOptions::Disk {
                dir: dir.clone(),
                trim_threshold_bytes: self.trim_threshold_bytes,
            },
            _ => StorageOptions::Memory,
        };
        QueueOptions {
            storage,
            capacity: self.queue_capacity,
            evict_when_full: !self.strategy.blocks_when_full(),
            strict_order: self.worker_count() == 1,
            sync_every: self.sync_every,
        }
    }

    #[must_use]
    pub fn rate_limits(&self) -> RateLimits {
        RateLimits::new(
            self.disk_write_limit_bytes,
            self.flow_rate_limit_bytes,
            self.request_rate_limit,
        )
    }

    #[must_use]
    pub fn backoff(&self) -> Backoff {
        Backoff::new(self.retry_backoff, self.max_retry_backoff, self.max_retries)
    }
}

fn value<'a>(options: &'a HashMap<String, String>, key: &str) -> Result<&'a str, ConfigError> {
    let spec = ft_spec(key).ok_or_else(|| ConfigError::MissingOption(key.to_string()))?;
    Ok(value_or_default(options, spec))
}

fn number<T: FromStr>(options: &HashMap<String, String>, key: &str) -> Result<T, ConfigError> {
    let raw = value(options, key)?;
    raw.parse()
        .map_err(|_| invalid(key, raw, "not a valid number"))
}

fn optional_number<T: FromStr>(
    options: &HashMap<String, String>,
    key: &str,
) -> Result<Option<T>, ConfigError> {
    match value(options, key)? {
        "" => Ok(None),
        raw => raw
            .parse()
            .map(Some)
            .map_err(|_| invalid(key, raw, "not a valid number")),
    }
}

fn invalid(key: &str, value: &str, reason: &str) -> ConfigError {
    ConfigError::InvalidOption {
        key: key.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
}
