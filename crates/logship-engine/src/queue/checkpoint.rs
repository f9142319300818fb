// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::warn;

use super::append_log::sync_dir;
use crate::error::QueueError;

pub(crate) const CHECKPOINT_FILE: &str = "checkpoint.json";
const CHECKPOINT_TMP_FILE: &str = "checkpoint.json.tmp";

/// Persisted queue metadata.
///
/// `consumed_offset` is the low-water mark: every entry before it has reached a terminal state.
/// Entries after it that were acknowledged out of order are listed in `acked_above`, so a replay
/// from `consumed_offset` skips them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub appended_offset: u64,
    pub consumed_offset: u64,
    pub next_sequence: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub acked_above: Vec<u64>,
    /// Wall clock time of the sync, milliseconds since the Unix epoch.
    pub synced_at_ms: u64,
}

impl Checkpoint {
    pub(crate) fn now_ms() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
    }
}

/// Loads the checkpoint of `dir`.
///
/// A missing file is a fresh queue. An unreadable one is treated the same way, which replays
/// the whole log: duplicates are acceptable, losing entries is not.
pub(crate) fn load(dir: &Path) -> Result<Option<Checkpoint>, QueueError> {
    let path = dir.join(CHECKPOINT_FILE);
    let bytes = match fs::read(&path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(QueueError::io(&path, e)),
    };
    match serde_json::from_slice(&bytes) {
        Ok(checkpoint) => Ok(Some(checkpoint)),
        Err(e) => {
            warn!(
                "QUEUE | Ignoring unreadable checkpoint {}: {}",
                path.display(),
                e
            );
            Ok(None)
        }
    }
}

/// Atomically replaces the checkpoint of `dir`.
pub(crate) fn store(dir: &Path, checkpoint: &Checkpoint) -> Result<(), QueueError> {
    let tmp = dir.join(CHECKPOINT_TMP_FILE);
    let path = dir.join(CHECKPOINT_FILE);
    let bytes = serde_json::to_vec(checkpoint)?;

    let mut file = File::create(&tmp).map_err(|e| QueueError::io(&tmp, e))?;
    file.write_all(&bytes).map_err(|e| QueueError::io(&tmp, e))?;
    file.sync_all().map_err(|e| QueueError::io(&tmp, e))?;
    drop(file);

    fs::rename(&tmp, &path).map_err(|e| QueueError::io(&path, e))?;
    sync_dir(dir);
    Ok(())
}
