// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::error::QueueError;
use crate::record::Record;

pub(crate) const DEAD_LETTER_FILE: &str = "dead_letter.jsonl";
const MEMORY_DEAD_LETTER_LIMIT: usize = 1000;

/// A batch that will never be retried, kept for inspection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    /// Queue sequence, `None` when a direct send failed permanently.
    pub sequence: Option<u64>,
    pub retries: u32,
    pub sink: String,
    pub reason: String,
    pub records: Vec<Record>,
}

#[derive(Debug)]
pub(crate) enum DeadLetterStore {
    /// One JSON document per line, appended and synced on every write.
    File { path: PathBuf, file: File },
    /// The most recent dead letters, oldest dropped first.
    Memory(VecDeque<DeadLetter>),
}

impl DeadLetterStore {
    pub(crate) fn open_file(dir: &Path) -> Result<Self, QueueError> {
        let path = dir.join(DEAD_LETTER_FILE);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| QueueError::io(&path, e))?;
        Ok(DeadLetterStore::File { path, file })
    }

    pub(crate) fn memory() -> Self {
        DeadLetterStore::Memory(VecDeque::new())
    }

    pub(crate) fn push(&mut self, letter: DeadLetter) -> Result<(), QueueError> {
        match self {
            DeadLetterStore::File { path, file } => {
                let mut line = serde_json::to_vec(&letter)?;
                line.push(b'\n');
                file.write_all(&line).map_err(|e| QueueError::io(path, e))?;
                file.sync_data().map_err(|e| QueueError::io(path, e))
            }
            DeadLetterStore::Memory(letters) => {
                if letters.len() >= MEMORY_DEAD_LETTER_LIMIT {
                    letters.pop_front();
                }
                letters.push_back(letter);
                Ok(())
            }
        }
    }

    pub(crate) fn read_all(&self) -> Result<Vec<DeadLetter>, QueueError> {
        match self {
            DeadLetterStore::File { path, .. } => read_file(path),
            DeadLetterStore::Memory(letters) => Ok(letters.iter().cloned().collect()),
        }
    }
}

fn read_file(path: &Path) -> Result<Vec<DeadLetter>, QueueError> {
    let file = match fs::File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(QueueError::io(path, e)),
    };
    let mut letters = Vec::new();
    for line in BufReader::new(file).lines() {
        let line = line.map_err(|e| QueueError::io(path, e))?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str(&line) {
            Ok(letter) => letters.push(letter),
            Err(e) => warn!(
                "QUEUE | Skipping unreadable dead letter in {}: {}",
                path.display(),
                e
            ),
        }
    }
    Ok(letters)
}
