// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::debug;

use super::{SendError, Sink};
use crate::config::options::OptionSpec;
use crate::error::ConfigError;
use crate::record::Batch;

pub const SINK_TYPE: &str = "file";
pub const KEY_FILE_SEND_PATH: &str = "file_send_path";

pub static FILE_OPTIONS: &[OptionSpec] = &[OptionSpec::new(
    KEY_FILE_SEND_PATH,
    "",
    "File the records are appended to, one JSON object per line (file_send_path)",
)
.required()];

/// Appends every record as one JSON line to a local file.
///
/// The file is opened lazily and reopened after a write error, so a sink pointed at a
/// temporarily missing mount recovers once the path is writable again.
#[derive(Debug)]
pub struct FileSink {
    path: PathBuf,
    file: Mutex<Option<File>>,
}

impl FileSink {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        FileSink {
            path: path.into(),
            file: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn open(&self) -> Result<File, SendError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| self.retryable(&e))?;
        }
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| self.retryable(&e))
    }

    fn retryable(&self, error: &std::io::Error) -> SendError {
        SendError::Retryable(format!("{}: {error}", self.path.display()))
    }
}

#[async_trait]
impl Sink for FileSink {
    fn name(&self) -> &str {
        SINK_TYPE
    }

    async fn send(&self, batch: &Batch) -> Result<(), SendError> {
        let mut buf = Vec::with_capacity(batch.size_estimate() + batch.len());
        for record in batch.records() {
            serde_json::to_writer(&mut buf, record)
                .map_err(|e| SendError::Fatal(format!("failed to encode record: {e}")))?;
            buf.push(b'\n');
        }

        let mut guard = self.file.lock().await;
        let mut file = match guard.take() {
            Some(file) => file,
            None => self.open().await?,
        };

        let written = async {
            file.write_all(&buf).await?;
            file.flush().await
        }
        .await;
        // A failed file is dropped and reopened on the next attempt.
        written.map_err(|e| self.retryable(&e))?;
        *guard = Some(file);
        debug!(
            "FILE | Wrote {} records to {}",
            batch.len(),
            self.path.display()
        );
        Ok(())
    }

    async fn close(&self) -> Result<(), SendError> {
        if let Some(file) = self.file.lock().await.take() {
            file.sync_all().await.map_err(|e| self.retryable(&e))?;
        }
        Ok(())
    }
}

pub(crate) fn build(options: &HashMap<String, String>) -> Result<Arc<dyn Sink>, ConfigError> {
    let path = options
        .get(KEY_FILE_SEND_PATH)
        .map(|p| p.trim())
        .filter(|p| !p.is_empty())
        .ok_or_else(|| ConfigError::MissingOption(KEY_FILE_SEND_PATH.to_string()))?;
    Ok(Arc::new(FileSink::new(path)))
}
