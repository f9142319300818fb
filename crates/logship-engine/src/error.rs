// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;

/// Errors raised by the durable queue.
///
/// Any of these is a local resource problem and is fatal to the engine instance.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Queue I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to encode batch: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("Invalid queue file {path}: {reason}")]
    InvalidFile { path: String, reason: String },

    #[error("Queue is closed")]
    Closed,
}

impl QueueError {
    pub(crate) fn io(path: &std::path::Path, source: std::io::Error) -> Self {
        QueueError::Io {
            path: path.display().to_string(),
            source,
        }
    }
}

/// Errors raised while validating configuration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value '{value}' for option {key}: {reason}")]
    InvalidOption {
        key: String,
        value: String,
        reason: String,
    },

    #[error("Missing required option {0}")]
    MissingOption(String),

    #[error("Unknown sink type '{0}'")]
    UnknownSinkType(String),
}

/// Outcome of a failed send, as classified by the sink.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
    /// Transient failure, the batch is retried after a backoff.
    #[error("Retryable send error: {0}")]
    Retryable(String),

    /// Permanent failure, the batch is dead-lettered without retrying.
    #[error("Fatal send error: {0}")]
    Fatal(String),

    /// The sink could not tell. Retried, within the retry limit.
    #[error("Send error: {0}")]
    Unclassified(String),
}

impl SendError {
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        !matches!(self, SendError::Fatal(_))
    }

    #[must_use]
    pub fn message(&self) -> &str {
        match self {
            SendError::Retryable(message)
            | SendError::Fatal(message)
            | SendError::Unclassified(message) => message,
        }
    }
}

/// Errors surfaced by the engine to its owner.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("Durable queue failure: {0}")]
    Queue(#[from] QueueError),

    #[error("Engine already stopped")]
    Stopped,

    #[error("Workers did not stop within {0:?}")]
    ShutdownTimeout(Duration),

    #[error("Failed to close sink {sink}: {message}")]
    SinkClose { sink: String, message: String },
}
