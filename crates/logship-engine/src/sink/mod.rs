// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The boundary between the engine and a concrete sink.
//!
//! A sink only has to deliver one batch and say whether a failure is worth retrying. Retries,
//! backoff, rate limiting and dead-lettering all happen in the engine.

pub mod discard;
pub mod file;
pub mod http;
pub mod registry;

use async_trait::async_trait;

pub use crate::error::SendError;
use crate::record::Batch;

#[async_trait]
pub trait Sink: Send + Sync {
    /// Name used in logs and dead letters.
    fn name(&self) -> &str;

    /// Delivers one batch. The sink must not keep the batch past the call.
    async fn send(&self, batch: &Batch) -> Result<(), SendError>;

    /// Flushes and releases resources. Called once, after the last send.
    async fn close(&self) -> Result<(), SendError> {
        Ok(())
    }
}
