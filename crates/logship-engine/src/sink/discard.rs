// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use super::{SendError, Sink};
use crate::error::ConfigError;
use crate::record::Batch;

pub const SINK_TYPE: &str = "discard";

/// Accepts every batch and drops it.
#[derive(Debug, Default)]
pub struct DiscardSink {
    batches: AtomicU64,
    records: AtomicU64,
}

impl DiscardSink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn batches(&self) -> u64 {
        self.batches.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn records(&self) -> u64 {
        self.records.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Sink for DiscardSink {
    fn name(&self) -> &str {
        SINK_TYPE
    }

    async fn send(&self, batch: &Batch) -> Result<(), SendError> {
        self.batches.fetch_add(1, Ordering::Relaxed);
        self.records.fetch_add(batch.len() as u64, Ordering::Relaxed);
        Ok(())
    }
}

pub(crate) fn build(_options: &HashMap<String, String>) -> Result<Arc<dyn Sink>, ConfigError> {
    Ok(Arc::new(DiscardSink::new()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Map, Value};

    #[tokio::test]
    async fn test_counts_what_it_drops() {
        let sink = DiscardSink::new();
        let batch = Batch::new(vec![Map::new(), Map::from_iter([("k".to_string(), Value::Null)])]);
        assert_eq!(sink.send(&batch).await, Ok(()));
        assert_eq!(sink.send(&batch).await, Ok(()));
        assert_eq!(sink.batches(), 2);
        assert_eq!(sink.records(), 4);
        assert_eq!(sink.name(), "discard");
    }
}
