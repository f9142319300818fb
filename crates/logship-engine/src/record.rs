// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use serde_json::{Map, Value};

/// A single structured record produced by the parser layer.
///
/// Field order is preserved. The engine never inspects or mutates record contents.
pub type Record = Map<String, Value>;

/// An ordered group of records delivered to a sink as one unit.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    records: Vec<Record>,
    sequence: Option<u64>,
    size_estimate: usize,
    retry_count: u32,
}

impl Batch {
    #[must_use]
    pub fn new(records: Vec<Record>) -> Self {
        let size_estimate = estimate_size(&records);
        Batch {
            records,
            sequence: None,
            size_estimate,
            retry_count: 0,
        }
    }

    /// Rebuilds a batch from a persisted payload.
    pub(crate) fn from_payload(
        sequence: u64,
        payload: &[u8],
        retry_count: u32,
    ) -> Result<Self, serde_json::Error> {
        let records: Vec<Record> = serde_json::from_slice(payload)?;
        Ok(Batch {
            records,
            sequence: Some(sequence),
            size_estimate: payload.len(),
            retry_count,
        })
    }

    pub(crate) fn with_delivery_state(mut self, sequence: u64, retry_count: u32) -> Self {
        self.sequence = Some(sequence);
        self.retry_count = retry_count;
        self
    }

    pub(crate) fn set_retry_count(&mut self, retry_count: u32) {
        self.retry_count = retry_count;
    }

    /// Serialized form stored in the durable queue: a JSON array of records.
    pub(crate) fn to_payload(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(&self.records)
    }

    #[must_use]
    pub fn records(&self) -> &[Record] {
        &self.records
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Sequence number assigned by the durable queue, `None` until the batch is enqueued.
    #[must_use]
    pub fn sequence(&self) -> Option<u64> {
        self.sequence
    }

    /// Approximate serialized size in bytes, used for rate limiting.
    #[must_use]
    pub fn size_estimate(&self) -> usize {
        self.size_estimate
    }

    #[must_use]
    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }
}

impl From<Vec<Record>> for Batch {
    fn from(records: Vec<Record>) -> Self {
        Batch::new(records)
    }
}

// Brackets and commas of the JSON array plus each serialized record.
fn estimate_size(records: &[Record]) -> usize {
    let separators = records.len().saturating_sub(1) + 2;
    records
        .iter()
        .map(|record| serde_json::to_vec(record).map_or(0, |v| v.len()))
        .sum::<usize>()
        + separators
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(value: serde_json::Value) -> Record {
        value.as_object().unwrap().clone()
    }

    #[test]
    fn test_size_estimate_matches_payload() {
        let batch = Batch::new(vec![
            record(json!({"host": "a", "cpu": 0.5})),
            record(json!({"host": "b", "cpu": 0.7, "tags": ["x", "y"]})),
        ]);

        assert_eq!(batch.size_estimate(), batch.to_payload().unwrap().len());
        assert_eq!(batch.sequence(), None);
        assert_eq!(batch.retry_count(), 0);
    }

    #[test]
    fn test_empty_batch_estimate() {
        let batch = Batch::new(vec![]);
        assert!(batch.is_empty());
        assert_eq!(batch.size_estimate(), 2);
    }

    #[test]
    fn test_payload_preserves_field_order() {
        let batch = Batch::new(vec![record(json!({"z": 1, "a": 2, "m": null}))]);
        let payload = batch.to_payload().unwrap();
        assert_eq!(payload, br#"[{"z":1,"a":2,"m":null}]"#);

        let restored = Batch::from_payload(7, &payload, 2).unwrap();
        let keys: Vec<&String> = restored.records()[0].keys().collect();
        assert_eq!(keys, ["z", "a", "m"]);
        assert_eq!(restored.sequence(), Some(7));
        assert_eq!(restored.retry_count(), 2);
    }
}
