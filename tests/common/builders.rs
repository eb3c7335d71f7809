//! Test data builders for frames, streams and queries

use datahub_rs::protocol::{encode_batch, RecordBatch};
use datahub_rs::types::Value;

/// Builder for one data frame
pub struct BatchBuilder {
    batch: RecordBatch,
}

impl BatchBuilder {
    pub fn new(scalar_type: &str) -> Self {
        Self {
            batch: RecordBatch {
                scalar_type: Some(scalar_type.to_string()),
                ..Default::default()
            },
        }
    }

    /// Append a sample
    pub fn sample(mut self, timestamp: i64, id: i64, value: impl Into<Value>) -> Self {
        self.batch.timestamps.push(timestamp);
        self.batch.ids.push(id);
        self.batch.values.push(value.into());
        self
    }

    pub fn range_final(mut self) -> Self {
        self.batch.range_final = true;
        self
    }

    pub fn build(self) -> RecordBatch {
        self.batch
    }
}

/// Builder for a framed byte stream
#[derive(Default)]
pub struct StreamBuilder {
    bytes: Vec<u8>,
}

impl StreamBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn frame(mut self, batch: RecordBatch) -> Self {
        self.bytes
            .extend(encode_batch(&batch).expect("batch should encode"));
        self
    }

    /// Drop the last `n` bytes, cutting into the final frame
    pub fn truncate(mut self, n: usize) -> Self {
        let len = self.bytes.len().saturating_sub(n);
        self.bytes.truncate(len);
        self
    }

    pub fn build(self) -> Vec<u8> {
        self.bytes
    }
}

/// The two-frame stream `[1.5, 2.5]` then `[3.5, 4.5]` with the final marker
pub fn two_frame_stream() -> Vec<u8> {
    StreamBuilder::new()
        .frame(
            BatchBuilder::new("f64")
                .sample(1, 10, 1.5)
                .sample(2, 11, 2.5)
                .build(),
        )
        .frame(
            BatchBuilder::new("f64")
                .sample(3, 12, 3.5)
                .sample(4, 13, 4.5)
                .range_final()
                .build(),
        )
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_builder() {
        let batch = BatchBuilder::new("i64").sample(1, 2, 3i64).range_final().build();
        assert_eq!(batch.len(), 1);
        assert!(batch.range_final);
        assert_eq!(batch.scalar_type.as_deref(), Some("i64"));
    }
}
