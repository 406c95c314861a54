//! Source offset acknowledgement.
//!
//! A source record is acknowledged only after its table write is durable or
//! it was rejected as malformed. Anything not acknowledged is redelivered
//! after a restart.

use std::sync::Arc;

use parking_lot::Mutex;
use rdkafka::{
    consumer::{Consumer, StreamConsumer},
    Offset, TopicPartitionList,
};

pub trait OffsetSink: Send + Sync + 'static {
    /// Mark the record at `offset` as processed.
    fn ack(&self, partition: i32, offset: i64) -> Result<(), String>;
}

/// Stores offsets on the source consumer. The consumer's auto-commit picks
/// up whatever was stored, so `enable.auto.offset.store` must be off.
#[derive(Clone)]
pub struct KafkaOffsets {
    consumer: Arc<StreamConsumer>,
    topic: String,
}

impl std::fmt::Debug for KafkaOffsets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KafkaOffsets")
            .field("topic", &self.topic)
            .finish_non_exhaustive()
    }
}

impl KafkaOffsets {
    pub(crate) fn new(consumer: Arc<StreamConsumer>, topic: String) -> Self { Self { consumer, topic } }
}

impl OffsetSink for KafkaOffsets {
    fn ack(&self, partition: i32, offset: i64) -> Result<(), String> {
        // The committed offset is the next one to read.
        let mut tpl = TopicPartitionList::new();
        tpl.add_partition_offset(&self.topic, partition, Offset::Offset(offset + 1))
            .map_err(|e| e.to_string())?;
        self.consumer.store_offsets(&tpl).map_err(|e| e.to_string())
    }
}

/// Keeps every acknowledgement in order. Clones share the same list.
#[derive(Debug, Clone, Default)]
pub struct MemoryOffsets {
    acked: Arc<Mutex<Vec<(i32, i64)>>>,
}

impl MemoryOffsets {
    /// `(partition, offset)` pairs in acknowledgement order.
    pub fn acked(&self) -> Vec<(i32, i64)> { self.acked.lock().clone() }
}

impl OffsetSink for MemoryOffsets {
    fn ack(&self, partition: i32, offset: i64) -> Result<(), String> {
        self.acked.lock().push((partition, offset));
        Ok(())
    }
}
