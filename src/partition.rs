use std::fmt;

use rdkafka::error::KafkaError;

use crate::types::TopicPartition;

/// Seek operations the rebalance callbacks may perform on a partition.
/// Implemented by the consumer client; calls are only valid on the
/// event-loop thread, inside the poll that delivered the rebalance.
pub(crate) trait SeekOps {
    fn seek(&self, tp: &TopicPartition, offset: i64) -> Result<(), KafkaError>;
    fn seek_to_beginning(&self, tp: &TopicPartition) -> Result<(), KafkaError>;
    fn seek_to_end(&self, tp: &TopicPartition) -> Result<(), KafkaError>;
    fn position(&self, tp: &TopicPartition) -> Result<i64, KafkaError>;
}

/// A partition handed to rebalance listeners, exposing seek and position.
pub struct SeekablePartition<'a> {
    ops: &'a dyn SeekOps,
    tp: TopicPartition,
}

impl<'a> SeekablePartition<'a> {
    pub(crate) fn new(ops: &'a dyn SeekOps, tp: TopicPartition) -> Self {
        Self { ops, tp }
    }

    pub fn topic_partition(&self) -> &TopicPartition {
        &self.tp
    }

    pub fn seek(&self, offset: i64) -> Result<(), KafkaError> {
        self.ops.seek(&self.tp, offset)
    }

    pub fn seek_to_beginning(&self) -> Result<(), KafkaError> {
        self.ops.seek_to_beginning(&self.tp)
    }

    pub fn seek_to_end(&self) -> Result<(), KafkaError> {
        self.ops.seek_to_end(&self.tp)
    }

    /// The offset of the next record that will be fetched.
    pub fn position(&self) -> Result<i64, KafkaError> {
        self.ops.position(&self.tp)
    }
}

impl fmt::Debug for SeekablePartition<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SeekablePartition({})", self.tp)
    }
}

impl fmt::Display for SeekablePartition<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.tp, f)
    }
}
