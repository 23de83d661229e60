use std::collections::HashMap;
use std::fmt;

use rdkafka::error::KafkaResult;
use rdkafka::message::OwnedMessage;
use rdkafka::topic_partition_list::TopicPartitionListElem;
use rdkafka::{Message, Offset, TopicPartitionList};
use serde::de::DeserializeOwned;

use crate::error::PayloadError;
use crate::offset::CommittableOffset;

/// A topic name plus partition number, the unit offsets are tracked against.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TopicPartition {
    topic: String,
    partition: i32,
}

impl TopicPartition {
    pub fn new(topic: impl Into<String>, partition: i32) -> Self {
        Self {
            topic: topic.into(),
            partition,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn partition(&self) -> i32 {
        self.partition
    }
}

impl fmt::Display for TopicPartition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.topic, self.partition)
    }
}

impl From<TopicPartitionListElem<'_>> for TopicPartition {
    fn from(elem: TopicPartitionListElem<'_>) -> Self {
        Self::new(elem.topic().to_string(), elem.partition())
    }
}

/// Offset to commit for a partition. Per Kafka convention this is the *next*
/// offset to consume, i.e. highest consumed offset + 1.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OffsetAndMetadata {
    offset: i64,
    metadata: String,
}

impl OffsetAndMetadata {
    pub fn new(offset: i64) -> Self {
        Self {
            offset,
            metadata: String::new(),
        }
    }

    pub fn with_metadata(offset: i64, metadata: impl Into<String>) -> Self {
        Self {
            offset,
            metadata: metadata.into(),
        }
    }

    pub fn offset(&self) -> i64 {
        self.offset
    }

    pub fn metadata(&self) -> &str {
        &self.metadata
    }
}

/// Build the list rdkafka commits from an offset map.
pub(crate) fn offsets_to_tpl(
    offsets: &HashMap<TopicPartition, OffsetAndMetadata>,
) -> KafkaResult<TopicPartitionList> {
    let mut tpl = TopicPartitionList::new();
    for (tp, om) in offsets {
        tpl.add_partition_offset(tp.topic(), tp.partition(), Offset::Offset(om.offset()))?;
    }
    Ok(tpl)
}

/// A record polled from the broker together with its committable offset.
pub struct ReceiverRecord {
    /// The raw Kafka message.
    pub message: OwnedMessage,

    /// Handle used to acknowledge or commit this record's offset.
    pub offset: CommittableOffset,
}

impl ReceiverRecord {
    pub fn topic_partition(&self) -> &TopicPartition {
        self.offset.topic_partition()
    }

    /// Deserialize the payload as JSON.
    pub fn payload_json<T>(&self) -> Result<T, PayloadError>
    where
        T: DeserializeOwned,
    {
        let payload = self.message.payload().ok_or(PayloadError::Empty)?;
        Ok(serde_json::from_slice(payload)?)
    }
}

impl fmt::Debug for ReceiverRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReceiverRecord")
            .field("topic", &self.message.topic())
            .field("partition", &self.message.partition())
            .field("offset", &self.message.offset())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topic_partition_equality_covers_both_fields() {
        let a = TopicPartition::new("events", 0);
        let b = TopicPartition::new("events", 0);
        let c = TopicPartition::new("events", 1);
        let d = TopicPartition::new("clicks", 0);

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);
        assert_eq!(a.to_string(), "events-0");
    }

    #[test]
    fn offsets_to_tpl_encodes_every_partition() {
        let mut offsets = HashMap::new();
        offsets.insert(TopicPartition::new("events", 0), OffsetAndMetadata::new(10));
        offsets.insert(TopicPartition::new("events", 3), OffsetAndMetadata::new(7));

        let tpl = offsets_to_tpl(&offsets).unwrap();
        assert_eq!(tpl.count(), 2);
        let elem = tpl.find_partition("events", 3).unwrap();
        assert_eq!(elem.offset(), Offset::Offset(7));
    }
}
