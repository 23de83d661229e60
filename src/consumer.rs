use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rdkafka::consumer::{BaseConsumer, Consumer, ConsumerContext, Rebalance};
use rdkafka::error::{KafkaError, KafkaResult, RDKafkaErrorCode};
use rdkafka::message::OwnedMessage;
use rdkafka::{ClientConfig, ClientContext, Offset, TopicPartitionList};
use tracing::{debug, error, warn};

use crate::config::Subscription;
use crate::partition::SeekOps;
use crate::rebalance::RebalanceBridge;
use crate::types::{offsets_to_tpl, OffsetAndMetadata, TopicPartition};

const SEEK_TIMEOUT: Duration = Duration::from_secs(5);

/// Invoked exactly once with the outcome of an async commit.
pub(crate) type CommitCallback = Box<dyn FnOnce(Result<(), KafkaError>) + Send>;

/// The commit surface of the consumer, usable both by the event loop and
/// from within a rebalance callback holding the raw consumer.
pub(crate) trait CommitTarget {
    fn commit_async(
        &self,
        offsets: HashMap<TopicPartition, OffsetAndMetadata>,
        callback: CommitCallback,
    );

    fn commit_sync(
        &self,
        offsets: &HashMap<TopicPartition, OffsetAndMetadata>,
    ) -> Result<(), KafkaError>;
}

/// Outcome of one poll event against the consumer.
pub(crate) enum PollOutcome {
    /// Zero or more records; rebalance callbacks may have run inside.
    Records(Vec<OwnedMessage>),
    /// The poll was cut short by a wakeup; close is imminent.
    Wakeup,
    Err(KafkaError),
}

/// Cross-thread handle that unblocks the consumer for shutdown.
pub(crate) trait WakeHandle: Send + Sync {
    fn wake(&self);
}

/// The consumer collaborator driven by the event loop. Not thread-safe by
/// contract: every call happens on the event-loop thread. Only the wake
/// handle escapes to other threads.
pub(crate) trait ConsumerClient: CommitTarget + SeekOps + Send {
    fn apply_subscription(&self, subscription: &Subscription) -> Result<(), KafkaError>;

    fn poll(&mut self, timeout: Duration) -> PollOutcome;

    fn pause_all(&self) -> Result<(), KafkaError>;

    fn resume_all(&self) -> Result<(), KafkaError>;

    fn wake_handle(&self) -> Arc<dyn WakeHandle>;

    fn close(&mut self) -> Result<(), KafkaError>;
}

/// rdkafka context wiring rebalance and commit callbacks back into the
/// bridge. Callbacks run on the event-loop thread, inside a poll.
pub(crate) struct ReceiverContext {
    bridge: Arc<RebalanceBridge>,
    commit_callbacks: Arc<Mutex<VecDeque<CommitCallback>>>,
}

impl ClientContext for ReceiverContext {}

impl ConsumerContext for ReceiverContext {
    fn pre_rebalance(&self, base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance<'_>) {
        match rebalance {
            Rebalance::Revoke(partitions) => {
                let partitions: Vec<TopicPartition> = partitions
                    .elements()
                    .into_iter()
                    .map(TopicPartition::from)
                    .collect();
                self.bridge
                    .on_revoked(base_consumer, base_consumer, partitions);
            }
            Rebalance::Assign(partitions) => {
                debug!("pre-rebalance assign for {} partitions", partitions.count());
            }
            Rebalance::Error(e) => {
                error!("rebalance error: {e}");
            }
        }
    }

    fn post_rebalance(&self, base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance<'_>) {
        if let Rebalance::Assign(partitions) = rebalance {
            let partitions: Vec<TopicPartition> = partitions
                .elements()
                .into_iter()
                .map(TopicPartition::from)
                .collect();
            self.bridge.on_assigned(base_consumer, partitions);
        }
    }

    fn commit_callback(&self, result: KafkaResult<()>, offsets: &TopicPartitionList) {
        match self.commit_callbacks.lock().unwrap().pop_front() {
            Some(callback) => callback(result),
            None => debug!(
                "commit result for {} partitions with no registered callback",
                offsets.count()
            ),
        }
    }
}

impl CommitTarget for BaseConsumer<ReceiverContext> {
    fn commit_async(
        &self,
        offsets: HashMap<TopicPartition, OffsetAndMetadata>,
        callback: CommitCallback,
    ) {
        let tpl = match offsets_to_tpl(&offsets) {
            Ok(tpl) => tpl,
            Err(e) => {
                callback(Err(e));
                return;
            }
        };
        let callbacks = Arc::clone(&self.context().commit_callbacks);
        callbacks.lock().unwrap().push_back(callback);
        if let Err(e) = self.commit(&tpl, rdkafka::consumer::CommitMode::Async) {
            // the commit never went out; fail the callback we just queued
            if let Some(callback) = callbacks.lock().unwrap().pop_back() {
                callback(Err(e));
            }
        }
    }

    fn commit_sync(
        &self,
        offsets: &HashMap<TopicPartition, OffsetAndMetadata>,
    ) -> Result<(), KafkaError> {
        let tpl = offsets_to_tpl(offsets)?;
        self.commit(&tpl, rdkafka::consumer::CommitMode::Sync)
    }
}

impl SeekOps for BaseConsumer<ReceiverContext> {
    fn seek(&self, tp: &TopicPartition, offset: i64) -> Result<(), KafkaError> {
        Consumer::seek(
            self,
            tp.topic(),
            tp.partition(),
            Offset::Offset(offset),
            SEEK_TIMEOUT,
        )
    }

    fn seek_to_beginning(&self, tp: &TopicPartition) -> Result<(), KafkaError> {
        Consumer::seek(self, tp.topic(), tp.partition(), Offset::Beginning, SEEK_TIMEOUT)
    }

    fn seek_to_end(&self, tp: &TopicPartition) -> Result<(), KafkaError> {
        Consumer::seek(self, tp.topic(), tp.partition(), Offset::End, SEEK_TIMEOUT)
    }

    fn position(&self, tp: &TopicPartition) -> Result<i64, KafkaError> {
        let positions = Consumer::position(self)?;
        match positions
            .find_partition(tp.topic(), tp.partition())
            .map(|elem| elem.offset())
        {
            Some(Offset::Offset(offset)) => Ok(offset),
            _ => Err(KafkaError::MetadataFetch(
                RDKafkaErrorCode::UnknownPartition,
            )),
        }
    }
}

struct FlagWake(Arc<AtomicBool>);

impl WakeHandle for FlagWake {
    fn wake(&self) {
        self.0.store(true, Ordering::Release);
    }
}

/// Production consumer client over an rdkafka `BaseConsumer`.
///
/// `BaseConsumer::poll` yields one message at a time, so a poll event drains
/// up to `max_poll_records`: the first message waits out the poll timeout,
/// the rest are taken without waiting. librdkafka offers no consumer wakeup,
/// so the wake flag short-circuits the next poll instead; shutdown latency
/// is bounded by the poll timeout.
pub(crate) struct RdKafkaClient {
    consumer: BaseConsumer<ReceiverContext>,
    woken: Arc<AtomicBool>,
    max_poll_records: usize,
}

impl RdKafkaClient {
    pub(crate) fn create(
        client_config: &ClientConfig,
        max_poll_records: usize,
        bridge: Arc<RebalanceBridge>,
    ) -> Result<Self, KafkaError> {
        let context = ReceiverContext {
            bridge,
            commit_callbacks: Arc::new(Mutex::new(VecDeque::new())),
        };
        let consumer: BaseConsumer<ReceiverContext> =
            client_config.create_with_context(context)?;
        Ok(Self {
            consumer,
            woken: Arc::new(AtomicBool::new(false)),
            max_poll_records,
        })
    }
}

impl CommitTarget for RdKafkaClient {
    fn commit_async(
        &self,
        offsets: HashMap<TopicPartition, OffsetAndMetadata>,
        callback: CommitCallback,
    ) {
        self.consumer.commit_async(offsets, callback);
    }

    fn commit_sync(
        &self,
        offsets: &HashMap<TopicPartition, OffsetAndMetadata>,
    ) -> Result<(), KafkaError> {
        self.consumer.commit_sync(offsets)
    }
}

impl SeekOps for RdKafkaClient {
    fn seek(&self, tp: &TopicPartition, offset: i64) -> Result<(), KafkaError> {
        SeekOps::seek(&self.consumer, tp, offset)
    }

    fn seek_to_beginning(&self, tp: &TopicPartition) -> Result<(), KafkaError> {
        SeekOps::seek_to_beginning(&self.consumer, tp)
    }

    fn seek_to_end(&self, tp: &TopicPartition) -> Result<(), KafkaError> {
        SeekOps::seek_to_end(&self.consumer, tp)
    }

    fn position(&self, tp: &TopicPartition) -> Result<i64, KafkaError> {
        SeekOps::position(&self.consumer, tp)
    }
}

impl ConsumerClient for RdKafkaClient {
    fn apply_subscription(&self, subscription: &Subscription) -> Result<(), KafkaError> {
        match subscription {
            Subscription::Topics(topics) => {
                let topics: Vec<&str> = topics.iter().map(String::as_str).collect();
                self.consumer.subscribe(&topics)
            }
            Subscription::Pattern(pattern) => self.consumer.subscribe(&[pattern.as_str()]),
            Subscription::Partitions(partitions) => {
                let mut tpl = TopicPartitionList::new();
                for (tp, offset) in partitions {
                    let offset = match offset {
                        Some(o) => Offset::Offset(*o),
                        None => Offset::Invalid,
                    };
                    tpl.add_partition_offset(tp.topic(), tp.partition(), offset)?;
                }
                self.consumer.assign(&tpl)
            }
        }
    }

    fn poll(&mut self, timeout: Duration) -> PollOutcome {
        if self.woken.swap(false, Ordering::AcqRel) {
            return PollOutcome::Wakeup;
        }

        let mut records = Vec::new();
        match self.consumer.poll(timeout) {
            None => return PollOutcome::Records(records),
            Some(Err(e)) => return PollOutcome::Err(e),
            Some(Ok(message)) => records.push(message.detach()),
        }
        while records.len() < self.max_poll_records {
            match self.consumer.poll(Duration::ZERO) {
                None => break,
                Some(Err(e)) => {
                    // keep what we already drained; surface the error next poll
                    warn!("poll error while draining batch: {e}");
                    break;
                }
                Some(Ok(message)) => records.push(message.detach()),
            }
        }
        PollOutcome::Records(records)
    }

    fn pause_all(&self) -> Result<(), KafkaError> {
        let assignment = self.consumer.assignment()?;
        self.consumer.pause(&assignment)
    }

    fn resume_all(&self) -> Result<(), KafkaError> {
        let assignment = self.consumer.assignment()?;
        self.consumer.resume(&assignment)
    }

    fn wake_handle(&self) -> Arc<dyn WakeHandle> {
        Arc::new(FlagWake(Arc::clone(&self.woken)))
    }

    fn close(&mut self) -> Result<(), KafkaError> {
        debug!("unsubscribing consumer before close");
        self.consumer.unsubscribe();
        Ok(())
    }
}
