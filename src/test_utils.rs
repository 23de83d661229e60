//! Test utilities: message builders and a scripted in-memory consumer client
//! that stands in for the broker.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use rdkafka::error::KafkaError;
use rdkafka::message::{OwnedHeaders, OwnedMessage, Timestamp};

use crate::config::{ReceiverOptions, Subscription};
use crate::consumer::{CommitCallback, CommitTarget, ConsumerClient, PollOutcome, WakeHandle};
use crate::partition::SeekOps;
use crate::rebalance::RebalanceBridge;
use crate::receiver::launch;
use crate::stream::RecordStream;
use crate::types::{OffsetAndMetadata, TopicPartition};

pub(crate) fn test_message(topic: &str, partition: i32, offset: i64, payload: &str) -> OwnedMessage {
    OwnedMessage::new(
        Some(payload.as_bytes().to_vec()),
        Some("test-key".as_bytes().to_vec()),
        topic.to_string(),
        Timestamp::now(),
        partition,
        offset,
        Some(OwnedHeaders::new()),
    )
}

/// A run of sequential messages on one partition.
pub(crate) fn test_batch(topic: &str, partition: i32, offsets: std::ops::Range<i64>) -> Vec<OwnedMessage> {
    offsets
        .map(|offset| test_message(topic, partition, offset, &format!("payload-{offset}")))
        .collect()
}

/// Options tuned for mock-driven tests: short polls, tickers far enough out
/// not to interfere unless a test opts in.
pub(crate) fn test_options() -> ReceiverOptions {
    ReceiverOptions::new("localhost:9092", "test-group")
        .with_topics(["test-topic"])
        .with_poll_timeout(Duration::from_millis(20))
        .with_heartbeat_interval(Duration::from_secs(60))
        .with_close_timeout(Duration::from_secs(2))
}

enum ScriptedPoll {
    Records(Vec<OwnedMessage>),
    Assign(Vec<TopicPartition>),
    Revoke(Vec<TopicPartition>),
}

/// Broker-side state shared between a test and its [`MockClient`].
///
/// Timed polls pop one scripted entry; scripted rebalances invoke the bridge
/// exactly like rdkafka's callbacks, from inside the poll. Zero-timeout polls
/// model join/heartbeat/drain polls and never consume the script. With no
/// script left a timed poll sleeps out its timeout, like a quiet broker.
pub(crate) struct MockBroker {
    script: Mutex<VecDeque<ScriptedPoll>>,
    pub(crate) committed: Mutex<HashMap<TopicPartition, i64>>,
    commit_failures: Mutex<VecDeque<KafkaError>>,
    close_failures: Mutex<VecDeque<KafkaError>>,
    woken: AtomicBool,
    pub(crate) polls: AtomicUsize,
    pub(crate) zero_polls: AtomicUsize,
    pub(crate) pauses: AtomicUsize,
    pub(crate) resumes: AtomicUsize,
    pub(crate) sync_commits: AtomicUsize,
    pub(crate) async_commits: AtomicUsize,
    pub(crate) seeks: Mutex<Vec<(TopicPartition, i64)>>,
    pub(crate) subscribed: Mutex<Option<String>>,
    pub(crate) closed: AtomicBool,
}

impl MockBroker {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(VecDeque::new()),
            committed: Mutex::new(HashMap::new()),
            commit_failures: Mutex::new(VecDeque::new()),
            close_failures: Mutex::new(VecDeque::new()),
            woken: AtomicBool::new(false),
            polls: AtomicUsize::new(0),
            zero_polls: AtomicUsize::new(0),
            pauses: AtomicUsize::new(0),
            resumes: AtomicUsize::new(0),
            sync_commits: AtomicUsize::new(0),
            async_commits: AtomicUsize::new(0),
            seeks: Mutex::new(Vec::new()),
            subscribed: Mutex::new(None),
            closed: AtomicBool::new(false),
        })
    }

    pub(crate) fn push_records(&self, records: Vec<OwnedMessage>) {
        self.script
            .lock()
            .unwrap()
            .push_back(ScriptedPoll::Records(records));
    }

    pub(crate) fn push_assign(&self, partitions: Vec<TopicPartition>) {
        self.script
            .lock()
            .unwrap()
            .push_back(ScriptedPoll::Assign(partitions));
    }

    pub(crate) fn push_revoke(&self, partitions: Vec<TopicPartition>) {
        self.script
            .lock()
            .unwrap()
            .push_back(ScriptedPoll::Revoke(partitions));
    }

    pub(crate) fn fail_next_commit(&self, error: KafkaError) {
        self.commit_failures.lock().unwrap().push_back(error);
    }

    pub(crate) fn fail_next_close(&self, error: KafkaError) {
        self.close_failures.lock().unwrap().push_back(error);
    }

    pub(crate) fn committed_offset(&self, tp: &TopicPartition) -> Option<i64> {
        self.committed.lock().unwrap().get(tp).copied()
    }

    fn apply_commit(&self, offsets: &HashMap<TopicPartition, OffsetAndMetadata>) {
        let mut committed = self.committed.lock().unwrap();
        for (tp, om) in offsets {
            committed.insert(tp.clone(), om.offset());
        }
    }
}

impl CommitTarget for MockBroker {
    fn commit_async(
        &self,
        offsets: HashMap<TopicPartition, OffsetAndMetadata>,
        callback: CommitCallback,
    ) {
        self.async_commits.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = self.commit_failures.lock().unwrap().pop_front() {
            callback(Err(error));
            return;
        }
        self.apply_commit(&offsets);
        callback(Ok(()));
    }

    fn commit_sync(
        &self,
        offsets: &HashMap<TopicPartition, OffsetAndMetadata>,
    ) -> Result<(), KafkaError> {
        self.sync_commits.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = self.commit_failures.lock().unwrap().pop_front() {
            return Err(error);
        }
        self.apply_commit(offsets);
        Ok(())
    }
}

impl SeekOps for MockBroker {
    fn seek(&self, tp: &TopicPartition, offset: i64) -> Result<(), KafkaError> {
        self.seeks.lock().unwrap().push((tp.clone(), offset));
        Ok(())
    }

    fn seek_to_beginning(&self, tp: &TopicPartition) -> Result<(), KafkaError> {
        self.seeks.lock().unwrap().push((tp.clone(), 0));
        Ok(())
    }

    fn seek_to_end(&self, tp: &TopicPartition) -> Result<(), KafkaError> {
        self.seeks.lock().unwrap().push((tp.clone(), i64::MAX));
        Ok(())
    }

    fn position(&self, _tp: &TopicPartition) -> Result<i64, KafkaError> {
        Ok(0)
    }
}

struct MockWake(Arc<MockBroker>);

impl WakeHandle for MockWake {
    fn wake(&self) {
        self.0.woken.store(true, Ordering::Release);
    }
}

pub(crate) struct MockClient {
    broker: Arc<MockBroker>,
    bridge: Arc<RebalanceBridge>,
}

impl CommitTarget for MockClient {
    fn commit_async(
        &self,
        offsets: HashMap<TopicPartition, OffsetAndMetadata>,
        callback: CommitCallback,
    ) {
        self.broker.commit_async(offsets, callback);
    }

    fn commit_sync(
        &self,
        offsets: &HashMap<TopicPartition, OffsetAndMetadata>,
    ) -> Result<(), KafkaError> {
        self.broker.commit_sync(offsets)
    }
}

impl SeekOps for MockClient {
    fn seek(&self, tp: &TopicPartition, offset: i64) -> Result<(), KafkaError> {
        self.broker.seek(tp, offset)
    }

    fn seek_to_beginning(&self, tp: &TopicPartition) -> Result<(), KafkaError> {
        self.broker.seek_to_beginning(tp)
    }

    fn seek_to_end(&self, tp: &TopicPartition) -> Result<(), KafkaError> {
        self.broker.seek_to_end(tp)
    }

    fn position(&self, tp: &TopicPartition) -> Result<i64, KafkaError> {
        SeekOps::position(&*self.broker, tp)
    }
}

impl ConsumerClient for MockClient {
    fn apply_subscription(&self, subscription: &Subscription) -> Result<(), KafkaError> {
        *self.broker.subscribed.lock().unwrap() = Some(format!("{subscription:?}"));
        Ok(())
    }

    fn poll(&mut self, timeout: Duration) -> PollOutcome {
        if self.broker.woken.swap(false, Ordering::AcqRel) {
            return PollOutcome::Wakeup;
        }
        if timeout.is_zero() {
            self.broker.zero_polls.fetch_add(1, Ordering::SeqCst);
            return PollOutcome::Records(Vec::new());
        }

        self.broker.polls.fetch_add(1, Ordering::SeqCst);
        loop {
            let entry = self.broker.script.lock().unwrap().pop_front();
            match entry {
                Some(ScriptedPoll::Records(records)) => return PollOutcome::Records(records),
                Some(ScriptedPoll::Assign(partitions)) => {
                    self.bridge.on_assigned(&*self.broker, partitions);
                }
                Some(ScriptedPoll::Revoke(partitions)) => {
                    self.bridge
                        .on_revoked(&*self.broker, &*self.broker, partitions);
                }
                None => {
                    // quiet broker: wait out the poll timeout
                    std::thread::sleep(timeout);
                    return PollOutcome::Records(Vec::new());
                }
            }
        }
    }

    fn pause_all(&self) -> Result<(), KafkaError> {
        self.broker.pauses.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn resume_all(&self) -> Result<(), KafkaError> {
        self.broker.resumes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn wake_handle(&self) -> Arc<dyn WakeHandle> {
        Arc::new(MockWake(Arc::clone(&self.broker)))
    }

    fn close(&mut self) -> Result<(), KafkaError> {
        if let Some(error) = self.broker.close_failures.lock().unwrap().pop_front() {
            return Err(error);
        }
        self.broker.closed.store(true, Ordering::Release);
        Ok(())
    }
}

/// Start a receiver backed by a scripted broker.
pub(crate) fn launch_mock(options: ReceiverOptions) -> (RecordStream, Arc<MockBroker>) {
    let broker = MockBroker::new();
    let client_broker = Arc::clone(&broker);
    let stream = launch(options, move |bridge| {
        Ok(MockClient {
            broker: client_broker,
            bridge,
        })
    })
    .expect("failed to launch mock receiver");
    (stream, broker)
}

/// Poll a condition until it holds or the deadline passes.
pub(crate) async fn wait_until(what: &str, deadline: Duration, mut condition: impl FnMut() -> bool) {
    let end = Instant::now() + deadline;
    while !condition() {
        if Instant::now() > end {
            panic!("condition not met within {deadline:?}: {what}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
