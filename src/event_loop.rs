use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::mpsc;
use std::sync::mpsc::SyncSender;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rdkafka::error::KafkaError;
use rdkafka::message::OwnedMessage;
use rdkafka::Message;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, error, info, trace, warn};

use crate::close::CloseCoordinator;
use crate::committer::Committer;
use crate::config::{AckMode, Subscription};
use crate::consumer::{ConsumerClient, PollOutcome};
use crate::error::ReceiverError;
use crate::metrics_consts::{
    HEARTBEATS_COUNTER, POLL_BATCH_SIZE_HISTOGRAM, RECORDS_POLLED_COUNTER, REQUESTS_PENDING_GAUGE,
};
use crate::offset::{CommitLink, CommittableOffset};
use crate::types::{OffsetAndMetadata, ReceiverRecord, TopicPartition};

/// Capacity of the internal event queue. Pending flags keep at most one Poll
/// and one Commit queued, so the queue stays tiny; overflow means something
/// is wrong and is logged as an error.
pub(crate) const EVENT_QUEUE_CAPACITY: usize = 32;

const MAX_CLOSE_ATTEMPTS: u32 = 10;

/// Discrete tasks the event loop runs against the consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Event {
    Init,
    Poll,
    Heartbeat,
    Commit,
    Close,
}

pub(crate) type RecordBatch = VecDeque<ReceiverRecord>;

/// One message on the record channel: a polled batch or the terminal error.
pub(crate) type BatchItem = Result<RecordBatch, ReceiverError>;

/// Routes fatal errors to the stream and starts shutdown.
#[derive(Clone)]
pub(crate) struct FailureSink {
    record_tx: UnboundedSender<BatchItem>,
    close: Arc<CloseCoordinator>,
}

impl FailureSink {
    pub(crate) fn new(record_tx: UnboundedSender<BatchItem>, close: Arc<CloseCoordinator>) -> Self {
        Self { record_tx, close }
    }

    pub(crate) fn fail(&self, error: ReceiverError) {
        error!("receiver failed: {error}");
        let _ = self.record_tx.send(Err(error));
        self.close.trigger();
    }

    pub(crate) fn is_active(&self) -> bool {
        self.close.is_active()
    }

    #[cfg(test)]
    pub(crate) fn for_tests(event_tx: SyncSender<Event>) -> Self {
        let (record_tx, _record_rx) = tokio::sync::mpsc::unbounded_channel();
        let (close, _closed_rx) = CloseCoordinator::new(Duration::from_secs(5), event_tx);
        close.mark_active();
        Self {
            record_tx,
            close: Arc::new(close),
        }
    }
}

/// Downstream demand counter driving poll scheduling.
///
/// A poll event is scheduled only on the transition of outstanding demand to
/// positive, deduplicated by the poll-pending flag so at most one Poll sits
/// in the queue at a time.
pub(crate) struct Demand {
    requests_pending: AtomicI64,
    poll_pending: AtomicBool,
    event_tx: SyncSender<Event>,
}

impl Demand {
    pub(crate) fn new(event_tx: SyncSender<Event>) -> Self {
        Self {
            requests_pending: AtomicI64::new(0),
            poll_pending: AtomicBool::new(false),
            event_tx,
        }
    }

    /// Add downstream demand; schedules a poll when the total goes positive.
    pub(crate) fn request(&self, n: i64) {
        let total = self.requests_pending.fetch_add(n, Ordering::SeqCst) + n;
        metrics::gauge!(REQUESTS_PENDING_GAUGE).set(total as f64);
        if total > 0 {
            self.schedule_poll();
        }
    }

    /// Subtract a delivered batch; returns the residual demand.
    pub(crate) fn fulfilled(&self, count: i64) -> i64 {
        let total = self.requests_pending.fetch_sub(count, Ordering::SeqCst) - count;
        metrics::gauge!(REQUESTS_PENDING_GAUGE).set(total as f64);
        total
    }

    pub(crate) fn schedule_poll(&self) {
        if self
            .poll_pending
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
            && self.event_tx.try_send(Event::Poll).is_err()
        {
            self.poll_pending.store(false, Ordering::Release);
            error!("event queue overflow: poll event dropped");
        }
    }

    pub(crate) fn clear_poll_pending(&self) {
        let _ = self.poll_pending.compare_exchange(
            true,
            false,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }
}

pub(crate) type ClientFactory<C> = Box<dyn FnOnce() -> Result<C, KafkaError> + Send>;

/// Single-threaded dispatcher owning the consumer client. All consumer calls
/// happen on this loop's thread; events arrive from the internal queue
/// (Init, Poll, Commit, Close) and from the heartbeat and periodic-commit
/// tickers driven off the queue's receive timeout.
pub(crate) struct EventLoop<C: ConsumerClient> {
    subscription: Subscription,
    ack_mode: AckMode,
    poll_timeout: Duration,
    heartbeat_interval: Duration,
    commit_interval: Option<Duration>,
    events: mpsc::Receiver<Event>,
    demand: Arc<Demand>,
    committer: Arc<Committer>,
    close: Arc<CloseCoordinator>,
    record_tx: UnboundedSender<BatchItem>,
    sink: FailureSink,
    link: Arc<CommitLink>,
    factory: Option<ClientFactory<C>>,
    client: Option<C>,
    needs_heartbeat: AtomicBool,
}

impl<C: ConsumerClient + 'static> EventLoop<C> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        subscription: Subscription,
        ack_mode: AckMode,
        poll_timeout: Duration,
        heartbeat_interval: Duration,
        commit_interval: Option<Duration>,
        events: mpsc::Receiver<Event>,
        demand: Arc<Demand>,
        committer: Arc<Committer>,
        close: Arc<CloseCoordinator>,
        record_tx: UnboundedSender<BatchItem>,
        sink: FailureSink,
        link: Arc<CommitLink>,
        factory: ClientFactory<C>,
    ) -> Self {
        Self {
            subscription,
            ack_mode,
            poll_timeout,
            heartbeat_interval,
            commit_interval,
            events,
            demand,
            committer,
            close,
            record_tx,
            sink,
            link,
            factory: Some(factory),
            client: None,
            needs_heartbeat: AtomicBool::new(true),
        }
    }

    pub(crate) fn spawn(self, thread_name: String) -> std::io::Result<std::thread::JoinHandle<()>> {
        std::thread::Builder::new()
            .name(thread_name)
            .spawn(move || self.run())
    }

    fn run(mut self) {
        debug!("event loop started");
        let periodic_commit = match self.ack_mode {
            AckMode::AutoAck | AckMode::ManualAck => self.commit_interval,
            AckMode::ManualCommit | AckMode::AtMostOnce => None,
        };
        let mut next_heartbeat = Instant::now() + self.heartbeat_interval;
        let mut next_commit = periodic_commit.map(|interval| Instant::now() + interval);

        loop {
            if self.close.is_closed() {
                break;
            }
            if self.close.close_requested() {
                // the close trigger may have failed to enqueue its event
                self.handle_close();
                break;
            }

            // fire due tickers before waiting so a steady event flow cannot
            // starve heartbeats or periodic commits
            let now = Instant::now();
            if now >= next_heartbeat {
                self.dispatch(Event::Heartbeat);
                next_heartbeat = Instant::now() + self.heartbeat_interval;
                continue;
            }
            if let (Some(at), Some(interval)) = (next_commit, periodic_commit) {
                if now >= at {
                    self.dispatch(Event::Commit);
                    next_commit = Some(Instant::now() + interval);
                    continue;
                }
            }

            let mut deadline = next_heartbeat;
            if let Some(at) = next_commit {
                deadline = deadline.min(at);
            }
            match self.events.recv_timeout(deadline.saturating_duration_since(now)) {
                Ok(event) => self.dispatch(event),
                Err(mpsc::RecvTimeoutError::Timeout) => {}
                Err(mpsc::RecvTimeoutError::Disconnected) => {
                    self.close.trigger();
                    self.handle_close();
                    break;
                }
            }
        }
        debug!("event loop terminated");
    }

    fn dispatch(&mut self, event: Event) {
        trace!("dispatch {event:?}");
        if self.close.close_requested() && event != Event::Close {
            return;
        }
        match event {
            Event::Init => self.handle_init(),
            Event::Poll => self.handle_poll(),
            Event::Heartbeat => self.handle_heartbeat(),
            Event::Commit => self.handle_commit(),
            Event::Close => self.handle_close(),
        }
    }

    fn handle_init(&mut self) {
        let Some(factory) = self.factory.take() else {
            return;
        };
        let sink = self.sink.clone();
        match factory() {
            Ok(mut client) => {
                self.close.install_waker(client.wake_handle());
                if let Err(e) = client.apply_subscription(&self.subscription) {
                    sink.fail(ReceiverError::Kafka(e));
                    return;
                }
                // zero-timeout poll forces the group join
                if let PollOutcome::Err(e) = client.poll(Duration::ZERO) {
                    sink.fail(ReceiverError::Kafka(e));
                    return;
                }
                self.client = Some(client);
                self.close.mark_active();
                info!("receiver active");
            }
            Err(e) => sink.fail(ReceiverError::Kafka(e)),
        }
    }

    fn handle_poll(&mut self) {
        self.needs_heartbeat.store(false, Ordering::Release);
        if !self.close.is_active() || self.client.is_none() {
            self.demand.clear_poll_pending();
            return;
        }

        // run a pending commit at the head of the poll so commit latency is
        // not queued behind further polls
        if let Some(client) = self.client.as_ref() {
            self.committer.run_if_required(client, false);
        }

        let outcome = match self.client.as_mut() {
            Some(client) => client.poll(self.poll_timeout),
            None => return,
        };
        match outcome {
            PollOutcome::Wakeup => debug!("poll interrupted by wakeup"),
            PollOutcome::Err(e) => self.sink.fail(ReceiverError::Kafka(e)),
            PollOutcome::Records(messages) => {
                let count = messages.len() as i64;
                if count > 0 {
                    metrics::counter!(RECORDS_POLLED_COUNTER).increment(count as u64);
                    metrics::histogram!(POLL_BATCH_SIZE_HISTOGRAM).record(count as f64);
                    match self.build_batch(messages) {
                        Ok(batch) => {
                            if self.record_tx.send(Ok(batch)).is_err() {
                                debug!("record stream dropped; discarding polled batch");
                            }
                        }
                        Err(e) => {
                            self.sink.fail(e);
                            return;
                        }
                    }
                }
                self.demand.clear_poll_pending();
                if self.demand.fulfilled(count) > 0 && self.close.is_active() {
                    self.demand.schedule_poll();
                }
            }
        }
    }

    /// Wrap polled messages as receiver records, applying the ack mode's
    /// emission side effects before anything becomes visible downstream.
    fn build_batch(&self, messages: Vec<OwnedMessage>) -> Result<RecordBatch, ReceiverError> {
        if self.ack_mode == AckMode::AtMostOnce {
            // at-most-once: offsets are committed before delivery; a failed
            // commit means none of these records may be observed
            let mut offsets: HashMap<TopicPartition, OffsetAndMetadata> = HashMap::new();
            for message in &messages {
                let tp = TopicPartition::new(message.topic(), message.partition());
                let next = message.offset() + 1;
                offsets
                    .entry(tp)
                    .and_modify(|om| {
                        if next > om.offset() {
                            *om = OffsetAndMetadata::new(next);
                        }
                    })
                    .or_insert_with(|| OffsetAndMetadata::new(next));
            }
            let Some(client) = self.client.as_ref() else {
                return Err(ReceiverError::Closed);
            };
            client.commit_sync(&offsets)?;
        }

        Ok(messages
            .into_iter()
            .map(|message| {
                let tp = TopicPartition::new(message.topic(), message.partition());
                let offset = CommittableOffset::new(tp, message.offset(), Arc::clone(&self.link));
                if self.ack_mode == AckMode::AutoAck {
                    offset.acknowledge();
                }
                ReceiverRecord { message, offset }
            })
            .collect())
    }

    /// Keep the group session alive while the application is slow: if no
    /// poll ran since the last tick, poll with everything paused so no
    /// records are fetched.
    fn handle_heartbeat(&mut self) {
        if !self.close.is_active() {
            return;
        }
        if !self.needs_heartbeat.swap(true, Ordering::AcqRel) {
            // a poll ran since the last interval; nothing to do
            return;
        }
        let sink = self.sink.clone();
        let Some(client) = self.client.as_mut() else {
            return;
        };
        if let Err(e) = client.pause_all() {
            sink.fail(ReceiverError::Kafka(e));
            return;
        }
        if let PollOutcome::Err(e) = client.poll(Duration::ZERO) {
            sink.fail(ReceiverError::Kafka(e));
            return;
        }
        if let Err(e) = client.resume_all() {
            sink.fail(ReceiverError::Kafka(e));
            return;
        }
        metrics::counter!(HEARTBEATS_COUNTER).increment(1);
        debug!("heartbeat exchanged");
    }

    fn handle_commit(&self) {
        let Some(client) = self.client.as_ref() else {
            return;
        };
        self.committer.run(client);
    }

    /// Final commit, bounded drain of in-progress commits, client release.
    /// Always finalizes the state, even when the client resists closing.
    fn handle_close(&mut self) {
        if self.close.is_closed() {
            return;
        }
        info!("closing receiver");
        if let Some(mut client) = self.client.take() {
            if let PollOutcome::Wakeup = client.poll(Duration::ZERO) {
                debug!("wakeup drained during close");
            }
            self.committer.run_if_required(&client, true);

            let deadline = self.close.deadline();
            while self.committer.in_progress() > 0 && Instant::now() < deadline {
                // short polls pump the commit callbacks
                let _ = client.poll(Duration::from_millis(1));
            }
            if self.committer.in_progress() > 0 {
                warn!("commits still in progress at close deadline");
            }

            let mut closed = false;
            for attempt in 1..=MAX_CLOSE_ATTEMPTS {
                match client.close() {
                    Ok(()) => {
                        closed = true;
                        break;
                    }
                    Err(e) => warn!("consumer close attempt {attempt} failed: {e}"),
                }
            }
            if !closed {
                warn!("consumer could not be closed");
            }
        }
        self.close.finalize();
        info!("receiver closed");
    }
}
