use std::sync::Arc;
use std::time::Duration;

use rdkafka::ClientConfig;

use crate::partition::SeekablePartition;
use crate::types::TopicPartition;

/// Policy controlling when consumed offsets are committed back to the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckMode {
    /// Every record is acknowledged as it is emitted; offsets are flushed by
    /// the periodic commit or the batch-size threshold.
    AutoAck,
    /// The application acknowledges records explicitly; flushing works as in
    /// [`AckMode::AutoAck`].
    ManualAck,
    /// Acknowledged offsets are only flushed when the application calls
    /// [`crate::CommittableOffset::commit`].
    ManualCommit,
    /// Offsets are committed synchronously before records are delivered.
    AtMostOnce,
}

/// What the receiver subscribes to on startup.
#[derive(Debug, Clone)]
pub enum Subscription {
    /// Group-managed subscription to a list of topics.
    Topics(Vec<String>),
    /// Group-managed subscription to a topic regex (librdkafka `^...` form).
    Pattern(String),
    /// Explicit partition assignment, each with an optional start offset.
    Partitions(Vec<(TopicPartition, Option<i64>)>),
}

/// Callback receiving the partitions assigned to or revoked from this member
/// during a rebalance. Runs on the event-loop thread, inside the poll that
/// triggered the rebalance, so seeks through the given partitions are safe.
pub type RebalanceListener =
    Arc<dyn Fn(&[SeekablePartition<'_>]) -> anyhow::Result<()> + Send + Sync>;

/// Immutable receiver configuration.
///
/// Built with consumer defaults suited for bridged consumption (offsets are
/// never auto-committed by the client; the receiver owns commit scheduling).
/// Arbitrary librdkafka properties can be layered on with
/// [`ReceiverOptions::with_consumer_property`].
#[derive(Clone)]
pub struct ReceiverOptions {
    pub(crate) client_config: ClientConfig,
    pub(crate) group_id: String,
    pub(crate) subscription: Option<Subscription>,
    pub(crate) ack_mode: AckMode,
    pub(crate) poll_timeout: Duration,
    pub(crate) heartbeat_interval: Duration,
    pub(crate) commit_interval: Option<Duration>,
    pub(crate) commit_batch_size: usize,
    pub(crate) close_timeout: Duration,
    pub(crate) max_auto_commit_attempts: u32,
    pub(crate) max_poll_records: usize,
    pub(crate) assign_listeners: Vec<RebalanceListener>,
    pub(crate) revoke_listeners: Vec<RebalanceListener>,
}

impl ReceiverOptions {
    pub fn new(bootstrap_servers: &str, group_id: &str) -> Self {
        let mut client_config = ClientConfig::new();
        client_config
            .set("bootstrap.servers", bootstrap_servers)
            .set("group.id", group_id)
            .set("enable.auto.commit", "false")
            .set("enable.auto.offset.store", "false")
            .set("session.timeout.ms", "30000")
            .set("heartbeat.interval.ms", "3000");

        Self {
            client_config,
            group_id: group_id.to_string(),
            subscription: None,
            ack_mode: AckMode::ManualAck,
            poll_timeout: Duration::from_millis(100),
            heartbeat_interval: Duration::from_secs(3),
            commit_interval: None,
            commit_batch_size: 0,
            close_timeout: Duration::from_secs(60),
            max_auto_commit_attempts: 100,
            max_poll_records: 500,
            assign_listeners: Vec::new(),
            revoke_listeners: Vec::new(),
        }
    }

    /// Subscribe to the given topics through the consumer group.
    pub fn with_topics<I, S>(mut self, topics: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.subscription = Some(Subscription::Topics(
            topics.into_iter().map(Into::into).collect(),
        ));
        self
    }

    /// Subscribe to topics matching a regex through the consumer group.
    pub fn with_topic_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.subscription = Some(Subscription::Pattern(pattern.into()));
        self
    }

    /// Assign explicit partitions, bypassing group management. A `None` start
    /// offset uses the committed offset (or the offset-reset policy).
    pub fn with_partitions<I>(mut self, partitions: I) -> Self
    where
        I: IntoIterator<Item = (TopicPartition, Option<i64>)>,
    {
        self.subscription = Some(Subscription::Partitions(partitions.into_iter().collect()));
        self
    }

    pub fn with_ack_mode(mut self, ack_mode: AckMode) -> Self {
        self.ack_mode = ack_mode;
        self
    }

    /// Bound on each poll against the consumer.
    pub fn with_poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = timeout;
        self
    }

    /// Interval of the heartbeat ticker that keeps group membership alive
    /// while the application is slow.
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Periodic auto-commit cadence for [`AckMode::AutoAck`] and
    /// [`AckMode::ManualAck`]. `None` disables periodic commits.
    pub fn with_commit_interval(mut self, interval: Option<Duration>) -> Self {
        self.commit_interval = interval;
        self
    }

    /// If positive, an acknowledgement that raises the pending batch to this
    /// many partitions triggers an immediate commit.
    pub fn with_commit_batch_size(mut self, size: usize) -> Self {
        self.commit_batch_size = size;
        self
    }

    /// Upper bound for graceful shutdown.
    pub fn with_close_timeout(mut self, timeout: Duration) -> Self {
        self.close_timeout = timeout;
        self
    }

    /// Retry budget for auto-commit failures before the stream fails.
    pub fn with_max_auto_commit_attempts(mut self, attempts: u32) -> Self {
        self.max_auto_commit_attempts = attempts;
        self
    }

    /// Cap on records drained from the consumer per poll event.
    pub fn with_max_poll_records(mut self, max: usize) -> Self {
        self.max_poll_records = max.max(1);
        self
    }

    /// Override the offset reset policy (`earliest` / `latest`).
    pub fn with_offset_reset(mut self, policy: &str) -> Self {
        self.client_config.set("auto.offset.reset", policy);
        self
    }

    /// Enable TLS for the broker connection.
    pub fn with_tls(mut self, enabled: bool) -> Self {
        if enabled {
            self.client_config
                .set("security.protocol", "ssl")
                .set("enable.ssl.certificate.verification", "false");
        }
        self
    }

    /// Pass an arbitrary librdkafka property through to the consumer.
    pub fn with_consumer_property(mut self, key: &str, value: &str) -> Self {
        self.client_config.set(key, value);
        self
    }

    /// Register a callback invoked when partitions are assigned.
    pub fn on_assign(mut self, listener: RebalanceListener) -> Self {
        self.assign_listeners.push(listener);
        self
    }

    /// Register a callback invoked when partitions are revoked.
    pub fn on_revoke(mut self, listener: RebalanceListener) -> Self {
        self.revoke_listeners.push(listener);
        self
    }

    pub fn group_id(&self) -> &str {
        &self.group_id
    }

    pub fn ack_mode(&self) -> AckMode {
        self.ack_mode
    }
}
