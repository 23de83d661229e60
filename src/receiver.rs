use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use rdkafka::error::KafkaError;
use tokio::sync::mpsc::unbounded_channel;

use crate::close::CloseCoordinator;
use crate::committer::Committer;
use crate::config::ReceiverOptions;
use crate::consumer::{ConsumerClient, RdKafkaClient};
use crate::error::ReceiverError;
use crate::event_loop::{ClientFactory, Demand, Event, EventLoop, FailureSink, EVENT_QUEUE_CAPACITY};
use crate::offset::CommitLink;
use crate::rebalance::RebalanceBridge;
use crate::stream::RecordStream;

/// Extra slack on top of the close timeout when awaiting shutdown: the event
/// loop may be inside one last bounded poll before it sees the close.
const CLOSE_WAIT_SLACK: Duration = Duration::from_secs(1);

/// Entry point of the bridge: holds the captured options and turns them into
/// a running receiver on subscription.
///
/// ```no_run
/// use futures::StreamExt;
/// use kafka_receiver::{AckMode, KafkaReceiver, ReceiverOptions};
///
/// # async fn run() -> Result<(), kafka_receiver::ReceiverError> {
/// let options = ReceiverOptions::new("localhost:9092", "my-group")
///     .with_topics(["events"])
///     .with_ack_mode(AckMode::ManualAck)
///     .with_commit_batch_size(10);
///
/// let mut stream = KafkaReceiver::new(options).receive()?;
/// while let Some(record) = stream.next().await {
///     let record = record?;
///     // process...
///     record.offset.acknowledge();
/// }
/// # Ok(())
/// # }
/// ```
pub struct KafkaReceiver {
    options: ReceiverOptions,
}

impl KafkaReceiver {
    pub fn new(options: ReceiverOptions) -> Self {
        Self { options }
    }

    /// Start the receiver and return its record stream.
    ///
    /// Consumes the receiver: exactly one stream exists per receiver. No
    /// consumer is created before this call; the event loop spawns here and
    /// opens the consumer on its Init event.
    pub fn receive(self) -> Result<RecordStream, ReceiverError> {
        let options = self.options;
        let bridge_options = options.clone();
        launch(options, move |bridge| {
            RdKafkaClient::create(
                &bridge_options.client_config,
                bridge_options.max_poll_records,
                bridge,
            )
        })
    }
}

/// Wire up channels, commit machinery, the rebalance bridge and the event
/// loop around a client produced by `make_client`, then start everything.
pub(crate) fn launch<C, F>(options: ReceiverOptions, make_client: F) -> Result<RecordStream, ReceiverError>
where
    C: ConsumerClient + 'static,
    F: FnOnce(Arc<RebalanceBridge>) -> Result<C, KafkaError> + Send + 'static,
{
    let subscription = options
        .subscription
        .clone()
        .ok_or_else(|| ReceiverError::Startup("no subscription configured".to_string()))?;

    let (event_tx, event_rx) = mpsc::sync_channel(EVENT_QUEUE_CAPACITY);
    let (record_tx, record_rx) = unbounded_channel();

    let (close, closed_rx) = CloseCoordinator::new(options.close_timeout, event_tx.clone());
    let close = Arc::new(close);
    let sink = FailureSink::new(record_tx.clone(), Arc::clone(&close));
    let committer = Arc::new(Committer::new(
        options.ack_mode,
        options.max_auto_commit_attempts,
        event_tx.clone(),
        sink.clone(),
    ));
    let bridge = Arc::new(RebalanceBridge::new(
        Arc::clone(&committer),
        options.assign_listeners.clone(),
        options.revoke_listeners.clone(),
        sink.clone(),
    ));
    let demand = Arc::new(Demand::new(event_tx.clone()));
    let link = Arc::new(CommitLink {
        committer: Arc::clone(&committer),
        ack_mode: options.ack_mode,
        commit_batch_size: options.commit_batch_size,
    });

    let factory: ClientFactory<C> = Box::new(move || make_client(bridge));
    let event_loop = EventLoop::new(
        subscription,
        options.ack_mode,
        options.poll_timeout,
        options.heartbeat_interval,
        options.commit_interval,
        event_rx,
        Arc::clone(&demand),
        committer,
        Arc::clone(&close),
        record_tx,
        sink,
        link,
        factory,
    );

    event_tx
        .try_send(Event::Init)
        .map_err(|_| ReceiverError::QueueOverflow)?;
    event_loop
        .spawn(format!("kafka-receiver-{}", options.group_id))
        .map_err(|e| ReceiverError::Startup(format!("failed to spawn event loop: {e}")))?;

    let close_wait = options.close_timeout + options.poll_timeout + CLOSE_WAIT_SLACK;
    Ok(RecordStream::new(
        record_rx,
        demand,
        close,
        closed_rx,
        close_wait,
    ))
}
