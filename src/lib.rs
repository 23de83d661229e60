//! Reactive bridge between application code and a Kafka broker.
//!
//! Turns Kafka's polling consumer into a back-pressured asynchronous record
//! stream with explicit acknowledgement and offset-commit semantics. The
//! underlying consumer is driven by a single-threaded event loop that
//! multiplexes record polling, heartbeats, offset commits, rebalance
//! callbacks, and graceful shutdown.

pub mod config;
pub mod error;
pub mod metrics_consts;
pub mod offset;
pub mod partition;
pub mod receiver;
pub mod stream;
pub mod types;

mod batch;
mod close;
mod committer;
mod consumer;
mod event_loop;
mod rebalance;

#[cfg(test)]
pub(crate) mod test_utils;

pub use config::{AckMode, ReceiverOptions, RebalanceListener, Subscription};
pub use error::{PayloadError, ReceiverError};
pub use offset::{CommitFuture, CommittableOffset};
pub use partition::SeekablePartition;
pub use receiver::KafkaReceiver;
pub use stream::RecordStream;
pub use types::{OffsetAndMetadata, ReceiverRecord, TopicPartition};
