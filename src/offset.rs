use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::sync::oneshot;

use crate::committer::Committer;
use crate::config::AckMode;
use crate::error::ReceiverError;
use crate::types::TopicPartition;

/// Shared state every emitted offset links back to: the commit machinery and
/// the ack policy it operates under. The committer outlives all emitted
/// offsets or their use degrades to a logged no-op.
pub(crate) struct CommitLink {
    pub(crate) committer: Arc<Committer>,
    pub(crate) ack_mode: AckMode,
    pub(crate) commit_batch_size: usize,
}

/// Per-record handle for acknowledging and committing the record's offset.
///
/// Acknowledgement is idempotent: one offset contributes at most once to the
/// pending batch.
pub struct CommittableOffset {
    tp: TopicPartition,
    offset: i64,
    acked: AtomicBool,
    link: Arc<CommitLink>,
}

impl CommittableOffset {
    pub(crate) fn new(tp: TopicPartition, offset: i64, link: Arc<CommitLink>) -> Self {
        Self {
            tp,
            offset,
            acked: AtomicBool::new(false),
            link,
        }
    }

    pub fn topic_partition(&self) -> &TopicPartition {
        &self.tp
    }

    pub fn offset(&self) -> i64 {
        self.offset
    }

    /// Mark this record as processed. Whether that stages an offset for the
    /// next flush, and whether the flush is triggered here, depends on the
    /// receiver's ack mode.
    pub fn acknowledge(&self) {
        match self.link.ack_mode {
            // Committed before delivery; nothing to stage.
            AckMode::AtMostOnce => {}
            AckMode::AutoAck | AckMode::ManualAck => {
                let size = self.maybe_update_offset();
                let threshold = self.link.commit_batch_size;
                if threshold > 0 && size >= threshold {
                    self.link.committer.schedule();
                }
            }
            AckMode::ManualCommit => {
                self.maybe_update_offset();
            }
        }
    }

    /// Stage this offset (if not already acknowledged) and schedule an
    /// immediate flush. The returned future resolves when the flush carrying
    /// this offset completes, or fails with the commit error.
    pub fn commit(&self) -> CommitFuture {
        if self.maybe_update_offset() > 0 {
            let (tx, rx) = oneshot::channel();
            self.link.committer.batch().add_notifier(tx);
            self.link.committer.schedule();
            CommitFuture::waiting(rx)
        } else {
            CommitFuture::ready()
        }
    }

    fn maybe_update_offset(&self) -> usize {
        if self
            .acked
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.link
                .committer
                .batch()
                .update_offset(&self.tp, self.offset)
        } else {
            self.link.committer.batch().len()
        }
    }
}

impl fmt::Debug for CommittableOffset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.tp, self.offset)
    }
}

/// Completion signal for [`CommittableOffset::commit`].
pub struct CommitFuture {
    state: CommitFutureState,
}

enum CommitFutureState {
    Ready,
    Waiting(oneshot::Receiver<Result<(), ReceiverError>>),
    Done,
}

impl CommitFuture {
    fn ready() -> Self {
        Self {
            state: CommitFutureState::Ready,
        }
    }

    fn waiting(rx: oneshot::Receiver<Result<(), ReceiverError>>) -> Self {
        Self {
            state: CommitFutureState::Waiting(rx),
        }
    }
}

impl Future for CommitFuture {
    type Output = Result<(), ReceiverError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match &mut this.state {
            CommitFutureState::Ready => {
                this.state = CommitFutureState::Done;
                Poll::Ready(Ok(()))
            }
            CommitFutureState::Waiting(rx) => match Pin::new(rx).poll(cx) {
                Poll::Ready(Ok(result)) => {
                    this.state = CommitFutureState::Done;
                    Poll::Ready(result)
                }
                // The event loop dropped the notifier without completing it.
                Poll::Ready(Err(_)) => {
                    this.state = CommitFutureState::Done;
                    Poll::Ready(Err(ReceiverError::Closed))
                }
                Poll::Pending => Poll::Pending,
            },
            CommitFutureState::Done => panic!("CommitFuture polled after completion"),
        }
    }
}
