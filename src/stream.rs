use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::Stream;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::watch;
use tracing::debug;

use crate::close::CloseCoordinator;
use crate::error::ReceiverError;
use crate::event_loop::{BatchItem, Demand, RecordBatch};
use crate::types::ReceiverRecord;

/// Back-pressured stream of records from the receiver.
///
/// Each awaited item adds one unit of downstream demand; the event loop only
/// polls the broker while demand is outstanding, so a slow consumer slows
/// fetching rather than buffering without bound. Records of one partition
/// arrive in broker offset order. The stream ends with an error item on a
/// fatal receiver failure, or cleanly once the receiver has closed.
///
/// Dropping the stream cancels the receiver; [`RecordStream::close`] does the
/// same but waits for the graceful shutdown to finish.
pub struct RecordStream {
    batches: UnboundedReceiver<BatchItem>,
    buffer: RecordBatch,
    demand: Arc<Demand>,
    close: Arc<CloseCoordinator>,
    closed_rx: watch::Receiver<bool>,
    close_wait: Duration,
    demand_signaled: bool,
    done: bool,
}

impl std::fmt::Debug for RecordStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordStream").finish_non_exhaustive()
    }
}

impl RecordStream {
    pub(crate) fn new(
        batches: UnboundedReceiver<BatchItem>,
        demand: Arc<Demand>,
        close: Arc<CloseCoordinator>,
        closed_rx: watch::Receiver<bool>,
        close_wait: Duration,
    ) -> Self {
        Self {
            batches,
            buffer: RecordBatch::new(),
            demand,
            close,
            closed_rx,
            close_wait,
            demand_signaled: false,
            done: false,
        }
    }

    /// Gracefully shut the receiver down: pending acked offsets are
    /// committed and the consumer is released, bounded by the close timeout.
    pub async fn close(mut self) -> Result<(), ReceiverError> {
        self.close.trigger();
        let wait = self.close_wait;
        match tokio::time::timeout(wait, self.closed_rx.wait_for(|closed| *closed)).await {
            Ok(Ok(_)) => Ok(()),
            // the coordinator is gone, which only happens after finalize
            Ok(Err(_)) => Ok(()),
            Err(_) => Err(ReceiverError::CloseTimeout(wait)),
        }
    }
}

impl Stream for RecordStream {
    type Item = Result<ReceiverRecord, ReceiverError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.done {
            return Poll::Ready(None);
        }
        loop {
            if !this.demand_signaled {
                this.demand_signaled = true;
                this.demand.request(1);
            }
            if let Some(record) = this.buffer.pop_front() {
                this.demand_signaled = false;
                return Poll::Ready(Some(Ok(record)));
            }
            match this.batches.poll_recv(cx) {
                Poll::Ready(Some(Ok(batch))) => {
                    this.buffer = batch;
                }
                Poll::Ready(Some(Err(error))) => {
                    this.done = true;
                    return Poll::Ready(Some(Err(error)));
                }
                Poll::Ready(None) => {
                    this.done = true;
                    return Poll::Ready(None);
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl Drop for RecordStream {
    fn drop(&mut self) {
        if !self.close.close_requested() {
            debug!("record stream dropped; cancelling receiver");
        }
        self.close.trigger();
    }
}
