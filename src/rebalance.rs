use std::sync::Arc;

use tracing::debug;

use crate::committer::Committer;
use crate::config::RebalanceListener;
use crate::consumer::CommitTarget;
use crate::error::ReceiverError;
use crate::event_loop::FailureSink;
use crate::partition::{SeekOps, SeekablePartition};
use crate::types::TopicPartition;

/// Handles the consumer's partition-assigned and partition-revoked callbacks.
///
/// Both run on the event-loop thread as synchronous extensions of a poll, so
/// the consumer is safe to use: listeners may seek, and the revoke path
/// commits pending offsets before the group rebalance completes.
pub(crate) struct RebalanceBridge {
    committer: Arc<Committer>,
    assign_listeners: Vec<RebalanceListener>,
    revoke_listeners: Vec<RebalanceListener>,
    sink: FailureSink,
}

impl RebalanceBridge {
    pub(crate) fn new(
        committer: Arc<Committer>,
        assign_listeners: Vec<RebalanceListener>,
        revoke_listeners: Vec<RebalanceListener>,
        sink: FailureSink,
    ) -> Self {
        Self {
            committer,
            assign_listeners,
            revoke_listeners,
            sink,
        }
    }

    pub(crate) fn on_assigned(&self, seek: &dyn SeekOps, partitions: Vec<TopicPartition>) {
        if partitions.is_empty() {
            return;
        }
        debug!("partitions assigned: {partitions:?}");
        let seekable: Vec<SeekablePartition<'_>> = partitions
            .into_iter()
            .map(|tp| SeekablePartition::new(seek, tp))
            .collect();
        for listener in &self.assign_listeners {
            if let Err(e) = listener(&seekable) {
                self.sink.fail(ReceiverError::Listener(e));
                return;
            }
        }
    }

    pub(crate) fn on_revoked(
        &self,
        commit: &dyn CommitTarget,
        seek: &dyn SeekOps,
        partitions: Vec<TopicPartition>,
    ) {
        if partitions.is_empty() {
            return;
        }
        debug!("partitions revoked: {partitions:?}");
        self.committer.run_forced_sync(commit);
        let seekable: Vec<SeekablePartition<'_>> = partitions
            .into_iter()
            .map(|tp| SeekablePartition::new(seek, tp))
            .collect();
        for listener in &self.revoke_listeners {
            if let Err(e) = listener(&seekable) {
                self.sink.fail(ReceiverError::Listener(e));
                return;
            }
        }
    }
}
