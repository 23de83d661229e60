use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::mpsc::SyncSender;
use std::sync::Arc;

use rdkafka::error::KafkaError;
use tracing::{debug, error, warn};

use crate::batch::{CommitArgs, CommittableBatch};
use crate::config::AckMode;
use crate::consumer::CommitTarget;
use crate::error::{is_retriable_commit_error, ReceiverError};
use crate::event_loop::{Event, FailureSink};
use crate::metrics_consts::{COMMITS_COUNTER, COMMIT_FAILURES_COUNTER, COMMITS_IN_PROGRESS_GAUGE};

/// Commit machinery shared by the event loop (poll-head and periodic flushes,
/// final flush on close), the rebalance bridge (forced flush on revoke), and
/// every emitted offset handle (staging and scheduling).
pub(crate) struct Committer {
    batch: CommittableBatch,
    pending: AtomicBool,
    in_progress: AtomicU32,
    consecutive_failures: AtomicU32,
    ack_mode: AckMode,
    max_attempts: u32,
    event_tx: SyncSender<Event>,
    sink: FailureSink,
}

impl Committer {
    pub(crate) fn new(
        ack_mode: AckMode,
        max_attempts: u32,
        event_tx: SyncSender<Event>,
        sink: FailureSink,
    ) -> Self {
        Self {
            batch: CommittableBatch::new(),
            pending: AtomicBool::new(false),
            in_progress: AtomicU32::new(0),
            consecutive_failures: AtomicU32::new(0),
            ack_mode,
            max_attempts,
            event_tx,
            sink,
        }
    }

    pub(crate) fn batch(&self) -> &CommittableBatch {
        &self.batch
    }

    pub(crate) fn in_progress(&self) -> u32 {
        self.in_progress.load(Ordering::SeqCst)
    }

    /// Mark a commit as required and enqueue a commit event, unless one is
    /// already queued. If the queue rejects the event the pending flag stays
    /// set and the next poll picks the commit up at its head.
    pub(crate) fn schedule(&self) {
        if self
            .pending
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
            && self.event_tx.try_send(Event::Commit).is_err()
        {
            warn!("commit event could not be enqueued; next poll will flush");
        }
    }

    /// Flush if a commit is marked pending, or unconditionally when forced
    /// (and the mode is not manual-commit). Used at the head of every poll
    /// and during close.
    pub(crate) fn run_if_required(self: &Arc<Self>, client: &dyn CommitTarget, force: bool) {
        if self.pending.swap(false, Ordering::AcqRel)
            || (force && self.ack_mode != AckMode::ManualCommit)
        {
            self.run(client);
        }
    }

    /// Snapshot the batch and issue an async commit. An empty snapshot still
    /// completes any queued notifiers so awaited commits resolve.
    pub(crate) fn run(self: &Arc<Self>, client: &dyn CommitTarget) {
        self.pending.store(false, Ordering::Release);
        let args = self.batch.snapshot();
        if args.offsets.is_empty() {
            self.handle_success(args);
            return;
        }

        debug!(partitions = args.offsets.len(), "committing offsets");
        self.in_progress.fetch_add(1, Ordering::SeqCst);
        metrics::gauge!(COMMITS_IN_PROGRESS_GAUGE).set(self.in_progress() as f64);

        let this = Arc::clone(self);
        let offsets = args.offsets.clone();
        client.commit_async(
            offsets,
            Box::new(move |result| {
                this.in_progress.fetch_sub(1, Ordering::SeqCst);
                metrics::gauge!(COMMITS_IN_PROGRESS_GAUGE).set(this.in_progress() as f64);
                match result {
                    Ok(()) => this.handle_success(args),
                    Err(error) => this.handle_failure(args, error),
                }
            }),
        );
    }

    /// Synchronous flush used while a revoke callback holds the consumer:
    /// pending offsets must be committed before the group rebalance
    /// completes. Honors a pending manual commit, otherwise skips
    /// manual-commit mode.
    pub(crate) fn run_forced_sync(&self, client: &dyn CommitTarget) {
        if !self.pending.swap(false, Ordering::AcqRel) && self.ack_mode == AckMode::ManualCommit {
            return;
        }
        let args = self.batch.snapshot();
        if args.offsets.is_empty() {
            self.handle_success(args);
            return;
        }
        debug!(partitions = args.offsets.len(), "committing offsets before revoke");
        match client.commit_sync(&args.offsets) {
            Ok(()) => self.handle_success(args),
            Err(error) => self.handle_failure(args, error),
        }
    }

    fn handle_success(&self, args: CommitArgs) {
        if !args.offsets.is_empty() {
            self.consecutive_failures.store(0, Ordering::Release);
            metrics::counter!(COMMITS_COUNTER).increment(1);
        }
        for notifier in args.notifiers {
            let _ = notifier.send(Ok(()));
        }
    }

    fn handle_failure(&self, args: CommitArgs, error: KafkaError) {
        warn!("commit failed: {error}");
        metrics::counter!(COMMIT_FAILURES_COUNTER).increment(1);

        match self.ack_mode {
            AckMode::ManualCommit => {
                self.batch.restore(&args.offsets);
                for notifier in args.notifiers {
                    let _ = notifier.send(Err(ReceiverError::Kafka(error.clone())));
                }
            }
            // At-most-once commits ahead of delivery; a failed commit means
            // records can no longer be handed out safely.
            AckMode::AtMostOnce => self.sink.fail(ReceiverError::Kafka(error)),
            AckMode::AutoAck | AckMode::ManualAck => {
                let failures = self.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;
                let may_retry = is_retriable_commit_error(&error)
                    && failures < self.max_attempts
                    && self.sink.is_active();
                if may_retry {
                    self.batch.restore(&args.offsets);
                    for notifier in args.notifiers {
                        self.batch.add_notifier(notifier);
                    }
                    error!(
                        "commit failed with {error}, retries remaining {}",
                        self.max_attempts - failures
                    );
                } else if is_retriable_commit_error(&error) {
                    self.sink.fail(ReceiverError::CommitRetriesExhausted {
                        attempts: failures,
                        source: error,
                    });
                } else {
                    self.sink.fail(ReceiverError::Kafka(error));
                }
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn for_tests(ack_mode: AckMode, event_tx: SyncSender<Event>) -> Self {
        Self::new(ack_mode, 100, event_tx.clone(), FailureSink::for_tests(event_tx))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::mpsc;
    use std::sync::Mutex;

    use rdkafka::error::RDKafkaErrorCode;
    use tokio::sync::oneshot;

    use super::*;
    use crate::consumer::CommitCallback;
    use crate::types::{OffsetAndMetadata, TopicPartition};

    /// Commit target that records offsets and fails on demand.
    #[derive(Default)]
    struct RecordingTarget {
        committed: Mutex<HashMap<TopicPartition, i64>>,
        failures: Mutex<Vec<KafkaError>>,
        sync_commits: Mutex<usize>,
    }

    impl RecordingTarget {
        fn fail_next(&self, error: KafkaError) {
            self.failures.lock().unwrap().push(error);
        }

        fn apply(&self, offsets: &HashMap<TopicPartition, OffsetAndMetadata>) {
            let mut committed = self.committed.lock().unwrap();
            for (tp, om) in offsets {
                committed.insert(tp.clone(), om.offset());
            }
        }
    }

    impl CommitTarget for RecordingTarget {
        fn commit_async(
            &self,
            offsets: HashMap<TopicPartition, OffsetAndMetadata>,
            callback: CommitCallback,
        ) {
            if let Some(error) = self.failures.lock().unwrap().pop() {
                callback(Err(error));
                return;
            }
            self.apply(&offsets);
            callback(Ok(()));
        }

        fn commit_sync(
            &self,
            offsets: &HashMap<TopicPartition, OffsetAndMetadata>,
        ) -> Result<(), KafkaError> {
            *self.sync_commits.lock().unwrap() += 1;
            if let Some(error) = self.failures.lock().unwrap().pop() {
                return Err(error);
            }
            self.apply(offsets);
            Ok(())
        }
    }

    fn committer(ack_mode: AckMode, max_attempts: u32) -> Arc<Committer> {
        let (event_tx, _event_rx) = mpsc::sync_channel(8);
        let sink = FailureSink::for_tests(event_tx.clone());
        Arc::new(Committer::new(ack_mode, max_attempts, event_tx, sink))
    }

    fn tp(partition: i32) -> TopicPartition {
        TopicPartition::new("test-topic", partition)
    }

    #[test]
    fn run_commits_staged_offsets_as_next_offset() {
        let committer = committer(AckMode::ManualAck, 100);
        let target = RecordingTarget::default();

        committer.batch().update_offset(&tp(0), 9);
        committer.run(&target);

        assert_eq!(target.committed.lock().unwrap()[&tp(0)], 10);
        assert!(committer.batch().is_empty());
        assert_eq!(committer.in_progress(), 0);
    }

    #[test]
    fn empty_snapshot_still_completes_notifiers() {
        let committer = committer(AckMode::ManualCommit, 100);
        let target = RecordingTarget::default();

        let (notify_tx, mut notify_rx) = oneshot::channel();
        committer.batch().add_notifier(notify_tx);
        committer.run(&target);

        assert!(matches!(notify_rx.try_recv(), Ok(Ok(()))));
    }

    #[test]
    fn manual_commit_failure_restores_offsets_and_fails_notifiers() {
        let committer = committer(AckMode::ManualCommit, 100);
        let target = RecordingTarget::default();
        target.fail_next(KafkaError::ConsumerCommit(
            RDKafkaErrorCode::InvalidPartitions,
        ));

        committer.batch().update_offset(&tp(0), 4);
        let (notify_tx, mut notify_rx) = oneshot::channel();
        committer.batch().add_notifier(notify_tx);
        committer.run(&target);

        assert!(matches!(notify_rx.try_recv(), Ok(Err(_))));
        // the offset survived the failure for a later retry
        assert_eq!(committer.batch().len(), 1);
    }

    #[test]
    fn retriable_auto_failure_restores_and_counts() {
        let committer = committer(AckMode::ManualAck, 100);
        let target = RecordingTarget::default();
        target.fail_next(KafkaError::ConsumerCommit(
            RDKafkaErrorCode::RebalanceInProgress,
        ));

        committer.batch().update_offset(&tp(0), 4);
        committer.run(&target);

        assert_eq!(committer.batch().len(), 1);
        assert_eq!(committer.consecutive_failures.load(Ordering::Acquire), 1);

        // a later flush succeeds and resets the failure streak
        committer.run(&target);
        assert_eq!(target.committed.lock().unwrap()[&tp(0)], 5);
        assert_eq!(committer.consecutive_failures.load(Ordering::Acquire), 0);
    }

    #[test]
    fn run_if_required_honors_pending_and_force() {
        let committer = committer(AckMode::ManualAck, 100);
        let target = RecordingTarget::default();
        committer.batch().update_offset(&tp(0), 1);

        // no pending flag, no force: nothing happens
        committer.run_if_required(&target, false);
        assert_eq!(committer.batch().len(), 1);

        committer.run_if_required(&target, true);
        assert_eq!(target.committed.lock().unwrap()[&tp(0)], 2);
    }

    #[test]
    fn forced_sync_skips_manual_commit_without_pending_flag() {
        let committer = committer(AckMode::ManualCommit, 100);
        let target = RecordingTarget::default();
        committer.batch().update_offset(&tp(0), 1);

        committer.run_forced_sync(&target);
        assert_eq!(*target.sync_commits.lock().unwrap(), 0);
        assert_eq!(committer.batch().len(), 1);
    }

    #[test]
    fn forced_sync_commits_for_auto_modes() {
        let committer = committer(AckMode::ManualAck, 100);
        let target = RecordingTarget::default();
        committer.batch().update_offset(&tp(2), 7);

        committer.run_forced_sync(&target);
        assert_eq!(*target.sync_commits.lock().unwrap(), 1);
        assert_eq!(target.committed.lock().unwrap()[&tp(2)], 8);
    }
}
