use std::collections::HashMap;
use std::sync::Mutex;

use tokio::sync::oneshot;

use crate::error::ReceiverError;
use crate::types::{OffsetAndMetadata, TopicPartition};

/// One-shot sender fulfilled when the flush carrying its offsets completes.
pub(crate) type CommitNotifier = oneshot::Sender<Result<(), ReceiverError>>;

/// Snapshot handed to a single commit: the offsets to send (already encoded
/// as next-offset-to-consume) and the notifiers waiting on that commit.
pub(crate) struct CommitArgs {
    pub(crate) offsets: HashMap<TopicPartition, OffsetAndMetadata>,
    pub(crate) notifiers: Vec<CommitNotifier>,
}

/// Accumulates the highest acknowledged offset per partition until the next
/// flush. Shared between application threads (acknowledge, commit
/// registration) and the event loop (snapshot, restore); every operation is
/// serialized by the internal mutex.
pub(crate) struct CommittableBatch {
    inner: Mutex<BatchInner>,
}

struct BatchInner {
    offsets: HashMap<TopicPartition, i64>,
    notifiers: Vec<CommitNotifier>,
}

impl CommittableBatch {
    pub(crate) fn new() -> Self {
        Self {
            inner: Mutex::new(BatchInner {
                offsets: HashMap::new(),
                notifiers: Vec::new(),
            }),
        }
    }

    /// Record the highest consumed offset for a partition. Offsets never move
    /// backwards between flushes. Returns the number of partitions pending.
    pub(crate) fn update_offset(&self, tp: &TopicPartition, offset: i64) -> usize {
        let mut inner = self.inner.lock().unwrap();
        inner
            .offsets
            .entry(tp.clone())
            .and_modify(|current| {
                if offset > *current {
                    *current = offset;
                }
            })
            .or_insert(offset);
        inner.offsets.len()
    }

    /// Queue a notifier to be fulfilled when the next flush completes.
    pub(crate) fn add_notifier(&self, notifier: CommitNotifier) {
        self.inner.lock().unwrap().notifiers.push(notifier);
    }

    pub(crate) fn len(&self) -> usize {
        self.inner.lock().unwrap().offsets.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Atomically drain the batch into commit arguments, encoding each stored
    /// offset as the next offset to consume.
    pub(crate) fn snapshot(&self) -> CommitArgs {
        let mut inner = self.inner.lock().unwrap();
        let offsets = inner
            .offsets
            .drain()
            .map(|(tp, offset)| (tp, OffsetAndMetadata::new(offset + 1)))
            .collect();
        let notifiers = std::mem::take(&mut inner.notifiers);
        CommitArgs { offsets, notifiers }
    }

    /// Put back offsets from a failed commit, re-encoded as highest consumed.
    /// Offsets acknowledged since the snapshot win; notifiers are not
    /// restored, callers re-register on retry.
    pub(crate) fn restore(&self, offsets: &HashMap<TopicPartition, OffsetAndMetadata>) {
        let mut inner = self.inner.lock().unwrap();
        for (tp, om) in offsets {
            inner
                .offsets
                .entry(tp.clone())
                .or_insert(om.offset() - 1);
        }
    }
}
