use std::time::Duration;

use rdkafka::error::{KafkaError, RDKafkaErrorCode};

/// Terminal and commit-level errors surfaced by the receiver.
#[derive(Debug, thiserror::Error)]
pub enum ReceiverError {
    #[error("kafka error: {0}")]
    Kafka(#[from] KafkaError),

    #[error("commit failed after {attempts} attempts: {source}")]
    CommitRetriesExhausted { attempts: u32, source: KafkaError },

    #[error("rebalance listener failed: {0}")]
    Listener(anyhow::Error),

    #[error("failed to start receiver: {0}")]
    Startup(String),

    #[error("receiver event queue overflowed")]
    QueueOverflow,

    #[error("receiver is closed")]
    Closed,

    #[error("receiver did not close within {0:?}")]
    CloseTimeout(Duration),
}

/// Errors from the typed payload helper.
#[derive(Debug, thiserror::Error)]
pub enum PayloadError {
    #[error("record has no payload")]
    Empty,

    #[error("malformed payload: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Whether a failed commit may be retried against the same coordinator.
///
/// Mirrors the broker error classes the Java client wraps as retriable commit
/// failures: a rebalance racing the commit, or transport/timeout conditions
/// that leave the group membership intact.
pub(crate) fn is_retriable_commit_error(error: &KafkaError) -> bool {
    let code = match error {
        KafkaError::ConsumerCommit(code) => *code,
        _ => return false,
    };
    matches!(
        code,
        RDKafkaErrorCode::RebalanceInProgress
            | RDKafkaErrorCode::NetworkException
            | RDKafkaErrorCode::OperationTimedOut
            | RDKafkaErrorCode::RequestTimedOut
            | RDKafkaErrorCode::BrokerTransportFailure
            | RDKafkaErrorCode::AllBrokersDown
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rebalance_in_progress_is_retriable() {
        let err = KafkaError::ConsumerCommit(RDKafkaErrorCode::RebalanceInProgress);
        assert!(is_retriable_commit_error(&err));
    }

    #[test]
    fn invalid_partitions_is_not_retriable() {
        let err = KafkaError::ConsumerCommit(RDKafkaErrorCode::InvalidPartitions);
        assert!(!is_retriable_commit_error(&err));
    }

    #[test]
    fn non_commit_errors_are_not_retriable() {
        let err = KafkaError::MessageConsumption(RDKafkaErrorCode::OperationTimedOut);
        assert!(!is_retriable_commit_error(&err));
    }
}
