// Metric name constants for the receiver.

pub const RECORDS_POLLED_COUNTER: &str = "kafka_receiver_records_polled_total";
pub const COMMITS_COUNTER: &str = "kafka_receiver_commits_total";
pub const COMMIT_FAILURES_COUNTER: &str = "kafka_receiver_commit_failures_total";
pub const HEARTBEATS_COUNTER: &str = "kafka_receiver_heartbeats_total";
pub const REQUESTS_PENDING_GAUGE: &str = "kafka_receiver_requests_pending";
pub const COMMITS_IN_PROGRESS_GAUGE: &str = "kafka_receiver_commits_in_progress";
pub const POLL_BATCH_SIZE_HISTOGRAM: &str = "kafka_receiver_poll_batch_size";
