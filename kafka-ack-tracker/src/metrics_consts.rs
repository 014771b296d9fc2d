// ==== Record lifecycle metrics ====
/// Counter for records emitted downstream (label: attempt = first/retry)
pub const RECORDS_EMITTED: &str = "ack_tracker_records_emitted_total";

/// Counter for records acked by downstream
pub const RECORDS_ACKED: &str = "ack_tracker_records_acked_total";

/// Counter for records failed by downstream
pub const RECORDS_FAILED: &str = "ack_tracker_records_failed_total";

/// Counter for ack/fail signals discarded as late or duplicate (label: kind, reason)
pub const LATE_COMPLETIONS: &str = "ack_tracker_late_completions_total";

/// Counter for emits rejected because the offset is already tracked
pub const DUPLICATE_EMITS: &str = "ack_tracker_duplicate_emits_total";

/// Counter for polled records dropped because their partition is not owned
pub const RECORDS_SKIPPED_UNOWNED: &str = "ack_tracker_records_skipped_unowned_total";

// ==== Retry metrics ====
/// Counter for failed records scheduled for another attempt
pub const RETRIES_SCHEDULED: &str = "ack_tracker_retries_scheduled_total";

/// Counter for records that ran out of retries (label: policy)
pub const RETRIES_EXHAUSTED: &str = "ack_tracker_retries_exhausted_total";

/// Gauge for entries currently waiting in the retry queue
pub const RETRY_QUEUE_SIZE: &str = "ack_tracker_retry_queue_size";

// ==== Commit frontier metrics ====
/// Counter for offset gaps observed at the commit frontier
pub const OFFSET_GAP_DETECTED: &str = "ack_tracker_offset_gap_detected_total";

/// Counter for gaps confirmed void and bridged
pub const OFFSET_GAP_BRIDGED: &str = "ack_tracker_offset_gap_bridged_total";

/// Histogram for the size of bridged gaps (offsets)
pub const OFFSET_GAP_SIZE: &str = "ack_tracker_offset_gap_size";

/// Counter for records that arrived inside an uncommitted void range
pub const VOIDS_REOPENED: &str = "ack_tracker_voids_reopened_total";

/// Gauge for the last committed offset per partition
pub const PARTITION_COMMITTED_OFFSET: &str = "ack_tracker_partition_committed_offset";

/// Gauge for emitted-but-uncommitted offsets across owned partitions
pub const UNCOMMITTED_OFFSETS: &str = "ack_tracker_uncommitted_offsets";

// ==== Commit metrics ====
/// Counter for commit attempts (label: status = success/failure, trigger = timer/revoke/shutdown)
pub const COMMITS: &str = "ack_tracker_commits_total";

/// Histogram for synchronous commit call duration
pub const COMMIT_DURATION_MS: &str = "ack_tracker_commit_duration_ms";

// ==== Rebalance metrics ====
/// Gauge for partitions currently owned
pub const OWNED_PARTITIONS: &str = "ack_tracker_owned_partitions";

/// Counter for partitions assigned
pub const PARTITIONS_ASSIGNED: &str = "ack_tracker_partitions_assigned_total";

/// Counter for partitions revoked
pub const PARTITIONS_REVOKED: &str = "ack_tracker_partitions_revoked_total";

/// Counter for assigned partitions left unread because their start offset could not be resolved
pub const ASSIGNMENT_LOOKUP_FAILURES: &str = "ack_tracker_assignment_lookup_failures_total";

// ==== Consumer loop metrics ====
/// Counter for times the loop paused fetching because too many offsets are uncommitted
pub const POLLS_PAUSED: &str = "ack_tracker_polls_paused_total";

/// Counter for errors returned by the log client poll (label: level)
pub const POLL_ERRORS: &str = "ack_tracker_poll_errors_total";
