use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::time::Instant;

use tracing::{error, info, warn};

use crate::config::{AckTrackerConfig, ExhaustedRetryPolicy, GapSettlePolicy};
use crate::error::AckTrackerError;
use crate::metrics_consts::{
    LATE_COMPLETIONS, RECORDS_ACKED, RECORDS_EMITTED, RECORDS_FAILED, RETRIES_EXHAUSTED,
    UNCOMMITTED_OFFSETS,
};
use crate::retry_queue::{ReadyForRetry, RetryQueue};
use crate::tracker::PartitionOffsetTracker;
use crate::types::{CommitBatch, Partition, RecordId};

/// What happened to a record after a failure signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    /// Late or stale signal, or the partition is no longer owned.
    Ignored,
    /// Queued for another attempt.
    Scheduled,
    /// Out of retries and turned into a void.
    Voided,
}

/// Owns one offset tracker per assigned partition plus the retry queue,
/// and routes record lifecycle events to them.
///
/// Only the driving loop holds the engine, so trackers never outlive a
/// revocation.
pub struct AckTrackingEngine {
    trackers: HashMap<Partition, PartitionOffsetTracker>,
    retry_queue: RetryQueue,
    exhausted_retry_policy: ExhaustedRetryPolicy,
    gap_settle: GapSettlePolicy,
    /// Bumped on every fresh assignment.
    generation: u64,
}

impl AckTrackingEngine {
    pub fn new(config: &AckTrackerConfig) -> Self {
        Self {
            trackers: HashMap::new(),
            retry_queue: RetryQueue::new(config.max_retries, config.retry_backoff),
            exhausted_retry_policy: config.exhausted_retry_policy,
            gap_settle: config.gap_settle,
            generation: 0,
        }
    }

    /// Start tracking `partition` from `committed_offset`.
    ///
    /// Returns `false` and keeps the existing tracker if the partition is
    /// already owned.
    pub fn assign_partition(&mut self, partition: Partition, committed_offset: i64) -> bool {
        match self.trackers.entry(partition) {
            Entry::Occupied(_) => false,
            Entry::Vacant(entry) => {
                self.generation += 1;
                let tracker = PartitionOffsetTracker::new(
                    entry.key().clone(),
                    committed_offset,
                    self.gap_settle,
                )
                .with_generation(self.generation);
                entry.insert(tracker);
                true
            }
        }
    }

    /// Discard all state for `partition`, including its pending retries.
    pub fn revoke_partition(&mut self, partition: &Partition) -> bool {
        let Some(tracker) = self.trackers.remove(partition) else {
            return false;
        };
        let dropped_retries = self.retry_queue.remove_partition(partition);
        info!(
            partition = %partition,
            committed_offset = tracker.committed_offset(),
            abandoned_in_flight = tracker.in_flight_count(),
            dropped_retries = dropped_retries,
            "Discarded tracker for revoked partition"
        );
        true
    }

    pub fn is_owned(&self, partition: &Partition) -> bool {
        self.trackers.contains_key(partition)
    }

    pub fn owned_partitions(&self) -> Vec<Partition> {
        let mut partitions: Vec<Partition> = self.trackers.keys().cloned().collect();
        partitions.sort();
        partitions
    }

    pub fn committed_offset(&self, partition: &Partition) -> Option<i64> {
        self.trackers.get(partition).map(|t| t.committed_offset())
    }

    pub fn tracker(&self, partition: &Partition) -> Option<&PartitionOffsetTracker> {
        self.trackers.get(partition)
    }

    pub fn retry_queue(&self) -> &RetryQueue {
        &self.retry_queue
    }

    /// Register a freshly polled record and return the identity to hand
    /// downstream.
    ///
    /// # Errors
    ///
    /// `PartitionNotOwned` if the partition is not assigned, `DuplicateEmit`
    /// if the offset is already known to its tracker.
    pub fn emit(
        &mut self,
        partition: &Partition,
        offset: i64,
        now: Instant,
    ) -> Result<RecordId, AckTrackerError> {
        let tracker = self
            .trackers
            .get_mut(partition)
            .ok_or_else(|| AckTrackerError::PartitionNotOwned(partition.clone()))?;
        tracker.record_emitted(offset, 0)?;

        metrics::counter!(RECORDS_EMITTED, "attempt" => "first").increment(1);
        Ok(RecordId::new(partition.clone(), offset, now).with_generation(tracker.generation()))
    }

    /// Register another attempt of a record drained from the retry queue.
    pub fn re_emit(&mut self, record_id: &RecordId) -> Result<RecordId, AckTrackerError> {
        let tracker = self
            .trackers
            .get_mut(record_id.partition())
            .ok_or_else(|| AckTrackerError::PartitionNotOwned(record_id.partition().clone()))?;

        let next = record_id.next_attempt();
        tracker.record_emitted(next.offset(), next.retry())?;

        metrics::counter!(RECORDS_EMITTED, "attempt" => "retry").increment(1);
        Ok(next)
    }

    /// Resolve a record as successfully processed.
    ///
    /// Returns `false` for late or duplicate signals, which change nothing.
    pub fn ack(&mut self, record_id: &RecordId) -> bool {
        let Some(tracker) = self.trackers.get_mut(record_id.partition()) else {
            Self::record_unowned_completion("ack", record_id);
            return false;
        };
        if tracker.generation() != record_id.generation() {
            Self::record_stale_assignment_completion("ack", record_id);
            return false;
        }
        if !tracker.ack(record_id.offset()) {
            return false;
        }

        self.retry_queue
            .remove(record_id.partition(), record_id.offset());
        metrics::counter!(RECORDS_ACKED).increment(1);
        true
    }

    /// Resolve the in-flight attempt of a record as failed and decide whether
    /// it gets another attempt.
    ///
    /// # Errors
    ///
    /// Returns `RetryExhausted` only under [`ExhaustedRetryPolicy::FailFast`].
    pub fn fail(
        &mut self,
        record_id: &RecordId,
        now: Instant,
    ) -> Result<FailOutcome, AckTrackerError> {
        let Some(tracker) = self.trackers.get_mut(record_id.partition()) else {
            Self::record_unowned_completion("fail", record_id);
            return Ok(FailOutcome::Ignored);
        };
        if tracker.generation() != record_id.generation() {
            Self::record_stale_assignment_completion("fail", record_id);
            return Ok(FailOutcome::Ignored);
        }
        if !tracker.fail(record_id.offset(), record_id.retry()) {
            return Ok(FailOutcome::Ignored);
        }
        metrics::counter!(RECORDS_FAILED).increment(1);

        let exhausted = match self.retry_queue.enqueue(record_id.clone(), now) {
            Ok(()) => return Ok(FailOutcome::Scheduled),
            Err(exhausted) => exhausted,
        };

        let policy = self.exhausted_retry_policy.to_string();
        metrics::counter!(RETRIES_EXHAUSTED, "policy" => policy).increment(1);

        match self.exhausted_retry_policy {
            ExhaustedRetryPolicy::DropAsVoid => {
                warn!(
                    record = %record_id,
                    failures = exhausted.failures,
                    max_retries = exhausted.max_retries,
                    "Record exhausted its retries, dropping it as void"
                );
                tracker.mark_exhausted(record_id.offset());
                Ok(FailOutcome::Voided)
            }
            ExhaustedRetryPolicy::FailFast => {
                error!(
                    record = %record_id,
                    failures = exhausted.failures,
                    max_retries = exhausted.max_retries,
                    "Record exhausted its retries under fail-fast policy"
                );
                Err(exhausted.into())
            }
        }
    }

    /// Failed records whose backoff has elapsed, earliest first.
    pub fn drain_ready_for_retry(&mut self, now: Instant) -> ReadyForRetry<'_> {
        self.retry_queue.drain_ready_for_retry(now)
    }

    /// Snapshot the committable offset of every owned partition that moved
    /// past its committed offset.
    ///
    /// Counts as one commit cycle for gap settling on every owned partition.
    pub fn collect_commit_candidates(&mut self, now: Instant) -> CommitBatch {
        let batch = self
            .trackers
            .values_mut()
            .filter_map(|tracker| Self::candidate(tracker, now))
            .collect();
        metrics::gauge!(UNCOMMITTED_OFFSETS).set(self.uncommitted_count() as f64);
        batch
    }

    /// Same as [`collect_commit_candidates`](Self::collect_commit_candidates),
    /// restricted to `partitions`. Unowned partitions are skipped.
    pub fn collect_commit_candidates_for(
        &mut self,
        partitions: &[Partition],
        now: Instant,
    ) -> CommitBatch {
        let mut batch = CommitBatch::new();
        for partition in partitions {
            if let Some(tracker) = self.trackers.get_mut(partition) {
                if let Some((partition, offset)) = Self::candidate(tracker, now) {
                    batch.insert(partition, offset);
                }
            }
        }
        batch
    }

    /// Apply a batch the log service confirmed. Partitions revoked in the
    /// meantime are skipped; re-applying a batch changes nothing.
    pub fn confirm_committed(&mut self, batch: &CommitBatch) {
        for (partition, offset) in batch {
            if let Some(tracker) = self.trackers.get_mut(partition) {
                tracker.confirm_committed(*offset);
            }
        }
        metrics::gauge!(UNCOMMITTED_OFFSETS).set(self.uncommitted_count() as f64);
    }

    /// Emitted offsets across owned partitions not yet covered by a commit.
    pub fn uncommitted_count(&self) -> usize {
        self.trackers
            .values()
            .map(PartitionOffsetTracker::uncommitted_count)
            .sum()
    }

    fn candidate(tracker: &mut PartitionOffsetTracker, now: Instant) -> Option<(Partition, i64)> {
        let candidate = tracker.next_committable_offset(now);
        (candidate > tracker.committed_offset()).then(|| (tracker.partition().clone(), candidate))
    }

    fn record_unowned_completion(kind: &'static str, record_id: &RecordId) {
        warn!(
            record = %record_id,
            kind = kind,
            "Discarding completion for partition not owned by this consumer"
        );
        metrics::counter!(LATE_COMPLETIONS, "kind" => kind, "reason" => "partition_not_owned")
            .increment(1);
    }

    fn record_stale_assignment_completion(kind: &'static str, record_id: &RecordId) {
        warn!(
            record = %record_id,
            kind = kind,
            generation = record_id.generation(),
            "Discarding completion emitted under an earlier assignment of the partition"
        );
        metrics::counter!(LATE_COMPLETIONS, "kind" => kind, "reason" => "stale_assignment")
            .increment(1);
    }
}
