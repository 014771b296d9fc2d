//! Partition Offset Tracker - per-partition bookkeeping of the commit frontier
//!
//! Each assigned partition gets one tracker. It records which offsets were
//! emitted downstream, which completed (acked), which failed and are waiting
//! for a retry, and which are voids: offsets confirmed to never carry a
//! record (compacted or skipped), which count as resolved for commit purposes.
//!
//! The committable offset is found by walking up from the committed offset
//! through acked and void offsets. A run of offsets that were never emitted
//! only becomes a void once it has stayed unfilled for the configured
//! [`GapSettlePolicy`], so a record that simply hasn't been polled yet is
//! never skipped over.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Instant;

use tracing::{debug, info, warn};

use crate::config::GapSettlePolicy;
use crate::error::{AckTrackerError, OffsetState};
use crate::metrics_consts::{
    DUPLICATE_EMITS, LATE_COMPLETIONS, OFFSET_GAP_BRIDGED, OFFSET_GAP_DETECTED, OFFSET_GAP_SIZE,
    PARTITION_COMMITTED_OFFSET, VOIDS_REOPENED,
};
use crate::types::Partition;

/// A never-emitted run of offsets waiting to be confirmed void.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PendingGap {
    start: i64,
    end: i64,
    first_seen_cycle: u64,
    first_seen_at: Instant,
}

pub struct PartitionOffsetTracker {
    partition: Partition,
    /// Next offset to resume from; everything below is durably committed.
    committed_offset: i64,
    /// Outstanding offsets and the retry attempt currently in flight.
    emitted: BTreeMap<i64, u32>,
    /// Offsets whose last attempt failed, awaiting re-emission.
    failed: BTreeSet<i64>,
    /// Acked offsets not yet folded into `committed_offset`.
    acked: BTreeSet<i64>,
    /// Void ranges, start -> end (exclusive).
    voids: BTreeMap<i64, i64>,
    highest_emitted: Option<i64>,
    pending_gap: Option<PendingGap>,
    commit_cycles: u64,
    gap_settle: GapSettlePolicy,
    /// Assignment this tracker belongs to, stamped on every emitted record.
    generation: u64,
}

impl PartitionOffsetTracker {
    pub fn new(partition: Partition, committed_offset: i64, gap_settle: GapSettlePolicy) -> Self {
        Self {
            partition,
            committed_offset,
            emitted: BTreeMap::new(),
            failed: BTreeSet::new(),
            acked: BTreeSet::new(),
            voids: BTreeMap::new(),
            highest_emitted: None,
            pending_gap: None,
            commit_cycles: 0,
            gap_settle,
            generation: 0,
        }
    }

    pub fn with_generation(mut self, generation: u64) -> Self {
        self.generation = generation;
        self
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn partition(&self) -> &Partition {
        &self.partition
    }

    pub fn committed_offset(&self) -> i64 {
        self.committed_offset
    }

    pub fn highest_emitted(&self) -> Option<i64> {
        self.highest_emitted
    }

    /// Offsets handed downstream and not yet resolved.
    pub fn in_flight_count(&self) -> usize {
        self.emitted.len()
    }

    /// Offsets emitted since the last commit that still hold state here.
    pub fn uncommitted_count(&self) -> usize {
        self.emitted.len() + self.failed.len() + self.acked.len()
    }

    pub fn state_of(&self, offset: i64) -> Option<OffsetState> {
        if offset < self.committed_offset {
            Some(OffsetState::Committed)
        } else if self.emitted.contains_key(&offset) {
            Some(OffsetState::Emitted)
        } else if self.failed.contains(&offset) {
            Some(OffsetState::Failed)
        } else if self.acked.contains(&offset) {
            Some(OffsetState::Acked)
        } else if self.void_end(offset).is_some() {
            Some(OffsetState::Void)
        } else {
            None
        }
    }

    pub fn is_void(&self, offset: i64) -> bool {
        self.void_end(offset).is_some()
    }

    /// Register `offset` as outstanding with the given retry attempt.
    ///
    /// A failed offset may be emitted again. A record showing up inside an
    /// uncommitted void is tracked again and splits the void around it.
    ///
    /// # Errors
    ///
    /// Returns `AckTrackerError::DuplicateEmit` if the offset is outstanding,
    /// acked or already committed.
    pub fn record_emitted(&mut self, offset: i64, retry: u32) -> Result<(), AckTrackerError> {
        match self.state_of(offset) {
            None => {}
            Some(OffsetState::Failed) => {
                self.failed.remove(&offset);
            }
            Some(OffsetState::Void) => {
                info!(
                    partition = %self.partition,
                    offset = offset,
                    "Record arrived inside a void range, tracking it again"
                );
                metrics::counter!(VOIDS_REOPENED).increment(1);
                self.remove_void(offset);
            }
            Some(state) => {
                metrics::counter!(DUPLICATE_EMITS).increment(1);
                return Err(AckTrackerError::DuplicateEmit {
                    partition: self.partition.clone(),
                    offset,
                    state,
                });
            }
        }

        self.emitted.insert(offset, retry);
        if self.highest_emitted.is_none_or(|highest| offset > highest) {
            self.highest_emitted = Some(offset);
        }

        if let Some(gap) = self.pending_gap {
            if offset >= gap.start && offset < gap.end {
                debug!(
                    partition = %self.partition,
                    offset = offset,
                    gap_start = gap.start,
                    gap_end = gap.end,
                    "Emitted offset fills pending gap, restarting gap settle"
                );
                self.pending_gap = None;
            }
        }

        Ok(())
    }

    /// Mark an offset as successfully processed.
    ///
    /// Returns `false`, leaving state untouched, when the offset was never
    /// emitted or is already resolved-success.
    pub fn ack(&mut self, offset: i64) -> bool {
        if self.emitted.remove(&offset).is_some() || self.failed.remove(&offset) {
            self.acked.insert(offset);
            return true;
        }

        self.record_late_completion("ack", offset);
        false
    }

    /// Mark the in-flight `retry` attempt of `offset` as failed.
    ///
    /// A failure for an attempt that is no longer the one in flight (a late
    /// signal from an earlier emission) is ignored and returns `false`.
    pub fn fail(&mut self, offset: i64, retry: u32) -> bool {
        match self.emitted.get(&offset) {
            Some(&in_flight) if in_flight == retry => {
                self.emitted.remove(&offset);
                self.failed.insert(offset);
                true
            }
            _ => {
                self.record_late_completion("fail", offset);
                false
            }
        }
    }

    /// Give up on an offset that will never be processed successfully.
    ///
    /// The offset becomes a void and no longer blocks the commit frontier.
    pub fn mark_exhausted(&mut self, offset: i64) -> bool {
        let was_unresolved = self.failed.remove(&offset) || self.emitted.remove(&offset).is_some();
        if was_unresolved {
            self.insert_void(offset, offset + 1);
            info!(
                partition = %self.partition,
                offset = offset,
                "Offset exhausted its retries, marked void"
            );
        }
        was_unresolved
    }

    /// Compute the offset that is safe to commit in this commit cycle.
    ///
    /// Walks from the committed offset through acked and void offsets and
    /// stops at the first outstanding or failed offset, or past the highest
    /// emitted offset. A never-emitted run of offsets in between is bridged
    /// only once it has settled; otherwise the walk stops at its start.
    /// Each call counts as one commit cycle for gap settling.
    pub fn next_committable_offset(&mut self, now: Instant) -> i64 {
        self.commit_cycles += 1;

        let mut cursor = self.committed_offset;
        let Some(highest) = self.highest_emitted else {
            return cursor;
        };

        while cursor <= highest {
            if self.acked.contains(&cursor) {
                cursor += 1;
                continue;
            }
            if let Some(end) = self.void_end(cursor) {
                cursor = end;
                continue;
            }
            if self.emitted.contains_key(&cursor) || self.failed.contains(&cursor) {
                break;
            }

            let Some(gap_end) = self.next_known_offset_after(cursor) else {
                break;
            };
            if !self.gap_settled(cursor, gap_end, now) {
                break;
            }

            info!(
                partition = %self.partition,
                gap_start = cursor,
                gap_end = gap_end,
                "Offset gap settled, bridging as void"
            );
            metrics::counter!(OFFSET_GAP_BRIDGED).increment(1);
            metrics::histogram!(OFFSET_GAP_SIZE).record((gap_end - cursor) as f64);
            self.insert_void(cursor, gap_end);
            cursor = gap_end;
        }

        cursor
    }

    /// Advance the committed offset after the log service confirmed a commit.
    ///
    /// Never moves backwards; re-applying an older or equal offset is a no-op.
    pub fn confirm_committed(&mut self, offset: i64) -> bool {
        if offset <= self.committed_offset {
            return false;
        }

        debug!(
            partition = %self.partition,
            previous_offset = self.committed_offset,
            new_offset = offset,
            "Advancing committed offset"
        );
        self.committed_offset = offset;

        self.acked = self.acked.split_off(&offset);
        self.voids.retain(|_, end| *end > offset);
        if self.pending_gap.is_some_and(|gap| gap.end <= offset) {
            self.pending_gap = None;
        }

        metrics::gauge!(
            PARTITION_COMMITTED_OFFSET,
            "topic" => self.partition.topic().to_string(),
            "partition" => self.partition.partition_number().to_string()
        )
        .set(offset as f64);

        true
    }

    fn gap_settled(&mut self, start: i64, end: i64, now: Instant) -> bool {
        let cycle = self.commit_cycles;
        let policy = self.gap_settle;

        let gap = match self.pending_gap.as_mut() {
            Some(gap) if gap.start == start => {
                gap.end = end;
                *gap
            }
            _ => {
                debug!(
                    partition = %self.partition,
                    gap_start = start,
                    gap_end = end,
                    "Offset gap detected at commit frontier"
                );
                metrics::counter!(OFFSET_GAP_DETECTED).increment(1);
                let gap = PendingGap {
                    start,
                    end,
                    first_seen_cycle: cycle,
                    first_seen_at: now,
                };
                self.pending_gap = Some(gap);
                gap
            }
        };

        let cycles_waited = cycle - gap.first_seen_cycle;
        let settled = cycles_waited >= u64::from(policy.commit_cycles)
            && now.saturating_duration_since(gap.first_seen_at) >= policy.min_age;
        if settled {
            self.pending_gap = None;
        }
        settled
    }

    /// Smallest emitted, failed, acked or void offset above `offset`.
    fn next_known_offset_after(&self, offset: i64) -> Option<i64> {
        let after = offset + 1..;
        [
            self.emitted.range(after.clone()).next().map(|(o, _)| *o),
            self.failed.range(after.clone()).next().copied(),
            self.acked.range(after.clone()).next().copied(),
            self.voids.range(after).next().map(|(start, _)| *start),
        ]
        .into_iter()
        .flatten()
        .min()
    }

    fn void_end(&self, offset: i64) -> Option<i64> {
        self.voids
            .range(..=offset)
            .next_back()
            .and_then(|(_, end)| (offset < *end).then_some(*end))
    }

    fn insert_void(&mut self, start: i64, end: i64) {
        self.voids.insert(start, end);
    }

    /// Cut `offset` out of the void range containing it.
    fn remove_void(&mut self, offset: i64) {
        let Some((&start, &end)) = self.voids.range(..=offset).next_back() else {
            return;
        };
        if offset >= end {
            return;
        }

        self.voids.remove(&start);
        if start < offset {
            self.voids.insert(start, offset);
        }
        if offset + 1 < end {
            self.voids.insert(offset + 1, end);
        }
    }

    fn record_late_completion(&self, kind: &'static str, offset: i64) {
        let reason = match self.state_of(offset) {
            Some(OffsetState::Acked) | Some(OffsetState::Committed) => "already_acked",
            Some(OffsetState::Void) => "void",
            Some(OffsetState::Failed) => "already_failed",
            Some(OffsetState::Emitted) => "stale_attempt",
            None => "never_emitted",
        };
        warn!(
            partition = %self.partition,
            offset = offset,
            kind = kind,
            reason = reason,
            "Discarding late completion signal"
        );
        metrics::counter!(LATE_COMPLETIONS, "kind" => kind, "reason" => reason).increment(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::time::Duration;

    fn tracker(committed: i64) -> PartitionOffsetTracker {
        PartitionOffsetTracker::new(
            Partition::new("test-topic".to_string(), 0),
            committed,
            GapSettlePolicy::default(),
        )
    }

    fn emit_and_ack(tracker: &mut PartitionOffsetTracker, offsets: impl IntoIterator<Item = i64>) {
        for offset in offsets {
            tracker.record_emitted(offset, 0).unwrap();
            assert!(tracker.ack(offset));
        }
    }

    #[test]
    fn test_no_emits_keeps_committed_offset() {
        let mut tracker = tracker(100);
        assert_eq!(tracker.next_committable_offset(Instant::now()), 100);
    }

    #[test]
    fn test_contiguous_acks_advance_frontier() {
        let mut tracker = tracker(100);
        emit_and_ack(&mut tracker, 100..105);

        assert_eq!(tracker.next_committable_offset(Instant::now()), 105);
        // Computing a candidate does not commit it
        assert_eq!(tracker.committed_offset(), 100);
    }

    #[test]
    fn test_out_of_order_acks_stop_at_first_unresolved() {
        let mut tracker = tracker(0);
        for offset in 0..5 {
            tracker.record_emitted(offset, 0).unwrap();
        }
        tracker.ack(0);
        tracker.ack(1);
        tracker.ack(3);
        tracker.ack(4);

        let now = Instant::now();
        assert_eq!(tracker.next_committable_offset(now), 2);

        tracker.ack(2);
        assert_eq!(tracker.next_committable_offset(now), 5);
    }

    #[test]
    fn test_failed_offset_blocks_frontier_until_acked() {
        let mut tracker = tracker(0);
        for offset in 0..3 {
            tracker.record_emitted(offset, 0).unwrap();
        }
        tracker.ack(0);
        assert!(tracker.fail(1, 0));
        tracker.ack(2);

        let now = Instant::now();
        assert_eq!(tracker.next_committable_offset(now), 1);

        tracker.record_emitted(1, 1).unwrap();
        assert!(tracker.ack(1));
        assert_eq!(tracker.next_committable_offset(now), 3);
    }

    #[test]
    fn test_duplicate_emit_is_rejected() {
        let mut tracker = tracker(10);
        tracker.record_emitted(10, 0).unwrap();

        let err = tracker.record_emitted(10, 0).unwrap_err();
        assert!(matches!(
            err,
            AckTrackerError::DuplicateEmit {
                offset: 10,
                state: OffsetState::Emitted,
                ..
            }
        ));

        let err = tracker.record_emitted(3, 0).unwrap_err();
        assert!(matches!(
            err,
            AckTrackerError::DuplicateEmit {
                state: OffsetState::Committed,
                ..
            }
        ));
    }

    #[test]
    fn test_second_ack_is_a_noop() {
        let mut tracker = tracker(0);
        tracker.record_emitted(0, 0).unwrap();

        assert!(tracker.ack(0));
        assert!(!tracker.ack(0));
        assert_eq!(tracker.state_of(0), Some(OffsetState::Acked));
        assert_eq!(tracker.uncommitted_count(), 1);
    }

    #[test]
    fn test_ack_of_never_emitted_offset_is_ignored() {
        let mut tracker = tracker(0);
        assert!(!tracker.ack(7));
        assert_eq!(tracker.state_of(7), None);
        assert_eq!(tracker.next_committable_offset(Instant::now()), 0);
    }

    #[test]
    fn test_stale_fail_from_previous_attempt_is_ignored() {
        let mut tracker = tracker(0);
        tracker.record_emitted(0, 0).unwrap();
        assert!(tracker.fail(0, 0));
        tracker.record_emitted(0, 1).unwrap();

        // A second failure signal for attempt 0 must not touch attempt 1
        assert!(!tracker.fail(0, 0));
        assert_eq!(tracker.state_of(0), Some(OffsetState::Emitted));
        assert!(tracker.fail(0, 1));
    }

    #[test]
    fn test_late_ack_resolves_failed_offset() {
        let mut tracker = tracker(0);
        tracker.record_emitted(0, 0).unwrap();
        tracker.fail(0, 0);

        assert!(tracker.ack(0));
        assert_eq!(tracker.next_committable_offset(Instant::now()), 1);
    }

    #[test]
    fn test_mark_exhausted_unblocks_frontier() {
        let mut tracker = tracker(0);
        for offset in 0..3 {
            tracker.record_emitted(offset, 0).unwrap();
        }
        tracker.ack(0);
        tracker.fail(1, 0);
        tracker.ack(2);

        assert!(tracker.mark_exhausted(1));
        assert!(tracker.is_void(1));
        assert_eq!(tracker.next_committable_offset(Instant::now()), 3);
        assert!(!tracker.mark_exhausted(1));
    }

    #[test]
    fn test_gap_is_bridged_after_one_settle_cycle() {
        let mut tracker = tracker(0);
        emit_and_ack(&mut tracker, 0..5);
        emit_and_ack(&mut tracker, 8..10);
        let now = Instant::now();

        // First cycle only reaches the edge of the gap
        assert_eq!(tracker.next_committable_offset(now), 5);
        tracker.confirm_committed(5);

        // Second cycle confirms 5..8 as void
        assert_eq!(tracker.next_committable_offset(now), 10);
        assert!(tracker.is_void(6));
    }

    #[test]
    fn test_late_record_inside_bridged_gap_is_tracked_again() {
        let mut tracker = tracker(0);
        emit_and_ack(&mut tracker, 0..5);
        emit_and_ack(&mut tracker, 8..10);
        let now = Instant::now();

        assert_eq!(tracker.next_committable_offset(now), 5);
        assert_eq!(tracker.next_committable_offset(now), 10);
        assert_eq!(tracker.state_of(6), Some(OffsetState::Void));

        // Not committed yet, so the record at 6 must still be delivered
        tracker.record_emitted(6, 0).unwrap();
        assert_eq!(tracker.state_of(6), Some(OffsetState::Emitted));
        assert!(tracker.is_void(5));
        assert!(tracker.is_void(7));
        assert_eq!(tracker.next_committable_offset(now), 6);

        assert!(tracker.ack(6));
        assert_eq!(tracker.next_committable_offset(now), 10);

        tracker.confirm_committed(10);
        let err = tracker.record_emitted(6, 0).unwrap_err();
        assert!(matches!(
            err,
            AckTrackerError::DuplicateEmit {
                state: OffsetState::Committed,
                ..
            }
        ));
    }

    #[test]
    fn test_exhausted_offset_redelivered_before_commit_is_tracked_again() {
        let mut tracker = tracker(0);
        tracker.record_emitted(0, 0).unwrap();
        tracker.fail(0, 0);
        tracker.mark_exhausted(0);
        assert!(tracker.is_void(0));

        tracker.record_emitted(0, 0).unwrap();
        assert!(!tracker.is_void(0));
        assert_eq!(tracker.next_committable_offset(Instant::now()), 0);
    }

    #[test]
    fn test_gap_filled_before_settling_is_not_voided() {
        let mut tracker = tracker(0);
        emit_and_ack(&mut tracker, 0..2);
        emit_and_ack(&mut tracker, 3..4);
        let now = Instant::now();

        assert_eq!(tracker.next_committable_offset(now), 2);

        // The record at 2 was only late
        tracker.record_emitted(2, 0).unwrap();
        assert_eq!(tracker.next_committable_offset(now), 2);
        assert!(!tracker.is_void(2));

        tracker.ack(2);
        assert_eq!(tracker.next_committable_offset(now), 4);
    }

    #[test]
    fn test_gap_above_highest_emitted_is_never_bridged() {
        let mut tracker = tracker(0);
        emit_and_ack(&mut tracker, 0..3);
        let now = Instant::now();

        for _ in 0..3 {
            assert_eq!(tracker.next_committable_offset(now), 3);
        }
    }

    #[test]
    fn test_gap_below_outstanding_offset_is_bridged_only_up_to_it() {
        let mut tracker = tracker(0);
        emit_and_ack(&mut tracker, 0..2);
        tracker.record_emitted(5, 0).unwrap();
        let now = Instant::now();

        assert_eq!(tracker.next_committable_offset(now), 2);
        assert_eq!(tracker.next_committable_offset(now), 5);
    }

    #[test]
    fn test_gap_at_committed_offset_settles() {
        // The stored position points at a compacted offset
        let mut tracker = tracker(100);
        emit_and_ack(&mut tracker, 103..105);
        let now = Instant::now();

        assert_eq!(tracker.next_committable_offset(now), 100);
        assert_eq!(tracker.next_committable_offset(now), 105);
    }

    #[rstest]
    #[case(0, 10)]
    #[case(1, 5)]
    #[case(2, 5)]
    fn test_gap_settle_cycles_are_configurable(#[case] cycles: u32, #[case] after_second: i64) {
        let mut tracker = PartitionOffsetTracker::new(
            Partition::new("test-topic".to_string(), 0),
            0,
            GapSettlePolicy {
                commit_cycles: cycles,
                min_age: Duration::ZERO,
            },
        );
        emit_and_ack(&mut tracker, 0..5);
        emit_and_ack(&mut tracker, 8..10);
        let now = Instant::now();

        let first = tracker.next_committable_offset(now);
        assert_eq!(first, if cycles == 0 { 10 } else { 5 });

        // cycles == 1 bridges here, cycles == 2 needs one more
        let second = tracker.next_committable_offset(now);
        assert_eq!(second, if cycles == 1 { 10 } else { after_second });

        let third = tracker.next_committable_offset(now);
        assert_eq!(third, 10);
    }

    #[test]
    fn test_gap_settle_min_age_is_required() {
        let mut tracker = PartitionOffsetTracker::new(
            Partition::new("test-topic".to_string(), 0),
            0,
            GapSettlePolicy {
                commit_cycles: 1,
                min_age: Duration::from_secs(5),
            },
        );
        emit_and_ack(&mut tracker, 0..1);
        emit_and_ack(&mut tracker, 2..3);
        let start = Instant::now();

        assert_eq!(tracker.next_committable_offset(start), 1);
        assert_eq!(tracker.next_committable_offset(start + Duration::from_secs(1)), 1);
        assert_eq!(tracker.next_committable_offset(start + Duration::from_secs(5)), 3);
    }

    #[test]
    fn test_confirm_committed_is_monotonic_and_idempotent() {
        let mut tracker = tracker(0);
        emit_and_ack(&mut tracker, 0..5);

        assert!(tracker.confirm_committed(5));
        assert!(!tracker.confirm_committed(5));
        assert!(!tracker.confirm_committed(3));
        assert_eq!(tracker.committed_offset(), 5);
        assert_eq!(tracker.uncommitted_count(), 0);
    }

    #[test]
    fn test_confirm_committed_prunes_voids_below_frontier() {
        let mut tracker = tracker(0);
        emit_and_ack(&mut tracker, 0..1);
        emit_and_ack(&mut tracker, 4..5);
        let now = Instant::now();

        tracker.next_committable_offset(now);
        assert_eq!(tracker.next_committable_offset(now), 5);
        assert!(tracker.is_void(2));

        tracker.confirm_committed(5);
        assert!(!tracker.is_void(2));
        assert_eq!(tracker.state_of(2), Some(OffsetState::Committed));
    }

    #[test]
    fn test_committed_offset_never_exceeds_resolved_prefix() {
        // Interleave acks, fails and commits; the frontier must never pass
        // an unresolved offset.
        let mut tracker = tracker(0);
        let now = Instant::now();
        for offset in 0..20 {
            tracker.record_emitted(offset, 0).unwrap();
        }

        let mut previous = tracker.committed_offset();
        for offset in (0..20).rev() {
            if offset % 3 == 0 {
                tracker.fail(offset, 0);
            } else {
                tracker.ack(offset);
            }
            let candidate = tracker.next_committable_offset(now);
            tracker.confirm_committed(candidate);

            let committed = tracker.committed_offset();
            assert!(committed >= previous);
            for below in 0..committed {
                assert_eq!(tracker.state_of(below), Some(OffsetState::Committed));
            }
            previous = committed;
        }

        // 0 failed, so nothing could be committed
        assert_eq!(tracker.committed_offset(), 0);
    }
}
