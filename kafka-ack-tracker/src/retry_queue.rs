use std::collections::{BTreeSet, HashMap};
use std::time::Instant;

use tracing::debug;

use crate::config::RetryBackoff;
use crate::error::RetryExhaustedError;
use crate::metrics_consts::{RETRIES_SCHEDULED, RETRY_QUEUE_SIZE};
use crate::types::{Partition, RecordId};

type RetryKey = (Partition, i64);

/// A failed record waiting to be emitted again.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryEntry {
    record_id: RecordId,
    failures: u32,
    last_failure_at: Instant,
    ready_at: Instant,
}

impl RetryEntry {
    pub fn record_id(&self) -> &RecordId {
        &self.record_id
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn last_failure_at(&self) -> Instant {
        self.last_failure_at
    }

    pub fn ready_at(&self) -> Instant {
        self.ready_at
    }
}

/// Failed records pending re-emission, at most one per `(partition, offset)`.
///
/// Entries are indexed by the time they become eligible so draining only
/// touches the ready prefix.
pub struct RetryQueue {
    max_retries: u32,
    backoff: RetryBackoff,
    entries: HashMap<RetryKey, RetryEntry>,
    schedule: BTreeSet<(Instant, Partition, i64)>,
}

impl RetryQueue {
    pub fn new(max_retries: u32, backoff: RetryBackoff) -> Self {
        Self {
            max_retries,
            backoff,
            entries: HashMap::new(),
            schedule: BTreeSet::new(),
        }
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Schedule `record_id` for another attempt, replacing any entry for the
    /// same offset.
    ///
    /// # Errors
    ///
    /// Returns `RetryExhaustedError` when this failure takes the record past
    /// `max_retries`; no entry is kept in that case.
    pub fn enqueue(
        &mut self,
        record_id: RecordId,
        failure_time: Instant,
    ) -> Result<(), RetryExhaustedError> {
        let key = (record_id.partition().clone(), record_id.offset());
        self.remove_key(&key);

        let failures = record_id.failures();
        if failures > self.max_retries {
            return Err(RetryExhaustedError {
                record_id,
                failures,
                max_retries: self.max_retries,
            });
        }

        let ready_at = failure_time + self.backoff.delay_for(failures);
        debug!(
            record = %record_id,
            failures = failures,
            "Scheduling failed record for retry"
        );

        self.schedule.insert((ready_at, key.0.clone(), key.1));
        self.entries.insert(
            key,
            RetryEntry {
                record_id,
                failures,
                last_failure_at: failure_time,
                ready_at,
            },
        );

        metrics::counter!(RETRIES_SCHEDULED).increment(1);
        metrics::gauge!(RETRY_QUEUE_SIZE).set(self.entries.len() as f64);
        Ok(())
    }

    /// Drop the entry for an offset, e.g. because a late ack resolved it.
    pub fn remove(&mut self, partition: &Partition, offset: i64) -> bool {
        let removed = self.remove_key(&(partition.clone(), offset));
        if removed {
            metrics::gauge!(RETRY_QUEUE_SIZE).set(self.entries.len() as f64);
        }
        removed
    }

    /// Drop every entry belonging to `partition`. Returns how many were dropped.
    pub fn remove_partition(&mut self, partition: &Partition) -> usize {
        let before = self.entries.len();
        self.entries.retain(|(p, _), _| p != partition);
        self.schedule.retain(|(_, p, _)| p != partition);

        let dropped = before - self.entries.len();
        if dropped > 0 {
            metrics::gauge!(RETRY_QUEUE_SIZE).set(self.entries.len() as f64);
        }
        dropped
    }

    /// Lazily yield records whose backoff has elapsed at `now`, earliest first.
    ///
    /// Each yielded record is removed from the queue; records not consumed
    /// from the iterator stay queued.
    pub fn drain_ready_for_retry(&mut self, now: Instant) -> ReadyForRetry<'_> {
        ReadyForRetry { queue: self, now }
    }

    pub fn get(&self, partition: &Partition, offset: i64) -> Option<&RetryEntry> {
        self.entries.get(&(partition.clone(), offset))
    }

    pub fn contains(&self, partition: &Partition, offset: i64) -> bool {
        self.entries.contains_key(&(partition.clone(), offset))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn remove_key(&mut self, key: &RetryKey) -> bool {
        match self.entries.remove(key) {
            Some(entry) => {
                self.schedule
                    .remove(&(entry.ready_at, key.0.clone(), key.1));
                true
            }
            None => false,
        }
    }
}

pub struct ReadyForRetry<'a> {
    queue: &'a mut RetryQueue,
    now: Instant,
}

impl Iterator for ReadyForRetry<'_> {
    type Item = RecordId;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let (ready_at, _, _) = self.queue.schedule.first()?;
            if *ready_at > self.now {
                return None;
            }
            let (_, partition, offset) = self.queue.schedule.pop_first()?;
            if let Some(entry) = self.queue.entries.remove(&(partition, offset)) {
                metrics::gauge!(RETRY_QUEUE_SIZE).set(self.queue.entries.len() as f64);
                return Some(entry.record_id);
            }
        }
    }
}
