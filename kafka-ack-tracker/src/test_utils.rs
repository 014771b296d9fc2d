//! Deterministic stand-ins for the log client and the downstream collector.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use bytes::Bytes;

use crate::client::{Collector, LogClient, OffsetStore, RebalanceListener};
use crate::error::CommitError;
use crate::types::{CommitBatch, Partition, PartitionOffset, PolledRecord, RecordId};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// One scripted step returned by [`FakeLogClient::poll`].
#[derive(Debug, Clone)]
pub enum FakePollStep {
    Assign(Vec<Partition>),
    Revoke(Vec<Partition>),
    Records(Vec<PolledRecord>),
}

#[derive(Debug)]
struct BrokerUnavailable;

impl std::fmt::Display for BrokerUnavailable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("broker unavailable")
    }
}

impl std::error::Error for BrokerUnavailable {}

/// In-memory log client.
///
/// Each `poll` runs scripted rebalances until it reaches a batch of records
/// (or the script runs out) and returns that batch. A batch holding records
/// of a paused partition stays queued until that partition is resumed.
/// Successful commits are recorded and update the stored offsets.
#[derive(Default)]
pub struct FakeLogClient {
    script: VecDeque<FakePollStep>,
    subscriptions: Vec<String>,
    stored_offsets: Mutex<HashMap<Partition, i64>>,
    watermarks: HashMap<Partition, (i64, i64)>,
    commits: Mutex<Vec<CommitBatch>>,
    commit_attempts: AtomicUsize,
    fail_commits: AtomicBool,
    fail_lookups: AtomicBool,
    assignments: Vec<PartitionOffset>,
    paused: BTreeSet<Partition>,
    polls: usize,
}

impl FakeLogClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_watermarks(mut self, partition: Partition, low: i64, high: i64) -> Self {
        self.watermarks.insert(partition, (low, high));
        self
    }

    pub fn with_stored_offset(self, partition: Partition, offset: i64) -> Self {
        self.set_stored_offset(partition, offset);
        self
    }

    pub fn push_assign(&mut self, partitions: Vec<Partition>) {
        self.script.push_back(FakePollStep::Assign(partitions));
    }

    pub fn push_revoke(&mut self, partitions: Vec<Partition>) {
        self.script.push_back(FakePollStep::Revoke(partitions));
    }

    pub fn push_records(&mut self, records: Vec<PolledRecord>) {
        self.script.push_back(FakePollStep::Records(records));
    }

    pub fn set_stored_offset(&self, partition: Partition, offset: i64) {
        lock(&self.stored_offsets).insert(partition, offset);
    }

    pub fn stored(&self, partition: &Partition) -> Option<i64> {
        lock(&self.stored_offsets).get(partition).copied()
    }

    pub fn set_commit_failure(&self, fail: bool) {
        self.fail_commits.store(fail, Ordering::SeqCst);
    }

    /// Make stored offset and watermark lookups time out.
    pub fn set_lookup_failure(&self, fail: bool) {
        self.fail_lookups.store(fail, Ordering::SeqCst);
    }

    /// Successfully committed batches, oldest first.
    pub fn commits(&self) -> Vec<CommitBatch> {
        lock(&self.commits).clone()
    }

    pub fn commit_attempts(&self) -> usize {
        self.commit_attempts.load(Ordering::SeqCst)
    }

    /// Start positions returned by the listener for every assignment.
    pub fn assignments(&self) -> &[PartitionOffset] {
        &self.assignments
    }

    pub fn subscriptions(&self) -> &[String] {
        &self.subscriptions
    }

    pub fn polls(&self) -> usize {
        self.polls
    }

    pub fn paused(&self) -> Vec<Partition> {
        self.paused.iter().cloned().collect()
    }

    pub fn script_is_empty(&self) -> bool {
        self.script.is_empty()
    }
}

impl OffsetStore for FakeLogClient {
    fn commit(&self, batch: &CommitBatch) -> Result<(), CommitError> {
        self.commit_attempts.fetch_add(1, Ordering::SeqCst);
        if self.fail_commits.load(Ordering::SeqCst) {
            return Err(CommitError::transient(BrokerUnavailable));
        }

        let mut stored = lock(&self.stored_offsets);
        for (partition, offset) in batch {
            stored.insert(partition.clone(), *offset);
        }
        lock(&self.commits).push(batch.clone());
        Ok(())
    }

    fn stored_offset(&self, partition: &Partition) -> Result<Option<i64>> {
        if self.fail_lookups.load(Ordering::SeqCst) {
            bail!("metadata request for {partition} timed out");
        }
        Ok(self.stored(partition))
    }

    fn watermarks(&self, partition: &Partition) -> Result<(i64, i64)> {
        if self.fail_lookups.load(Ordering::SeqCst) {
            bail!("watermark request for {partition} timed out");
        }
        Ok(self.watermarks.get(partition).copied().unwrap_or((0, 0)))
    }
}

impl LogClient for FakeLogClient {
    fn subscribe(&mut self, topics: &[String]) -> Result<()> {
        if topics.is_empty() {
            bail!("no topics to subscribe to");
        }
        self.subscriptions = topics.to_vec();
        Ok(())
    }

    fn poll(
        &mut self,
        _timeout: Duration,
        listener: &mut dyn RebalanceListener,
    ) -> Result<Vec<PolledRecord>> {
        self.polls += 1;
        while let Some(step) = self.script.pop_front() {
            match step {
                FakePollStep::Assign(partitions) => {
                    let positions = listener.on_partitions_assigned(&*self, &partitions)?;
                    self.assignments.extend(positions);
                }
                FakePollStep::Revoke(partitions) => {
                    listener.on_partitions_revoked(&*self, &partitions);
                    for partition in &partitions {
                        self.paused.remove(partition);
                    }
                }
                FakePollStep::Records(records) => {
                    if records.iter().any(|r| self.paused.contains(r.partition())) {
                        self.script.push_front(FakePollStep::Records(records));
                        return Ok(Vec::new());
                    }
                    return Ok(records);
                }
            }
        }
        Ok(Vec::new())
    }

    fn pause(&mut self, partitions: &[Partition]) -> Result<()> {
        self.paused.extend(partitions.iter().cloned());
        Ok(())
    }

    fn resume(&mut self, partitions: &[Partition]) -> Result<()> {
        for partition in partitions {
            self.paused.remove(partition);
        }
        Ok(())
    }
}

/// Collector that remembers everything emitted to it.
#[derive(Default)]
pub struct RecordingCollector {
    emitted: Vec<(PolledRecord, RecordId)>,
    fail_next_emits: usize,
    flushes: usize,
}

impl RecordingCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` emits return an error.
    pub fn fail_next_emits(&mut self, count: usize) {
        self.fail_next_emits = count;
    }

    pub fn emitted(&self) -> &[(PolledRecord, RecordId)] {
        &self.emitted
    }

    pub fn record_ids(&self) -> Vec<RecordId> {
        self.emitted.iter().map(|(_, id)| id.clone()).collect()
    }

    pub fn last(&self) -> Option<&RecordId> {
        self.emitted.last().map(|(_, id)| id)
    }

    pub fn flushes(&self) -> usize {
        self.flushes
    }
}

impl Collector for RecordingCollector {
    fn emit(&mut self, record: &PolledRecord, record_id: RecordId) -> Result<()> {
        if self.fail_next_emits > 0 {
            self.fail_next_emits -= 1;
            return Err(anyhow!("downstream rejected {record_id}"));
        }
        self.emitted.push((record.clone(), record_id));
        Ok(())
    }

    fn flush(&mut self, _timeout: Duration) -> Result<()> {
        self.flushes += 1;
        Ok(())
    }
}

/// Records for `offsets` on `partition` with a payload naming the offset.
pub fn records(partition: &Partition, offsets: impl IntoIterator<Item = i64>) -> Vec<PolledRecord> {
    offsets
        .into_iter()
        .map(|offset| {
            PolledRecord::new(
                partition.clone(),
                offset,
                Some(Bytes::from(format!("payload-{offset}"))),
            )
        })
        .collect()
}
