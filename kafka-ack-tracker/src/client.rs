//! Seams between the ack-tracking core and the outside world.
//!
//! The log client polls records, commits offsets and reports partition
//! rebalances. The collector is the downstream pipeline records are handed
//! to. Both are narrow traits so tests can swap in deterministic fakes.

use std::time::Duration;

use anyhow::Result;

use crate::error::CommitError;
use crate::types::{CommitBatch, Partition, PartitionOffset, PolledRecord, RecordId};

/// Offset storage of the external log service.
pub trait OffsetStore {
    /// Synchronously commit `batch`, where each offset is the next offset to
    /// resume from.
    fn commit(&self, batch: &CommitBatch) -> Result<(), CommitError>;

    /// The committed position stored for `partition`, if any.
    fn stored_offset(&self, partition: &Partition) -> Result<Option<i64>>;

    /// Low and high watermarks of `partition`.
    fn watermarks(&self, partition: &Partition) -> Result<(i64, i64)>;
}

pub trait LogClient: OffsetStore {
    fn subscribe(&mut self, topics: &[String]) -> Result<()>;

    /// Fetch the next records.
    ///
    /// Rebalances are delivered to `listener` before this returns. Records of
    /// a partition revoked during the call may still be in the returned
    /// batch and must be dropped by the caller.
    fn poll(
        &mut self,
        timeout: Duration,
        listener: &mut dyn RebalanceListener,
    ) -> Result<Vec<PolledRecord>>;

    /// Stop fetching records for `partitions`. Polling keeps the group
    /// membership alive and still delivers rebalances.
    fn pause(&mut self, partitions: &[Partition]) -> Result<()>;

    /// Resume fetching for partitions paused earlier.
    fn resume(&mut self, partitions: &[Partition]) -> Result<()>;
}

/// Receives partition ownership changes from inside [`LogClient::poll`].
pub trait RebalanceListener {
    /// Returns the position each partition should be consumed from.
    /// Partitions left out of the result are not consumed.
    fn on_partitions_assigned(
        &mut self,
        store: &dyn OffsetStore,
        partitions: &[Partition],
    ) -> Result<Vec<PartitionOffset>>;

    /// Called while the partitions are still assigned, so a final commit for
    /// them can go through.
    fn on_partitions_revoked(&mut self, store: &dyn OffsetStore, partitions: &[Partition]);
}

/// The downstream pipeline records are emitted to.
#[cfg_attr(test, mockall::automock)]
pub trait Collector {
    /// Hand `record` downstream under `record_id`. Completion is signalled
    /// later through the consumer's ack/fail entry points or its completion
    /// channel.
    fn emit(&mut self, record: &PolledRecord, record_id: RecordId) -> Result<()>;

    /// Block until outstanding emits are delivered or `timeout` elapses.
    fn flush(&mut self, _timeout: Duration) -> Result<()> {
        Ok(())
    }
}
