use std::time::Instant;

use anyhow::{Context, Result};
use tracing::{error, info, warn};

use crate::client::OffsetStore;
use crate::commit_scheduler::{commit_batch, CommitOutcome, CommitTrigger};
use crate::config::InitialOffset;
use crate::engine::AckTrackingEngine;
use crate::metrics_consts::{
    ASSIGNMENT_LOOKUP_FAILURES, OWNED_PARTITIONS, PARTITIONS_ASSIGNED, PARTITIONS_REVOKED,
};
use crate::types::{Partition, PartitionOffset};

/// Creates and tears down partition trackers as ownership changes.
pub struct RebalanceCoordinator {
    initial_offset: InitialOffset,
}

impl RebalanceCoordinator {
    pub fn new(initial_offset: InitialOffset) -> Self {
        Self { initial_offset }
    }

    /// Seed a tracker for each newly assigned partition and return the
    /// position each one should be consumed from.
    ///
    /// A partition that is already owned keeps its tracker and resumes from
    /// its committed offset. A partition whose start offset cannot be looked
    /// up is left out: it gets no tracker and is not consumed until the next
    /// rebalance assigns it again.
    pub fn on_assigned(
        &self,
        engine: &mut AckTrackingEngine,
        store: &dyn OffsetStore,
        partitions: &[Partition],
    ) -> Vec<PartitionOffset> {
        let mut positions = Vec::with_capacity(partitions.len());

        for partition in partitions {
            if let Some(committed) = engine.committed_offset(partition) {
                info!(
                    partition = %partition,
                    committed_offset = committed,
                    "Partition re-assigned while still owned, keeping tracker"
                );
                positions.push(PartitionOffset::new(partition.clone(), committed));
                continue;
            }

            let start = match self.resolve_start_offset(store, partition) {
                Ok(start) => start,
                Err(e) => {
                    error!(
                        partition = %partition,
                        error = ?e,
                        "Could not resolve start offset, leaving partition unassigned"
                    );
                    metrics::counter!(ASSIGNMENT_LOOKUP_FAILURES).increment(1);
                    continue;
                }
            };
            engine.assign_partition(partition.clone(), start);
            info!(
                partition = %partition,
                start_offset = start,
                strategy = ?self.initial_offset,
                "Assigned partition"
            );
            positions.push(PartitionOffset::new(partition.clone(), start));
        }

        metrics::counter!(PARTITIONS_ASSIGNED).increment(positions.len() as u64);
        metrics::gauge!(OWNED_PARTITIONS).set(engine.owned_partitions().len() as f64);
        positions
    }

    /// Flush a final commit for the revoked partitions, then discard their
    /// trackers whether or not the flush succeeded.
    ///
    /// A failed flush means records after the last successful commit will be
    /// redelivered to the next owner.
    pub fn on_revoked(
        &self,
        engine: &mut AckTrackingEngine,
        store: &dyn OffsetStore,
        partitions: &[Partition],
        now: Instant,
    ) -> CommitOutcome {
        let owned: Vec<Partition> = partitions
            .iter()
            .filter(|p| engine.is_owned(p))
            .cloned()
            .collect();
        if owned.is_empty() {
            return CommitOutcome::NothingToCommit;
        }

        let batch = engine.collect_commit_candidates_for(&owned, now);
        let outcome = commit_batch(engine, store, batch, CommitTrigger::Revoke);
        if let CommitOutcome::Failed(e) = &outcome {
            warn!(
                partitions = owned.len(),
                error = ?e,
                "Flush commit on revocation failed, uncommitted records will be redelivered"
            );
        }

        for partition in &owned {
            engine.revoke_partition(partition);
        }

        info!(partitions = owned.len(), "Revoked partitions");
        metrics::counter!(PARTITIONS_REVOKED).increment(owned.len() as u64);
        metrics::gauge!(OWNED_PARTITIONS).set(engine.owned_partitions().len() as f64);
        outcome
    }

    fn resolve_start_offset(&self, store: &dyn OffsetStore, partition: &Partition) -> Result<i64> {
        let stored = store
            .stored_offset(partition)
            .with_context(|| format!("Failed to fetch stored offset for {partition}"))?;
        if let Some(offset) = stored {
            return Ok(offset);
        }

        let (low, high) = store
            .watermarks(partition)
            .with_context(|| format!("Failed to fetch watermarks for {partition}"))?;

        Ok(match self.initial_offset {
            InitialOffset::Earliest => low,
            InitialOffset::Latest => high,
            InitialOffset::Stored => {
                warn!(
                    partition = %partition,
                    low_watermark = low,
                    "No stored offset for partition, starting from the low watermark"
                );
                low
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AckTrackerConfig;
    use crate::test_utils::FakeLogClient;
    use rstest::rstest;

    fn partition(num: i32) -> Partition {
        Partition::new("test-topic".to_string(), num)
    }

    #[rstest]
    #[case(InitialOffset::Earliest, None, 20)]
    #[case(InitialOffset::Latest, None, 80)]
    #[case(InitialOffset::Stored, None, 20)]
    #[case(InitialOffset::Earliest, Some(50), 50)]
    #[case(InitialOffset::Latest, Some(50), 50)]
    #[case(InitialOffset::Stored, Some(50), 50)]
    fn test_start_offset_per_strategy(
        #[case] strategy: InitialOffset,
        #[case] stored: Option<i64>,
        #[case] expected: i64,
    ) {
        let client = FakeLogClient::new().with_watermarks(partition(0), 20, 80);
        if let Some(offset) = stored {
            client.set_stored_offset(partition(0), offset);
        }
        let mut engine = AckTrackingEngine::new(&AckTrackerConfig::default());
        let coordinator = RebalanceCoordinator::new(strategy);

        let positions = coordinator.on_assigned(&mut engine, &client, &[partition(0)]);

        assert_eq!(positions, vec![PartitionOffset::new(partition(0), expected)]);
        assert_eq!(engine.committed_offset(&partition(0)), Some(expected));
    }

    #[test]
    fn test_reassigned_partition_keeps_tracker() {
        let client = FakeLogClient::new();
        client.set_stored_offset(partition(0), 5);
        let mut engine = AckTrackingEngine::new(&AckTrackerConfig::default());
        let coordinator = RebalanceCoordinator::new(InitialOffset::Earliest);

        coordinator.on_assigned(&mut engine, &client, &[partition(0)]);
        engine.emit(&partition(0), 5, Instant::now()).unwrap();
        client.set_stored_offset(partition(0), 0);

        let positions = coordinator.on_assigned(&mut engine, &client, &[partition(0)]);
        assert_eq!(positions[0].offset(), 5);
        assert_eq!(engine.tracker(&partition(0)).unwrap().in_flight_count(), 1);
    }

    #[test]
    fn test_failed_offset_lookup_leaves_partition_out() {
        let client = FakeLogClient::new();
        let mut engine = AckTrackingEngine::new(&AckTrackerConfig::default());
        let coordinator = RebalanceCoordinator::new(InitialOffset::Earliest);
        coordinator.on_assigned(&mut engine, &client, &[partition(0)]);

        client.set_lookup_failure(true);
        let positions = coordinator.on_assigned(
            &mut engine,
            &client,
            &[partition(0), partition(1), partition(2)],
        );

        // Already owned partitions need no lookup
        assert_eq!(positions, vec![PartitionOffset::new(partition(0), 0)]);
        assert!(!engine.is_owned(&partition(1)));
        assert!(!engine.is_owned(&partition(2)));
        assert_eq!(engine.owned_partitions(), vec![partition(0)]);
    }

    #[test]
    fn test_revoke_flushes_then_discards() {
        let client = FakeLogClient::new();
        let now = Instant::now();
        let mut engine = AckTrackingEngine::new(&AckTrackerConfig::default());
        let coordinator = RebalanceCoordinator::new(InitialOffset::Earliest);
        coordinator.on_assigned(&mut engine, &client, &[partition(0), partition(1)]);
        for offset in 0..3 {
            let id = engine.emit(&partition(0), offset, now).unwrap();
            engine.ack(&id);
        }

        let outcome = coordinator.on_revoked(&mut engine, &client, &[partition(0)], now);
        assert!(outcome.is_committed());
        assert_eq!(client.commits().len(), 1);
        assert_eq!(client.commits()[0].get(&partition(0)), Some(3));
        assert!(!client.commits()[0].contains(&partition(1)));

        assert!(!engine.is_owned(&partition(0)));
        assert!(engine.is_owned(&partition(1)));
    }

    #[test]
    fn test_revoke_discards_even_when_flush_fails() {
        let client = FakeLogClient::new();
        let now = Instant::now();
        let mut engine = AckTrackingEngine::new(&AckTrackerConfig::default());
        let coordinator = RebalanceCoordinator::new(InitialOffset::Earliest);
        coordinator.on_assigned(&mut engine, &client, &[partition(0)]);
        let id = engine.emit(&partition(0), 0, now).unwrap();
        engine.ack(&id);
        client.set_commit_failure(true);

        let outcome = coordinator.on_revoked(&mut engine, &client, &[partition(0)], now);
        assert!(matches!(outcome, CommitOutcome::Failed(_)));
        assert!(!engine.is_owned(&partition(0)));
        assert_eq!(client.stored(&partition(0)), None);
    }

    #[test]
    fn test_revoke_of_unowned_partition_is_noop() {
        let client = FakeLogClient::new();
        let mut engine = AckTrackingEngine::new(&AckTrackerConfig::default());
        let coordinator = RebalanceCoordinator::new(InitialOffset::Earliest);

        let outcome =
            coordinator.on_revoked(&mut engine, &client, &[partition(3)], Instant::now());
        assert!(matches!(outcome, CommitOutcome::NothingToCommit));
        assert_eq!(client.commit_attempts(), 0);
    }
}
