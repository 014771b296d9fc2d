//! The single-threaded loop that drives the ack-tracking core.
//!
//! Every iteration drains completion signals, gives the commit scheduler a
//! chance to fire and re-emits records whose retry backoff elapsed. It then
//! polls and emits new records. Polling never stops: when too many offsets
//! are uncommitted the owned partitions are paused instead, so rebalances
//! keep being handled. All tracker state is mutated here and nowhere else.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tokio::sync::mpsc::{self, error::TryRecvError};
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

use crate::client::{Collector, LogClient, OffsetStore, RebalanceListener};
use crate::clock::Clock;
use crate::commit_scheduler::{CommitOutcome, CommitScheduler, CommitTrigger};
use crate::config::AckTrackerConfig;
use crate::engine::{AckTrackingEngine, FailOutcome};
use crate::error::AckTrackerError;
use crate::metrics_consts::{POLLS_PAUSED, RECORDS_SKIPPED_UNOWNED};
use crate::rebalance_coordinator::RebalanceCoordinator;
use crate::types::{Completion, MessageResult, Partition, PartitionOffset, PolledRecord, RecordId};

/// Sender half handed to asynchronous downstream components.
pub type CompletionSender = mpsc::UnboundedSender<Completion>;
/// Receiver half drained by the driving loop.
pub type CompletionReceiver = mpsc::UnboundedReceiver<Completion>;

pub fn completion_channel() -> (CompletionSender, CompletionReceiver) {
    mpsc::unbounded_channel()
}

const SHUTDOWN_FLUSH_TIMEOUT: Duration = Duration::from_secs(10);

/// Applies rebalances reported by the log client to the engine.
struct RebalanceScope<'a> {
    coordinator: &'a RebalanceCoordinator,
    engine: &'a mut AckTrackingEngine,
    now: Instant,
    revoked: Vec<Partition>,
}

impl RebalanceListener for RebalanceScope<'_> {
    fn on_partitions_assigned(
        &mut self,
        store: &dyn OffsetStore,
        partitions: &[Partition],
    ) -> Result<Vec<PartitionOffset>> {
        Ok(self.coordinator.on_assigned(self.engine, store, partitions))
    }

    fn on_partitions_revoked(&mut self, store: &dyn OffsetStore, partitions: &[Partition]) {
        self.coordinator
            .on_revoked(self.engine, store, partitions, self.now);
        self.revoked.extend_from_slice(partitions);
    }
}

pub struct AckingConsumer<L: LogClient, K: Collector, C: Clock> {
    client: L,
    collector: K,
    engine: AckTrackingEngine,
    scheduler: CommitScheduler<C>,
    coordinator: RebalanceCoordinator,
    /// Polled records still needed for a possible retry.
    retained: HashMap<(Partition, i64), PolledRecord>,
    completions: CompletionReceiver,
    /// Partitions paused on the log client because of back-pressure.
    paused: Vec<Partition>,
    max_uncommitted_offsets: usize,
    poll_timeout: Duration,
}

impl<L: LogClient, K: Collector, C: Clock> AckingConsumer<L, K, C> {
    pub fn new(
        client: L,
        collector: K,
        clock: C,
        config: &AckTrackerConfig,
        completions: CompletionReceiver,
    ) -> Self {
        Self {
            client,
            collector,
            engine: AckTrackingEngine::new(config),
            scheduler: CommitScheduler::new(config.commit_period, clock),
            coordinator: RebalanceCoordinator::new(config.initial_offset),
            retained: HashMap::new(),
            completions,
            paused: Vec::new(),
            max_uncommitted_offsets: config.max_uncommitted_offsets,
            poll_timeout: config.poll_timeout,
        }
    }

    pub fn subscribe(&mut self, topics: &[String]) -> Result<()> {
        self.client
            .subscribe(topics)
            .with_context(|| format!("Failed to subscribe to topics {topics:?}"))
    }

    pub fn client(&self) -> &L {
        &self.client
    }

    pub fn client_mut(&mut self) -> &mut L {
        &mut self.client
    }

    pub fn collector(&self) -> &K {
        &self.collector
    }

    pub fn engine(&self) -> &AckTrackingEngine {
        &self.engine
    }

    pub fn retained_count(&self) -> usize {
        self.retained.len()
    }

    /// Partitions currently paused because of back-pressure.
    pub fn paused_partitions(&self) -> &[Partition] {
        &self.paused
    }

    /// Downstream success signal. Late or duplicate signals are ignored.
    pub fn ack(&mut self, record_id: &RecordId) -> bool {
        let acked = self.engine.ack(record_id);
        if acked {
            self.retained
                .remove(&(record_id.partition().clone(), record_id.offset()));
        }
        acked
    }

    /// Downstream failure signal.
    ///
    /// # Errors
    ///
    /// Returns `RetryExhausted` when the record ran out of retries under the
    /// fail-fast policy. Nothing else is surfaced.
    pub fn fail(&mut self, record_id: &RecordId) -> Result<FailOutcome, AckTrackerError> {
        let now = self.scheduler.now();
        self.fail_at(record_id, now)
    }

    /// Run one iteration of the loop.
    pub fn step(&mut self) -> Result<()> {
        let now = self.scheduler.now();

        self.drain_completions(now)?;

        // Outcome is logged by the scheduler; a failure waits for the next period
        if let CommitOutcome::Failed(_) =
            self.scheduler
                .maybe_commit(now, &mut self.engine, &self.client)
        {
            debug!("Periodic commit failed, continuing to process records");
        }

        self.emit_ready_retries(now)?;
        self.apply_backpressure();

        self.poll_and_emit(now)
    }

    /// Drive the loop until `shutdown` fires, then drain and commit once more.
    pub fn run(mut self, mut shutdown: oneshot::Receiver<()>) -> Result<()> {
        info!("Starting acking consumer loop");

        loop {
            match shutdown.try_recv() {
                Err(oneshot::error::TryRecvError::Empty) => {}
                _ => break,
            }

            if let Err(e) = self.step() {
                error!("Consumer loop stopped: {e:#}");
                if let Err(shutdown_err) = self.shutdown() {
                    warn!("Final commit after failure did not complete: {shutdown_err:#}");
                }
                return Err(e);
            }
        }

        info!("Shutdown requested, draining and committing");
        self.shutdown()
    }

    /// Flush downstream, fold in the resulting completions and commit
    /// whatever is committable regardless of the timer.
    pub fn shutdown(&mut self) -> Result<()> {
        if let Err(e) = self.collector.flush(SHUTDOWN_FLUSH_TIMEOUT) {
            warn!("Collector flush on shutdown failed: {e:#}");
        }

        // Acks drained before a fatal failure are still committed below
        let now = self.scheduler.now();
        let drained = self.drain_completions(now);
        if let Err(e) = &drained {
            error!("Draining completions on shutdown failed: {e:#}");
        }

        let outcome = self.scheduler.commit_now(
            now,
            &mut self.engine,
            &self.client,
            CommitTrigger::Shutdown,
        );
        drained?;
        match outcome {
            CommitOutcome::Failed(e) => {
                Err(anyhow::Error::new(e).context("Final offset commit on shutdown failed"))
            }
            _ => Ok(()),
        }
    }

    fn fail_at(
        &mut self,
        record_id: &RecordId,
        now: Instant,
    ) -> Result<FailOutcome, AckTrackerError> {
        let outcome = self.engine.fail(record_id, now)?;
        if outcome == FailOutcome::Voided {
            self.retained
                .remove(&(record_id.partition().clone(), record_id.offset()));
        }
        Ok(outcome)
    }

    fn drain_completions(&mut self, now: Instant) -> Result<()> {
        loop {
            let completion = match self.completions.try_recv() {
                Ok(completion) => completion,
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => return Ok(()),
            };

            match completion.result {
                MessageResult::Success => {
                    self.ack(&completion.record_id);
                }
                MessageResult::Failed(reason) => {
                    debug!(
                        record = %completion.record_id,
                        reason = %reason,
                        "Downstream reported failure"
                    );
                    self.fail_at(&completion.record_id, now)?;
                }
            }
        }
    }

    /// Pause every owned partition while the uncommitted backlog is at its
    /// limit and resume them once commits brought it back down.
    fn apply_backpressure(&mut self) {
        let uncommitted = self.engine.uncommitted_count();

        if uncommitted >= self.max_uncommitted_offsets {
            let to_pause: Vec<Partition> = self
                .engine
                .owned_partitions()
                .into_iter()
                .filter(|p| !self.paused.contains(p))
                .collect();
            if to_pause.is_empty() {
                return;
            }

            metrics::counter!(POLLS_PAUSED).increment(1);
            info!(
                uncommitted = uncommitted,
                max_uncommitted = self.max_uncommitted_offsets,
                partitions = to_pause.len(),
                "Too many uncommitted offsets, pausing partitions"
            );
            match self.client.pause(&to_pause) {
                Ok(()) => self.paused.extend(to_pause),
                Err(e) => warn!("Pausing partitions failed, retrying next iteration: {e:#}"),
            }
        } else if !self.paused.is_empty() {
            let to_resume: Vec<Partition> = self
                .paused
                .iter()
                .filter(|p| self.engine.is_owned(p))
                .cloned()
                .collect();

            info!(
                uncommitted = uncommitted,
                partitions = to_resume.len(),
                "Uncommitted backlog drained, resuming partitions"
            );
            match self.client.resume(&to_resume) {
                Ok(()) => self.paused.clear(),
                Err(e) => warn!("Resuming partitions failed, retrying next iteration: {e:#}"),
            }
        }
    }

    fn emit_ready_retries(&mut self, now: Instant) -> Result<()> {
        let ready: Vec<RecordId> = self.engine.drain_ready_for_retry(now).collect();

        for failed in ready {
            let key = (failed.partition().clone(), failed.offset());
            let Some(record) = self.retained.get(&key).cloned() else {
                error!(record = %failed, "No retained payload for retry, record cannot be re-emitted");
                continue;
            };

            let record_id = match self.engine.re_emit(&failed) {
                Ok(record_id) => record_id,
                Err(e) => {
                    error!(record = %failed, error = ?e, "Failed to register retry");
                    continue;
                }
            };

            if let Err(e) = self.collector.emit(&record, record_id.clone()) {
                warn!(record = %record_id, "Re-emit to collector failed: {e:#}");
                self.fail_at(&record_id, now)?;
            }
        }
        Ok(())
    }

    fn poll_and_emit(&mut self, now: Instant) -> Result<()> {
        let mut scope = RebalanceScope {
            coordinator: &self.coordinator,
            engine: &mut self.engine,
            now,
            revoked: Vec::new(),
        };
        let records = self
            .client
            .poll(self.poll_timeout, &mut scope)
            .context("Failed to poll log client")?;
        let revoked = scope.revoked;

        if !revoked.is_empty() {
            self.retained.retain(|(partition, _), _| !revoked.contains(partition));
            self.paused.retain(|partition| !revoked.contains(partition));
        }

        for record in records {
            let record_id = match self.engine.emit(record.partition(), record.offset(), now) {
                Ok(record_id) => record_id,
                Err(AckTrackerError::PartitionNotOwned(partition)) => {
                    warn!(
                        partition = %partition,
                        offset = record.offset(),
                        "Dropping record from partition not owned by this consumer"
                    );
                    metrics::counter!(RECORDS_SKIPPED_UNOWNED).increment(1);
                    continue;
                }
                Err(e @ AckTrackerError::DuplicateEmit { .. }) => {
                    warn!(error = %e, "Skipping record already tracked");
                    continue;
                }
                Err(e) => return Err(e.into()),
            };

            self.retained.insert(
                (record.partition().clone(), record.offset()),
                record.clone(),
            );
            if let Err(e) = self.collector.emit(&record, record_id.clone()) {
                warn!(record = %record_id, "Emit to collector failed: {e:#}");
                self.fail_at(&record_id, now)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::MockCollector;
    use crate::clock::ManualClock;
    use crate::config::{ExhaustedRetryPolicy, RetryBackoff};
    use crate::test_utils::{records, FakeLogClient, RecordingCollector};
    use mockall::predicate::always;

    fn partition() -> Partition {
        Partition::new("events".to_string(), 0)
    }

    fn config() -> AckTrackerConfig {
        AckTrackerConfig::default()
            .with_commit_period(Duration::from_secs(10))
            .with_retry_backoff(RetryBackoff::none())
            .with_max_retries(2)
            .with_poll_timeout(Duration::from_millis(1))
    }

    #[test]
    fn test_collector_receives_every_polled_record() {
        let mut client = FakeLogClient::new();
        client.push_assign(vec![partition()]);
        client.push_records(records(&partition(), 0..3));

        let mut collector = MockCollector::new();
        collector
            .expect_emit()
            .with(always(), always())
            .times(3)
            .returning(|_, _| Ok(()));

        let (_tx, rx) = completion_channel();
        let mut consumer = AckingConsumer::new(client, collector, ManualClock::new(), &config(), rx);
        consumer.step().unwrap();

        assert_eq!(consumer.retained_count(), 3);
        assert_eq!(consumer.engine().uncommitted_count(), 3);
    }

    #[test]
    fn test_collector_error_schedules_retry_with_same_payload() {
        let mut client = FakeLogClient::new();
        client.push_assign(vec![partition()]);
        client.push_records(records(&partition(), 0..1));

        let mut collector = RecordingCollector::new();
        collector.fail_next_emits(1);

        let (_tx, rx) = completion_channel();
        let mut consumer = AckingConsumer::new(client, collector, ManualClock::new(), &config(), rx);

        consumer.step().unwrap();
        assert!(consumer.collector().emitted().is_empty());
        assert!(consumer.engine().retry_queue().contains(&partition(), 0));

        consumer.step().unwrap();
        let emitted = consumer.collector().emitted();
        assert_eq!(emitted.len(), 1);
        assert_eq!(emitted[0].1.retry(), 1);
        assert_eq!(emitted[0].0.payload(), records(&partition(), 0..1)[0].payload());
    }

    #[test]
    fn test_completion_channel_acks_and_fails() {
        let mut client = FakeLogClient::new();
        client.push_assign(vec![partition()]);
        client.push_records(records(&partition(), 0..2));

        let (tx, rx) = completion_channel();
        let clock = ManualClock::new();
        let mut consumer =
            AckingConsumer::new(client, RecordingCollector::new(), clock.clone(), &config(), rx);
        consumer.step().unwrap();

        let ids = consumer.collector().record_ids();
        tx.send(Completion {
            record_id: ids[0].clone(),
            result: MessageResult::Success,
        })
        .unwrap();
        tx.send(Completion {
            record_id: ids[1].clone(),
            result: MessageResult::Failed("timeout".to_string()),
        })
        .unwrap();

        consumer.step().unwrap();
        // Offset 1 was retried within the same step
        assert_eq!(consumer.collector().emitted().len(), 3);
        assert_eq!(consumer.retained_count(), 1);

        let retried = consumer.collector().last().cloned().unwrap();
        assert!(consumer.ack(&retried));

        clock.advance(Duration::from_secs(10));
        consumer.step().unwrap();
        assert_eq!(consumer.client().commits().len(), 1);
        assert_eq!(consumer.client().commits()[0].get(&partition()), Some(2));
    }

    #[test]
    fn test_fail_fast_stops_the_loop() {
        let mut client = FakeLogClient::new();
        client.push_assign(vec![partition()]);
        client.push_records(records(&partition(), 0..1));

        let (tx, rx) = completion_channel();
        let config = config()
            .with_max_retries(0)
            .with_exhausted_retry_policy(ExhaustedRetryPolicy::FailFast);
        let mut consumer =
            AckingConsumer::new(client, RecordingCollector::new(), ManualClock::new(), &config, rx);
        consumer.step().unwrap();

        let id = consumer.collector().record_ids()[0].clone();
        tx.send(Completion {
            record_id: id,
            result: MessageResult::Failed("boom".to_string()),
        })
        .unwrap();

        let err = consumer.step().unwrap_err();
        assert!(matches!(
            err.downcast_ref::<AckTrackerError>(),
            Some(AckTrackerError::RetryExhausted(_))
        ));
    }

    #[test]
    fn test_shutdown_commits_acks_drained_before_fatal_failure() {
        let mut client = FakeLogClient::new();
        client.push_assign(vec![partition()]);
        client.push_records(records(&partition(), 0..2));

        let (tx, rx) = completion_channel();
        let config = config()
            .with_max_retries(0)
            .with_exhausted_retry_policy(ExhaustedRetryPolicy::FailFast);
        let mut consumer =
            AckingConsumer::new(client, RecordingCollector::new(), ManualClock::new(), &config, rx);
        consumer.step().unwrap();

        let ids = consumer.collector().record_ids();
        tx.send(Completion {
            record_id: ids[0].clone(),
            result: MessageResult::Success,
        })
        .unwrap();
        tx.send(Completion {
            record_id: ids[1].clone(),
            result: MessageResult::Failed("boom".to_string()),
        })
        .unwrap();

        let err = consumer.shutdown().unwrap_err();
        assert!(matches!(
            err.downcast_ref::<AckTrackerError>(),
            Some(AckTrackerError::RetryExhausted(_))
        ));
        assert_eq!(consumer.client().commits().len(), 1);
        assert_eq!(consumer.client().commits()[0].get(&partition()), Some(1));
    }

    #[test]
    fn test_records_of_unassigned_partition_are_skipped() {
        let mut client = FakeLogClient::new();
        client.push_records(records(&partition(), 0..2));

        let (_tx, rx) = completion_channel();
        let mut consumer =
            AckingConsumer::new(client, RecordingCollector::new(), ManualClock::new(), &config(), rx);
        consumer.step().unwrap();

        assert!(consumer.collector().emitted().is_empty());
        assert_eq!(consumer.retained_count(), 0);
    }
}
