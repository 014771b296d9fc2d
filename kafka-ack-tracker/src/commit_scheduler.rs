use std::fmt;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::client::OffsetStore;
use crate::clock::Clock;
use crate::engine::AckTrackingEngine;
use crate::error::CommitError;
use crate::metrics_consts::{COMMITS, COMMIT_DURATION_MS};
use crate::types::CommitBatch;

/// Why a commit was issued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitTrigger {
    Timer,
    Revoke,
    Shutdown,
}

impl CommitTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommitTrigger::Timer => "timer",
            CommitTrigger::Revoke => "revoke",
            CommitTrigger::Shutdown => "shutdown",
        }
    }
}

impl fmt::Display for CommitTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug)]
pub enum CommitOutcome {
    /// The commit period has not elapsed yet.
    NotDue,
    /// No partition moved past its committed offset.
    NothingToCommit,
    /// The log service confirmed the batch and watermarks were advanced.
    Committed(CommitBatch),
    /// The commit call failed; watermarks are unchanged.
    Failed(CommitError),
}

impl CommitOutcome {
    pub fn is_committed(&self) -> bool {
        matches!(self, CommitOutcome::Committed(_))
    }
}

/// Fires a commit of the engine's candidates once per period.
///
/// A failed commit is not retried until the next period.
pub struct CommitScheduler<C: Clock> {
    period: Duration,
    clock: C,
    last_fired: Instant,
}

impl<C: Clock> CommitScheduler<C> {
    pub fn new(period: Duration, clock: C) -> Self {
        let last_fired = clock.now();
        Self {
            period,
            clock,
            last_fired,
        }
    }

    pub fn now(&self) -> Instant {
        self.clock.now()
    }

    pub fn is_due(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.last_fired) >= self.period
    }

    pub fn maybe_commit(
        &mut self,
        now: Instant,
        engine: &mut AckTrackingEngine,
        store: &dyn OffsetStore,
    ) -> CommitOutcome {
        if !self.is_due(now) {
            return CommitOutcome::NotDue;
        }
        self.last_fired = now;
        self.commit_now(now, engine, store, CommitTrigger::Timer)
    }

    /// Collect and commit candidates for all owned partitions regardless of
    /// the period.
    pub fn commit_now(
        &mut self,
        now: Instant,
        engine: &mut AckTrackingEngine,
        store: &dyn OffsetStore,
        trigger: CommitTrigger,
    ) -> CommitOutcome {
        let batch = engine.collect_commit_candidates(now);
        commit_batch(engine, store, batch, trigger)
    }
}

/// Issue one synchronous commit for `batch` and confirm it on success.
///
/// The batch is a snapshot; completions that arrive while the call is in
/// flight are picked up by the next batch.
pub fn commit_batch(
    engine: &mut AckTrackingEngine,
    store: &dyn OffsetStore,
    batch: CommitBatch,
    trigger: CommitTrigger,
) -> CommitOutcome {
    if batch.is_empty() {
        debug!(trigger = %trigger, "No offsets to commit");
        return CommitOutcome::NothingToCommit;
    }

    let start = Instant::now();
    let result = store.commit(&batch);
    metrics::histogram!(COMMIT_DURATION_MS, "trigger" => trigger.as_str())
        .record(start.elapsed().as_secs_f64() * 1000.0);

    match result {
        Ok(()) => {
            engine.confirm_committed(&batch);
            metrics::counter!(COMMITS, "status" => "success", "trigger" => trigger.as_str())
                .increment(1);
            info!(
                trigger = %trigger,
                partitions = batch.len(),
                "Committed offsets"
            );
            for (partition, offset) in &batch {
                debug!(partition = %partition, offset = offset, "Committed partition offset");
            }
            CommitOutcome::Committed(batch)
        }
        Err(e) => {
            metrics::counter!(COMMITS, "status" => "failure", "trigger" => trigger.as_str())
                .increment(1);
            warn!(
                trigger = %trigger,
                partitions = batch.len(),
                error = ?e,
                "Offset commit failed, watermarks left unchanged"
            );
            CommitOutcome::Failed(e)
        }
    }
}
