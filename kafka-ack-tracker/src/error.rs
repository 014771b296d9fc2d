use std::fmt;

use thiserror::Error;

use crate::types::{Partition, RecordId};

/// Where an offset sits in its partition's lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OffsetState {
    Emitted,
    Failed,
    Acked,
    Void,
    Committed,
}

impl fmt::Display for OffsetState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OffsetState::Emitted => "emitted",
            OffsetState::Failed => "failed",
            OffsetState::Acked => "acked",
            OffsetState::Void => "void",
            OffsetState::Committed => "committed",
        };
        f.write_str(name)
    }
}

/// A record failed more often than the configured retry budget allows.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("record {record_id} failed {failures} times, exceeding max retries of {max_retries}")]
pub struct RetryExhaustedError {
    pub record_id: RecordId,
    pub failures: u32,
    pub max_retries: u32,
}

#[derive(Error, Debug)]
pub enum AckTrackerError {
    /// The caller emitted an offset the tracker already knows about.
    #[error("offset {offset} on {partition} emitted twice (currently {state})")]
    DuplicateEmit {
        partition: Partition,
        offset: i64,
        state: OffsetState,
    },

    /// Emit for a partition that is not currently assigned to this consumer.
    #[error("partition {0} is not owned by this consumer")]
    PartitionNotOwned(Partition),

    /// Raised only under the fail-fast exhausted-retry policy.
    #[error(transparent)]
    RetryExhausted(#[from] RetryExhaustedError),
}

/// The log service rejected or could not complete an offset commit.
///
/// Always transient from the engine's point of view: watermarks are left
/// untouched and the commit is attempted again at the next period.
#[derive(Error, Debug)]
pub enum CommitError {
    #[error("offset commit failed: {0}")]
    Transient(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl CommitError {
    pub fn transient<E>(error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        CommitError::Transient(Box::new(error))
    }
}
