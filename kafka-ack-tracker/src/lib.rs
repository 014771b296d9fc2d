//! Offset ack tracking for at-least-once Kafka consumption.
//!
//! Records are emitted downstream, acknowledged or failed asynchronously, and
//! only offsets below the first unresolved record are ever committed. Failed
//! records are retried with backoff; offsets the log will never produce are
//! bridged once they have settled.
//!
//! ## Error logging (anyhow)
//!
//! When logging `anyhow::Error` or other error types with a cause chain, use
//! formats that include the full chain:
//!
//! - **Inline format:** `{e:#}` for the full chain on one line.
//! - **Structured field:** `error = ?e` for the chain with `Caused by:` sections.
//!
//! Avoid `{}` / `%e` (Display) for errors, they only show the top-level message.
//! Use `.context()` / `.with_context()` so the original error remains the source.

pub mod client;
pub mod clock;
pub mod commit_scheduler;
pub mod config;
pub mod consumer;
pub mod engine;
pub mod error;
pub mod kafka;
pub mod metrics_consts;
pub mod rebalance_coordinator;
pub mod retry_queue;
pub mod service;
pub mod tracker;
pub mod types;

// Used in "mod tests" and tests/ directory (integration tests)
pub mod test_utils;

pub use client::{Collector, LogClient, OffsetStore, RebalanceListener};
pub use clock::{Clock, ManualClock, SystemClock};
pub use commit_scheduler::{CommitOutcome, CommitScheduler, CommitTrigger};
pub use config::{AckTrackerConfig, ExhaustedRetryPolicy, GapSettlePolicy, InitialOffset};
pub use consumer::{completion_channel, AckingConsumer, CompletionReceiver, CompletionSender};
pub use engine::{AckTrackingEngine, FailOutcome};
pub use error::{AckTrackerError, CommitError, OffsetState, RetryExhaustedError};
pub use rebalance_coordinator::RebalanceCoordinator;
pub use retry_queue::{RetryEntry, RetryQueue};
pub use tracker::PartitionOffsetTracker;
pub use types::{
    CommitBatch, Completion, MessageResult, Partition, PartitionOffset, PolledRecord, RecordId,
};
