use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::{Context, Result};
use rdkafka::consumer::{BaseConsumer, CommitMode, Consumer, ConsumerContext, RebalanceProtocol};
use rdkafka::error::{KafkaError, KafkaResult, RDKafkaErrorCode};
use rdkafka::message::OwnedMessage;
use rdkafka::types::RDKafkaRespErr;
use rdkafka::{ClientConfig, ClientContext, Message, Offset, TopicPartitionList};
use tracing::{debug, error, info, warn};

use crate::client::{LogClient, OffsetStore, RebalanceListener};
use crate::error::CommitError;
use crate::metrics_consts::POLL_ERRORS;
use crate::types::{CommitBatch, Partition, PolledRecord};

#[derive(Debug)]
enum PendingRebalance {
    Assign(Vec<Partition>),
    Revoke(Vec<Partition>),
    Error(String),
}

/// Consumer context that defers rebalances to the polling thread.
///
/// librdkafka invokes the rebalance callback from inside `poll`. The
/// callback only records the event; [`KafkaLogClient::poll`] applies it
/// right after, where the engine is reachable. Revocations therefore
/// commit while the partitions are still assigned.
#[derive(Default)]
pub struct RebalanceContext {
    pending: Mutex<VecDeque<PendingRebalance>>,
}

impl RebalanceContext {
    fn queue(&self) -> MutexGuard<'_, VecDeque<PendingRebalance>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn pop(&self) -> Option<PendingRebalance> {
        self.queue().pop_front()
    }
}

impl ClientContext for RebalanceContext {}

impl ConsumerContext for RebalanceContext {
    fn rebalance(
        &self,
        _base_consumer: &BaseConsumer<Self>,
        err: RDKafkaRespErr,
        tpl: &mut TopicPartitionList,
    ) {
        let partitions: Vec<Partition> = tpl.elements().into_iter().map(Partition::from).collect();
        let event = match err {
            RDKafkaRespErr::RD_KAFKA_RESP_ERR__ASSIGN_PARTITIONS => {
                info!("Rebalance assigned {} partitions", partitions.len());
                PendingRebalance::Assign(partitions)
            }
            RDKafkaRespErr::RD_KAFKA_RESP_ERR__REVOKE_PARTITIONS => {
                info!("Rebalance revoked {} partitions", partitions.len());
                PendingRebalance::Revoke(partitions)
            }
            other => {
                error!("Rebalance error: {other:?}");
                PendingRebalance::Error(format!("{other:?}"))
            }
        };
        self.queue().push_back(event);
    }
}

/// rdkafka-backed [`LogClient`].
pub struct KafkaLogClient {
    consumer: BaseConsumer<RebalanceContext>,
    metadata_timeout: Duration,
    max_poll_records: usize,
}

impl KafkaLogClient {
    pub fn from_config(
        config: &ClientConfig,
        metadata_timeout: Duration,
        max_poll_records: usize,
    ) -> Result<Self> {
        let consumer: BaseConsumer<RebalanceContext> = config
            .create_with_context(RebalanceContext::default())
            .context("Failed to create Kafka consumer")?;

        Ok(Self {
            consumer,
            metadata_timeout,
            max_poll_records,
        })
    }

    fn is_cooperative(&self) -> bool {
        matches!(
            self.consumer.rebalance_protocol(),
            RebalanceProtocol::Cooperative
        )
    }

    fn apply_pending_rebalances(&self, listener: &mut dyn RebalanceListener) -> Result<()> {
        while let Some(event) = self.consumer.context().pop() {
            match event {
                PendingRebalance::Assign(partitions) => self.assign(listener, &partitions)?,
                PendingRebalance::Revoke(partitions) => self.revoke(listener, &partitions)?,
                PendingRebalance::Error(reason) => {
                    let assignment = self
                        .consumer
                        .assignment()
                        .context("Failed to read assignment after rebalance error")?;
                    let partitions: Vec<Partition> = assignment
                        .elements()
                        .into_iter()
                        .map(Partition::from)
                        .collect();
                    warn!(
                        reason = %reason,
                        partitions = partitions.len(),
                        "Dropping current assignment after rebalance error"
                    );
                    listener.on_partitions_revoked(self, &partitions);
                    self.consumer
                        .unassign()
                        .context("Failed to unassign after rebalance error")?;
                }
            }
        }
        Ok(())
    }

    fn assign(&self, listener: &mut dyn RebalanceListener, partitions: &[Partition]) -> Result<()> {
        let positions = listener.on_partitions_assigned(self, partitions)?;

        let mut tpl = TopicPartitionList::new();
        for position in &positions {
            tpl.add_partition_offset(
                position.topic(),
                position.partition_number(),
                Offset::Offset(position.offset()),
            )
            .with_context(|| format!("Invalid start offset for {}", position.partition()))?;
        }

        let result = if self.is_cooperative() {
            self.consumer.incremental_assign(&tpl)
        } else {
            self.consumer.assign(&tpl)
        };
        result.context("Failed to apply partition assignment")
    }

    fn revoke(&self, listener: &mut dyn RebalanceListener, partitions: &[Partition]) -> Result<()> {
        listener.on_partitions_revoked(self, partitions);

        let result = if self.is_cooperative() {
            self.consumer.incremental_unassign(&partition_list(partitions))
        } else {
            self.consumer.unassign()
        };
        result.context("Failed to apply partition revocation")
    }

    /// Returns `Err` only for errors the consumer cannot continue after.
    fn handle_poll_error(&self, e: KafkaError) -> Result<()> {
        let level = match &e {
            KafkaError::MessageConsumptionFatal(_)
            | KafkaError::Global(RDKafkaErrorCode::Authentication) => "fatal",
            // auto.offset.reset repositions the partition
            KafkaError::MessageConsumption(
                RDKafkaErrorCode::OffsetOutOfRange | RDKafkaErrorCode::PartitionEOF,
            ) => "info",
            _ => "warn",
        };
        metrics::counter!(POLL_ERRORS, "level" => level).increment(1);

        match level {
            "fatal" => {
                error!("Fatal Kafka consumer error: {e:#}");
                Err(e).context("Fatal Kafka consumer error")
            }
            "info" => {
                info!("Kafka consumer error: {e:#}");
                Ok(())
            }
            _ => {
                warn!("Kafka consumer error: {e:#}");
                Ok(())
            }
        }
    }
}

fn partition_list(partitions: &[Partition]) -> TopicPartitionList {
    let mut tpl = TopicPartitionList::new();
    for partition in partitions {
        tpl.add_partition(partition.topic(), partition.partition_number());
    }
    tpl
}

impl OffsetStore for KafkaLogClient {
    fn commit(&self, batch: &CommitBatch) -> Result<(), CommitError> {
        let mut tpl = TopicPartitionList::new();
        for (partition, offset) in batch {
            tpl.add_partition_offset(
                partition.topic(),
                partition.partition_number(),
                Offset::Offset(*offset),
            )
            .map_err(CommitError::transient)?;
        }

        self.consumer
            .commit(&tpl, CommitMode::Sync)
            .map_err(CommitError::transient)
    }

    fn stored_offset(&self, partition: &Partition) -> Result<Option<i64>> {
        let committed = self
            .consumer
            .committed_offsets(
                partition_list(std::slice::from_ref(partition)),
                self.metadata_timeout,
            )
            .with_context(|| format!("Failed to fetch committed offset for {partition}"))?;

        let offset = committed
            .find_partition(partition.topic(), partition.partition_number())
            .and_then(|elem| match elem.offset() {
                Offset::Offset(offset) => Some(offset),
                _ => None,
            });
        Ok(offset)
    }

    fn watermarks(&self, partition: &Partition) -> Result<(i64, i64)> {
        self.consumer
            .fetch_watermarks(
                partition.topic(),
                partition.partition_number(),
                self.metadata_timeout,
            )
            .with_context(|| format!("Failed to fetch watermarks for {partition}"))
    }
}

impl LogClient for KafkaLogClient {
    fn subscribe(&mut self, topics: &[String]) -> Result<()> {
        let topics: Vec<&str> = topics.iter().map(String::as_str).collect();
        self.consumer
            .subscribe(&topics)
            .with_context(|| format!("Failed to subscribe to {topics:?}"))
    }

    fn poll(
        &mut self,
        timeout: Duration,
        listener: &mut dyn RebalanceListener,
    ) -> Result<Vec<PolledRecord>> {
        let mut records = Vec::new();
        let mut wait = timeout;

        while records.len() < self.max_poll_records {
            let polled: Option<KafkaResult<OwnedMessage>> = self
                .consumer
                .poll(wait)
                .map(|result| result.map(|message| message.detach()));
            self.apply_pending_rebalances(listener)?;

            match polled {
                Some(Ok(message)) => {
                    if message.payload().is_none() {
                        debug!(
                            topic = message.topic(),
                            partition = message.partition(),
                            offset = message.offset(),
                            "Polled record without payload"
                        );
                    }
                    records.push(PolledRecord::from(&message));
                }
                Some(Err(e)) => {
                    self.handle_poll_error(e)?;
                    break;
                }
                None => break,
            }

            // Only the first poll waits; the rest drain what is already fetched
            wait = Duration::ZERO;
        }

        Ok(records)
    }

    fn pause(&mut self, partitions: &[Partition]) -> Result<()> {
        self.consumer
            .pause(&partition_list(partitions))
            .with_context(|| format!("Failed to pause {} partitions", partitions.len()))
    }

    fn resume(&mut self, partitions: &[Partition]) -> Result<()> {
        self.consumer
            .resume(&partition_list(partitions))
            .with_context(|| format!("Failed to resume {} partitions", partitions.len()))
    }
}
