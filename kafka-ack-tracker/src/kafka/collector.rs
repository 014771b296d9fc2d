use std::time::Duration;

use anyhow::{Context, Result};
use rdkafka::producer::{BaseRecord, DeliveryResult, Producer, ProducerContext, ThreadedProducer};
use rdkafka::{ClientConfig, ClientContext, Message};
use tracing::{debug, error};

use crate::client::Collector;
use crate::consumer::CompletionSender;
use crate::types::{Completion, MessageResult, PolledRecord, RecordId};

/// Producer context that turns delivery reports into completion signals.
pub struct ForwardingContext {
    completions: CompletionSender,
}

impl ForwardingContext {
    pub fn new(completions: CompletionSender) -> Self {
        Self { completions }
    }
}

impl ClientContext for ForwardingContext {}

impl ProducerContext for ForwardingContext {
    type DeliveryOpaque = Box<RecordId>;

    fn delivery(&self, delivery_result: &DeliveryResult<'_>, record_id: Self::DeliveryOpaque) {
        let result = match delivery_result {
            Ok(message) => {
                debug!(
                    record = %record_id,
                    output_partition = message.partition(),
                    output_offset = message.offset(),
                    "Record delivered"
                );
                MessageResult::Success
            }
            Err((e, _)) => MessageResult::Failed(e.to_string()),
        };

        let completion = Completion {
            record_id: *record_id,
            result,
        };
        if let Err(e) = self.completions.send(completion) {
            error!(
                record = %e.0.record_id,
                "Completion channel closed, delivery report dropped"
            );
        }
    }
}

/// Collector that relays every record to an output topic, completing it
/// when the producer reports delivery.
pub struct ForwardingCollector {
    producer: ThreadedProducer<ForwardingContext>,
    output_topic: String,
}

impl ForwardingCollector {
    pub fn from_config(
        config: &ClientConfig,
        output_topic: String,
        completions: CompletionSender,
    ) -> Result<Self> {
        let producer: ThreadedProducer<ForwardingContext> = config
            .create_with_context(ForwardingContext::new(completions))
            .context("Failed to create Kafka producer")?;

        Ok(Self {
            producer,
            output_topic,
        })
    }
}

impl Collector for ForwardingCollector {
    fn emit(&mut self, record: &PolledRecord, record_id: RecordId) -> Result<()> {
        let mut base = BaseRecord::<[u8], [u8], Box<RecordId>>::with_opaque_to(
            &self.output_topic,
            Box::new(record_id),
        );
        if let Some(key) = record.key() {
            base = base.key(key.as_ref());
        }
        if let Some(payload) = record.payload() {
            base = base.payload(payload.as_ref());
        }

        self.producer
            .send(base)
            .map_err(|(e, _)| e)
            .with_context(|| {
                format!(
                    "Failed to enqueue record {}@{} for {}",
                    record.partition(),
                    record.offset(),
                    self.output_topic
                )
            })
    }

    fn flush(&mut self, timeout: Duration) -> Result<()> {
        self.producer
            .flush(timeout)
            .context("Failed to flush Kafka producer")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consumer::completion_channel;
    use crate::types::Partition;
    use bytes::Bytes;
    use std::time::Instant;

    #[test]
    fn test_undeliverable_record_completes_as_failed() {
        let (tx, mut rx) = completion_channel();
        let mut config = ClientConfig::new();
        config
            .set("bootstrap.servers", "localhost:1")
            .set("message.timeout.ms", "100");
        let mut collector =
            ForwardingCollector::from_config(&config, "relayed".to_string(), tx).unwrap();

        let partition = Partition::new("events".to_string(), 0);
        let record = PolledRecord::new(partition.clone(), 7, Some(Bytes::from_static(b"hello")));
        let record_id = RecordId::new(partition, 7, Instant::now());
        collector.emit(&record, record_id.clone()).unwrap();

        // Flush returns once the delivery report for the timed out record fired
        let _flushed = collector.flush(Duration::from_secs(5));

        let completion = rx.try_recv().expect("delivery report");
        assert_eq!(completion.record_id, record_id);
        assert!(matches!(completion.result, MessageResult::Failed(_)));
    }
}
