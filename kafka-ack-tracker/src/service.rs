use std::future::Future;

use anyhow::{Context, Result};
use tokio::sync::oneshot;
use tracing::{error, info, warn};

use crate::clock::SystemClock;
use crate::config::Config;
use crate::consumer::{completion_channel, AckingConsumer};
use crate::kafka::config::{consumer_config, producer_config};
use crate::kafka::{ForwardingCollector, KafkaLogClient};

pub type RelayConsumer = AckingConsumer<KafkaLogClient, ForwardingCollector, SystemClock>;

/// At-least-once relay from the input topic to the output topic.
pub struct AckTrackerService {
    config: Config,
}

impl AckTrackerService {
    pub fn new(config: Config) -> Result<Self> {
        config.validate().with_context(|| {
            format!(
                "Configuration validation failed for service with consumer topic '{}' and group '{}'",
                config.kafka_consumer_topic, config.kafka_consumer_group
            )
        })?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Create the Kafka clients and the driving loop, subscribed to the
    /// input topic.
    pub fn build_consumer(&self) -> Result<RelayConsumer> {
        let (completion_tx, completion_rx) = completion_channel();

        let client = KafkaLogClient::from_config(
            &consumer_config(&self.config),
            self.config.metadata_timeout(),
            self.config.max_poll_records,
        )
        .with_context(|| {
            format!(
                "Failed to create Kafka consumer for topic '{}' with group '{}'",
                self.config.kafka_consumer_topic, self.config.kafka_consumer_group
            )
        })?;

        let collector = ForwardingCollector::from_config(
            &producer_config(&self.config),
            self.config.kafka_output_topic.clone(),
            completion_tx,
        )
        .with_context(|| {
            format!(
                "Failed to create producer for output topic '{}'",
                self.config.kafka_output_topic
            )
        })?;

        let mut consumer = AckingConsumer::new(
            client,
            collector,
            SystemClock,
            &self.config.to_ack_tracker_config(),
            completion_rx,
        );
        consumer.subscribe(&[self.config.kafka_consumer_topic.clone()])?;

        info!(
            "Initialized consumer for topic '{}', relaying to '{}'",
            self.config.kafka_consumer_topic, self.config.kafka_output_topic
        );
        Ok(consumer)
    }

    /// Run until ctrl-c, or until the consumer stops on its own.
    pub async fn run(self) -> Result<()> {
        self.run_with_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for shutdown signal: {e:#}");
            }
        })
        .await
    }

    pub async fn run_with_shutdown(
        self,
        shutdown_signal: impl Future<Output = ()>,
    ) -> Result<()> {
        let consumer = self.build_consumer()?;
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        info!("Starting Kafka ack tracker service");
        let mut handle = tokio::task::spawn_blocking(move || consumer.run(shutdown_rx));

        tokio::select! {
            () = shutdown_signal => {
                info!("Received shutdown signal, shutting down gracefully...");
                if shutdown_tx.send(()).is_err() {
                    warn!("Consumer loop already stopped");
                }
            }
            joined = &mut handle => {
                return joined.context("Consumer task panicked")?;
            }
        }

        match handle.await {
            Ok(Ok(())) => {
                info!("Consumer stopped normally");
                Ok(())
            }
            Ok(Err(e)) => {
                error!("Consumer stopped with error: {e:#}");
                Err(e)
            }
            Err(e) => Err(e).context("Consumer task panicked"),
        }
    }
}
