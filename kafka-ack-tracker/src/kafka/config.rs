use rdkafka::ClientConfig;

use crate::config::Config;

/// Consumer configuration for offset-tracked consumption.
///
/// Offsets are never stored or committed by librdkafka itself: the commit
/// scheduler is the only writer of committed positions.
pub struct ConsumerConfigBuilder {
    config: ClientConfig,
}

impl ConsumerConfigBuilder {
    pub fn new(bootstrap_servers: &str, group_id: &str) -> Self {
        let mut config = ClientConfig::new();

        config
            .set("bootstrap.servers", bootstrap_servers)
            .set("group.id", group_id)
            .set("enable.auto.offset.store", "false")
            .set("enable.auto.commit", "false")
            .set("socket.timeout.ms", "10000")
            .set("session.timeout.ms", "60000")
            .set("heartbeat.interval.ms", "5000")
            .set("max.poll.interval.ms", "300000");

        Self { config }
    }

    /// Enable TLS/SSL for Kafka connection
    pub fn with_tls(mut self, enabled: bool) -> Self {
        if enabled {
            self.config
                .set("security.protocol", "ssl")
                .set("enable.ssl.certificate.verification", "false");
        }
        self
    }

    /// Switch to cooperative-sticky assignment; with a client id, also use
    /// static group membership.
    pub fn with_sticky_partition_assignment(mut self, client_id: Option<&str>) -> Self {
        self.config
            .set("partition.assignment.strategy", "cooperative-sticky");

        if let Some(client_id) = client_id {
            self.config.set("client.id", client_id);
            self.config.set("group.instance.id", client_id);
        }
        self
    }

    /// Add any custom configuration
    pub fn set(mut self, key: &str, value: &str) -> Self {
        self.config.set(key, value);
        self
    }

    pub fn build(self) -> ClientConfig {
        self.config
    }
}

/// Producer configuration for the relay output topic.
pub fn producer_config(config: &Config) -> ClientConfig {
    let mut client_config = ClientConfig::new();
    client_config
        .set("bootstrap.servers", &config.kafka_hosts)
        .set("linger.ms", config.kafka_producer_linger_ms.to_string())
        .set(
            "message.timeout.ms",
            config.kafka_message_timeout_ms.to_string(),
        )
        .set("enable.idempotence", "true")
        .set("acks", "all");

    if config.kafka_tls {
        client_config
            .set("security.protocol", "ssl")
            .set("enable.ssl.certificate.verification", "false");
    }
    client_config
}

/// Consumer configuration derived from the service config.
pub fn consumer_config(config: &Config) -> ClientConfig {
    let builder =
        ConsumerConfigBuilder::new(&config.kafka_hosts, &config.kafka_consumer_group)
            .with_tls(config.kafka_tls);

    match config.kafka_client_id.as_deref() {
        Some(client_id) => builder
            .with_sticky_partition_assignment(Some(client_id))
            .build(),
        None => builder.build(),
    }
}
