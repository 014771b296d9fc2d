// rdkafka adapters for the log client and collector seams
pub mod collector;
pub mod config;
pub mod log_client;

pub use collector::ForwardingCollector;
pub use config::ConsumerConfigBuilder;
pub use log_client::KafkaLogClient;
