use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Result};
use envconfig::Envconfig;

/// What to do with a record that failed more often than `max_retries` allows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExhaustedRetryPolicy {
    /// Turn the offset into a void so it stops blocking the commit frontier.
    #[default]
    DropAsVoid,
    /// Surface the failure to the driving loop, which stops the consumer.
    FailFast,
}

impl FromStr for ExhaustedRetryPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "drop-as-void" | "drop_as_void" => Ok(ExhaustedRetryPolicy::DropAsVoid),
            "fail-fast" | "fail_fast" => Ok(ExhaustedRetryPolicy::FailFast),
            _ => Err(format!("Invalid exhausted retry policy: {s}")),
        }
    }
}

impl fmt::Display for ExhaustedRetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExhaustedRetryPolicy::DropAsVoid => f.write_str("drop-as-void"),
            ExhaustedRetryPolicy::FailFast => f.write_str("fail-fast"),
        }
    }
}

/// Where a newly assigned partition starts.
///
/// `Earliest` and `Latest` prefer the stored committed position and only use
/// the low/high watermark when nothing is stored. `Stored` expects a stored
/// position and falls back to the low watermark with a warning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InitialOffset {
    #[default]
    Earliest,
    Latest,
    Stored,
}

impl FromStr for InitialOffset {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "earliest" => Ok(InitialOffset::Earliest),
            "latest" => Ok(InitialOffset::Latest),
            "stored" => Ok(InitialOffset::Stored),
            _ => Err(format!("Invalid initial offset strategy: {s}")),
        }
    }
}

/// Exponential backoff between attempts of a failed record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryBackoff {
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryBackoff {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl RetryBackoff {
    pub fn none() -> Self {
        Self {
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    /// Delay before the next attempt after `failures` failures (1-based).
    pub fn delay_for(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(31);
        self.initial_delay
            .saturating_mul(2u32.saturating_pow(exponent))
            .min(self.max_delay)
    }
}

/// When an offset gap at the commit frontier is confirmed void.
///
/// The gap must have been seen in a commit cycle at least `commit_cycles`
/// cycles before the current one, and must be at least `min_age` old.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GapSettlePolicy {
    pub commit_cycles: u32,
    pub min_age: Duration,
}

impl Default for GapSettlePolicy {
    fn default() -> Self {
        Self {
            commit_cycles: 1,
            min_age: Duration::ZERO,
        }
    }
}

/// Settings for the ack-tracking core and its driving loop.
#[derive(Debug, Clone)]
pub struct AckTrackerConfig {
    pub commit_period: Duration,
    pub max_retries: u32,
    pub exhausted_retry_policy: ExhaustedRetryPolicy,
    pub initial_offset: InitialOffset,
    pub retry_backoff: RetryBackoff,
    pub gap_settle: GapSettlePolicy,
    pub max_uncommitted_offsets: usize,
    pub poll_timeout: Duration,
}

impl Default for AckTrackerConfig {
    fn default() -> Self {
        Self {
            commit_period: Duration::from_secs(30),
            max_retries: 10,
            exhausted_retry_policy: ExhaustedRetryPolicy::default(),
            initial_offset: InitialOffset::default(),
            retry_backoff: RetryBackoff::default(),
            gap_settle: GapSettlePolicy::default(),
            max_uncommitted_offsets: 10_000_000,
            poll_timeout: Duration::from_millis(200),
        }
    }
}

impl AckTrackerConfig {
    pub fn with_commit_period(mut self, period: Duration) -> Self {
        self.commit_period = period;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_exhausted_retry_policy(mut self, policy: ExhaustedRetryPolicy) -> Self {
        self.exhausted_retry_policy = policy;
        self
    }

    pub fn with_initial_offset(mut self, initial_offset: InitialOffset) -> Self {
        self.initial_offset = initial_offset;
        self
    }

    pub fn with_retry_backoff(mut self, backoff: RetryBackoff) -> Self {
        self.retry_backoff = backoff;
        self
    }

    pub fn with_gap_settle(mut self, gap_settle: GapSettlePolicy) -> Self {
        self.gap_settle = gap_settle;
        self
    }

    pub fn with_max_uncommitted_offsets(mut self, max: usize) -> Self {
        self.max_uncommitted_offsets = max;
        self
    }

    pub fn with_poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = timeout;
        self
    }
}

#[derive(Envconfig, Clone, Debug)]
pub struct Config {
    // Kafka configuration
    #[envconfig(default = "localhost:9092")]
    pub kafka_hosts: String,

    #[envconfig(default = "kafka-ack-tracker")]
    pub kafka_consumer_group: String,

    #[envconfig(default = "events")]
    pub kafka_consumer_topic: String,

    #[envconfig(default = "events_relayed")]
    pub kafka_output_topic: String,

    #[envconfig(default = "false")]
    pub kafka_tls: bool,

    // Set to enable cooperative-sticky assignment with static membership
    pub kafka_client_id: Option<String>,

    #[envconfig(default = "20")]
    pub kafka_producer_linger_ms: u32,

    #[envconfig(default = "20000")]
    pub kafka_message_timeout_ms: u32,

    #[envconfig(default = "10")]
    pub kafka_metadata_timeout_secs: u64,

    // Offset commit configuration
    #[envconfig(default = "30000")]
    pub commit_interval_ms: u64,

    #[envconfig(default = "10")]
    pub max_retries: u32,

    #[envconfig(default = "drop-as-void")]
    pub exhausted_retry_policy: ExhaustedRetryPolicy,

    #[envconfig(default = "earliest")]
    pub initial_offset: InitialOffset,

    #[envconfig(default = "500")]
    pub retry_initial_delay_ms: u64,

    #[envconfig(default = "10000")]
    pub retry_max_delay_ms: u64,

    #[envconfig(default = "1")]
    pub gap_settle_cycles: u32,

    #[envconfig(default = "0")]
    pub gap_settle_min_age_ms: u64,

    // Consumer loop configuration
    #[envconfig(default = "10000000")]
    pub max_uncommitted_offsets: usize,

    #[envconfig(default = "200")]
    pub poll_timeout_ms: u64,

    #[envconfig(default = "500")]
    pub max_poll_records: usize,

    // HTTP server configuration
    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "8080")]
    pub port: u16,
}

impl Config {
    pub fn init_with_defaults() -> Result<Self, envconfig::Error> {
        Config::init_from_env()
    }

    pub fn validate(&self) -> Result<()> {
        if self.commit_interval_ms == 0 {
            bail!("COMMIT_INTERVAL_MS must be greater than zero");
        }
        if self.max_poll_records == 0 {
            bail!("MAX_POLL_RECORDS must be greater than zero");
        }
        if self.retry_max_delay_ms < self.retry_initial_delay_ms {
            bail!(
                "RETRY_MAX_DELAY_MS ({}) must not be below RETRY_INITIAL_DELAY_MS ({})",
                self.retry_max_delay_ms,
                self.retry_initial_delay_ms
            );
        }
        Ok(())
    }

    /// Get server bind address
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn commit_interval(&self) -> Duration {
        Duration::from_millis(self.commit_interval_ms)
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    pub fn metadata_timeout(&self) -> Duration {
        Duration::from_secs(self.kafka_metadata_timeout_secs)
    }

    pub fn to_ack_tracker_config(&self) -> AckTrackerConfig {
        AckTrackerConfig::default()
            .with_commit_period(self.commit_interval())
            .with_max_retries(self.max_retries)
            .with_exhausted_retry_policy(self.exhausted_retry_policy)
            .with_initial_offset(self.initial_offset)
            .with_retry_backoff(RetryBackoff {
                initial_delay: Duration::from_millis(self.retry_initial_delay_ms),
                max_delay: Duration::from_millis(self.retry_max_delay_ms),
            })
            .with_gap_settle(GapSettlePolicy {
                commit_cycles: self.gap_settle_cycles,
                min_age: Duration::from_millis(self.gap_settle_min_age_ms),
            })
            .with_max_uncommitted_offsets(self.max_uncommitted_offsets)
            .with_poll_timeout(self.poll_timeout())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::collections::HashMap;

    #[rstest]
    #[case("drop-as-void", ExhaustedRetryPolicy::DropAsVoid)]
    #[case("DROP_AS_VOID", ExhaustedRetryPolicy::DropAsVoid)]
    #[case(" fail-fast ", ExhaustedRetryPolicy::FailFast)]
    fn test_parse_exhausted_retry_policy(
        #[case] input: &str,
        #[case] expected: ExhaustedRetryPolicy,
    ) {
        assert_eq!(input.parse::<ExhaustedRetryPolicy>().unwrap(), expected);
    }

    #[test]
    fn test_parse_invalid_values() {
        assert!("drop".parse::<ExhaustedRetryPolicy>().is_err());
        assert!("beginning".parse::<InitialOffset>().is_err());
    }

    #[rstest]
    #[case(1, Duration::from_millis(500))]
    #[case(2, Duration::from_millis(1000))]
    #[case(3, Duration::from_millis(2000))]
    #[case(6, Duration::from_millis(10000))]
    #[case(64, Duration::from_millis(10000))]
    fn test_retry_backoff_is_exponential_and_capped(
        #[case] failures: u32,
        #[case] expected: Duration,
    ) {
        assert_eq!(RetryBackoff::default().delay_for(failures), expected);
    }

    #[test]
    fn test_env_config_converts_to_tracker_config() {
        let env = HashMap::from([
            ("COMMIT_INTERVAL_MS".to_string(), "2000".to_string()),
            ("MAX_RETRIES".to_string(), "3".to_string()),
            ("EXHAUSTED_RETRY_POLICY".to_string(), "fail-fast".to_string()),
            ("INITIAL_OFFSET".to_string(), "latest".to_string()),
            ("GAP_SETTLE_CYCLES".to_string(), "2".to_string()),
        ]);
        let config = Config::init_from_hashmap(&env).unwrap();
        config.validate().unwrap();

        let tracker_config = config.to_ack_tracker_config();
        assert_eq!(tracker_config.commit_period, Duration::from_secs(2));
        assert_eq!(tracker_config.max_retries, 3);
        assert_eq!(
            tracker_config.exhausted_retry_policy,
            ExhaustedRetryPolicy::FailFast
        );
        assert_eq!(tracker_config.initial_offset, InitialOffset::Latest);
        assert_eq!(tracker_config.gap_settle.commit_cycles, 2);
        assert_eq!(tracker_config.gap_settle.min_age, Duration::ZERO);
    }

    #[test]
    fn test_validate_rejects_zero_commit_interval() {
        let env = HashMap::from([("COMMIT_INTERVAL_MS".to_string(), "0".to_string())]);
        let config = Config::init_from_hashmap(&env).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_inverted_backoff() {
        let env = HashMap::from([
            ("RETRY_INITIAL_DELAY_MS".to_string(), "5000".to_string()),
            ("RETRY_MAX_DELAY_MS".to_string(), "100".to_string()),
        ]);
        let config = Config::init_from_hashmap(&env).unwrap();
        assert!(config.validate().is_err());
    }
}
