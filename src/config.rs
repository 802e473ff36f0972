//! Configuration structures.
//!
//! Configuration is loaded from TOML and validated before the host touches the
//! log or the lease store.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Default consumer group name.
pub const DEFAULT_CONSUMER_GROUP: &str = "$Default";

/// Main configuration structure.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Identity of this host instance
    pub host: HostConfig,

    /// Lease, pump and retry tuning
    #[serde(default)]
    pub options: HostOptions,

    /// Logging configuration
    #[serde(default)]
    pub monitoring: MonitoringConfig,
}

impl Config {
    /// Parse a TOML document.
    pub fn from_toml(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Validate the whole configuration.
    pub fn validate(&self) -> Result<()> {
        self.host.validate()?;
        self.options.validate()
    }
}

/// Identity of a host within a consumer group.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HostConfig {
    /// Unique name of this host instance; generated when omitted
    #[serde(default = "generate_host_name")]
    pub host_name: String,

    /// Event hub (partitioned log) to consume
    pub event_hub_name: String,

    /// Consumer group the host joins
    #[serde(default = "default_consumer_group")]
    pub consumer_group: String,
}

impl HostConfig {
    pub fn new(host_name: impl Into<String>, event_hub_name: impl Into<String>) -> Self {
        Self {
            host_name: host_name.into(),
            event_hub_name: event_hub_name.into(),
            consumer_group: default_consumer_group(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.host_name.trim().is_empty() {
            return Err(Error::Configuration("Host name is required".into()));
        }
        if self.event_hub_name.trim().is_empty() {
            return Err(Error::Configuration("Event hub name is required".into()));
        }
        if self.consumer_group.trim().is_empty() {
            return Err(Error::Configuration("Consumer group is required".into()));
        }
        Ok(())
    }
}

/// Where a pump starts reading when its partition has never been checkpointed.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum InitialPosition {
    /// Start from the earliest retained record
    #[default]
    Earliest,
    /// Start after the newest record present when the pump opens
    Latest,
}

/// Lease, pump and shutdown tuning.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HostOptions {
    /// How long an acquired or renewed lease stays valid
    #[serde(default = "default_lease_duration_ms")]
    pub lease_duration_ms: u64,

    /// How often owned leases are renewed (must be shorter than the lease duration)
    #[serde(default = "default_renew_interval_ms")]
    pub renew_interval_ms: u64,

    /// How often the host rescans leases and reconciles pumps
    #[serde(default = "default_rebalance_interval_ms")]
    pub rebalance_interval_ms: u64,

    /// Maximum number of records delivered in one batch
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,

    /// Bounded wait for new records before polling again
    #[serde(default = "default_receive_timeout_ms")]
    pub receive_timeout_ms: u64,

    /// How long stop() waits for pumps to close before aborting them
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,

    /// Start position for partitions without a checkpoint
    #[serde(default)]
    pub initial_position: InitialPosition,

    /// Retry policy for transient read errors
    #[serde(default)]
    pub retry: RetryConfig,
}

impl Default for HostOptions {
    fn default() -> Self {
        Self {
            lease_duration_ms: default_lease_duration_ms(),
            renew_interval_ms: default_renew_interval_ms(),
            rebalance_interval_ms: default_rebalance_interval_ms(),
            max_batch_size: default_max_batch_size(),
            receive_timeout_ms: default_receive_timeout_ms(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
            initial_position: InitialPosition::default(),
            retry: RetryConfig::default(),
        }
    }
}

impl HostOptions {
    pub fn lease_duration(&self) -> Duration {
        Duration::from_millis(self.lease_duration_ms)
    }

    pub fn renew_interval(&self) -> Duration {
        Duration::from_millis(self.renew_interval_ms)
    }

    pub fn rebalance_interval(&self) -> Duration {
        Duration::from_millis(self.rebalance_interval_ms)
    }

    pub fn receive_timeout(&self) -> Duration {
        Duration::from_millis(self.receive_timeout_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.lease_duration_ms == 0 {
            return Err(Error::Configuration(
                "Lease duration must be positive".into(),
            ));
        }
        if self.renew_interval_ms == 0 || self.renew_interval_ms >= self.lease_duration_ms {
            return Err(Error::Configuration(format!(
                "Renew interval ({}ms) must be positive and shorter than the lease duration ({}ms)",
                self.renew_interval_ms, self.lease_duration_ms
            )));
        }
        if self.rebalance_interval_ms == 0 {
            return Err(Error::Configuration(
                "Rebalance interval must be positive".into(),
            ));
        }
        if self.max_batch_size == 0 {
            return Err(Error::Configuration("Max batch size must be positive".into()));
        }
        if self.retry.max_attempts == 0 {
            return Err(Error::Configuration(
                "Retry max attempts must be positive".into(),
            ));
        }
        if self.renew_interval_ms.saturating_mul(2) > self.lease_duration_ms {
            tracing::warn!(
                renew_interval_ms = self.renew_interval_ms,
                lease_duration_ms = self.lease_duration_ms,
                "Renew interval leaves little headroom before leases expire"
            );
        }
        Ok(())
    }
}

/// Exponential backoff for transient failures.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RetryConfig {
    /// Delay before the first retry
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Upper bound on any single delay
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Total attempts, the first one included
    #[serde(default = "default_max_attempts")]
    pub max_attempts: usize,

    /// Spread delays by ±25% to avoid synchronized retries
    #[serde(default = "default_jitter")]
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            max_attempts: default_max_attempts(),
            jitter: default_jitter(),
        }
    }
}

impl RetryConfig {
    pub fn new(base_delay: Duration, max_delay: Duration, max_attempts: usize) -> Self {
        Self {
            base_delay_ms: base_delay.as_millis() as u64,
            max_delay_ms: max_delay.as_millis() as u64,
            max_attempts,
            jitter: true,
        }
    }

    /// Disable jitter (for testing).
    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    /// Backoff before retry number `attempt` (1-based): min(max, base * 2^(attempt-1)).
    pub fn calculate_delay(&self, attempt: usize) -> Duration {
        let exponent = attempt.saturating_sub(1).min(20) as u32;
        let delay_ms = self
            .base_delay_ms
            .saturating_mul(1u64 << exponent)
            .min(self.max_delay_ms);

        let final_delay_ms = if self.jitter && delay_ms > 0 {
            let spread = delay_ms / 4;
            rand::thread_rng().gen_range(delay_ms - spread..=delay_ms.saturating_add(spread))
        } else {
            delay_ms
        };

        Duration::from_millis(final_delay_ms)
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct MonitoringConfig {
    /// Log format
    #[serde(default)]
    pub log_format: LogFormat,
}

/// Log format.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Plain text format (default)
    #[default]
    Text,
    /// JSON format
    Json,
}

/// A random 32-character hex name, unique per host instance.
pub fn generate_host_name() -> String {
    let mut rng = rand::thread_rng();
    format!("{:016x}{:016x}", rng.gen::<u64>(), rng.gen::<u64>())
}

fn default_consumer_group() -> String {
    DEFAULT_CONSUMER_GROUP.to_string()
}
fn default_lease_duration_ms() -> u64 {
    30_000
}
fn default_renew_interval_ms() -> u64 {
    10_000
}
fn default_rebalance_interval_ms() -> u64 {
    10_000
}
fn default_max_batch_size() -> usize {
    10
}
fn default_receive_timeout_ms() -> u64 {
    1_000
}
fn default_shutdown_grace_ms() -> u64 {
    30_000
}
fn default_base_delay_ms() -> u64 {
    100
}
fn default_max_delay_ms() -> u64 {
    5_000
}
fn default_max_attempts() -> usize {
    5
}
fn default_jitter() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_toml_uses_defaults() {
        let config = Config::from_toml(
            r#"
            [host]
            event_hub_name = "telemetry"
            "#,
        )
        .unwrap();

        assert_eq!(config.host.event_hub_name, "telemetry");
        assert_eq!(config.host.consumer_group, "$Default");
        assert_eq!(config.host.host_name.len(), 32);
        assert_eq!(config.options.lease_duration_ms, 30_000);
        assert_eq!(config.options.initial_position, InitialPosition::Earliest);
        assert_eq!(config.monitoring.log_format, LogFormat::Text);
        config.validate().unwrap();
    }

    #[test]
    fn test_full_toml() {
        let config = Config::from_toml(
            r#"
            [host]
            host_name = "host-a"
            event_hub_name = "telemetry"
            consumer_group = "audit"

            [options]
            lease_duration_ms = 2000
            renew_interval_ms = 500
            max_batch_size = 64
            initial_position = "latest"

            [options.retry]
            max_attempts = 3
            jitter = false

            [monitoring]
            log_format = "json"
            "#,
        )
        .unwrap();

        assert_eq!(config.host.host_name, "host-a");
        assert_eq!(config.host.consumer_group, "audit");
        assert_eq!(config.options.lease_duration(), Duration::from_secs(2));
        assert_eq!(config.options.max_batch_size, 64);
        assert_eq!(config.options.initial_position, InitialPosition::Latest);
        assert_eq!(config.options.retry.max_attempts, 3);
        assert_eq!(config.options.retry.base_delay_ms, 100);
        assert!(!config.options.retry.jitter);
        assert_eq!(config.monitoring.log_format, LogFormat::Json);
    }

    #[test]
    fn test_missing_event_hub_fails_fast() {
        let err = Config::from_toml(
            r#"
            [host]
            event_hub_name = "  "
            "#,
        )
        .unwrap()
        .validate()
        .unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));

        let err = Config::from_toml("[host]\nhost_name = \"a\"\n").unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn test_renew_interval_must_be_shorter_than_lease() {
        let options = HostOptions {
            lease_duration_ms: 1_000,
            renew_interval_ms: 1_000,
            ..HostOptions::default()
        };
        assert!(matches!(options.validate(), Err(Error::Configuration(_))));
    }

    #[test]
    fn test_extreme_timings_do_not_overflow() {
        let options = HostOptions {
            lease_duration_ms: u64::MAX,
            renew_interval_ms: u64::MAX - 1,
            ..HostOptions::default()
        };
        assert!(options.validate().is_ok());

        let retry = RetryConfig {
            base_delay_ms: u64::MAX,
            max_delay_ms: u64::MAX,
            max_attempts: 3,
            jitter: true,
        };
        assert!(retry.calculate_delay(3) >= Duration::from_millis(u64::MAX - u64::MAX / 4));
    }

    #[test]
    fn test_calculate_delay_exponential() {
        let retry = RetryConfig::new(Duration::from_millis(100), Duration::from_secs(30), 10)
            .without_jitter();

        assert_eq!(retry.calculate_delay(1), Duration::from_millis(100));
        assert_eq!(retry.calculate_delay(2), Duration::from_millis(200));
        assert_eq!(retry.calculate_delay(3), Duration::from_millis(400));
        assert_eq!(retry.calculate_delay(4), Duration::from_millis(800));
    }

    #[test]
    fn test_calculate_delay_caps_and_does_not_overflow() {
        let retry = RetryConfig::new(Duration::from_millis(100), Duration::from_secs(1), 10)
            .without_jitter();

        assert_eq!(retry.calculate_delay(10), Duration::from_secs(1));
        assert_eq!(retry.calculate_delay(200), Duration::from_secs(1));
    }

    #[test]
    fn test_calculate_delay_with_jitter() {
        let retry = RetryConfig::new(Duration::from_millis(1000), Duration::from_secs(30), 10);

        let delay = retry.calculate_delay(1);
        assert!(delay >= Duration::from_millis(750), "{:?}", delay);
        assert!(delay <= Duration::from_millis(1250), "{:?}", delay);
    }
}
