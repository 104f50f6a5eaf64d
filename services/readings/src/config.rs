use serde::Deserialize;
use std::time::Duration;
use tracing::warn;

/// Main configuration for the readings service
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Service configuration
    pub service: ServiceConfig,
    /// Kafka configuration
    pub kafka: KafkaConfig,
    /// Store backend configuration
    pub store: StoreConfig,
    /// Pipeline tunables
    #[serde(default)]
    pub pipeline: PipelineConfig,
}

/// Service-level configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Service name for logging/metrics
    #[serde(default = "default_service_name")]
    pub name: String,
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Metrics port
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
}

/// Kafka consumer configuration
#[derive(Debug, Clone, Deserialize)]
pub struct KafkaConfig {
    /// Kafka bootstrap servers
    pub bootstrap_servers: String,
    /// Consumer group ID
    #[serde(default = "default_consumer_group")]
    pub consumer_group: String,
    /// Topic carrying sensor reading messages
    #[serde(default = "default_readings_topic")]
    pub readings_topic: String,
    /// Enable SSL
    #[serde(default)]
    pub ssl_enabled: bool,
    /// SSL CA certificate path
    pub ssl_ca_location: Option<String>,
    /// SASL username
    pub sasl_username: Option<String>,
    /// SASL password
    pub sasl_password: Option<String>,
    /// Auto offset reset policy
    #[serde(default = "default_auto_offset_reset")]
    pub auto_offset_reset: String,
    /// Session timeout in milliseconds
    #[serde(default = "default_session_timeout_ms")]
    pub session_timeout_ms: u32,
    /// Max poll interval in milliseconds
    #[serde(default = "default_max_poll_interval_ms")]
    pub max_poll_interval_ms: u32,
    /// Pause before a message that failed with a retryable error is redelivered
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
}

/// Which partition store implementation to run against
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    #[default]
    Postgres,
    /// Process-local store; data is lost on restart
    Memory,
}

/// Store configuration
#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,
    /// Required for the postgres backend
    pub database: Option<DatabaseConfig>,
}

/// Database configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL
    pub url: String,
    /// Maximum number of connections in the pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Minimum number of connections in the pool
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
    /// Connection timeout in seconds
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Idle connection timeout in seconds
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    /// Run migrations on startup
    #[serde(default = "default_true")]
    pub run_migrations: bool,
}

/// What the throttle does when it cannot look up the last reading
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ThrottleFallback {
    /// Record the reading anyway
    #[default]
    FailOpen,
    /// Drop the reading
    FailClosed,
}

/// What to do when a newly seen sensor cannot be written to the registry
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum SensorCreationPolicy {
    /// Log it and keep going with the in-memory sensor
    #[default]
    Proceed,
    /// Fail the message
    Abort,
}

/// Pipeline tunables
#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    /// Wait after creating a partition, as a duration string ("30s", "1m30s", "500ms")
    #[serde(default = "default_partition_settle")]
    pub partition_settle: String,
    /// Jitter allowed below a sensor's sample frequency
    #[serde(default = "default_sample_frequency_tolerance_secs")]
    pub sample_frequency_tolerance_secs: i64,
    #[serde(default)]
    pub throttle_fallback: ThrottleFallback,
    #[serde(default)]
    pub sensor_creation: SensorCreationPolicy,
    /// Re-read/re-merge attempts when the hourly aggregate changes concurrently
    #[serde(default = "default_aggregate_conflict_retries")]
    pub aggregate_conflict_retries: u32,
}

// Default value functions
fn default_service_name() -> String {
    "readings-service".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_consumer_group() -> String {
    "readings-service".to_string()
}

fn default_readings_topic() -> String {
    "sensor.readings".to_string()
}

fn default_auto_offset_reset() -> String {
    "earliest".to_string()
}

fn default_session_timeout_ms() -> u32 {
    30000
}

fn default_max_poll_interval_ms() -> u32 {
    300000
}

fn default_retry_backoff_ms() -> u64 {
    1000
}

fn default_max_connections() -> u32 {
    10
}

fn default_min_connections() -> u32 {
    2
}

fn default_connect_timeout_secs() -> u64 {
    30
}

fn default_idle_timeout_secs() -> u64 {
    600
}

fn default_true() -> bool {
    true
}

fn default_partition_settle() -> String {
    "30s".to_string()
}

fn default_sample_frequency_tolerance_secs() -> i64 {
    3
}

fn default_aggregate_conflict_retries() -> u32 {
    5
}

/// Settle wait used when `partition_settle` is missing or unparseable
pub const DEFAULT_PARTITION_SETTLE: Duration = Duration::from_secs(30);

impl Config {
    /// Load configuration from environment and config files
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            // Start with default values
            .set_default("service.name", "readings-service")?
            .set_default("service.log_level", "info")?
            .set_default("service.metrics_port", 9090)?
            .set_default("store.backend", "postgres")?
            // Add config file if present
            .add_source(config::File::with_name("config/readings").required(false))
            .add_source(config::File::with_name("/etc/readings/readings").required(false))
            // Override with environment variables
            // READINGS__PIPELINE__PARTITION_SETTLE -> pipeline.partition_settle
            .add_source(
                config::Environment::with_prefix("READINGS")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = config.try_deserialize()?;

        if config.store.backend == StoreBackend::Postgres && config.store.database.is_none() {
            anyhow::bail!("store.database must be set for the postgres backend");
        }

        Ok(config)
    }
}

impl PipelineConfig {
    /// Parsed settle wait; invalid values fall back to 30s
    pub fn partition_settle(&self) -> Duration {
        match parse_duration(&self.partition_settle) {
            Some(d) => d,
            None => {
                warn!(
                    value = %self.partition_settle,
                    default_secs = DEFAULT_PARTITION_SETTLE.as_secs(),
                    "Invalid partition settle duration, using default"
                );
                DEFAULT_PARTITION_SETTLE
            }
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            partition_settle: default_partition_settle(),
            sample_frequency_tolerance_secs: default_sample_frequency_tolerance_secs(),
            throttle_fallback: ThrottleFallback::default(),
            sensor_creation: SensorCreationPolicy::default(),
            aggregate_conflict_retries: default_aggregate_conflict_retries(),
        }
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            log_level: default_log_level(),
            metrics_port: default_metrics_port(),
        }
    }
}

/// Parse a duration string made of `<number><unit>` terms, e.g. `"30s"`,
/// `"1m30s"`, `"1.5h"` or `"250ms"`.
///
/// Units: `ns`, `us`, `µs`, `ms`, `s`, `m`, `h`. A bare `"0"` is allowed.
pub fn parse_duration(input: &str) -> Option<Duration> {
    let s = input.trim();
    if s == "0" {
        return Some(Duration::ZERO);
    }
    if s.is_empty() {
        return None;
    }

    let mut total = 0f64;
    let mut rest = s;
    while !rest.is_empty() {
        let num_len = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(rest.len());
        if num_len == 0 {
            return None;
        }
        let value: f64 = rest[..num_len].parse().ok()?;
        rest = &rest[num_len..];

        let unit_len = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let nanos_per_unit = match &rest[..unit_len] {
            "ns" => 1.0,
            "us" | "µs" => 1e3,
            "ms" => 1e6,
            "s" => 1e9,
            "m" => 60e9,
            "h" => 3600e9,
            _ => return None,
        };
        rest = &rest[unit_len..];

        total += value * nanos_per_unit;
    }

    if !total.is_finite() || total > u64::MAX as f64 {
        return None;
    }
    Some(Duration::from_nanos(total as u64))
}
