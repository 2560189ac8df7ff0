//! Configuration module for the logtrace processes.
//!
//! Both the API process and the consumer process load the same `Config` from
//! environment variables; each uses the parts relevant to its role.

use std::env;
use std::time::Duration;

use thiserror::Error;

use crate::queue::StorageKind;

const DEFAULT_SERVICE_NAME: &str = "microservice";
const DEFAULT_ENVIRONMENT: &str = "development";
const DEFAULT_PORT: u16 = 8080;
const DEFAULT_NATS_URL: &str = "nats://localhost:4222";
const DEFAULT_STREAM_NAME: &str = "logs";
const DEFAULT_SUBJECT: &str = "logs.>";
const DEFAULT_CONSUMER_NAME: &str = "loki-consumer";
const DEFAULT_OTLP_ENDPOINT: &str = "http://localhost:4318/v1/traces";
const DEFAULT_LOKI_URL: &str = "http://localhost:3100/loki/api/v1/push";

/// 7 days
const DEFAULT_MAX_AGE: Duration = Duration::from_secs(7 * 24 * 60 * 60);

const DEFAULT_LOKI_TIMEOUT_SECS: u64 = 10;

/// Default number of records per flushed batch
const DEFAULT_BATCH_SIZE: usize = 100;

/// Default age after which a non-empty batch is flushed
const DEFAULT_BATCH_TIMEOUT_MS: u64 = 1_000;

/// Default time a single fetch waits for messages
const DEFAULT_FETCH_WAIT_MS: u64 = 500;

/// Maximum allowed batch size to prevent memory issues
const MAX_BATCH_SIZE: usize = 10_000;

/// Configuration shared by the API and consumer processes.
#[derive(Debug, Clone)]
pub struct Config {
    pub service_name: String,
    pub environment: String,
    pub port: u16,

    /// Broker URL
    pub nats_url: String,

    /// Durable topic (JetStream stream) name
    pub stream_name: String,

    /// Subject patterns bound to the topic
    pub subjects: Vec<String>,

    pub storage: StorageKind,

    /// Retention window for queued records
    pub max_age: Duration,

    pub replicas: usize,

    /// Durable consumer name used by the forwarder
    pub consumer_name: String,

    /// OTLP/HTTP traces endpoint; `None` disables span export
    pub otlp_endpoint: Option<String>,

    /// Loki push endpoint
    pub loki_url: String,

    pub loki_timeout: Duration,

    /// Number of records that triggers an immediate flush
    pub batch_size: usize,

    /// Age after which a non-empty batch is flushed
    pub batch_timeout: Duration,

    /// Upper bound on a single fetch from the queue
    pub fetch_wait: Duration,
}

/// Error type for configuration loading failures
#[derive(Debug, Error)]
#[error("Configuration error{}: {message}", var_suffix(.env_var))]
pub struct ConfigError {
    pub message: String,
    pub env_var: Option<String>,
}

fn var_suffix(env_var: &Option<String>) -> String {
    match env_var {
        Some(var) => format!(" for {}", var),
        None => String::new(),
    }
}

impl ConfigError {
    fn for_var(env_var: &str, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            env_var: Some(env_var.to_string()),
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Unset or empty variables fall back to defaults; set but invalid values
    /// are rejected.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` naming the offending variable.
    pub fn from_env() -> Result<Self, ConfigError> {
        let service_name = var_or("SERVICE_NAME", DEFAULT_SERVICE_NAME);
        let environment = var_or("ENVIRONMENT", DEFAULT_ENVIRONMENT);
        let port = parse_var("PORT", DEFAULT_PORT)?;

        let nats_url = var_or("NATS_URL", DEFAULT_NATS_URL);
        let stream_name = var_or("NATS_STREAM", DEFAULT_STREAM_NAME);
        let subjects = vec![var_or("NATS_SUBJECT", DEFAULT_SUBJECT)];
        let storage = Self::parse_storage()?;
        let max_age = match non_empty_var("NATS_MAX_AGE") {
            Some(value) => parse_duration(&value)
                .map_err(|message| ConfigError::for_var("NATS_MAX_AGE", message))?,
            None => DEFAULT_MAX_AGE,
        };
        let replicas = parse_var("NATS_REPLICAS", 1usize)?;
        if replicas == 0 {
            return Err(ConfigError::for_var(
                "NATS_REPLICAS",
                "replica count must be greater than 0",
            ));
        }
        let consumer_name = var_or("NATS_CONSUMER", DEFAULT_CONSUMER_NAME);

        // An explicitly empty endpoint turns span export off
        let otlp_endpoint = match env::var("OTLP_ENDPOINT") {
            Ok(value) if value.trim().is_empty() => None,
            Ok(value) => Some(value),
            Err(_) => Some(DEFAULT_OTLP_ENDPOINT.to_string()),
        };

        let loki_url = var_or("LOKI_URL", DEFAULT_LOKI_URL);
        let loki_timeout =
            Duration::from_secs(parse_var("LOKI_TIMEOUT_SECS", DEFAULT_LOKI_TIMEOUT_SECS)?);

        let batch_size = Self::parse_batch_size()?;
        let batch_timeout = Self::parse_millis("BATCH_TIMEOUT_MS", DEFAULT_BATCH_TIMEOUT_MS)?;
        let fetch_wait = Self::parse_millis("FETCH_WAIT_MS", DEFAULT_FETCH_WAIT_MS)?;

        Ok(Self {
            service_name,
            environment,
            port,
            nats_url,
            stream_name,
            subjects,
            storage,
            max_age,
            replicas,
            consumer_name,
            otlp_endpoint,
            loki_url,
            loki_timeout,
            batch_size,
            batch_timeout,
            fetch_wait,
        })
    }

    /// Subject the API process publishes its records on.
    pub fn log_subject(&self) -> String {
        format!("logs.{}", self.service_name)
    }

    /// Subject filter for the forwarder's consumer.
    pub fn filter_subject(&self) -> &str {
        self.subjects
            .first()
            .map(String::as_str)
            .unwrap_or(DEFAULT_SUBJECT)
    }

    fn parse_storage() -> Result<StorageKind, ConfigError> {
        match non_empty_var("NATS_STORAGE_TYPE").as_deref() {
            None | Some("file") => Ok(StorageKind::File),
            Some("memory") => Ok(StorageKind::Memory),
            Some(other) => Err(ConfigError::for_var(
                "NATS_STORAGE_TYPE",
                format!("'{}' is not a storage type (expected file or memory)", other),
            )),
        }
    }

    /// Parse batch size from environment variable with validation.
    fn parse_batch_size() -> Result<usize, ConfigError> {
        let env_var = "BATCH_SIZE";
        let batch_size = parse_var(env_var, DEFAULT_BATCH_SIZE)?;

        if batch_size == 0 {
            return Err(ConfigError::for_var(
                env_var,
                "batch size must be greater than 0",
            ));
        }

        if batch_size > MAX_BATCH_SIZE {
            return Err(ConfigError::for_var(
                env_var,
                format!(
                    "batch size {} exceeds maximum allowed ({})",
                    batch_size, MAX_BATCH_SIZE
                ),
            ));
        }

        Ok(batch_size)
    }

    fn parse_millis(env_var: &str, default: u64) -> Result<Duration, ConfigError> {
        let millis = parse_var(env_var, default)?;
        if millis == 0 {
            return Err(ConfigError::for_var(env_var, "duration must be greater than 0"));
        }
        Ok(Duration::from_millis(millis))
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            service_name: DEFAULT_SERVICE_NAME.to_string(),
            environment: DEFAULT_ENVIRONMENT.to_string(),
            port: DEFAULT_PORT,
            nats_url: DEFAULT_NATS_URL.to_string(),
            stream_name: DEFAULT_STREAM_NAME.to_string(),
            subjects: vec![DEFAULT_SUBJECT.to_string()],
            storage: StorageKind::File,
            max_age: DEFAULT_MAX_AGE,
            replicas: 1,
            consumer_name: DEFAULT_CONSUMER_NAME.to_string(),
            otlp_endpoint: Some(DEFAULT_OTLP_ENDPOINT.to_string()),
            loki_url: DEFAULT_LOKI_URL.to_string(),
            loki_timeout: Duration::from_secs(DEFAULT_LOKI_TIMEOUT_SECS),
            batch_size: DEFAULT_BATCH_SIZE,
            batch_timeout: Duration::from_millis(DEFAULT_BATCH_TIMEOUT_MS),
            fetch_wait: Duration::from_millis(DEFAULT_FETCH_WAIT_MS),
        }
    }
}

fn non_empty_var(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.is_empty())
}

fn var_or(key: &str, default: &str) -> String {
    non_empty_var(key).unwrap_or_else(|| default.to_string())
}

fn parse_var<T: std::str::FromStr>(key: &str, default: T) -> Result<T, ConfigError> {
    match non_empty_var(key) {
        Some(value) => value
            .parse()
            .map_err(|_| ConfigError::for_var(key, format!("'{}' is not a valid number", value))),
        None => Ok(default),
    }
}

/// Parse a duration written as a sequence of number+unit pairs, e.g. `168h`,
/// `1h30m`, `90s`, `250ms`.
pub fn parse_duration(input: &str) -> Result<Duration, String> {
    let input = input.trim();
    if input.is_empty() {
        return Err("empty duration".to_string());
    }

    let mut total = Duration::ZERO;
    let mut rest = input;
    while !rest.is_empty() {
        let digits = rest
            .find(|c: char| !c.is_ascii_digit())
            .ok_or_else(|| format!("'{}' is missing a unit", input))?;
        if digits == 0 {
            return Err(format!("'{}' is not a valid duration", input));
        }
        let value: u64 = rest[..digits]
            .parse()
            .map_err(|_| format!("'{}' is not a valid duration", input))?;
        rest = &rest[digits..];

        let unit_len = rest
            .find(|c: char| c.is_ascii_digit())
            .unwrap_or(rest.len());
        let part = match &rest[..unit_len] {
            "h" => Duration::from_secs(value.saturating_mul(3600)),
            "m" => Duration::from_secs(value.saturating_mul(60)),
            "s" => Duration::from_secs(value),
            "ms" => Duration::from_millis(value),
            unit => return Err(format!("unknown duration unit '{}' in '{}'", unit, input)),
        };
        total = total.saturating_add(part);
        rest = &rest[unit_len..];
    }

    Ok(total)
}
