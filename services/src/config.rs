//! Configuration management for the choreography participants.
//!
//! Loads configuration from environment variables with sensible defaults.
//! A value that is present but does not parse is an error rather than a
//! silent fallback to the default.

use std::env;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// A configuration variable is present but unusable.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// The value does not parse as the expected type.
    #[error("{var}={value:?} is invalid: {reason}")]
    Invalid {
        /// Environment variable name
        var: &'static str,
        /// Raw value
        value: String,
        /// Parser message
        reason: String,
    },
}

/// Application configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Broker connection
    pub kafka: KafkaConfig,
    /// Subscriber delivery behaviour
    pub delivery: DeliveryConfig,
    /// Prometheus exporter
    pub metrics: MetricsConfig,
    /// Stimuli published by the originating services
    pub origin: OriginConfig,
}

/// Kafka/Redpanda configuration
#[derive(Debug, Clone)]
pub struct KafkaConfig {
    /// Broker addresses (comma-separated)
    pub brokers: String,
    /// Client id reported to the broker
    pub client_id: String,
    /// Where a new consumer group starts: earliest or latest
    pub auto_offset_reset: String,
    /// Consumer session timeout in milliseconds
    pub session_timeout_ms: u64,
    /// Producer acknowledgment level: 0, 1 or all
    pub producer_acks: String,
    /// Publish timeout in milliseconds
    pub publish_timeout_ms: u64,
    /// Connection attempts at startup before giving up
    pub connect_max_retries: usize,
}

/// Subscriber delivery configuration
#[derive(Debug, Clone)]
pub struct DeliveryConfig {
    /// Redeliveries of a failing envelope before its partition is paused
    pub handler_max_retries: usize,
    /// First redelivery delay in milliseconds
    pub handler_retry_initial_ms: u64,
    /// Cap on the redelivery delay in milliseconds
    pub handler_retry_max_ms: u64,
    /// How long in-flight handlers may run after a shutdown signal
    pub shutdown_grace_secs: u64,
    /// Envelopes buffered per partition worker
    pub partition_buffer: usize,
    /// Envelope identities remembered for duplicate detection
    pub idempotency_capacity: usize,
}

/// Metrics server configuration
#[derive(Debug, Clone)]
pub struct MetricsConfig {
    /// Whether to start the Prometheus exporter
    pub enabled: bool,
    /// Host to bind to
    pub host: String,
    /// Port to bind to
    pub port: u16,
}

/// Values published by the originating services.
#[derive(Debug, Clone)]
pub struct OriginConfig {
    /// Registered passenger id
    pub passenger_id: u64,
    /// Registered passenger name
    pub passenger_name: String,
    /// Updated trip id
    pub trip_id: u64,
    /// Trip status to announce
    pub trip_status: String,
}

impl Config {
    /// Load configuration from the process environment.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] if a numeric or boolean variable does
    /// not parse.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| env::var(var).ok())
    }

    /// Load configuration through `lookup` instead of the process environment.
    ///
    /// # Errors
    ///
    /// See [`Config::from_env`].
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let vars = Vars(&lookup);

        Ok(Self {
            kafka: KafkaConfig {
                brokers: vars.string("KAFKA_BROKERS", "kafka:9092"),
                client_id: vars.string("KAFKA_CLIENT_ID", "smart-ticketing"),
                auto_offset_reset: vars.string("KAFKA_AUTO_OFFSET_RESET", "earliest"),
                session_timeout_ms: vars.parse("KAFKA_SESSION_TIMEOUT_MS", 6000)?,
                producer_acks: vars.string("KAFKA_PRODUCER_ACKS", "all"),
                publish_timeout_ms: vars.parse("KAFKA_PUBLISH_TIMEOUT_MS", 5000)?,
                connect_max_retries: vars.parse("CONNECT_MAX_RETRIES", 10)?,
            },
            delivery: DeliveryConfig {
                handler_max_retries: vars.parse("HANDLER_MAX_RETRIES", 3)?,
                handler_retry_initial_ms: vars.parse("HANDLER_RETRY_INITIAL_MS", 100)?,
                handler_retry_max_ms: vars.parse("HANDLER_RETRY_MAX_MS", 5000)?,
                shutdown_grace_secs: vars.parse("SHUTDOWN_GRACE_SECS", 10)?,
                partition_buffer: vars.parse("PARTITION_BUFFER", 64)?,
                idempotency_capacity: vars.parse("IDEMPOTENCY_CAPACITY", 10_000)?,
            },
            metrics: MetricsConfig {
                enabled: vars.parse("METRICS_ENABLED", false)?,
                host: vars.string("METRICS_HOST", "0.0.0.0"),
                port: vars.parse("METRICS_PORT", 9090)?,
            },
            origin: OriginConfig {
                passenger_id: vars.parse("PASSENGER_ID", 1)?,
                passenger_name: vars.string("PASSENGER_NAME", "Alice"),
                trip_id: vars.parse("TRIP_ID", 101)?,
                trip_status: vars.string("TRIP_STATUS", "DELAYED"),
            },
        })
    }

    /// Address the metrics exporter listens on.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] if `METRICS_HOST` is not an IP address.
    pub fn metrics_addr(&self) -> Result<SocketAddr, ConfigError> {
        format!("{}:{}", self.metrics.host, self.metrics.port)
            .parse::<SocketAddr>()
            .map_err(|e| ConfigError::Invalid {
                var: "METRICS_HOST",
                value: self.metrics.host.clone(),
                reason: e.to_string(),
            })
    }
}

impl KafkaConfig {
    /// Consumer session timeout.
    #[must_use]
    pub const fn session_timeout(&self) -> Duration {
        Duration::from_millis(self.session_timeout_ms)
    }

    /// Publish timeout.
    #[must_use]
    pub const fn publish_timeout(&self) -> Duration {
        Duration::from_millis(self.publish_timeout_ms)
    }
}

impl DeliveryConfig {
    /// First redelivery delay.
    #[must_use]
    pub const fn retry_initial(&self) -> Duration {
        Duration::from_millis(self.handler_retry_initial_ms)
    }

    /// Redelivery delay cap.
    #[must_use]
    pub const fn retry_max(&self) -> Duration {
        Duration::from_millis(self.handler_retry_max_ms)
    }

    /// Grace period for in-flight handlers.
    #[must_use]
    pub const fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

struct Vars<'a, F: Fn(&str) -> Option<String>>(&'a F);

impl<F: Fn(&str) -> Option<String>> Vars<'_, F> {
    fn string(&self, var: &str, default: &str) -> String {
        (self.0)(var)
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| default.to_string())
    }

    fn parse<T>(&self, var: &'static str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match (self.0)(var) {
            Some(raw) if !raw.trim().is_empty() => {
                raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
                    var,
                    value: raw,
                    reason: e.to_string(),
                })
            },
            _ => Ok(default),
        }
    }
}
