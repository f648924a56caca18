//! Settings read from the process environment.
//!
//! Only `AMQP_URL` is required. Everything else has a default:
//!
//! | variable               | default  |
//! |------------------------|----------|
//! | `PUBLISH_INTERVAL_MS`  | 5000     |
//! | `CONFIRM_TIMEOUT_MS`   | 5000     |
//! | `RECONNECT_INITIAL_MS` | 500      |
//! | `RECONNECT_MAX_MS`     | 30000    |
//! | `BACKPRESSURE`         | `buffer` |
//! | `BACKLOG_CAPACITY`     | 1000     |
//! | `PREFETCH_COUNT`       | 1        |
//! | `SHUTDOWN_GRACE_MS`    | 500      |

use crate::consumer::ConsumerConfig;
use crate::error::ConfigError;
use crate::publisher::{BackpressurePolicy, PublisherConfig};
use crate::retry::ReconnectPolicy;
use crate::topology::Topology;
use config::{Config, Environment};
use lapin::uri::AMQPUri;
use serde::Deserialize;
use std::time::Duration;

/// Environment variable holding the broker address.
pub const AMQP_URL: &str = "AMQP_URL";

#[derive(Debug, Default, Deserialize)]
struct RawSettings {
    #[serde(alias = "AMQP_URL")]
    amqp_url: Option<String>,
    #[serde(alias = "PUBLISH_INTERVAL_MS")]
    publish_interval_ms: Option<u64>,
    #[serde(alias = "CONFIRM_TIMEOUT_MS")]
    confirm_timeout_ms: Option<u64>,
    #[serde(alias = "RECONNECT_INITIAL_MS")]
    reconnect_initial_ms: Option<u64>,
    #[serde(alias = "RECONNECT_MAX_MS")]
    reconnect_max_ms: Option<u64>,
    #[serde(alias = "BACKPRESSURE")]
    backpressure: Option<String>,
    #[serde(alias = "BACKLOG_CAPACITY")]
    backlog_capacity: Option<usize>,
    #[serde(alias = "PREFETCH_COUNT")]
    prefetch_count: Option<u16>,
    #[serde(alias = "SHUTDOWN_GRACE_MS")]
    shutdown_grace_ms: Option<u64>,
}

/// Validated settings for both programs.
#[derive(Debug, Clone)]
pub struct Settings {
    pub broker_uri: AMQPUri,
    pub topology: Topology,
    pub prefetch_count: u16,
    pub publisher: PublisherConfig,
    pub consumer: ConsumerConfig,
}

impl Settings {
    /// The environment source settings are read from.
    ///
    /// Tests swap the process environment for a fixed map with
    /// `Environment::source`.
    pub fn environment() -> Environment {
        Environment::default().try_parsing(true)
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_environment(Self::environment())
    }

    pub fn from_environment(source: Environment) -> Result<Self, ConfigError> {
        let raw: RawSettings = Config::builder()
            .add_source(source)
            .build()?
            .try_deserialize()?;
        Self::from_raw(raw)
    }

    fn from_raw(raw: RawSettings) -> Result<Self, ConfigError> {
        let address = raw
            .amqp_url
            .filter(|url| !url.trim().is_empty())
            .ok_or(ConfigError::Missing { key: AMQP_URL })?;
        let broker_uri = address
            .trim()
            .parse::<AMQPUri>()
            .map_err(|e| ConfigError::MalformedAddress { reason: e.to_string() })?;

        let interval = millis(raw.publish_interval_ms, 5000);
        if interval.is_zero() {
            return Err(invalid("PUBLISH_INTERVAL_MS", "must be greater than zero"));
        }

        let reconnect = ReconnectPolicy::new(
            millis(raw.reconnect_initial_ms, 500),
            millis(raw.reconnect_max_ms, 30_000),
        );
        if reconnect.initial_delay.is_zero() {
            return Err(invalid("RECONNECT_INITIAL_MS", "must be greater than zero"));
        }
        if reconnect.initial_delay > reconnect.max_delay {
            return Err(invalid(
                "RECONNECT_MAX_MS",
                "must not be smaller than RECONNECT_INITIAL_MS",
            ));
        }

        let backpressure = match raw.backpressure {
            Some(value) => value
                .parse::<BackpressurePolicy>()
                .map_err(|message| ConfigError::Invalid { key: "BACKPRESSURE", message })?,
            None => BackpressurePolicy::default(),
        };
        let backlog_capacity = raw.backlog_capacity.unwrap_or(1000);
        if backpressure == BackpressurePolicy::Buffer && backlog_capacity == 0 {
            return Err(invalid(
                "BACKLOG_CAPACITY",
                "must be greater than zero when BACKPRESSURE is 'buffer'",
            ));
        }

        let prefetch_count = raw.prefetch_count.unwrap_or(1);
        if prefetch_count == 0 {
            return Err(invalid("PREFETCH_COUNT", "must be greater than zero"));
        }

        let shutdown_grace = millis(raw.shutdown_grace_ms, 500);

        Ok(Settings {
            broker_uri,
            topology: Topology::default(),
            prefetch_count,
            publisher: PublisherConfig::builder()
                .interval(interval)
                .confirm_timeout(millis(raw.confirm_timeout_ms, 5000))
                .reconnect(reconnect.clone())
                .backpressure(backpressure)
                .backlog_capacity(backlog_capacity)
                .shutdown_grace(shutdown_grace)
                .build(),
            consumer: ConsumerConfig::builder()
                .reconnect(reconnect)
                .shutdown_grace(shutdown_grace)
                .build(),
        })
    }
}

fn millis(value: Option<u64>, default: u64) -> Duration {
    Duration::from_millis(value.unwrap_or(default))
}

fn invalid(key: &'static str, message: &str) -> ConfigError {
    ConfigError::Invalid { key, message: message.to_string() }
}
