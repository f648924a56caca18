//! Error taxonomy for the publish/consume clients.
//!
//! Each failure class has its own type so callers can tell apart what is
//! retried locally (transient connection trouble) from what terminates the
//! process (configuration and broker refusals).

use std::time::Duration;
use thiserror::Error;

/// Missing or unusable configuration. Always fatal; never retried.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required configuration: {key} is not set")]
    Missing { key: &'static str },

    #[error("malformed broker address: {reason}")]
    MalformedAddress { reason: String },

    #[error("invalid configuration for {key}: {message}")]
    Invalid { key: &'static str, message: String },

    #[error("could not read configuration: {0}")]
    Source(#[from] config::ConfigError),
}

/// Failures while establishing or holding a broker session.
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// The broker could not be reached or the handshake failed.
    #[error("broker unreachable: {0}")]
    Unreachable(String),

    /// An established session went away.
    #[error("connection lost: {0}")]
    Lost(String),

    /// The broker refused to declare part of the topology.
    #[error("broker rejected declaration of '{name}': {reason}")]
    TopologyRejected { name: String, reason: String },
}

impl ConnectionError {
    /// Transient errors are recovered by reconnecting with backoff.
    pub fn is_transient(&self) -> bool {
        !matches!(self, ConnectionError::TopologyRejected { .. })
    }
}

/// Outcome of a publish that did not end in a broker confirm.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PublishError {
    #[error("not connected to the broker")]
    Disconnected,

    #[error("broker rejected Message {sequence}: {reason}")]
    Rejected { sequence: u64, reason: String },

    #[error("no confirm for Message {sequence} within {timeout:?}")]
    Timeout { sequence: u64, timeout: Duration },
}

impl PublishError {
    /// Whether the message should be held back and sent again after a reconnect.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, PublishError::Rejected { .. })
    }
}

/// Failure raised by a delivery handler. The delivery is requeued.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct HandlerError {
    message: String,
}

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self { message: message.into() }
    }
}

impl From<&str> for HandlerError {
    fn from(s: &str) -> Self {
        HandlerError::new(s)
    }
}

impl From<String> for HandlerError {
    fn from(s: String) -> Self {
        HandlerError { message: s }
    }
}

impl From<std::io::Error> for HandlerError {
    fn from(e: std::io::Error) -> Self {
        HandlerError::new(e.to_string())
    }
}

/// Fatal errors returned by the application entry points.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Connection(#[from] ConnectionError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topology_rejection_is_not_transient() {
        let rejected = ConnectionError::TopologyRejected {
            name: "exchange.receiver".to_string(),
            reason: "PRECONDITION_FAILED".to_string(),
        };
        assert!(!rejected.is_transient());
        assert!(ConnectionError::Unreachable("refused".to_string()).is_transient());
        assert!(ConnectionError::Lost("heartbeat".to_string()).is_transient());
    }

    #[test]
    fn test_rejected_publish_is_not_retried() {
        let rejected = PublishError::Rejected { sequence: 3, reason: "nack".to_string() };
        assert!(!rejected.is_retryable());
        assert!(PublishError::Disconnected.is_retryable());
        assert!(PublishError::Timeout { sequence: 1, timeout: Duration::from_secs(1) }.is_retryable());
    }

    #[test]
    fn test_diagnostics_fit_on_one_line() {
        let errors: Vec<String> = vec![
            ConfigError::Missing { key: "AMQP_URL" }.to_string(),
            PublishError::Rejected { sequence: 7, reason: "NO_ROUTE".to_string() }.to_string(),
            HandlerError::from("bad payload").to_string(),
        ];
        for e in errors {
            assert!(!e.contains('\n'), "{e}");
        }
        assert_eq!(
            ConfigError::Missing { key: "AMQP_URL" }.to_string(),
            "missing required configuration: AMQP_URL is not set"
        );
    }
}
