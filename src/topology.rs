//! Names shared by the publisher and the consumer.
//!
//! Both sides must agree on these exactly. A consumer reading from a
//! different queue than the publisher binds simply never sees a message.

/// Fanout exchange both sides declare.
pub const EXCHANGE: &str = "exchange";

/// Queue bound to [`EXCHANGE`] that consumers read from.
pub const QUEUE: &str = "exchange.receiver";

/// Routing key used when publishing. Ignored by the fanout exchange.
pub const ROUTING_KEY: &str = "exchange.example";

/// Exchange, queue and binding declared before publishing or consuming.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    pub exchange: String,
    pub queue: String,
    pub routing_key: String,
}

impl Topology {
    /// Topology for a custom queue on the shared exchange.
    pub fn for_queue(queue: impl Into<String>) -> Self {
        Self {
            queue: queue.into(),
            ..Self::default()
        }
    }
}

impl Default for Topology {
    fn default() -> Self {
        Self {
            exchange: EXCHANGE.to_string(),
            queue: QUEUE.to_string(),
            routing_key: ROUTING_KEY.to_string(),
        }
    }
}
