//! # RabbitMQ Relay
//! Reliable RabbitMQ publish/consume clients: publisher confirms, manual
//! acknowledgments and reconnects with bounded exponential backoff.

pub mod amqp;
pub mod app;
pub mod connection;
pub mod consumer;
pub mod error;
pub mod handler;
pub mod message;
pub mod publisher;
pub mod retry;
pub mod settings;
pub mod topology;

// Re-export key components for easy access
pub use amqp::{AmqpConsumeLink, AmqpPublishLink};
pub use connection::{ConnectionState, ConsumeLink, Link, PublishLink, Reconnector};
pub use consumer::{ConsumeStats, Consumer, ConsumerConfig};
pub use error::{ConfigError, ConnectionError, Error, HandlerError, PublishError};
pub use handler::{handler_fn, Ack, Deduplicate, DeliveryHandler, PrintHandler};
pub use message::{Confirmed, Delivery, Message, MessageTicker, Sequencer};
pub use publisher::{BackpressurePolicy, PublishStats, Publisher, PublisherConfig};
pub use retry::ReconnectPolicy;
pub use settings::Settings;
pub use topology::{Topology, EXCHANGE, QUEUE, ROUTING_KEY};
