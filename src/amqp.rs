//! RabbitMQ links built on `lapin`.

use crate::connection::{ConsumeLink, Link, PublishLink};
use crate::error::{ConnectionError, PublishError};
use crate::message::{Confirmed, Delivery, Message};
use crate::topology::Topology;
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions, BasicQosOptions,
        ConfirmSelectOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
    },
    publisher_confirm::Confirmation,
    types::{AMQPValue, FieldTable},
    uri::AMQPUri,
    BasicProperties, Channel, Connection, ConnectionProperties, Consumer, ExchangeKind,
};
use std::time::Duration;
use tokio::time::timeout;

/// Header carrying the message sequence number.
pub const SEQUENCE_HEADER: &str = "x-sequence";
/// Header naming the publisher that numbered the message.
pub const ORIGIN_HEADER: &str = "x-origin";

/// How long a TCP connect and AMQP handshake may take by default.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

const PERSISTENT: u8 = 2;
const REPLY_SUCCESS: u16 = 200;

/// One connection and the single channel used on it.
struct Session {
    connection: Connection,
    channel: Channel,
}

impl Session {
    async fn open(
        uri: &AMQPUri,
        topology: &Topology,
        connect_timeout: Duration,
    ) -> Result<Self, ConnectionError> {
        log::info!(
            "Connecting to RabbitMQ at {}:{} (vhost '{}')",
            uri.authority.host,
            uri.authority.port,
            uri.vhost
        );
        let connecting = Connection::connect_uri(uri.clone(), ConnectionProperties::default());
        let connection = timeout(connect_timeout, connecting)
            .await
            .map_err(|_| {
                ConnectionError::Unreachable(format!("no answer within {:?}", connect_timeout))
            })?
            .map_err(|e| ConnectionError::Unreachable(e.to_string()))?;
        let channel = connection.create_channel().await.map_err(lost)?;

        let session = Self { connection, channel };
        session.declare(topology).await?;
        Ok(session)
    }

    /// Declares the exchange and queue, and binds them together.
    async fn declare(&self, topology: &Topology) -> Result<(), ConnectionError> {
        self.channel
            .exchange_declare(
                &topology.exchange,
                ExchangeKind::Fanout,
                ExchangeDeclareOptions { durable: true, ..Default::default() },
                FieldTable::default(),
            )
            .await
            .map_err(|e| declare_error(&topology.exchange, e))?;

        self.channel
            .queue_declare(
                &topology.queue,
                QueueDeclareOptions { durable: true, ..Default::default() },
                FieldTable::default(),
            )
            .await
            .map_err(|e| declare_error(&topology.queue, e))?;

        self.channel
            .queue_bind(
                &topology.queue,
                &topology.exchange,
                &topology.routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| declare_error(&topology.queue, e))?;

        log::info!(
            "Queue '{}' and exchange '{}' are set up and bound.",
            topology.queue,
            topology.exchange
        );
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.connection.status().connected() && self.channel.status().connected()
    }

    async fn close(self) {
        if self.channel.status().connected() {
            if let Err(e) = self.channel.close(REPLY_SUCCESS, "closing").await {
                log::debug!("Closing channel failed: {}", e);
            }
        }
        if self.connection.status().connected() {
            if let Err(e) = self.connection.close(REPLY_SUCCESS, "closing").await {
                log::debug!("Closing connection failed: {}", e);
            }
        }
    }
}

fn lost(e: lapin::Error) -> ConnectionError {
    ConnectionError::Lost(e.to_string())
}

/// A protocol error on declare means the broker refused it; anything else is
/// the connection going away underneath us.
fn declare_error(name: &str, e: lapin::Error) -> ConnectionError {
    match e {
        lapin::Error::ProtocolError(_) => ConnectionError::TopologyRejected {
            name: name.to_string(),
            reason: e.to_string(),
        },
        other => lost(other),
    }
}

/// AMQP properties for an outgoing message.
pub fn message_properties(message: &Message) -> BasicProperties {
    let mut headers = FieldTable::default();
    // Beyond i64 the number travels in the message id only.
    if let Ok(sequence) = i64::try_from(message.sequence()) {
        headers.insert(SEQUENCE_HEADER.into(), AMQPValue::LongLongInt(sequence));
    }
    if !message.origin().is_empty() {
        headers.insert(
            ORIGIN_HEADER.into(),
            AMQPValue::LongString(message.origin().into()),
        );
    }

    BasicProperties::default()
        .with_content_type("text/plain".into())
        .with_delivery_mode(PERSISTENT)
        .with_timestamp(message.created_at().timestamp().max(0) as u64)
        .with_message_id(message.sequence().to_string().into())
        .with_headers(headers)
}

/// Extracts the sequence number from the `x-sequence` header, falling back to the message id.
pub fn sequence_from_properties(properties: &BasicProperties) -> Option<u64> {
    let from_header = properties.headers().as_ref().and_then(|headers| {
        match headers.inner().get(SEQUENCE_HEADER) {
            Some(AMQPValue::LongLongInt(n)) => u64::try_from(*n).ok(),
            Some(AMQPValue::LongInt(n)) => u64::try_from(*n).ok(),
            Some(AMQPValue::LongUInt(n)) => Some(u64::from(*n)),
            Some(AMQPValue::ShortInt(n)) => u64::try_from(*n).ok(),
            Some(AMQPValue::ShortUInt(n)) => Some(u64::from(*n)),
            _ => None,
        }
    });

    from_header.or_else(|| {
        properties
            .message_id()
            .as_ref()
            .and_then(|id| id.as_str().parse().ok())
    })
}

/// Extracts the publisher origin from the `x-origin` header.
pub fn origin_from_properties(properties: &BasicProperties) -> Option<String> {
    let headers = properties.headers().as_ref()?;
    match headers.inner().get(ORIGIN_HEADER)? {
        AMQPValue::LongString(origin) => Some(String::from_utf8_lossy(origin.as_bytes()).into_owned()),
        AMQPValue::ShortString(origin) => Some(origin.as_str().to_string()),
        _ => None,
    }
}

/// Maps a publisher confirm to the publish outcome.
pub fn confirmation_outcome(
    sequence: u64,
    confirmation: Confirmation,
) -> Result<Confirmed, PublishError> {
    match confirmation {
        Confirmation::Ack(None) => Ok(Confirmed { sequence }),
        Confirmation::Ack(Some(returned)) => Err(PublishError::Rejected {
            sequence,
            reason: format!(
                "unroutable, returned with {} {}",
                returned.reply_code,
                returned.reply_text.as_str()
            ),
        }),
        Confirmation::Nack(_) => Err(PublishError::Rejected {
            sequence,
            reason: "negatively acknowledged by the broker".to_string(),
        }),
        Confirmation::NotRequested => Err(PublishError::Rejected {
            sequence,
            reason: "publisher confirms are not enabled on the channel".to_string(),
        }),
    }
}

fn into_delivery(delivery: lapin::message::Delivery) -> Delivery {
    Delivery {
        delivery_tag: delivery.delivery_tag,
        redelivered: delivery.redelivered,
        sequence: sequence_from_properties(&delivery.properties),
        origin: origin_from_properties(&delivery.properties),
        content_type: delivery
            .properties
            .content_type()
            .as_ref()
            .map(|c| c.as_str().to_string()),
        exchange: delivery.exchange.as_str().to_string(),
        routing_key: delivery.routing_key.as_str().to_string(),
        payload: delivery.data,
    }
}

/// Publishing side: a confirm-mode channel on its own connection.
pub struct AmqpPublishLink {
    uri: AMQPUri,
    topology: Topology,
    connect_timeout: Duration,
    session: Option<Session>,
}

impl AmqpPublishLink {
    pub fn new(uri: AMQPUri, topology: Topology) -> Self {
        Self {
            uri,
            topology,
            connect_timeout: CONNECT_TIMEOUT,
            session: None,
        }
    }

    /// Defaults to [`CONNECT_TIMEOUT`].
    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }
}

#[async_trait]
impl Link for AmqpPublishLink {
    async fn open(&mut self) -> Result<(), ConnectionError> {
        self.close().await;
        let session = Session::open(&self.uri, &self.topology, self.connect_timeout).await?;
        session
            .channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(lost)?;
        self.session = Some(session);
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.session.as_ref().is_some_and(Session::is_open)
    }

    async fn close(&mut self) {
        if let Some(session) = self.session.take() {
            session.close().await;
        }
    }
}

#[async_trait]
impl PublishLink for AmqpPublishLink {
    async fn publish(&mut self, message: &Message) -> Result<Confirmed, PublishError> {
        let session = self.session.as_ref().ok_or(PublishError::Disconnected)?;

        // Mandatory, so a message no queue is bound for comes back instead of vanishing.
        let confirm = session
            .channel
            .basic_publish(
                &self.topology.exchange,
                &self.topology.routing_key,
                BasicPublishOptions { mandatory: true, ..Default::default() },
                message.payload(),
                message_properties(message),
            )
            .await
            .map_err(|e| {
                log::debug!("Publishing Message {} failed: {}", message.sequence(), e);
                PublishError::Disconnected
            })?;

        let confirmation = confirm.await.map_err(|e| {
            log::debug!("Waiting for confirm of Message {} failed: {}", message.sequence(), e);
            PublishError::Disconnected
        })?;
        confirmation_outcome(message.sequence(), confirmation)
    }
}

/// Consuming side: a QoS-limited subscription with manual acknowledgments.
pub struct AmqpConsumeLink {
    uri: AMQPUri,
    topology: Topology,
    prefetch_count: u16,
    consumer_tag: String,
    connect_timeout: Duration,
    session: Option<Session>,
    consumer: Option<Consumer>,
}

impl AmqpConsumeLink {
    pub fn new(uri: AMQPUri, topology: Topology, prefetch_count: u16) -> Self {
        let consumer_tag = format!("{}_consumer_{}", topology.queue, std::process::id());
        Self {
            uri,
            topology,
            prefetch_count,
            consumer_tag,
            connect_timeout: CONNECT_TIMEOUT,
            session: None,
            consumer: None,
        }
    }

    /// Defaults to [`CONNECT_TIMEOUT`].
    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    fn channel(&self) -> Result<&Channel, ConnectionError> {
        self.session
            .as_ref()
            .map(|session| &session.channel)
            .ok_or_else(|| ConnectionError::Lost("no open channel".to_string()))
    }
}

#[async_trait]
impl Link for AmqpConsumeLink {
    async fn open(&mut self) -> Result<(), ConnectionError> {
        self.close().await;
        let session = Session::open(&self.uri, &self.topology, self.connect_timeout).await?;

        session
            .channel
            .basic_qos(self.prefetch_count, BasicQosOptions::default())
            .await
            .map_err(lost)?;
        log::info!("QoS prefetch count set to {}", self.prefetch_count);

        let consumer = session
            .channel
            .basic_consume(
                &self.topology.queue,
                &self.consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| declare_error(&self.topology.queue, e))?;
        log::info!("Subscribed to '{}' with tag '{}'", self.topology.queue, consumer.tag().as_str());

        self.session = Some(session);
        self.consumer = Some(consumer);
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.consumer.is_some() && self.session.as_ref().is_some_and(Session::is_open)
    }

    async fn close(&mut self) {
        self.consumer = None;
        if let Some(session) = self.session.take() {
            session.close().await;
        }
    }
}

#[async_trait]
impl ConsumeLink for AmqpConsumeLink {
    async fn next_delivery(&mut self) -> Option<Result<Delivery, ConnectionError>> {
        let consumer = self.consumer.as_mut()?;
        match consumer.next().await? {
            Ok(delivery) => Some(Ok(into_delivery(delivery))),
            Err(e) => Some(Err(lost(e))),
        }
    }

    async fn ack(&mut self, delivery_tag: u64) -> Result<(), ConnectionError> {
        self.channel()?
            .basic_ack(delivery_tag, BasicAckOptions::default())
            .await
            .map_err(lost)
    }

    async fn nack(&mut self, delivery_tag: u64, requeue: bool) -> Result<(), ConnectionError> {
        self.channel()?
            .basic_nack(delivery_tag, BasicNackOptions { requeue, ..Default::default() })
            .await
            .map_err(lost)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_properties_carry_sequence_and_persistence() {
        let properties = message_properties(&Message::numbered(42));

        assert_eq!(sequence_from_properties(&properties), Some(42));
        assert_eq!(*properties.delivery_mode(), Some(PERSISTENT));
        assert_eq!(
            properties.content_type().as_ref().map(|c| c.as_str()),
            Some("text/plain")
        );
        assert!(properties.timestamp().is_some());
    }

    #[test]
    fn test_origin_survives_the_headers() {
        let message = Message::numbered(0).with_origin("4242-1700000000-0");
        let properties = message_properties(&message);

        assert_eq!(
            origin_from_properties(&properties).as_deref(),
            Some("4242-1700000000-0")
        );
        assert_eq!(origin_from_properties(&BasicProperties::default()), None);
    }

    #[test]
    fn test_sequence_beyond_header_range_uses_message_id() {
        let properties = message_properties(&Message::numbered(u64::MAX));

        let headers = properties.headers().as_ref().unwrap();
        assert!(headers.inner().get(SEQUENCE_HEADER).is_none());
        assert_eq!(sequence_from_properties(&properties), Some(u64::MAX));
    }

    #[tokio::test]
    async fn test_silent_broker_times_out_as_unreachable() {
        // Accepts TCP connections but never speaks AMQP.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let uri: AMQPUri = format!("amqp://127.0.0.1:{}/%2f", port).parse().unwrap();
        let mut link = AmqpPublishLink::new(uri, Topology::default())
            .with_connect_timeout(Duration::from_millis(200));

        let err = link.open().await.unwrap_err();

        assert!(matches!(err, ConnectionError::Unreachable(_)), "{err}");
        assert!(err.is_transient());
        assert!(!link.is_open());
    }

    #[test]
    fn test_sequence_from_narrow_header_types() {
        let mut headers = FieldTable::default();
        headers.insert(SEQUENCE_HEADER.into(), AMQPValue::LongInt(7));
        let properties = BasicProperties::default().with_headers(headers);

        assert_eq!(sequence_from_properties(&properties), Some(7));
    }

    #[test]
    fn test_sequence_falls_back_to_message_id() {
        let properties = BasicProperties::default().with_message_id("12".into());
        assert_eq!(sequence_from_properties(&properties), Some(12));
    }

    #[test]
    fn test_foreign_messages_have_no_sequence() {
        let mut headers = FieldTable::default();
        headers.insert(SEQUENCE_HEADER.into(), AMQPValue::LongInt(-1));
        let properties = BasicProperties::default()
            .with_headers(headers)
            .with_message_id("order-17".into());

        assert_eq!(sequence_from_properties(&properties), None);
        assert_eq!(sequence_from_properties(&BasicProperties::default()), None);
    }

    #[test]
    fn test_confirmation_outcomes() {
        assert_eq!(
            confirmation_outcome(3, Confirmation::Ack(None)),
            Ok(Confirmed { sequence: 3 })
        );
        assert!(matches!(
            confirmation_outcome(3, Confirmation::Nack(None)),
            Err(PublishError::Rejected { sequence: 3, .. })
        ));
        assert!(matches!(
            confirmation_outcome(3, Confirmation::NotRequested),
            Err(PublishError::Rejected { sequence: 3, .. })
        ));
    }
}
