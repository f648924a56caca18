//! Queue consumer that acknowledges each delivery only after it was handled.

use crate::connection::{grace_expired, ConsumeLink, Reconnector};
use crate::error::ConnectionError;
use crate::handler::{Ack, DeliveryHandler};
use crate::message::Delivery;
use crate::retry::ReconnectPolicy;
use std::time::Duration;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

/// Configuration for a [`Consumer`].
///
/// Use the `ConsumerConfig::builder()` method to construct this struct.
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// Backoff between reconnect attempts.
    pub reconnect: ReconnectPolicy,
    /// How long the delivery being handled may take to settle after a stop signal.
    pub shutdown_grace: Duration,
}

impl ConsumerConfig {
    pub fn builder() -> ConsumerConfigBuilder {
        ConsumerConfigBuilder::default()
    }
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// A builder for creating `ConsumerConfig` instances.
#[derive(Default)]
pub struct ConsumerConfigBuilder {
    reconnect: Option<ReconnectPolicy>,
    shutdown_grace: Option<Duration>,
}

impl ConsumerConfigBuilder {
    /// Defaults to `ReconnectPolicy::default()`.
    pub fn reconnect(mut self, reconnect: ReconnectPolicy) -> Self {
        self.reconnect = Some(reconnect);
        self
    }

    /// Defaults to 500 milliseconds.
    pub fn shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = Some(grace);
        self
    }

    pub fn build(self) -> ConsumerConfig {
        ConsumerConfig {
            reconnect: self.reconnect.unwrap_or_default(),
            shutdown_grace: self.shutdown_grace.unwrap_or(Duration::from_millis(500)),
        }
    }
}

/// Counters reported when a consumer stops.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConsumeStats {
    pub acked: u64,
    pub requeued: u64,
    /// Deliveries left unsettled because the shutdown grace period ran out.
    pub abandoned: u64,
    pub reconnects: u64,
}

/// Reads deliveries from one queue and settles each through a [`DeliveryHandler`].
///
/// Other consumers may read the same queue; the broker hands each delivery
/// to one of them at a time.
pub struct Consumer<L: ConsumeLink, H: DeliveryHandler> {
    link: L,
    handler: H,
    config: ConsumerConfig,
    reconnector: Reconnector,
    stats: ConsumeStats,
}

impl<L: ConsumeLink, H: DeliveryHandler> Consumer<L, H> {
    /// Connects `link` and starts the subscription, retrying transient
    /// failures with backoff.
    pub async fn subscribe(
        mut link: L,
        handler: H,
        config: ConsumerConfig,
        shutdown: &CancellationToken,
    ) -> Result<Self, ConnectionError> {
        let mut reconnector = Reconnector::new("consumer", config.reconnect.clone());
        reconnector.connect(&mut link, shutdown).await?;
        log::info!(
            "Consumer started with handler '{}'. Waiting for messages...",
            handler.handler_name()
        );
        Ok(Self {
            link,
            handler,
            config,
            reconnector,
            stats: ConsumeStats::default(),
        })
    }

    /// Handles deliveries until `shutdown` fires, resubscribing after connection loss.
    ///
    /// Returns an error only when a reconnect fails fatally.
    pub async fn run(mut self, shutdown: CancellationToken) -> Result<ConsumeStats, ConnectionError> {
        loop {
            if !self.link.is_open() {
                self.reconnector.lost();
                if !self.reconnector.connect(&mut self.link, &shutdown).await? {
                    break;
                }
                continue;
            }

            let next = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                next = self.link.next_delivery() => next,
            };

            match next {
                Some(Ok(delivery)) => self.process(delivery, &shutdown).await,
                Some(Err(e)) => {
                    log::warn!("Subscription interrupted: {}", e);
                    self.connection_failed().await;
                }
                None => {
                    log::warn!("Broker ended the subscription");
                    self.connection_failed().await;
                }
            }
        }

        self.shut_down().await;
        Ok(self.stats())
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    pub fn stats(&self) -> ConsumeStats {
        ConsumeStats {
            reconnects: self.reconnector.reconnects(),
            ..self.stats.clone()
        }
    }

    /// Handles and settles one delivery, giving up `shutdown_grace` after a stop signal.
    async fn process(&mut self, delivery: Delivery, shutdown: &CancellationToken) {
        let tag = delivery.delivery_tag;
        let grace = self.config.shutdown_grace;

        let settled = tokio::select! {
            settled = self.settle(&delivery) => Some(settled),
            _ = grace_expired(shutdown, grace) => None,
        };

        match settled {
            Some(Ok(())) => {}
            Some(Err(e)) => {
                log::warn!(
                    "Could not settle delivery {}: {}. The broker will redeliver it",
                    tag,
                    e
                );
                self.connection_failed().await;
            }
            None => {
                log::warn!(
                    "Shutdown grace of {:?} elapsed while handling delivery {}. Left unacknowledged for redelivery",
                    grace,
                    tag
                );
                self.stats.abandoned += 1;
            }
        }
    }

    async fn settle(&mut self, delivery: &Delivery) -> Result<(), ConnectionError> {
        let tag = delivery.delivery_tag;
        if delivery.redelivered {
            log::debug!("Delivery {} is a redelivery", tag);
        }

        match self.handler.handle(delivery).await {
            Ok(Ack) => {
                self.link.ack(tag).await?;
                self.stats.acked += 1;
                log::debug!("Delivery {} acknowledged", tag);
            }
            Err(e) => {
                log::error!(
                    "Handler '{}' failed for delivery {}: {}. Requeueing",
                    self.handler.handler_name(),
                    tag,
                    e
                );
                self.link.nack(tag, true).await?;
                self.stats.requeued += 1;
            }
        }
        Ok(())
    }

    async fn connection_failed(&mut self) {
        self.reconnector.lost();
        self.link.close().await;
    }

    async fn shut_down(&mut self) {
        self.reconnector.shutting_down();
        if timeout(self.config.shutdown_grace, self.link.close()).await.is_err() {
            log::warn!(
                "Broker connection did not close within {:?}",
                self.config.shutdown_grace
            );
        }
        log::info!("Consumer stopped");
    }
}
