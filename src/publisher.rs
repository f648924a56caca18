//! Timed publisher with publisher confirms, reconnects and a backpressure policy.

use crate::connection::{grace_expired, Attempt, PublishLink, Reconnector};
use crate::error::{ConnectionError, PublishError};
use crate::message::{Confirmed, Message, MessageTicker};
use crate::retry::ReconnectPolicy;
use std::collections::VecDeque;
use std::str::FromStr;
use std::time::Duration;
use tokio::time::{interval_at, sleep_until, timeout, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// What happens to messages generated while the broker is unreachable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackpressurePolicy {
    /// Hold them in a bounded backlog and send them, in order, after reconnecting.
    #[default]
    Buffer,
    /// Drop them with a warning.
    Drop,
}

impl FromStr for BackpressurePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "buffer" => Ok(BackpressurePolicy::Buffer),
            "drop" => Ok(BackpressurePolicy::Drop),
            other => Err(format!("expected 'buffer' or 'drop', got '{}'", other)),
        }
    }
}

/// Configuration for a [`Publisher`].
///
/// Use the `PublisherConfig::builder()` method to construct this struct.
#[derive(Debug, Clone)]
pub struct PublisherConfig {
    /// Time between two generated messages.
    pub interval: Duration,
    /// How long to wait for the broker to confirm a message.
    pub confirm_timeout: Duration,
    /// Backoff between reconnect attempts.
    pub reconnect: ReconnectPolicy,
    /// Handling of messages generated while disconnected.
    pub backpressure: BackpressurePolicy,
    /// Maximum number of messages held while disconnected with [`BackpressurePolicy::Buffer`].
    pub backlog_capacity: usize,
    /// How long an in-flight publish may take to settle after a stop signal.
    pub shutdown_grace: Duration,
}

impl PublisherConfig {
    pub fn builder() -> PublisherConfigBuilder {
        PublisherConfigBuilder::default()
    }
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// A builder for creating `PublisherConfig` instances.
#[derive(Default)]
pub struct PublisherConfigBuilder {
    interval: Option<Duration>,
    confirm_timeout: Option<Duration>,
    reconnect: Option<ReconnectPolicy>,
    backpressure: Option<BackpressurePolicy>,
    backlog_capacity: Option<usize>,
    shutdown_grace: Option<Duration>,
}

impl PublisherConfigBuilder {
    /// Defaults to 5 seconds.
    pub fn interval(mut self, interval: Duration) -> Self {
        self.interval = Some(interval);
        self
    }

    /// Defaults to 5 seconds.
    pub fn confirm_timeout(mut self, confirm_timeout: Duration) -> Self {
        self.confirm_timeout = Some(confirm_timeout);
        self
    }

    /// Defaults to `ReconnectPolicy::default()`.
    pub fn reconnect(mut self, reconnect: ReconnectPolicy) -> Self {
        self.reconnect = Some(reconnect);
        self
    }

    /// Defaults to [`BackpressurePolicy::Buffer`].
    pub fn backpressure(mut self, backpressure: BackpressurePolicy) -> Self {
        self.backpressure = Some(backpressure);
        self
    }

    /// Defaults to 1000.
    pub fn backlog_capacity(mut self, capacity: usize) -> Self {
        self.backlog_capacity = Some(capacity);
        self
    }

    /// Defaults to 500 milliseconds.
    pub fn shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = Some(grace);
        self
    }

    pub fn build(self) -> PublisherConfig {
        PublisherConfig {
            interval: self.interval.unwrap_or(Duration::from_secs(5)),
            confirm_timeout: self.confirm_timeout.unwrap_or(Duration::from_secs(5)),
            reconnect: self.reconnect.unwrap_or_default(),
            backpressure: self.backpressure.unwrap_or_default(),
            backlog_capacity: self.backlog_capacity.unwrap_or(1000),
            shutdown_grace: self.shutdown_grace.unwrap_or(Duration::from_millis(500)),
        }
    }
}

/// Counters reported when a publisher stops.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishStats {
    pub confirmed: u64,
    pub rejected: u64,
    pub dropped: u64,
    pub reconnects: u64,
    /// Buffered messages never sent because the publisher stopped first.
    pub unsent: u64,
}

/// Publishes a numbered message per tick and makes sure each one is either
/// confirmed by the broker or reported as failed.
pub struct Publisher<L: PublishLink> {
    link: L,
    config: PublisherConfig,
    reconnector: Reconnector,
    backlog: VecDeque<Message>,
    stats: PublishStats,
}

impl<L: PublishLink> Publisher<L> {
    /// Connects `link`, retrying transient failures with backoff.
    ///
    /// Fails only on fatal errors such as a rejected queue declaration. If
    /// stopped before connecting, the returned publisher shuts down as soon
    /// as it is run.
    pub async fn start(
        mut link: L,
        config: PublisherConfig,
        shutdown: &CancellationToken,
    ) -> Result<Self, ConnectionError> {
        let mut reconnector = Reconnector::new("publisher", config.reconnect.clone());
        reconnector.connect(&mut link, shutdown).await?;
        Ok(Self {
            link,
            config,
            reconnector,
            backlog: VecDeque::new(),
            stats: PublishStats::default(),
        })
    }

    /// Sends one message and waits for the broker's confirm.
    pub async fn publish(&mut self, message: &Message) -> Result<Confirmed, PublishError> {
        if !self.link.is_open() {
            return Err(PublishError::Disconnected);
        }
        let confirm_timeout = self.config.confirm_timeout;
        match timeout(confirm_timeout, self.link.publish(message)).await {
            Ok(result) => result,
            Err(_) => Err(PublishError::Timeout {
                sequence: message.sequence(),
                timeout: confirm_timeout,
            }),
        }
    }

    /// Generates and publishes messages until `shutdown` fires.
    ///
    /// A lost link is noticed within the initial reconnect delay even when
    /// no message is due, so reconnects never wait for the next tick.
    ///
    /// Returns an error only when a reconnect fails fatally.
    pub async fn run(mut self, shutdown: CancellationToken) -> Result<PublishStats, ConnectionError> {
        let mut ticker = MessageTicker::new(self.config.interval);
        let check_every = self.config.reconnect.initial_delay.max(Duration::from_millis(1));
        let mut liveness = interval_at(Instant::now() + check_every, check_every);
        liveness.set_missed_tick_behavior(MissedTickBehavior::Skip);
        log::info!(
            "Publishing a message every {:?} as '{}'",
            self.config.interval,
            ticker.origin()
        );

        loop {
            let disconnected = !self.link.is_open();
            if disconnected {
                self.reconnector.lost();
            }
            let reconnect_at = self.reconnector.next_attempt_at();

            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = sleep_until(reconnect_at), if disconnected => {
                    if self.reconnector.attempt(&mut self.link, &shutdown).await? == Attempt::Connected {
                        self.flush_backlog(&shutdown).await;
                    }
                }
                message = ticker.next() => self.dispatch(message, &shutdown).await,
                _ = liveness.tick(), if !disconnected => {}
            }
        }

        self.shut_down().await;
        Ok(self.stats())
    }

    pub fn stats(&self) -> PublishStats {
        PublishStats {
            reconnects: self.reconnector.reconnects(),
            ..self.stats.clone()
        }
    }

    /// Sends a freshly generated message, keeping it behind any backlog.
    async fn dispatch(&mut self, message: Message, shutdown: &CancellationToken) {
        if self.link.is_open() && !self.backlog.is_empty() {
            self.flush_backlog(shutdown).await;
        }
        if !self.link.is_open() || !self.backlog.is_empty() {
            self.reconnector.lost();
            self.hold(message);
            return;
        }

        match self.publish_until_grace(&message, shutdown).await {
            Ok(confirmed) => self.confirmed(confirmed),
            Err(e) if e.is_retryable() => {
                log::warn!("Message {} not confirmed: {}", message.sequence(), e);
                self.connection_failed().await;
                self.hold(message);
            }
            Err(e) => self.rejected(e),
        }
    }

    /// Publishes held messages in order. Stops at the first connection failure.
    async fn flush_backlog(&mut self, shutdown: &CancellationToken) {
        if !self.backlog.is_empty() {
            log::info!("Resending {} buffered message(s)", self.backlog.len());
        }
        while let Some(message) = self.backlog.pop_front() {
            if shutdown.is_cancelled() {
                self.backlog.push_front(message);
                return;
            }
            match self.publish_until_grace(&message, shutdown).await {
                Ok(confirmed) => self.confirmed(confirmed),
                Err(e) if e.is_retryable() => {
                    log::warn!("Message {} not confirmed: {}", message.sequence(), e);
                    self.backlog.push_front(message);
                    self.connection_failed().await;
                    return;
                }
                Err(e) => self.rejected(e),
            }
        }
    }

    /// Like [`Publisher::publish`], but gives up `shutdown_grace` after a stop signal.
    async fn publish_until_grace(
        &mut self,
        message: &Message,
        shutdown: &CancellationToken,
    ) -> Result<Confirmed, PublishError> {
        let grace = self.config.shutdown_grace;
        tokio::select! {
            result = self.publish(message) => result,
            _ = grace_expired(shutdown, grace) => Err(PublishError::Timeout {
                sequence: message.sequence(),
                timeout: grace,
            }),
        }
    }

    fn hold(&mut self, message: Message) {
        match self.config.backpressure {
            BackpressurePolicy::Buffer if self.backlog.len() < self.config.backlog_capacity => {
                log::debug!(
                    "Buffering Message {} until reconnected ({} waiting)",
                    message.sequence(),
                    self.backlog.len() + 1
                );
                self.backlog.push_back(message);
            }
            BackpressurePolicy::Buffer => {
                log::warn!(
                    "Backlog full ({} messages), dropping Message {}",
                    self.backlog.len(),
                    message.sequence()
                );
                self.stats.dropped += 1;
            }
            BackpressurePolicy::Drop => {
                log::warn!("Not connected to broker, dropping Message {}", message.sequence());
                self.stats.dropped += 1;
            }
        }
    }

    async fn connection_failed(&mut self) {
        self.reconnector.lost();
        self.link.close().await;
    }

    fn confirmed(&mut self, confirmed: Confirmed) {
        log::info!("Message {} confirmed", confirmed.sequence);
        self.stats.confirmed += 1;
    }

    fn rejected(&mut self, error: PublishError) {
        log::error!("{}. Not retrying", error);
        self.stats.rejected += 1;
    }

    async fn shut_down(&mut self) {
        self.reconnector.shutting_down();
        if let (Some(first), Some(last)) = (self.backlog.front(), self.backlog.back()) {
            log::warn!(
                "Stopping with {} buffered message(s) never sent (Message {}..=Message {})",
                self.backlog.len(),
                first.sequence(),
                last.sequence()
            );
            self.stats.unsent = self.backlog.len() as u64;
        }
        if timeout(self.config.shutdown_grace, self.link.close()).await.is_err() {
            log::warn!(
                "Broker connection did not close within {:?}",
                self.config.shutdown_grace
            );
        }
        log::info!("Publisher stopped");
    }
}
