//! Connection lifecycle shared by the publisher and the consumer.
//!
//! A component owns exactly one link to the broker. The link is driven
//! through `Disconnected → Connecting → Connected`, falls back to
//! `Disconnected` on error, and ends in `ShuttingDown` once a stop signal
//! arrives.

use crate::error::{ConnectionError, PublishError};
use crate::message::{Confirmed, Delivery, Message};
use crate::retry::ReconnectPolicy;
use async_trait::async_trait;
use std::fmt;
use std::time::Duration;
use tokio::time::{sleep, sleep_until, Instant};
use tokio_util::sync::CancellationToken;

/// A session with the broker that can be opened, probed and closed.
#[async_trait]
pub trait Link: Send {
    /// Opens a fresh session and declares the topology. Any previous
    /// session held by the link is discarded first.
    async fn open(&mut self) -> Result<(), ConnectionError>;

    /// Whether the session is currently usable.
    fn is_open(&self) -> bool;

    /// Closes the session. Errors are logged, not returned.
    async fn close(&mut self);
}

/// Outbound side: publishes one message and waits for the broker's confirm.
#[async_trait]
pub trait PublishLink: Link {
    async fn publish(&mut self, message: &Message) -> Result<Confirmed, PublishError>;
}

/// Inbound side: yields deliveries from the subscribed queue and settles them.
#[async_trait]
pub trait ConsumeLink: Link {
    /// Next delivery; `None` when the subscription ended.
    async fn next_delivery(&mut self) -> Option<Result<Delivery, ConnectionError>>;

    async fn ack(&mut self, delivery_tag: u64) -> Result<(), ConnectionError>;

    async fn nack(&mut self, delivery_tag: u64, requeue: bool) -> Result<(), ConnectionError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    ShuttingDown,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::ShuttingDown => "shutting down",
        };
        f.write_str(name)
    }
}

/// Result of a single connection attempt.
#[derive(Debug, PartialEq, Eq)]
pub enum Attempt {
    Connected,
    /// Transient failure; the next attempt is due after this delay.
    RetryIn(Duration),
    /// The stop signal arrived before the attempt finished.
    Cancelled,
}

/// Tracks connection state and schedules reconnect attempts.
#[derive(Debug)]
pub struct Reconnector {
    name: &'static str,
    policy: ReconnectPolicy,
    state: ConnectionState,
    failures: u32,
    retry_at: Option<Instant>,
    reconnects: u64,
    ever_connected: bool,
}

impl Reconnector {
    pub fn new(name: &'static str, policy: ReconnectPolicy) -> Self {
        Self {
            name,
            policy,
            state: ConnectionState::Disconnected,
            failures: 0,
            retry_at: None,
            reconnects: 0,
            ever_connected: false,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Successful connects after the first one.
    pub fn reconnects(&self) -> u64 {
        self.reconnects
    }

    fn transition(&mut self, next: ConnectionState) {
        if self.state == ConnectionState::ShuttingDown || self.state == next {
            return;
        }
        log::debug!("{}: {} -> {}", self.name, self.state, next);
        self.state = next;
    }

    /// Records that a live session was lost. The next attempt is due at once.
    ///
    /// No-op unless connected, so repeated calls during an outage keep the
    /// backoff schedule intact.
    pub fn lost(&mut self) {
        if self.state != ConnectionState::Connected {
            return;
        }
        log::warn!("{}: connection to broker lost, reconnecting", self.name);
        self.transition(ConnectionState::Disconnected);
        self.failures = 0;
        self.retry_at = None;
    }

    pub fn shutting_down(&mut self) {
        self.transition(ConnectionState::ShuttingDown);
    }

    /// When the next connection attempt may start.
    pub fn next_attempt_at(&self) -> Instant {
        self.retry_at.unwrap_or_else(Instant::now)
    }

    /// Sleeps until the next attempt is due. Returns `false` if stopped first.
    pub async fn wait_for_attempt(&self, shutdown: &CancellationToken) -> bool {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => false,
            _ = sleep_until(self.next_attempt_at()) => true,
        }
    }

    /// Makes one attempt to open `link`.
    ///
    /// Fatal errors are returned; transient ones schedule the next attempt.
    pub async fn attempt<L: Link + ?Sized>(
        &mut self,
        link: &mut L,
        shutdown: &CancellationToken,
    ) -> Result<Attempt, ConnectionError> {
        self.transition(ConnectionState::Connecting);
        let result = tokio::select! {
            biased;
            _ = shutdown.cancelled() => return Ok(Attempt::Cancelled),
            result = link.open() => result,
        };

        match result {
            Ok(()) => {
                self.transition(ConnectionState::Connected);
                if self.ever_connected {
                    self.reconnects += 1;
                    log::info!(
                        "{}: reconnected to broker after {} failed attempt(s)",
                        self.name,
                        self.failures
                    );
                } else {
                    log::info!("{}: connected to broker", self.name);
                }
                self.ever_connected = true;
                self.failures = 0;
                self.retry_at = None;
                Ok(Attempt::Connected)
            }
            Err(e) if e.is_transient() => {
                let delay = self.policy.delay_for(self.failures);
                self.failures = self.failures.saturating_add(1);
                self.retry_at = Some(Instant::now() + delay);
                self.transition(ConnectionState::Disconnected);
                log::warn!("{}: {}. Retrying in {:?}", self.name, e, delay);
                Ok(Attempt::RetryIn(delay))
            }
            Err(e) => {
                self.transition(ConnectionState::Disconnected);
                Err(e)
            }
        }
    }

    /// Attempts to connect until it succeeds, fails fatally or is stopped.
    ///
    /// Returns `Ok(false)` when stopped before a session was established.
    pub async fn connect<L: Link + ?Sized>(
        &mut self,
        link: &mut L,
        shutdown: &CancellationToken,
    ) -> Result<bool, ConnectionError> {
        loop {
            if !self.wait_for_attempt(shutdown).await {
                return Ok(false);
            }
            match self.attempt(link, shutdown).await? {
                Attempt::Connected => return Ok(true),
                Attempt::RetryIn(_) => continue,
                Attempt::Cancelled => return Ok(false),
            }
        }
    }
}

/// Resolves `grace` after the stop signal fires.
///
/// Used to bound work that is allowed to finish during shutdown.
pub async fn grace_expired(shutdown: &CancellationToken, grace: Duration) {
    shutdown.cancelled().await;
    sleep(grace).await;
}
