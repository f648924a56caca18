//! Messages, their sequence numbering and the deliveries that carry them.

use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::{interval, Interval, MissedTickBehavior};

/// An application message with its correlation sequence number.
///
/// Sequence numbers restart with every publisher, so a message is identified
/// by its `origin` (the publisher that numbered it) together with its sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    sequence: u64,
    origin: String,
    payload: Vec<u8>,
    created_at: DateTime<Utc>,
}

impl Message {
    pub fn new(sequence: u64, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            sequence,
            origin: String::new(),
            payload: payload.into(),
            created_at: Utc::now(),
        }
    }

    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = origin.into();
        self
    }

    /// The demo message body, `"Message {sequence}"`.
    pub fn numbered(sequence: u64) -> Self {
        Self::new(sequence, format!("Message {}", sequence))
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Identifies the numbering this message belongs to; empty if unknown.
    pub fn origin(&self) -> &str {
        &self.origin
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
}

/// Broker confirmation for one published message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Confirmed {
    pub sequence: u64,
}

static SEQUENCERS: AtomicU64 = AtomicU64::new(0);

/// Hands out sequence numbers. Never goes backwards and never repeats.
///
/// Every sequencer gets its own origin, distinct from that of any earlier
/// publisher process or sequencer, and stamps it on the messages it numbers.
#[derive(Debug)]
pub struct Sequencer {
    origin: String,
    next: u64,
}

impl Sequencer {
    pub fn new() -> Self {
        let origin = format!(
            "{}-{}-{}",
            std::process::id(),
            Utc::now().timestamp_micros(),
            SEQUENCERS.fetch_add(1, Ordering::Relaxed)
        );
        Self { origin, next: 0 }
    }

    pub fn origin(&self) -> &str {
        &self.origin
    }

    pub fn next_message(&mut self) -> Message {
        let message = Message::numbered(self.next).with_origin(self.origin.as_str());
        self.next += 1;
        message
    }

    /// The number the next message will carry.
    pub fn peek(&self) -> u64 {
        self.next
    }
}

impl Default for Sequencer {
    fn default() -> Self {
        Self::new()
    }
}

/// A lazy, infinite stream of numbered messages, one per tick.
///
/// The first message is produced immediately. Once dropped it cannot be
/// restarted; a new ticker starts numbering from zero again.
pub struct MessageTicker {
    interval: Interval,
    sequencer: Sequencer,
}

impl MessageTicker {
    /// # Panics
    /// If `period` is zero; configuration rejects that earlier.
    pub fn new(period: Duration) -> Self {
        let mut interval = interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self {
            interval,
            sequencer: Sequencer::new(),
        }
    }

    pub fn origin(&self) -> &str {
        self.sequencer.origin()
    }

    /// Waits for the next tick and returns the message generated for it.
    ///
    /// Cancel-safe: if the future is dropped before the tick fires, no
    /// sequence number is consumed.
    pub async fn next(&mut self) -> Message {
        self.interval.tick().await;
        self.sequencer.next_message()
    }
}

/// A message received from the broker, with what is needed to settle it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub delivery_tag: u64,
    pub redelivered: bool,
    /// Recovered from the `x-sequence` header; `None` for foreign messages.
    pub sequence: Option<u64>,
    /// Recovered from the `x-origin` header; `None` for foreign messages.
    pub origin: Option<String>,
    pub payload: Vec<u8>,
    pub content_type: Option<String>,
    pub exchange: String,
    pub routing_key: String,
}

impl Delivery {
    /// Payload decoded as UTF-8, with invalid bytes replaced.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }
}
