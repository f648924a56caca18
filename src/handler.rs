//! Defines the core trait for delivery handling logic, plus the stock handlers.

use crate::error::HandlerError;
use crate::message::Delivery;
use async_trait::async_trait;
use std::collections::{HashSet, VecDeque};
use std::io::{self, Write};
use std::sync::Mutex;

/// Request to acknowledge the delivery that was just handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ack;

/// A trait for processing deliveries from the subscribed queue.
///
/// Returning `Ok(Ack)` acknowledges the delivery; returning an error requeues
/// it. Deliveries can arrive more than once, so handlers should be
/// idempotent or wrapped in [`Deduplicate`].
#[async_trait]
pub trait DeliveryHandler: Send + Sync {
    async fn handle(&self, delivery: &Delivery) -> Result<Ack, HandlerError>;

    /// A name for the handler, used for logging.
    fn handler_name(&self) -> &str {
        "handler"
    }
}

/// Adapts a plain function into a [`DeliveryHandler`].
pub struct FnHandler<F> {
    f: F,
}

/// Wraps `f`, a synchronous `Delivery -> Result<Ack, HandlerError>` function.
pub fn handler_fn<F>(f: F) -> FnHandler<F>
where
    F: Fn(&Delivery) -> Result<Ack, HandlerError> + Send + Sync,
{
    FnHandler { f }
}

#[async_trait]
impl<F> DeliveryHandler for FnHandler<F>
where
    F: Fn(&Delivery) -> Result<Ack, HandlerError> + Send + Sync,
{
    async fn handle(&self, delivery: &Delivery) -> Result<Ack, HandlerError> {
        (self.f)(delivery)
    }

    fn handler_name(&self) -> &str {
        "fn"
    }
}

/// Writes each payload as one line.
pub struct PrintHandler<W> {
    out: Mutex<W>,
}

impl PrintHandler<io::Stdout> {
    pub fn stdout() -> Self {
        Self::new(io::stdout())
    }
}

impl<W: Write + Send> PrintHandler<W> {
    pub fn new(out: W) -> Self {
        Self { out: Mutex::new(out) }
    }

    pub fn into_inner(self) -> W {
        match self.out.into_inner() {
            Ok(out) => out,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[async_trait]
impl<W: Write + Send> DeliveryHandler for PrintHandler<W> {
    async fn handle(&self, delivery: &Delivery) -> Result<Ack, HandlerError> {
        log::debug!(
            "Delivery {} from exchange '{}' (routing key '{}', content type {:?})",
            delivery.delivery_tag,
            delivery.exchange,
            delivery.routing_key,
            delivery.content_type
        );
        let mut out = self
            .out
            .lock()
            .map_err(|_| HandlerError::new("output writer lock poisoned"))?;
        writeln!(out, "{}", delivery.text())?;
        out.flush()?;
        Ok(Ack)
    }

    fn handler_name(&self) -> &str {
        "print"
    }
}

/// Skips deliveries that were already handled successfully.
///
/// A delivery is identified by its origin and sequence number, so messages
/// from a restarted publisher, which numbers from zero again, are handled
/// as new. Remembers the last `capacity` identities. Deliveries without a
/// sequence number are always passed through.
pub struct Deduplicate<H> {
    inner: H,
    seen: Mutex<SeenSequences>,
}

/// Origin and sequence number of a handled delivery.
type Identity = (String, u64);

struct SeenSequences {
    order: VecDeque<Identity>,
    set: HashSet<Identity>,
    capacity: usize,
}

impl SeenSequences {
    fn insert(&mut self, identity: Identity) {
        if self.capacity == 0 || !self.set.insert(identity.clone()) {
            return;
        }
        self.order.push_back(identity);
        if self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.set.remove(&oldest);
            }
        }
    }
}

impl<H: DeliveryHandler> Deduplicate<H> {
    pub fn new(inner: H, capacity: usize) -> Self {
        Self {
            inner,
            seen: Mutex::new(SeenSequences {
                order: VecDeque::with_capacity(capacity.min(4096)),
                set: HashSet::new(),
                capacity,
            }),
        }
    }

    pub fn inner(&self) -> &H {
        &self.inner
    }

    fn already_seen(&self, identity: &Identity) -> Result<bool, HandlerError> {
        let seen = self
            .seen
            .lock()
            .map_err(|_| HandlerError::new("deduplication lock poisoned"))?;
        Ok(seen.set.contains(identity))
    }
}

#[async_trait]
impl<H: DeliveryHandler> DeliveryHandler for Deduplicate<H> {
    async fn handle(&self, delivery: &Delivery) -> Result<Ack, HandlerError> {
        let Some(sequence) = delivery.sequence else {
            return self.inner.handle(delivery).await;
        };
        let identity = (delivery.origin.clone().unwrap_or_default(), sequence);
        if self.already_seen(&identity)? {
            log::info!(
                "Message {} from '{}' already handled, acknowledging duplicate",
                sequence,
                identity.0
            );
            return Ok(Ack);
        }

        let ack = self.inner.handle(delivery).await?;
        self.seen
            .lock()
            .map_err(|_| HandlerError::new("deduplication lock poisoned"))?
            .insert(identity);
        Ok(ack)
    }

    fn handler_name(&self) -> &str {
        self.inner.handler_name()
    }
}
