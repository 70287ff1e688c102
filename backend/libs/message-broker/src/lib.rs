//! # Message Broker Contract
//!
//! The pipeline treats the broker as a durable, ordered, at-least-once queue
//! with manual acknowledgment, per-connection channels and publisher
//! confirmation. This crate pins that contract down as a handful of traits so
//! the publisher and consumer pools can be written (and tested) without a
//! running RabbitMQ.
//!
//! ## Architecture
//!
//! ```text
//!             ┌──────────────┐  open_publisher / open_consumer
//!  worker ──► │ ChannelPool  │ ─────────────────────────────────► Broker
//!             └──────┬───────┘                                      │
//!                    │ ChannelLease (exclusive, one per worker)      │
//!                    ▼                                               ▼
//!          PublishChannel ── publish(seq) ──► queue ──► ConsumeChannel
//!                 ▲                                           │
//!                 └──── Confirmation(seq, ack/nack)     Delivery (ack / requeue_or_drop)
//! ```
//!
//! Implementations:
//!
//! - [`amqp::AmqpBroker`]: RabbitMQ over AMQP 0-9-1 (lapin)
//! - [`memory::MemoryBroker`]: in-process broker with fault injection, for tests
//!
//! ## Channel ownership
//!
//! Confirmation tracking is per channel and ordered. Two workers sharing a
//! channel could not tell whose confirm arrived, so every worker leases its
//! own channel from a [`ChannelPool`] for its whole lifetime.

use async_trait::async_trait;

pub mod amqp;
mod error;
pub mod memory;
mod pool;

pub use error::{BrokerError, BrokerResult};
pub use pool::{ChannelLease, ChannelPool};

/// A message ready to be published to a queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    /// Queue name (published through the default exchange)
    pub routing_key: String,

    /// Broker-visible message identity
    pub message_id: String,

    pub body: Vec<u8>,

    pub content_type: String,

    /// Persistent delivery mode (survives broker restart)
    pub persistent: bool,
}

impl OutboundMessage {
    /// Persistent message with the given identity
    pub fn persistent(
        routing_key: impl Into<String>,
        message_id: impl Into<String>,
        content_type: impl Into<String>,
        body: Vec<u8>,
    ) -> Self {
        Self {
            routing_key: routing_key.into(),
            message_id: message_id.into(),
            body,
            content_type: content_type.into(),
            persistent: true,
        }
    }
}

/// Publisher confirmation for one (or, with `multiple`, several) publishes on a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Confirmation {
    /// Publish sequence number being confirmed
    pub delivery_tag: u64,

    /// Confirms every outstanding sequence up to and including `delivery_tag`
    pub multiple: bool,

    /// `true` for ack, `false` for nack
    pub ack: bool,
}

impl Confirmation {
    pub fn ack(delivery_tag: u64) -> Self {
        Self {
            delivery_tag,
            multiple: false,
            ack: true,
        }
    }

    pub fn nack(delivery_tag: u64) -> Self {
        Self {
            delivery_tag,
            multiple: false,
            ack: false,
        }
    }

    /// Whether this confirmation settles publish `seq`
    pub fn covers(&self, seq: u64) -> bool {
        self.delivery_tag == seq || (self.multiple && self.delivery_tag > seq)
    }

    /// Whether this confirmation belongs to a publish older than `seq`
    pub fn is_stale_for(&self, seq: u64) -> bool {
        self.delivery_tag < seq
    }
}

/// Behaviour shared by every broker channel.
#[async_trait]
pub trait BrokerChannel: Send + 'static {
    /// Close the channel. Unacknowledged deliveries go back to the queue.
    async fn close(&mut self) -> BrokerResult<()>;
}

/// A confirm-mode channel used for publishing.
#[async_trait]
pub trait PublishChannel: BrokerChannel {
    /// Publish a message and return its sequence number on this channel.
    ///
    /// Sequence numbers start at 1 and increase by one per publish.
    async fn publish(&mut self, message: OutboundMessage) -> BrokerResult<u64>;

    /// Wait for the next confirmation, in publish order.
    ///
    /// Returns `None` once the confirm stream is closed. Dropping the future
    /// before it resolves must not lose the confirmation it was waiting for.
    async fn next_confirm(&mut self) -> Option<Confirmation>;
}

/// A manual-ack channel used for consuming.
#[async_trait]
pub trait ConsumeChannel: BrokerChannel {
    type Delivery: Delivery;

    /// Wait for the next delivery.
    ///
    /// Returns `None` when the stream ends. Cancel-safe: dropping the future
    /// never consumes a delivery.
    async fn next_delivery(&mut self) -> Option<BrokerResult<Self::Delivery>>;
}

/// One received message and the capability to settle it.
///
/// A delivery that is never settled stays owned by the broker and is
/// redelivered after the consumer's channel goes away.
#[async_trait]
pub trait Delivery: Send + Sync + 'static {
    fn body(&self) -> &[u8];

    fn delivery_tag(&self) -> u64;

    /// Whether the broker delivered this message before
    fn redelivered(&self) -> bool;

    fn message_id(&self) -> Option<&str>;

    /// Permanently remove the message from the queue
    async fn ack(&self) -> BrokerResult<()>;

    /// Reject the message; with `requeue` the broker delivers it again,
    /// otherwise it is discarded
    async fn requeue_or_drop(&self, requeue: bool) -> BrokerResult<()>;
}

/// Entry point to a broker: queue declaration and channel creation.
#[async_trait]
pub trait Broker: Send + Sync + 'static {
    type Publisher: PublishChannel;
    type Consumer: ConsumeChannel;

    /// Declare a durable queue (idempotent)
    async fn declare_queue(&self, queue: &str) -> BrokerResult<()>;

    /// Open a channel with publisher confirms enabled
    async fn open_publisher(&self, queue: &str) -> BrokerResult<Self::Publisher>;

    /// Open a manual-ack consuming channel limited to `prefetch` unacked deliveries
    async fn open_consumer(&self, queue: &str, prefetch: u16) -> BrokerResult<Self::Consumer>;
}
