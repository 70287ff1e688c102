//! RabbitMQ implementation of the broker contract (AMQP 0-9-1 via lapin).
//!
//! Publishes go through the default exchange with the queue name as routing
//! key. Publisher channels run in confirm mode; consumer channels use manual
//! acknowledgment with a `basic.qos` prefetch limit.

use async_trait::async_trait;
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions, BasicQosOptions,
    ConfirmSelectOptions, QueueDeclareOptions,
};
use lapin::publisher_confirm::PublisherConfirm;
use lapin::types::{FieldTable, ShortString};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::{
    Broker, BrokerChannel, BrokerError, BrokerResult, Confirmation, ConsumeChannel, Delivery,
    OutboundMessage, PublishChannel,
};

/// Persistent delivery mode in AMQP basic properties
const PERSISTENT: u8 = 2;

const REPLY_SUCCESS: u16 = 200;

/// A connection to RabbitMQ.
pub struct AmqpBroker {
    connection: Connection,
}

impl AmqpBroker {
    /// Connect, retrying up to `max_attempts` times with linearly growing
    /// pauses (1s, 2s, ...) between attempts.
    pub async fn connect(url: &str, max_attempts: u32) -> BrokerResult<Self> {
        let max_attempts = max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            match Connection::connect(url, ConnectionProperties::default()).await {
                Ok(connection) => {
                    info!(attempt = attempt, "Connected to RabbitMQ");
                    return Ok(Self { connection });
                }
                Err(e) if attempt < max_attempts => {
                    warn!(
                        attempt = attempt,
                        max_attempts = max_attempts,
                        error = %e,
                        "RabbitMQ not reachable, retrying"
                    );
                    tokio::time::sleep(Duration::from_secs(attempt as u64)).await;
                }
                Err(e) => {
                    return Err(BrokerError::Connection(format!(
                        "gave up after {attempt} attempts: {e}"
                    )));
                }
            }
        }
    }

    /// Close the connection (every channel on it closes too)
    pub async fn close(&self) -> BrokerResult<()> {
        self.connection.close(REPLY_SUCCESS, "OK").await?;
        Ok(())
    }

    async fn channel(&self) -> BrokerResult<Channel> {
        self.connection
            .create_channel()
            .await
            .map_err(|e| BrokerError::ChannelSetup(format!("create channel: {e}")))
    }
}

async fn declare_durable(channel: &Channel, queue: &str) -> BrokerResult<()> {
    channel
        .queue_declare(
            queue,
            QueueDeclareOptions {
                durable: true,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await
        .map_err(|e| BrokerError::ChannelSetup(format!("declare queue {queue}: {e}")))?;
    Ok(())
}

#[async_trait]
impl Broker for AmqpBroker {
    type Publisher = AmqpPublisher;
    type Consumer = AmqpConsumer;

    async fn declare_queue(&self, queue: &str) -> BrokerResult<()> {
        let channel = self.channel().await?;
        declare_durable(&channel, queue).await?;
        if let Err(e) = channel.close(REPLY_SUCCESS, "OK").await {
            debug!(error = %e, "Closing declaration channel failed");
        }
        Ok(())
    }

    async fn open_publisher(&self, queue: &str) -> BrokerResult<AmqpPublisher> {
        let channel = self.channel().await?;
        declare_durable(&channel, queue).await?;
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| BrokerError::ChannelSetup(format!("confirm mode: {e}")))?;

        Ok(AmqpPublisher {
            channel,
            next_seq: 0,
            pending: VecDeque::new(),
        })
    }

    async fn open_consumer(&self, queue: &str, prefetch: u16) -> BrokerResult<AmqpConsumer> {
        let channel = self.channel().await?;
        declare_durable(&channel, queue).await?;
        channel
            .basic_qos(prefetch, BasicQosOptions::default())
            .await
            .map_err(|e| BrokerError::ChannelSetup(format!("qos: {e}")))?;

        let consumer = channel
            .basic_consume(
                queue,
                "",
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| BrokerError::ChannelSetup(format!("consume {queue}: {e}")))?;

        Ok(AmqpConsumer { channel, consumer })
    }
}

/// Confirm-mode channel.
///
/// lapin resolves each publish to its own [`PublisherConfirm`]; they are kept
/// in publish order so confirmations come out in order. The head future is
/// only popped once it resolves, which keeps [`PublishChannel::next_confirm`]
/// cancel-safe.
pub struct AmqpPublisher {
    channel: Channel,
    next_seq: u64,
    pending: VecDeque<(u64, Pin<Box<PublisherConfirm>>)>,
}

#[async_trait]
impl BrokerChannel for AmqpPublisher {
    async fn close(&mut self) -> BrokerResult<()> {
        self.pending.clear();
        if self.channel.status().connected() {
            self.channel.close(REPLY_SUCCESS, "OK").await?;
        }
        Ok(())
    }
}

#[async_trait]
impl PublishChannel for AmqpPublisher {
    async fn publish(&mut self, message: OutboundMessage) -> BrokerResult<u64> {
        let mut properties = BasicProperties::default()
            .with_content_type(ShortString::from(message.content_type))
            .with_message_id(ShortString::from(message.message_id))
            .with_timestamp(chrono::Utc::now().timestamp().max(0) as u64);
        if message.persistent {
            properties = properties.with_delivery_mode(PERSISTENT);
        }

        let confirm = self
            .channel
            .basic_publish(
                "",
                &message.routing_key,
                BasicPublishOptions::default(),
                &message.body,
                properties,
            )
            .await
            .map_err(|e| BrokerError::Publish(e.to_string()))?;

        self.next_seq += 1;
        self.pending.push_back((self.next_seq, Box::pin(confirm)));
        Ok(self.next_seq)
    }

    async fn next_confirm(&mut self) -> Option<Confirmation> {
        let Some((seq, confirm)) = self.pending.front_mut() else {
            if !self.channel.status().connected() {
                return None;
            }
            // Nothing outstanding: no confirmation will ever arrive
            return futures::future::pending().await;
        };
        let seq = *seq;
        let outcome = confirm.as_mut().await;
        self.pending.pop_front();

        match outcome {
            Ok(confirmation) => Some(Confirmation {
                delivery_tag: seq,
                multiple: false,
                ack: confirmation.is_ack(),
            }),
            Err(e) => {
                warn!(seq = seq, error = %e, "Confirm stream failed");
                self.pending.clear();
                None
            }
        }
    }
}

/// Manual-ack consuming channel.
pub struct AmqpConsumer {
    channel: Channel,
    consumer: lapin::Consumer,
}

#[async_trait]
impl BrokerChannel for AmqpConsumer {
    async fn close(&mut self) -> BrokerResult<()> {
        if self.channel.status().connected() {
            self.channel.close(REPLY_SUCCESS, "OK").await?;
        }
        Ok(())
    }
}

#[async_trait]
impl ConsumeChannel for AmqpConsumer {
    type Delivery = AmqpDelivery;

    async fn next_delivery(&mut self) -> Option<BrokerResult<AmqpDelivery>> {
        let next = self.consumer.next().await?;
        Some(next.map(AmqpDelivery::new).map_err(BrokerError::from))
    }
}

/// A delivery received from RabbitMQ.
pub struct AmqpDelivery {
    inner: lapin::message::Delivery,
    settled: AtomicBool,
}

impl AmqpDelivery {
    fn new(inner: lapin::message::Delivery) -> Self {
        Self {
            inner,
            settled: AtomicBool::new(false),
        }
    }

    fn claim(&self) -> BrokerResult<()> {
        if self.settled.swap(true, Ordering::SeqCst) {
            return Err(BrokerError::AlreadySettled(self.inner.delivery_tag));
        }
        Ok(())
    }
}

#[async_trait]
impl Delivery for AmqpDelivery {
    fn body(&self) -> &[u8] {
        &self.inner.data
    }

    fn delivery_tag(&self) -> u64 {
        self.inner.delivery_tag
    }

    fn redelivered(&self) -> bool {
        self.inner.redelivered
    }

    fn message_id(&self) -> Option<&str> {
        self.inner
            .properties
            .message_id()
            .as_ref()
            .map(|id| id.as_str())
    }

    async fn ack(&self) -> BrokerResult<()> {
        self.claim()?;
        self.inner
            .acker
            .ack(BasicAckOptions::default())
            .await
            .map_err(|e| BrokerError::Acknowledge(e.to_string()))
    }

    async fn requeue_or_drop(&self, requeue: bool) -> BrokerResult<()> {
        self.claim()?;
        self.inner
            .acker
            .nack(BasicNackOptions {
                multiple: false,
                requeue,
            })
            .await
            .map_err(|e| BrokerError::Acknowledge(e.to_string()))
    }
}
