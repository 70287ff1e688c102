//! In-process broker
//!
//! Implements the broker contract on top of in-memory queues: FIFO delivery,
//! per-channel prefetch limits, manual ack with nack-requeue, ordered
//! publisher confirms. Unsettled deliveries return to the head of the queue
//! (flagged `redelivered`) when their channel closes.
//!
//! Faults can be injected for tests: confirm behaviour ([`ConfirmMode`]) and
//! channel setup failure.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tracing::debug;

use crate::{
    Broker, BrokerChannel, BrokerError, BrokerResult, Confirmation, ConsumeChannel, Delivery,
    OutboundMessage, PublishChannel,
};

/// How publisher confirms behave for subsequent publishes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfirmMode {
    /// Accept and ack immediately
    Ack,
    /// Reject: the message is not enqueued
    Nack,
    /// Accept but never confirm
    Never,
    /// Accept and ack after a delay
    After(Duration),
}

#[derive(Debug, Clone)]
struct StoredMessage {
    body: Vec<u8>,
    message_id: Option<String>,
    redelivered: bool,
}

#[derive(Default)]
struct QueueState {
    ready: VecDeque<StoredMessage>,
    unacked: HashMap<u64, StoredMessage>,
}

struct Shared {
    queues: Mutex<HashMap<String, QueueState>>,
    notify: Notify,
    next_tag: AtomicU64,
    closed: AtomicBool,
    fail_setup: AtomicBool,
    confirm_mode: Mutex<ConfirmMode>,
    published: AtomicU64,
    acked: AtomicU64,
    requeued: AtomicU64,
    dropped: AtomicU64,
}

impl Shared {
    fn enqueue(&self, queue: &str, message: StoredMessage) {
        self.queues
            .lock()
            .entry(queue.to_string())
            .or_default()
            .ready
            .push_back(message);
        self.published.fetch_add(1, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    fn check_setup(&self) -> BrokerResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BrokerError::Connection("broker closed".to_string()));
        }
        if self.fail_setup.load(Ordering::SeqCst) {
            return Err(BrokerError::ChannelSetup(
                "injected channel setup failure".to_string(),
            ));
        }
        Ok(())
    }
}

/// In-process implementation of [`Broker`].
#[derive(Clone)]
pub struct MemoryBroker {
    shared: Arc<Shared>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                queues: Mutex::new(HashMap::new()),
                notify: Notify::new(),
                next_tag: AtomicU64::new(1),
                closed: AtomicBool::new(false),
                fail_setup: AtomicBool::new(false),
                confirm_mode: Mutex::new(ConfirmMode::Ack),
                published: AtomicU64::new(0),
                acked: AtomicU64::new(0),
                requeued: AtomicU64::new(0),
                dropped: AtomicU64::new(0),
            }),
        }
    }

    /// Change confirm behaviour for publishes made from now on
    pub fn set_confirm_mode(&self, mode: ConfirmMode) {
        *self.shared.confirm_mode.lock() = mode;
    }

    /// Make every following channel open fail
    pub fn fail_channel_setup(&self, fail: bool) {
        self.shared.fail_setup.store(fail, Ordering::SeqCst);
    }

    /// Enqueue a raw body without going through a publisher channel
    pub fn publish_raw(&self, queue: &str, body: impl Into<Vec<u8>>) {
        self.shared.enqueue(
            queue,
            StoredMessage {
                body: body.into(),
                message_id: None,
                redelivered: false,
            },
        );
    }

    /// Shut the broker down: delivery streams end, publishes fail
    pub fn close(&self) {
        self.shared.closed.store(true, Ordering::SeqCst);
        self.shared.notify.notify_waiters();
    }

    /// Messages waiting to be delivered
    pub fn ready_count(&self, queue: &str) -> usize {
        self.shared
            .queues
            .lock()
            .get(queue)
            .map_or(0, |q| q.ready.len())
    }

    /// Messages delivered but not yet settled
    pub fn unacked_count(&self, queue: &str) -> usize {
        self.shared
            .queues
            .lock()
            .get(queue)
            .map_or(0, |q| q.unacked.len())
    }

    /// Bodies of the messages waiting in `queue`, head first
    pub fn ready_bodies(&self, queue: &str) -> Vec<Vec<u8>> {
        self.shared
            .queues
            .lock()
            .get(queue)
            .map(|q| q.ready.iter().map(|m| m.body.clone()).collect())
            .unwrap_or_default()
    }

    /// Messages accepted into any queue
    pub fn published_count(&self) -> u64 {
        self.shared.published.load(Ordering::SeqCst)
    }

    pub fn acked_count(&self) -> u64 {
        self.shared.acked.load(Ordering::SeqCst)
    }

    /// Deliveries nacked with requeue (including those returned on channel close)
    pub fn requeued_count(&self) -> u64 {
        self.shared.requeued.load(Ordering::SeqCst)
    }

    /// Deliveries nacked without requeue
    pub fn dropped_count(&self) -> u64 {
        self.shared.dropped.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    type Publisher = MemoryPublisher;
    type Consumer = MemoryConsumer;

    async fn declare_queue(&self, queue: &str) -> BrokerResult<()> {
        self.shared.check_setup()?;
        self.shared
            .queues
            .lock()
            .entry(queue.to_string())
            .or_default();
        Ok(())
    }

    async fn open_publisher(&self, queue: &str) -> BrokerResult<MemoryPublisher> {
        self.shared.check_setup()?;
        let (confirm_tx, confirm_rx) = mpsc::unbounded_channel();
        debug!(queue = %queue, "Memory publisher channel opened");
        Ok(MemoryPublisher {
            shared: self.shared.clone(),
            next_seq: 0,
            confirm_tx: Some(confirm_tx),
            confirm_rx,
        })
    }

    async fn open_consumer(&self, queue: &str, prefetch: u16) -> BrokerResult<MemoryConsumer> {
        self.shared.check_setup()?;
        Ok(MemoryConsumer {
            shared: self.shared.clone(),
            queue: queue.to_string(),
            prefetch: prefetch as usize,
            channel: Arc::new(ChannelState {
                open: AtomicBool::new(true),
                in_flight: AtomicUsize::new(0),
                outstanding: Mutex::new(HashSet::new()),
            }),
        })
    }
}

/// Confirm-mode publishing channel of a [`MemoryBroker`].
pub struct MemoryPublisher {
    shared: Arc<Shared>,
    next_seq: u64,
    confirm_tx: Option<mpsc::UnboundedSender<Confirmation>>,
    confirm_rx: mpsc::UnboundedReceiver<Confirmation>,
}

#[async_trait]
impl BrokerChannel for MemoryPublisher {
    async fn close(&mut self) -> BrokerResult<()> {
        self.confirm_tx = None;
        Ok(())
    }
}

#[async_trait]
impl PublishChannel for MemoryPublisher {
    async fn publish(&mut self, message: OutboundMessage) -> BrokerResult<u64> {
        let Some(confirm_tx) = self.confirm_tx.clone() else {
            return Err(BrokerError::ChannelClosed);
        };
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(BrokerError::ChannelClosed);
        }

        self.next_seq += 1;
        let seq = self.next_seq;
        let mode = *self.shared.confirm_mode.lock();

        if mode != ConfirmMode::Nack {
            self.shared.enqueue(
                &message.routing_key,
                StoredMessage {
                    body: message.body,
                    message_id: Some(message.message_id),
                    redelivered: false,
                },
            );
        }

        match mode {
            ConfirmMode::Ack => {
                let _ = confirm_tx.send(Confirmation::ack(seq));
            }
            ConfirmMode::Nack => {
                let _ = confirm_tx.send(Confirmation::nack(seq));
            }
            ConfirmMode::Never => {}
            ConfirmMode::After(delay) => {
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = confirm_tx.send(Confirmation::ack(seq));
                });
            }
        }

        Ok(seq)
    }

    async fn next_confirm(&mut self) -> Option<Confirmation> {
        self.confirm_rx.recv().await
    }
}

struct ChannelState {
    open: AtomicBool,
    in_flight: AtomicUsize,
    outstanding: Mutex<HashSet<u64>>,
}

/// Manual-ack consuming channel of a [`MemoryBroker`].
pub struct MemoryConsumer {
    shared: Arc<Shared>,
    queue: String,
    prefetch: usize,
    channel: Arc<ChannelState>,
}

impl MemoryConsumer {
    fn try_take(&self) -> Option<MemoryDelivery> {
        if self.prefetch > 0 && self.channel.in_flight.load(Ordering::SeqCst) >= self.prefetch {
            return None;
        }

        let mut outstanding = self.channel.outstanding.lock();
        let mut queues = self.shared.queues.lock();
        let state = queues.entry(self.queue.clone()).or_default();
        let message = state.ready.pop_front()?;

        let tag = self.shared.next_tag.fetch_add(1, Ordering::SeqCst);
        state.unacked.insert(tag, message.clone());
        outstanding.insert(tag);
        self.channel.in_flight.fetch_add(1, Ordering::SeqCst);

        Some(MemoryDelivery {
            shared: self.shared.clone(),
            channel: self.channel.clone(),
            queue: self.queue.clone(),
            tag,
            body: message.body,
            message_id: message.message_id,
            redelivered: message.redelivered,
        })
    }
}

#[async_trait]
impl BrokerChannel for MemoryConsumer {
    async fn close(&mut self) -> BrokerResult<()> {
        if !self.channel.open.swap(false, Ordering::SeqCst) {
            return Ok(());
        }

        let mut outstanding = self.channel.outstanding.lock();
        let mut queues = self.shared.queues.lock();
        let state = queues.entry(self.queue.clone()).or_default();

        let mut tags: Vec<u64> = outstanding.drain().collect();
        tags.sort_unstable_by(|a, b| b.cmp(a));
        for tag in tags {
            if let Some(mut message) = state.unacked.remove(&tag) {
                message.redelivered = true;
                state.ready.push_front(message);
                self.shared.requeued.fetch_add(1, Ordering::SeqCst);
            }
        }
        self.channel.in_flight.store(0, Ordering::SeqCst);

        drop(queues);
        drop(outstanding);
        self.shared.notify.notify_waiters();
        Ok(())
    }
}

#[async_trait]
impl ConsumeChannel for MemoryConsumer {
    type Delivery = MemoryDelivery;

    async fn next_delivery(&mut self) -> Option<BrokerResult<MemoryDelivery>> {
        loop {
            let notified = self.shared.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.shared.closed.load(Ordering::SeqCst)
                || !self.channel.open.load(Ordering::SeqCst)
            {
                return None;
            }
            if let Some(delivery) = self.try_take() {
                return Some(Ok(delivery));
            }

            notified.await;
        }
    }
}

/// A message delivered by a [`MemoryConsumer`].
pub struct MemoryDelivery {
    shared: Arc<Shared>,
    channel: Arc<ChannelState>,
    queue: String,
    tag: u64,
    body: Vec<u8>,
    message_id: Option<String>,
    redelivered: bool,
}

impl fmt::Debug for MemoryDelivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryDelivery")
            .field("queue", &self.queue)
            .field("tag", &self.tag)
            .field("message_id", &self.message_id)
            .field("redelivered", &self.redelivered)
            .finish_non_exhaustive()
    }
}

impl MemoryDelivery {
    fn settle(&self, ack: bool, requeue: bool) -> BrokerResult<()> {
        if !self.channel.open.load(Ordering::SeqCst) {
            return Err(BrokerError::ChannelClosed);
        }

        let mut outstanding = self.channel.outstanding.lock();
        if !outstanding.remove(&self.tag) {
            return Err(BrokerError::AlreadySettled(self.tag));
        }

        let mut queues = self.shared.queues.lock();
        let state = queues.entry(self.queue.clone()).or_default();
        let message = state.unacked.remove(&self.tag);

        if ack {
            self.shared.acked.fetch_add(1, Ordering::SeqCst);
        } else if requeue {
            if let Some(mut message) = message {
                message.redelivered = true;
                state.ready.push_front(message);
            }
            self.shared.requeued.fetch_add(1, Ordering::SeqCst);
        } else {
            self.shared.dropped.fetch_add(1, Ordering::SeqCst);
        }
        self.channel.in_flight.fetch_sub(1, Ordering::SeqCst);

        drop(queues);
        drop(outstanding);
        self.shared.notify.notify_waiters();
        Ok(())
    }
}

#[async_trait]
impl Delivery for MemoryDelivery {
    fn body(&self) -> &[u8] {
        &self.body
    }

    fn delivery_tag(&self) -> u64 {
        self.tag
    }

    fn redelivered(&self) -> bool {
        self.redelivered
    }

    fn message_id(&self) -> Option<&str> {
        self.message_id.as_deref()
    }

    async fn ack(&self) -> BrokerResult<()> {
        self.settle(true, false)
    }

    async fn requeue_or_drop(&self, requeue: bool) -> BrokerResult<()> {
        self.settle(false, requeue)
    }
}
