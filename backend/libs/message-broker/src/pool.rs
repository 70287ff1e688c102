//! Exclusive channel leasing
//!
//! A [`ChannelPool`] bounds how many channels the process opens against one
//! broker and hands each worker a [`ChannelLease`] it owns outright. The lease
//! is not `Clone`; moving it into a worker task is what makes the channel
//! exclusive.

use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

use crate::{Broker, BrokerChannel, BrokerError, BrokerResult};

/// Bounded source of exclusive broker channels.
pub struct ChannelPool<B: Broker> {
    broker: Arc<B>,
    permits: Arc<Semaphore>,
    capacity: usize,
}

impl<B: Broker> Clone for ChannelPool<B> {
    fn clone(&self) -> Self {
        Self {
            broker: self.broker.clone(),
            permits: self.permits.clone(),
            capacity: self.capacity,
        }
    }
}

impl<B: Broker> ChannelPool<B> {
    /// Create a pool allowing at most `capacity` channels open at once
    pub fn new(broker: Arc<B>, capacity: usize) -> Self {
        Self {
            broker,
            permits: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    pub fn broker(&self) -> &Arc<B> {
        &self.broker
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of leases currently held
    pub fn in_use(&self) -> usize {
        self.capacity - self.permits.available_permits()
    }

    /// Lease a confirm-mode publishing channel
    pub async fn publisher(&self, queue: &str) -> BrokerResult<ChannelLease<B::Publisher>> {
        let permit = self.reserve()?;
        let channel = self.broker.open_publisher(queue).await?;
        debug!(queue = %queue, in_use = self.in_use(), "Publisher channel leased");
        Ok(ChannelLease::new(channel, permit))
    }

    /// Lease a consuming channel bounded by `prefetch`
    pub async fn consumer(
        &self,
        queue: &str,
        prefetch: u16,
    ) -> BrokerResult<ChannelLease<B::Consumer>> {
        let permit = self.reserve()?;
        let channel = self.broker.open_consumer(queue, prefetch).await?;
        debug!(
            queue = %queue,
            prefetch = prefetch,
            in_use = self.in_use(),
            "Consumer channel leased"
        );
        Ok(ChannelLease::new(channel, permit))
    }

    fn reserve(&self) -> BrokerResult<OwnedSemaphorePermit> {
        self.permits
            .clone()
            .try_acquire_owned()
            .map_err(|_| BrokerError::PoolExhausted {
                capacity: self.capacity,
            })
    }
}

/// A channel owned by exactly one worker.
///
/// Dropping the lease frees the pool slot; [`ChannelLease::release`] also
/// closes the channel cleanly first.
pub struct ChannelLease<C: BrokerChannel> {
    channel: C,
    _permit: OwnedSemaphorePermit,
}

impl<C: BrokerChannel> ChannelLease<C> {
    fn new(channel: C, permit: OwnedSemaphorePermit) -> Self {
        Self {
            channel,
            _permit: permit,
        }
    }

    /// Close the channel and return the slot to the pool
    pub async fn release(mut self) {
        if let Err(e) = self.channel.close().await {
            warn!(error = %e, "Failed to close leased channel");
        }
    }
}

impl<C: BrokerChannel> Deref for ChannelLease<C> {
    type Target = C;

    fn deref(&self) -> &C {
        &self.channel
    }
}

impl<C: BrokerChannel> DerefMut for ChannelLease<C> {
    fn deref_mut(&mut self) -> &mut C {
        &mut self.channel
    }
}
