//! Error types for broker operations

use thiserror::Error;

/// Result type alias for broker operations.
pub type BrokerResult<T> = Result<T, BrokerError>;

/// Errors that can occur while talking to the message broker.
#[derive(Error, Debug)]
pub enum BrokerError {
    /// Could not reach the broker
    #[error("Connection failed: {0}")]
    Connection(String),

    /// Channel could not be opened or configured (confirm mode, QoS, consume)
    #[error("Channel setup failed: {0}")]
    ChannelSetup(String),

    /// Broker refused the publish before any confirmation was requested
    #[error("Publish failed: {0}")]
    Publish(String),

    /// Ack or nack could not be delivered to the broker
    #[error("Acknowledge failed: {0}")]
    Acknowledge(String),

    /// Delivery was already acked or nacked
    #[error("Delivery {0} already settled")]
    AlreadySettled(u64),

    #[error("Channel closed")]
    ChannelClosed,

    /// Every channel slot in the pool is leased out
    #[error("Channel pool exhausted ({capacity} channels in use)")]
    PoolExhausted { capacity: usize },

    #[error("AMQP error: {0}")]
    Amqp(#[from] lapin::Error),
}

impl BrokerError {
    /// Errors raised while preparing a channel, as opposed to per-message failures
    pub fn is_setup_failure(&self) -> bool {
        matches!(
            self,
            BrokerError::Connection(_)
                | BrokerError::ChannelSetup(_)
                | BrokerError::PoolExhausted { .. }
        )
    }
}
