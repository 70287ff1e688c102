//! Error types for the reliable publisher.

use message_broker::BrokerError;
use std::time::Duration;
use thiserror::Error;
use transaction_schema::CodecError;

/// Why a single transaction did not get confirmed by the broker.
///
/// Every variant counts as one `failed` publish. None of them is retried.
#[derive(Error, Debug)]
pub enum PublishError {
    /// Transaction could not be serialized
    #[error("Encode failed: {0}")]
    Encode(#[from] CodecError),

    /// Broker refused the publish or the channel is gone
    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),

    /// Broker negatively acknowledged the publish
    #[error("Broker nacked transaction {id}")]
    Nack { id: String },

    /// No confirmation within the confirm timeout
    #[error("Confirm for transaction {id} timed out after {after:?}")]
    Timeout { id: String, after: Duration },

    /// Confirm stream ended before this publish was confirmed
    #[error("Confirm stream closed before transaction {id} was confirmed")]
    ConfirmStreamClosed { id: String },
}

/// Every publisher worker has exited, so nothing drains the job queue.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("Job queue closed")]
pub struct JobQueueClosed;
