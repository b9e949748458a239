//! imgidx Queue - Ingestion channel between the download and index stages
//!
//! The channel gives at-least-once delivery: a message stays owned by the
//! broker until the consumer acknowledges it, and is redelivered if the
//! consumer goes away first. Consumers must therefore be idempotent.
//!
//! Author: hephaex@gmail.com

use async_trait::async_trait;
use imgidx_core::{IngestionMessage, Result};

pub mod amqp;
pub mod memory;

pub use amqp::AmqpChannel;
pub use memory::{DeadLetter, MemoryChannel};

/// Header carrying the delivery attempt number (first delivery is 1)
pub const ATTEMPT_HEADER: &str = "x-imgidx-attempt";

/// Header carrying the reason a message was dead-lettered
pub const ERROR_HEADER: &str = "x-imgidx-error";

/// A message handed to a consumer and not yet settled
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Channel-scoped handle used to settle the delivery
    pub tag: u64,

    /// Raw JSON body
    pub body: Vec<u8>,

    /// How many times this message has been attempted, starting at 1
    pub attempt: u32,

    /// Set when the broker redelivers after an unacknowledged delivery
    pub redelivered: bool,
}

impl Delivery {
    /// Decode the JSON body
    pub fn decode(&self) -> Result<IngestionMessage> {
        IngestionMessage::from_bytes(&self.body)
    }
}

/// Trait for the ingestion message conduit
///
/// Every received delivery must be settled exactly once with one of
/// `ack`, `requeue`, `retry` or `dead_letter`.
#[async_trait]
pub trait IngestionChannel: Send + Sync {
    /// Publish a message without waiting for any consumer
    async fn publish(&self, message: &IngestionMessage) -> Result<()>;

    /// Wait for the next delivery; `None` once the channel is closed and drained
    async fn receive(&self) -> Result<Option<Delivery>>;

    /// Settle a delivery as processed
    async fn ack(&self, delivery: &Delivery) -> Result<()>;

    /// Return a delivery to the queue unchanged
    async fn requeue(&self, delivery: &Delivery) -> Result<()>;

    /// Put the message back with its attempt counter incremented
    async fn retry(&self, delivery: &Delivery) -> Result<()>;

    /// Move the message to the dead-letter destination
    async fn dead_letter(&self, delivery: &Delivery, reason: &str) -> Result<()>;

    /// Stop delivering and release the connection
    async fn close(&self) -> Result<()>;
}
