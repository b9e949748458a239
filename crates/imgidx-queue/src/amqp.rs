//! RabbitMQ implementation of the ingestion channel
//!
//! Messages go through the default exchange, routed directly by queue name.
//! The index queue is auto-deleted once no consumer references it; the
//! dead-letter queue outlives the process so failures can be inspected.
//!
//! Because the index queue is auto-delete, the broker drops it and every
//! message still in it when the last consumer cancels, requeued deliveries
//! included. A requeue only reaches another live consumer; after a full stop
//! the images have to be re-published by running the download stage again.
//!
//! Author: hephaex@gmail.com

use async_trait::async_trait;
use futures::StreamExt;
use imgidx_core::{BrokerConfig, ImgIdxError, IngestionMessage, Result};
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
    BasicQosOptions, ConfirmSelectOptions, QueueDeclareOptions,
};
use lapin::types::{AMQPValue, FieldTable, LongString, ShortString};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, Consumer};
use tokio::sync::Mutex;

use crate::{Delivery, IngestionChannel, ATTEMPT_HEADER, ERROR_HEADER};

const CONSUMER_TAG: &str = "imgidx-indexer";

/// RabbitMQ-backed ingestion channel
pub struct AmqpChannel {
    connection: Connection,
    channel: Channel,
    queue: String,
    dead_letter_queue: String,
    consumer: Mutex<Option<Consumer>>,
}

impl AmqpChannel {
    /// Connect, enable publisher confirms, and declare both queues.
    ///
    /// `prefetch` bounds how many unacked deliveries the broker pushes to
    /// this connection at once.
    pub async fn connect(config: &BrokerConfig, prefetch: u16) -> Result<Self> {
        let connection = Connection::connect(&config.amqp_url(), ConnectionProperties::default())
            .await
            .map_err(|e| {
                ImgIdxError::Channel(format!("Failed to connect to {}: {e}", config.host))
            })?;

        let channel = connection
            .create_channel()
            .await
            .map_err(|e| ImgIdxError::Channel(format!("Failed to open channel: {e}")))?;

        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| ImgIdxError::Channel(format!("Failed to enable confirms: {e}")))?;

        channel
            .basic_qos(prefetch.max(1), BasicQosOptions::default())
            .await
            .map_err(|e| ImgIdxError::Channel(format!("Failed to set prefetch: {e}")))?;

        channel
            .queue_declare(
                &config.queue,
                QueueDeclareOptions {
                    auto_delete: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| ImgIdxError::Channel(format!("Failed to declare {}: {e}", config.queue)))?;

        channel
            .queue_declare(
                &config.dead_letter_queue,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| {
                ImgIdxError::Channel(format!(
                    "Failed to declare {}: {e}",
                    config.dead_letter_queue
                ))
            })?;

        tracing::info!(host = %config.host, queue = %config.queue, "Connected to broker");

        Ok(Self {
            connection,
            channel,
            queue: config.queue.clone(),
            dead_letter_queue: config.dead_letter_queue.clone(),
            consumer: Mutex::new(None),
        })
    }

    async fn send(&self, queue: &str, body: &[u8], headers: FieldTable) -> Result<()> {
        let properties = BasicProperties::default()
            .with_content_type(ShortString::from("application/json"))
            .with_delivery_mode(2)
            .with_headers(headers);

        let confirm = self
            .channel
            .basic_publish("", queue, BasicPublishOptions::default(), body, properties)
            .await
            .map_err(|e| ImgIdxError::Publish(format!("Failed to publish to {queue}: {e}")))?
            .await
            .map_err(|e| ImgIdxError::Publish(format!("Publish to {queue} not confirmed: {e}")))?;

        if confirm.is_nack() {
            return Err(ImgIdxError::Publish(format!("Broker rejected message for {queue}")));
        }
        Ok(())
    }
}

fn attempt_headers(attempt: u32) -> FieldTable {
    let mut headers = FieldTable::default();
    headers.insert(ShortString::from(ATTEMPT_HEADER), AMQPValue::LongUInt(attempt));
    headers
}

/// Attempt number carried by a delivery; missing or malformed means first attempt
pub(crate) fn attempt_from_headers(headers: Option<&FieldTable>) -> u32 {
    let value = headers.and_then(|h| h.inner().get(&ShortString::from(ATTEMPT_HEADER)));
    let attempt = match value {
        Some(AMQPValue::LongUInt(n)) => Some(*n),
        Some(AMQPValue::LongInt(n)) => u32::try_from(*n).ok(),
        Some(AMQPValue::LongLongInt(n)) => u32::try_from(*n).ok(),
        Some(AMQPValue::ShortUInt(n)) => Some(u32::from(*n)),
        Some(AMQPValue::ShortShortUInt(n)) => Some(u32::from(*n)),
        _ => None,
    };
    attempt.unwrap_or(1).max(1)
}

#[async_trait]
impl IngestionChannel for AmqpChannel {
    async fn publish(&self, message: &IngestionMessage) -> Result<()> {
        let body = message.to_bytes()?;
        self.send(&self.queue, &body, attempt_headers(1)).await
    }

    async fn receive(&self) -> Result<Option<Delivery>> {
        let mut guard = self.consumer.lock().await;
        if guard.is_none() {
            let consumer = self
                .channel
                .basic_consume(
                    &self.queue,
                    CONSUMER_TAG,
                    BasicConsumeOptions::default(),
                    FieldTable::default(),
                )
                .await
                .map_err(|e| {
                    ImgIdxError::Channel(format!("Failed to consume {}: {e}", self.queue))
                })?;
            *guard = Some(consumer);
        }

        let Some(consumer) = guard.as_mut() else {
            return Ok(None);
        };

        match consumer.next().await {
            Some(Ok(delivery)) => Ok(Some(Delivery {
                tag: delivery.delivery_tag,
                attempt: attempt_from_headers(delivery.properties.headers().as_ref()),
                redelivered: delivery.redelivered,
                body: delivery.data,
            })),
            Some(Err(e)) => Err(ImgIdxError::Channel(format!("Delivery failed: {e}"))),
            None => Ok(None),
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<()> {
        self.channel
            .basic_ack(delivery.tag, BasicAckOptions::default())
            .await
            .map_err(|e| ImgIdxError::Channel(format!("Failed to ack {}: {e}", delivery.tag)))
    }

    async fn requeue(&self, delivery: &Delivery) -> Result<()> {
        self.channel
            .basic_nack(
                delivery.tag,
                BasicNackOptions {
                    requeue: true,
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| ImgIdxError::Channel(format!("Failed to nack {}: {e}", delivery.tag)))
    }

    async fn retry(&self, delivery: &Delivery) -> Result<()> {
        // Republish first: a crash in between duplicates the message, never loses it
        self.send(&self.queue, &delivery.body, attempt_headers(delivery.attempt + 1))
            .await?;
        self.ack(delivery).await
    }

    async fn dead_letter(&self, delivery: &Delivery, reason: &str) -> Result<()> {
        let mut headers = attempt_headers(delivery.attempt);
        headers.insert(
            ShortString::from(ERROR_HEADER),
            AMQPValue::LongString(LongString::from(reason)),
        );
        self.send(&self.dead_letter_queue, &delivery.body, headers)
            .await?;
        self.ack(delivery).await
    }

    async fn close(&self) -> Result<()> {
        self.channel
            .close(200, "Bye")
            .await
            .map_err(|e| ImgIdxError::Channel(format!("Failed to close channel: {e}")))?;
        self.connection
            .close(200, "Bye")
            .await
            .map_err(|e| ImgIdxError::Channel(format!("Failed to close connection: {e}")))?;

        tracing::info!("Broker connection closed");
        Ok(())
    }
}
