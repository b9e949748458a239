//! Index writer
//!
//! Consumes ingestion messages, embeds the referenced image and upserts the
//! vector under the URL's stable id. A delivery is acknowledged only after
//! the upsert returned, so a crash before that point means redelivery, and
//! redelivery is harmless because the upsert is keyed by the same id.
//!
//! Per message: received -> processing -> acked | retrying | dead-lettered.
//!
//! Author: hephaex@gmail.com

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use imgidx_core::{ImgIdxError, IngestionMessage, PipelineConfig, Result, VectorRecord};
use imgidx_queue::{Delivery, IngestionChannel};
use imgidx_vector::{EmbeddingClient, VectorStore};
use tokio_util::sync::CancellationToken;

/// Longest backoff is `base * 2^MAX_BACKOFF_SHIFT`
const MAX_BACKOFF_SHIFT: u32 = 5;

// ============================================================================
// Retry policy
// ============================================================================

/// Bounded retry with exponential backoff
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts before a message is dead-lettered (first delivery counts)
    pub max_attempts: u32,

    /// Delay before the first retry
    pub backoff_base: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff_base: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            backoff_base: Duration::from_millis(config.retry_backoff_ms),
        }
    }

    /// Delay after failed attempt number `attempt`
    pub fn backoff(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(MAX_BACKOFF_SHIFT);
        self.backoff_base.saturating_mul(1u32 << shift)
    }

    /// Whether attempt number `attempt` was the last one allowed
    pub fn exhausted(&self, attempt: u32) -> bool {
        attempt >= self.max_attempts
    }
}

// ============================================================================
// Delivery state and stats
// ============================================================================

/// Lifecycle of one delivery inside the writer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryState {
    Received,
    Processing,
    Acked,
    Retrying,
    DeadLettered,
}

impl std::fmt::Display for DeliveryState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Received => "received",
            Self::Processing => "processing",
            Self::Acked => "acked",
            Self::Retrying => "retrying",
            Self::DeadLettered => "dead-lettered",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Default)]
struct IndexStats {
    acked: AtomicU64,
    retried: AtomicU64,
    dead_lettered: AtomicU64,
    requeued: AtomicU64,
}

impl IndexStats {
    fn record(&self, state: DeliveryState) {
        let counter = match state {
            DeliveryState::Acked => &self.acked,
            DeliveryState::Retrying => &self.retried,
            DeliveryState::DeadLettered => &self.dead_lettered,
            DeliveryState::Received | DeliveryState::Processing => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> IndexReport {
        IndexReport {
            acked: self.acked.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            requeued: self.requeued.load(Ordering::Relaxed),
        }
    }
}

/// Counters of settled deliveries
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IndexReport {
    pub acked: u64,
    pub retried: u64,
    pub dead_lettered: u64,
    /// Deliveries handed back because of a fatal error
    pub requeued: u64,
}

// ============================================================================
// Index writer
// ============================================================================

/// Consumer turning ingestion messages into vector records
pub struct IndexWriter {
    channel: Arc<dyn IngestionChannel>,
    embedder: Arc<dyn EmbeddingClient>,
    store: Arc<dyn VectorStore>,
    policy: RetryPolicy,
    stats: IndexStats,
}

impl IndexWriter {
    pub fn new(
        channel: Arc<dyn IngestionChannel>,
        embedder: Arc<dyn EmbeddingClient>,
        store: Arc<dyn VectorStore>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            channel,
            embedder,
            store,
            policy,
            stats: IndexStats::default(),
        }
    }

    /// Counters so far
    pub fn report(&self) -> IndexReport {
        self.stats.snapshot()
    }

    /// Embed and upsert one message; no channel interaction
    pub async fn index(&self, message: &IngestionMessage) -> Result<VectorRecord> {
        let vector = self.embedder.embed_image(&message.path).await?;
        let record = VectorRecord::from_message(message, vector);
        self.store.upsert(&record).await?;
        Ok(record)
    }

    /// Process and settle one delivery.
    ///
    /// Returns the terminal state. A fatal error requeues the delivery and is
    /// returned so the caller can stop consuming.
    pub async fn handle(&self, delivery: &Delivery) -> Result<DeliveryState> {
        tracing::debug!(
            tag = delivery.tag,
            attempt = delivery.attempt,
            redelivered = delivery.redelivered,
            state = %DeliveryState::Received,
            "Delivery received"
        );

        let message = match delivery.decode() {
            Ok(message) => message,
            Err(e) => {
                // Malformed bodies never succeed, so retrying is pointless
                return self.dead_letter(delivery, &e).await;
            }
        };

        tracing::debug!(
            url = %message.src_url,
            path = %message.path,
            attempt = delivery.attempt,
            state = %DeliveryState::Processing,
            "Processing message"
        );

        let state = match self.index(&message).await {
            Ok(record) => {
                self.channel.ack(delivery).await?;
                tracing::info!(id = %record.id, url = %message.src_url, "Indexed image");
                DeliveryState::Acked
            }
            Err(e) if e.is_fatal() => {
                if let Err(requeue_err) = self.channel.requeue(delivery).await {
                    tracing::error!(error = %requeue_err, "Failed to requeue delivery");
                } else {
                    self.stats.requeued.fetch_add(1, Ordering::Relaxed);
                }
                tracing::error!(url = %message.src_url, error = %e, "Fatal indexing error");
                return Err(e);
            }
            Err(e) => return self.fail(delivery, &message, e).await,
        };

        self.stats.record(state);
        Ok(state)
    }

    async fn fail(
        &self,
        delivery: &Delivery,
        message: &IngestionMessage,
        error: ImgIdxError,
    ) -> Result<DeliveryState> {
        if self.policy.exhausted(delivery.attempt) {
            tracing::error!(
                url = %message.src_url,
                attempt = delivery.attempt,
                error = %error,
                "Giving up on message"
            );
            return self.dead_letter(delivery, &error).await;
        }

        let delay = self.policy.backoff(delivery.attempt);
        tracing::warn!(
            url = %message.src_url,
            attempt = delivery.attempt,
            retry_in_ms = delay.as_millis() as u64,
            error = %error,
            "Indexing failed, will retry"
        );
        tokio::time::sleep(delay).await;

        self.channel.retry(delivery).await?;
        self.stats.record(DeliveryState::Retrying);
        Ok(DeliveryState::Retrying)
    }

    async fn dead_letter(&self, delivery: &Delivery, error: &ImgIdxError) -> Result<DeliveryState> {
        self.channel.dead_letter(delivery, &error.to_string()).await?;
        tracing::warn!(
            tag = delivery.tag,
            attempt = delivery.attempt,
            error = %error,
            "Message dead-lettered"
        );
        self.stats.record(DeliveryState::DeadLettered);
        Ok(DeliveryState::DeadLettered)
    }

    /// Consume with `workers` concurrent consumers until the channel drains
    /// or `shutdown` is cancelled. In-flight messages are finished first.
    pub async fn run(&self, workers: usize, shutdown: &CancellationToken) -> Result<IndexReport> {
        let workers = workers.max(1);
        tracing::info!(
            workers,
            collection = self.store.collection(),
            max_attempts = self.policy.max_attempts,
            "Index writer started"
        );

        let results = join_all((0..workers).map(|worker| self.consume(worker, shutdown))).await;
        let report = self.report();

        tracing::info!(
            acked = report.acked,
            retried = report.retried,
            dead_lettered = report.dead_lettered,
            requeued = report.requeued,
            "Index writer stopped"
        );

        results.into_iter().collect::<Result<Vec<()>>>()?;
        Ok(report)
    }

    async fn consume(&self, worker: usize, shutdown: &CancellationToken) -> Result<()> {
        loop {
            let received = tokio::select! {
                _ = shutdown.cancelled() => break,
                received = self.channel.receive() => received,
            };

            let delivery = match received {
                Ok(Some(delivery)) => delivery,
                Ok(None) => break,
                Err(e) => {
                    tracing::error!(worker, error = %e, "Lost the ingestion channel");
                    shutdown.cancel();
                    return Err(e);
                }
            };

            match self.handle(&delivery).await {
                Ok(_) => {}
                Err(e) if e.is_fatal() => {
                    shutdown.cancel();
                    return Err(e);
                }
                Err(e) => {
                    tracing::error!(worker, tag = delivery.tag, error = %e, "Failed to settle delivery");
                }
            }
        }

        tracing::debug!(worker, "Worker stopped");
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================
