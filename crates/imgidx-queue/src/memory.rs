//! In-process ingestion channel
//!
//! Mirrors broker semantics closely enough to exercise the index writer:
//! deliveries stay unacked until settled, `recover` redelivers everything
//! unacked as a crashed consumer would, and dead letters are kept for
//! inspection.

use async_trait::async_trait;
use imgidx_core::{ImgIdxError, IngestionMessage, Result};
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;

use crate::{Delivery, IngestionChannel};

#[derive(Debug, Clone)]
struct Pending {
    body: Vec<u8>,
    attempt: u32,
    redelivered: bool,
}

/// A message moved to the dead-letter destination
#[derive(Debug, Clone)]
pub struct DeadLetter {
    pub body: Vec<u8>,
    pub attempt: u32,
    pub reason: String,
}

#[derive(Default)]
struct State {
    ready: VecDeque<Pending>,
    unacked: HashMap<u64, Pending>,
    dead_letters: Vec<DeadLetter>,
    next_tag: u64,
    acked: u64,
    closed: bool,
}

/// At-least-once channel held in memory
#[derive(Default)]
pub struct MemoryChannel {
    state: Mutex<State>,
    notify: Notify,
}

impl MemoryChannel {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn settle(&self, delivery: &Delivery) -> Result<Pending> {
        self.state()
            .unacked
            .remove(&delivery.tag)
            .ok_or_else(|| ImgIdxError::Channel(format!("unknown delivery tag {}", delivery.tag)))
    }

    /// Redeliver every unacked message, as after a consumer crash
    pub fn recover(&self) {
        let mut state = self.state();
        let mut tags: Vec<u64> = state.unacked.keys().copied().collect();
        tags.sort_unstable();
        for tag in tags.into_iter().rev() {
            if let Some(mut pending) = state.unacked.remove(&tag) {
                pending.redelivered = true;
                state.ready.push_front(pending);
            }
        }
        drop(state);
        self.notify.notify_waiters();
    }

    /// Messages waiting to be delivered
    pub fn ready_len(&self) -> usize {
        self.state().ready.len()
    }

    /// Messages delivered but not settled
    pub fn unacked_len(&self) -> usize {
        self.state().unacked.len()
    }

    /// Number of acknowledgments so far
    pub fn acked_count(&self) -> u64 {
        self.state().acked
    }

    /// Dead-lettered messages
    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.state().dead_letters.clone()
    }

    /// Enqueue a raw body as a first delivery, bypassing encoding
    pub fn push_raw(&self, body: Vec<u8>) {
        self.state().ready.push_back(Pending {
            body,
            attempt: 1,
            redelivered: false,
        });
        self.notify.notify_waiters();
    }

    /// Decoded messages still waiting in the queue
    pub fn ready_messages(&self) -> Vec<IngestionMessage> {
        self.state()
            .ready
            .iter()
            .filter_map(|p| IngestionMessage::from_bytes(&p.body).ok())
            .collect()
    }
}

#[async_trait]
impl IngestionChannel for MemoryChannel {
    async fn publish(&self, message: &IngestionMessage) -> Result<()> {
        let body = message.to_bytes()?;
        {
            let mut state = self.state();
            if state.closed {
                return Err(ImgIdxError::Publish("channel is closed".to_string()));
            }
            state.ready.push_back(Pending {
                body,
                attempt: 1,
                redelivered: false,
            });
        }
        self.notify.notify_waiters();
        Ok(())
    }

    async fn receive(&self) -> Result<Option<Delivery>> {
        loop {
            // Register interest before inspecting state so no wakeup is lost
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state();
                if let Some(pending) = state.ready.pop_front() {
                    state.next_tag += 1;
                    let tag = state.next_tag;
                    let delivery = Delivery {
                        tag,
                        body: pending.body.clone(),
                        attempt: pending.attempt,
                        redelivered: pending.redelivered,
                    };
                    state.unacked.insert(tag, pending);
                    return Ok(Some(delivery));
                }
                if state.closed && state.unacked.is_empty() {
                    return Ok(None);
                }
            }

            notified.await;
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<()> {
        self.settle(delivery)?;
        self.state().acked += 1;
        self.notify.notify_waiters();
        Ok(())
    }

    async fn requeue(&self, delivery: &Delivery) -> Result<()> {
        let mut pending = self.settle(delivery)?;
        pending.redelivered = true;
        self.state().ready.push_front(pending);
        self.notify.notify_waiters();
        Ok(())
    }

    async fn retry(&self, delivery: &Delivery) -> Result<()> {
        let pending = self.settle(delivery)?;
        self.state().ready.push_back(Pending {
            body: pending.body,
            attempt: pending.attempt + 1,
            redelivered: false,
        });
        self.notify.notify_waiters();
        Ok(())
    }

    async fn dead_letter(&self, delivery: &Delivery, reason: &str) -> Result<()> {
        let pending = self.settle(delivery)?;
        self.state().dead_letters.push(DeadLetter {
            body: pending.body,
            attempt: pending.attempt,
            reason: reason.to_string(),
        });
        self.notify.notify_waiters();
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.state().closed = true;
        self.notify.notify_waiters();
        Ok(())
    }
}
