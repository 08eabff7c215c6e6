use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use eyre::{Result, WrapErr};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::Mutex;

/// Deliveries per message before it is routed to the dead-letter buffer.
pub const DEFAULT_MAX_RECEIVE_COUNT: u32 = 3;

/// A message pulled from a queue. The receipt handle is what gets
/// acked or nacked.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub receipt: u64,
    pub body: String,
    pub receive_count: u32,
}

/// Minimal queue seam so the pipeline is not tied to one provider.
/// `receive` is non-blocking; consumers poll and back off when empty.
#[async_trait]
pub trait MessageQueue: Send + Sync {
    async fn publish(&self, body: String) -> Result<()>;
    async fn receive(&self) -> Result<Option<Delivery>>;
    /// Drop a delivered message for good.
    async fn ack(&self, receipt: u64) -> Result<()>;
    /// Return a delivered message for redelivery; once its receive
    /// count reaches the maximum it is dead-lettered instead.
    async fn nack(&self, receipt: u64) -> Result<()>;
    /// Number of messages currently ready for delivery.
    async fn depth(&self) -> usize;
}

pub async fn publish_json<T: Serialize>(queue: &dyn MessageQueue, value: &T) -> Result<()> {
    let body = serde_json::to_string(value).wrap_err("failed to encode queue message")?;
    queue.publish(body).await
}

pub fn decode_message<T: DeserializeOwned>(body: &str) -> Result<T> {
    serde_json::from_str(body).wrap_err("failed to decode queue message")
}

#[derive(Debug)]
struct QueuedMessage {
    body: String,
    receive_count: u32,
}

#[derive(Debug, Default)]
struct QueueState {
    ready: VecDeque<QueuedMessage>,
    in_flight: HashMap<u64, QueuedMessage>,
    dead: Vec<String>,
    next_receipt: u64,
}

/// In-process queue with redelivery and dead-letter semantics. The
/// reference adapter used by the local pipeline and the tests.
pub struct MemoryQueue {
    name: String,
    max_receive_count: u32,
    state: Mutex<QueueState>,
}

impl MemoryQueue {
    pub fn new(name: &str) -> Self {
        Self::with_max_receive_count(name, DEFAULT_MAX_RECEIVE_COUNT)
    }

    pub fn with_max_receive_count(name: &str, max_receive_count: u32) -> Self {
        Self {
            name: name.to_string(),
            max_receive_count: max_receive_count.max(1),
            state: Mutex::new(QueueState::default()),
        }
    }

    /// Bodies that exhausted their deliveries. Not replayed by the core.
    pub async fn dead_letters(&self) -> Vec<String> {
        self.state.lock().await.dead.clone()
    }

    pub async fn in_flight_count(&self) -> usize {
        self.state.lock().await.in_flight.len()
    }
}

#[async_trait]
impl MessageQueue for MemoryQueue {
    async fn publish(&self, body: String) -> Result<()> {
        let mut state = self.state.lock().await;
        state.ready.push_back(QueuedMessage {
            body,
            receive_count: 0,
        });
        log::trace!("[queue] publish: queue={} depth={}", self.name, state.ready.len());
        Ok(())
    }

    async fn receive(&self) -> Result<Option<Delivery>> {
        let mut state = self.state.lock().await;
        let Some(mut message) = state.ready.pop_front() else {
            return Ok(None);
        };

        message.receive_count += 1;
        state.next_receipt += 1;
        let receipt = state.next_receipt;

        let delivery = Delivery {
            receipt,
            body: message.body.clone(),
            receive_count: message.receive_count,
        };
        state.in_flight.insert(receipt, message);

        Ok(Some(delivery))
    }

    async fn ack(&self, receipt: u64) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.in_flight.remove(&receipt).is_none() {
            log::warn!("[queue] ack_unknown_receipt: queue={} receipt={}", self.name, receipt);
        }
        Ok(())
    }

    async fn nack(&self, receipt: u64) -> Result<()> {
        let mut state = self.state.lock().await;
        let Some(message) = state.in_flight.remove(&receipt) else {
            log::warn!("[queue] nack_unknown_receipt: queue={} receipt={}", self.name, receipt);
            return Ok(());
        };

        if message.receive_count >= self.max_receive_count {
            log::warn!(
                "[queue] dead_letter: queue={} receive_count={} max={}",
                self.name,
                message.receive_count,
                self.max_receive_count
            );
            state.dead.push(message.body);
        } else {
            state.ready.push_back(message);
        }
        Ok(())
    }

    async fn depth(&self) -> usize {
        self.state.lock().await.ready.len()
    }
}
