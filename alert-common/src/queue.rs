//! The inbound slot-event queue.
//!
//! A named Redis list with blocking pop, at-least-once: an event popped here
//! is gone from the queue, so everything downstream is biased towards
//! at-most-once to avoid duplicate fan-out storms. This is the pipeline's
//! single canonical event source.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use redis::AsyncCommands;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("redis connection failed: {0}")]
    Connection(String),
    #[error("queue pop failed: {0}")]
    Pop(String),
}

#[async_trait]
pub trait SlotQueue {
    /// Block until an event payload is available or the pop timeout elapses.
    /// `None` means the timeout passed without an event; callers loop.
    async fn pop(&self) -> Result<Option<String>, QueueError>;
}

pub struct RedisSlotQueue {
    client: redis::Client,
    queue_name: String,
    pop_timeout: Duration,
}

impl RedisSlotQueue {
    pub fn new(addr: &str, queue_name: &str, pop_timeout: Duration) -> Result<Self, QueueError> {
        let client =
            redis::Client::open(addr).map_err(|e| QueueError::Connection(e.to_string()))?;

        Ok(Self {
            client,
            queue_name: queue_name.to_owned(),
            pop_timeout,
        })
    }
}

#[async_trait]
impl SlotQueue for RedisSlotQueue {
    async fn pop(&self) -> Result<Option<String>, QueueError> {
        // Each pop runs on a dedicated connection: BRPOP pins the connection
        // for its whole blocking window, so sharing a multiplexed one would
        // stall every other caller.
        let mut conn = self
            .client
            .get_async_connection()
            .await
            .map_err(|e| QueueError::Connection(e.to_string()))?;

        let popped: Option<(String, String)> = conn
            .brpop(&self.queue_name, self.pop_timeout.as_secs() as f64)
            .await
            .map_err(|e| QueueError::Pop(e.to_string()))?;

        Ok(popped.map(|(_key, payload)| payload))
    }
}

/// In-memory queue for tests: pops drain a seeded buffer in order.
#[derive(Clone, Default)]
pub struct MockSlotQueue {
    events: Arc<Mutex<VecDeque<String>>>,
}

impl MockSlotQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, payload: &str) {
        self.events
            .lock()
            .expect("poisoned queue lock")
            .push_back(payload.to_owned());
    }

    pub fn len(&self) -> usize {
        self.events.lock().expect("poisoned queue lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl SlotQueue for MockSlotQueue {
    async fn pop(&self) -> Result<Option<String>, QueueError> {
        Ok(self.events.lock().expect("poisoned queue lock").pop_front())
    }
}
