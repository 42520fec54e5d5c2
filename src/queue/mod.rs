//! Queue transport between ingestion and the pipeline consumer.
//!
//! Delivery is at-least-once: a handler marks each item acknowledged or
//! for retry, and retried items come back later with a higher attempt count.

pub mod local;

pub use local::{ConsumerOptions, LocalQueue, QueueReceiver, spawn_consumer};

use std::sync::atomic::{AtomicU8, Ordering};

use async_trait::async_trait;
use serde_json::Value;

use crate::error::QueueError;
use crate::pipeline::types::QueueMessage;

/// Producer side of a queue.
#[async_trait]
pub trait MessageQueue: Send + Sync {
    async fn send(&self, payload: &QueueMessage) -> Result<(), QueueError>;
}

/// What the transport should do with a delivered item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Ack,
    Retry,
}

const UNMARKED: u8 = 0;
const ACKED: u8 = 1;
const RETRY: u8 = 2;

/// One delivered item. The body is untyped so malformed payloads reach the
/// handler and can be dropped there.
#[derive(Debug)]
pub struct Delivery {
    body: Value,
    attempts: u32,
    state: AtomicU8,
}

impl Delivery {
    pub fn new(body: Value, attempts: u32) -> Self {
        Self {
            body,
            attempts,
            state: AtomicU8::new(UNMARKED),
        }
    }

    pub fn body(&self) -> &Value {
        &self.body
    }

    /// Delivery count, starting at 1.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Accept the item; it will not be delivered again.
    pub fn ack(&self) {
        self.state.store(ACKED, Ordering::Release);
    }

    /// Ask for redelivery after backoff.
    pub fn retry(&self) {
        self.state.store(RETRY, Ordering::Release);
    }

    /// Unmarked items count as acknowledged.
    pub fn disposition(&self) -> Disposition {
        match self.state.load(Ordering::Acquire) {
            RETRY => Disposition::Retry,
            _ => Disposition::Ack,
        }
    }
}

/// Consumer side: receives batches of deliveries.
#[async_trait]
pub trait BatchHandler: Send + Sync {
    async fn handle_batch(&self, batch: &[Delivery]);
}
