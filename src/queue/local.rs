//! In-process queue on a bounded `tokio::sync::mpsc` channel.
//!
//! A full channel is reported as congestion rather than awaited, so the
//! producer can park the message and let the retry routine re-drive it.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::QueueError;
use crate::pipeline::types::QueueMessage;
use crate::queue::{BatchHandler, Delivery, Disposition, MessageQueue};

#[derive(Debug)]
struct Envelope {
    body: Value,
    attempts: u32,
}

/// Receiving half, handed to [`spawn_consumer`].
pub struct QueueReceiver(mpsc::Receiver<Envelope>);

pub struct LocalQueue {
    tx: mpsc::Sender<Envelope>,
}

impl LocalQueue {
    pub fn new(capacity: usize) -> (Arc<Self>, QueueReceiver) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Arc::new(Self { tx }), QueueReceiver(rx))
    }

    /// Enqueue an arbitrary JSON body (malformed payloads included).
    pub fn send_raw(&self, body: Value) -> Result<(), QueueError> {
        self.tx
            .try_send(Envelope { body, attempts: 1 })
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => QueueError::Congested,
                mpsc::error::TrySendError::Closed(_) => QueueError::Closed,
            })
    }

    async fn redeliver(&self, envelope: Envelope) {
        if self.tx.send(envelope).await.is_err() {
            warn!("Queue closed before redelivery");
        }
    }
}

#[async_trait]
impl MessageQueue for LocalQueue {
    async fn send(&self, payload: &QueueMessage) -> Result<(), QueueError> {
        self.send_raw(serde_json::to_value(payload)?)
    }
}

/// Consumer tuning.
#[derive(Debug, Clone, Copy)]
pub struct ConsumerOptions {
    pub batch_size: usize,
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for ConsumerOptions {
    fn default() -> Self {
        Self {
            batch_size: 10,
            max_attempts: 5,
            base_backoff: Duration::from_secs(2),
            max_backoff: Duration::from_secs(120),
        }
    }
}

impl ConsumerOptions {
    /// Exponential backoff for the given completed attempt count, plus up to
    /// 25% random jitter.
    pub fn backoff(&self, attempts: u32) -> Duration {
        let exp = self
            .base_backoff
            .saturating_mul(2u32.saturating_pow(attempts.saturating_sub(1)))
            .min(self.max_backoff);
        let jitter_ms = (exp.as_millis() as u64) / 4;
        let jitter = if jitter_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=jitter_ms)
        };
        exp + Duration::from_millis(jitter)
    }
}

/// Spawn the consumer loop feeding batches to `handler`.
///
/// Returns a `JoinHandle` and a shutdown flag. Set the flag to stop consuming.
pub fn spawn_consumer(
    queue: Arc<LocalQueue>,
    receiver: QueueReceiver,
    handler: Arc<dyn BatchHandler>,
    options: ConsumerOptions,
) -> (JoinHandle<()>, Arc<AtomicBool>) {
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_flag = Arc::clone(&shutdown);
    let QueueReceiver(mut rx) = receiver;

    let handle = tokio::spawn(async move {
        info!(batch_size = options.batch_size, "Queue consumer started");
        let mut buf = Vec::with_capacity(options.batch_size);

        loop {
            if shutdown.load(Ordering::Relaxed) {
                info!("Queue consumer shutting down");
                return;
            }

            let received = match tokio::time::timeout(
                Duration::from_millis(500),
                rx.recv_many(&mut buf, options.batch_size),
            )
            .await
            {
                Ok(0) => {
                    info!("Queue closed, consumer exiting");
                    return;
                }
                Ok(n) => n,
                Err(_) => continue,
            };

            debug!(count = received, "Dispatching batch");
            let batch: Vec<Delivery> = buf
                .drain(..)
                .map(|env| Delivery::new(env.body, env.attempts))
                .collect();
            handler.handle_batch(&batch).await;

            for delivery in batch {
                if delivery.disposition() == Disposition::Ack {
                    continue;
                }
                let attempts = delivery.attempts();
                if attempts >= options.max_attempts {
                    error!(
                        attempts,
                        body = %delivery.body(),
                        "Delivery exhausted retries, dead-lettering"
                    );
                    continue;
                }

                let delay = options.backoff(attempts);
                let queue = Arc::clone(&queue);
                let envelope = Envelope {
                    body: delivery.body().clone(),
                    attempts: attempts + 1,
                };
                debug!(attempts, delay_ms = delay.as_millis() as u64, "Scheduling redelivery");
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    queue.redeliver(envelope).await;
                });
            }
        }
    });

    (handle, shutdown_flag)
}
