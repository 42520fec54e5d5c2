//! Queue consumer: validates deliveries and feeds them to the processor.

use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use tracing::{error, warn};

use crate::pipeline::processor::MessageProcessor;
use crate::pipeline::types::QueueMessage;
use crate::queue::{BatchHandler, Delivery};

/// Items of one batch handled at the same time.
const BATCH_CONCURRENCY: usize = 10;

pub struct QueueConsumer {
    processor: Arc<MessageProcessor>,
}

impl QueueConsumer {
    pub fn new(processor: Arc<MessageProcessor>) -> Self {
        Self { processor }
    }

    async fn handle(&self, delivery: &Delivery) {
        let mut message: QueueMessage = match serde_json::from_value(delivery.body().clone()) {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, body = %delivery.body(), "Dropping invalid queue payload");
                delivery.ack();
                return;
            }
        };
        // A redelivery may reclaim the row its failed attempt left behind.
        if delivery.attempts() > 1 {
            message.redrive = true;
        }

        match self.processor.process(&message).await {
            Ok(_) => delivery.ack(),
            Err(e) => {
                error!(
                    email_id = %message.id,
                    attempts = delivery.attempts(),
                    error = %e,
                    "Queue item failed, scheduling retry"
                );
                delivery.retry();
            }
        }
    }
}

#[async_trait]
impl BatchHandler for QueueConsumer {
    async fn handle_batch(&self, batch: &[Delivery]) {
        futures::stream::iter(batch)
            .for_each_concurrent(BATCH_CONCURRENCY, |delivery| self.handle(delivery))
            .await;
    }
}
