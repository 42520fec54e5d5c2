//! Failed-queue retry: re-drives parked messages onto the queue.

use std::sync::Arc;

use serde_json::json;
use tracing::{info, warn};

use crate::error::DatabaseError;
use crate::queue::MessageQueue;
use crate::store::Database;
use crate::store::model::{EmailStatus, EventStatus, Stage};

/// Parked messages re-driven per run.
pub const RETRY_BATCH: usize = 50;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetryReport {
    pub attempted: usize,
    pub requeued: usize,
    pub failed: usize,
}

pub struct FailedQueueRetry {
    db: Arc<dyn Database>,
    queue: Arc<dyn MessageQueue>,
}

impl FailedQueueRetry {
    pub fn new(db: Arc<dyn Database>, queue: Arc<dyn MessageQueue>) -> Self {
        Self { db, queue }
    }

    /// Re-enqueue up to one batch of parked messages, oldest update first.
    pub async fn run(&self) -> Result<RetryReport, DatabaseError> {
        let parked = self.db.list_failed_queue(RETRY_BATCH).await?;
        let mut report = RetryReport::default();

        for email in parked {
            let Some(mut message) = self.db.get_queue_message(&email.id).await? else {
                continue;
            };
            message.redrive = true;
            report.attempted += 1;

            // Flip the status first so a fast consumer cannot be overwritten.
            self.db
                .mark_email_status(&email.id, EmailStatus::Processing, None)
                .await?;

            match self.queue.send(&message).await {
                Ok(()) => {
                    report.requeued += 1;
                    self.db
                        .insert_event(
                            &email.id,
                            Stage::Queued,
                            EventStatus::Ok,
                            Some(&json!({ "source": "failed_queue_retry" })),
                        )
                        .await?;
                }
                Err(e) => {
                    report.failed += 1;
                    warn!(email_id = %email.id, error = %e, "Re-enqueue failed, parking again");
                    self.db
                        .mark_email_status(&email.id, EmailStatus::FailedQueue, Some(&e.to_string()))
                        .await?;
                }
            }
        }

        if report.attempted > 0 {
            info!(
                attempted = report.attempted,
                requeued = report.requeued,
                failed = report.failed,
                "Failed-queue retry finished"
            );
        }
        Ok(report)
    }
}
