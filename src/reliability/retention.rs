//! Retention cleanup: deletes expired emails, blobs first, then rows.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use futures::future::try_join_all;
use tracing::{error, info};

use crate::error::{DatabaseError, PipelineError};
use crate::objects::ObjectStore;
use crate::store::Database;
use crate::store::model::{CleanupRun, ExpiredEmail};

/// Emails removed per run.
pub const RETENTION_BATCH: usize = 200;

pub struct RetentionCleanup {
    db: Arc<dyn Database>,
    objects: Arc<dyn ObjectStore>,
    retention_days: u32,
}

impl RetentionCleanup {
    pub fn new(db: Arc<dyn Database>, objects: Arc<dyn ObjectStore>, retention_days: u32) -> Self {
        Self {
            db,
            objects,
            retention_days,
        }
    }

    pub async fn run(&self) -> Result<CleanupRun, DatabaseError> {
        self.run_at(Utc::now()).await
    }

    /// Delete one batch of emails received before the retention cutoff and
    /// record the audit row. Deletion failures end up in the row, not in the
    /// return value.
    pub async fn run_at(&self, now: DateTime<Utc>) -> Result<CleanupRun, DatabaseError> {
        let started_at = Utc::now();
        let cutoff = now - Duration::days(i64::from(self.retention_days));
        let expired = self.db.list_expired_emails(cutoff, RETENTION_BATCH).await?;

        let (deleted_count, failed_count, error) = match self.delete_batch(&expired).await {
            Ok(deleted) => (deleted, 0, None),
            Err(e) => {
                error!(batch = expired.len(), error = %e, "Retention cleanup failed");
                (0, expired.len() as u64, Some(e.to_string()))
            }
        };

        let run = CleanupRun {
            id: uuid::Uuid::new_v4().to_string(),
            started_at,
            finished_at: Utc::now(),
            deleted_count,
            failed_count,
            error,
        };
        self.db.insert_cleanup_run(&run).await?;

        if run.deleted_count > 0 || run.failed_count > 0 {
            info!(
                deleted = run.deleted_count,
                failed = run.failed_count,
                cutoff = %cutoff,
                "Retention cleanup finished"
            );
        }
        Ok(run)
    }

    async fn delete_batch(&self, expired: &[ExpiredEmail]) -> Result<u64, PipelineError> {
        if expired.is_empty() {
            return Ok(0);
        }
        let ids: Vec<String> = expired.iter().map(|e| e.id.clone()).collect();

        let mut keys = self.db.list_attachment_keys(&ids).await?;
        for email in expired {
            keys.push(email.raw_key.clone());
            keys.extend(email.parsed_key.clone());
        }

        // Blobs go first; a crash in between leaves rows without blobs,
        // never blobs without rows.
        try_join_all(keys.iter().map(|key| self.objects.delete(key))).await?;

        Ok(self.db.delete_email_cascade(&ids).await?)
    }
}
