//! Ingestion: turn an inbound email into stored blobs plus a bounded queue
//! payload.
//!
//! The internal id is derived from the Message-ID, so a second ingestion of
//! the same message maps onto the first one's id and is dropped before it
//! writes anything. Blob writes run as tracked tasks on a `JoinSet` and are
//! joined before the payload is enqueued. A failed enqueue parks the payload
//! in the store so the retry routine can re-drive it later.

use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use tokio::task::JoinSet;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::LimitsConfig;
use crate::error::{DatabaseError, PipelineError, StorageError};
use crate::objects::ObjectStore;
use crate::pipeline::budget::{apply_budget, estimate_bytes, truncate_body};
use crate::pipeline::types::{
    AttachmentMeta, InboundEmail, QueueMessage, dated_key, extract_domain, infer_priority,
    truncate_chars,
};
use crate::queue::MessageQueue;
use crate::store::model::{EventStatus, Stage};
use crate::store::{ConfigStore, Database};

/// Body length used when the budgeted payload still does not fit.
pub const LAST_RESORT_BODY_LIMIT: usize = 500;

const BLACKLIST_REASON: &str = "blocked by blacklist";

/// What happened to an inbound email.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    /// Sender is blacklisted; nothing was stored.
    Rejected { reason: String },
    /// The message was already ingested under `email_id`; nothing was stored.
    Duplicate { email_id: String },
    /// Payload is on the queue.
    Queued { email_id: String, blob_failures: usize },
    /// Enqueue failed; the payload is parked as `failed_queue`.
    Parked {
        email_id: String,
        reason: String,
        blob_failures: usize,
    },
}

/// Internal id for an inbound message: stable per Message-ID, random without one.
pub fn ingest_id(message_id: Option<&str>) -> String {
    match message_id.map(str::trim).filter(|m| !m.is_empty()) {
        Some(message_id) => Uuid::new_v5(&Uuid::NAMESPACE_OID, message_id.as_bytes()).to_string(),
        None => Uuid::new_v4().to_string(),
    }
}

/// Whether the sender address or its domain is blacklisted.
pub async fn is_blocked(config: &dyn ConfigStore, sender: &str) -> Result<bool, DatabaseError> {
    let address_key = format!("blacklist:{}", sender.to_lowercase());
    let domain_key = extract_domain(sender).map(|d| format!("blacklist:domain:{d}"));

    let (by_address, by_domain) = tokio::join!(config.get_config(&address_key), async {
        match &domain_key {
            Some(key) => config.get_config(key).await,
            None => Ok(None),
        }
    });
    Ok(by_address?.is_some() || by_domain?.is_some())
}

pub struct IngestService {
    db: Arc<dyn Database>,
    config: Arc<dyn ConfigStore>,
    objects: Arc<dyn ObjectStore>,
    queue: Arc<dyn MessageQueue>,
    limits: LimitsConfig,
}

impl IngestService {
    pub fn new(
        db: Arc<dyn Database>,
        config: Arc<dyn ConfigStore>,
        objects: Arc<dyn ObjectStore>,
        queue: Arc<dyn MessageQueue>,
        limits: LimitsConfig,
    ) -> Self {
        Self {
            db,
            config,
            objects,
            queue,
            limits,
        }
    }

    pub async fn ingest(&self, email: InboundEmail) -> Result<IngestOutcome, PipelineError> {
        if is_blocked(self.config.as_ref(), &email.from).await? {
            info!(from = %email.from, "Rejected blacklisted sender");
            return Ok(IngestOutcome::Rejected {
                reason: BLACKLIST_REASON.to_string(),
            });
        }

        let id = ingest_id(email.message_id.as_deref());
        if self.already_ingested(&id).await? {
            info!(email_id = %id, "Message already ingested, skipping");
            return Ok(IngestOutcome::Duplicate { email_id: id });
        }

        let now = Utc::now();
        let mut blobs = JoinSet::new();

        let raw_key = dated_key("emails", &id, "eml", now);
        self.spawn_put(&mut blobs, raw_key.clone(), email.raw);

        let attachment_prefix = format!("emails/{id}_attachments");
        let mut attachments = Vec::with_capacity(email.attachments.len());
        for (index, attachment) in email.attachments.into_iter().enumerate() {
            let key = dated_key(&attachment_prefix, &index.to_string(), "bin", now);
            attachments.push(AttachmentMeta {
                filename: non_empty_or(attachment.filename, "unnamed"),
                mime_type: non_empty_or(attachment.mime_type, "application/octet-stream"),
                size: attachment.content.len() as u64,
                storage_key: Some(key.clone()),
            });
            self.spawn_put(&mut blobs, key, attachment.content);
        }

        let parsed_key = dated_key("emails", &format!("{id}_parsed"), "json", now);
        let parsed = json!({
            "from": email.from,
            "to": email.to,
            "subject": email.subject,
            "textBody": email.text_body,
            "hasHtml": email.has_html,
            "attachmentCount": attachments.len(),
        });
        self.spawn_put(&mut blobs, parsed_key.clone(), parsed.to_string().into_bytes());

        let body = truncate_chars(&email.text_body, self.limits.max_text_body_length);
        let body_truncated = body.len() < email.text_body.len();
        let priority = infer_priority(&email.subject, &email.text_body);

        let payload = QueueMessage {
            external_id: email.message_id.unwrap_or_else(|| id.clone()),
            id: id.clone(),
            received_at: now,
            to: email.to,
            from: email.from,
            from_name: email.from_name,
            subject: email.subject,
            text_body: body,
            has_html: email.has_html,
            attachments,
            raw_key,
            parsed_key: Some(parsed_key),
            body_truncated,
            thread_id: email.in_reply_to,
            priority,
            redrive: false,
        };
        let payload = self.fit_budget(payload);

        let blob_failures = join_blobs(&mut blobs, &id).await;

        self.db
            .insert_event(
                &id,
                Stage::Received,
                EventStatus::Ok,
                Some(&json!({
                    "to": payload.to,
                    "attachmentCount": payload.attachments.len(),
                    "blobFailures": blob_failures,
                })),
            )
            .await?;

        match self.queue.send(&payload).await {
            Ok(()) => {
                self.db
                    .insert_event(
                        &id,
                        Stage::Queued,
                        EventStatus::Ok,
                        Some(&json!({
                            "bytes": estimate_bytes(&payload),
                            "bodyTruncated": payload.body_truncated,
                        })),
                    )
                    .await?;
                info!(email_id = %id, blob_failures, "Message queued");
                Ok(IngestOutcome::Queued {
                    email_id: id,
                    blob_failures,
                })
            }
            Err(e) => {
                let reason = e.to_string();
                warn!(email_id = %id, error = %reason, "Enqueue failed, parking message");
                self.db.save_failed_queue(&payload, &reason).await?;
                self.db
                    .insert_event(
                        &id,
                        Stage::Queued,
                        EventStatus::Failed,
                        Some(&json!({ "error": reason })),
                    )
                    .await?;
                Ok(IngestOutcome::Parked {
                    email_id: id,
                    reason,
                    blob_failures,
                })
            }
        }
    }

    /// A stored row or any recorded event means the id has been seen.
    async fn already_ingested(&self, id: &str) -> Result<bool, DatabaseError> {
        let (email, events) = futures::try_join!(self.db.get_email(id), self.db.list_events(id))?;
        Ok(email.is_some() || !events.is_empty())
    }

    /// Budget the payload, cutting the body to the last-resort length if
    /// structure-preserving steps were not enough.
    fn fit_budget(&self, payload: QueueMessage) -> QueueMessage {
        let max = self.limits.max_queue_message_bytes;
        let mut payload = apply_budget(payload, max);
        if estimate_bytes(&payload) > max {
            truncate_body(&mut payload, LAST_RESORT_BODY_LIMIT);
        }
        payload
    }

    fn spawn_put(&self, set: &mut JoinSet<Result<(), StorageError>>, key: String, bytes: Vec<u8>) {
        let objects = Arc::clone(&self.objects);
        set.spawn(async move { objects.put(&key, bytes).await });
    }
}

async fn join_blobs(set: &mut JoinSet<Result<(), StorageError>>, email_id: &str) -> usize {
    let mut failures = 0;
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!(email_id = %email_id, error = %e, "Blob write failed");
                failures += 1;
            }
            Err(e) => {
                warn!(email_id = %email_id, error = %e, "Blob write task aborted");
                failures += 1;
            }
        }
    }
    failures
}

fn non_empty_or(value: String, fallback: &str) -> String {
    if value.trim().is_empty() {
        fallback.to_string()
    } else {
        value
    }
}
