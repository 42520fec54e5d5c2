//! Persistence traits: one async interface for pipeline state and one for
//! the key-value configuration store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::classify::schema::{Classification, ReplyDraft};
use crate::error::DatabaseError;
use crate::pipeline::types::{AttachmentMeta, QueueMessage};
use crate::store::model::{
    ActionLogEntry, ActionStatus, ActionType, ClaimOutcome, CleanupRun, EmailRecord, EmailStatus,
    EventStatus, ExpiredEmail, ManualReviewTask, NewPromptTemplate, ProcessingEvent,
    PromptTemplate, RawProviderTrace, ReviewPriority, ReviewStatus, Stage, StoredClassification,
};

/// Backend-agnostic store for emails and everything hanging off them.
#[async_trait]
pub trait Database: Send + Sync {
    /// Run all pending schema migrations.
    async fn run_migrations(&self) -> Result<(), DatabaseError>;

    // ── Emails ──────────────────────────────────────────────────────

    /// Idempotent insert keyed by `external_id`. A re-driven payload may take
    /// over a row that is parked, failed, or still marked processing.
    async fn claim_email(&self, payload: &QueueMessage) -> Result<ClaimOutcome, DatabaseError>;

    /// Park a payload that could not be enqueued (upsert, status `failed_queue`).
    async fn save_failed_queue(
        &self,
        payload: &QueueMessage,
        reason: &str,
    ) -> Result<(), DatabaseError>;

    /// Get an email by internal id.
    async fn get_email(&self, id: &str) -> Result<Option<EmailRecord>, DatabaseError>;

    /// Rebuild the queue payload of a stored email, attachments included.
    async fn get_queue_message(&self, id: &str) -> Result<Option<QueueMessage>, DatabaseError>;

    /// Set status and last error (truncated to 2000 chars).
    async fn mark_email_status(
        &self,
        id: &str,
        status: EmailStatus,
        error: Option<&str>,
    ) -> Result<(), DatabaseError>;

    /// Parked emails, least recently updated first.
    async fn list_failed_queue(&self, limit: usize) -> Result<Vec<EmailRecord>, DatabaseError>;

    /// Set or clear the legal-hold flag. Returns false when the email is unknown.
    async fn set_legal_hold(&self, id: &str, legal_hold: bool) -> Result<bool, DatabaseError>;

    // ── Attachments ─────────────────────────────────────────────────

    /// Replace the attachment rows of an email in one transaction.
    async fn replace_attachments(
        &self,
        email_id: &str,
        attachments: &[AttachmentMeta],
    ) -> Result<(), DatabaseError>;

    /// Attachments of an email in original order.
    async fn list_attachments(&self, email_id: &str) -> Result<Vec<AttachmentMeta>, DatabaseError>;

    // ── AI results ──────────────────────────────────────────────────

    /// Insert or fully replace the classification of an email.
    async fn upsert_classification(
        &self,
        email_id: &str,
        classification: &Classification,
        provider: &str,
        model: &str,
        processing_ms: u64,
    ) -> Result<(), DatabaseError>;

    /// Attach a reply draft to the email's classification row.
    async fn upsert_reply_draft(
        &self,
        email_id: &str,
        draft: &ReplyDraft,
    ) -> Result<(), DatabaseError>;

    async fn get_classification(
        &self,
        email_id: &str,
    ) -> Result<Option<StoredClassification>, DatabaseError>;

    /// Append an AI call audit record.
    async fn insert_raw_trace(
        &self,
        email_id: &str,
        trace: &RawProviderTrace,
    ) -> Result<(), DatabaseError>;

    /// Most recent AI call audit record for an email.
    async fn latest_raw_trace(
        &self,
        email_id: &str,
    ) -> Result<Option<RawProviderTrace>, DatabaseError>;

    // ── Action logs ─────────────────────────────────────────────────

    /// Append an action log entry (error truncated to 2000 chars).
    async fn insert_action_log(
        &self,
        email_id: &str,
        action_type: ActionType,
        action_config: &Value,
        status: ActionStatus,
        error: Option<&str>,
    ) -> Result<(), DatabaseError>;

    async fn list_action_logs(&self, email_id: &str)
    -> Result<Vec<ActionLogEntry>, DatabaseError>;

    // ── Processing events ───────────────────────────────────────────

    /// Append a timeline event.
    async fn insert_event(
        &self,
        email_id: &str,
        stage: Stage,
        status: EventStatus,
        detail: Option<&Value>,
    ) -> Result<(), DatabaseError>;

    /// Timeline of an email, oldest first.
    async fn list_events(&self, email_id: &str) -> Result<Vec<ProcessingEvent>, DatabaseError>;

    // ── Manual review ───────────────────────────────────────────────

    /// Create a pending review task.
    async fn create_manual_review(
        &self,
        email_id: &str,
        priority: ReviewPriority,
        reason: &str,
    ) -> Result<ManualReviewTask, DatabaseError>;

    async fn get_manual_review(&self, id: &str)
    -> Result<Option<ManualReviewTask>, DatabaseError>;

    /// Newest first, optionally filtered by status.
    async fn list_manual_reviews(
        &self,
        status: Option<ReviewStatus>,
        limit: usize,
    ) -> Result<Vec<ManualReviewTask>, DatabaseError>;

    /// Pending, acknowledged and processing tasks, oldest first.
    async fn list_open_manual_reviews(&self) -> Result<Vec<ManualReviewTask>, DatabaseError>;

    async fn list_manual_reviews_for_email(
        &self,
        email_id: &str,
    ) -> Result<Vec<ManualReviewTask>, DatabaseError>;

    /// Persist the status, assignee and timestamps of a task after a transition.
    async fn save_manual_review(&self, task: &ManualReviewTask) -> Result<(), DatabaseError>;

    // ── Prompt templates ────────────────────────────────────────────

    /// Create a new, inactive template version.
    async fn create_prompt_template(
        &self,
        template: &NewPromptTemplate,
    ) -> Result<PromptTemplate, DatabaseError>;

    /// Make one version the only active version of its name.
    async fn activate_prompt_template(&self, name: &str, version: i64)
    -> Result<(), DatabaseError>;

    async fn list_prompt_templates(
        &self,
        name: Option<&str>,
    ) -> Result<Vec<PromptTemplate>, DatabaseError>;

    async fn get_active_prompt(&self, name: &str) -> Result<Option<PromptTemplate>, DatabaseError>;

    // ── Retention ───────────────────────────────────────────────────

    /// Emails received before `cutoff` and not on legal hold, oldest first.
    async fn list_expired_emails(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ExpiredEmail>, DatabaseError>;

    /// Storage keys of every attachment belonging to the given emails.
    async fn list_attachment_keys(&self, email_ids: &[String])
    -> Result<Vec<String>, DatabaseError>;

    /// Delete the emails and all dependent rows in one transaction.
    /// Returns the number of email rows removed.
    async fn delete_email_cascade(&self, email_ids: &[String]) -> Result<u64, DatabaseError>;

    async fn insert_cleanup_run(&self, run: &CleanupRun) -> Result<(), DatabaseError>;

    /// Most recent runs first.
    async fn list_cleanup_runs(&self, limit: usize) -> Result<Vec<CleanupRun>, DatabaseError>;
}

/// Key-value configuration store (rules, blacklist entries).
#[async_trait]
pub trait ConfigStore: Send + Sync {
    async fn get_config(&self, key: &str) -> Result<Option<String>, DatabaseError>;

    async fn set_config(&self, key: &str, value: &str) -> Result<(), DatabaseError>;

    async fn delete_config(&self, key: &str) -> Result<(), DatabaseError>;
}
