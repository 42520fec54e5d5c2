//! Persisted entities and their status enums.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::classify::schema::{Classification, ReplyDraft};
use crate::pipeline::types::MessagePriority;

// ── Emails ──────────────────────────────────────────────────────────

/// Lifecycle status of an EmailRecord.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmailStatus {
    Processing,
    Done,
    ManualReview,
    Error,
    FailedQueue,
}

impl EmailStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EmailStatus::Processing => "processing",
            EmailStatus::Done => "done",
            EmailStatus::ManualReview => "manual_review",
            EmailStatus::Error => "error",
            EmailStatus::FailedQueue => "failed_queue",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "done" => EmailStatus::Done,
            "manual_review" => EmailStatus::ManualReview,
            "error" => EmailStatus::Error,
            "failed_queue" => EmailStatus::FailedQueue,
            _ => EmailStatus::Processing,
        }
    }
}

/// One logically distinct inbound message.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EmailRecord {
    pub id: String,
    pub external_id: String,
    pub thread_id: Option<String>,
    pub received_at: DateTime<Utc>,
    pub to: String,
    pub from: String,
    pub from_name: String,
    pub subject: String,
    pub text_body: String,
    pub body_truncated: bool,
    pub has_html: bool,
    pub priority: MessagePriority,
    pub raw_key: String,
    pub parsed_key: Option<String>,
    pub status: EmailStatus,
    pub last_error: Option<String>,
    pub legal_hold: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Result of the dedup insert at the start of processing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// First sighting of this dedup key.
    Inserted,
    /// A re-driven message took over its parked or failed row.
    Reclaimed,
    /// Already known; nothing to do.
    Duplicate,
}

/// Storage pointers of an email selected for retention cleanup.
#[derive(Debug, Clone, PartialEq)]
pub struct ExpiredEmail {
    pub id: String,
    pub raw_key: String,
    pub parsed_key: Option<String>,
}

// ── AI results ──────────────────────────────────────────────────────

/// Current classification (and draft) for an email, with attribution.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredClassification {
    pub email_id: String,
    pub classification: Classification,
    pub reply_draft: Option<ReplyDraft>,
    pub provider: String,
    pub model: String,
    pub processing_ms: u64,
    pub updated_at: DateTime<Utc>,
}

/// Audit record of one AI call.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RawProviderTrace {
    pub provider: String,
    pub model: String,
    /// Request payload with PII redacted.
    pub request_redacted: String,
    /// Raw response body as received.
    pub response_text: Option<String>,
    /// Normalised response JSON, when the body parsed.
    pub response_json: Option<String>,
    pub created_at: DateTime<Utc>,
}

// ── Action logs ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    DropSpam,
    NotifySlack,
    NotifyWebhook,
    ManualReviewCreated,
    ReplyDraft,
    ReplySent,
    ReplySendSkipped,
    ReplySendFailed,
    AiProcess,
}

impl ActionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionType::DropSpam => "drop_spam",
            ActionType::NotifySlack => "notify_slack",
            ActionType::NotifyWebhook => "notify_webhook",
            ActionType::ManualReviewCreated => "manual_review_created",
            ActionType::ReplyDraft => "reply_draft",
            ActionType::ReplySent => "reply_sent",
            ActionType::ReplySendSkipped => "reply_send_skipped",
            ActionType::ReplySendFailed => "reply_send_failed",
            ActionType::AiProcess => "ai_process",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "drop_spam" => ActionType::DropSpam,
            "notify_slack" => ActionType::NotifySlack,
            "notify_webhook" => ActionType::NotifyWebhook,
            "manual_review_created" => ActionType::ManualReviewCreated,
            "reply_draft" => ActionType::ReplyDraft,
            "reply_sent" => ActionType::ReplySent,
            "reply_send_skipped" => ActionType::ReplySendSkipped,
            "reply_send_failed" => ActionType::ReplySendFailed,
            "ai_process" => ActionType::AiProcess,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    Success,
    Failed,
}

impl ActionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionStatus::Success => "success",
            ActionStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Self {
        if s == "success" {
            ActionStatus::Success
        } else {
            ActionStatus::Failed
        }
    }
}

/// Append-only record of one attempted side effect.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionLogEntry {
    pub id: String,
    pub email_id: String,
    pub action_type: ActionType,
    pub action_config: Value,
    pub status: ActionStatus,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

// ── Processing timeline ─────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Received,
    Queued,
    Processing,
    AiDone,
    ActionDone,
    ManualReview,
    Error,
    Retry,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Received => "received",
            Stage::Queued => "queued",
            Stage::Processing => "processing",
            Stage::AiDone => "ai_done",
            Stage::ActionDone => "action_done",
            Stage::ManualReview => "manual_review",
            Stage::Error => "error",
            Stage::Retry => "retry",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "received" => Stage::Received,
            "queued" => Stage::Queued,
            "processing" => Stage::Processing,
            "ai_done" => Stage::AiDone,
            "action_done" => Stage::ActionDone,
            "manual_review" => Stage::ManualReview,
            "error" => Stage::Error,
            "retry" => Stage::Retry,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    Ok,
    Retry,
    Failed,
}

impl EventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventStatus::Ok => "ok",
            EventStatus::Retry => "retry",
            EventStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "ok" => EventStatus::Ok,
            "retry" => EventStatus::Retry,
            _ => EventStatus::Failed,
        }
    }
}

/// One entry in an email's processing timeline.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessingEvent {
    pub id: String,
    pub email_id: String,
    pub stage: Stage,
    pub status: EventStatus,
    pub detail: Option<Value>,
    pub created_at: DateTime<Utc>,
}

// ── Manual review ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ReviewPriority {
    P0,
    P1,
    P2,
}

impl ReviewPriority {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReviewPriority::P0 => "P0",
            ReviewPriority::P1 => "P1",
            ReviewPriority::P2 => "P2",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "P0" => ReviewPriority::P0,
            "P2" => ReviewPriority::P2,
            _ => ReviewPriority::P1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewStatus {
    Pending,
    Acknowledged,
    Processing,
    Resolved,
    Closed,
}

impl ReviewStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReviewStatus::Pending => "pending",
            ReviewStatus::Acknowledged => "acknowledged",
            ReviewStatus::Processing => "processing",
            ReviewStatus::Resolved => "resolved",
            ReviewStatus::Closed => "closed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "pending" => ReviewStatus::Pending,
            "acknowledged" => ReviewStatus::Acknowledged,
            "processing" => ReviewStatus::Processing,
            "resolved" => ReviewStatus::Resolved,
            "closed" => ReviewStatus::Closed,
            _ => return None,
        })
    }

    /// Statuses the SLA scan watches.
    pub fn is_open(&self) -> bool {
        matches!(
            self,
            ReviewStatus::Pending | ReviewStatus::Acknowledged | ReviewStatus::Processing
        )
    }

    /// Forward-only transitions; `closed` is final.
    pub fn can_transition_to(&self, next: ReviewStatus) -> bool {
        use ReviewStatus::*;
        match self {
            Pending => matches!(next, Acknowledged | Processing | Resolved | Closed),
            Acknowledged => matches!(next, Processing | Resolved | Closed),
            Processing => matches!(next, Resolved | Closed),
            Resolved => next == Closed,
            Closed => false,
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("illegal review transition {from:?} -> {to:?}")]
pub struct TransitionError {
    pub from: ReviewStatus,
    pub to: ReviewStatus,
}

/// Human escalation record.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ManualReviewTask {
    pub id: String,
    pub email_id: String,
    pub priority: ReviewPriority,
    pub reason: String,
    pub status: ReviewStatus,
    pub assignee: Option<String>,
    pub created_at: DateTime<Utc>,
    pub acknowledged_at: Option<DateTime<Utc>>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl ManualReviewTask {
    pub fn new(email_id: &str, priority: ReviewPriority, reason: &str) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            email_id: email_id.to_string(),
            priority,
            reason: reason.to_string(),
            status: ReviewStatus::Pending,
            assignee: None,
            created_at: now,
            acknowledged_at: None,
            resolved_at: None,
            updated_at: now,
        }
    }

    /// Move to `next`, stamping acknowledgment/resolution times. A `None`
    /// assignee keeps the current one.
    pub fn transition(
        &mut self,
        next: ReviewStatus,
        assignee: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<(), TransitionError> {
        if !self.status.can_transition_to(next) {
            return Err(TransitionError {
                from: self.status,
                to: next,
            });
        }
        match next {
            ReviewStatus::Acknowledged => self.acknowledged_at = Some(now),
            ReviewStatus::Resolved | ReviewStatus::Closed => self.resolved_at = Some(now),
            _ => {}
        }
        if assignee.is_some() {
            self.assignee = assignee;
        }
        self.status = next;
        self.updated_at = now;
        Ok(())
    }
}

// ── Prompt templates ────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptTemplate {
    pub id: String,
    pub name: String,
    pub version: i64,
    pub content: String,
    pub output_schema: Option<Value>,
    pub is_active: bool,
    pub created_by: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Input for creating a template version.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewPromptTemplate {
    pub name: String,
    pub version: i64,
    pub content: String,
    #[serde(default)]
    pub output_schema: Option<Value>,
    #[serde(default)]
    pub created_by: Option<String>,
}

// ── Retention ───────────────────────────────────────────────────────

/// Audit row for one retention cleanup run.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanupRun {
    pub id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub deleted_count: u64,
    pub failed_count: u64,
    pub error: Option<String>,
}
