//! libSQL backend — async `Database` and `ConfigStore` implementation.
//!
//! Supports local file and in-memory databases. All statements share one
//! connection behind an async mutex, so multi-statement units run inside a
//! transaction that nothing else can interleave with.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use serde_json::Value;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info};
use uuid::Uuid;

use crate::classify::schema::{Classification, ReplyDraft};
use crate::error::DatabaseError;
use crate::pipeline::types::{AttachmentMeta, MessagePriority, QueueMessage, truncate_chars};
use crate::store::migrations;
use crate::store::model::{
    ActionLogEntry, ActionStatus, ActionType, ClaimOutcome, CleanupRun, EmailRecord, EmailStatus,
    EventStatus, ExpiredEmail, ManualReviewTask, NewPromptTemplate, ProcessingEvent,
    PromptTemplate, RawProviderTrace, ReviewPriority, ReviewStatus, Stage, StoredClassification,
};
use crate::store::traits::{ConfigStore, Database};

/// Longest error text kept in `last_error` / action log rows.
const MAX_ERROR_CHARS: usize = 2000;

/// libSQL database backend.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Mutex<Connection>,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Connection(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path).build().await.map_err(|e| {
            DatabaseError::Connection(format!("Failed to open libSQL database: {e}"))
        })?;

        let backend = Self::from_database(db)?;
        backend.run_migrations().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Connection(format!("Failed to create in-memory database: {e}"))
            })?;

        let backend = Self::from_database(db)?;
        backend.run_migrations().await?;
        Ok(backend)
    }

    fn from_database(db: LibSqlDatabase) -> Result<Self, DatabaseError> {
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Connection(format!("Failed to create connection: {e}")))?;
        Ok(Self {
            db: Arc::new(db),
            conn: Mutex::new(conn),
        })
    }

    async fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().await
    }

    /// Run raw SQL against the connection; lets tests break the schema.
    #[cfg(test)]
    pub(crate) async fn execute_raw(&self, sql: &str) {
        self.conn()
            .await
            .execute_batch(sql)
            .await
            .expect("raw SQL failed");
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Canonical write format: RFC 3339, microseconds, `Z`. Sorts lexically.
fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn now_ts() -> String {
    ts(Utc::now())
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn parse_optional_datetime(s: &Option<String>) -> Option<DateTime<Utc>> {
    s.as_ref().map(|s| parse_datetime(s))
}

/// Convert `Option<&str>` to libsql Value.
fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

fn opt_error(error: Option<&str>) -> libsql::Value {
    opt_text(error.map(|e| truncate_chars(e, MAX_ERROR_CHARS)).as_deref())
}

fn query_err(op: &'static str) -> impl Fn(libsql::Error) -> DatabaseError {
    move |e| {
        let text = e.to_string();
        if text.contains("UNIQUE constraint failed") {
            DatabaseError::Constraint(format!("{op}: {text}"))
        } else {
            DatabaseError::Query(format!("{op}: {text}"))
        }
    }
}

fn to_json_text<T: serde::Serialize>(value: &T) -> Result<String, DatabaseError> {
    serde_json::to_string(value).map_err(|e| DatabaseError::Serialization(e.to_string()))
}

/// JSON array of ids, consumed in SQL through `json_each(?)`.
fn id_list(ids: &[String]) -> Result<String, DatabaseError> {
    to_json_text(&ids)
}

const EMAIL_COLUMNS: &str = "id, external_id, thread_id, received_at, to_address, from_address, from_name, subject, text_body, body_truncated, has_html, priority, raw_key, parsed_key, status, last_error, legal_hold, created_at, updated_at";

const REVIEW_COLUMNS: &str =
    "id, email_id, priority, reason, status, assignee, created_at, acknowledged_at, resolved_at, updated_at";

const PROMPT_COLUMNS: &str =
    "id, name, version, content, output_schema, is_active, created_by, created_at";

fn row_to_email(row: &libsql::Row) -> Result<EmailRecord, libsql::Error> {
    let received: String = row.get(3)?;
    let priority: String = row.get(11)?;
    let status: String = row.get(14)?;
    let created: String = row.get(17)?;
    let updated: String = row.get(18)?;

    Ok(EmailRecord {
        id: row.get(0)?,
        external_id: row.get(1)?,
        thread_id: row.get::<String>(2).ok(),
        received_at: parse_datetime(&received),
        to: row.get(4)?,
        from: row.get(5)?,
        from_name: row.get(6)?,
        subject: row.get(7)?,
        text_body: row.get(8)?,
        body_truncated: row.get::<i64>(9)? != 0,
        has_html: row.get::<i64>(10)? != 0,
        priority: MessagePriority::parse(&priority),
        raw_key: row.get(12)?,
        parsed_key: row.get::<String>(13).ok(),
        status: EmailStatus::parse(&status),
        last_error: row.get::<String>(15).ok(),
        legal_hold: row.get::<i64>(16)? != 0,
        created_at: parse_datetime(&created),
        updated_at: parse_datetime(&updated),
    })
}

fn row_to_review(row: &libsql::Row) -> Result<ManualReviewTask, libsql::Error> {
    let priority: String = row.get(2)?;
    let status: String = row.get(4)?;
    let created: String = row.get(6)?;
    let updated: String = row.get(9)?;

    Ok(ManualReviewTask {
        id: row.get(0)?,
        email_id: row.get(1)?,
        priority: ReviewPriority::parse(&priority),
        reason: row.get(3)?,
        status: ReviewStatus::parse(&status).unwrap_or(ReviewStatus::Pending),
        assignee: row.get::<String>(5).ok(),
        created_at: parse_datetime(&created),
        acknowledged_at: parse_optional_datetime(&row.get::<String>(7).ok()),
        resolved_at: parse_optional_datetime(&row.get::<String>(8).ok()),
        updated_at: parse_datetime(&updated),
    })
}

fn row_to_prompt(row: &libsql::Row) -> Result<PromptTemplate, libsql::Error> {
    let created: String = row.get(7)?;
    Ok(PromptTemplate {
        id: row.get(0)?,
        name: row.get(1)?,
        version: row.get(2)?,
        content: row.get(3)?,
        output_schema: row
            .get::<String>(4)
            .ok()
            .and_then(|s| serde_json::from_str(&s).ok()),
        is_active: row.get::<i64>(5)? != 0,
        created_by: row.get::<String>(6).ok(),
        created_at: parse_datetime(&created),
    })
}

async fn fetch_email(conn: &Connection, id: &str) -> Result<Option<EmailRecord>, DatabaseError> {
    let mut rows = conn
        .query(
            &format!("SELECT {EMAIL_COLUMNS} FROM emails WHERE id = ?1"),
            params![id],
        )
        .await
        .map_err(query_err("get_email"))?;

    match rows.next().await.map_err(query_err("get_email"))? {
        Some(row) => Ok(Some(row_to_email(&row).map_err(query_err("get_email row parse"))?)),
        None => Ok(None),
    }
}

async fn fetch_attachments(
    conn: &Connection,
    email_id: &str,
) -> Result<Vec<AttachmentMeta>, DatabaseError> {
    let mut rows = conn
        .query(
            "SELECT filename, mime_type, size, storage_key FROM attachments WHERE email_id = ?1 ORDER BY position",
            params![email_id],
        )
        .await
        .map_err(query_err("list_attachments"))?;

    let mut attachments = Vec::new();
    while let Some(row) = rows.next().await.map_err(query_err("list_attachments"))? {
        attachments.push(AttachmentMeta {
            filename: row.get(0).map_err(query_err("list_attachments row"))?,
            mime_type: row.get(1).map_err(query_err("list_attachments row"))?,
            size: row
                .get::<i64>(2)
                .map_err(query_err("list_attachments row"))?
                .max(0) as u64,
            storage_key: row.get::<String>(3).ok(),
        });
    }
    Ok(attachments)
}

async fn insert_attachments(
    conn: &Connection,
    email_id: &str,
    attachments: &[AttachmentMeta],
) -> Result<(), DatabaseError> {
    conn.execute("DELETE FROM attachments WHERE email_id = ?1", params![email_id])
        .await
        .map_err(query_err("replace_attachments"))?;

    let now = now_ts();
    for (position, attachment) in attachments.iter().enumerate() {
        conn.execute(
            "INSERT INTO attachments (id, email_id, position, filename, mime_type, size, storage_key, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                Uuid::new_v4().to_string(),
                email_id,
                position as i64,
                attachment.filename.as_str(),
                attachment.mime_type.as_str(),
                attachment.size as i64,
                opt_text(attachment.storage_key.as_deref()),
                now.as_str(),
            ],
        )
        .await
        .map_err(query_err("replace_attachments"))?;
    }
    Ok(())
}

async fn collect_reviews(mut rows: libsql::Rows) -> Result<Vec<ManualReviewTask>, DatabaseError> {
    let mut tasks = Vec::new();
    while let Some(row) = rows.next().await.map_err(query_err("list_manual_reviews"))? {
        tasks.push(row_to_review(&row).map_err(query_err("list_manual_reviews row parse"))?);
    }
    Ok(tasks)
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl Database for LibSqlBackend {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        let conn = self.conn().await;
        migrations::run_migrations(&conn).await
    }

    // ── Emails ──────────────────────────────────────────────────────

    async fn claim_email(&self, payload: &QueueMessage) -> Result<ClaimOutcome, DatabaseError> {
        let conn = self.conn().await;
        let now = now_ts();

        let inserted = conn
            .execute(
                &format!(
                    "INSERT INTO emails ({EMAIL_COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, 'processing', NULL, 0, ?15, ?15)
                     ON CONFLICT(external_id) DO NOTHING"
                ),
                params![
                    payload.id.as_str(),
                    payload.external_id.as_str(),
                    opt_text(payload.thread_id.as_deref()),
                    ts(payload.received_at),
                    payload.to.as_str(),
                    payload.from.as_str(),
                    payload.from_name.as_str(),
                    payload.subject.as_str(),
                    payload.text_body.as_str(),
                    payload.body_truncated as i64,
                    payload.has_html as i64,
                    payload.priority.as_str(),
                    payload.raw_key.as_str(),
                    opt_text(payload.parsed_key.as_deref()),
                    now.as_str(),
                ],
            )
            .await
            .map_err(query_err("claim_email"))?;

        if inserted > 0 {
            debug!(email_id = %payload.id, "Email row created");
            return Ok(ClaimOutcome::Inserted);
        }

        if payload.redrive {
            let reclaimed = conn
                .execute(
                    "UPDATE emails SET status = 'processing', last_error = NULL, updated_at = ?2
                     WHERE external_id = ?1 AND id = ?3
                       AND status IN ('failed_queue', 'processing', 'error')",
                    params![payload.external_id.as_str(), now.as_str(), payload.id.as_str()],
                )
                .await
                .map_err(query_err("claim_email reclaim"))?;
            if reclaimed > 0 {
                return Ok(ClaimOutcome::Reclaimed);
            }
        }

        Ok(ClaimOutcome::Duplicate)
    }

    async fn save_failed_queue(
        &self,
        payload: &QueueMessage,
        reason: &str,
    ) -> Result<(), DatabaseError> {
        let conn = self.conn().await;
        let now = now_ts();
        let tx = conn.transaction().await.map_err(query_err("save_failed_queue"))?;

        let changed = tx
            .execute(
                &format!(
                    "INSERT INTO emails ({EMAIL_COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, 'failed_queue', ?15, 0, ?16, ?16)
                     ON CONFLICT(external_id) DO UPDATE SET
                        last_error = excluded.last_error,
                        updated_at = excluded.updated_at
                     WHERE emails.status = 'failed_queue'"
                ),
                params![
                    payload.id.as_str(),
                    payload.external_id.as_str(),
                    opt_text(payload.thread_id.as_deref()),
                    ts(payload.received_at),
                    payload.to.as_str(),
                    payload.from.as_str(),
                    payload.from_name.as_str(),
                    payload.subject.as_str(),
                    payload.text_body.as_str(),
                    payload.body_truncated as i64,
                    payload.has_html as i64,
                    payload.priority.as_str(),
                    payload.raw_key.as_str(),
                    opt_text(payload.parsed_key.as_deref()),
                    opt_error(Some(reason)),
                    now.as_str(),
                ],
            )
            .await
            .map_err(query_err("save_failed_queue"))?;

        if changed > 0 {
            insert_attachments(&tx, &payload.id, &payload.attachments).await?;
        }
        tx.commit().await.map_err(query_err("save_failed_queue commit"))?;
        Ok(())
    }

    async fn get_email(&self, id: &str) -> Result<Option<EmailRecord>, DatabaseError> {
        let conn = self.conn().await;
        fetch_email(&conn, id).await
    }

    async fn get_queue_message(&self, id: &str) -> Result<Option<QueueMessage>, DatabaseError> {
        let conn = self.conn().await;
        let Some(email) = fetch_email(&conn, id).await? else {
            return Ok(None);
        };
        let attachments = fetch_attachments(&conn, id).await?;

        Ok(Some(QueueMessage {
            id: email.id,
            external_id: email.external_id,
            received_at: email.received_at,
            to: email.to,
            from: email.from,
            from_name: email.from_name,
            subject: email.subject,
            text_body: email.text_body,
            has_html: email.has_html,
            attachments,
            raw_key: email.raw_key,
            parsed_key: email.parsed_key,
            body_truncated: email.body_truncated,
            thread_id: email.thread_id,
            priority: email.priority,
            redrive: false,
        }))
    }

    async fn mark_email_status(
        &self,
        id: &str,
        status: EmailStatus,
        error: Option<&str>,
    ) -> Result<(), DatabaseError> {
        let conn = self.conn().await;
        conn.execute(
            "UPDATE emails SET status = ?1, last_error = ?2, updated_at = ?3 WHERE id = ?4",
            params![status.as_str(), opt_error(error), now_ts(), id],
        )
        .await
        .map_err(query_err("mark_email_status"))?;

        debug!(email_id = %id, status = status.as_str(), "Email status updated");
        Ok(())
    }

    async fn list_failed_queue(&self, limit: usize) -> Result<Vec<EmailRecord>, DatabaseError> {
        let conn = self.conn().await;
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {EMAIL_COLUMNS} FROM emails WHERE status = 'failed_queue'
                     ORDER BY updated_at ASC LIMIT ?1"
                ),
                params![limit as i64],
            )
            .await
            .map_err(query_err("list_failed_queue"))?;

        let mut emails = Vec::new();
        while let Some(row) = rows.next().await.map_err(query_err("list_failed_queue"))? {
            emails.push(row_to_email(&row).map_err(query_err("list_failed_queue row parse"))?);
        }
        Ok(emails)
    }

    async fn set_legal_hold(&self, id: &str, legal_hold: bool) -> Result<bool, DatabaseError> {
        let conn = self.conn().await;
        let changed = conn
            .execute(
                "UPDATE emails SET legal_hold = ?1, updated_at = ?2 WHERE id = ?3",
                params![legal_hold as i64, now_ts(), id],
            )
            .await
            .map_err(query_err("set_legal_hold"))?;
        Ok(changed > 0)
    }

    // ── Attachments ─────────────────────────────────────────────────

    async fn replace_attachments(
        &self,
        email_id: &str,
        attachments: &[AttachmentMeta],
    ) -> Result<(), DatabaseError> {
        let conn = self.conn().await;
        let tx = conn.transaction().await.map_err(query_err("replace_attachments"))?;
        insert_attachments(&tx, email_id, attachments).await?;
        tx.commit().await.map_err(query_err("replace_attachments commit"))?;
        Ok(())
    }

    async fn list_attachments(&self, email_id: &str) -> Result<Vec<AttachmentMeta>, DatabaseError> {
        let conn = self.conn().await;
        fetch_attachments(&conn, email_id).await
    }

    // ── AI results ──────────────────────────────────────────────────

    async fn upsert_classification(
        &self,
        email_id: &str,
        classification: &Classification,
        provider: &str,
        model: &str,
        processing_ms: u64,
    ) -> Result<(), DatabaseError> {
        let conn = self.conn().await;
        let json = to_json_text(classification)?;
        let now = now_ts();

        conn.execute(
            "INSERT INTO email_ai_results (email_id, category, priority, confidence, requires_reply, classification_json, reply_draft_json, provider, model, processing_ms, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, NULL, ?7, ?8, ?9, ?10, ?10)
             ON CONFLICT(email_id) DO UPDATE SET
                category = excluded.category,
                priority = excluded.priority,
                confidence = excluded.confidence,
                requires_reply = excluded.requires_reply,
                classification_json = excluded.classification_json,
                reply_draft_json = NULL,
                provider = excluded.provider,
                model = excluded.model,
                processing_ms = excluded.processing_ms,
                updated_at = excluded.updated_at",
            params![
                email_id,
                classification.category.as_str(),
                classification.priority as i64,
                classification.confidence_score,
                classification.requires_reply as i64,
                json,
                provider,
                model,
                processing_ms as i64,
                now,
            ],
        )
        .await
        .map_err(query_err("upsert_classification"))?;
        Ok(())
    }

    async fn upsert_reply_draft(
        &self,
        email_id: &str,
        draft: &ReplyDraft,
    ) -> Result<(), DatabaseError> {
        let conn = self.conn().await;
        let changed = conn
            .execute(
                "UPDATE email_ai_results SET reply_draft_json = ?1, updated_at = ?2 WHERE email_id = ?3",
                params![to_json_text(draft)?, now_ts(), email_id],
            )
            .await
            .map_err(query_err("upsert_reply_draft"))?;

        if changed == 0 {
            return Err(DatabaseError::NotFound {
                entity: "classification".into(),
                id: email_id.to_string(),
            });
        }
        Ok(())
    }

    async fn get_classification(
        &self,
        email_id: &str,
    ) -> Result<Option<StoredClassification>, DatabaseError> {
        let conn = self.conn().await;
        let mut rows = conn
            .query(
                "SELECT classification_json, reply_draft_json, provider, model, processing_ms, updated_at
                 FROM email_ai_results WHERE email_id = ?1",
                params![email_id],
            )
            .await
            .map_err(query_err("get_classification"))?;

        let Some(row) = rows.next().await.map_err(query_err("get_classification"))? else {
            return Ok(None);
        };

        let classification_json: String = row.get(0).map_err(query_err("get_classification row"))?;
        let classification: Classification = serde_json::from_str(&classification_json)
            .map_err(|e| DatabaseError::Serialization(format!("classification_json: {e}")))?;
        let reply_draft = match row.get::<String>(1).ok() {
            Some(json) => Some(
                serde_json::from_str::<ReplyDraft>(&json)
                    .map_err(|e| DatabaseError::Serialization(format!("reply_draft_json: {e}")))?,
            ),
            None => None,
        };
        let updated: String = row.get(5).map_err(query_err("get_classification row"))?;

        Ok(Some(StoredClassification {
            email_id: email_id.to_string(),
            classification,
            reply_draft,
            provider: row.get(2).map_err(query_err("get_classification row"))?,
            model: row.get(3).map_err(query_err("get_classification row"))?,
            processing_ms: row
                .get::<i64>(4)
                .map_err(query_err("get_classification row"))?
                .max(0) as u64,
            updated_at: parse_datetime(&updated),
        }))
    }

    async fn insert_raw_trace(
        &self,
        email_id: &str,
        trace: &RawProviderTrace,
    ) -> Result<(), DatabaseError> {
        let conn = self.conn().await;
        conn.execute(
            "INSERT INTO ai_raw_responses (id, email_id, provider, model, request_redacted, response_text, response_json, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                Uuid::new_v4().to_string(),
                email_id,
                trace.provider.as_str(),
                trace.model.as_str(),
                trace.request_redacted.as_str(),
                opt_text(trace.response_text.as_deref()),
                opt_text(trace.response_json.as_deref()),
                ts(trace.created_at),
            ],
        )
        .await
        .map_err(query_err("insert_raw_trace"))?;
        Ok(())
    }

    async fn latest_raw_trace(
        &self,
        email_id: &str,
    ) -> Result<Option<RawProviderTrace>, DatabaseError> {
        let conn = self.conn().await;
        let mut rows = conn
            .query(
                "SELECT provider, model, request_redacted, response_text, response_json, created_at
                 FROM ai_raw_responses WHERE email_id = ?1
                 ORDER BY created_at DESC, rowid DESC LIMIT 1",
                params![email_id],
            )
            .await
            .map_err(query_err("latest_raw_trace"))?;

        let Some(row) = rows.next().await.map_err(query_err("latest_raw_trace"))? else {
            return Ok(None);
        };
        let created: String = row.get(5).map_err(query_err("latest_raw_trace row"))?;
        Ok(Some(RawProviderTrace {
            provider: row.get(0).map_err(query_err("latest_raw_trace row"))?,
            model: row.get(1).map_err(query_err("latest_raw_trace row"))?,
            request_redacted: row.get(2).map_err(query_err("latest_raw_trace row"))?,
            response_text: row.get::<String>(3).ok(),
            response_json: row.get::<String>(4).ok(),
            created_at: parse_datetime(&created),
        }))
    }

    // ── Action logs ─────────────────────────────────────────────────

    async fn insert_action_log(
        &self,
        email_id: &str,
        action_type: ActionType,
        action_config: &Value,
        status: ActionStatus,
        error: Option<&str>,
    ) -> Result<(), DatabaseError> {
        let conn = self.conn().await;
        conn.execute(
            "INSERT INTO action_logs (id, email_id, action_type, action_config, status, error, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                Uuid::new_v4().to_string(),
                email_id,
                action_type.as_str(),
                to_json_text(action_config)?,
                status.as_str(),
                opt_error(error),
                now_ts(),
            ],
        )
        .await
        .map_err(query_err("insert_action_log"))?;

        debug!(
            email_id = %email_id,
            action = action_type.as_str(),
            status = status.as_str(),
            "Action logged"
        );
        Ok(())
    }

    async fn list_action_logs(
        &self,
        email_id: &str,
    ) -> Result<Vec<ActionLogEntry>, DatabaseError> {
        let conn = self.conn().await;
        let mut rows = conn
            .query(
                "SELECT id, action_type, action_config, status, error, created_at
                 FROM action_logs WHERE email_id = ?1 ORDER BY created_at ASC, rowid ASC",
                params![email_id],
            )
            .await
            .map_err(query_err("list_action_logs"))?;

        let mut entries = Vec::new();
        while let Some(row) = rows.next().await.map_err(query_err("list_action_logs"))? {
            let action: String = row.get(1).map_err(query_err("list_action_logs row"))?;
            let Some(action_type) = ActionType::parse(&action) else {
                continue;
            };
            let config: String = row.get(2).map_err(query_err("list_action_logs row"))?;
            let status: String = row.get(3).map_err(query_err("list_action_logs row"))?;
            let created: String = row.get(5).map_err(query_err("list_action_logs row"))?;
            entries.push(ActionLogEntry {
                id: row.get(0).map_err(query_err("list_action_logs row"))?,
                email_id: email_id.to_string(),
                action_type,
                action_config: serde_json::from_str(&config).unwrap_or(Value::Null),
                status: ActionStatus::parse(&status),
                error: row.get::<String>(4).ok(),
                created_at: parse_datetime(&created),
            });
        }
        Ok(entries)
    }

    // ── Processing events ───────────────────────────────────────────

    async fn insert_event(
        &self,
        email_id: &str,
        stage: Stage,
        status: EventStatus,
        detail: Option<&Value>,
    ) -> Result<(), DatabaseError> {
        let detail_json = detail.map(to_json_text).transpose()?;
        let conn = self.conn().await;
        conn.execute(
            "INSERT INTO processing_events (id, email_id, stage, status, detail, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                Uuid::new_v4().to_string(),
                email_id,
                stage.as_str(),
                status.as_str(),
                opt_text(detail_json.as_deref()),
                now_ts(),
            ],
        )
        .await
        .map_err(query_err("insert_event"))?;
        Ok(())
    }

    async fn list_events(&self, email_id: &str) -> Result<Vec<ProcessingEvent>, DatabaseError> {
        let conn = self.conn().await;
        let mut rows = conn
            .query(
                "SELECT id, stage, status, detail, created_at FROM processing_events
                 WHERE email_id = ?1 ORDER BY created_at ASC, rowid ASC",
                params![email_id],
            )
            .await
            .map_err(query_err("list_events"))?;

        let mut events = Vec::new();
        while let Some(row) = rows.next().await.map_err(query_err("list_events"))? {
            let stage: String = row.get(1).map_err(query_err("list_events row"))?;
            let Some(stage) = Stage::parse(&stage) else {
                continue;
            };
            let status: String = row.get(2).map_err(query_err("list_events row"))?;
            let created: String = row.get(4).map_err(query_err("list_events row"))?;
            events.push(ProcessingEvent {
                id: row.get(0).map_err(query_err("list_events row"))?,
                email_id: email_id.to_string(),
                stage,
                status: EventStatus::parse(&status),
                detail: row
                    .get::<String>(3)
                    .ok()
                    .and_then(|s| serde_json::from_str(&s).ok()),
                created_at: parse_datetime(&created),
            });
        }
        Ok(events)
    }

    // ── Manual review ───────────────────────────────────────────────

    async fn create_manual_review(
        &self,
        email_id: &str,
        priority: ReviewPriority,
        reason: &str,
    ) -> Result<ManualReviewTask, DatabaseError> {
        let conn = self.conn().await;
        let rows = conn
            .query(
                &format!(
                    "SELECT {REVIEW_COLUMNS} FROM manual_review_tasks
                     WHERE email_id = ?1 AND status IN ('pending', 'acknowledged', 'processing')
                     ORDER BY created_at ASC LIMIT 1"
                ),
                params![email_id],
            )
            .await
            .map_err(query_err("create_manual_review lookup"))?;
        if let Some(open) = collect_reviews(rows).await?.into_iter().next() {
            debug!(task_id = %open.id, email_id = %email_id, "Open manual review already exists");
            return Ok(open);
        }

        let task = ManualReviewTask::new(email_id, priority, reason);
        conn.execute(
            &format!(
                "INSERT INTO manual_review_tasks ({REVIEW_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, NULL, ?6, NULL, NULL, ?6)"
            ),
            params![
                task.id.as_str(),
                email_id,
                priority.as_str(),
                reason,
                task.status.as_str(),
                ts(task.created_at),
            ],
        )
        .await
        .map_err(query_err("create_manual_review"))?;

        debug!(task_id = %task.id, email_id = %email_id, priority = priority.as_str(), "Manual review created");
        Ok(task)
    }

    async fn get_manual_review(
        &self,
        id: &str,
    ) -> Result<Option<ManualReviewTask>, DatabaseError> {
        let conn = self.conn().await;
        let rows = conn
            .query(
                &format!("SELECT {REVIEW_COLUMNS} FROM manual_review_tasks WHERE id = ?1"),
                params![id],
            )
            .await
            .map_err(query_err("get_manual_review"))?;
        Ok(collect_reviews(rows).await?.into_iter().next())
    }

    async fn list_manual_reviews(
        &self,
        status: Option<ReviewStatus>,
        limit: usize,
    ) -> Result<Vec<ManualReviewTask>, DatabaseError> {
        let conn = self.conn().await;
        let rows = match status {
            Some(status) => conn
                .query(
                    &format!(
                        "SELECT {REVIEW_COLUMNS} FROM manual_review_tasks WHERE status = ?1
                         ORDER BY created_at DESC LIMIT ?2"
                    ),
                    params![status.as_str(), limit as i64],
                )
                .await,
            None => conn
                .query(
                    &format!(
                        "SELECT {REVIEW_COLUMNS} FROM manual_review_tasks
                         ORDER BY created_at DESC LIMIT ?1"
                    ),
                    params![limit as i64],
                )
                .await,
        }
        .map_err(query_err("list_manual_reviews"))?;
        collect_reviews(rows).await
    }

    async fn list_open_manual_reviews(&self) -> Result<Vec<ManualReviewTask>, DatabaseError> {
        let conn = self.conn().await;
        let rows = conn
            .query(
                &format!(
                    "SELECT {REVIEW_COLUMNS} FROM manual_review_tasks
                     WHERE status IN ('pending', 'acknowledged', 'processing')
                     ORDER BY created_at ASC"
                ),
                (),
            )
            .await
            .map_err(query_err("list_open_manual_reviews"))?;
        collect_reviews(rows).await
    }

    async fn list_manual_reviews_for_email(
        &self,
        email_id: &str,
    ) -> Result<Vec<ManualReviewTask>, DatabaseError> {
        let conn = self.conn().await;
        let rows = conn
            .query(
                &format!(
                    "SELECT {REVIEW_COLUMNS} FROM manual_review_tasks WHERE email_id = ?1
                     ORDER BY created_at ASC"
                ),
                params![email_id],
            )
            .await
            .map_err(query_err("list_manual_reviews_for_email"))?;
        collect_reviews(rows).await
    }

    async fn save_manual_review(&self, task: &ManualReviewTask) -> Result<(), DatabaseError> {
        let conn = self.conn().await;
        let changed = conn
            .execute(
                "UPDATE manual_review_tasks
                 SET status = ?1, assignee = ?2, acknowledged_at = ?3, resolved_at = ?4, updated_at = ?5
                 WHERE id = ?6",
                params![
                    task.status.as_str(),
                    opt_text(task.assignee.as_deref()),
                    opt_text(task.acknowledged_at.map(ts).as_deref()),
                    opt_text(task.resolved_at.map(ts).as_deref()),
                    ts(task.updated_at),
                    task.id.as_str(),
                ],
            )
            .await
            .map_err(query_err("save_manual_review"))?;

        if changed == 0 {
            return Err(DatabaseError::NotFound {
                entity: "manual_review_task".into(),
                id: task.id.clone(),
            });
        }
        Ok(())
    }

    // ── Prompt templates ────────────────────────────────────────────

    async fn create_prompt_template(
        &self,
        template: &NewPromptTemplate,
    ) -> Result<PromptTemplate, DatabaseError> {
        let created = PromptTemplate {
            id: Uuid::new_v4().to_string(),
            name: template.name.clone(),
            version: template.version,
            content: template.content.clone(),
            output_schema: template.output_schema.clone(),
            is_active: false,
            created_by: template.created_by.clone(),
            created_at: Utc::now(),
        };
        let schema_json = created.output_schema.as_ref().map(to_json_text).transpose()?;

        let conn = self.conn().await;
        conn.execute(
            &format!(
                "INSERT INTO prompt_templates ({PROMPT_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, 0, ?6, ?7)"
            ),
            params![
                created.id.as_str(),
                created.name.as_str(),
                created.version,
                created.content.as_str(),
                opt_text(schema_json.as_deref()),
                opt_text(created.created_by.as_deref()),
                ts(created.created_at),
            ],
        )
        .await
        .map_err(query_err("create_prompt_template"))?;
        Ok(created)
    }

    async fn activate_prompt_template(
        &self,
        name: &str,
        version: i64,
    ) -> Result<(), DatabaseError> {
        let conn = self.conn().await;
        let tx = conn
            .transaction()
            .await
            .map_err(query_err("activate_prompt_template"))?;

        tx.execute(
            "UPDATE prompt_templates SET is_active = 0 WHERE name = ?1",
            params![name],
        )
        .await
        .map_err(query_err("activate_prompt_template"))?;

        let activated = tx
            .execute(
                "UPDATE prompt_templates SET is_active = 1 WHERE name = ?1 AND version = ?2",
                params![name, version],
            )
            .await
            .map_err(query_err("activate_prompt_template"))?;

        if activated == 0 {
            tx.rollback()
                .await
                .map_err(query_err("activate_prompt_template rollback"))?;
            return Err(DatabaseError::NotFound {
                entity: "prompt_template".into(),
                id: format!("{name}@{version}"),
            });
        }

        tx.commit()
            .await
            .map_err(query_err("activate_prompt_template commit"))?;
        info!(name = %name, version, "Prompt template activated");
        Ok(())
    }

    async fn list_prompt_templates(
        &self,
        name: Option<&str>,
    ) -> Result<Vec<PromptTemplate>, DatabaseError> {
        let conn = self.conn().await;
        let mut rows = match name {
            Some(name) => conn
                .query(
                    &format!(
                        "SELECT {PROMPT_COLUMNS} FROM prompt_templates WHERE name = ?1 ORDER BY version DESC"
                    ),
                    params![name],
                )
                .await,
            None => conn
                .query(
                    &format!(
                        "SELECT {PROMPT_COLUMNS} FROM prompt_templates ORDER BY name ASC, version DESC"
                    ),
                    (),
                )
                .await,
        }
        .map_err(query_err("list_prompt_templates"))?;

        let mut templates = Vec::new();
        while let Some(row) = rows.next().await.map_err(query_err("list_prompt_templates"))? {
            templates.push(row_to_prompt(&row).map_err(query_err("list_prompt_templates row"))?);
        }
        Ok(templates)
    }

    async fn get_active_prompt(&self, name: &str) -> Result<Option<PromptTemplate>, DatabaseError> {
        let conn = self.conn().await;
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {PROMPT_COLUMNS} FROM prompt_templates WHERE name = ?1 AND is_active = 1 LIMIT 1"
                ),
                params![name],
            )
            .await
            .map_err(query_err("get_active_prompt"))?;

        match rows.next().await.map_err(query_err("get_active_prompt"))? {
            Some(row) => Ok(Some(
                row_to_prompt(&row).map_err(query_err("get_active_prompt row"))?,
            )),
            None => Ok(None),
        }
    }

    // ── Retention ───────────────────────────────────────────────────

    async fn list_expired_emails(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ExpiredEmail>, DatabaseError> {
        let conn = self.conn().await;
        let mut rows = conn
            .query(
                "SELECT id, raw_key, parsed_key FROM emails
                 WHERE legal_hold = 0 AND received_at < ?1
                 ORDER BY received_at ASC LIMIT ?2",
                params![ts(cutoff), limit as i64],
            )
            .await
            .map_err(query_err("list_expired_emails"))?;

        let mut expired = Vec::new();
        while let Some(row) = rows.next().await.map_err(query_err("list_expired_emails"))? {
            expired.push(ExpiredEmail {
                id: row.get(0).map_err(query_err("list_expired_emails row"))?,
                raw_key: row.get(1).map_err(query_err("list_expired_emails row"))?,
                parsed_key: row.get::<String>(2).ok(),
            });
        }
        Ok(expired)
    }

    async fn list_attachment_keys(
        &self,
        email_ids: &[String],
    ) -> Result<Vec<String>, DatabaseError> {
        if email_ids.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.conn().await;
        let mut rows = conn
            .query(
                "SELECT storage_key FROM attachments
                 WHERE storage_key IS NOT NULL AND email_id IN (SELECT value FROM json_each(?1))",
                params![id_list(email_ids)?],
            )
            .await
            .map_err(query_err("list_attachment_keys"))?;

        let mut keys = Vec::new();
        while let Some(row) = rows.next().await.map_err(query_err("list_attachment_keys"))? {
            keys.push(row.get(0).map_err(query_err("list_attachment_keys row"))?);
        }
        Ok(keys)
    }

    async fn delete_email_cascade(&self, email_ids: &[String]) -> Result<u64, DatabaseError> {
        if email_ids.is_empty() {
            return Ok(0);
        }
        let ids = id_list(email_ids)?;
        let conn = self.conn().await;
        let tx = conn
            .transaction()
            .await
            .map_err(query_err("delete_email_cascade"))?;

        for table in [
            "manual_review_tasks",
            "action_logs",
            "processing_events",
            "ai_raw_responses",
            "email_ai_results",
            "attachments",
        ] {
            tx.execute(
                &format!(
                    "DELETE FROM {table} WHERE email_id IN (SELECT value FROM json_each(?1))"
                ),
                params![ids.as_str()],
            )
            .await
            .map_err(query_err("delete_email_cascade"))?;
        }

        let deleted = tx
            .execute(
                "DELETE FROM emails WHERE id IN (SELECT value FROM json_each(?1))",
                params![ids.as_str()],
            )
            .await
            .map_err(query_err("delete_email_cascade"))?;

        tx.commit()
            .await
            .map_err(query_err("delete_email_cascade commit"))?;
        Ok(deleted)
    }

    async fn insert_cleanup_run(&self, run: &CleanupRun) -> Result<(), DatabaseError> {
        let conn = self.conn().await;
        conn.execute(
            "INSERT INTO cleanup_runs (id, started_at, finished_at, deleted_count, failed_count, error)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                run.id.as_str(),
                ts(run.started_at),
                ts(run.finished_at),
                run.deleted_count as i64,
                run.failed_count as i64,
                opt_error(run.error.as_deref()),
            ],
        )
        .await
        .map_err(query_err("insert_cleanup_run"))?;
        Ok(())
    }

    async fn list_cleanup_runs(&self, limit: usize) -> Result<Vec<CleanupRun>, DatabaseError> {
        let conn = self.conn().await;
        let mut rows = conn
            .query(
                "SELECT id, started_at, finished_at, deleted_count, failed_count, error
                 FROM cleanup_runs ORDER BY finished_at DESC, rowid DESC LIMIT ?1",
                params![limit as i64],
            )
            .await
            .map_err(query_err("list_cleanup_runs"))?;

        let mut runs = Vec::new();
        while let Some(row) = rows.next().await.map_err(query_err("list_cleanup_runs"))? {
            let started: String = row.get(1).map_err(query_err("list_cleanup_runs row"))?;
            let finished: String = row.get(2).map_err(query_err("list_cleanup_runs row"))?;
            runs.push(CleanupRun {
                id: row.get(0).map_err(query_err("list_cleanup_runs row"))?,
                started_at: parse_datetime(&started),
                finished_at: parse_datetime(&finished),
                deleted_count: row
                    .get::<i64>(3)
                    .map_err(query_err("list_cleanup_runs row"))?
                    .max(0) as u64,
                failed_count: row
                    .get::<i64>(4)
                    .map_err(query_err("list_cleanup_runs row"))?
                    .max(0) as u64,
                error: row.get::<String>(5).ok(),
            });
        }
        Ok(runs)
    }
}

#[async_trait]
impl ConfigStore for LibSqlBackend {
    async fn get_config(&self, key: &str) -> Result<Option<String>, DatabaseError> {
        let conn = self.conn().await;
        let mut rows = conn
            .query("SELECT value FROM config_kv WHERE key = ?1", params![key])
            .await
            .map_err(query_err("get_config"))?;

        match rows.next().await.map_err(query_err("get_config"))? {
            Some(row) => Ok(Some(row.get(0).map_err(query_err("get_config row"))?)),
            None => Ok(None),
        }
    }

    async fn set_config(&self, key: &str, value: &str) -> Result<(), DatabaseError> {
        let conn = self.conn().await;
        conn.execute(
            "INSERT INTO config_kv (key, value, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            params![key, value, now_ts()],
        )
        .await
        .map_err(query_err("set_config"))?;
        Ok(())
    }

    async fn delete_config(&self, key: &str) -> Result<(), DatabaseError> {
        let conn = self.conn().await;
        conn.execute("DELETE FROM config_kv WHERE key = ?1", params![key])
            .await
            .map_err(query_err("delete_config"))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::schema::Category;
    use chrono::Duration;
    use serde_json::json;

    async fn test_db() -> LibSqlBackend {
        LibSqlBackend::new_memory().await.unwrap()
    }

    fn make_payload(external_id: &str) -> QueueMessage {
        QueueMessage {
            id: Uuid::new_v4().to_string(),
            external_id: external_id.to_string(),
            received_at: Utc::now(),
            to: "support@acme.test".into(),
            from: "customer@example.com".into(),
            from_name: "Customer".into(),
            subject: "Help".into(),
            text_body: "It broke".into(),
            has_html: false,
            attachments: vec![AttachmentMeta {
                filename: "log.txt".into(),
                mime_type: "text/plain".into(),
                size: 12,
                storage_key: Some("emails/x_attachments/2024/01/01/a.bin".into()),
            }],
            raw_key: "emails/2024/01/01/x.eml".into(),
            parsed_key: Some("emails/2024/01/01/x_parsed.json".into()),
            body_truncated: false,
            thread_id: Some("<prev@acme.test>".into()),
            priority: MessagePriority::Normal,
            redrive: false,
        }
    }

    fn classification(category: Category, confidence: f64) -> Classification {
        let mut c: Classification = serde_json::from_str("{}").unwrap();
        c.category = category;
        c.confidence_score = confidence;
        c
    }

    // ── Email tests ─────────────────────────────────────────────────

    #[tokio::test]
    async fn claim_is_idempotent_per_external_id() {
        let db = test_db().await;
        let first = make_payload("<m1@example.com>");
        let mut second = make_payload("<m1@example.com>");
        second.id = Uuid::new_v4().to_string();

        assert_eq!(db.claim_email(&first).await.unwrap(), ClaimOutcome::Inserted);
        assert_eq!(db.claim_email(&second).await.unwrap(), ClaimOutcome::Duplicate);
        assert!(db.get_email(&second.id).await.unwrap().is_none());

        let stored = db.get_email(&first.id).await.unwrap().unwrap();
        assert_eq!(stored.status, EmailStatus::Processing);
        assert_eq!(stored.thread_id.as_deref(), Some("<prev@acme.test>"));
    }

    #[tokio::test]
    async fn redrive_reclaims_parked_row_only() {
        let db = test_db().await;
        let payload = make_payload("<parked@example.com>");
        db.save_failed_queue(&payload, "Queue is congested").await.unwrap();

        let parked = db.get_email(&payload.id).await.unwrap().unwrap();
        assert_eq!(parked.status, EmailStatus::FailedQueue);
        assert_eq!(parked.last_error.as_deref(), Some("Queue is congested"));

        // A plain redelivery does not take over the parked row.
        assert_eq!(db.claim_email(&payload).await.unwrap(), ClaimOutcome::Duplicate);

        let mut redriven = payload.clone();
        redriven.redrive = true;
        assert_eq!(db.claim_email(&redriven).await.unwrap(), ClaimOutcome::Reclaimed);

        db.mark_email_status(&payload.id, EmailStatus::Done, None)
            .await
            .unwrap();
        assert_eq!(db.claim_email(&redriven).await.unwrap(), ClaimOutcome::Duplicate);
    }

    #[tokio::test]
    async fn redrive_does_not_take_over_another_ids_row() {
        let db = test_db().await;
        let original = make_payload("<shared@example.com>");
        db.claim_email(&original).await.unwrap();
        db.mark_email_status(&original.id, EmailStatus::Error, Some("stage failed"))
            .await
            .unwrap();

        let mut stray = make_payload("<shared@example.com>");
        stray.redrive = true;
        assert_eq!(db.claim_email(&stray).await.unwrap(), ClaimOutcome::Duplicate);

        let stored = db.get_email(&original.id).await.unwrap().unwrap();
        assert_eq!(stored.status, EmailStatus::Error);

        let mut redriven = original.clone();
        redriven.redrive = true;
        assert_eq!(db.claim_email(&redriven).await.unwrap(), ClaimOutcome::Reclaimed);
    }

    #[tokio::test]
    async fn parked_payload_rebuilds_with_attachments() {
        let db = test_db().await;
        let payload = make_payload("<rebuild@example.com>");
        db.save_failed_queue(&payload, "closed").await.unwrap();

        let rebuilt = db.get_queue_message(&payload.id).await.unwrap().unwrap();
        assert_eq!(rebuilt.external_id, payload.external_id);
        assert_eq!(rebuilt.attachments, payload.attachments);
        assert_eq!(rebuilt.parsed_key, payload.parsed_key);
        assert_eq!(rebuilt.priority, MessagePriority::Normal);
    }

    #[tokio::test]
    async fn failed_queue_upsert_leaves_processed_rows_alone() {
        let db = test_db().await;
        let payload = make_payload("<done@example.com>");
        db.claim_email(&payload).await.unwrap();
        db.mark_email_status(&payload.id, EmailStatus::Done, None)
            .await
            .unwrap();

        db.save_failed_queue(&payload, "late failure").await.unwrap();
        let email = db.get_email(&payload.id).await.unwrap().unwrap();
        assert_eq!(email.status, EmailStatus::Done);
        assert!(email.last_error.is_none());
    }

    #[tokio::test]
    async fn mark_status_truncates_error() {
        let db = test_db().await;
        let payload = make_payload("<err@example.com>");
        db.claim_email(&payload).await.unwrap();

        let long = "e".repeat(5000);
        db.mark_email_status(&payload.id, EmailStatus::Error, Some(&long))
            .await
            .unwrap();
        let email = db.get_email(&payload.id).await.unwrap().unwrap();
        assert_eq!(email.status, EmailStatus::Error);
        assert_eq!(email.last_error.unwrap().len(), 2000);
    }

    #[tokio::test]
    async fn failed_queue_listing_is_oldest_first_and_bounded() {
        let db = test_db().await;
        let mut ids = Vec::new();
        for i in 0..3 {
            let payload = make_payload(&format!("<fq{i}@example.com>"));
            db.save_failed_queue(&payload, "congested").await.unwrap();
            ids.push(payload.id);
        }
        let listed = db.list_failed_queue(2).await.unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].id, ids[0]);
        assert_eq!(listed[1].id, ids[1]);
    }

    // ── AI result tests ─────────────────────────────────────────────

    #[tokio::test]
    async fn classification_upsert_replaces_and_clears_draft() {
        let db = test_db().await;
        let payload = make_payload("<ai@example.com>");
        db.claim_email(&payload).await.unwrap();

        db.upsert_classification(&payload.id, &classification(Category::Support, 0.9), "p", "m", 12)
            .await
            .unwrap();
        let draft: ReplyDraft = serde_json::from_str("{}").unwrap();
        db.upsert_reply_draft(&payload.id, &draft).await.unwrap();
        assert!(
            db.get_classification(&payload.id)
                .await
                .unwrap()
                .unwrap()
                .reply_draft
                .is_some()
        );

        db.upsert_classification(&payload.id, &classification(Category::Invoice, 0.7), "heuristic", "heuristic-v1", 1)
            .await
            .unwrap();
        let stored = db.get_classification(&payload.id).await.unwrap().unwrap();
        assert_eq!(stored.classification.category, Category::Invoice);
        assert_eq!(stored.provider, "heuristic");
        assert!(stored.reply_draft.is_none());
    }

    #[tokio::test]
    async fn reply_draft_requires_classification() {
        let db = test_db().await;
        let draft: ReplyDraft = serde_json::from_str("{}").unwrap();
        let err = db.upsert_reply_draft("missing", &draft).await.unwrap_err();
        assert!(matches!(err, DatabaseError::NotFound { .. }));
    }

    #[tokio::test]
    async fn latest_trace_wins() {
        let db = test_db().await;
        for provider in ["workers-ai", "heuristic"] {
            db.insert_raw_trace(
                "e1",
                &RawProviderTrace {
                    provider: provider.into(),
                    model: "m".into(),
                    request_redacted: "{}".into(),
                    response_text: None,
                    response_json: None,
                    created_at: Utc::now(),
                },
            )
            .await
            .unwrap();
        }
        let latest = db.latest_raw_trace("e1").await.unwrap().unwrap();
        assert_eq!(latest.provider, "heuristic");
    }

    // ── Timeline tests ──────────────────────────────────────────────

    #[tokio::test]
    async fn events_and_logs_keep_insertion_order() {
        let db = test_db().await;
        for stage in [Stage::Received, Stage::Queued, Stage::Processing, Stage::AiDone] {
            db.insert_event("e1", stage, EventStatus::Ok, Some(&json!({"n": 1})))
                .await
                .unwrap();
        }
        let stages: Vec<Stage> = db
            .list_events("e1")
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.stage)
            .collect();
        assert_eq!(
            stages,
            vec![Stage::Received, Stage::Queued, Stage::Processing, Stage::AiDone]
        );

        db.insert_action_log("e1", ActionType::NotifySlack, &json!({"priority": 5}), ActionStatus::Failed, Some("HTTP 500"))
            .await
            .unwrap();
        let logs = db.list_action_logs("e1").await.unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].action_type, ActionType::NotifySlack);
        assert_eq!(logs[0].status, ActionStatus::Failed);
        assert_eq!(logs[0].action_config["priority"], 5);
    }

    // ── Manual review tests ─────────────────────────────────────────

    #[tokio::test]
    async fn open_review_is_reused_per_email() {
        let db = test_db().await;
        let first = db
            .create_manual_review("e1", ReviewPriority::P2, "Low confidence score: 0.5")
            .await
            .unwrap();
        let again = db
            .create_manual_review("e1", ReviewPriority::P2, "Low confidence score: 0.5")
            .await
            .unwrap();
        assert_eq!(again.id, first.id);
        assert_eq!(db.list_manual_reviews_for_email("e1").await.unwrap().len(), 1);

        let mut closed = first.clone();
        closed.transition(ReviewStatus::Closed, None, Utc::now()).unwrap();
        db.save_manual_review(&closed).await.unwrap();

        let fresh = db
            .create_manual_review("e1", ReviewPriority::P1, "High risk category: urgent")
            .await
            .unwrap();
        assert_ne!(fresh.id, first.id);
        assert_eq!(db.list_manual_reviews_for_email("e1").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn review_lifecycle_persists() {
        let db = test_db().await;
        let mut task = db
            .create_manual_review("e1", ReviewPriority::P0, "High risk category: legal")
            .await
            .unwrap();
        assert_eq!(db.list_open_manual_reviews().await.unwrap().len(), 1);

        task.transition(ReviewStatus::Acknowledged, Some("sam".into()), Utc::now())
            .unwrap();
        db.save_manual_review(&task).await.unwrap();
        task.transition(ReviewStatus::Resolved, None, Utc::now()).unwrap();
        db.save_manual_review(&task).await.unwrap();

        let stored = db.get_manual_review(&task.id).await.unwrap().unwrap();
        assert_eq!(stored.status, ReviewStatus::Resolved);
        assert_eq!(stored.assignee.as_deref(), Some("sam"));
        assert!(stored.acknowledged_at.is_some());
        assert!(stored.resolved_at.is_some());
        assert!(db.list_open_manual_reviews().await.unwrap().is_empty());
        assert_eq!(
            db.list_manual_reviews(Some(ReviewStatus::Resolved), 10)
                .await
                .unwrap()
                .len(),
            1
        );
    }

    // ── Prompt template tests ───────────────────────────────────────

    #[tokio::test]
    async fn prompt_activation_is_exclusive() {
        let db = test_db().await;
        for version in 1..=3 {
            db.create_prompt_template(&NewPromptTemplate {
                name: "classify".into(),
                version,
                content: format!("v{version}"),
                output_schema: None,
                created_by: Some("ops".into()),
            })
            .await
            .unwrap();
        }

        db.activate_prompt_template("classify", 2).await.unwrap();
        db.activate_prompt_template("classify", 3).await.unwrap();

        let active: Vec<i64> = db
            .list_prompt_templates(Some("classify"))
            .await
            .unwrap()
            .into_iter()
            .filter(|t| t.is_active)
            .map(|t| t.version)
            .collect();
        assert_eq!(active, vec![3]);

        let err = db.activate_prompt_template("classify", 9).await.unwrap_err();
        assert!(matches!(err, DatabaseError::NotFound { .. }));
        // Failed activation leaves the previous version active.
        let current = db.get_active_prompt("classify").await.unwrap().unwrap();
        assert_eq!(current.version, 3);
    }

    #[tokio::test]
    async fn duplicate_prompt_version_is_a_constraint_error() {
        let db = test_db().await;
        let template = NewPromptTemplate {
            name: "reply".into(),
            version: 1,
            content: "x".into(),
            output_schema: Some(json!({"type": "object"})),
            created_by: None,
        };
        db.create_prompt_template(&template).await.unwrap();
        let err = db.create_prompt_template(&template).await.unwrap_err();
        assert!(matches!(err, DatabaseError::Constraint(_)));
    }

    // ── Retention tests ─────────────────────────────────────────────

    #[tokio::test]
    async fn expired_selection_skips_legal_hold() {
        let db = test_db().await;
        let mut old = make_payload("<old@example.com>");
        old.received_at = Utc::now() - Duration::days(400);
        let mut held = make_payload("<held@example.com>");
        held.received_at = Utc::now() - Duration::days(900);
        let fresh = make_payload("<fresh@example.com>");
        for p in [&old, &held, &fresh] {
            db.claim_email(p).await.unwrap();
        }
        assert!(db.set_legal_hold(&held.id, true).await.unwrap());

        let cutoff = Utc::now() - Duration::days(365);
        let expired = db.list_expired_emails(cutoff, 200).await.unwrap();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].id, old.id);
    }

    #[tokio::test]
    async fn cascade_removes_every_dependent_row() {
        let db = test_db().await;
        let payload = make_payload("<cascade@example.com>");
        let keep = make_payload("<keep@example.com>");
        db.claim_email(&payload).await.unwrap();
        db.claim_email(&keep).await.unwrap();
        db.replace_attachments(&payload.id, &payload.attachments).await.unwrap();
        db.replace_attachments(&keep.id, &keep.attachments).await.unwrap();
        db.upsert_classification(&payload.id, &classification(Category::Legal, 0.9), "p", "m", 1)
            .await
            .unwrap();
        db.insert_event(&payload.id, Stage::Processing, EventStatus::Ok, None)
            .await
            .unwrap();
        db.insert_action_log(&payload.id, ActionType::DropSpam, &json!({}), ActionStatus::Success, None)
            .await
            .unwrap();
        db.create_manual_review(&payload.id, ReviewPriority::P0, "r")
            .await
            .unwrap();

        let ids = vec![payload.id.clone()];
        assert_eq!(
            db.list_attachment_keys(&ids).await.unwrap(),
            vec!["emails/x_attachments/2024/01/01/a.bin".to_string()]
        );
        assert_eq!(db.delete_email_cascade(&ids).await.unwrap(), 1);

        assert!(db.get_email(&payload.id).await.unwrap().is_none());
        assert!(db.list_attachments(&payload.id).await.unwrap().is_empty());
        assert!(db.get_classification(&payload.id).await.unwrap().is_none());
        assert!(db.list_events(&payload.id).await.unwrap().is_empty());
        assert!(db.list_action_logs(&payload.id).await.unwrap().is_empty());
        assert!(db.list_manual_reviews_for_email(&payload.id).await.unwrap().is_empty());

        // Unrelated email is untouched, and a second pass deletes nothing.
        assert_eq!(db.list_attachments(&keep.id).await.unwrap().len(), 1);
        assert_eq!(db.delete_email_cascade(&ids).await.unwrap(), 0);
    }

    // ── Config store tests ──────────────────────────────────────────

    #[tokio::test]
    async fn config_roundtrip() {
        let db = test_db().await;
        assert_eq!(db.get_config("rules:*").await.unwrap(), None);
        db.set_config("rules:*", r#"{"enableSlackNotify":false}"#).await.unwrap();
        db.set_config("rules:*", r#"{"enableSlackNotify":true}"#).await.unwrap();
        assert_eq!(
            db.get_config("rules:*").await.unwrap().as_deref(),
            Some(r#"{"enableSlackNotify":true}"#)
        );
        db.delete_config("rules:*").await.unwrap();
        assert_eq!(db.get_config("rules:*").await.unwrap(), None);
    }
}
