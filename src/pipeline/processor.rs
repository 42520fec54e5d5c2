//! Message processor: the per-message state machine.
//!
//! Flow for one queue payload:
//! 1. Dedup claim keyed by external id → duplicates stop here
//! 2. `processing` event
//! 3. Attachment rows
//! 4. Classification (upsert + raw trace + `ai_done` event)
//! 5. Reply draft when a reply is required (failure only skips step 7)
//! 6. Action rules
//! 7. Auto-reply gate (never aborts)
//! 8. Terminal status and event
//!
//! A failure in steps 3–8 marks the email `error`, writes an audit trail
//! and is returned so the transport can redeliver.

use std::sync::Arc;

use serde_json::json;
use tracing::{debug, error, info, warn};

use crate::classify::prompts::{CLASSIFY_PROMPT_NAME, REPLY_PROMPT_NAME};
use crate::classify::schema::{Classification, ReplyDraft};
use crate::classify::{AiResult, ClassificationService};
use crate::error::PipelineError;
use crate::pipeline::auto_reply::{AutoReplyGate, ReplyOutcome};
use crate::pipeline::rules::{ActionOutcome, ActionRuleEngine};
use crate::pipeline::types::QueueMessage;
use crate::store::Database;
use crate::store::model::{ActionStatus, ActionType, ClaimOutcome, EmailStatus, EventStatus, Stage};

/// Result of handling one queue payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// The dedup key was already processed.
    Duplicate,
    /// The pipeline ran to a terminal status.
    Finished(EmailStatus),
}

pub struct MessageProcessor {
    db: Arc<dyn Database>,
    classifier: Arc<ClassificationService>,
    actions: ActionRuleEngine,
    replies: AutoReplyGate,
}

impl MessageProcessor {
    pub fn new(
        db: Arc<dyn Database>,
        classifier: Arc<ClassificationService>,
        actions: ActionRuleEngine,
        replies: AutoReplyGate,
    ) -> Self {
        Self {
            db,
            classifier,
            actions,
            replies,
        }
    }

    pub fn replies(&self) -> &AutoReplyGate {
        &self.replies
    }

    /// Process one delivered payload. Safe to call again for the same payload.
    pub async fn process(&self, message: &QueueMessage) -> Result<ProcessOutcome, PipelineError> {
        match self.db.claim_email(message).await? {
            ClaimOutcome::Duplicate => {
                debug!(
                    email_id = %message.id,
                    external_id = %message.external_id,
                    "Duplicate delivery, skipping"
                );
                return Ok(ProcessOutcome::Duplicate);
            }
            ClaimOutcome::Reclaimed => {
                info!(email_id = %message.id, "Re-driven message reclaimed");
            }
            ClaimOutcome::Inserted => {}
        }

        info!(
            email_id = %message.id,
            from = %message.from,
            to = %message.to,
            "Processing message"
        );
        self.db
            .insert_event(&message.id, Stage::Processing, EventStatus::Ok, None)
            .await?;
        self.run_guarded(message).await.map(ProcessOutcome::Finished)
    }

    /// Re-run stages 3–8 for a stored email on operator request.
    pub async fn reprocess(&self, email_id: &str, source: &str) -> Result<EmailStatus, PipelineError> {
        let message = self.load_message(email_id).await?;

        self.db
            .mark_email_status(email_id, EmailStatus::Processing, None)
            .await?;
        self.db
            .insert_event(
                email_id,
                Stage::Retry,
                EventStatus::Ok,
                Some(&json!({ "source": source })),
            )
            .await?;

        info!(email_id = %email_id, source = %source, "Reprocessing message");
        self.run_guarded(&message).await
    }

    /// Re-run the action rules against the stored classification.
    pub async fn replay_action(&self, email_id: &str) -> Result<ActionOutcome, PipelineError> {
        let message = self.load_message(email_id).await?;
        let stored = self
            .db
            .get_classification(email_id)
            .await?
            .ok_or_else(|| missing(email_id, "classification"))?;

        let outcome = self.actions.execute(&message, &stored.classification).await?;
        info!(
            email_id = %email_id,
            manual_review = outcome.manual_review_created,
            "Actions replayed"
        );
        Ok(outcome)
    }

    /// Send the stored draft now, bypassing the auto-send policy.
    pub async fn send_reply(&self, email_id: &str) -> Result<Option<String>, PipelineError> {
        let message = self.load_message(email_id).await?;
        let draft = self
            .db
            .get_classification(email_id)
            .await?
            .and_then(|stored| stored.reply_draft)
            .ok_or_else(|| missing(email_id, "reply draft"))?;

        match self.replies.send_now(&message, &draft).await {
            Ok(id) => Ok(id),
            Err(e) => {
                self.log_best_effort(
                    email_id,
                    ActionType::ReplySendFailed,
                    &json!({ "mode": "manual", "to": message.from }),
                    ActionStatus::Failed,
                    Some(&e.to_string()),
                )
                .await;
                Err(e)
            }
        }
    }

    async fn load_message(&self, email_id: &str) -> Result<QueueMessage, PipelineError> {
        self.db
            .get_queue_message(email_id)
            .await?
            .ok_or_else(|| PipelineError::EmailNotFound(email_id.to_string()))
    }

    /// Run stages 3–8, recording the failure trail on error.
    async fn run_guarded(&self, message: &QueueMessage) -> Result<EmailStatus, PipelineError> {
        match self.run_stages(message).await {
            Ok(status) => Ok(status),
            Err(e) => {
                self.record_failure(message, &e).await;
                Err(e)
            }
        }
    }

    async fn run_stages(&self, message: &QueueMessage) -> Result<EmailStatus, PipelineError> {
        let email_id = message.id.as_str();

        self.db
            .replace_attachments(email_id, &message.attachments)
            .await?;

        let instructions = self.active_prompt(CLASSIFY_PROMPT_NAME).await;
        let ai = self
            .classifier
            .classify(message, instructions.as_deref())
            .await;
        self.db
            .upsert_classification(email_id, &ai.value, &ai.provider, &ai.model, ai.latency_ms)
            .await?;
        self.db.insert_raw_trace(email_id, &ai.trace).await?;
        self.db
            .insert_event(
                email_id,
                Stage::AiDone,
                EventStatus::Ok,
                Some(&json!({
                    "provider": ai.provider,
                    "model": ai.model,
                    "latencyMs": ai.latency_ms,
                    "confidence": ai.value.confidence_score,
                    "category": ai.value.category,
                    "attempts": ai.attempts,
                })),
            )
            .await?;
        info!(
            email_id = %email_id,
            provider = %ai.provider,
            category = %ai.value.category,
            confidence = ai.value.confidence_score,
            "Message classified"
        );
        let classification = ai.value;

        let draft = if classification.requires_reply {
            self.draft(message, &classification).await
        } else {
            None
        };

        let outcome = self.actions.execute(message, &classification).await?;

        if let Some(draft) = &draft {
            self.auto_reply(message, &classification, draft).await;
        }

        let (status, stage) = if outcome.manual_review_created {
            (EmailStatus::ManualReview, Stage::ManualReview)
        } else {
            (EmailStatus::Done, Stage::ActionDone)
        };
        self.db.mark_email_status(email_id, status, None).await?;
        self.db
            .insert_event(
                email_id,
                stage,
                EventStatus::Ok,
                Some(&json!({ "status": status, "dropped": outcome.dropped })),
            )
            .await?;

        info!(email_id = %email_id, status = status.as_str(), "Message processed");
        Ok(status)
    }

    /// Draft and persist a reply. Any failure is logged and yields `None`.
    async fn draft(&self, message: &QueueMessage, classification: &Classification) -> Option<ReplyDraft> {
        let instructions = self.active_prompt(REPLY_PROMPT_NAME).await;
        let ai = self
            .classifier
            .draft_reply(message, classification, instructions.as_deref())
            .await;

        match self.persist_draft(&message.id, &ai).await {
            Ok(()) => Some(ai.value),
            Err(e) => {
                warn!(email_id = %message.id, error = %e, "Failed to persist reply draft");
                self.log_best_effort(
                    &message.id,
                    ActionType::ReplyDraft,
                    &json!({ "provider": ai.provider, "model": ai.model }),
                    ActionStatus::Failed,
                    Some(&e.to_string()),
                )
                .await;
                None
            }
        }
    }

    async fn persist_draft(&self, email_id: &str, ai: &AiResult<ReplyDraft>) -> Result<(), PipelineError> {
        self.db.upsert_reply_draft(email_id, &ai.value).await?;
        self.db.insert_raw_trace(email_id, &ai.trace).await?;
        self.db
            .insert_action_log(
                email_id,
                ActionType::ReplyDraft,
                &json!({
                    "provider": ai.provider,
                    "model": ai.model,
                    "autoSendSafe": ai.value.auto_send_safe,
                }),
                ActionStatus::Success,
                None,
            )
            .await?;
        Ok(())
    }

    async fn auto_reply(&self, message: &QueueMessage, classification: &Classification, draft: &ReplyDraft) {
        match self.replies.maybe_send(message, classification, draft).await {
            Ok(ReplyOutcome::Sent { .. }) => {}
            Ok(ReplyOutcome::Skipped(reason)) => {
                self.log_best_effort(
                    &message.id,
                    ActionType::ReplySendSkipped,
                    &json!({ "reason": reason.code(), "detail": reason.to_string() }),
                    ActionStatus::Success,
                    None,
                )
                .await;
            }
            Err(e) => {
                warn!(email_id = %message.id, error = %e, "Auto-reply send failed");
                self.log_best_effort(
                    &message.id,
                    ActionType::ReplySendFailed,
                    &json!({ "mode": "auto", "to": message.from }),
                    ActionStatus::Failed,
                    Some(&e.to_string()),
                )
                .await;
            }
        }
    }

    async fn active_prompt(&self, name: &str) -> Option<String> {
        match self.db.get_active_prompt(name).await {
            Ok(template) => template.map(|t| t.content),
            Err(e) => {
                warn!(prompt = %name, error = %e, "Prompt lookup failed, using built-in");
                None
            }
        }
    }

    async fn record_failure(&self, message: &QueueMessage, err: &PipelineError) {
        let email_id = message.id.as_str();
        let reason = err.to_string();
        error!(email_id = %email_id, error = %reason, "Message processing failed");

        if let Err(e) = self
            .db
            .mark_email_status(email_id, EmailStatus::Error, Some(&reason))
            .await
        {
            error!(email_id = %email_id, error = %e, "Failed to mark email as error");
        }
        self.log_best_effort(
            email_id,
            ActionType::AiProcess,
            &json!({ "priority": message.priority }),
            ActionStatus::Failed,
            Some(&reason),
        )
        .await;
        if let Err(e) = self
            .db
            .insert_event(
                email_id,
                Stage::Error,
                EventStatus::Failed,
                Some(&json!({ "error": reason })),
            )
            .await
        {
            error!(email_id = %email_id, error = %e, "Failed to record error event");
        }
    }

    async fn log_best_effort(
        &self,
        email_id: &str,
        action: ActionType,
        config: &serde_json::Value,
        status: ActionStatus,
        error: Option<&str>,
    ) {
        if let Err(e) = self
            .db
            .insert_action_log(email_id, action, config, status, error)
            .await
        {
            warn!(
                email_id = %email_id,
                action = action.as_str(),
                error = %e,
                "Failed to write action log"
            );
        }
    }
}

fn missing(email_id: &str, what: &str) -> PipelineError {
    PipelineError::MissingArtifact {
        email_id: email_id.to_string(),
        what: what.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::heuristic::HEURISTIC_PROVIDER;
    use crate::config::ReplyConfig;
    use crate::error::LlmError;
    use crate::llm::{CompletionRequest, CompletionResponse, LlmProvider};
    use crate::pipeline::types::{AttachmentMeta, test_message};
    use crate::store::LibSqlBackend;
    use crate::store::model::{NewPromptTemplate, ReviewPriority};
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Answers classification prompts with `classification` and reply
    /// prompts with `draft`, recording every user prompt it sees.
    struct ScriptedLlm {
        classification: &'static str,
        draft: &'static str,
        prompts: Mutex<Vec<String>>,
    }

    impl ScriptedLlm {
        fn new(classification: &'static str, draft: &'static str) -> Arc<Self> {
            Arc::new(Self {
                classification,
                draft,
                prompts: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl LlmProvider for ScriptedLlm {
        fn name(&self) -> &str {
            "scripted"
        }

        fn model_name(&self) -> &str {
            "scripted-1"
        }

        async fn complete(&self, request: &CompletionRequest) -> Result<CompletionResponse, LlmError> {
            let prompt = request.user_prompt();
            self.prompts.lock().unwrap().push(prompt.clone());
            let content = if prompt.contains("Original subject:") {
                self.draft
            } else {
                self.classification
            };
            Ok(CompletionResponse {
                content: content.to_string(),
                request_redacted: "{}".into(),
                response_text: content.to_string(),
                response_json: None,
            })
        }
    }

    const CONFIDENT_SUPPORT: &str = r#"{"category":"support","priority":3,"summary":"Printer help","requiresReply":true,"confidenceScore":0.92}"#;
    const CONFIDENT_INVOICE: &str = r#"{"category":"invoice","priority":2,"summary":"Invoice","confidenceScore":0.95}"#;
    const SAFE_DRAFT: &str = r#"{"subject":"Re: Printer","body":"Try turning it off and on.","autoSendSafe":true}"#;

    async fn test_db() -> Arc<LibSqlBackend> {
        Arc::new(LibSqlBackend::new_memory().await.unwrap())
    }

    fn processor(db: &Arc<LibSqlBackend>, classifier: ClassificationService) -> MessageProcessor {
        processor_with_replies(db, classifier, &ReplyConfig::default())
    }

    fn processor_with_replies(
        db: &Arc<LibSqlBackend>,
        classifier: ClassificationService,
        reply_config: &ReplyConfig,
    ) -> MessageProcessor {
        let sender = crate::channels::ResendSender::from_config(reply_config, reqwest::Client::new());
        MessageProcessor::new(
            db.clone(),
            Arc::new(classifier),
            ActionRuleEngine::new(db.clone(), db.clone(), None, None),
            AutoReplyGate::new(db.clone(), sender, reply_config),
        )
    }

    async fn stages(db: &LibSqlBackend, email_id: &str) -> Vec<Stage> {
        db.list_events(email_id)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.stage)
            .collect()
    }

    async fn action_types(db: &LibSqlBackend, email_id: &str) -> Vec<ActionType> {
        db.list_action_logs(email_id)
            .await
            .unwrap()
            .into_iter()
            .map(|l| l.action_type)
            .collect()
    }

    // ── Happy paths ─────────────────────────────────────────────────

    #[tokio::test]
    async fn confident_message_finishes_done() {
        let db = test_db().await;
        let llm = ScriptedLlm::new(CONFIDENT_INVOICE, SAFE_DRAFT);
        let p = processor(&db, ClassificationService::new(vec![llm.clone()]));
        let mut message = test_message("Invoice 42", "please pay");
        message.attachments.push(AttachmentMeta {
            filename: "invoice.pdf".into(),
            mime_type: "application/pdf".into(),
            size: 10,
            storage_key: Some("emails/x_attachments/2024/01/01/a.bin".into()),
        });

        let outcome = p.process(&message).await.unwrap();
        assert_eq!(outcome, ProcessOutcome::Finished(EmailStatus::Done));

        assert_eq!(
            stages(&db, &message.id).await,
            vec![Stage::Processing, Stage::AiDone, Stage::ActionDone]
        );
        let stored = db.get_classification(&message.id).await.unwrap().unwrap();
        assert_eq!(stored.provider, "scripted");
        assert!(stored.reply_draft.is_none());
        assert_eq!(db.list_attachments(&message.id).await.unwrap().len(), 1);
        assert!(db.latest_raw_trace(&message.id).await.unwrap().is_some());
        // No reply required, so the drafting prompt never ran.
        assert_eq!(llm.prompts.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn heuristic_fallback_escalates_low_confidence() {
        let db = test_db().await;
        let p = processor(&db, ClassificationService::heuristic_only());
        let message = test_message("Weekly digest", "news");

        let outcome = p.process(&message).await.unwrap();
        assert_eq!(outcome, ProcessOutcome::Finished(EmailStatus::ManualReview));

        let stored = db.get_classification(&message.id).await.unwrap().unwrap();
        assert_eq!(stored.provider, HEURISTIC_PROVIDER);
        let tasks = db.list_manual_reviews_for_email(&message.id).await.unwrap();
        assert_eq!(tasks[0].priority, ReviewPriority::P2);
        assert_eq!(
            stages(&db, &message.id).await,
            vec![Stage::Processing, Stage::AiDone, Stage::ManualReview]
        );

        let events = db.list_events(&message.id).await.unwrap();
        let detail = events[1].detail.as_ref().unwrap();
        assert_eq!(detail["attempts"][0]["provider"], HEURISTIC_PROVIDER);
    }

    #[tokio::test]
    async fn duplicate_delivery_is_a_no_op() {
        let db = test_db().await;
        let p = processor(&db, ClassificationService::heuristic_only());
        let message = test_message("Hello", "hi");

        p.process(&message).await.unwrap();
        let events_before = db.list_events(&message.id).await.unwrap().len();
        let logs_before = db.list_action_logs(&message.id).await.unwrap().len();

        let mut again = message.clone();
        again.id = uuid::Uuid::new_v4().to_string();
        assert_eq!(p.process(&again).await.unwrap(), ProcessOutcome::Duplicate);
        assert_eq!(p.process(&message).await.unwrap(), ProcessOutcome::Duplicate);

        assert!(db.get_email(&again.id).await.unwrap().is_none());
        assert_eq!(db.list_events(&message.id).await.unwrap().len(), events_before);
        assert_eq!(db.list_action_logs(&message.id).await.unwrap().len(), logs_before);
    }

    #[tokio::test]
    async fn reply_required_drafts_and_logs_skip() {
        let db = test_db().await;
        let llm = ScriptedLlm::new(CONFIDENT_SUPPORT, SAFE_DRAFT);
        let p = processor(&db, ClassificationService::new(vec![llm]));
        let message = test_message("Printer", "it is broken");

        let outcome = p.process(&message).await.unwrap();
        assert_eq!(outcome, ProcessOutcome::Finished(EmailStatus::Done));

        let stored = db.get_classification(&message.id).await.unwrap().unwrap();
        assert_eq!(stored.reply_draft.unwrap().subject, "Re: Printer");

        let logs = db.list_action_logs(&message.id).await.unwrap();
        let types: Vec<ActionType> = logs.iter().map(|l| l.action_type).collect();
        assert_eq!(types, vec![ActionType::ReplyDraft, ActionType::ReplySendSkipped]);
        assert_eq!(logs[1].action_config["reason"], "missing_credentials");
    }

    #[tokio::test]
    async fn active_prompt_template_overrides_instructions() {
        let db = test_db().await;
        db.create_prompt_template(&NewPromptTemplate {
            name: CLASSIFY_PROMPT_NAME.into(),
            version: 1,
            content: "CUSTOM CLASSIFIER HEADER".into(),
            output_schema: None,
            created_by: None,
        })
        .await
        .unwrap();
        db.activate_prompt_template(CLASSIFY_PROMPT_NAME, 1)
            .await
            .unwrap();

        let llm = ScriptedLlm::new(CONFIDENT_INVOICE, SAFE_DRAFT);
        let p = processor(&db, ClassificationService::new(vec![llm.clone()]));
        p.process(&test_message("Invoice", "")).await.unwrap();

        let prompts = llm.prompts.lock().unwrap();
        assert!(prompts[0].starts_with("CUSTOM CLASSIFIER HEADER"));
    }

    // ── Failure handling ────────────────────────────────────────────

    #[tokio::test]
    async fn stage_failure_marks_error_and_propagates() {
        let db = test_db().await;
        db.execute_raw("DROP TABLE email_ai_results").await;
        let p = processor(&db, ClassificationService::heuristic_only());
        let message = test_message("Hello", "");

        let err = p.process(&message).await.unwrap_err();
        assert!(matches!(err, PipelineError::Database(_)));

        let email = db.get_email(&message.id).await.unwrap().unwrap();
        assert_eq!(email.status, EmailStatus::Error);
        assert!(email.last_error.unwrap().contains("Store failure"));
        assert_eq!(
            stages(&db, &message.id).await,
            vec![Stage::Processing, Stage::Error]
        );
        assert_eq!(action_types(&db, &message.id).await, vec![ActionType::AiProcess]);
    }

    #[tokio::test]
    async fn errored_message_can_be_reprocessed() {
        let db = test_db().await;
        let p = processor(&db, ClassificationService::heuristic_only());
        let message = test_message("Hello", "");
        db.claim_email(&message).await.unwrap();
        db.mark_email_status(&message.id, EmailStatus::Error, Some("boom"))
            .await
            .unwrap();

        let status = p.reprocess(&message.id, "internal_api").await.unwrap();
        assert_eq!(status, EmailStatus::ManualReview);

        let events = db.list_events(&message.id).await.unwrap();
        assert_eq!(events[0].stage, Stage::Retry);
        assert_eq!(events[0].detail.as_ref().unwrap()["source"], "internal_api");
        let email = db.get_email(&message.id).await.unwrap().unwrap();
        assert_eq!(email.last_error, None);
    }

    #[tokio::test]
    async fn reruns_keep_a_single_open_review() {
        let db = test_db().await;
        let p = processor(&db, ClassificationService::heuristic_only());
        let message = test_message("Weekly digest", "news");
        p.process(&message).await.unwrap();

        db.mark_email_status(&message.id, EmailStatus::Error, Some("event write failed"))
            .await
            .unwrap();
        let mut redelivered = message.clone();
        redelivered.redrive = true;
        let outcome = p.process(&redelivered).await.unwrap();
        assert_eq!(outcome, ProcessOutcome::Finished(EmailStatus::ManualReview));

        p.reprocess(&message.id, "internal_api").await.unwrap();

        let tasks = db.list_manual_reviews_for_email(&message.id).await.unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(db.list_open_manual_reviews().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn reprocess_unknown_email_is_not_found() {
        let db = test_db().await;
        let p = processor(&db, ClassificationService::heuristic_only());
        match p.reprocess("missing", "internal_api").await {
            Err(PipelineError::EmailNotFound(id)) => assert_eq!(id, "missing"),
            other => panic!("Expected EmailNotFound, got {:?}", other),
        }
    }

    // ── Operator commands ───────────────────────────────────────────

    #[tokio::test]
    async fn replay_needs_classification() {
        let db = test_db().await;
        let p = processor(&db, ClassificationService::heuristic_only());
        let message = test_message("Hello", "");
        db.claim_email(&message).await.unwrap();

        match p.replay_action(&message.id).await {
            Err(PipelineError::MissingArtifact { what, .. }) => assert_eq!(what, "classification"),
            other => panic!("Expected MissingArtifact, got {:?}", other),
        }

        p.reprocess(&message.id, "test").await.unwrap();
        let outcome = p.replay_action(&message.id).await.unwrap();
        assert!(outcome.manual_review_created);
        assert_eq!(db.list_manual_reviews_for_email(&message.id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn send_reply_without_credentials_logs_failure() {
        let db = test_db().await;
        let llm = ScriptedLlm::new(CONFIDENT_SUPPORT, SAFE_DRAFT);
        let p = processor(&db, ClassificationService::new(vec![llm]));
        let message = test_message("Printer", "");
        p.process(&message).await.unwrap();

        let err = p.send_reply(&message.id).await.unwrap_err();
        assert!(matches!(err, PipelineError::Channel(_)));
        let types = action_types(&db, &message.id).await;
        assert_eq!(types.last(), Some(&ActionType::ReplySendFailed));
    }
}
