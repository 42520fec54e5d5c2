//! Auto-reply gate: decides whether a draft may go out without a human.

use std::fmt;
use std::sync::Arc;

use serde_json::json;
use tracing::{debug, info};

use crate::channels::{OutboundReply, ResendSender};
use crate::classify::schema::{Classification, ReplyDraft};
use crate::config::ReplyConfig;
use crate::error::{ChannelError, PipelineError};
use crate::pipeline::types::QueueMessage;
use crate::store::Database;
use crate::store::model::{ActionStatus, ActionType};

/// Why a draft was not sent automatically.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SkipReason {
    MissingCredentials,
    AutoSendDisabled,
    NotAutoSendSafe,
    BelowConfidence { threshold: f64 },
}

impl SkipReason {
    /// Machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            SkipReason::MissingCredentials => "missing_credentials",
            SkipReason::AutoSendDisabled => "auto_send_disabled",
            SkipReason::NotAutoSendSafe => "not_auto_send_safe",
            SkipReason::BelowConfidence { .. } => "below_confidence",
        }
    }
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::MissingCredentials => f.write_str("missing resend config"),
            SkipReason::AutoSendDisabled => f.write_str("auto send disabled"),
            SkipReason::NotAutoSendSafe => f.write_str("draft autoSendSafe=false"),
            SkipReason::BelowConfidence { threshold } => {
                write!(f, "confidence below threshold {threshold}")
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReplyOutcome {
    Sent { provider_id: Option<String> },
    Skipped(SkipReason),
}

impl ReplyOutcome {
    pub fn is_sent(&self) -> bool {
        matches!(self, ReplyOutcome::Sent { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendMode {
    Auto,
    Manual,
}

impl SendMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SendMode::Auto => "auto",
            SendMode::Manual => "manual",
        }
    }
}

pub struct AutoReplyGate {
    db: Arc<dyn Database>,
    sender: Option<ResendSender>,
    auto_send: bool,
    min_confidence: f64,
}

impl AutoReplyGate {
    pub fn new(db: Arc<dyn Database>, sender: Option<ResendSender>, config: &ReplyConfig) -> Self {
        Self {
            db,
            sender,
            auto_send: config.auto_send,
            min_confidence: config.min_confidence,
        }
    }

    /// Check every precondition in order, returning the first one unmet.
    pub fn check(&self, classification: &Classification, draft: &ReplyDraft) -> Option<SkipReason> {
        if self.sender.is_none() {
            return Some(SkipReason::MissingCredentials);
        }
        if !self.auto_send {
            return Some(SkipReason::AutoSendDisabled);
        }
        if !draft.auto_send_safe {
            return Some(SkipReason::NotAutoSendSafe);
        }
        if classification.confidence_score < self.min_confidence {
            return Some(SkipReason::BelowConfidence {
                threshold: self.min_confidence,
            });
        }
        None
    }

    /// Send the draft when every precondition holds.
    ///
    /// An unmet precondition is `Ok(Skipped)`; a provider failure is an error.
    pub async fn maybe_send(
        &self,
        message: &QueueMessage,
        classification: &Classification,
        draft: &ReplyDraft,
    ) -> Result<ReplyOutcome, PipelineError> {
        if let Some(reason) = self.check(classification, draft) {
            debug!(email_id = %message.id, reason = %reason, "Auto-reply skipped");
            return Ok(ReplyOutcome::Skipped(reason));
        }
        let provider_id = self.deliver(message, draft, SendMode::Auto).await?;
        Ok(ReplyOutcome::Sent { provider_id })
    }

    /// Send a stored draft on operator request, bypassing the policy checks.
    pub async fn send_now(
        &self,
        message: &QueueMessage,
        draft: &ReplyDraft,
    ) -> Result<Option<String>, PipelineError> {
        self.deliver(message, draft, SendMode::Manual).await
    }

    pub fn is_configured(&self) -> bool {
        self.sender.is_some()
    }

    async fn deliver(
        &self,
        message: &QueueMessage,
        draft: &ReplyDraft,
        mode: SendMode,
    ) -> Result<Option<String>, PipelineError> {
        let sender = self.sender.as_ref().ok_or_else(|| ChannelError::NotConfigured {
            name: "resend".to_string(),
        })?;

        let reply = OutboundReply {
            to: message.from.clone(),
            reply_to: message.to.clone(),
            subject: draft.subject.clone(),
            text: draft.body.clone(),
        };
        let provider_id = sender.send(&reply).await?;

        let mut config = json!({
            "mode": mode.as_str(),
            "to": message.from,
            "from": sender.from_address(),
        });
        if mode == SendMode::Auto {
            config["autoSendSafe"] = json!(draft.auto_send_safe);
        }
        self.db
            .insert_action_log(
                &message.id,
                ActionType::ReplySent,
                &config,
                ActionStatus::Success,
                None,
            )
            .await?;

        info!(
            email_id = %message.id,
            mode = mode.as_str(),
            "Reply sent"
        );
        Ok(provider_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::types::test_message;
    use crate::store::LibSqlBackend;
    use secrecy::SecretString;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn test_db() -> Arc<LibSqlBackend> {
        let db = LibSqlBackend::new_memory().await.unwrap();
        db.run_migrations().await.unwrap();
        Arc::new(db)
    }

    fn reply_config(server: Option<&MockServer>, auto_send: bool) -> ReplyConfig {
        ReplyConfig {
            resend_api_key: server.map(|_| SecretString::from("re_test")),
            from_address: server.map(|_| "support@acme.test".to_string()),
            resend_base_url: server
                .map(|s| s.uri())
                .unwrap_or_else(|| "http://127.0.0.1:1".to_string()),
            auto_send,
            min_confidence: 0.85,
        }
    }

    fn gate(db: &Arc<LibSqlBackend>, config: &ReplyConfig) -> AutoReplyGate {
        let sender = ResendSender::from_config(config, reqwest::Client::new());
        AutoReplyGate::new(db.clone(), sender, config)
    }

    fn classification(confidence: f64) -> Classification {
        let mut c = crate::classify::heuristic::classify(&test_message("help", ""));
        c.confidence_score = confidence;
        c
    }

    fn draft(auto_send_safe: bool) -> ReplyDraft {
        ReplyDraft {
            subject: "Re: help".into(),
            body: "We are on it.".into(),
            tone: Default::default(),
            language: "en".into(),
            placeholders: vec![],
            auto_send_safe,
        }
    }

    async fn resend_mock(expected: u64) -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/emails"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"id": "re_1"})))
            .expect(expected)
            .mount(&server)
            .await;
        server
    }

    #[tokio::test]
    async fn preconditions_checked_in_order() {
        let db = test_db().await;

        let no_creds = gate(&db, &reply_config(None, true));
        assert_eq!(
            no_creds.check(&classification(0.99), &draft(true)),
            Some(SkipReason::MissingCredentials)
        );

        let server = resend_mock(0).await;
        let disabled = gate(&db, &reply_config(Some(&server), false));
        assert_eq!(
            disabled.check(&classification(0.99), &draft(false)),
            Some(SkipReason::AutoSendDisabled)
        );

        let enabled = gate(&db, &reply_config(Some(&server), true));
        assert_eq!(
            enabled.check(&classification(0.99), &draft(false)),
            Some(SkipReason::NotAutoSendSafe)
        );
        let reason = enabled.check(&classification(0.5), &draft(true)).unwrap();
        assert_eq!(reason.code(), "below_confidence");
        assert_eq!(reason.to_string(), "confidence below threshold 0.85");
        assert_eq!(enabled.check(&classification(0.9), &draft(true)), None);
    }

    #[tokio::test]
    async fn unsafe_draft_never_sent() {
        let db = test_db().await;
        let server = resend_mock(0).await;
        let gate = gate(&db, &reply_config(Some(&server), true));
        let message = test_message("help", "");
        db.claim_email(&message).await.unwrap();

        let outcome = gate
            .maybe_send(&message, &classification(1.0), &draft(false))
            .await
            .unwrap();
        assert_eq!(outcome, ReplyOutcome::Skipped(SkipReason::NotAutoSendSafe));
        assert!(db.list_action_logs(&message.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn eligible_draft_sent_once() {
        let db = test_db().await;
        let server = resend_mock(1).await;
        let gate = gate(&db, &reply_config(Some(&server), true));
        let message = test_message("help", "");
        db.claim_email(&message).await.unwrap();

        let outcome = gate
            .maybe_send(&message, &classification(0.9), &draft(true))
            .await
            .unwrap();
        assert_eq!(
            outcome,
            ReplyOutcome::Sent {
                provider_id: Some("re_1".into())
            }
        );

        let logs = db.list_action_logs(&message.id).await.unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].action_type, ActionType::ReplySent);
        assert_eq!(logs[0].action_config["mode"], "auto");
        assert_eq!(logs[0].action_config["to"], "customer@example.com");
        assert_eq!(logs[0].action_config["autoSendSafe"], true);
    }

    #[tokio::test]
    async fn provider_failure_propagates() {
        let db = test_db().await;
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(422))
            .mount(&server)
            .await;
        let gate = gate(&db, &reply_config(Some(&server), true));
        let message = test_message("help", "");
        db.claim_email(&message).await.unwrap();

        let err = gate
            .maybe_send(&message, &classification(0.9), &draft(true))
            .await
            .unwrap_err();
        match err {
            PipelineError::Channel(ChannelError::Rejected { status, .. }) => assert_eq!(status, 422),
            other => panic!("Expected Rejected, got {:?}", other),
        }
        assert!(db.list_action_logs(&message.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn send_now_ignores_policy_but_needs_credentials() {
        let db = test_db().await;
        let message = test_message("help", "");
        db.claim_email(&message).await.unwrap();

        let missing = gate(&db, &reply_config(None, false));
        let err = missing.send_now(&message, &draft(false)).await.unwrap_err();
        assert!(matches!(
            err,
            PipelineError::Channel(ChannelError::NotConfigured { .. })
        ));

        let server = resend_mock(1).await;
        let manual = gate(&db, &reply_config(Some(&server), false));
        manual.send_now(&message, &draft(false)).await.unwrap();
        let logs = db.list_action_logs(&message.id).await.unwrap();
        assert_eq!(logs[0].action_config["mode"], "manual");
        assert!(logs[0].action_config.get("autoSendSafe").is_none());
    }
}
