//! Action rule engine: notifications and escalation after classification.
//!
//! Rules are resolved per recipient alias from the configuration store:
//! - `rules:{alias}` overrides
//! - `rules:*` overrides
//! - built-in defaults
//!
//! Every branch taken appends exactly one action log entry.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::channels::slack::format_alert;
use crate::channels::{SlackNotifier, WebhookNotifier, WebhookPayload};
use crate::classify::schema::{Category, Classification};
use crate::error::{ChannelError, PipelineError};
use crate::pipeline::types::QueueMessage;
use crate::store::model::{ActionStatus, ActionType, EmailStatus, ReviewPriority};
use crate::store::{ConfigStore, Database};

/// Confidence below which a classification is escalated.
pub const LOW_CONFIDENCE_THRESHOLD: f64 = 0.6;

/// Global rule override key.
pub const GLOBAL_RULES_KEY: &str = "rules:*";

/// What to do with messages classified as spam.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpamAction {
    #[default]
    Drop,
    Archive,
}

/// Fully resolved rule set for one recipient alias.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleConfig {
    pub spam_action: SpamAction,
    pub urgent_priority_threshold: u8,
    pub enable_slack_notify: bool,
    pub enable_custom_webhook: bool,
    pub auto_create_manual_review: bool,
}

impl Default for RuleConfig {
    fn default() -> Self {
        Self {
            spam_action: SpamAction::Drop,
            urgent_priority_threshold: 4,
            enable_slack_notify: true,
            enable_custom_webhook: false,
            auto_create_manual_review: true,
        }
    }
}

/// A partial rule set as stored under a `rules:` key.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RuleOverride {
    pub spam_action: Option<SpamAction>,
    pub urgent_priority_threshold: Option<u8>,
    pub enable_slack_notify: Option<bool>,
    pub enable_custom_webhook: Option<bool>,
    pub auto_create_manual_review: Option<bool>,
}

impl RuleConfig {
    /// Merge field by field: alias override, then global override, then default.
    pub fn merge(alias: Option<&RuleOverride>, global: Option<&RuleOverride>) -> Self {
        let defaults = Self::default();

        macro_rules! field {
            ($name:ident) => {
                alias
                    .and_then(|o| o.$name)
                    .or_else(|| global.and_then(|o| o.$name))
                    .unwrap_or(defaults.$name)
            };
        }

        Self {
            spam_action: field!(spam_action),
            urgent_priority_threshold: field!(urgent_priority_threshold),
            enable_slack_notify: field!(enable_slack_notify),
            enable_custom_webhook: field!(enable_custom_webhook),
            auto_create_manual_review: field!(auto_create_manual_review),
        }
    }
}

/// Rule key for a recipient alias.
pub fn rules_key(alias: &str) -> String {
    format!("rules:{alias}")
}

fn parse_override(key: &str, raw: Option<String>) -> Option<RuleOverride> {
    let raw = raw?;
    match serde_json::from_str(&raw) {
        Ok(parsed) => Some(parsed),
        Err(e) => {
            warn!(key = %key, error = %e, "Ignoring invalid rule override");
            None
        }
    }
}

/// Resolve the rule set for `alias`. Both lookups run concurrently.
pub async fn resolve_rules(
    config: &dyn ConfigStore,
    alias: &str,
) -> Result<RuleConfig, PipelineError> {
    let alias_key = rules_key(alias);
    let (alias_raw, global_raw) = tokio::join!(
        config.get_config(&alias_key),
        config.get_config(GLOBAL_RULES_KEY)
    );

    let alias_rule = parse_override(&alias_key, alias_raw?);
    let global_rule = parse_override(GLOBAL_RULES_KEY, global_raw?);
    Ok(RuleConfig::merge(alias_rule.as_ref(), global_rule.as_ref()))
}

/// Why a classification needs a human, if it does.
pub fn review_decision(classification: &Classification) -> Option<(ReviewPriority, String)> {
    let low_confidence = classification.confidence_score < LOW_CONFIDENCE_THRESHOLD;
    let high_risk = matches!(classification.category, Category::Legal | Category::Urgent);
    if !low_confidence && !high_risk {
        return None;
    }

    let priority = if classification.category == Category::Legal {
        ReviewPriority::P0
    } else if low_confidence {
        ReviewPriority::P2
    } else {
        ReviewPriority::P1
    };
    let reason = if low_confidence {
        format!("Low confidence score: {}", classification.confidence_score)
    } else {
        format!("High risk category: {}", classification.category)
    };
    Some((priority, reason))
}

/// What the engine did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ActionOutcome {
    pub manual_review_created: bool,
    pub dropped: bool,
}

pub struct ActionRuleEngine {
    db: Arc<dyn Database>,
    config: Arc<dyn ConfigStore>,
    slack: Option<SlackNotifier>,
    webhook: Option<WebhookNotifier>,
}

impl ActionRuleEngine {
    pub fn new(
        db: Arc<dyn Database>,
        config: Arc<dyn ConfigStore>,
        slack: Option<SlackNotifier>,
        webhook: Option<WebhookNotifier>,
    ) -> Self {
        Self {
            db,
            config,
            slack,
            webhook,
        }
    }

    /// Resolve rules for the message's alias and run every action.
    ///
    /// Notification failures are logged and swallowed; store failures propagate.
    pub async fn execute(
        &self,
        message: &QueueMessage,
        classification: &Classification,
    ) -> Result<ActionOutcome, PipelineError> {
        let rules = resolve_rules(self.config.as_ref(), &message.to).await?;
        self.execute_with(message, classification, &rules).await
    }

    pub async fn execute_with(
        &self,
        message: &QueueMessage,
        classification: &Classification,
        rules: &RuleConfig,
    ) -> Result<ActionOutcome, PipelineError> {
        let email_id = message.id.as_str();

        // Spam short-circuits everything else.
        if classification.category == Category::Spam && rules.spam_action == SpamAction::Drop {
            self.db
                .insert_action_log(
                    email_id,
                    ActionType::DropSpam,
                    &json!({ "category": classification.category }),
                    ActionStatus::Success,
                    None,
                )
                .await?;
            info!(email_id = %email_id, "Dropped spam");
            return Ok(ActionOutcome {
                dropped: true,
                ..ActionOutcome::default()
            });
        }

        let should_notify = (classification.priority >= rules.urgent_priority_threshold
            && rules.enable_slack_notify)
            || classification.requires_reply;

        match (&self.slack, should_notify) {
            (Some(slack), true) => {
                let config = json!({
                    "priority": classification.priority,
                    "category": classification.category,
                });
                let text = format_alert(message, classification);
                let result = slack.post(&text).await;
                self.log_delivery(email_id, ActionType::NotifySlack, &config, result.err())
                    .await?;
            }
            (None, true) => {
                debug!(email_id = %email_id, "Slack not configured, skipping notification");
            }
            _ => {}
        }

        if let (true, Some(webhook)) = (rules.enable_custom_webhook, &self.webhook) {
            let payload = WebhookPayload {
                email_id,
                to: &message.to,
                from: &message.from,
                subject: &message.subject,
                classification,
            };
            let result = webhook.notify(&payload).await;
            self.log_delivery(
                email_id,
                ActionType::NotifyWebhook,
                &json!({ "target": "custom" }),
                result.err(),
            )
            .await?;
        }

        let manual_review_created = if rules.auto_create_manual_review {
            self.maybe_escalate(email_id, classification).await?
        } else {
            false
        };

        Ok(ActionOutcome {
            manual_review_created,
            dropped: false,
        })
    }

    async fn maybe_escalate(
        &self,
        email_id: &str,
        classification: &Classification,
    ) -> Result<bool, PipelineError> {
        let Some((priority, reason)) = review_decision(classification) else {
            return Ok(false);
        };

        self.db
            .create_manual_review(email_id, priority, &reason)
            .await?;
        self.db
            .insert_action_log(
                email_id,
                ActionType::ManualReviewCreated,
                &json!({ "reason": reason, "priority": priority }),
                ActionStatus::Success,
                None,
            )
            .await?;
        self.db
            .mark_email_status(email_id, EmailStatus::ManualReview, None)
            .await?;

        info!(
            email_id = %email_id,
            priority = priority.as_str(),
            reason = %reason,
            "Manual review created"
        );
        Ok(true)
    }

    async fn log_delivery(
        &self,
        email_id: &str,
        action: ActionType,
        config: &serde_json::Value,
        error: Option<ChannelError>,
    ) -> Result<(), PipelineError> {
        match error {
            None => {
                self.db
                    .insert_action_log(email_id, action, config, ActionStatus::Success, None)
                    .await?;
            }
            Some(e) => {
                warn!(
                    email_id = %email_id,
                    action = action.as_str(),
                    error = %e,
                    "Notification failed"
                );
                let reason = e.to_string();
                self.db
                    .insert_action_log(email_id, action, config, ActionStatus::Failed, Some(&reason))
                    .await?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::types::test_message;
    use crate::store::LibSqlBackend;
    use crate::store::model::ReviewStatus;
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn test_db() -> Arc<LibSqlBackend> {
        let db = LibSqlBackend::new_memory().await.unwrap();
        db.run_migrations().await.unwrap();
        Arc::new(db)
    }

    async fn claimed(db: &LibSqlBackend, subject: &str) -> QueueMessage {
        let message = test_message(subject, "body");
        db.claim_email(&message).await.unwrap();
        message
    }

    fn classification(category: Category, priority: u8, confidence: f64) -> Classification {
        let mut c = crate::classify::heuristic::classify(&test_message("x", ""));
        c.category = category;
        c.priority = priority;
        c.confidence_score = confidence;
        c.requires_reply = false;
        c
    }

    fn engine(
        db: &Arc<LibSqlBackend>,
        slack: Option<SlackNotifier>,
        webhook: Option<WebhookNotifier>,
    ) -> ActionRuleEngine {
        ActionRuleEngine::new(db.clone(), db.clone(), slack, webhook)
    }

    // ── Rule resolution ─────────────────────────────────────────────

    #[tokio::test]
    async fn defaults_without_overrides() {
        let db = test_db().await;
        let rules = resolve_rules(db.as_ref(), "support@acme.test").await.unwrap();
        assert_eq!(rules, RuleConfig::default());
    }

    #[tokio::test]
    async fn alias_beats_global_field_by_field() {
        let db = test_db().await;
        db.set_config(GLOBAL_RULES_KEY, r#"{"urgentPriorityThreshold": 5, "enableCustomWebhook": true}"#)
            .await
            .unwrap();
        db.set_config("rules:support@acme.test", r#"{"urgentPriorityThreshold": 2}"#)
            .await
            .unwrap();

        let rules = resolve_rules(db.as_ref(), "support@acme.test").await.unwrap();
        assert_eq!(rules.urgent_priority_threshold, 2);
        assert!(rules.enable_custom_webhook);
        assert!(rules.enable_slack_notify);

        let other = resolve_rules(db.as_ref(), "sales@acme.test").await.unwrap();
        assert_eq!(other.urgent_priority_threshold, 5);
    }

    #[tokio::test]
    async fn invalid_override_is_ignored() {
        let db = test_db().await;
        db.set_config("rules:support@acme.test", "{not json").await.unwrap();
        db.set_config(GLOBAL_RULES_KEY, r#"{"spamAction": "archive"}"#)
            .await
            .unwrap();

        let rules = resolve_rules(db.as_ref(), "support@acme.test").await.unwrap();
        assert_eq!(rules.spam_action, SpamAction::Archive);
        assert_eq!(rules.urgent_priority_threshold, 4);
    }

    // ── Escalation ──────────────────────────────────────────────────

    #[test]
    fn low_confidence_invoice_is_p2() {
        let (priority, reason) =
            review_decision(&classification(Category::Invoice, 3, 0.4)).unwrap();
        assert_eq!(priority, ReviewPriority::P2);
        assert!(reason.contains("0.4"));
    }

    #[test]
    fn legal_is_p0_regardless_of_confidence() {
        let (priority, reason) = review_decision(&classification(Category::Legal, 3, 0.9)).unwrap();
        assert_eq!(priority, ReviewPriority::P0);
        assert_eq!(reason, "High risk category: legal");

        let (low, _) = review_decision(&classification(Category::Legal, 3, 0.2)).unwrap();
        assert_eq!(low, ReviewPriority::P0);
    }

    #[test]
    fn urgent_confident_is_p1_and_plain_confident_is_none() {
        let (priority, _) = review_decision(&classification(Category::Urgent, 5, 0.95)).unwrap();
        assert_eq!(priority, ReviewPriority::P1);
        assert!(review_decision(&classification(Category::Support, 4, 0.6)).is_none());
    }

    #[tokio::test]
    async fn escalation_creates_task_and_sets_status() {
        let db = test_db().await;
        let message = claimed(&db, "Contract dispute").await;

        let outcome = engine(&db, None, None)
            .execute(&message, &classification(Category::Legal, 3, 0.9))
            .await
            .unwrap();
        assert!(outcome.manual_review_created);

        let tasks = db.list_manual_reviews_for_email(&message.id).await.unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].priority, ReviewPriority::P0);
        assert_eq!(tasks[0].status, ReviewStatus::Pending);

        let email = db.get_email(&message.id).await.unwrap().unwrap();
        assert_eq!(email.status, EmailStatus::ManualReview);

        let logs = db.list_action_logs(&message.id).await.unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].action_type, ActionType::ManualReviewCreated);
        assert_eq!(logs[0].action_config["priority"], "P0");
    }

    #[tokio::test]
    async fn escalation_disabled_by_rule() {
        let db = test_db().await;
        let message = claimed(&db, "Contract").await;
        let rules = RuleConfig {
            auto_create_manual_review: false,
            ..RuleConfig::default()
        };

        let outcome = engine(&db, None, None)
            .execute_with(&message, &classification(Category::Legal, 3, 0.2), &rules)
            .await
            .unwrap();
        assert!(!outcome.manual_review_created);
        assert!(db.list_action_logs(&message.id).await.unwrap().is_empty());
    }

    // ── Spam ────────────────────────────────────────────────────────

    #[tokio::test]
    async fn spam_drop_short_circuits() {
        let db = test_db().await;
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let message = claimed(&db, "WIN NOW").await;
        let slack = SlackNotifier::new(reqwest::Client::new(), server.uri());
        let mut spam = classification(Category::Spam, 5, 0.3);
        spam.requires_reply = true;

        let outcome = engine(&db, Some(slack), None)
            .execute(&message, &spam)
            .await
            .unwrap();
        assert!(outcome.dropped);
        assert!(!outcome.manual_review_created);

        let logs = db.list_action_logs(&message.id).await.unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].action_type, ActionType::DropSpam);
        assert!(db.list_manual_reviews_for_email(&message.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn spam_archive_continues() {
        let db = test_db().await;
        let message = claimed(&db, "Offer").await;
        let rules = RuleConfig {
            spam_action: SpamAction::Archive,
            ..RuleConfig::default()
        };

        let outcome = engine(&db, None, None)
            .execute_with(&message, &classification(Category::Spam, 2, 0.3), &rules)
            .await
            .unwrap();
        assert!(!outcome.dropped);
        assert!(outcome.manual_review_created);
    }

    // ── Notifications ───────────────────────────────────────────────

    #[tokio::test]
    async fn slack_failure_does_not_block_webhook() {
        let db = test_db().await;
        let slack_server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .expect(1)
            .mount(&slack_server)
            .await;
        let hook_server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&hook_server)
            .await;

        let message = claimed(&db, "Server down").await;
        let client = reqwest::Client::new();
        let rules = RuleConfig {
            enable_custom_webhook: true,
            ..RuleConfig::default()
        };

        let outcome = engine(
            &db,
            Some(SlackNotifier::new(client.clone(), slack_server.uri())),
            Some(WebhookNotifier::new(client, hook_server.uri())),
        )
        .execute_with(&message, &classification(Category::Support, 5, 0.9), &rules)
        .await
        .unwrap();
        assert!(!outcome.manual_review_created);

        let logs = db.list_action_logs(&message.id).await.unwrap();
        assert_eq!(logs.len(), 2);
        assert_eq!(logs[0].action_type, ActionType::NotifySlack);
        assert_eq!(logs[0].status, ActionStatus::Failed);
        assert!(logs[0].error.as_deref().unwrap().contains("500"));
        assert_eq!(logs[1].action_type, ActionType::NotifyWebhook);
        assert_eq!(logs[1].status, ActionStatus::Success);
        assert_eq!(logs[1].action_config["target"], "custom");
    }

    #[tokio::test]
    async fn below_threshold_without_reply_is_quiet() {
        let db = test_db().await;
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let message = claimed(&db, "Weekly digest").await;
        let slack = SlackNotifier::new(reqwest::Client::new(), server.uri());
        engine(&db, Some(slack), None)
            .execute(&message, &classification(Category::Newsletter, 3, 0.8))
            .await
            .unwrap();
        assert!(db.list_action_logs(&message.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn requires_reply_notifies_even_with_slack_disabled() {
        let db = test_db().await;
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let message = claimed(&db, "Question").await;
        let rules = RuleConfig {
            enable_slack_notify: false,
            ..RuleConfig::default()
        };
        let mut c = classification(Category::Support, 2, 0.8);
        c.requires_reply = true;

        engine(&db, Some(SlackNotifier::new(reqwest::Client::new(), server.uri())), None)
            .execute_with(&message, &c, &rules)
            .await
            .unwrap();
        let logs = db.list_action_logs(&message.id).await.unwrap();
        assert_eq!(logs[0].action_type, ActionType::NotifySlack);
        assert_eq!(logs[0].status, ActionStatus::Success);
        assert_eq!(logs[0].action_config["priority"], 2);
    }
}
