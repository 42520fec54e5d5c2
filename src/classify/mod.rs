//! Classification service — three-tier fallback for classification and
//! reply drafting.
//!
//! Network tiers are tried in order through the chain driver; when none
//! succeeds the local heuristic answers, so both operations are total.

pub mod chain;
pub mod heuristic;
pub mod prompts;
pub mod schema;

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde_json::json;

use crate::classify::chain::{AttemptOutcome, TierAttempt, TierWin, run_chain};
use crate::classify::schema::{Classification, ReplyDraft, parse_classification, parse_reply_draft};
use crate::llm::LlmProvider;
use crate::pipeline::types::QueueMessage;
use crate::safety::redact_pii;
use crate::store::model::RawProviderTrace;

/// Per-attempt bound on LLM calls.
pub const LLM_TIMEOUT: Duration = Duration::from_secs(30);

/// A classification or draft with attribution and audit data.
#[derive(Debug, Clone)]
pub struct AiResult<T> {
    pub value: T,
    pub provider: String,
    pub model: String,
    pub trace: RawProviderTrace,
    pub attempts: Vec<TierAttempt>,
    /// Wall time across every tier tried.
    pub latency_ms: u64,
}

pub struct ClassificationService {
    providers: Vec<Arc<dyn LlmProvider>>,
    timeout: Duration,
}

impl ClassificationService {
    pub fn new(providers: Vec<Arc<dyn LlmProvider>>) -> Self {
        Self {
            providers,
            timeout: LLM_TIMEOUT,
        }
    }

    /// Service that only ever uses the heuristic tier.
    pub fn heuristic_only() -> Self {
        Self::new(Vec::new())
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Classify a message. `instructions` overrides the prompt header.
    pub async fn classify(
        &self,
        message: &QueueMessage,
        instructions: Option<&str>,
    ) -> AiResult<Classification> {
        let started = Instant::now();
        let request = prompts::classification_request(message, instructions);
        let (win, attempts) =
            run_chain(&self.providers, &request, self.timeout, parse_classification).await;

        match win {
            Some(win) => from_win(win, attempts, started),
            None => {
                let value = heuristic::classify(message);
                let reason = self.fallback_reason(&attempts);
                from_heuristic(
                    value,
                    heuristic::HEURISTIC_MODEL,
                    message,
                    &reason,
                    attempts,
                    started,
                )
            }
        }
    }

    /// Draft a reply for a classified message.
    pub async fn draft_reply(
        &self,
        message: &QueueMessage,
        classification: &Classification,
        instructions: Option<&str>,
    ) -> AiResult<ReplyDraft> {
        let started = Instant::now();
        let request = prompts::reply_request(message, classification, instructions);
        let (win, attempts) =
            run_chain(&self.providers, &request, self.timeout, parse_reply_draft).await;

        match win {
            Some(win) => from_win(win, attempts, started),
            None => {
                let value = heuristic::reply_draft(message, classification);
                let reason = format!(
                    "{}, generated heuristic reply",
                    self.fallback_reason(&attempts)
                );
                from_heuristic(
                    value,
                    heuristic::HEURISTIC_REPLY_MODEL,
                    message,
                    &reason,
                    attempts,
                    started,
                )
            }
        }
    }

    fn fallback_reason(&self, attempts: &[TierAttempt]) -> String {
        if self.providers.is_empty() {
            "no AI provider configured".to_string()
        } else {
            format!("all {} AI providers failed", attempts.len())
        }
    }
}

fn from_win<T>(win: TierWin<T>, attempts: Vec<TierAttempt>, started: Instant) -> AiResult<T> {
    let trace = RawProviderTrace {
        provider: win.provider.clone(),
        model: win.model.clone(),
        request_redacted: win.response.request_redacted,
        response_text: Some(win.response.response_text),
        response_json: win.response.response_json,
        created_at: Utc::now(),
    };
    AiResult {
        value: win.value,
        provider: win.provider,
        model: win.model,
        trace,
        attempts,
        latency_ms: started.elapsed().as_millis() as u64,
    }
}

fn from_heuristic<T: serde::Serialize>(
    value: T,
    model: &str,
    message: &QueueMessage,
    reason: &str,
    mut attempts: Vec<TierAttempt>,
    started: Instant,
) -> AiResult<T> {
    let request = json!({
        "reason": reason,
        "subject": redact_pii(&message.subject),
        "from": redact_pii(&message.from),
    });
    let response = serde_json::to_string(&value).ok();

    attempts.push(TierAttempt {
        provider: heuristic::HEURISTIC_PROVIDER.to_string(),
        model: model.to_string(),
        outcome: AttemptOutcome::Success,
        reason: None,
        latency_ms: 0,
    });

    AiResult {
        trace: RawProviderTrace {
            provider: heuristic::HEURISTIC_PROVIDER.to_string(),
            model: model.to_string(),
            request_redacted: request.to_string(),
            response_text: response.clone(),
            response_json: response,
            created_at: Utc::now(),
        },
        value,
        provider: heuristic::HEURISTIC_PROVIDER.to_string(),
        model: model.to_string(),
        attempts,
        latency_ms: started.elapsed().as_millis() as u64,
    }
}
