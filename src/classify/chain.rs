//! Tier driver for provider fallback chains.
//!
//! Each tier call is converted into a tagged outcome; the driver walks the
//! tiers in order until one succeeds and records every attempt.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, warn};

use crate::classify::schema::SchemaError;
use crate::llm::{CompletionRequest, CompletionResponse, LlmProvider};

/// Result of one tier call.
#[derive(Debug)]
pub enum TierOutcome<T> {
    Success(T),
    /// The provider may recover later (timeout, network, 429, 5xx).
    Retryable(String),
    /// The provider answered but cannot help (auth, bad output, schema).
    Fatal(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Success,
    Retryable,
    Fatal,
}

/// Audit entry for one tier attempt.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TierAttempt {
    pub provider: String,
    pub model: String,
    pub outcome: AttemptOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub latency_ms: u64,
}

/// The tier that won, with its parsed value and raw response.
#[derive(Debug)]
pub struct TierWin<T> {
    pub value: T,
    pub provider: String,
    pub model: String,
    pub response: CompletionResponse,
}

/// Call one provider under `timeout` and validate its output with `parse`.
pub async fn call_tier<T>(
    provider: &dyn LlmProvider,
    request: &CompletionRequest,
    timeout: Duration,
    parse: fn(&str) -> Result<T, SchemaError>,
) -> TierOutcome<(T, CompletionResponse)> {
    match tokio::time::timeout(timeout, provider.complete(request)).await {
        Err(_) => TierOutcome::Retryable(format!("timed out after {timeout:?}")),
        Ok(Err(e)) if e.is_transient() => TierOutcome::Retryable(e.to_string()),
        Ok(Err(e)) => TierOutcome::Fatal(e.to_string()),
        Ok(Ok(response)) => match parse(&response.content) {
            Ok(value) => TierOutcome::Success((value, response)),
            Err(e) => TierOutcome::Fatal(format!("schema validation failed: {e}")),
        },
    }
}

/// Try each provider in order; first success wins.
pub async fn run_chain<T>(
    providers: &[Arc<dyn LlmProvider>],
    request: &CompletionRequest,
    timeout: Duration,
    parse: fn(&str) -> Result<T, SchemaError>,
) -> (Option<TierWin<T>>, Vec<TierAttempt>) {
    let mut attempts = Vec::with_capacity(providers.len());

    for provider in providers {
        let started = Instant::now();
        let outcome = call_tier(provider.as_ref(), request, timeout, parse).await;
        let latency_ms = started.elapsed().as_millis() as u64;

        let (kind, reason) = match outcome {
            TierOutcome::Success((value, response)) => {
                debug!(provider = provider.name(), latency_ms, "Tier succeeded");
                attempts.push(TierAttempt {
                    provider: provider.name().to_string(),
                    model: provider.model_name().to_string(),
                    outcome: AttemptOutcome::Success,
                    reason: None,
                    latency_ms,
                });
                return (
                    Some(TierWin {
                        value,
                        provider: provider.name().to_string(),
                        model: provider.model_name().to_string(),
                        response,
                    }),
                    attempts,
                );
            }
            TierOutcome::Retryable(reason) => (AttemptOutcome::Retryable, reason),
            TierOutcome::Fatal(reason) => (AttemptOutcome::Fatal, reason),
        };

        warn!(
            provider = provider.name(),
            outcome = ?kind,
            reason = %reason,
            "Tier failed, falling back"
        );
        attempts.push(TierAttempt {
            provider: provider.name().to_string(),
            model: provider.model_name().to_string(),
            outcome: kind,
            reason: Some(reason),
            latency_ms,
        });
    }

    (None, attempts)
}
