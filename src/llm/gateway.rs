//! OpenAI-compatible chat completions through an AI gateway, with a direct
//! provider as the fallback when the gateway itself is unavailable.

use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use reqwest::StatusCode;
use secrecy::{ExposeSecret, SecretString};
use serde_json::{Value, json};

use crate::config::AiConfig;
use crate::error::LlmError;
use crate::llm::provider::{CompletionRequest, CompletionResponse, LlmProvider, chat_content};
use crate::pipeline::types::truncate_chars;
use crate::safety::redact_json;

pub const GATEWAY_PROVIDER_NAME: &str = "ai-gateway-openai-compat";

/// Longest response body kept in an error message.
const MAX_ERROR_BODY_CHARS: usize = 500;

static GATEWAY_MISCONFIGURED: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)configure AI Gateway|gateway").expect("gateway regex is valid")
});

/// Gateway tier of the classification chain.
pub struct GatewayProvider {
    client: reqwest::Client,
    model: String,
    gateway_url: Option<String>,
    direct_url: Option<String>,
    api_key: Option<SecretString>,
    gateway_token: Option<SecretString>,
    timeout: Duration,
}

impl GatewayProvider {
    /// Build the tier when credentials and at least one endpoint are configured.
    pub fn from_config(config: &AiConfig, client: reqwest::Client) -> Option<Self> {
        if config.openai_api_key.is_none() && config.gateway_token.is_none() {
            return None;
        }

        let gateway_url = match (&config.account_id, &config.gateway_id) {
            (Some(account), Some(gateway)) => Some(format!(
                "{}/{account}/{gateway}/compat/chat/completions",
                config.gateway_base_url.trim_end_matches('/')
            )),
            _ => None,
        };
        let direct_url = config
            .openai_base_url
            .as_deref()
            .map(|base| format!("{}/chat/completions", base.trim_end_matches('/')));

        if gateway_url.is_none() && direct_url.is_none() {
            tracing::warn!("AI credentials set but neither a gateway nor OPENAI_BASE_URL is configured");
            return None;
        }

        Some(Self {
            client,
            model: config.model.clone(),
            gateway_url,
            direct_url,
            api_key: config.openai_api_key.clone(),
            gateway_token: config.gateway_token.clone(),
            timeout: config.request_timeout,
        })
    }

    fn request_body(&self, request: &CompletionRequest) -> Value {
        json!({
            "model": self.model,
            "temperature": request.temperature,
            "max_tokens": request.max_tokens,
            "messages": request.messages,
        })
    }

    async fn post(
        &self,
        url: &str,
        body: &Value,
        via_gateway: bool,
    ) -> Result<(StatusCode, String), LlmError> {
        let mut builder = self.client.post(url).timeout(self.timeout).json(body);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key.expose_secret());
        }
        if via_gateway {
            if let Some(token) = &self.gateway_token {
                builder = builder.header(
                    "cf-aig-authorization",
                    format!("Bearer {}", token.expose_secret()),
                );
            }
        }

        let resp = builder.send().await.map_err(|e| self.transport_error(e))?;
        let status = resp.status();
        let text = resp.text().await.map_err(|e| self.transport_error(e))?;
        Ok((status, text))
    }

    fn transport_error(&self, e: reqwest::Error) -> LlmError {
        if e.is_timeout() {
            LlmError::Timeout {
                provider: GATEWAY_PROVIDER_NAME.to_string(),
                after: self.timeout,
            }
        } else {
            LlmError::RequestFailed {
                provider: GATEWAY_PROVIDER_NAME.to_string(),
                reason: e.to_string(),
            }
        }
    }

    fn http_error(&self, status: StatusCode, body: &str) -> LlmError {
        LlmError::Http {
            provider: GATEWAY_PROVIDER_NAME.to_string(),
            status: status.as_u16(),
            body: truncate_chars(body, MAX_ERROR_BODY_CHARS),
        }
    }
}

/// Whether a gateway failure should be retried against the direct provider.
pub fn gateway_unavailable(status: u16, body: &str) -> bool {
    status >= 500 || (status == 400 && GATEWAY_MISCONFIGURED.is_match(body))
}

fn parse_chat_response(body: Value, text: String, request_redacted: String) -> CompletionResponse {
    CompletionResponse {
        content: chat_content(&body),
        request_redacted,
        response_text: text,
        response_json: serde_json::to_string(&body).ok(),
    }
}

#[async_trait]
impl LlmProvider for GatewayProvider {
    fn name(&self) -> &str {
        GATEWAY_PROVIDER_NAME
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    async fn complete(
        &self,
        request: &CompletionRequest,
    ) -> Result<CompletionResponse, LlmError> {
        let body = self.request_body(request);
        let request_redacted = redact_json(&body).to_string();

        let (status, text) = match (&self.gateway_url, &self.direct_url) {
            (Some(gateway), direct) => {
                let (status, text) = self.post(gateway, &body, true).await?;
                match direct {
                    Some(direct) if !status.is_success() && gateway_unavailable(status.as_u16(), &text) => {
                        tracing::warn!(
                            status = status.as_u16(),
                            "AI gateway unavailable, retrying against direct provider"
                        );
                        self.post(direct, &body, false).await?
                    }
                    _ => (status, text),
                }
            }
            (None, Some(direct)) => self.post(direct, &body, false).await?,
            (None, None) => {
                return Err(LlmError::NotConfigured {
                    provider: GATEWAY_PROVIDER_NAME.to_string(),
                    reason: "no gateway or direct endpoint".to_string(),
                });
            }
        };

        if !status.is_success() {
            return Err(self.http_error(status, &text));
        }

        let parsed: Value = serde_json::from_str(&text).map_err(|_| LlmError::InvalidResponse {
            provider: GATEWAY_PROVIDER_NAME.to_string(),
            reason: "non-JSON response body".to_string(),
        })?;
        Ok(parse_chat_response(parsed, text, request_redacted))
    }
}
