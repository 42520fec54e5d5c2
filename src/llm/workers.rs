//! On-platform inference (Workers AI REST API), used as the secondary tier.
//! Takes one flattened prompt instead of a chat transcript.

use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde_json::{Value, json};

use crate::config::AiConfig;
use crate::error::LlmError;
use crate::llm::provider::{CompletionRequest, CompletionResponse, LlmProvider};
use crate::pipeline::types::truncate_chars;
use crate::safety::redact_json;

pub const WORKERS_PROVIDER_NAME: &str = "workers-ai";

const JSON_ONLY_PREFIX: &str = "Return strict JSON only.\n";

pub struct WorkersAiProvider {
    client: reqwest::Client,
    url: String,
    token: SecretString,
    model: String,
    timeout: Duration,
}

impl WorkersAiProvider {
    /// Build the tier when an account id and API token are configured.
    pub fn from_config(config: &AiConfig, client: reqwest::Client) -> Option<Self> {
        let account = config.account_id.as_deref()?;
        let token = config.workers_api_token.clone()?;
        Some(Self {
            client,
            url: format!(
                "{}/accounts/{account}/ai/run/{}",
                config.workers_base_url.trim_end_matches('/'),
                config.fallback_model
            ),
            token,
            model: config.fallback_model.clone(),
            timeout: config.request_timeout,
        })
    }

    fn error(&self, e: reqwest::Error) -> LlmError {
        if e.is_timeout() {
            LlmError::Timeout {
                provider: WORKERS_PROVIDER_NAME.to_string(),
                after: self.timeout,
            }
        } else {
            LlmError::RequestFailed {
                provider: WORKERS_PROVIDER_NAME.to_string(),
                reason: e.to_string(),
            }
        }
    }
}

#[async_trait]
impl LlmProvider for WorkersAiProvider {
    fn name(&self) -> &str {
        WORKERS_PROVIDER_NAME
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    async fn complete(
        &self,
        request: &CompletionRequest,
    ) -> Result<CompletionResponse, LlmError> {
        let body = json!({
            "prompt": format!("{JSON_ONLY_PREFIX}{}", request.user_prompt()),
            "max_tokens": request.compact_max_tokens,
        });
        let mut audit = body.clone();
        audit["model"] = Value::String(self.model.clone());

        let resp = self
            .client
            .post(&self.url)
            .timeout(self.timeout)
            .bearer_auth(self.token.expose_secret())
            .json(&body)
            .send()
            .await
            .map_err(|e| self.error(e))?;
        let status = resp.status();
        let text = resp.text().await.map_err(|e| self.error(e))?;

        if !status.is_success() {
            return Err(LlmError::Http {
                provider: WORKERS_PROVIDER_NAME.to_string(),
                status: status.as_u16(),
                body: truncate_chars(&text, 500),
            });
        }

        let parsed: Value = serde_json::from_str(&text).map_err(|_| LlmError::InvalidResponse {
            provider: WORKERS_PROVIDER_NAME.to_string(),
            reason: "non-JSON response body".to_string(),
        })?;
        let content = match parsed.pointer("/result/response") {
            Some(Value::String(s)) => s.clone(),
            Some(other @ Value::Object(_)) => other.to_string(),
            _ => "{}".to_string(),
        };

        Ok(CompletionResponse {
            content,
            request_redacted: redact_json(&audit).to_string(),
            response_text: text,
            response_json: serde_json::to_string(&parsed).ok(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::provider::ChatMessage;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn provider_for(server: &MockServer) -> WorkersAiProvider {
        let mut config = AiConfig::offline();
        config.account_id = Some("acct".into());
        config.workers_api_token = Some(SecretString::from("cf-token"));
        config.workers_base_url = server.uri();
        config.fallback_model = "@cf/meta/test-model".into();
        WorkersAiProvider::from_config(&config, reqwest::Client::new()).unwrap()
    }

    #[test]
    fn requires_account_and_token() {
        let mut config = AiConfig::offline();
        config.account_id = Some("acct".into());
        assert!(WorkersAiProvider::from_config(&config, reqwest::Client::new()).is_none());
    }

    #[tokio::test]
    async fn sends_flattened_prompt_and_reads_result() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/accounts/acct/ai/run/@cf/meta/test-model"))
            .and(header("authorization", "Bearer cf-token"))
            .and(body_partial_json(json!({
                "prompt": "Return strict JSON only.\nClassify this",
                "max_tokens": 800
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "result": {"response": "```json\n{\"category\":\"spam\"}\n```"},
                "success": true
            })))
            .expect(1)
            .mount(&server)
            .await;

        let request = CompletionRequest::new(vec![
            ChatMessage::system("ignored by this tier"),
            ChatMessage::user("Classify this"),
        ]);
        let resp = provider_for(&server).complete(&request).await.unwrap();
        assert!(resp.content.contains("\"spam\""));
        assert!(resp.request_redacted.contains("@cf/meta/test-model"));
    }

    #[tokio::test]
    async fn server_error_is_transient() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let request = CompletionRequest::new(vec![ChatMessage::user("x")]);
        let err = provider_for(&server).complete(&request).await.unwrap_err();
        assert!(err.is_transient());
    }
}
