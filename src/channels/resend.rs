//! Transactional email through the Resend HTTP API.

use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::json;

use crate::channels::{check_status, send_failed};
use crate::config::ReplyConfig;
use crate::error::ChannelError;

const NAME: &str = "resend";
const SEND_TIMEOUT: Duration = Duration::from_secs(15);

/// A reply addressed back to the original sender.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundReply {
    /// Original sender.
    pub to: String,
    /// Inbox alias the original was sent to.
    pub reply_to: String,
    pub subject: String,
    pub text: String,
}

#[derive(Deserialize)]
struct SendResponse {
    id: Option<String>,
}

#[derive(Clone)]
pub struct ResendSender {
    client: reqwest::Client,
    api_key: SecretString,
    from: String,
    base_url: String,
}

impl ResendSender {
    /// Available only when both an API key and a sender address are configured.
    pub fn from_config(config: &ReplyConfig, client: reqwest::Client) -> Option<Self> {
        Some(Self {
            client,
            api_key: config.resend_api_key.clone()?,
            from: config.from_address.clone()?,
            base_url: config.resend_base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn from_address(&self) -> &str {
        &self.from
    }

    /// Send and return the provider's message id, when it reports one.
    pub async fn send(&self, reply: &OutboundReply) -> Result<Option<String>, ChannelError> {
        let resp = self
            .client
            .post(format!("{}/emails", self.base_url))
            .timeout(SEND_TIMEOUT)
            .bearer_auth(self.api_key.expose_secret())
            .json(&json!({
                "from": self.from,
                "to": [reply.to],
                "subject": reply.subject,
                "text": reply.text,
                "reply_to": reply.reply_to,
            }))
            .send()
            .await
            .map_err(|e| send_failed(NAME, e))?;
        check_status(NAME, &resp)?;

        let body: SendResponse = resp
            .json()
            .await
            .unwrap_or(SendResponse { id: None });
        Ok(body.id)
    }
}
