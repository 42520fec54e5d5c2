//! Slack-compatible incoming webhook.

use std::time::Duration;

use serde_json::json;

use crate::channels::{check_status, send_failed};
use crate::classify::schema::Classification;
use crate::error::ChannelError;
use crate::pipeline::types::QueueMessage;

const NAME: &str = "slack";
const SEND_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone)]
pub struct SlackNotifier {
    client: reqwest::Client,
    url: String,
}

impl SlackNotifier {
    pub fn new(client: reqwest::Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
        }
    }

    /// Post a plain-text message.
    pub async fn post(&self, text: &str) -> Result<(), ChannelError> {
        let resp = self
            .client
            .post(&self.url)
            .timeout(SEND_TIMEOUT)
            .json(&json!({ "text": text }))
            .send()
            .await
            .map_err(|e| send_failed(NAME, e))?;
        check_status(NAME, &resp)
    }
}

/// Alert text for a message that needs attention.
pub fn format_alert(message: &QueueMessage, classification: &Classification) -> String {
    let mut lines = vec![
        format!(
            "*[{}] P{}* {}",
            classification.category, classification.priority, message.subject
        ),
        format!("From: {} → {}", message.from, message.to),
        format!("Summary: {}", classification.summary),
        format!("Confidence: {:.2}", classification.confidence_score),
    ];
    if classification.requires_reply {
        lines.push("Reply required".to_string());
    }
    lines.push(format!("Email ID: {}", message.id));
    lines.join("\n")
}
