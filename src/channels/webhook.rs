//! Generic JSON webhook carrying the full classification.

use std::time::Duration;

use serde::Serialize;

use crate::channels::{check_status, send_failed};
use crate::classify::schema::Classification;
use crate::error::ChannelError;

const NAME: &str = "webhook";
const SEND_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookPayload<'a> {
    pub email_id: &'a str,
    pub to: &'a str,
    pub from: &'a str,
    pub subject: &'a str,
    pub classification: &'a Classification,
}

#[derive(Clone)]
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(client: reqwest::Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
        }
    }

    pub async fn notify(&self, payload: &WebhookPayload<'_>) -> Result<(), ChannelError> {
        let resp = self
            .client
            .post(&self.url)
            .timeout(SEND_TIMEOUT)
            .json(payload)
            .send()
            .await
            .map_err(|e| send_failed(NAME, e))?;
        check_status(NAME, &resp)
    }
}
