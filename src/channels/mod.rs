//! Outbound channels: notification sinks and transactional email.

pub mod resend;
pub mod slack;
pub mod webhook;

pub use resend::{OutboundReply, ResendSender};
pub use slack::SlackNotifier;
pub use webhook::{WebhookNotifier, WebhookPayload};

use crate::error::ChannelError;

/// Map a non-2xx response to `ChannelError::Rejected`.
pub(crate) fn check_status(name: &str, resp: &reqwest::Response) -> Result<(), ChannelError> {
    if resp.status().is_success() {
        Ok(())
    } else {
        Err(ChannelError::Rejected {
            name: name.to_string(),
            status: resp.status().as_u16(),
        })
    }
}

pub(crate) fn send_failed(name: &str, e: reqwest::Error) -> ChannelError {
    ChannelError::SendFailed {
        name: name.to_string(),
        reason: e.to_string(),
    }
}
