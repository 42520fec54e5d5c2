//! Shared types for the message processing pipeline.

use chrono::{DateTime, Datelike, Utc};
use mail_parser::{HeaderValue, MessageParser, MimeHeaders};
use serde::{Deserialize, Serialize};

// ── Queue payload ───────────────────────────────────────────────────

/// The bounded-size payload carried by the queue from ingestion to the
/// orchestrator. Attachment content never travels here, only metadata and
/// storage keys.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueMessage {
    /// Internal id (UUID), also the EmailRecord primary key.
    pub id: String,
    /// Dedup key: the transport Message-ID, or the internal id when absent.
    pub external_id: String,
    pub received_at: DateTime<Utc>,
    pub to: String,
    pub from: String,
    #[serde(default)]
    pub from_name: String,
    #[serde(default)]
    pub subject: String,
    #[serde(default)]
    pub text_body: String,
    #[serde(default)]
    pub has_html: bool,
    #[serde(default)]
    pub attachments: Vec<AttachmentMeta>,
    /// Object key of the raw RFC 5322 message.
    pub raw_key: String,
    /// Object key of the parsed-metadata JSON blob.
    #[serde(default)]
    pub parsed_key: Option<String>,
    #[serde(default)]
    pub body_truncated: bool,
    /// In-Reply-To of the original message, when it continues a thread.
    #[serde(default)]
    pub thread_id: Option<String>,
    pub priority: MessagePriority,
    /// Set when the retry routine re-drives a parked message.
    #[serde(default)]
    pub redrive: bool,
}

/// Attachment metadata plus the key of its stored blob.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachmentMeta {
    pub filename: String,
    pub mime_type: String,
    pub size: u64,
    #[serde(default)]
    pub storage_key: Option<String>,
}

/// Ingestion-time priority hint, inferred from keywords.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessagePriority {
    High,
    Normal,
    Low,
}

impl MessagePriority {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessagePriority::High => "high",
            MessagePriority::Normal => "normal",
            MessagePriority::Low => "low",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "high" => MessagePriority::High,
            "low" => MessagePriority::Low,
            _ => MessagePriority::Normal,
        }
    }
}

const HIGH_PRIORITY_WORDS: &[&str] = &["urgent", "immediately", "security", "legal", "outage", "down"];
const NORMAL_PRIORITY_WORDS: &[&str] = &["invoice", "payment", "billing", "contract"];

/// Infer a priority hint from the subject and body text.
pub fn infer_priority(subject: &str, body: &str) -> MessagePriority {
    let text = format!("{subject} {body}").to_lowercase();
    if HIGH_PRIORITY_WORDS.iter().any(|w| text.contains(w)) {
        MessagePriority::High
    } else if NORMAL_PRIORITY_WORDS.iter().any(|w| text.contains(w)) {
        MessagePriority::Normal
    } else {
        MessagePriority::Low
    }
}

// ── Inbound email ───────────────────────────────────────────────────

/// An inbound message as delivered by the mail-parsing collaborator.
#[derive(Debug, Clone)]
pub struct InboundEmail {
    /// Envelope sender.
    pub from: String,
    /// Envelope recipient (the alias the mail was delivered to).
    pub to: String,
    pub from_name: String,
    pub subject: String,
    pub text_body: String,
    pub has_html: bool,
    /// Message-ID header, used as dedup key.
    pub message_id: Option<String>,
    /// In-Reply-To header.
    pub in_reply_to: Option<String>,
    pub raw: Vec<u8>,
    pub attachments: Vec<InboundAttachment>,
}

/// Attachment with its content, as produced by the parser.
#[derive(Debug, Clone)]
pub struct InboundAttachment {
    pub filename: String,
    pub mime_type: String,
    pub content: Vec<u8>,
}

impl InboundEmail {
    /// Parse a raw RFC 5322 message. Envelope addresses take precedence over
    /// header addresses, as they do for the mail transport.
    pub fn from_raw(raw: Vec<u8>, envelope_from: &str, envelope_to: &str) -> Option<Self> {
        let parsed = MessageParser::default().parse(&raw)?;

        let from_name = parsed
            .from()
            .and_then(|addr| addr.first())
            .and_then(|a| a.name())
            .unwrap_or_default()
            .to_string();

        let header_from = parsed
            .from()
            .and_then(|addr| addr.first())
            .and_then(|a| a.address())
            .map(str::to_string);

        let from = if envelope_from.is_empty() {
            header_from?
        } else {
            envelope_from.to_string()
        };

        let to = if envelope_to.is_empty() {
            parsed
                .to()
                .and_then(|addr| addr.first())
                .and_then(|a| a.address())
                .map(str::to_string)?
        } else {
            envelope_to.to_string()
        };

        let subject = parsed.subject().unwrap_or_default().to_string();
        let text_body = parsed
            .body_text(0)
            .map(|t| t.to_string())
            .unwrap_or_default();
        let has_html = parsed.body_html(0).is_some();
        let message_id = parsed.message_id().map(str::to_string);
        let in_reply_to = match parsed.in_reply_to() {
            HeaderValue::Text(id) => Some(id.to_string()),
            HeaderValue::TextList(ids) => ids.first().map(|id| id.to_string()),
            _ => None,
        };

        let attachments = parsed
            .attachments()
            .map(|part| {
                let mime_type = MimeHeaders::content_type(part)
                    .map(|ct| match ct.subtype() {
                        Some(sub) => format!("{}/{}", ct.ctype(), sub),
                        None => ct.ctype().to_string(),
                    })
                    .unwrap_or_else(|| "application/octet-stream".to_string());
                InboundAttachment {
                    filename: MimeHeaders::attachment_name(part)
                        .unwrap_or("attachment")
                        .to_string(),
                    mime_type,
                    content: part.contents().to_vec(),
                }
            })
            .collect();

        Some(Self {
            from,
            to,
            from_name,
            subject,
            text_body,
            has_html,
            message_id,
            in_reply_to,
            raw,
            attachments,
        })
    }
}

// ── Helpers ─────────────────────────────────────────────────────────

/// Object key partitioned by date: `{prefix}/{yyyy}/{mm}/{dd}/{id}.{ext}`.
pub fn dated_key(prefix: &str, id: &str, ext: &str, at: DateTime<Utc>) -> String {
    format!(
        "{prefix}/{:04}/{:02}/{:02}/{id}.{ext}",
        at.year(),
        at.month(),
        at.day()
    )
}

/// Lowercased domain of an address, or `None` when there is no `@`.
pub fn extract_domain(address: &str) -> Option<String> {
    let (_, domain) = address.rsplit_once('@')?;
    if domain.is_empty() {
        None
    } else {
        Some(domain.to_lowercase())
    }
}

/// Truncate to at most `max` characters.
pub fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((idx, _)) => text[..idx].to_string(),
        None => text.to_string(),
    }
}

/// Payload builder shared by unit tests across the crate.
#[cfg(test)]
pub(crate) fn test_message(subject: &str, body: &str) -> QueueMessage {
    let id = uuid::Uuid::new_v4().to_string();
    QueueMessage {
        external_id: format!("<{id}@example.com>"),
        raw_key: format!("emails/2024/01/01/{id}.eml"),
        parsed_key: Some(format!("emails/2024/01/01/{id}_parsed.json")),
        id,
        received_at: Utc::now(),
        to: "support@acme.test".into(),
        from: "customer@example.com".into(),
        from_name: "Customer".into(),
        subject: subject.into(),
        text_body: body.into(),
        has_html: false,
        attachments: Vec::new(),
        body_truncated: false,
        thread_id: None,
        priority: infer_priority(subject, body),
        redrive: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const RAW_EMAIL: &str = "From: Alice Example <alice@example.com>\r\n\
To: support@acme.test\r\n\
Subject: Printer is down\r\n\
Message-ID: <abc123@example.com>\r\n\
In-Reply-To: <prev@acme.test>\r\n\
Content-Type: text/plain; charset=utf-8\r\n\
\r\n\
The printer shows error 42.\r\n";

    #[test]
    fn infer_priority_keywords() {
        assert_eq!(infer_priority("Site outage", ""), MessagePriority::High);
        assert_eq!(infer_priority("", "please pay the invoice"), MessagePriority::Normal);
        assert_eq!(infer_priority("Lunch?", "see you"), MessagePriority::Low);
    }

    #[test]
    fn dated_key_layout() {
        let at = Utc.with_ymd_and_hms(2024, 3, 7, 12, 0, 0).unwrap();
        assert_eq!(dated_key("emails", "abc", "eml", at), "emails/2024/03/07/abc.eml");
    }

    #[test]
    fn extract_domain_uses_last_at() {
        assert_eq!(extract_domain("a@b@Example.COM").as_deref(), Some("example.com"));
        assert_eq!(extract_domain("no-at-sign"), None);
        assert_eq!(extract_domain("trailing@"), None);
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate_chars("héllo", 2), "hé");
        assert_eq!(truncate_chars("abc", 10), "abc");
    }

    #[test]
    fn queue_message_defaults_optional_fields() {
        let payload: QueueMessage = serde_json::from_value(serde_json::json!({
            "id": "m1",
            "externalId": "<x@y>",
            "receivedAt": "2024-01-01T00:00:00Z",
            "to": "support@acme.test",
            "from": "bob@example.com",
            "rawKey": "emails/2024/01/01/m1.eml",
            "priority": "low"
        }))
        .unwrap();
        assert_eq!(payload.subject, "");
        assert!(payload.attachments.is_empty());
        assert!(!payload.has_html);
        assert!(!payload.redrive);
    }

    #[test]
    fn queue_message_rejects_unknown_priority() {
        let result: Result<QueueMessage, _> = serde_json::from_value(serde_json::json!({
            "id": "m1",
            "externalId": "x",
            "receivedAt": "2024-01-01T00:00:00Z",
            "to": "a@b.c",
            "from": "d@e.f",
            "rawKey": "k",
            "priority": "critical"
        }));
        assert!(result.is_err());
    }

    #[test]
    fn from_raw_extracts_headers() {
        let email = InboundEmail::from_raw(RAW_EMAIL.as_bytes().to_vec(), "", "").unwrap();
        assert_eq!(email.from, "alice@example.com");
        assert_eq!(email.from_name, "Alice Example");
        assert_eq!(email.to, "support@acme.test");
        assert_eq!(email.subject, "Printer is down");
        assert_eq!(email.message_id.as_deref(), Some("abc123@example.com"));
        assert_eq!(email.in_reply_to.as_deref(), Some("prev@acme.test"));
        assert!(email.text_body.contains("error 42"));
        assert!(!email.has_html);
    }

    #[test]
    fn from_raw_prefers_envelope_addresses() {
        let email = InboundEmail::from_raw(
            RAW_EMAIL.as_bytes().to_vec(),
            "bounce@relay.test",
            "billing@acme.test",
        )
        .unwrap();
        assert_eq!(email.from, "bounce@relay.test");
        assert_eq!(email.to, "billing@acme.test");
    }
}
