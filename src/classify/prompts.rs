//! Prompt construction for classification and reply drafting.

use crate::classify::schema::Classification;
use crate::llm::{ChatMessage, CompletionRequest};
use crate::pipeline::types::QueueMessage;

/// Prompt-template names looked up in the store for instruction overrides.
pub const CLASSIFY_PROMPT_NAME: &str = "email_classification";
pub const REPLY_PROMPT_NAME: &str = "email_reply";

const CLASSIFY_SYSTEM_PROMPT: &str =
    "You are a strict email classification assistant. Output pure JSON only and do not wrap with markdown.";
const REPLY_SYSTEM_PROMPT: &str =
    "You are an email reply assistant. Return strict JSON only. Do not include markdown.";

const CLASSIFY_INSTRUCTIONS: &str = "Classify this email and return one JSON object with fields:
category, subcategory, sentiment, priority, language, summary, tags, requiresReply, estimatedReplyDeadline, extractedEntities, suggestedActions, confidenceScore.
Use category enum: invoice, support, personal, promo, newsletter, spam, urgent, legal, other.
summary must be concise and <= 120 characters.";

const REPLY_INSTRUCTIONS: &str = "Draft a professional email reply and return one JSON object with fields:
subject, body, tone, language, placeholders, autoSendSafe.
Rules:
- body should be concise and specific to the message.
- if information is missing, set placeholders and autoSendSafe=false.
- avoid legal promises and monetary commitments unless explicit in source.";

/// Classification request. `instructions` replaces the built-in header.
pub fn classification_request(message: &QueueMessage, instructions: Option<&str>) -> CompletionRequest {
    let prompt = [
        instructions.unwrap_or(CLASSIFY_INSTRUCTIONS).to_string(),
        format!("From: {}", message.from),
        format!("To: {}", message.to),
        format!("Subject: {}", message.subject),
        format!("Body: {}", message.text_body),
    ]
    .join("\n");

    CompletionRequest::new(vec![
        ChatMessage::system(CLASSIFY_SYSTEM_PROMPT),
        ChatMessage::user(prompt),
    ])
    .with_temperature(0.1)
    .with_max_tokens(1024)
    .with_compact_max_tokens(800)
}

/// Reply-draft request for an already classified message.
pub fn reply_request(
    message: &QueueMessage,
    classification: &Classification,
    instructions: Option<&str>,
) -> CompletionRequest {
    let prompt = [
        instructions.unwrap_or(REPLY_INSTRUCTIONS).to_string(),
        format!("From (sender of original email): {}", message.from),
        format!("To (our inbox alias): {}", message.to),
        format!("Original subject: {}", message.subject),
        format!("Original body: {}", message.text_body),
        format!("Classification summary: {}", classification.summary),
        format!("Category: {}", classification.category),
        format!("Priority: {}", classification.priority),
        format!("Requires reply: {}", classification.requires_reply),
    ]
    .join("\n");

    CompletionRequest::new(vec![
        ChatMessage::system(REPLY_SYSTEM_PROMPT),
        ChatMessage::user(prompt),
    ])
    .with_temperature(0.2)
    .with_max_tokens(1200)
    .with_compact_max_tokens(900)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::Role;

    fn message() -> QueueMessage {
        serde_json::from_value(serde_json::json!({
            "id": "e1",
            "externalId": "<m@x>",
            "receivedAt": "2024-05-01T10:00:00Z",
            "to": "support@acme.test",
            "from": "bob@example.com",
            "subject": "Broken login",
            "textBody": "I cannot log in",
            "rawKey": "emails/2024/05/01/e1.eml",
            "priority": "normal"
        }))
        .unwrap()
    }

    #[test]
    fn classification_request_shape() {
        let request = classification_request(&message(), None);
        assert_eq!(request.messages.len(), 2);
        assert_eq!(request.messages[0].role, Role::System);
        assert!(request.messages[1].content.contains("Subject: Broken login"));
        assert_eq!(request.max_tokens, 1024);
        assert_eq!(request.compact_max_tokens, 800);
    }

    #[test]
    fn instruction_override_replaces_header() {
        let request = classification_request(&message(), Some("Custom rules."));
        assert!(request.messages[1].content.starts_with("Custom rules.\nFrom:"));
    }

    #[test]
    fn reply_request_carries_classification() {
        let classification: Classification =
            serde_json::from_str(r#"{"category":"support","summary":"Login broken"}"#).unwrap();
        let request = reply_request(&message(), &classification, None);
        let prompt = &request.messages[1].content;
        assert!(prompt.contains("Category: support"));
        assert!(prompt.contains("Classification summary: Login broken"));
        assert_eq!(request.max_tokens, 1200);
    }
}
