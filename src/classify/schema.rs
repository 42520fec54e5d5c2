//! Classification and reply-draft schemas shared with the AI providers.
//!
//! Missing optional fields take their defaults; unknown enum values and
//! out-of-range numbers fail validation so the chain moves to the next tier.

use serde::{Deserialize, Serialize};

use crate::pipeline::types::truncate_chars;

/// Closed set of message categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Invoice,
    Support,
    Personal,
    Promo,
    Newsletter,
    Spam,
    Urgent,
    Legal,
    #[default]
    Other,
}

impl Category {
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Invoice => "invoice",
            Category::Support => "support",
            Category::Personal => "personal",
            Category::Promo => "promo",
            Category::Newsletter => "newsletter",
            Category::Spam => "spam",
            Category::Urgent => "urgent",
            Category::Legal => "legal",
            Category::Other => "other",
        }
    }
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sentiment {
    Positive,
    #[default]
    Neutral,
    Negative,
    Urgent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tone {
    #[default]
    Formal,
    Casual,
    Empathetic,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AmountMention {
    pub value: f64,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub context: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DateMention {
    pub date: String,
    #[serde(default)]
    pub context: Option<String>,
}

/// Entities the model pulled out of the message.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractedEntities {
    #[serde(default)]
    pub amounts: Vec<AmountMention>,
    #[serde(default)]
    pub dates: Vec<DateMention>,
    #[serde(default)]
    pub persons: Vec<String>,
    #[serde(default)]
    pub companies: Vec<String>,
    #[serde(default)]
    pub order_ids: Vec<String>,
    #[serde(default)]
    pub urls: Vec<String>,
}

/// Validated classification of one message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Classification {
    #[serde(default)]
    pub category: Category,
    #[serde(default)]
    pub subcategory: Option<String>,
    #[serde(default)]
    pub sentiment: Sentiment,
    /// 1 (lowest) to 5 (highest).
    #[serde(default = "default_priority")]
    pub priority: u8,
    #[serde(default = "default_language")]
    pub language: String,
    #[serde(default = "default_summary")]
    pub summary: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub requires_reply: bool,
    #[serde(default)]
    pub estimated_reply_deadline: Option<String>,
    #[serde(default)]
    pub extracted_entities: ExtractedEntities,
    #[serde(default)]
    pub suggested_actions: Vec<String>,
    /// Model confidence in [0, 1].
    #[serde(default = "default_confidence")]
    pub confidence_score: f64,
}

/// Suggested reply to a message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplyDraft {
    #[serde(default = "default_reply_subject")]
    pub subject: String,
    #[serde(default = "default_reply_body")]
    pub body: String,
    #[serde(default)]
    pub tone: Tone,
    #[serde(default = "default_language")]
    pub language: String,
    /// Facts the draft could not fill in, e.g. `[ORDER_NUMBER]`.
    #[serde(default)]
    pub placeholders: Vec<String>,
    #[serde(default)]
    pub auto_send_safe: bool,
}

pub const MAX_REPLY_SUBJECT_CHARS: usize = 200;
pub const MAX_REPLY_BODY_CHARS: usize = 6000;

fn default_priority() -> u8 {
    3
}

fn default_language() -> String {
    "en".to_string()
}

fn default_summary() -> String {
    "No summary".to_string()
}

fn default_confidence() -> f64 {
    0.6
}

fn default_reply_subject() -> String {
    "Re: Your message".to_string()
}

fn default_reply_body() -> String {
    "Thank you for your email.".to_string()
}

/// Why a model response was rejected.
#[derive(Debug, thiserror::Error)]
pub enum SchemaError {
    #[error("no JSON object in model output")]
    NoJsonObject,

    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("field {field} out of range: {detail}")]
    OutOfRange { field: &'static str, detail: String },
}

impl Classification {
    pub fn validate(self) -> Result<Self, SchemaError> {
        if !(1..=5).contains(&self.priority) {
            return Err(SchemaError::OutOfRange {
                field: "priority",
                detail: self.priority.to_string(),
            });
        }
        if !(0.0..=1.0).contains(&self.confidence_score) {
            return Err(SchemaError::OutOfRange {
                field: "confidenceScore",
                detail: self.confidence_score.to_string(),
            });
        }
        Ok(self)
    }
}

impl ReplyDraft {
    pub fn validate(self) -> Result<Self, SchemaError> {
        check_length("subject", &self.subject, MAX_REPLY_SUBJECT_CHARS)?;
        check_length("body", &self.body, MAX_REPLY_BODY_CHARS)?;
        Ok(self)
    }

    /// Subject line for a reply, `Re: ` prefixed and bounded.
    pub fn reply_subject(original: &str) -> String {
        if original.trim().is_empty() {
            default_reply_subject()
        } else {
            truncate_chars(&format!("Re: {original}"), MAX_REPLY_SUBJECT_CHARS)
        }
    }
}

fn check_length(field: &'static str, value: &str, max: usize) -> Result<(), SchemaError> {
    let len = value.chars().count();
    if len == 0 || len > max {
        return Err(SchemaError::OutOfRange {
            field,
            detail: format!("length {len}, expected 1..={max}"),
        });
    }
    Ok(())
}

/// Parse and validate a classification from raw model output.
pub fn parse_classification(raw: &str) -> Result<Classification, SchemaError> {
    let json = extract_json_object(raw).ok_or(SchemaError::NoJsonObject)?;
    let parsed: Classification = serde_json::from_str(json)?;
    parsed.validate()
}

/// Parse and validate a reply draft from raw model output.
pub fn parse_reply_draft(raw: &str) -> Result<ReplyDraft, SchemaError> {
    let json = extract_json_object(raw).ok_or(SchemaError::NoJsonObject)?;
    let parsed: ReplyDraft = serde_json::from_str(json)?;
    parsed.validate()
}

/// Locate the JSON object in model output: a fenced block wins when present,
/// then the span from the first `{` to the last `}`.
pub fn extract_json_object(text: &str) -> Option<&str> {
    let candidate = fenced_block(text).unwrap_or(text);
    let start = candidate.find('{')?;
    let end = candidate.rfind('}')?;
    (end > start).then(|| &candidate[start..=end])
}

fn fenced_block(text: &str) -> Option<&str> {
    if let Some(start) = text.find("```json") {
        let after = &text[start + 7..];
        if let Some(end) = after.find("```") {
            return Some(after[..end].trim());
        }
    }

    let start = text.find("```")?;
    let after = &text[start + 3..];
    let end = after.find("```")?;
    Some(after[..end].trim())
}
