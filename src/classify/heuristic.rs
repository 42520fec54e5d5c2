//! Local keyword classifier, the last tier of every chain. No network, no
//! failure modes.

use std::sync::LazyLock;

use regex::Regex;

use crate::classify::schema::{
    Category, Classification, ExtractedEntities, ReplyDraft, Sentiment, Tone,
};
use crate::pipeline::types::{QueueMessage, truncate_chars};

pub const HEURISTIC_PROVIDER: &str = "heuristic";
pub const HEURISTIC_MODEL: &str = "heuristic-v1";
pub const HEURISTIC_REPLY_MODEL: &str = "heuristic-reply-v1";

const SUMMARY_CHARS: usize = 120;

/// Checked in order; first match wins.
static CATEGORY_PATTERNS: LazyLock<Vec<(Regex, Category)>> = LazyLock::new(|| {
    [
        (r"(?i)invoice|receipt|payment|billing", Category::Invoice),
        (r"(?i)promo|discount|sale", Category::Promo),
        (r"(?i)newsletter|weekly|digest", Category::Newsletter),
        (r"(?i)urgent|asap|immediately|security", Category::Urgent),
        (r"(?i)support|bug|issue|error", Category::Support),
    ]
    .into_iter()
    .map(|(pattern, category)| {
        (
            Regex::new(pattern).expect("category pattern compiles"),
            category,
        )
    })
    .collect()
});

pub fn classify(message: &QueueMessage) -> Classification {
    let text = format!("{} {}", message.subject, message.text_body);
    let category = CATEGORY_PATTERNS
        .iter()
        .find(|(re, _)| re.is_match(&text))
        .map(|(_, category)| *category)
        .unwrap_or(Category::Other);

    let priority = match category {
        Category::Urgent => 5,
        Category::Support => 4,
        _ => 3,
    };

    let summary = if !message.text_body.is_empty() {
        truncate_chars(&message.text_body, SUMMARY_CHARS)
    } else if !message.subject.is_empty() {
        message.subject.clone()
    } else {
        "No content".to_string()
    };

    Classification {
        category,
        subcategory: None,
        sentiment: if category == Category::Urgent {
            Sentiment::Urgent
        } else {
            Sentiment::Neutral
        },
        priority,
        language: "unknown".to_string(),
        summary,
        tags: vec![category.as_str().to_string()],
        requires_reply: matches!(category, Category::Support | Category::Urgent),
        estimated_reply_deadline: None,
        extracted_entities: ExtractedEntities::default(),
        suggested_actions: Vec::new(),
        confidence_score: 0.5,
    }
}

/// A non-committal acknowledgment. Never safe to auto-send.
pub fn reply_draft(message: &QueueMessage, classification: &Classification) -> ReplyDraft {
    let mut lines = vec![
        "Hello,".to_string(),
        String::new(),
        "Thank you for your email. We have received your message and are reviewing it."
            .to_string(),
    ];
    if !classification.summary.is_empty() {
        lines.push(format!("Summary we captured: {}", classification.summary));
    }
    lines.extend(
        [
            "We will follow up shortly with next steps.",
            "",
            "Best regards,",
            "SmartMail Team",
        ]
        .map(String::from),
    );

    let language = if classification.language.is_empty() {
        "en".to_string()
    } else {
        classification.language.clone()
    };

    ReplyDraft {
        subject: ReplyDraft::reply_subject(&message.subject),
        body: lines.join("\n"),
        tone: Tone::Formal,
        language,
        placeholders: Vec::new(),
        auto_send_safe: false,
    }
}
