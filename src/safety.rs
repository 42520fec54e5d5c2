//! PII redaction for audit traces and display masking.
//!
//! Outbound AI request payloads are redacted before they are written to the
//! trace table. Raw provider responses are stored as received and only
//! masked when rendered for the dashboard.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;

static EMAIL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)[A-Z0-9._%+-]+@[A-Z0-9.-]+\.[A-Z]{2,}").expect("email pattern compiles")
});

static PHONE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\+?\d[\d\s().-]{7,}\d").expect("phone pattern compiles"));

pub const REDACTED_EMAIL: &str = "[redacted-email]";
pub const REDACTED_PHONE: &str = "[redacted-phone]";

/// Replace email addresses and phone-like digit runs in `input`.
pub fn redact_pii(input: &str) -> String {
    let without_emails = EMAIL_RE.replace_all(input, REDACTED_EMAIL);
    PHONE_RE.replace_all(&without_emails, REDACTED_PHONE).into_owned()
}

/// Recursively redact every string inside a JSON value.
pub fn redact_json(value: &Value) -> Value {
    match value {
        Value::String(s) => Value::String(redact_pii(s)),
        Value::Array(items) => Value::Array(items.iter().map(redact_json).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), redact_json(v)))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Mask a stored trace field for external-facing display.
pub fn mask_for_display(input: Option<&str>) -> Option<String> {
    input.map(redact_pii)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn redacts_emails_case_insensitively() {
        assert_eq!(
            redact_pii("Contact Alice.Smith@Example.COM today"),
            "Contact [redacted-email] today"
        );
    }

    #[test]
    fn redacts_phone_numbers() {
        assert_eq!(
            redact_pii("call +1 (555) 123-4567 now"),
            "call [redacted-phone] now"
        );
        // Short digit runs such as order numbers under nine digits survive.
        assert_eq!(redact_pii("order 12345"), "order 12345");
    }

    #[test]
    fn redacts_nested_json_strings_only() {
        let input = json!({
            "model": "m",
            "temperature": 0.1,
            "messages": [
                {"role": "user", "content": "From: bob@corp.io"},
            ],
            "meta": {"phone": "+44 20 7946 0958", "count": 3}
        });
        let out = redact_json(&input);
        assert_eq!(out["messages"][0]["content"], "From: [redacted-email]");
        assert_eq!(out["meta"]["phone"], "[redacted-phone]");
        assert_eq!(out["meta"]["count"], 3);
        assert_eq!(out["temperature"], 0.1);
    }

    #[test]
    fn mask_passes_none_through() {
        assert_eq!(mask_for_display(None), None);
        assert_eq!(
            mask_for_display(Some("x@y.io")).as_deref(),
            Some("[redacted-email]")
        );
    }
}
