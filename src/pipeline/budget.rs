//! Payload budgeting: shrink a queue payload until its serialized size fits.
//!
//! Steps run in order and stop as soon as the payload fits:
//! 1. body cut to [`FIRST_BODY_LIMIT`] characters
//! 2. attachment metadata capped to [`MAX_ATTACHMENTS`] entries
//! 3. body cut to [`FINAL_BODY_LIMIT`] characters

use super::types::{QueueMessage, truncate_chars};

pub const FIRST_BODY_LIMIT: usize = 4000;
pub const MAX_ATTACHMENTS: usize = 8;
pub const FINAL_BODY_LIMIT: usize = 1500;

/// Serialized JSON size of the payload in bytes.
pub fn estimate_bytes(payload: &QueueMessage) -> usize {
    serde_json::to_vec(payload).map(|v| v.len()).unwrap_or(usize::MAX)
}

/// Return a payload whose serialized size is at most `max_bytes`, provided
/// the maximally truncated form fits. Applying it twice is a no-op.
pub fn apply_budget(mut payload: QueueMessage, max_bytes: usize) -> QueueMessage {
    if estimate_bytes(&payload) <= max_bytes {
        return payload;
    }

    truncate_body(&mut payload, FIRST_BODY_LIMIT);
    if estimate_bytes(&payload) <= max_bytes {
        return payload;
    }

    payload.attachments.truncate(MAX_ATTACHMENTS);
    if estimate_bytes(&payload) <= max_bytes {
        return payload;
    }

    truncate_body(&mut payload, FINAL_BODY_LIMIT);
    payload
}

/// Cut the body to `limit` characters, flagging the payload when text was lost.
pub(crate) fn truncate_body(payload: &mut QueueMessage, limit: usize) {
    if payload.text_body.chars().count() > limit {
        payload.text_body = truncate_chars(&payload.text_body, limit);
        payload.body_truncated = true;
    }
}
