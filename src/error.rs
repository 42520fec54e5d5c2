//! Error types for SmartMail.

use std::time::Duration;

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Outbound notification / delivery channel errors.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("Channel {name} is not configured")]
    NotConfigured { name: String },

    #[error("Failed to send on channel {name}: {reason}")]
    SendFailed { name: String, reason: String },

    #[error("{name} returned HTTP {status}")]
    Rejected { name: String, status: u16 },
}

/// LLM provider errors.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("Provider {provider} is not configured: {reason}")]
    NotConfigured { provider: String, reason: String },

    #[error("Provider {provider} request failed: {reason}")]
    RequestFailed { provider: String, reason: String },

    #[error("Provider {provider} returned HTTP {status}: {body}")]
    Http {
        provider: String,
        status: u16,
        body: String,
    },

    #[error("Provider {provider} timed out after {after:?}")]
    Timeout { provider: String, after: Duration },

    #[error("Invalid response from {provider}: {reason}")]
    InvalidResponse { provider: String, reason: String },
}

impl LlmError {
    /// Whether retrying the same provider later could plausibly succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            LlmError::Timeout { .. } | LlmError::RequestFailed { .. } => true,
            LlmError::Http { status, .. } => *status == 429 || *status >= 500,
            LlmError::NotConfigured { .. } | LlmError::InvalidResponse { .. } => false,
        }
    }
}

/// Object storage errors.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Invalid object key: {0}")]
    InvalidKey(String),

    #[error("Object {key} failed: {reason}")]
    Operation { key: String, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Queue transport errors.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Queue is congested")]
    Congested,

    #[error("Queue is closed")]
    Closed,

    #[error("Payload serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Pipeline processing errors.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Store failure: {0}")]
    Database(#[from] DatabaseError),

    #[error("Object storage failure: {0}")]
    Storage(#[from] StorageError),

    #[error("Delivery failure: {0}")]
    Channel(#[from] ChannelError),

    #[error("Enqueue failure: {0}")]
    Queue(#[from] QueueError),

    #[error("Email {0} not found")]
    EmailNotFound(String),

    #[error("Email {email_id} has no {what}")]
    MissingArtifact { email_id: String, what: String },

    #[error("Invalid payload: {0}")]
    InvalidPayload(String),
}
