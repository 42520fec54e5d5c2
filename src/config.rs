//! Configuration types, loaded from the environment.

use std::path::PathBuf;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;

pub const DEFAULT_AI_MODEL: &str = "openai/gpt-5-mini";
pub const DEFAULT_FALLBACK_AI_MODEL: &str = "@cf/meta/llama-3.1-8b-instruct";
pub const DEFAULT_GATEWAY_BASE_URL: &str = "https://gateway.ai.cloudflare.com/v1";
pub const DEFAULT_WORKERS_AI_BASE_URL: &str = "https://api.cloudflare.com/client/v4";
pub const DEFAULT_RESEND_BASE_URL: &str = "https://api.resend.com";
pub const DEFAULT_MAINTENANCE_CRON: &str = "0 */5 * * * *";

const DEFAULT_MAX_TEXT_BODY_LENGTH: usize = 10_000;
const DEFAULT_MAX_QUEUE_MESSAGE_BYTES: usize = 120 * 1024;
const DEFAULT_RETENTION_DAYS: u32 = 365;
const DEFAULT_AUTO_SEND_MIN_CONFIDENCE: f64 = 0.85;
const DEFAULT_LLM_TIMEOUT_SECS: u64 = 30;

/// Full service configuration.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub ai: AiConfig,
    pub notify: NotifyConfig,
    pub reply: ReplyConfig,
    pub limits: LimitsConfig,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            server: ServerConfig::from_env(),
            ai: AiConfig::from_env(),
            notify: NotifyConfig::from_env(),
            reply: ReplyConfig::from_env()?,
            limits: LimitsConfig::from_env(),
        })
    }
}

/// Process-level settings: storage locations, HTTP port, schedules, secrets.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub db_path: PathBuf,
    pub object_dir: PathBuf,
    pub http_port: u16,
    /// Six-field cron expression (with seconds) driving the maintenance routines.
    pub maintenance_cron: String,
    pub queue_capacity: usize,
    /// When set, logs go to a daily-rolling file in this directory.
    pub log_dir: Option<PathBuf>,
    /// Bearer secret for `/internal/*`. The internal surface is disabled without it.
    pub internal_api_secret: Option<SecretString>,
    /// Bearer secret for `/api/*`. The dashboard surface is open without it.
    pub dashboard_api_secret: Option<SecretString>,
}

impl ServerConfig {
    pub fn from_env() -> Self {
        Self {
            db_path: env_string("SMARTMAIL_DB_PATH")
                .unwrap_or_else(|| "./data/smartmail.db".to_string())
                .into(),
            object_dir: env_string("SMARTMAIL_OBJECT_DIR")
                .unwrap_or_else(|| "./data/objects".to_string())
                .into(),
            http_port: std::env::var("SMARTMAIL_HTTP_PORT")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(8080),
            maintenance_cron: env_string("SMARTMAIL_MAINTENANCE_CRON")
                .unwrap_or_else(|| DEFAULT_MAINTENANCE_CRON.to_string()),
            queue_capacity: parse_positive(env_string("SMARTMAIL_QUEUE_CAPACITY"), 1000),
            log_dir: env_string("SMARTMAIL_LOG_DIR").map(PathBuf::from),
            internal_api_secret: env_secret("INTERNAL_API_SECRET"),
            dashboard_api_secret: env_secret("DASHBOARD_API_SECRET"),
        }
    }
}

/// AI provider chain settings.
#[derive(Debug, Clone)]
pub struct AiConfig {
    pub account_id: Option<String>,
    pub gateway_id: Option<String>,
    pub gateway_base_url: String,
    pub gateway_token: Option<SecretString>,
    pub openai_api_key: Option<SecretString>,
    /// Direct OpenAI-compatible base URL used when the gateway is absent or unavailable.
    pub openai_base_url: Option<String>,
    pub model: String,
    pub workers_api_token: Option<SecretString>,
    pub workers_base_url: String,
    pub fallback_model: String,
    pub request_timeout: Duration,
}

impl AiConfig {
    pub fn from_env() -> Self {
        Self {
            account_id: env_string("CF_ACCOUNT_ID"),
            gateway_id: env_string("AI_GATEWAY_ID"),
            gateway_base_url: env_string("AI_GATEWAY_BASE_URL")
                .unwrap_or_else(|| DEFAULT_GATEWAY_BASE_URL.to_string()),
            gateway_token: env_secret("CF_AIG_TOKEN"),
            openai_api_key: env_secret("OPENAI_API_KEY"),
            openai_base_url: env_string("OPENAI_BASE_URL"),
            model: env_string("DEFAULT_AI_MODEL").unwrap_or_else(|| DEFAULT_AI_MODEL.to_string()),
            workers_api_token: env_secret("CF_API_TOKEN"),
            workers_base_url: env_string("WORKERS_AI_BASE_URL")
                .unwrap_or_else(|| DEFAULT_WORKERS_AI_BASE_URL.to_string()),
            fallback_model: env_string("FALLBACK_AI_MODEL")
                .unwrap_or_else(|| DEFAULT_FALLBACK_AI_MODEL.to_string()),
            request_timeout: Duration::from_secs(DEFAULT_LLM_TIMEOUT_SECS),
        }
    }

    /// Configuration with every network tier disabled.
    pub fn offline() -> Self {
        Self {
            account_id: None,
            gateway_id: None,
            gateway_base_url: DEFAULT_GATEWAY_BASE_URL.to_string(),
            gateway_token: None,
            openai_api_key: None,
            openai_base_url: None,
            model: DEFAULT_AI_MODEL.to_string(),
            workers_api_token: None,
            workers_base_url: DEFAULT_WORKERS_AI_BASE_URL.to_string(),
            fallback_model: DEFAULT_FALLBACK_AI_MODEL.to_string(),
            request_timeout: Duration::from_secs(DEFAULT_LLM_TIMEOUT_SECS),
        }
    }
}

/// Notification sinks.
#[derive(Debug, Clone, Default)]
pub struct NotifyConfig {
    pub slack_webhook_url: Option<String>,
    pub custom_webhook_url: Option<String>,
}

impl NotifyConfig {
    pub fn from_env() -> Self {
        Self {
            slack_webhook_url: env_string("SLACK_WEBHOOK_URL"),
            custom_webhook_url: env_string("CUSTOM_WEBHOOK_URL"),
        }
    }
}

/// Transactional-email credentials and auto-send policy.
#[derive(Debug, Clone)]
pub struct ReplyConfig {
    pub resend_api_key: Option<SecretString>,
    pub from_address: Option<String>,
    pub resend_base_url: String,
    pub auto_send: bool,
    pub min_confidence: f64,
}

impl ReplyConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let min_confidence = match env_string("AUTO_SEND_MIN_CONFIDENCE") {
            Some(raw) => parse_confidence(&raw)?,
            None => DEFAULT_AUTO_SEND_MIN_CONFIDENCE,
        };

        Ok(Self {
            resend_api_key: env_secret("RESEND_API_KEY"),
            from_address: env_string("REPLY_FROM_EMAIL"),
            resend_base_url: env_string("RESEND_BASE_URL")
                .unwrap_or_else(|| DEFAULT_RESEND_BASE_URL.to_string()),
            auto_send: env_string("AUTO_SEND_REPLY").is_some_and(|v| v.eq_ignore_ascii_case("true")),
            min_confidence,
        })
    }
}

impl Default for ReplyConfig {
    fn default() -> Self {
        Self {
            resend_api_key: None,
            from_address: None,
            resend_base_url: DEFAULT_RESEND_BASE_URL.to_string(),
            auto_send: false,
            min_confidence: DEFAULT_AUTO_SEND_MIN_CONFIDENCE,
        }
    }
}

/// Size and retention limits.
#[derive(Debug, Clone, Copy)]
pub struct LimitsConfig {
    pub max_text_body_length: usize,
    pub max_queue_message_bytes: usize,
    pub retention_days: u32,
}

impl LimitsConfig {
    pub fn from_env() -> Self {
        Self {
            max_text_body_length: parse_positive(
                env_string("MAX_TEXT_BODY_LENGTH"),
                DEFAULT_MAX_TEXT_BODY_LENGTH,
            ),
            max_queue_message_bytes: parse_positive(
                env_string("MAX_QUEUE_MESSAGE_BYTES"),
                DEFAULT_MAX_QUEUE_MESSAGE_BYTES,
            ),
            retention_days: parse_positive(env_string("RETENTION_DAYS_EMAILS"), DEFAULT_RETENTION_DAYS),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_text_body_length: DEFAULT_MAX_TEXT_BODY_LENGTH,
            max_queue_message_bytes: DEFAULT_MAX_QUEUE_MESSAGE_BYTES,
            retention_days: DEFAULT_RETENTION_DAYS,
        }
    }
}

/// Parse a strictly positive integer, falling back to `default` for anything else.
pub fn parse_positive<T>(value: Option<String>, default: T) -> T
where
    T: std::str::FromStr + PartialOrd + Default,
{
    value
        .and_then(|s| s.trim().parse::<T>().ok())
        .filter(|n| *n > T::default())
        .unwrap_or(default)
}

fn parse_confidence(raw: &str) -> Result<f64, ConfigError> {
    let value: f64 = raw.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: "AUTO_SEND_MIN_CONFIDENCE".into(),
        message: format!("'{raw}' is not a number"),
    })?;
    if !(0.0..=1.0).contains(&value) {
        return Err(ConfigError::InvalidValue {
            key: "AUTO_SEND_MIN_CONFIDENCE".into(),
            message: format!("{value} is outside [0, 1]"),
        });
    }
    Ok(value)
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn env_secret(key: &str) -> Option<SecretString> {
    env_string(key).map(SecretString::from)
}
