//! LLM integration for SmartMail.
//!
//! Supports:
//! - **AI gateway**: OpenAI-compatible chat completions, with a direct
//!   provider fallback when the gateway is unavailable
//! - **Workers AI**: on-platform single-prompt inference
//!
//! Both talk plain HTTP through `reqwest` so the raw status and body are
//! available for fallback decisions and the audit trail.

pub mod gateway;
pub mod provider;
pub mod workers;

pub use gateway::GatewayProvider;
pub use provider::*;
pub use workers::WorkersAiProvider;

use std::sync::Arc;

use crate::config::AiConfig;

/// Build the network tiers of the classification chain, in fallback order.
pub fn create_providers(config: &AiConfig, client: reqwest::Client) -> Vec<Arc<dyn LlmProvider>> {
    let mut providers: Vec<Arc<dyn LlmProvider>> = Vec::new();

    if let Some(gateway) = GatewayProvider::from_config(config, client.clone()) {
        tracing::info!("Using AI gateway (model: {})", config.model);
        providers.push(Arc::new(gateway));
    }
    if let Some(workers) = WorkersAiProvider::from_config(config, client) {
        tracing::info!("Using Workers AI fallback (model: {})", config.fallback_model);
        providers.push(Arc::new(workers));
    }
    if providers.is_empty() {
        tracing::warn!("No AI provider configured, classification will use the heuristic tier only");
    }
    providers
}
