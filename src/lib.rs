//! SmartMail — inbound email triage: classification, rule-driven actions,
//! gated auto-replies and self-healing maintenance.

pub mod api;
pub mod channels;
pub mod classify;
pub mod config;
pub mod error;
pub mod llm;
pub mod objects;
pub mod pipeline;
pub mod queue;
pub mod reliability;
pub mod safety;
pub mod store;
