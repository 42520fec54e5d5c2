//! Email processing pipeline.
//!
//! Inbound mail flows through:
//! 1. `IngestService::ingest()`: blacklist, blob storage, payload budget, enqueue
//! 2. `QueueConsumer`: validates deliveries and hands them to the processor
//! 3. `MessageProcessor::process()`: idempotent claim, classification, draft
//! 4. `ActionRuleEngine::execute()`: spam handling, notifications, escalation
//! 5. `AutoReplyGate::maybe_send()`: policy-gated automatic reply

pub mod auto_reply;
pub mod budget;
pub mod consumer;
pub mod ingest;
pub mod processor;
pub mod rules;
pub mod types;

pub use auto_reply::{AutoReplyGate, ReplyOutcome, SkipReason};
pub use consumer::QueueConsumer;
pub use ingest::{IngestOutcome, IngestService};
pub use processor::{MessageProcessor, ProcessOutcome};
pub use rules::ActionRuleEngine;
pub use types::{InboundEmail, QueueMessage};
