//! Persistence layer — libSQL-backed storage for emails, AI results, audit
//! trails, review tasks, prompt templates and runtime configuration.

pub mod libsql_backend;
pub mod migrations;
pub mod model;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use traits::{ConfigStore, Database};
