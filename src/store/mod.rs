//! Persistence layer — libSQL-backed storage for photos, the audit trail, and LLM spend.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use traits::{
    Database, LlmCallRecord, LlmCostSummary, PhotoTransition, StatusCounts, TransitionOutcome,
};
