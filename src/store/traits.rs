//! `Database` trait — single async interface for moderation persistence.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::moderation::model::{
    AiAssessment, AuditEntry, ModerationStatus, PhotoSubmission,
};

/// A conditional status change plus the audit row describing it.
///
/// The backend applies it only if the photo's current status is in
/// `allowed_from`, and writes the audit row in the same transaction.
#[derive(Debug, Clone)]
pub struct PhotoTransition {
    pub photo_id: Uuid,
    pub allowed_from: Vec<ModerationStatus>,
    pub to: ModerationStatus,
    /// Replaces the stored assessment when set.
    pub assessment: Option<AiAssessment>,
    /// Replaces the stored decision reason when set.
    pub decision_reason: Option<String>,
    /// Always written; `None` clears it.
    pub rejection_reason: Option<String>,
    /// Replaces the stored reviewer when set.
    pub reviewed_by: Option<String>,
    /// Always written; `None` clears it.
    pub last_error: Option<String>,
    pub increment_attempts: bool,
    /// When set, the photo's attempt counter must equal this value, so a
    /// superseded analysis attempt cannot write its result.
    pub expected_attempts: Option<u32>,
    pub audit: AuditEntry,
}

/// What happened to a `PhotoTransition`.
#[derive(Debug, Clone)]
pub enum TransitionOutcome {
    Applied {
        from: ModerationStatus,
        photo: PhotoSubmission,
    },
    NotFound,
    /// Photo exists but is in a state the transition may not start from.
    Conflict { current: ModerationStatus },
    /// `expected_attempts` did not match; a newer attempt owns the photo.
    Superseded { current_attempts: u32 },
}

/// A single LLM call for the cost ledger.
#[derive(Debug, Clone)]
pub struct LlmCallRecord<'a> {
    pub photo_id: Option<Uuid>,
    pub provider: &'a str,
    pub model: &'a str,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub cost: Decimal,
    pub purpose: Option<&'a str>,
}

/// Aggregated LLM spend.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LlmCostSummary {
    pub total_cost: Decimal,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub calls: u64,
}

/// Number of photos in each status. Every status is present, zero or not.
pub type StatusCounts = BTreeMap<String, u64>;

/// Backend-agnostic database trait.
#[async_trait]
pub trait Database: Send + Sync {
    /// Run all pending schema migrations.
    async fn run_migrations(&self) -> Result<(), DatabaseError>;

    // ── Photos ──────────────────────────────────────────────────────

    /// Insert a new submission and its initial audit row.
    async fn insert_photo(
        &self,
        photo: &PhotoSubmission,
        audit: &AuditEntry,
    ) -> Result<(), DatabaseError>;

    /// Get a photo by ID.
    async fn get_photo(&self, id: Uuid) -> Result<Option<PhotoSubmission>, DatabaseError>;

    /// List photos, oldest first, optionally filtered by status.
    async fn list_photos(
        &self,
        status: Option<ModerationStatus>,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<PhotoSubmission>, DatabaseError>;

    /// Apply a conditional status change atomically with its audit row.
    async fn apply_transition(
        &self,
        transition: &PhotoTransition,
    ) -> Result<TransitionOutcome, DatabaseError>;

    /// Photos in `Analyzing` last touched before `older_than`, with the
    /// attempt number that claimed them.
    async fn find_stale_analyzing(
        &self,
        older_than: DateTime<Utc>,
    ) -> Result<Vec<(Uuid, u32)>, DatabaseError>;

    /// Photo counts per status.
    async fn status_counts(&self) -> Result<StatusCounts, DatabaseError>;

    // ── Audit ───────────────────────────────────────────────────────

    /// Audit history for one photo, oldest first.
    async fn audit_for_photo(&self, photo_id: Uuid) -> Result<Vec<AuditEntry>, DatabaseError>;

    /// Most recent audit entries across all photos.
    async fn recent_audit(&self, limit: usize) -> Result<Vec<AuditEntry>, DatabaseError>;

    // ── LLM Call Tracking ───────────────────────────────────────────

    /// Record an LLM call. Returns the ledger row ID.
    async fn record_llm_call(&self, record: &LlmCallRecord<'_>) -> Result<Uuid, DatabaseError>;

    /// Total spend across all calls.
    async fn get_total_spend(&self) -> Result<LlmCostSummary, DatabaseError>;
}
