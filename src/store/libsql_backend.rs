//! libSQL backend — async `Database` trait implementation.
//!
//! Supports local file and in-memory databases.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use rust_decimal::Decimal;
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::moderation::model::{ActorKind, AuditEntry, ModerationStatus, PhotoSubmission};
use crate::store::migrations;
use crate::store::traits::{
    Database, LlmCallRecord, LlmCostSummary, PhotoTransition, StatusCounts, TransitionOutcome,
};

const PHOTO_COLUMNS: &str = "id, uploader, image_ref, caption, status, assessment, decision_reason, rejection_reason, reviewed_by, analysis_attempts, last_error, created_at, updated_at";

const AUDIT_COLUMNS: &str = "id, photo_id, from_status, to_status, actor, actor_kind, note, created_at";

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations. Writes take
/// `write_lock` so a transaction never interleaves with another writer on the
/// shared connection.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
    write_lock: Mutex<()>,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    DatabaseError::Pool(format!("Failed to create database directory: {e}"))
                })?;
            }
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let backend = Self::from_database(db)?;
        backend.run_migrations().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let backend = Self::from_database(db)?;
        backend.run_migrations().await?;
        Ok(backend)
    }

    fn from_database(db: LibSqlDatabase) -> Result<Self, DatabaseError> {
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;
        Ok(Self {
            db: Arc::new(db),
            conn,
            write_lock: Mutex::new(()),
        })
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn opt_text(value: Option<&str>) -> libsql::Value {
    match value {
        Some(v) => libsql::Value::Text(v.to_string()),
        None => libsql::Value::Null,
    }
}

fn opt_string(row: &libsql::Row, idx: i32) -> Option<String> {
    row.get::<String>(idx).ok()
}

fn parse_status(s: &str) -> Result<ModerationStatus, DatabaseError> {
    s.parse().map_err(DatabaseError::Serialization)
}

fn parse_uuid(s: &str) -> Result<Uuid, DatabaseError> {
    Uuid::parse_str(s).map_err(|e| DatabaseError::Serialization(format!("bad uuid column: {e}")))
}

fn col_err(e: libsql::Error) -> DatabaseError {
    DatabaseError::Query(format!("row parse: {e}"))
}

/// Map a libsql Row to a PhotoSubmission. Column order matches PHOTO_COLUMNS.
fn row_to_photo(row: &libsql::Row) -> Result<PhotoSubmission, DatabaseError> {
    let id: String = row.get(0).map_err(col_err)?;
    let status: String = row.get(4).map_err(col_err)?;
    let assessment = opt_string(row, 5).and_then(|json| serde_json::from_str(&json).ok());
    let attempts: i64 = row.get(9).map_err(col_err)?;
    let created: String = row.get(11).map_err(col_err)?;
    let updated: String = row.get(12).map_err(col_err)?;

    Ok(PhotoSubmission {
        id: parse_uuid(&id)?,
        uploader: row.get(1).map_err(col_err)?,
        image_ref: row.get(2).map_err(col_err)?,
        caption: opt_string(row, 3),
        status: parse_status(&status)?,
        assessment,
        decision_reason: opt_string(row, 6),
        rejection_reason: opt_string(row, 7),
        reviewed_by: opt_string(row, 8),
        analysis_attempts: attempts.max(0) as u32,
        last_error: opt_string(row, 10),
        created_at: parse_datetime(&created),
        updated_at: parse_datetime(&updated),
    })
}

/// Map a libsql Row to an AuditEntry. Column order matches AUDIT_COLUMNS.
fn row_to_audit(row: &libsql::Row) -> Result<AuditEntry, DatabaseError> {
    let id: String = row.get(0).map_err(col_err)?;
    let photo_id: String = row.get(1).map_err(col_err)?;
    let from_status = match opt_string(row, 2) {
        Some(s) => Some(parse_status(&s)?),
        None => None,
    };
    let to_status: String = row.get(3).map_err(col_err)?;
    let actor_kind: String = row.get(5).map_err(col_err)?;
    let created: String = row.get(7).map_err(col_err)?;

    Ok(AuditEntry {
        id: parse_uuid(&id)?,
        photo_id: parse_uuid(&photo_id)?,
        from_status,
        to_status: parse_status(&to_status)?,
        actor: row.get(4).map_err(col_err)?,
        actor_kind: actor_kind.parse().unwrap_or(ActorKind::System),
        note: opt_string(row, 6),
        created_at: parse_datetime(&created),
    })
}

async fn insert_audit(conn: &Connection, entry: &AuditEntry) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT INTO moderation_audit (id, photo_id, from_status, to_status, actor, actor_kind, note, created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            entry.id.to_string(),
            entry.photo_id.to_string(),
            opt_text(entry.from_status.map(|s| s.as_str())),
            entry.to_status.as_str(),
            entry.actor.as_str(),
            entry.actor_kind.as_str(),
            opt_text(entry.note.as_deref()),
            entry.created_at.to_rfc3339(),
        ],
    )
    .await
    .map_err(|e| DatabaseError::Query(format!("insert_audit: {e}")))?;
    Ok(())
}

/// Current status and attempt counter of a photo.
async fn current_state(
    conn: &Connection,
    id: Uuid,
) -> Result<Option<(ModerationStatus, u32)>, DatabaseError> {
    let mut rows = conn
        .query(
            "SELECT status, analysis_attempts FROM photos WHERE id = ?1",
            params![id.to_string()],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("current_state: {e}")))?;
    match rows.next().await {
        Ok(Some(row)) => {
            let s: String = row
                .get(0)
                .map_err(|e| DatabaseError::Query(format!("current_state row: {e}")))?;
            let attempts: i64 = row
                .get(1)
                .map_err(|e| DatabaseError::Query(format!("current_state row: {e}")))?;
            Ok(Some((parse_status(&s)?, attempts.max(0) as u32)))
        }
        Ok(None) => Ok(None),
        Err(e) => Err(DatabaseError::Query(format!("current_state: {e}"))),
    }
}

async fn collect_photos(
    mut rows: libsql::Rows,
    op: &str,
) -> Result<Vec<PhotoSubmission>, DatabaseError> {
    let mut photos = Vec::new();
    while let Some(row) = rows
        .next()
        .await
        .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?
    {
        photos.push(row_to_photo(&row)?);
    }
    Ok(photos)
}

async fn collect_audit(mut rows: libsql::Rows, op: &str) -> Result<Vec<AuditEntry>, DatabaseError> {
    let mut entries = Vec::new();
    while let Some(row) = rows
        .next()
        .await
        .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?
    {
        entries.push(row_to_audit(&row)?);
    }
    Ok(entries)
}

#[async_trait]
impl Database for LibSqlBackend {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(self.conn()).await
    }

    // ── Photos ──────────────────────────────────────────────────────

    async fn insert_photo(
        &self,
        photo: &PhotoSubmission,
        audit: &AuditEntry,
    ) -> Result<(), DatabaseError> {
        let _guard = self.write_lock.lock().await;
        let assessment = photo
            .assessment
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;

        let tx = self
            .conn()
            .transaction()
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_photo begin: {e}")))?;

        let insert = tx
            .execute(
                &format!("INSERT INTO photos ({PHOTO_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)"),
                params![
                    photo.id.to_string(),
                    photo.uploader.as_str(),
                    photo.image_ref.as_str(),
                    opt_text(photo.caption.as_deref()),
                    photo.status.as_str(),
                    opt_text(assessment.as_deref()),
                    opt_text(photo.decision_reason.as_deref()),
                    opt_text(photo.rejection_reason.as_deref()),
                    opt_text(photo.reviewed_by.as_deref()),
                    photo.analysis_attempts as i64,
                    opt_text(photo.last_error.as_deref()),
                    photo.created_at.to_rfc3339(),
                    photo.updated_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_photo: {e}")));

        let result = match insert {
            Ok(_) => insert_audit(&tx, audit).await,
            Err(e) => Err(e),
        };

        match result {
            Ok(()) => tx
                .commit()
                .await
                .map_err(|e| DatabaseError::Query(format!("insert_photo commit: {e}"))),
            Err(e) => {
                let _ = tx.rollback().await;
                Err(e)
            }
        }
    }

    async fn get_photo(&self, id: Uuid) -> Result<Option<PhotoSubmission>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {PHOTO_COLUMNS} FROM photos WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_photo: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                Ok(Some(row_to_photo(&row)?))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_photo: {e}"))),
        }
    }

    async fn list_photos(
        &self,
        status: Option<ModerationStatus>,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<PhotoSubmission>, DatabaseError> {
        let rows = match status {
            Some(status) => self
                .conn()
                .query(
                    &format!("SELECT {PHOTO_COLUMNS} FROM photos WHERE status = ?1 ORDER BY created_at ASC, rowid ASC LIMIT ?2 OFFSET ?3"),
                    params![status.as_str(), limit as i64, offset as i64],
                )
                .await,
            None => self
                .conn()
                .query(
                    &format!("SELECT {PHOTO_COLUMNS} FROM photos ORDER BY created_at ASC, rowid ASC LIMIT ?1 OFFSET ?2"),
                    params![limit as i64, offset as i64],
                )
                .await,
        }
        .map_err(|e| DatabaseError::Query(format!("list_photos: {e}")))?;

        collect_photos(rows, "list_photos").await
    }

    async fn apply_transition(
        &self,
        t: &PhotoTransition,
    ) -> Result<TransitionOutcome, DatabaseError> {
        let _guard = self.write_lock.lock().await;
        let assessment = t
            .assessment
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;

        let tx = self
            .conn()
            .transaction()
            .await
            .map_err(|e| DatabaseError::Query(format!("apply_transition begin: {e}")))?;

        let (current, attempts) = match current_state(&tx, t.photo_id).await {
            Ok(Some(state)) => state,
            Ok(None) => {
                let _ = tx.rollback().await;
                return Ok(TransitionOutcome::NotFound);
            }
            Err(e) => {
                let _ = tx.rollback().await;
                return Err(e);
            }
        };

        if !t.allowed_from.contains(&current) {
            let _ = tx.rollback().await;
            return Ok(TransitionOutcome::Conflict { current });
        }
        if t.expected_attempts.is_some_and(|n| n != attempts) {
            let _ = tx.rollback().await;
            return Ok(TransitionOutcome::Superseded {
                current_attempts: attempts,
            });
        }

        let now = Utc::now().to_rfc3339();
        let update = tx
            .execute(
                "UPDATE photos SET
                    status = ?1,
                    assessment = COALESCE(?2, assessment),
                    decision_reason = COALESCE(?3, decision_reason),
                    rejection_reason = ?4,
                    reviewed_by = COALESCE(?5, reviewed_by),
                    last_error = ?6,
                    analysis_attempts = analysis_attempts + ?7,
                    updated_at = ?8
                 WHERE id = ?9 AND status = ?10",
                params![
                    t.to.as_str(),
                    opt_text(assessment.as_deref()),
                    opt_text(t.decision_reason.as_deref()),
                    opt_text(t.rejection_reason.as_deref()),
                    opt_text(t.reviewed_by.as_deref()),
                    opt_text(t.last_error.as_deref()),
                    if t.increment_attempts { 1i64 } else { 0i64 },
                    now,
                    t.photo_id.to_string(),
                    current.as_str(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("apply_transition update: {e}")));

        let mut audit = t.audit.clone();
        audit.from_status = Some(current);
        let result = match update {
            Ok(_) => insert_audit(&tx, &audit).await,
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            let _ = tx.rollback().await;
            return Err(e);
        }
        tx.commit()
            .await
            .map_err(|e| DatabaseError::Query(format!("apply_transition commit: {e}")))?;

        debug!(photo_id = %t.photo_id, from = %current, to = %t.to, "Photo status updated in DB");

        let photo = self
            .get_photo(t.photo_id)
            .await?
            .ok_or_else(|| DatabaseError::NotFound {
                entity: "photo".into(),
                id: t.photo_id.to_string(),
            })?;
        Ok(TransitionOutcome::Applied {
            from: current,
            photo,
        })
    }

    async fn find_stale_analyzing(
        &self,
        older_than: DateTime<Utc>,
    ) -> Result<Vec<(Uuid, u32)>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT id, analysis_attempts FROM photos
                 WHERE status = 'analyzing' AND updated_at < ?1
                 ORDER BY updated_at ASC",
                params![older_than.to_rfc3339()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("find_stale_analyzing: {e}")))?;

        let mut stale = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("find_stale_analyzing: {e}")))?
        {
            let id: String = row
                .get(0)
                .map_err(|e| DatabaseError::Query(format!("find_stale_analyzing row: {e}")))?;
            let attempts: i64 = row
                .get(1)
                .map_err(|e| DatabaseError::Query(format!("find_stale_analyzing row: {e}")))?;
            if let Ok(id) = Uuid::parse_str(&id) {
                stale.push((id, attempts.max(0) as u32));
            }
        }
        Ok(stale)
    }

    async fn status_counts(&self) -> Result<StatusCounts, DatabaseError> {
        let mut counts: StatusCounts = ModerationStatus::ALL
            .iter()
            .map(|s| (s.as_str().to_string(), 0))
            .collect();

        let mut rows = self
            .conn()
            .query("SELECT status, COUNT(*) FROM photos GROUP BY status", ())
            .await
            .map_err(|e| DatabaseError::Query(format!("status_counts: {e}")))?;

        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("status_counts: {e}")))?
        {
            let status: String = row
                .get(0)
                .map_err(|e| DatabaseError::Query(format!("status_counts row: {e}")))?;
            let count: i64 = row.get(1).unwrap_or(0);
            counts.insert(status, count.max(0) as u64);
        }
        Ok(counts)
    }

    // ── Audit ───────────────────────────────────────────────────────

    async fn audit_for_photo(&self, photo_id: Uuid) -> Result<Vec<AuditEntry>, DatabaseError> {
        let rows = self
            .conn()
            .query(
                &format!("SELECT {AUDIT_COLUMNS} FROM moderation_audit WHERE photo_id = ?1 ORDER BY created_at ASC, rowid ASC"),
                params![photo_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("audit_for_photo: {e}")))?;
        collect_audit(rows, "audit_for_photo").await
    }

    async fn recent_audit(&self, limit: usize) -> Result<Vec<AuditEntry>, DatabaseError> {
        let rows = self
            .conn()
            .query(
                &format!("SELECT {AUDIT_COLUMNS} FROM moderation_audit ORDER BY created_at DESC, rowid DESC LIMIT ?1"),
                params![limit as i64],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("recent_audit: {e}")))?;
        collect_audit(rows, "recent_audit").await
    }

    // ── LLM Call Tracking ────────────────────────────────────────────

    async fn record_llm_call(&self, record: &LlmCallRecord<'_>) -> Result<Uuid, DatabaseError> {
        let _guard = self.write_lock.lock().await;
        let id = Uuid::new_v4();
        let now = Utc::now().to_rfc3339();
        self.conn()
            .execute(
                "INSERT INTO llm_calls (id, photo_id, provider, model, input_tokens, output_tokens, cost, purpose, created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    id.to_string(),
                    opt_text(record.photo_id.map(|p| p.to_string()).as_deref()),
                    record.provider,
                    record.model,
                    record.input_tokens as i64,
                    record.output_tokens as i64,
                    record.cost.to_string(),
                    opt_text(record.purpose),
                    now,
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("record_llm_call: {e}")))?;

        Ok(id)
    }

    async fn get_total_spend(&self) -> Result<LlmCostSummary, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT TOTAL(CAST(cost AS REAL)), TOTAL(input_tokens), TOTAL(output_tokens), COUNT(*) FROM llm_calls",
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_total_spend: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let cost: f64 = row.get(0).unwrap_or(0.0);
                let input: f64 = row.get(1).unwrap_or(0.0);
                let output: f64 = row.get(2).unwrap_or(0.0);
                let calls: i64 = row.get(3).unwrap_or(0);
                Ok(LlmCostSummary {
                    total_cost: Decimal::from_f64_retain(cost)
                        .unwrap_or_default()
                        .round_dp(6)
                        .normalize(),
                    input_tokens: input as u64,
                    output_tokens: output as u64,
                    calls: calls.max(0) as u64,
                })
            }
            Ok(None) => Ok(LlmCostSummary::default()),
            Err(e) => Err(DatabaseError::Query(format!("get_total_spend: {e}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    use crate::moderation::model::{Actor, AiAssessment, ContentFlags};

    async fn test_db() -> LibSqlBackend {
        LibSqlBackend::new_memory().await.unwrap()
    }

    async fn insert(db: &LibSqlBackend, uploader: &str) -> PhotoSubmission {
        let photo =
            PhotoSubmission::new(uploader, "https://cdn.example.org/cat.jpg", Some("Tabby".into()));
        let audit = AuditEntry::new(
            photo.id,
            None,
            ModerationStatus::Pending,
            &Actor::human(uploader),
            None,
        );
        db.insert_photo(&photo, &audit).await.unwrap();
        photo
    }

    fn transition(id: Uuid, allowed: &[ModerationStatus], to: ModerationStatus) -> PhotoTransition {
        PhotoTransition {
            photo_id: id,
            allowed_from: allowed.to_vec(),
            to,
            assessment: None,
            decision_reason: None,
            rejection_reason: None,
            reviewed_by: None,
            last_error: None,
            increment_attempts: false,
            expected_attempts: None,
            audit: AuditEntry::new(id, None, to, &Actor::system(), None),
        }
    }

    #[tokio::test]
    async fn insert_and_get_by_id() {
        let db = test_db().await;
        let photo = insert(&db, "dana").await;

        let fetched = db.get_photo(photo.id).await.unwrap().unwrap();
        assert_eq!(fetched.id, photo.id);
        assert_eq!(fetched.uploader, "dana");
        assert_eq!(fetched.caption.as_deref(), Some("Tabby"));
        assert_eq!(fetched.status, ModerationStatus::Pending);
        assert_eq!(fetched.analysis_attempts, 0);
    }

    #[tokio::test]
    async fn get_by_id_not_found() {
        let db = test_db().await;
        assert!(db.get_photo(Uuid::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn insert_writes_audit_row() {
        let db = test_db().await;
        let photo = insert(&db, "dana").await;
        let audit = db.audit_for_photo(photo.id).await.unwrap();
        assert_eq!(audit.len(), 1);
        assert_eq!(audit[0].from_status, None);
        assert_eq!(audit[0].to_status, ModerationStatus::Pending);
        assert_eq!(audit[0].actor_kind, ActorKind::Human);
    }

    #[tokio::test]
    async fn transition_applies_and_audits() {
        let db = test_db().await;
        let photo = insert(&db, "dana").await;

        let mut t = transition(photo.id, &[ModerationStatus::Pending], ModerationStatus::Analyzing);
        t.increment_attempts = true;
        let outcome = db.apply_transition(&t).await.unwrap();
        match outcome {
            TransitionOutcome::Applied { from, photo } => {
                assert_eq!(from, ModerationStatus::Pending);
                assert_eq!(photo.status, ModerationStatus::Analyzing);
                assert_eq!(photo.analysis_attempts, 1);
            }
            other => panic!("expected Applied, got {other:?}"),
        }

        let audit = db.audit_for_photo(photo.id).await.unwrap();
        assert_eq!(audit.len(), 2);
        assert_eq!(audit[1].from_status, Some(ModerationStatus::Pending));
        assert_eq!(audit[1].to_status, ModerationStatus::Analyzing);
    }

    #[tokio::test]
    async fn transition_conflict_leaves_row_untouched() {
        let db = test_db().await;
        let photo = insert(&db, "dana").await;

        let t = transition(photo.id, &[ModerationStatus::Analyzing], ModerationStatus::AiApproved);
        match db.apply_transition(&t).await.unwrap() {
            TransitionOutcome::Conflict { current } => {
                assert_eq!(current, ModerationStatus::Pending)
            }
            other => panic!("expected Conflict, got {other:?}"),
        }
        assert_eq!(db.audit_for_photo(photo.id).await.unwrap().len(), 1);
        assert_eq!(
            db.get_photo(photo.id).await.unwrap().unwrap().status,
            ModerationStatus::Pending
        );
    }

    #[tokio::test]
    async fn transition_refused_for_superseded_attempt() {
        let db = test_db().await;
        let photo = insert(&db, "dana").await;

        let mut claim = transition(
            photo.id,
            &[ModerationStatus::Pending],
            ModerationStatus::Analyzing,
        );
        claim.increment_attempts = true;
        db.apply_transition(&claim).await.unwrap();
        db.apply_transition(&transition(
            photo.id,
            &[ModerationStatus::Analyzing],
            ModerationStatus::Pending,
        ))
        .await
        .unwrap();
        db.apply_transition(&claim).await.unwrap();

        let mut late = transition(
            photo.id,
            &[ModerationStatus::Analyzing],
            ModerationStatus::AiApproved,
        );
        late.expected_attempts = Some(1);
        match db.apply_transition(&late).await.unwrap() {
            TransitionOutcome::Superseded { current_attempts } => assert_eq!(current_attempts, 2),
            other => panic!("expected Superseded, got {other:?}"),
        }
        assert_eq!(db.audit_for_photo(photo.id).await.unwrap().len(), 4);

        late.expected_attempts = Some(2);
        assert!(matches!(
            db.apply_transition(&late).await.unwrap(),
            TransitionOutcome::Applied { .. }
        ));
    }

    #[tokio::test]
    async fn transition_missing_photo() {
        let db = test_db().await;
        let t = transition(
            Uuid::new_v4(),
            &[ModerationStatus::Pending],
            ModerationStatus::Analyzing,
        );
        assert!(matches!(
            db.apply_transition(&t).await.unwrap(),
            TransitionOutcome::NotFound
        ));
    }

    #[tokio::test]
    async fn assessment_persisted_as_json() {
        let db = test_db().await;
        let photo = insert(&db, "dana").await;

        let mut t = transition(
            photo.id,
            &[ModerationStatus::Pending],
            ModerationStatus::HumanReview,
        );
        t.assessment = Some(AiAssessment {
            score: 0.5,
            confidence: 0.9,
            animals_detected: true,
            animal_types: vec!["rabbit".into()],
            flags: ContentFlags {
                medical: true,
                ..ContentFlags::default()
            },
            summary: "rabbit with a bandage".into(),
            tags: vec!["rescue".into()],
            model: "mock".into(),
        });
        t.decision_reason = Some("medical content flagged".into());
        db.apply_transition(&t).await.unwrap();

        let fetched = db.get_photo(photo.id).await.unwrap().unwrap();
        let a = fetched.assessment.unwrap();
        assert_eq!(a.animal_types, vec!["rabbit".to_string()]);
        assert!(a.flags.medical);
        assert_eq!(fetched.decision_reason.as_deref(), Some("medical content flagged"));
    }

    #[tokio::test]
    async fn list_by_status_oldest_first() {
        let db = test_db().await;
        let first = insert(&db, "a").await;
        let second = insert(&db, "b").await;
        let other = insert(&db, "c").await;
        db.apply_transition(&transition(
            other.id,
            &[ModerationStatus::Pending],
            ModerationStatus::HumanReview,
        ))
        .await
        .unwrap();

        let pending = db.list_photos(Some(ModerationStatus::Pending), 10, 0).await.unwrap();
        let ids: Vec<Uuid> = pending.iter().map(|p| p.id).collect();
        assert_eq!(ids, vec![first.id, second.id]);

        let page = db.list_photos(None, 1, 1).await.unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].id, second.id);
    }

    #[tokio::test]
    async fn status_counts_include_zeroes() {
        let db = test_db().await;
        insert(&db, "a").await;
        insert(&db, "b").await;

        let counts = db.status_counts().await.unwrap();
        assert_eq!(counts["pending"], 2);
        assert_eq!(counts["featured"], 0);
        assert_eq!(counts.len(), ModerationStatus::ALL.len());
    }

    #[tokio::test]
    async fn stale_analyzing_found() {
        let db = test_db().await;
        let photo = insert(&db, "a").await;
        db.apply_transition(&transition(
            photo.id,
            &[ModerationStatus::Pending],
            ModerationStatus::Analyzing,
        ))
        .await
        .unwrap();

        let future = Utc::now() + chrono::Duration::minutes(1);
        assert_eq!(db.find_stale_analyzing(future).await.unwrap(), vec![(photo.id, 0)]);

        let past = Utc::now() - chrono::Duration::minutes(10);
        assert!(db.find_stale_analyzing(past).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn recent_audit_newest_first() {
        let db = test_db().await;
        let photo = insert(&db, "a").await;
        db.apply_transition(&transition(
            photo.id,
            &[ModerationStatus::Pending],
            ModerationStatus::Analyzing,
        ))
        .await
        .unwrap();

        let recent = db.recent_audit(10).await.unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].to_status, ModerationStatus::Analyzing);
        assert_eq!(db.recent_audit(1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn llm_spend_totals() {
        let db = test_db().await;
        for _ in 0..2 {
            db.record_llm_call(&LlmCallRecord {
                photo_id: Some(Uuid::new_v4()),
                provider: "anthropic",
                model: "claude-sonnet-4",
                input_tokens: 1000,
                output_tokens: 100,
                cost: dec!(0.0045),
                purpose: Some("photo_analysis"),
            })
            .await
            .unwrap();
        }

        let spend = db.get_total_spend().await.unwrap();
        assert_eq!(spend.calls, 2);
        assert_eq!(spend.input_tokens, 2000);
        assert_eq!(spend.output_tokens, 200);
        assert_eq!(spend.total_cost, dec!(0.009));
    }

    #[tokio::test]
    async fn empty_spend_is_zero() {
        let db = test_db().await;
        let spend = db.get_total_spend().await.unwrap();
        assert_eq!(spend.calls, 0);
        assert_eq!(spend.total_cost, Decimal::ZERO);
    }

    #[tokio::test]
    async fn open_local_creates_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let db_path = tmp.path().join("nested").join("moderation.db");
        let db = LibSqlBackend::new_local(&db_path).await.unwrap();
        insert(&db, "a").await;
        assert!(db_path.exists());
    }
}
