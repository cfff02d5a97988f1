//! Version-tracked database migrations for the libSQL backend.
//!
//! Each migration has a version number and SQL. `run_migrations()` checks
//! the current version and applies only the new ones sequentially.

use libsql::Connection;

use crate::error::DatabaseError;

/// A single migration step.
struct Migration {
    version: i64,
    name: &'static str,
    sql: &'static str,
}

/// All migrations in order. Add new versions to the end.
static MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "initial_schema",
        sql: r#"
            CREATE TABLE IF NOT EXISTS photos (
                id TEXT PRIMARY KEY,
                uploader TEXT NOT NULL,
                image_ref TEXT NOT NULL,
                caption TEXT,
                status TEXT NOT NULL DEFAULT 'pending',
                assessment TEXT,
                decision_reason TEXT,
                rejection_reason TEXT,
                reviewed_by TEXT,
                analysis_attempts INTEGER NOT NULL DEFAULT 0,
                last_error TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_photos_status ON photos(status);
            CREATE INDEX IF NOT EXISTS idx_photos_uploader ON photos(uploader);
            CREATE INDEX IF NOT EXISTS idx_photos_created ON photos(created_at);

            CREATE TABLE IF NOT EXISTS moderation_audit (
                id TEXT PRIMARY KEY,
                photo_id TEXT NOT NULL REFERENCES photos(id) ON DELETE CASCADE,
                from_status TEXT,
                to_status TEXT NOT NULL,
                actor TEXT NOT NULL,
                actor_kind TEXT NOT NULL,
                note TEXT,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_audit_photo ON moderation_audit(photo_id);
            CREATE INDEX IF NOT EXISTS idx_audit_created ON moderation_audit(created_at);
        "#,
    },
    Migration {
        version: 2,
        name: "llm_call_tracking",
        sql: r#"
            CREATE TABLE IF NOT EXISTS llm_calls (
                id TEXT PRIMARY KEY,
                photo_id TEXT,
                provider TEXT NOT NULL,
                model TEXT NOT NULL,
                input_tokens INTEGER NOT NULL,
                output_tokens INTEGER NOT NULL,
                cost TEXT NOT NULL,
                purpose TEXT,
                created_at TEXT NOT NULL DEFAULT (datetime('now'))
            );
            CREATE INDEX IF NOT EXISTS idx_llm_calls_photo ON llm_calls(photo_id);
            CREATE INDEX IF NOT EXISTS idx_llm_calls_created ON llm_calls(created_at);
        "#,
    },
];

/// Run all pending migrations against the given connection.
///
/// Creates the `_migrations` table if it doesn't exist.
pub async fn run_migrations(conn: &Connection) -> Result<(), DatabaseError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        (),
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("Failed to create _migrations table: {e}")))?;

    let current_version = get_current_version(conn).await?;

    for migration in MIGRATIONS.iter().filter(|m| m.version > current_version) {
        tracing::info!(
            version = migration.version,
            name = migration.name,
            "Applying migration"
        );
        apply(conn, migration).await?;
    }

    let version = get_current_version(conn).await?;
    tracing::info!(version, "Database migrations complete");
    Ok(())
}

/// Run one migration and record its version in a single transaction.
async fn apply(conn: &Connection, migration: &Migration) -> Result<(), DatabaseError> {
    let failed = |e: libsql::Error| {
        DatabaseError::Migration(format!(
            "Migration V{} ({}) failed: {e}",
            migration.version, migration.name
        ))
    };

    let tx = conn.transaction().await.map_err(failed)?;
    if let Err(e) = tx.execute_batch(migration.sql).await {
        let _ = tx.rollback().await;
        return Err(failed(e));
    }
    if let Err(e) = seed_version(&tx, migration.version, migration.name).await {
        let _ = tx.rollback().await;
        return Err(e);
    }
    tx.commit().await.map_err(failed)
}

/// Get the highest applied migration version, or 0 if none.
async fn get_current_version(conn: &Connection) -> Result<i64, DatabaseError> {
    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM _migrations", ())
        .await
        .map_err(|e| DatabaseError::Migration(format!("Failed to query migration version: {e}")))?;

    let row = rows
        .next()
        .await
        .map_err(|e| DatabaseError::Migration(format!("Failed to read migration version: {e}")))?;

    match row {
        Some(row) => row.get::<i64>(0).map_err(|e| {
            DatabaseError::Migration(format!("Failed to parse migration version: {e}"))
        }),
        None => Ok(0),
    }
}

/// Insert a version record into `_migrations`.
async fn seed_version(conn: &Connection, version: i64, name: &str) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT OR IGNORE INTO _migrations (version, name) VALUES (?1, ?2)",
        libsql::params![version, name],
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("Failed to record migration V{version}: {e}")))?;
    Ok(())
}
