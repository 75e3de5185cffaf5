//! Versioned schema migrations
//!
//! Migrations are embedded SQL, applied in ascending version order inside a
//! transaction each, and recorded in a `_migrations` table. Re-running the
//! runner against an up-to-date store is a no-op.

use crate::store::{StorePool, StoreError, StoreResult};

/// One embedded migration step
struct SqlMigration {
    version: i64,
    name: &'static str,
    up_sql: &'static str,
}

/// Full migration history, ascending
const MIGRATIONS: &[SqlMigration] = &[SqlMigration {
    version: 1,
    name: "initial_schema",
    up_sql: r#"
        CREATE TABLE jobs (
            id               TEXT PRIMARY KEY,
            source_path      TEXT NOT NULL,
            initial_size     INTEGER NOT NULL CHECK (initial_size >= 0),
            source_digest    TEXT,
            required_targets TEXT NOT NULL,
            state            TEXT NOT NULL CHECK (state IN (
                'discovered', 'queued', 'in_progress', 'partial',
                'verified', 'failed', 'quarantined')),
            version          INTEGER NOT NULL CHECK (version > 0),
            created_at       TEXT NOT NULL
        );
        CREATE INDEX idx_jobs_state ON jobs (state);
        CREATE INDEX idx_jobs_source_path ON jobs (source_path);

        CREATE TABLE target_outcomes (
            job_id        TEXT NOT NULL REFERENCES jobs (id) ON DELETE CASCADE,
            target_id     TEXT NOT NULL,
            state         TEXT NOT NULL CHECK (state IN (
                'pending', 'copying', 'copied', 'verifying',
                'verified', 'failed_retryable', 'failed_permanent')),
            attempts      INTEGER NOT NULL CHECK (attempts >= 0),
            target_digest TEXT,
            staging_path  TEXT,
            final_path    TEXT,
            last_error    TEXT,
            updated_at    TEXT NOT NULL,
            PRIMARY KEY (job_id, target_id)
        );
        CREATE INDEX idx_targets_state ON target_outcomes (state);

        CREATE TABLE events (
            sequence  INTEGER PRIMARY KEY AUTOINCREMENT,
            job_id    TEXT NOT NULL,
            kind      TEXT NOT NULL,
            payload   TEXT NOT NULL,
            timestamp TEXT NOT NULL
        );
        CREATE INDEX idx_events_job ON events (job_id);

        CREATE TABLE quarantine (
            id              INTEGER PRIMARY KEY AUTOINCREMENT,
            job_id          TEXT NOT NULL,
            target_id       TEXT NOT NULL,
            reason          TEXT NOT NULL,
            expected_digest TEXT,
            observed_digest TEXT,
            timestamp       TEXT NOT NULL,
            active          INTEGER NOT NULL DEFAULT 1
        );
        CREATE INDEX idx_quarantine_active ON quarantine (active);
    "#,
}];

/// Apply every outstanding migration
pub async fn run_migrations(store: &StorePool) -> StoreResult<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS _migrations (
            version    INTEGER PRIMARY KEY,
            name       TEXT NOT NULL,
            applied_at TEXT NOT NULL
        )
        "#,
    )
    .execute(store.pool())
    .await?;

    let applied: Vec<(i64,)> = sqlx::query_as("SELECT version FROM _migrations")
        .fetch_all(store.pool())
        .await?;
    let applied: std::collections::HashSet<i64> = applied.into_iter().map(|r| r.0).collect();

    for migration in MIGRATIONS {
        if applied.contains(&migration.version) {
            continue;
        }

        log::info!(
            "Applying store migration v{} ({})",
            migration.version,
            migration.name
        );

        let mut tx = store.pool().begin().await?;
        for statement in split_statements(migration.up_sql) {
            sqlx::query(statement).execute(&mut *tx).await.map_err(|e| {
                StoreError::Migration(format!(
                    "migration v{} failed: {}",
                    migration.version, e
                ))
            })?;
        }
        sqlx::query("INSERT INTO _migrations (version, name, applied_at) VALUES (?, ?, ?)")
            .bind(migration.version)
            .bind(migration.name)
            .bind(chrono::Utc::now().to_rfc3339())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
    }

    Ok(())
}

/// Split a migration script into individual statements
fn split_statements(sql: &str) -> impl Iterator<Item = &str> {
    sql.split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty())
}
