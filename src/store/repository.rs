//! Transactional repository over the embedded store
//!
//! All multi-row mutations run inside one transaction so a crash never
//! leaves a job without its target rows or a transition without its audit
//! event. Job updates go through a version-counter compare-and-swap; losing
//! the swap surfaces as [`StoreError::ConcurrencyConflict`], distinct from
//! every other failure.

use crate::model::{
    kind, Job, JobState, QuarantineEntry, ReplicationEvent, TargetOutcome, TargetState,
};
use crate::store::{StoreError, StorePool, StoreResult};
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, Sqlite, Transaction};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Repository handle; cheap to clone
#[derive(Clone)]
pub struct JobStore {
    pool: StorePool,
}

impl JobStore {
    /// Wrap a store pool
    pub fn new(pool: StorePool) -> Self {
        Self { pool }
    }

    /// Underlying pool handle
    pub fn pool(&self) -> &StorePool {
        &self.pool
    }

    // ------------------------------------------------------------------
    // Jobs
    // ------------------------------------------------------------------

    /// Insert a new job with one `Pending` outcome per required target and
    /// a `job.discovered` audit event, in one transaction
    pub async fn insert_job(&self, job: &Job) -> StoreResult<()> {
        let mut tx = self.pool.pool().begin().await?;
        self.insert_job_tx(&mut tx, job).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Insert a new job and immediately enqueue it, in one transaction
    ///
    /// The job is persisted as `Discovered`, transitioned to `Queued`, and
    /// both audit events are appended before the commit. On success the
    /// caller's copy reflects the enqueued state.
    pub async fn insert_job_enqueued(&self, job: &mut Job) -> StoreResult<()> {
        let mut tx = self.pool.pool().begin().await?;
        self.insert_job_tx(&mut tx, job).await?;

        sqlx::query("UPDATE jobs SET state = ?, version = version + 1 WHERE id = ?")
            .bind(JobState::Queued.as_str())
            .bind(&job.id)
            .execute(&mut *tx)
            .await?;
        append_event_tx(
            &mut tx,
            &job.id,
            kind::JOB_STATE_CHANGED,
            serde_json::json!({
                "from": JobState::Discovered.as_str(),
                "to": JobState::Queued.as_str(),
            }),
        )
        .await?;

        tx.commit().await?;
        job.state = JobState::Queued;
        job.version += 1;
        Ok(())
    }

    async fn insert_job_tx(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        job: &Job,
    ) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO jobs
                (id, source_path, initial_size, source_digest, required_targets,
                 state, version, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&job.id)
        .bind(path_text(&job.source_path))
        .bind(job.initial_size as i64)
        .bind(&job.source_digest)
        .bind(serde_json::to_string(&job.required_targets)?)
        .bind(job.state.as_str())
        .bind(job.version)
        .bind(job.created_at.to_rfc3339())
        .execute(&mut **tx)
        .await?;

        for target_id in &job.required_targets {
            let outcome = TargetOutcome::new(&job.id, target_id);
            save_target_tx(tx, &outcome).await?;
        }

        append_event_tx(
            tx,
            &job.id,
            kind::JOB_DISCOVERED,
            serde_json::json!({
                "source_path": path_text(&job.source_path),
                "initial_size": job.initial_size,
                "targets": job.required_targets,
            }),
        )
        .await?;

        Ok(())
    }

    /// Update a job with optimistic concurrency
    ///
    /// The row is matched on (id, version); losing the compare-and-swap
    /// raises [`StoreError::ConcurrencyConflict`]. On success the caller's
    /// copy carries the incremented version. The source digest column is
    /// write-once at the SQL level: a caller holding a stale snapshot can
    /// never null out or replace a digest another worker already set.
    pub async fn update_job_cas(&self, job: &mut Job) -> StoreResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET source_digest = COALESCE(source_digest, ?),
                state = ?,
                version = version + 1
            WHERE id = ? AND version = ?
            "#,
        )
        .bind(&job.source_digest)
        .bind(job.state.as_str())
        .bind(&job.id)
        .bind(job.version)
        .execute(self.pool.pool())
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::ConcurrencyConflict(job.id.clone()));
        }
        job.version += 1;
        Ok(())
    }

    /// Set the source digest if it is still unset; the first setter wins
    ///
    /// Returns true when this call performed the set. When the digest was
    /// already set to the same value, returns false. A different persisted
    /// value raises [`StoreError::DigestConflict`].
    pub async fn set_source_digest_if_unset(
        &self,
        job_id: &str,
        digest: &str,
    ) -> StoreResult<bool> {
        let mut tx = self.pool.pool().begin().await?;

        let result = sqlx::query(
            "UPDATE jobs SET source_digest = ? WHERE id = ? AND source_digest IS NULL",
        )
        .bind(digest)
        .bind(job_id)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 1 {
            append_event_tx(
                &mut tx,
                job_id,
                kind::SOURCE_DIGEST_SET,
                serde_json::json!({ "digest": digest }),
            )
            .await?;
            tx.commit().await?;
            return Ok(true);
        }

        let existing: Option<(Option<String>,)> =
            sqlx::query_as("SELECT source_digest FROM jobs WHERE id = ?")
                .bind(job_id)
                .fetch_optional(&mut *tx)
                .await?;
        tx.commit().await?;

        match existing {
            None => Err(StoreError::NotFound(format!("job {}", job_id))),
            Some((Some(current),)) if current == digest => Ok(false),
            Some((Some(current),)) => Err(StoreError::DigestConflict {
                job_id: job_id.to_string(),
                existing: current,
                attempted: digest.to_string(),
            }),
            // IS NULL update matched nothing yet the column is null: the
            // row vanished between statements
            Some((None,)) => Err(StoreError::ConcurrencyConflict(job_id.to_string())),
        }
    }

    /// Fetch one job
    pub async fn get_job(&self, job_id: &str) -> StoreResult<Option<Job>> {
        let row = sqlx::query("SELECT * FROM jobs WHERE id = ?")
            .bind(job_id)
            .fetch_optional(self.pool.pool())
            .await?;
        row.map(|r| job_from_row(&r)).transpose()
    }

    /// Enumerate jobs in a given state, oldest first
    pub async fn jobs_by_state(&self, state: JobState) -> StoreResult<Vec<Job>> {
        let rows = sqlx::query("SELECT * FROM jobs WHERE state = ? ORDER BY created_at ASC")
            .bind(state.as_str())
            .fetch_all(self.pool.pool())
            .await?;
        rows.iter().map(job_from_row).collect()
    }

    /// Enumerate every job not in a terminal state, oldest first
    pub async fn jobs_non_terminal(&self) -> StoreResult<Vec<Job>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM jobs
            WHERE state NOT IN ('verified', 'failed')
            ORDER BY created_at ASC
            "#,
        )
        .fetch_all(self.pool.pool())
        .await?;
        rows.iter().map(job_from_row).collect()
    }

    /// Count jobs per state
    pub async fn count_jobs_by_state(&self) -> StoreResult<HashMap<JobState, u64>> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT state, COUNT(*) FROM jobs GROUP BY state")
                .fetch_all(self.pool.pool())
                .await?;

        let mut counts = HashMap::new();
        for (tag, count) in rows {
            let state = JobState::from_str(&tag).map_err(StoreError::Corrupt)?;
            counts.insert(state, count as u64);
        }
        Ok(counts)
    }

    /// Whether any non-terminal job references this canonical source path
    pub async fn has_open_job_for_source(&self, source_path: &Path) -> StoreResult<bool> {
        let row: Option<(i64,)> = sqlx::query_as(
            r#"
            SELECT 1 FROM jobs
            WHERE source_path = ? AND state NOT IN ('verified', 'failed')
            LIMIT 1
            "#,
        )
        .bind(path_text(source_path))
        .fetch_optional(self.pool.pool())
        .await?;
        Ok(row.is_some())
    }

    /// Jobs in `InProgress` or `Partial`, each with its target outcomes
    pub async fn recover_in_flight(&self) -> StoreResult<Vec<(Job, Vec<TargetOutcome>)>> {
        let rows = sqlx::query(
            "SELECT * FROM jobs WHERE state IN ('in_progress', 'partial') ORDER BY created_at ASC",
        )
        .fetch_all(self.pool.pool())
        .await?;

        let mut results = Vec::with_capacity(rows.len());
        for row in &rows {
            let job = job_from_row(row)?;
            let targets = self.targets_for_job(&job.id).await?;
            results.push((job, targets));
        }
        Ok(results)
    }

    // ------------------------------------------------------------------
    // Target outcomes
    // ------------------------------------------------------------------

    /// Insert or update a target outcome
    pub async fn save_target(&self, outcome: &TargetOutcome) -> StoreResult<()> {
        let mut tx = self.pool.pool().begin().await?;
        save_target_tx(&mut tx, outcome).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Fetch one target outcome
    pub async fn get_target(
        &self,
        job_id: &str,
        target_id: &str,
    ) -> StoreResult<Option<TargetOutcome>> {
        let row = sqlx::query(
            "SELECT * FROM target_outcomes WHERE job_id = ? AND target_id = ?",
        )
        .bind(job_id)
        .bind(target_id)
        .fetch_optional(self.pool.pool())
        .await?;
        row.map(|r| target_from_row(&r)).transpose()
    }

    /// Enumerate a job's target outcomes in target-id order
    pub async fn targets_for_job(&self, job_id: &str) -> StoreResult<Vec<TargetOutcome>> {
        let rows = sqlx::query(
            "SELECT * FROM target_outcomes WHERE job_id = ? ORDER BY target_id ASC",
        )
        .bind(job_id)
        .fetch_all(self.pool.pool())
        .await?;
        rows.iter().map(target_from_row).collect()
    }

    // ------------------------------------------------------------------
    // Events
    // ------------------------------------------------------------------

    /// Append one audit event; the store assigns the sequence number
    pub async fn append_event(
        &self,
        job_id: &str,
        event_kind: &str,
        payload: serde_json::Value,
    ) -> StoreResult<i64> {
        let mut tx = self.pool.pool().begin().await?;
        let sequence = append_event_tx(&mut tx, job_id, event_kind, payload).await?;
        tx.commit().await?;
        Ok(sequence)
    }

    /// A job's events in ascending sequence order
    pub async fn events_for_job(&self, job_id: &str) -> StoreResult<Vec<ReplicationEvent>> {
        let rows = sqlx::query(
            "SELECT * FROM events WHERE job_id = ? ORDER BY sequence ASC",
        )
        .bind(job_id)
        .fetch_all(self.pool.pool())
        .await?;
        rows.iter().map(event_from_row).collect()
    }

    // ------------------------------------------------------------------
    // Quarantine
    // ------------------------------------------------------------------

    /// Record an integrity failure
    pub async fn insert_quarantine(&self, entry: &QuarantineEntry) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO quarantine
                (job_id, target_id, reason, expected_digest, observed_digest,
                 timestamp, active)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&entry.job_id)
        .bind(&entry.target_id)
        .bind(&entry.reason)
        .bind(&entry.expected_digest)
        .bind(&entry.observed_digest)
        .bind(entry.timestamp.to_rfc3339())
        .bind(entry.active as i64)
        .execute(self.pool.pool())
        .await?;
        Ok(())
    }

    /// Enumerate active quarantine entries, oldest first
    pub async fn active_quarantines(&self) -> StoreResult<Vec<QuarantineEntry>> {
        let rows = sqlx::query(
            "SELECT * FROM quarantine WHERE active = 1 ORDER BY timestamp ASC",
        )
        .fetch_all(self.pool.pool())
        .await?;
        rows.iter().map(quarantine_from_row).collect()
    }

    /// Atomically clear a job's active quarantine entries and requeue it
    ///
    /// The single sanctioned exit from `Quarantined`. Fails with
    /// [`StoreError::NotFound`] when the job has no active entry or is not
    /// quarantined.
    pub async fn release_quarantine(&self, job_id: &str) -> StoreResult<()> {
        let mut tx = self.pool.pool().begin().await?;

        let cleared = sqlx::query(
            "UPDATE quarantine SET active = 0 WHERE job_id = ? AND active = 1",
        )
        .bind(job_id)
        .execute(&mut *tx)
        .await?;
        if cleared.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!(
                "no active quarantine for job {}",
                job_id
            )));
        }

        let requeued = sqlx::query(
            "UPDATE jobs SET state = ?, version = version + 1 WHERE id = ? AND state = ?",
        )
        .bind(JobState::Queued.as_str())
        .bind(job_id)
        .bind(JobState::Quarantined.as_str())
        .execute(&mut *tx)
        .await?;
        if requeued.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!(
                "job {} is not quarantined",
                job_id
            )));
        }

        // Re-arm permanently failed targets so the requeued job can retry
        // them from scratch
        sqlx::query(
            r#"
            UPDATE target_outcomes
            SET state = ?, attempts = 0, staging_path = NULL,
                target_digest = NULL, last_error = NULL, updated_at = ?
            WHERE job_id = ? AND state != ?
            "#,
        )
        .bind(TargetState::Pending.as_str())
        .bind(Utc::now().to_rfc3339())
        .bind(job_id)
        .bind(TargetState::Verified.as_str())
        .execute(&mut *tx)
        .await?;

        append_event_tx(
            &mut tx,
            job_id,
            kind::QUARANTINE_RELEASED,
            serde_json::json!({
                "from": JobState::Quarantined.as_str(),
                "to": JobState::Queued.as_str(),
            }),
        )
        .await?;

        tx.commit().await?;
        Ok(())
    }
}

// ----------------------------------------------------------------------
// Row mapping and shared transaction helpers
// ----------------------------------------------------------------------

fn path_text(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

fn parse_timestamp(text: &str) -> StoreResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(text)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt(format!("bad timestamp {}: {}", text, e)))
}

fn job_from_row(row: &SqliteRow) -> StoreResult<Job> {
    let state_tag: String = row.get("state");
    let targets_json: String = row.get("required_targets");
    let created_at: String = row.get("created_at");
    let initial_size: i64 = row.get("initial_size");

    Ok(Job {
        id: row.get("id"),
        source_path: PathBuf::from(row.get::<String, _>("source_path")),
        initial_size: initial_size as u64,
        source_digest: row.get("source_digest"),
        required_targets: serde_json::from_str(&targets_json)?,
        state: JobState::from_str(&state_tag).map_err(StoreError::Corrupt)?,
        version: row.get("version"),
        created_at: parse_timestamp(&created_at)?,
    })
}

fn target_from_row(row: &SqliteRow) -> StoreResult<TargetOutcome> {
    let state_tag: String = row.get("state");
    let attempts: i64 = row.get("attempts");
    let updated_at: String = row.get("updated_at");

    Ok(TargetOutcome {
        job_id: row.get("job_id"),
        target_id: row.get("target_id"),
        state: TargetState::from_str(&state_tag).map_err(StoreError::Corrupt)?,
        attempts: attempts as u32,
        target_digest: row.get("target_digest"),
        staging_path: row
            .get::<Option<String>, _>("staging_path")
            .map(PathBuf::from),
        final_path: row
            .get::<Option<String>, _>("final_path")
            .map(PathBuf::from),
        last_error: row.get("last_error"),
        updated_at: parse_timestamp(&updated_at)?,
    })
}

fn event_from_row(row: &SqliteRow) -> StoreResult<ReplicationEvent> {
    let payload: String = row.get("payload");
    let timestamp: String = row.get("timestamp");

    Ok(ReplicationEvent {
        sequence: row.get("sequence"),
        job_id: row.get("job_id"),
        kind: row.get("kind"),
        payload: serde_json::from_str(&payload)?,
        timestamp: parse_timestamp(&timestamp)?,
    })
}

fn quarantine_from_row(row: &SqliteRow) -> StoreResult<QuarantineEntry> {
    let timestamp: String = row.get("timestamp");
    let active: i64 = row.get("active");

    Ok(QuarantineEntry {
        job_id: row.get("job_id"),
        target_id: row.get("target_id"),
        reason: row.get("reason"),
        expected_digest: row.get("expected_digest"),
        observed_digest: row.get("observed_digest"),
        timestamp: parse_timestamp(&timestamp)?,
        active: active != 0,
    })
}

async fn save_target_tx(
    tx: &mut Transaction<'_, Sqlite>,
    outcome: &TargetOutcome,
) -> StoreResult<()> {
    sqlx::query(
        r#"
        INSERT INTO target_outcomes
            (job_id, target_id, state, attempts, target_digest, staging_path,
             final_path, last_error, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT (job_id, target_id) DO UPDATE SET
            state = excluded.state,
            attempts = excluded.attempts,
            target_digest = excluded.target_digest,
            staging_path = excluded.staging_path,
            final_path = excluded.final_path,
            last_error = excluded.last_error,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(&outcome.job_id)
    .bind(&outcome.target_id)
    .bind(outcome.state.as_str())
    .bind(outcome.attempts as i64)
    .bind(&outcome.target_digest)
    .bind(outcome.staging_path.as_ref().map(|p| path_text(p)))
    .bind(outcome.final_path.as_ref().map(|p| path_text(p)))
    .bind(&outcome.last_error)
    .bind(outcome.updated_at.to_rfc3339())
    .execute(&mut **tx)
    .await?;
    Ok(())
}

async fn append_event_tx(
    tx: &mut Transaction<'_, Sqlite>,
    job_id: &str,
    event_kind: &str,
    payload: serde_json::Value,
) -> StoreResult<i64> {
    let result = sqlx::query(
        "INSERT INTO events (job_id, kind, payload, timestamp) VALUES (?, ?, ?, ?)",
    )
    .bind(job_id)
    .bind(event_kind)
    .bind(payload.to_string())
    .bind(Utc::now().to_rfc3339())
    .execute(&mut **tx)
    .await?;
    Ok(result.last_insert_rowid())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store() -> JobStore {
        JobStore::new(StorePool::open_in_memory().await.unwrap())
    }

    fn sample_job() -> Job {
        Job::new(
            PathBuf::from("/data/in/scan.dcm"),
            1024,
            vec!["archive".to_string(), "mirror".to_string()],
        )
    }

    #[tokio::test]
    async fn test_insert_creates_targets_and_event() {
        let store = store().await;
        let job = sample_job();
        store.insert_job(&job).await.unwrap();

        let loaded = store.get_job(&job.id).await.unwrap().unwrap();
        assert_eq!(loaded.state, JobState::Discovered);
        assert_eq!(loaded.required_targets, vec!["archive", "mirror"]);

        let targets = store.targets_for_job(&job.id).await.unwrap();
        assert_eq!(targets.len(), 2);
        assert!(targets.iter().all(|t| t.state == TargetState::Pending));

        let events = store.events_for_job(&job.id).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, kind::JOB_DISCOVERED);
    }

    #[tokio::test]
    async fn test_insert_enqueued_lands_in_queued() {
        let store = store().await;
        let mut job = sample_job();
        store.insert_job_enqueued(&mut job).await.unwrap();

        assert_eq!(job.state, JobState::Queued);
        assert_eq!(job.version, 2);

        let loaded = store.get_job(&job.id).await.unwrap().unwrap();
        assert_eq!(loaded.state, JobState::Queued);
        assert_eq!(loaded.version, 2);

        let events = store.events_for_job(&job.id).await.unwrap();
        let kinds: Vec<_> = events.iter().map(|e| e.kind.as_str()).collect();
        assert_eq!(kinds, vec![kind::JOB_DISCOVERED, kind::JOB_STATE_CHANGED]);
        // Sequence numbers ascend
        assert!(events.windows(2).all(|w| w[0].sequence < w[1].sequence));
    }

    #[tokio::test]
    async fn test_cas_conflict_detected() {
        let store = store().await;
        let mut job = sample_job();
        store.insert_job(&mut job).await.unwrap();

        let mut first = store.get_job(&job.id).await.unwrap().unwrap();
        let mut second = first.clone();

        first.state = JobState::Queued;
        store.update_job_cas(&mut first).await.unwrap();

        second.state = JobState::Failed;
        let err = store.update_job_cas(&mut second).await.unwrap_err();
        assert!(matches!(err, StoreError::ConcurrencyConflict(_)));
    }

    #[tokio::test]
    async fn test_source_digest_first_setter_wins() {
        let store = store().await;
        let job = sample_job();
        store.insert_job(&job).await.unwrap();

        let digest_a = "a".repeat(64);
        let digest_b = "b".repeat(64);

        assert!(store
            .set_source_digest_if_unset(&job.id, &digest_a)
            .await
            .unwrap());
        // Same value is an idempotent no-op
        assert!(!store
            .set_source_digest_if_unset(&job.id, &digest_a)
            .await
            .unwrap());
        // A different value is an invariant violation
        let err = store
            .set_source_digest_if_unset(&job.id, &digest_b)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::DigestConflict { .. }));
    }

    #[tokio::test]
    async fn test_open_job_suppresses_same_source() {
        let store = store().await;
        let mut job = sample_job();
        store.insert_job(&mut job).await.unwrap();

        assert!(store
            .has_open_job_for_source(Path::new("/data/in/scan.dcm"))
            .await
            .unwrap());

        let mut loaded = store.get_job(&job.id).await.unwrap().unwrap();
        loaded.state = JobState::Queued;
        store.update_job_cas(&mut loaded).await.unwrap();
        loaded.state = JobState::InProgress;
        store.update_job_cas(&mut loaded).await.unwrap();
        loaded.state = JobState::Failed;
        store.update_job_cas(&mut loaded).await.unwrap();

        // Terminal history no longer suppresses a new job for the path
        assert!(!store
            .has_open_job_for_source(Path::new("/data/in/scan.dcm"))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_cascade_delete_removes_targets() {
        let store = store().await;
        let job = sample_job();
        store.insert_job(&job).await.unwrap();

        sqlx::query("DELETE FROM jobs WHERE id = ?")
            .bind(&job.id)
            .execute(store.pool().pool())
            .await
            .unwrap();

        let targets = store.targets_for_job(&job.id).await.unwrap();
        assert!(targets.is_empty());
    }

    #[tokio::test]
    async fn test_quarantine_release_requeues() {
        let store = store().await;
        let mut job = sample_job();
        store.insert_job(&mut job).await.unwrap();

        let mut loaded = store.get_job(&job.id).await.unwrap().unwrap();
        loaded.state = JobState::Queued;
        store.update_job_cas(&mut loaded).await.unwrap();
        loaded.state = JobState::InProgress;
        store.update_job_cas(&mut loaded).await.unwrap();
        loaded.state = JobState::Quarantined;
        store.update_job_cas(&mut loaded).await.unwrap();

        store
            .insert_quarantine(&QuarantineEntry::mismatch(
                &job.id,
                "mirror",
                "digest mismatch at verify",
                Some("a".repeat(64)),
                Some("b".repeat(64)),
            ))
            .await
            .unwrap();
        assert_eq!(store.active_quarantines().await.unwrap().len(), 1);

        store.release_quarantine(&job.id).await.unwrap();

        assert!(store.active_quarantines().await.unwrap().is_empty());
        let released = store.get_job(&job.id).await.unwrap().unwrap();
        assert_eq!(released.state, JobState::Queued);

        // Releasing again has nothing to release
        assert!(matches!(
            store.release_quarantine(&job.id).await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_counts_by_state() {
        let store = store().await;
        let mut a = sample_job();
        let mut b = sample_job();
        b.source_path = PathBuf::from("/data/in/other.dcm");
        store.insert_job_enqueued(&mut a).await.unwrap();
        store.insert_job(&mut b).await.unwrap();

        let counts = store.count_jobs_by_state().await.unwrap();
        assert_eq!(counts.get(&JobState::Queued), Some(&1));
        assert_eq!(counts.get(&JobState::Discovered), Some(&1));
    }

    #[tokio::test]
    async fn test_recover_in_flight_scope() {
        let store = store().await;
        let mut job = sample_job();
        store.insert_job_enqueued(&mut job).await.unwrap();
        assert!(store.recover_in_flight().await.unwrap().is_empty());

        job.state = JobState::InProgress;
        store.update_job_cas(&mut job).await.unwrap();
        let recovered = store.recover_in_flight().await.unwrap();
        assert_eq!(recovered.len(), 1);
        assert_eq!(recovered[0].1.len(), 2);
    }
}
