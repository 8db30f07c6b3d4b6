//! SQLite-backed store: persistent state plus the atomic claim/settle
//! primitives every other component builds on.
//!
//! A single-connection pool in WAL mode with a generous busy timeout keeps
//! in-process access serialized while separate worker processes contend on
//! the engine's writer lock. The claim statement is the only contended
//! path; it is a single conditional `UPDATE ... RETURNING`, so exactly one
//! actor can win a given row.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};

use crate::config::{keys, Settings};
use crate::error::{QueueError, Result};
use crate::job::{unix_now, Job, JobState, WorkerInfo};

const BUSY_TIMEOUT: Duration = Duration::from_secs(30);

/// Handle to the queue database. Cheap to clone; clones share the pool.
#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Open (creating if missing) the database at `path` and ensure the
    /// schema and default config exist.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(BUSY_TIMEOUT);

        // SQLite allows one writer; a single connection avoids in-process
        // writer contention entirely.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(|e| QueueError::Storage(format!("failed to open database: {e}")))?;

        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    /// Open an in-memory database (useful for testing).
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::new().in_memory(true);

        // The whole database lives in the one connection; never let the
        // pool recycle it.
        let pool = SqlitePoolOptions::new()
            .min_connections(1)
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .map_err(|e| QueueError::Storage(format!("failed to open in-memory database: {e}")))?;

        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS jobs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                command TEXT NOT NULL,
                state TEXT NOT NULL DEFAULT 'pending',
                attempts INTEGER NOT NULL DEFAULT 0,
                max_retries INTEGER NOT NULL DEFAULT 3,
                next_run_at INTEGER NOT NULL DEFAULT 0,
                claimed_by TEXT,
                claimed_at INTEGER,
                lease_deadline INTEGER,
                last_error TEXT,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| QueueError::Storage(format!("failed to create jobs table: {e}")))?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_jobs_claim ON jobs (state, next_run_at, id)",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| QueueError::Storage(format!("failed to create claim index: {e}")))?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_jobs_state ON jobs (state)")
            .execute(&self.pool)
            .await
            .map_err(|e| QueueError::Storage(format!("failed to create state index: {e}")))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS workers (
                worker_id TEXT PRIMARY KEY,
                pid INTEGER NOT NULL,
                started_at INTEGER NOT NULL,
                last_heartbeat INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| QueueError::Storage(format!("failed to create workers table: {e}")))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS config (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| QueueError::Storage(format!("failed to create config table: {e}")))?;

        for (key, value) in Settings::seed_defaults() {
            sqlx::query("INSERT OR IGNORE INTO config (key, value) VALUES (?1, ?2)")
                .bind(key)
                .bind(value)
                .execute(&self.pool)
                .await
                .map_err(|e| QueueError::Storage(format!("failed to seed config: {e}")))?;
        }

        Ok(())
    }

    // ---------- jobs ----------

    /// Insert a new pending job and return its identity.
    ///
    /// `max_retries` falls back to the configured `default_max_retries`.
    pub async fn enqueue(&self, command: &str, max_retries: Option<i64>) -> Result<i64> {
        if command.trim().is_empty() {
            return Err(QueueError::InvalidInput(
                "command must not be empty".to_string(),
            ));
        }
        let max_retries = match max_retries {
            Some(n) if n >= 0 => n,
            Some(n) => {
                return Err(QueueError::InvalidInput(format!(
                    "max retries must be non-negative, got {n}"
                )))
            }
            None => {
                let cfg = self.config_all().await?;
                Settings::from_map(&cfg).default_max_retries
            }
        };

        let now = unix_now();
        let result = sqlx::query(
            r#"
            INSERT INTO jobs (command, state, attempts, max_retries, next_run_at, created_at, updated_at)
            VALUES (?1, 'pending', 0, ?2, ?3, ?3, ?3)
            "#,
        )
        .bind(command)
        .bind(max_retries)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| QueueError::Storage(format!("failed to enqueue job: {e}")))?;

        Ok(result.last_insert_rowid())
    }

    /// Atomically claim the next due job for `worker_id`, or nothing.
    ///
    /// Eligible rows are pending jobs whose `next_run_at` has passed and
    /// running jobs whose lease expired (crashed or stuck owner). The
    /// oldest `next_run_at` wins, ties broken by ascending id. The whole
    /// transition is one conditional `UPDATE ... RETURNING`, so under
    /// concurrent claimers exactly one gets the row; the losers simply see
    /// no result.
    pub async fn claim_one(
        &self,
        worker_id: &str,
        now: i64,
        lease_duration: Duration,
    ) -> Result<Option<Job>> {
        let deadline = now + lease_duration.as_secs() as i64;
        let job = sqlx::query_as::<_, Job>(
            r#"
            UPDATE jobs
            SET state = 'running',
                claimed_by = ?1,
                claimed_at = ?2,
                lease_deadline = ?3,
                updated_at = ?2
            WHERE id = (
                SELECT id FROM jobs
                WHERE (state = 'pending' AND next_run_at <= ?2)
                   OR (state = 'running' AND lease_deadline <= ?2)
                ORDER BY next_run_at ASC, id ASC
                LIMIT 1
            )
            RETURNING id, command, state, attempts, max_retries, next_run_at,
                      claimed_by, claimed_at, lease_deadline, last_error,
                      created_at, updated_at
            "#,
        )
        .bind(worker_id)
        .bind(now)
        .bind(deadline)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| QueueError::Storage(format!("failed to claim job: {e}")))?;

        Ok(job)
    }

    /// Transition `running -> completed`, guarded on ownership.
    ///
    /// Counts the successful execution in `attempts` and clears the lease.
    pub async fn settle_success(&self, job_id: i64, worker_id: &str) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET state = 'completed',
                attempts = attempts + 1,
                claimed_by = NULL,
                claimed_at = NULL,
                lease_deadline = NULL,
                updated_at = ?1
            WHERE id = ?2 AND state = 'running' AND claimed_by = ?3
            "#,
        )
        .bind(unix_now())
        .bind(job_id)
        .bind(worker_id)
        .execute(&self.pool)
        .await
        .map_err(|e| QueueError::Storage(format!("failed to settle job {job_id}: {e}")))?;

        if result.rows_affected() == 0 {
            return Err(QueueError::LeaseStolen(job_id));
        }
        Ok(())
    }

    /// Record a failed execution, guarded on ownership.
    ///
    /// Increments `attempts`, stores the diagnostic and moves the job to
    /// `pending` (eligible at `next_run_at`) or to `dlq`. Returns the
    /// updated attempt count.
    pub async fn settle_failure(
        &self,
        job_id: i64,
        worker_id: &str,
        error: &str,
        next_run_at: i64,
        to_dlq: bool,
    ) -> Result<i64> {
        let state = if to_dlq {
            JobState::Dlq
        } else {
            JobState::Pending
        };
        let attempts = sqlx::query_as::<_, (i64,)>(
            r#"
            UPDATE jobs
            SET state = ?1,
                attempts = attempts + 1,
                last_error = ?2,
                next_run_at = ?3,
                claimed_by = NULL,
                claimed_at = NULL,
                lease_deadline = NULL,
                updated_at = ?4
            WHERE id = ?5 AND state = 'running' AND claimed_by = ?6
            RETURNING attempts
            "#,
        )
        .bind(state)
        .bind(error)
        .bind(next_run_at)
        .bind(unix_now())
        .bind(job_id)
        .bind(worker_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| QueueError::Storage(format!("failed to settle job {job_id}: {e}")))?;

        match attempts {
            Some((attempts,)) => Ok(attempts),
            None => Err(QueueError::LeaseStolen(job_id)),
        }
    }

    /// Extend the lease on a running job. Returns false (a no-op) if the
    /// claim has been stolen in the meantime.
    pub async fn extend_lease(
        &self,
        job_id: i64,
        worker_id: &str,
        new_deadline: i64,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET lease_deadline = ?1, updated_at = ?2
            WHERE id = ?3 AND state = 'running' AND claimed_by = ?4
            "#,
        )
        .bind(new_deadline)
        .bind(unix_now())
        .bind(job_id)
        .bind(worker_id)
        .execute(&self.pool)
        .await
        .map_err(|e| QueueError::Storage(format!("failed to extend lease on job {job_id}: {e}")))?;

        Ok(result.rows_affected() > 0)
    }

    /// Fetch a single job by id.
    pub async fn get_job(&self, job_id: i64) -> Result<Option<Job>> {
        sqlx::query_as::<_, Job>("SELECT * FROM jobs WHERE id = ?1")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| QueueError::Storage(format!("failed to fetch job {job_id}: {e}")))
    }

    /// List jobs, newest first, optionally filtered by state.
    pub async fn list(&self, state: Option<JobState>, limit: i64) -> Result<Vec<Job>> {
        let jobs = match state {
            Some(state) => {
                sqlx::query_as::<_, Job>(
                    "SELECT * FROM jobs WHERE state = ?1 ORDER BY id DESC LIMIT ?2",
                )
                .bind(state)
                .bind(limit)
                .fetch_all(&self.pool)
                .await
            }
            None => {
                sqlx::query_as::<_, Job>("SELECT * FROM jobs ORDER BY id DESC LIMIT ?1")
                    .bind(limit)
                    .fetch_all(&self.pool)
                    .await
            }
        }
        .map_err(|e| QueueError::Storage(format!("failed to list jobs: {e}")))?;

        Ok(jobs)
    }

    /// Per-state job counts.
    pub async fn counts_by_state(&self) -> Result<BTreeMap<String, i64>> {
        let rows = sqlx::query_as::<_, (String, i64)>(
            "SELECT state, COUNT(*) FROM jobs GROUP BY state",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| QueueError::Storage(format!("failed to count jobs: {e}")))?;

        Ok(rows.into_iter().collect())
    }

    /// Re-enqueue a dead-lettered job: back to `pending`, attempts reset,
    /// eligible immediately. Rejected if the row is not in the DLQ.
    pub async fn dlq_retry(&self, job_id: i64) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET state = 'pending',
                attempts = 0,
                claimed_by = NULL,
                claimed_at = NULL,
                lease_deadline = NULL,
                next_run_at = ?1,
                updated_at = ?1
            WHERE id = ?2 AND state = 'dlq'
            "#,
        )
        .bind(unix_now())
        .bind(job_id)
        .execute(&self.pool)
        .await
        .map_err(|e| QueueError::Storage(format!("failed to retry job {job_id}: {e}")))?;

        if result.rows_affected() == 0 {
            return Err(QueueError::NotInDlq(job_id));
        }
        Ok(())
    }

    // ---------- config ----------

    pub async fn config_get(&self, key: &str) -> Result<Option<String>> {
        let row = sqlx::query_as::<_, (String,)>("SELECT value FROM config WHERE key = ?1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| QueueError::Storage(format!("failed to read config: {e}")))?;
        Ok(row.map(|(value,)| value))
    }

    pub async fn config_set(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO config (key, value) VALUES (?1, ?2)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value
            "#,
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await
        .map_err(|e| QueueError::Storage(format!("failed to write config: {e}")))?;
        Ok(())
    }

    /// The whole config table. Workers read this once per poll tick.
    pub async fn config_all(&self) -> Result<HashMap<String, String>> {
        let rows = sqlx::query_as::<_, (String, String)>("SELECT key, value FROM config")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| QueueError::Storage(format!("failed to read config: {e}")))?;
        Ok(rows.into_iter().collect())
    }

    /// Raise the stop flag observed by all workers between jobs.
    pub async fn request_stop(&self) -> Result<()> {
        self.config_set(keys::WORKERS_STOP, "1").await
    }

    /// Clear a stale stop flag (done by the pool on boot).
    pub async fn clear_stop(&self) -> Result<()> {
        self.config_set(keys::WORKERS_STOP, "0").await
    }

    // ---------- workers ----------

    /// Register a worker. Upsert, so a restarted worker reusing an id
    /// replaces its stale row.
    pub async fn register_worker(&self, worker_id: &str, pid: u32) -> Result<()> {
        let now = unix_now();
        sqlx::query(
            r#"
            INSERT INTO workers (worker_id, pid, started_at, last_heartbeat)
            VALUES (?1, ?2, ?3, ?3)
            ON CONFLICT(worker_id) DO UPDATE SET
                pid = excluded.pid,
                started_at = excluded.started_at,
                last_heartbeat = excluded.last_heartbeat
            "#,
        )
        .bind(worker_id)
        .bind(pid as i64)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| QueueError::Storage(format!("failed to register worker: {e}")))?;
        Ok(())
    }

    pub async fn unregister_worker(&self, worker_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM workers WHERE worker_id = ?1")
            .bind(worker_id)
            .execute(&self.pool)
            .await
            .map_err(|e| QueueError::Storage(format!("failed to unregister worker: {e}")))?;
        Ok(())
    }

    /// Refresh a worker's heartbeat timestamp.
    pub async fn touch_worker(&self, worker_id: &str) -> Result<()> {
        sqlx::query("UPDATE workers SET last_heartbeat = ?1 WHERE worker_id = ?2")
            .bind(unix_now())
            .bind(worker_id)
            .execute(&self.pool)
            .await
            .map_err(|e| QueueError::Storage(format!("failed to touch worker: {e}")))?;
        Ok(())
    }

    pub async fn workers_list(&self) -> Result<Vec<WorkerInfo>> {
        sqlx::query_as::<_, WorkerInfo>(
            "SELECT worker_id, pid, started_at, last_heartbeat FROM workers ORDER BY worker_id",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| QueueError::Storage(format!("failed to list workers: {e}")))
    }

    pub async fn workers_count(&self) -> Result<i64> {
        let row = sqlx::query_as::<_, (i64,)>("SELECT COUNT(*) FROM workers")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| QueueError::Storage(format!("failed to count workers: {e}")))?;
        Ok(row.0)
    }
}
