//! SQLite-backed implementation of `engine-core`'s [`JobStore`] trait
//! (spec.md S4.1 / S6).
//!
//! Uses WAL journaling and a seconds-scale busy timeout so concurrent
//! claimers absorb lock contention instead of surfacing `SQLITE_BUSY` to
//! the caller. `Claim` and `Release` each run inside a single
//! `BEGIN IMMEDIATE` transaction on one acquired connection, so the
//! update-with-returning pattern is serialized against other claimers on
//! the same database, the SQLite analogue of Postgres's
//! `FOR UPDATE SKIP LOCKED` in `seesaw-job-postgres`.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use engine_core::{backoff, EnqueueOpts, EnqueueResult, Job, JobState, Outcome, OutcomeClass, QueueStats};
use engine_core::JobStore;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Pool, Row, Sqlite};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, warn};

const MIGRATIONS: &str = r#"
CREATE TABLE IF NOT EXISTS jobs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    job_type TEXT NOT NULL,
    key TEXT NOT NULL,
    priority INTEGER NOT NULL DEFAULT 0,
    payload BLOB NOT NULL,
    state TEXT NOT NULL DEFAULT 'pending',
    attempts INTEGER NOT NULL DEFAULT 0,
    max_attempts INTEGER NOT NULL DEFAULT 5,
    lease_owner TEXT,
    lease_expires_at TEXT,
    available_at TEXT NOT NULL,
    last_error TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_jobs_key_nonterminal
    ON jobs(key)
    WHERE state IN ('pending', 'leased');

CREATE INDEX IF NOT EXISTS idx_jobs_claim
    ON jobs(state, available_at, priority, id);
"#;

/// SQLite job queue. One pool backs both claim and release transactions;
/// cap its size conservatively (spec.md S5: "Queue DB connection pool:
/// conservative (e.g. <= 25); SQLite degrades with too many connections").
#[derive(Clone)]
pub struct SqliteJobStore {
    pool: Pool<Sqlite>,
}

impl SqliteJobStore {
    /// Connect (creating the file if absent), enable WAL mode and a
    /// seconds-scale busy timeout, and run migrations.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)
            .with_context(|| format!("parsing sqlite url '{database_url}'"))?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(25)
            .connect_with(options)
            .await
            .context("connecting to queue sqlite database")?;

        sqlx::query(MIGRATIONS)
            .execute(&pool)
            .await
            .context("running queue migrations")?;

        Ok(Self { pool })
    }

    pub fn from_pool(pool: Pool<Sqlite>) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }
}

fn row_to_job(row: SqliteRow) -> Result<Job> {
    let state_str: String = row.try_get("state")?;
    let state = match state_str.as_str() {
        "pending" => JobState::Pending,
        "leased" => JobState::Leased,
        "done" => JobState::Done,
        "dead" => JobState::Dead,
        other => anyhow::bail!("unknown job state '{other}' in row"),
    };
    Ok(Job {
        id: row.try_get("id")?,
        job_type: row.try_get("job_type")?,
        key: row.try_get("key")?,
        priority: row.try_get("priority")?,
        payload: row.try_get("payload")?,
        state,
        attempts: row.try_get("attempts")?,
        max_attempts: row.try_get("max_attempts")?,
        lease_owner: row.try_get("lease_owner")?,
        lease_expires_at: row.try_get::<Option<String>, _>("lease_expires_at")?
            .map(|s| parse_ts(&s))
            .transpose()?,
        available_at: parse_ts(&row.try_get::<String, _>("available_at")?)?,
        last_error: row.try_get("last_error")?,
        created_at: parse_ts(&row.try_get::<String, _>("created_at")?)?,
        updated_at: parse_ts(&row.try_get::<String, _>("updated_at")?)?,
    })
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(s)?.with_timezone(&Utc))
}

fn fmt_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339()
}

#[async_trait]
impl JobStore for SqliteJobStore {
    async fn enqueue(&self, opts: EnqueueOpts) -> Result<EnqueueResult> {
        let now = Utc::now();
        let result = sqlx::query(
            r#"
            INSERT INTO jobs (job_type, key, priority, payload, state, attempts, max_attempts, available_at, created_at, updated_at)
            SELECT ?, ?, ?, ?, 'pending', 0, ?, ?, ?, ?
            WHERE NOT EXISTS (
                SELECT 1 FROM jobs WHERE key = ? AND state IN ('pending', 'leased')
            )
            "#,
        )
        .bind(&opts.job_type)
        .bind(&opts.key)
        .bind(opts.priority)
        .bind(&opts.payload)
        .bind(opts.max_attempts)
        .bind(fmt_ts(now))
        .bind(fmt_ts(now))
        .bind(fmt_ts(now))
        .bind(&opts.key)
        .execute(&self.pool)
        .await
        .context("enqueue insert")?;

        if result.rows_affected() == 0 {
            debug!(key = %opts.key, "enqueue: deduped");
            Ok(EnqueueResult::Deduped)
        } else {
            Ok(EnqueueResult::Ok)
        }
    }

    async fn claim(&self, owner: &str, lease_duration: Duration, limit: i64) -> Result<Vec<Job>> {
        let now = Utc::now();
        let lease_expires_at = now + chrono::Duration::from_std(lease_duration)?;

        let mut conn = self.pool.acquire().await.context("acquiring claim connection")?;
        sqlx::query("BEGIN IMMEDIATE")
            .execute(&mut *conn)
            .await
            .context("begin immediate for claim")?;

        let rows = sqlx::query(
            r#"
            UPDATE jobs
            SET state = 'leased',
                lease_owner = ?,
                lease_expires_at = ?,
                attempts = attempts + 1,
                updated_at = ?
            WHERE id IN (
                SELECT id FROM jobs
                WHERE (state = 'pending' AND available_at <= ?)
                   OR (state = 'leased' AND lease_expires_at < ?)
                ORDER BY priority DESC, available_at ASC, id ASC
                LIMIT ?
            )
            RETURNING *
            "#,
        )
        .bind(owner)
        .bind(fmt_ts(lease_expires_at))
        .bind(fmt_ts(now))
        .bind(fmt_ts(now))
        .bind(fmt_ts(now))
        .bind(limit)
        .fetch_all(&mut *conn)
        .await;

        let rows = match rows {
            Ok(rows) => rows,
            Err(err) => {
                let _ = sqlx::query("ROLLBACK").execute(&mut *conn).await;
                return Err(err).context("claim update-returning");
            }
        };

        sqlx::query("COMMIT")
            .execute(&mut *conn)
            .await
            .context("commit claim transaction")?;

        rows.into_iter().map(row_to_job).collect()
    }

    async fn release(&self, id: i64, outcome: &Outcome) -> Result<()> {
        let now = Utc::now();
        let mut conn = self.pool.acquire().await.context("acquiring release connection")?;
        sqlx::query("BEGIN IMMEDIATE")
            .execute(&mut *conn)
            .await
            .context("begin immediate for release")?;

        let result: Result<()> = async {
            match outcome.class {
                OutcomeClass::Ok => {
                    sqlx::query(
                        "UPDATE jobs SET state = 'done', updated_at = ? WHERE id = ?",
                    )
                    .bind(fmt_ts(now))
                    .bind(id)
                    .execute(&mut *conn)
                    .await?;
                }
                OutcomeClass::Permanent => {
                    sqlx::query(
                        "UPDATE jobs SET state = 'dead', last_error = ?, updated_at = ? WHERE id = ?",
                    )
                    .bind(&outcome.error)
                    .bind(fmt_ts(now))
                    .bind(id)
                    .execute(&mut *conn)
                    .await?;
                }
                OutcomeClass::Transient => {
                    let row = sqlx::query("SELECT attempts, max_attempts FROM jobs WHERE id = ?")
                        .bind(id)
                        .fetch_one(&mut *conn)
                        .await?;
                    let attempts: i32 = row.try_get("attempts")?;
                    let max_attempts: i32 = row.try_get("max_attempts")?;

                    if attempts < max_attempts {
                        let available_at = now + chrono::Duration::from_std(backoff(
                            attempts,
                            Duration::from_secs(1),
                            Duration::from_secs(30),
                        ))?;
                        sqlx::query(
                            r#"
                            UPDATE jobs
                            SET state = 'pending',
                                lease_owner = NULL,
                                lease_expires_at = NULL,
                                available_at = ?,
                                last_error = ?,
                                updated_at = ?
                            WHERE id = ?
                            "#,
                        )
                        .bind(fmt_ts(available_at))
                        .bind(&outcome.error)
                        .bind(fmt_ts(now))
                        .bind(id)
                        .execute(&mut *conn)
                        .await?;
                    } else {
                        sqlx::query(
                            "UPDATE jobs SET state = 'dead', last_error = ?, updated_at = ? WHERE id = ?",
                        )
                        .bind(&outcome.error)
                        .bind(fmt_ts(now))
                        .bind(id)
                        .execute(&mut *conn)
                        .await?;
                    }
                }
            }
            Ok(())
        }
        .await;

        match result {
            Ok(()) => {
                sqlx::query("COMMIT").execute(&mut *conn).await.context("commit release")?;
                Ok(())
            }
            Err(err) => {
                let _ = sqlx::query("ROLLBACK").execute(&mut *conn).await;
                Err(err).context("release transaction")
            }
        }
    }

    async fn heartbeat(&self, id: i64, owner: &str, extension: Duration) -> Result<()> {
        let lease_expires_at = Utc::now() + chrono::Duration::from_std(extension)?;
        let result = sqlx::query(
            "UPDATE jobs SET lease_expires_at = ? WHERE id = ? AND lease_owner = ? AND state = 'leased'",
        )
        .bind(fmt_ts(lease_expires_at))
        .bind(id)
        .bind(owner)
        .execute(&self.pool)
        .await
        .context("heartbeat update")?;

        if result.rows_affected() == 0 {
            warn!(job_id = id, owner, "heartbeat no-op: no longer the lease owner");
        }
        Ok(())
    }

    async fn stats(&self) -> Result<QueueStats> {
        let row = sqlx::query(
            r#"
            SELECT
                SUM(CASE WHEN state = 'pending' THEN 1 ELSE 0 END) AS pending,
                SUM(CASE WHEN state = 'leased' THEN 1 ELSE 0 END) AS leased,
                SUM(CASE WHEN state = 'dead' THEN 1 ELSE 0 END) AS dead,
                SUM(CASE WHEN state = 'done' THEN 1 ELSE 0 END) AS done
            FROM jobs
            "#,
        )
        .fetch_one(&self.pool)
        .await
        .context("queue stats")?;

        Ok(QueueStats {
            pending: row.try_get::<Option<i64>, _>("pending")?.unwrap_or(0),
            leased: row.try_get::<Option<i64>, _>("leased")?.unwrap_or(0),
            dead: row.try_get::<Option<i64>, _>("dead")?.unwrap_or(0),
            done: row.try_get::<Option<i64>, _>("done")?.unwrap_or(0),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn in_memory_store() -> SqliteJobStore {
        SqliteJobStore::connect("sqlite::memory:").await.unwrap()
    }

    #[tokio::test]
    async fn enqueue_dedupes_nonterminal_key() {
        let store = in_memory_store().await;
        let opts = EnqueueOpts::new("analysis", "analysis:conversation:42:convo-all-v1", b"x".to_vec());
        assert_eq!(store.enqueue(opts.clone()).await.unwrap(), EnqueueResult::Ok);
        assert_eq!(store.enqueue(opts).await.unwrap(), EnqueueResult::Deduped);

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.pending, 1);
    }

    #[tokio::test]
    async fn enqueue_after_done_creates_a_new_row() {
        let store = in_memory_store().await;
        let opts = EnqueueOpts::new("analysis", "k1", b"x".to_vec());
        store.enqueue(opts.clone()).await.unwrap();
        let claimed = store.claim("owner-a", Duration::from_secs(30), 10).await.unwrap();
        store.release(claimed[0].id, &Outcome::ok(Duration::ZERO)).await.unwrap();

        assert_eq!(store.enqueue(opts).await.unwrap(), EnqueueResult::Ok);
        let stats = store.stats().await.unwrap();
        assert_eq!(stats.done, 1);
        assert_eq!(stats.pending, 1);
    }

    #[tokio::test]
    async fn claim_orders_by_priority_then_fifo() {
        let store = in_memory_store().await;
        store.enqueue(EnqueueOpts::new("t", "low", b"".to_vec()).with_priority(1)).await.unwrap();
        store.enqueue(EnqueueOpts::new("t", "high", b"".to_vec()).with_priority(10)).await.unwrap();

        let claimed = store.claim("owner", Duration::from_secs(30), 10).await.unwrap();
        assert_eq!(claimed[0].key, "high");
        assert_eq!(claimed[1].key, "low");
    }

    #[tokio::test]
    async fn expired_lease_is_reclaimed_by_next_claim() {
        let store = in_memory_store().await;
        store.enqueue(EnqueueOpts::new("t", "k", b"".to_vec())).await.unwrap();
        let first = store.claim("owner-a", Duration::from_millis(1), 10).await.unwrap();
        assert_eq!(first[0].attempts, 1);

        tokio::time::sleep(Duration::from_millis(20)).await;

        let second = store.claim("owner-b", Duration::from_secs(30), 10).await.unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].attempts, 2);
        assert_eq!(second[0].lease_owner.as_deref(), Some("owner-b"));
    }

    #[tokio::test]
    async fn transient_release_reschedules_with_backoff() {
        let store = in_memory_store().await;
        store
            .enqueue(EnqueueOpts::new("t", "k", b"".to_vec()).with_max_attempts(3))
            .await
            .unwrap();
        let claimed = store.claim("owner", Duration::from_secs(30), 10).await.unwrap();
        store
            .release(claimed[0].id, &Outcome::transient("flaky", Duration::ZERO))
            .await
            .unwrap();

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.pending, 1);
    }

    #[tokio::test]
    async fn exhausted_retries_go_dead() {
        let store = in_memory_store().await;
        store
            .enqueue(EnqueueOpts::new("t", "k", b"".to_vec()).with_max_attempts(1))
            .await
            .unwrap();
        let claimed = store.claim("owner", Duration::from_secs(30), 10).await.unwrap();
        store
            .release(claimed[0].id, &Outcome::transient("flaky", Duration::ZERO))
            .await
            .unwrap();

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.dead, 1);
    }

    #[tokio::test]
    async fn heartbeat_extends_lease_and_is_idempotent_when_not_owner() {
        let store = in_memory_store().await;
        store.enqueue(EnqueueOpts::new("t", "k", b"".to_vec())).await.unwrap();
        let claimed = store.claim("owner-a", Duration::from_secs(5), 10).await.unwrap();

        store
            .heartbeat(claimed[0].id, "owner-a", Duration::from_secs(60))
            .await
            .unwrap();
        // Not the owner: should not error, just no-op.
        store
            .heartbeat(claimed[0].id, "owner-b", Duration::from_secs(60))
            .await
            .unwrap();
    }
}
