//! SQLite-backed `Transactor` and warehouse write-op constructors
//! (spec.md S4.5 / S6).
//!
//! The warehouse has exactly one writer by construction: every op built
//! here is run by `engine_core::TxBatchWriter<SqliteTransactor>`'s single
//! background task, one batch transaction at a time. This crate only
//! ships `CREATE TABLE IF NOT EXISTS` migrations so it is runnable
//! standalone (tests, the demo binary); it is not the schema authority —
//! the real warehouse schema belongs to the ETL (spec.md S1 Out of
//! scope), and these statements must not diverge from it in production.

mod ops;

pub use ops::{
    upsert_analysis_blocked, upsert_analysis_completed, upsert_embedding, EmotionRow, EntityRow,
    HumorItemRow, TopicRow,
};

use anyhow::{Context, Result};
use async_trait::async_trait;
use engine_core::Transactor;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, Sqlite, Transaction};
use std::str::FromStr;
use std::time::Duration;

const MIGRATIONS: &str = r#"
CREATE TABLE IF NOT EXISTS conversation_analyses (
    conversation_id TEXT NOT NULL,
    prompt_id TEXT NOT NULL,
    status TEXT NOT NULL,
    block_reason TEXT,
    model_name TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (conversation_id, prompt_id)
);

CREATE TABLE IF NOT EXISTS topics (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    conversation_id TEXT NOT NULL,
    prompt_id TEXT NOT NULL,
    title TEXT NOT NULL,
    weight REAL,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_topics_conv_prompt ON topics(conversation_id, prompt_id);

CREATE TABLE IF NOT EXISTS entities (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    conversation_id TEXT NOT NULL,
    prompt_id TEXT NOT NULL,
    name TEXT NOT NULL,
    entity_kind TEXT,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_entities_conv_prompt ON entities(conversation_id, prompt_id);

CREATE TABLE IF NOT EXISTS emotions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    conversation_id TEXT NOT NULL,
    prompt_id TEXT NOT NULL,
    label TEXT NOT NULL,
    intensity REAL,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_emotions_conv_prompt ON emotions(conversation_id, prompt_id);

CREATE TABLE IF NOT EXISTS humor_items (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    conversation_id TEXT NOT NULL,
    prompt_id TEXT NOT NULL,
    snippet TEXT NOT NULL,
    humor_kind TEXT,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_humor_items_conv_prompt ON humor_items(conversation_id, prompt_id);

CREATE TABLE IF NOT EXISTS embeddings (
    entity_type TEXT NOT NULL,
    entity_id TEXT NOT NULL,
    model TEXT NOT NULL,
    vector BLOB NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (entity_type, entity_id, model)
);
"#;

/// Opens and commits `'static` SQLite transactions for
/// `engine_core::TxBatchWriter`.
#[derive(Clone)]
pub struct SqliteTransactor {
    pool: Pool<Sqlite>,
}

impl SqliteTransactor {
    /// Connect (creating the file if absent), enable WAL mode, and run
    /// migrations. Pool size scales with worker count in the caller but
    /// is capped (spec.md S5: "Warehouse DB connection pool: scales with
    /// worker count but capped, implementation note ~<= 256").
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)
            .with_context(|| format!("parsing sqlite url '{database_url}'"))?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections.min(256))
            .connect_with(options)
            .await
            .context("connecting to warehouse sqlite database")?;

        sqlx::query(MIGRATIONS)
            .execute(&pool)
            .await
            .context("running warehouse migrations")?;

        Ok(Self { pool })
    }

    pub fn from_pool(pool: Pool<Sqlite>) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }
}

#[async_trait]
impl Transactor for SqliteTransactor {
    type Tx = Transaction<'static, Sqlite>;

    async fn begin(&self) -> Result<Self::Tx> {
        self.pool.begin().await.context("beginning warehouse transaction")
    }

    async fn commit(&self, tx: Self::Tx) -> Result<()> {
        tx.commit().await.context("committing warehouse transaction")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use engine_core::TxBatchWriter;

    #[tokio::test]
    async fn migrations_are_idempotent_and_runnable_standalone() {
        let transactor = SqliteTransactor::connect("sqlite::memory:", 4).await.unwrap();
        // Running again against the same pool must not error.
        sqlx::query(MIGRATIONS).execute(transactor.pool()).await.unwrap();
    }

    #[tokio::test]
    async fn completed_analysis_write_op_commits() {
        let transactor = SqliteTransactor::connect("sqlite::memory:", 4).await.unwrap();
        let writer = TxBatchWriter::new(transactor.clone(), engine_core::BatchConfig::default());

        let op = upsert_analysis_completed(
            "conv-1",
            "prompt-1",
            "gemini-pro",
            vec![TopicRow { title: "rust".into(), weight: Some(0.9) }],
            vec![],
            vec![],
            vec![],
        );
        writer.submit(op).await.wait().await.unwrap();
        writer.close().await;

        let row: (String,) = sqlx::query_as("SELECT status FROM conversation_analyses WHERE conversation_id = 'conv-1'")
            .fetch_one(transactor.pool())
            .await
            .unwrap();
        assert_eq!(row.0, "completed");

        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM topics WHERE conversation_id = 'conv-1'")
            .fetch_one(transactor.pool())
            .await
            .unwrap();
        assert_eq!(count.0, 1);
    }
}
