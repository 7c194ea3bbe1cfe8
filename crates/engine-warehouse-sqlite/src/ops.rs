//! Write-op constructors: the concrete "function-shaped units of work"
//! handlers submit to a `TxBatchWriter<SqliteTransactor>` (spec.md S4.7).
//!
//! Each constructor bundles everything one handler call needs to persist
//! into a single [`engine_core::WriteOp`] so the whole result lands in
//! exactly one transaction and retries stay idempotent: a re-run deletes
//! and re-inserts the same facet rows rather than accumulating
//! duplicates, and upserts the analysis/embedding rows by their natural
//! key.

use chrono::Utc;
use engine_core::WriteOp;
use sqlx::{Sqlite, Transaction};

#[derive(Debug, Clone)]
pub struct TopicRow {
    pub title: String,
    pub weight: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct EntityRow {
    pub name: String,
    pub entity_kind: Option<String>,
}

#[derive(Debug, Clone)]
pub struct EmotionRow {
    pub label: String,
    pub intensity: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct HumorItemRow {
    pub snippet: String,
    pub humor_kind: Option<String>,
}

/// Upsert a `completed` analysis row plus its facet rows, replacing any
/// facets from a previous attempt at the same (conversation, prompt).
pub fn upsert_analysis_completed(
    conversation_id: impl Into<String>,
    prompt_id: impl Into<String>,
    model_name: impl Into<String>,
    topics: Vec<TopicRow>,
    entities: Vec<EntityRow>,
    emotions: Vec<EmotionRow>,
    humor_items: Vec<HumorItemRow>,
) -> WriteOp<Transaction<'static, Sqlite>> {
    let conversation_id = conversation_id.into();
    let prompt_id = prompt_id.into();
    let model_name = model_name.into();

    Box::new(move |tx: &mut Transaction<'static, Sqlite>| {
        Box::pin(async move {
            let now = Utc::now().to_rfc3339();

            sqlx::query(
                r#"
                INSERT INTO conversation_analyses (conversation_id, prompt_id, status, block_reason, model_name, created_at, updated_at)
                VALUES (?, ?, 'completed', NULL, ?, ?, ?)
                ON CONFLICT(conversation_id, prompt_id) DO UPDATE SET
                    status = 'completed',
                    block_reason = NULL,
                    model_name = excluded.model_name,
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(&conversation_id)
            .bind(&prompt_id)
            .bind(&model_name)
            .bind(&now)
            .bind(&now)
            .execute(&mut **tx)
            .await?;

            sqlx::query("DELETE FROM topics WHERE conversation_id = ? AND prompt_id = ?")
                .bind(&conversation_id)
                .bind(&prompt_id)
                .execute(&mut **tx)
                .await?;
            for topic in &topics {
                sqlx::query(
                    "INSERT INTO topics (conversation_id, prompt_id, title, weight, created_at) VALUES (?, ?, ?, ?, ?)",
                )
                .bind(&conversation_id)
                .bind(&prompt_id)
                .bind(&topic.title)
                .bind(topic.weight)
                .bind(&now)
                .execute(&mut **tx)
                .await?;
            }

            sqlx::query("DELETE FROM entities WHERE conversation_id = ? AND prompt_id = ?")
                .bind(&conversation_id)
                .bind(&prompt_id)
                .execute(&mut **tx)
                .await?;
            for entity in &entities {
                sqlx::query(
                    "INSERT INTO entities (conversation_id, prompt_id, name, entity_kind, created_at) VALUES (?, ?, ?, ?, ?)",
                )
                .bind(&conversation_id)
                .bind(&prompt_id)
                .bind(&entity.name)
                .bind(&entity.entity_kind)
                .bind(&now)
                .execute(&mut **tx)
                .await?;
            }

            sqlx::query("DELETE FROM emotions WHERE conversation_id = ? AND prompt_id = ?")
                .bind(&conversation_id)
                .bind(&prompt_id)
                .execute(&mut **tx)
                .await?;
            for emotion in &emotions {
                sqlx::query(
                    "INSERT INTO emotions (conversation_id, prompt_id, label, intensity, created_at) VALUES (?, ?, ?, ?, ?)",
                )
                .bind(&conversation_id)
                .bind(&prompt_id)
                .bind(&emotion.label)
                .bind(emotion.intensity)
                .bind(&now)
                .execute(&mut **tx)
                .await?;
            }

            sqlx::query("DELETE FROM humor_items WHERE conversation_id = ? AND prompt_id = ?")
                .bind(&conversation_id)
                .bind(&prompt_id)
                .execute(&mut **tx)
                .await?;
            for item in &humor_items {
                sqlx::query(
                    "INSERT INTO humor_items (conversation_id, prompt_id, snippet, humor_kind, created_at) VALUES (?, ?, ?, ?, ?)",
                )
                .bind(&conversation_id)
                .bind(&prompt_id)
                .bind(&item.snippet)
                .bind(&item.humor_kind)
                .bind(&now)
                .execute(&mut **tx)
                .await?;
            }

            Ok(())
        })
    })
}

/// Upsert a `blocked` analysis row (provider content block); no facet
/// rows are written (spec.md S4.7 step 4, S8 scenario 6).
pub fn upsert_analysis_blocked(
    conversation_id: impl Into<String>,
    prompt_id: impl Into<String>,
    reason: impl Into<String>,
) -> WriteOp<Transaction<'static, Sqlite>> {
    let conversation_id = conversation_id.into();
    let prompt_id = prompt_id.into();
    let reason = reason.into();

    Box::new(move |tx: &mut Transaction<'static, Sqlite>| {
        Box::pin(async move {
            let now = Utc::now().to_rfc3339();
            sqlx::query(
                r#"
                INSERT INTO conversation_analyses (conversation_id, prompt_id, status, block_reason, model_name, created_at, updated_at)
                VALUES (?, ?, 'blocked', ?, NULL, ?, ?)
                ON CONFLICT(conversation_id, prompt_id) DO UPDATE SET
                    status = 'blocked',
                    block_reason = excluded.block_reason,
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(&conversation_id)
            .bind(&prompt_id)
            .bind(&reason)
            .bind(&now)
            .bind(&now)
            .execute(&mut **tx)
            .await?;
            Ok(())
        })
    })
}

/// Upsert one embedding row keyed by (entity_type, entity_id, model).
pub fn upsert_embedding(
    entity_type: impl Into<String>,
    entity_id: impl Into<String>,
    model: impl Into<String>,
    vector: Vec<u8>,
) -> WriteOp<Transaction<'static, Sqlite>> {
    let entity_type = entity_type.into();
    let entity_id = entity_id.into();
    let model = model.into();

    Box::new(move |tx: &mut Transaction<'static, Sqlite>| {
        Box::pin(async move {
            let now = Utc::now().to_rfc3339();
            sqlx::query(
                r#"
                INSERT INTO embeddings (entity_type, entity_id, model, vector, created_at, updated_at)
                VALUES (?, ?, ?, ?, ?, ?)
                ON CONFLICT(entity_type, entity_id, model) DO UPDATE SET
                    vector = excluded.vector,
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(&entity_type)
            .bind(&entity_id)
            .bind(&model)
            .bind(&vector)
            .bind(&now)
            .bind(&now)
            .execute(&mut **tx)
            .await?;
            Ok(())
        })
    })
}
