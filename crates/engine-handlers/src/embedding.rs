//! Embedding job handler: one provider call produces one vector,
//! upserted keyed by (entity_type, entity_id, model) (spec.md S4.7).

use crate::embedding_source::{resolve_input_text, EmbeddingSource};
use crate::vector::encode_vector;
use async_trait::async_trait;
use engine_core::{Cancellation, Categorizable, Handler, HandlerError, Job, TxBatchWriter};
use engine_provider::{EmbedContentRequest, ProviderClient};
use engine_warehouse_sqlite::{upsert_embedding, SqliteTransactor};
use serde::Deserialize;
use std::sync::Arc;

#[derive(Debug, Deserialize)]
struct EmbeddingPayload {
    entity_type: String,
    entity_id: String,
}

/// Single-vector embedding: decode -> derive input text -> call -> encode
/// -> persist (spec.md S4.7).
pub struct EmbeddingHandler {
    provider: Arc<dyn ProviderClient>,
    source: Arc<dyn EmbeddingSource>,
    writer: Arc<TxBatchWriter<SqliteTransactor>>,
    model: String,
}

impl EmbeddingHandler {
    pub fn new(
        provider: Arc<dyn ProviderClient>,
        source: Arc<dyn EmbeddingSource>,
        writer: Arc<TxBatchWriter<SqliteTransactor>>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            provider,
            source,
            writer,
            model: model.into(),
        }
    }
}

#[async_trait]
impl Handler for EmbeddingHandler {
    async fn handle(&self, cancellation: Cancellation, job: &Job) -> Result<(), HandlerError> {
        let payload: EmbeddingPayload = serde_json::from_slice(&job.payload)
            .map_err(|err| HandlerError::permanent(format!("invalid embedding payload: {err}")))?;

        let input = self
            .source
            .text_for(&payload.entity_type, &payload.entity_id)
            .await?;
        let text = resolve_input_text(input)?;

        let response = self
            .provider
            .embed_content(
                EmbedContentRequest {
                    model: self.model.clone(),
                    text,
                },
                cancellation,
            )
            .await
            .map_err(|err| HandlerError {
                class: err.class(),
                message: err.to_string(),
            })?;

        let blob = encode_vector(&response.values);
        let op = upsert_embedding(payload.entity_type, payload.entity_id, self.model.clone(), blob);
        self.writer
            .submit(op)
            .await
            .wait()
            .await
            .map_err(|err| HandlerError::transient(err.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding_source::EmbeddingInput;
    use engine_core::{BatchConfig, JobState};
    use engine_provider::ProviderError;
    use engine_testing::FakeProviderClient;

    struct StaticSource(EmbeddingInput);

    #[async_trait]
    impl EmbeddingSource for StaticSource {
        async fn text_for(&self, _entity_type: &str, _entity_id: &str) -> Result<EmbeddingInput, HandlerError> {
            Ok(self.0.clone())
        }
    }

    struct MissingSource;

    #[async_trait]
    impl EmbeddingSource for MissingSource {
        async fn text_for(&self, _entity_type: &str, _entity_id: &str) -> Result<EmbeddingInput, HandlerError> {
            Err(HandlerError::permanent("entity not found"))
        }
    }

    fn job_with_payload(payload: serde_json::Value) -> Job {
        Job {
            id: 1,
            job_type: "embedding".into(),
            key: "embedding:topic:1:model-a".into(),
            priority: 0,
            payload: serde_json::to_vec(&payload).unwrap(),
            state: JobState::Leased,
            attempts: 1,
            max_attempts: 3,
            lease_owner: Some("owner".into()),
            lease_expires_at: Some(chrono::Utc::now() + chrono::Duration::seconds(30)),
            available_at: chrono::Utc::now(),
            last_error: None,
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
        }
    }

    async fn memory_writer() -> (Arc<TxBatchWriter<SqliteTransactor>>, SqliteTransactor) {
        let transactor = SqliteTransactor::connect("sqlite::memory:", 4).await.unwrap();
        let writer = Arc::new(TxBatchWriter::new(transactor.clone(), BatchConfig::default()));
        (writer, transactor)
    }

    #[tokio::test]
    async fn missing_source_is_permanent() {
        let (writer, _transactor) = memory_writer().await;
        let handler = EmbeddingHandler::new(
            Arc::new(FakeProviderClient::always_success()),
            Arc::new(MissingSource),
            writer,
            "model-a",
        );
        let job = job_with_payload(serde_json::json!({"entity_type": "topic", "entity_id": "1"}));
        let err = handler.handle(Cancellation::new(), &job).await.unwrap_err();
        assert_eq!(err.class, engine_core::ErrorClass::Permanent);
    }

    #[tokio::test]
    async fn successful_embedding_upserts_vector_row() {
        let provider = FakeProviderClient::new();
        provider.push_embed_response(engine_provider::EmbedContentResponse {
            values: vec![0.1, 0.2, 0.3],
        });
        let (writer, transactor) = memory_writer().await;
        let handler = EmbeddingHandler::new(
            Arc::new(provider),
            Arc::new(StaticSource(EmbeddingInput::PlainText("rust programming".into()))),
            writer,
            "model-a",
        );
        let job = job_with_payload(serde_json::json!({"entity_type": "topic", "entity_id": "42"}));
        handler.handle(Cancellation::new(), &job).await.unwrap();

        let row: (Vec<u8>,) = sqlx::query_as(
            "SELECT vector FROM embeddings WHERE entity_type = 'topic' AND entity_id = '42' AND model = 'model-a'",
        )
        .fetch_one(transactor.pool())
        .await
        .unwrap();
        assert_eq!(row.0.len(), 12);
    }

    #[tokio::test]
    async fn transient_provider_error_propagates_as_transient() {
        let provider = FakeProviderClient::new();
        provider.push_embed_error(ProviderError::Timeout);
        let (writer, _transactor) = memory_writer().await;
        let handler = EmbeddingHandler::new(
            Arc::new(provider),
            Arc::new(StaticSource(EmbeddingInput::PlainText("x".into()))),
            writer,
            "model-a",
        );
        let job = job_with_payload(serde_json::json!({"entity_type": "topic", "entity_id": "1"}));
        let err = handler.handle(Cancellation::new(), &job).await.unwrap_err();
        assert_eq!(err.class, engine_core::ErrorClass::Transient);
    }
}
