//! Analysis job handler: one provider call produces one conversation
//! analysis, persisted as an upsert plus facet rows (spec.md S4.7).

use crate::prompt::PromptCompiler;
use async_trait::async_trait;
use engine_core::{Cancellation, Categorizable, Handler, HandlerError, Job, TxBatchWriter};
use engine_provider::{GenerateContentRequest, ProviderClient};
use engine_warehouse_sqlite::{
    upsert_analysis_blocked, upsert_analysis_completed, EmotionRow, EntityRow, HumorItemRow,
    SqliteTransactor, TopicRow,
};
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug, Deserialize)]
struct AnalysisPayload {
    conversation_id: String,
    prompt_id: String,
}

/// One parsed facet row, shaped to decode straight out of the model's
/// JSON response (spec.md S4.7 step 5's "response schema").
#[derive(Debug, Deserialize, Default)]
struct AnalysisResult {
    #[serde(default)]
    topics: Vec<TopicOut>,
    #[serde(default)]
    entities: Vec<EntityOut>,
    #[serde(default)]
    emotions: Vec<EmotionOut>,
    #[serde(default)]
    humor_items: Vec<HumorOut>,
}

#[derive(Debug, Deserialize)]
struct TopicOut {
    title: String,
    #[serde(default)]
    weight: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct EntityOut {
    name: String,
    #[serde(default)]
    entity_kind: Option<String>,
}

#[derive(Debug, Deserialize)]
struct EmotionOut {
    label: String,
    #[serde(default)]
    intensity: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct HumorOut {
    snippet: String,
    #[serde(default)]
    humor_kind: Option<String>,
}

/// Conversation-level analysis: decode -> compile -> call -> parse ->
/// persist (spec.md S4.7).
pub struct AnalysisHandler {
    provider: Arc<dyn ProviderClient>,
    compiler: Arc<dyn PromptCompiler>,
    writer: Arc<TxBatchWriter<SqliteTransactor>>,
    /// Whether a parse failure should retry once against the next
    /// fallback model before giving up permanently (spec.md S9).
    retry_on_parse_failure: bool,
}

impl AnalysisHandler {
    pub fn new(
        provider: Arc<dyn ProviderClient>,
        compiler: Arc<dyn PromptCompiler>,
        writer: Arc<TxBatchWriter<SqliteTransactor>>,
        retry_on_parse_failure: bool,
    ) -> Self {
        Self {
            provider,
            compiler,
            writer,
            retry_on_parse_failure,
        }
    }

    async fn call_and_parse(
        &self,
        conversation_id: &str,
        prompt_id: &str,
        cancellation: &Cancellation,
        model: &str,
        system_text: Option<String>,
        user_text: &str,
        response_schema: Option<serde_json::Value>,
    ) -> Result<Option<AnalysisResult>, HandlerError> {
        let request = GenerateContentRequest {
            system_text,
            user_text: user_text.to_string(),
            response_schema,
            thinking_level: None,
        };
        let response = self
            .provider
            .generate_content(model, request, cancellation.child())
            .await
            .map_err(|err| HandlerError {
                class: err.class(),
                message: err.to_string(),
            })?;

        if let Some(reason) = response.block_reason {
            debug!(conversation_id, prompt_id, %reason, "analysis blocked by provider");
            self.writer
                .submit(upsert_analysis_blocked(conversation_id, prompt_id, reason))
                .await
                .wait()
                .await
                .map_err(|err| HandlerError::transient(err.to_string()))?;
            return Ok(None);
        }

        let text = response.text.unwrap_or_default();
        match serde_json::from_str::<AnalysisResult>(&text) {
            Ok(parsed) => Ok(Some(parsed)),
            Err(err) => {
                warn!(conversation_id, prompt_id, model, %err, "analysis response failed to parse");
                Err(HandlerError::transient(format!("parse failure: {err}")))
            }
        }
    }
}

#[async_trait]
impl Handler for AnalysisHandler {
    async fn handle(&self, cancellation: Cancellation, job: &Job) -> Result<(), HandlerError> {
        let payload: AnalysisPayload = serde_json::from_slice(&job.payload)
            .map_err(|err| HandlerError::permanent(format!("invalid analysis payload: {err}")))?;

        let compiled = self
            .compiler
            .compile(&payload.conversation_id, &payload.prompt_id)
            .await?;

        let primary = self
            .call_and_parse(
                &payload.conversation_id,
                &payload.prompt_id,
                &cancellation,
                &compiled.model_name,
                compiled.system_text.clone(),
                &compiled.user_text,
                compiled.response_schema.clone(),
            )
            .await;

        let parsed = match primary {
            Ok(parsed) => parsed,
            Err(first_err) if first_err.class == engine_core::ErrorClass::Transient
                && self.retry_on_parse_failure
                && first_err.message.starts_with("parse failure")
                && !compiled.fallback_models.is_empty() =>
            {
                // One fallback model per queue attempt (spec.md S9): try
                // the first fallback, then give up regardless of outcome.
                let fallback_model = &compiled.fallback_models[0];
                self.call_and_parse(
                    &payload.conversation_id,
                    &payload.prompt_id,
                    &cancellation,
                    fallback_model,
                    compiled.system_text.clone(),
                    &compiled.user_text,
                    compiled.response_schema.clone(),
                )
                .await
                .map_err(|_| HandlerError::permanent("analysis response failed to parse against every fallback model"))?
            }
            Err(first_err) if first_err.message.starts_with("parse failure") => {
                return Err(HandlerError::permanent(first_err.message));
            }
            Err(other) => return Err(other),
        };

        let Some(parsed) = parsed else {
            // Blocked: already persisted and acknowledged above.
            return Ok(());
        };

        let op = upsert_analysis_completed(
            payload.conversation_id,
            payload.prompt_id,
            compiled.model_name,
            parsed.topics.into_iter().map(|t| TopicRow { title: t.title, weight: t.weight }).collect(),
            parsed.entities.into_iter().map(|e| EntityRow { name: e.name, entity_kind: e.entity_kind }).collect(),
            parsed.emotions.into_iter().map(|e| EmotionRow { label: e.label, intensity: e.intensity }).collect(),
            parsed.humor_items.into_iter().map(|h| HumorItemRow { snippet: h.snippet, humor_kind: h.humor_kind }).collect(),
        );
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
    use crate::prompt::CompiledPrompt;
    use engine_core::BatchConfig;
    use engine_provider::ProviderError;
    use engine_testing::FakeProviderClient;

    struct StaticCompiler(CompiledPrompt);

    #[async_trait]
    impl PromptCompiler for StaticCompiler {
        async fn compile(&self, _conversation_id: &str, _prompt_id: &str) -> Result<CompiledPrompt, HandlerError> {
            Ok(self.0.clone())
        }
    }

    struct MissingCompiler;

    #[async_trait]
    impl PromptCompiler for MissingCompiler {
        async fn compile(&self, _conversation_id: &str, _prompt_id: &str) -> Result<CompiledPrompt, HandlerError> {
            Err(HandlerError::permanent("conversation not found"))
        }
    }

    fn job_with_payload(payload: serde_json::Value) -> Job {
        Job {
            id: 1,
            job_type: "analysis".into(),
            key: "analysis:conversation:1:p".into(),
            priority: 0,
            payload: serde_json::to_vec(&payload).unwrap(),
            state: engine_core::JobState::Leased,
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

    async fn memory_writer_only() -> Arc<TxBatchWriter<SqliteTransactor>> {
        memory_writer().await.0
    }

    #[tokio::test]
    async fn missing_conversation_is_permanent() {
        let (writer, _transactor) = memory_writer().await;
        let handler = AnalysisHandler::new(
            Arc::new(FakeProviderClient::always_success()),
            Arc::new(MissingCompiler),
            writer,
            false,
        );
        let job = job_with_payload(serde_json::json!({"conversation_id": "1", "prompt_id": "p"}));
        let err = handler.handle(Cancellation::new(), &job).await.unwrap_err();
        assert_eq!(err.class, engine_core::ErrorClass::Permanent);
    }

    #[tokio::test]
    async fn blocked_response_persists_blocked_status_and_returns_ok() {
        let provider = FakeProviderClient::new();
        provider.push_generate_response(engine_provider::GenerateContentResponse {
            text: None,
            block_reason: Some("policy".into()),
        });
        let (writer, transactor) = memory_writer().await;
        let handler = AnalysisHandler::new(
            Arc::new(provider),
            Arc::new(StaticCompiler(CompiledPrompt {
                system_text: None,
                user_text: "hi".into(),
                response_schema: None,
                model_name: "model-a".into(),
                fallback_models: vec![],
            })),
            writer,
            false,
        );
        let job = job_with_payload(serde_json::json!({"conversation_id": "conv-1", "prompt_id": "p1"}));
        handler.handle(Cancellation::new(), &job).await.unwrap();

        let row: (String, Option<String>) = sqlx::query_as(
            "SELECT status, block_reason FROM conversation_analyses WHERE conversation_id = 'conv-1'",
        )
        .fetch_one(transactor.pool())
        .await
        .unwrap();
        assert_eq!(row.0, "blocked");
        assert_eq!(row.1.as_deref(), Some("policy"));

        let facet_count: (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM topics WHERE conversation_id = 'conv-1'")
                .fetch_one(transactor.pool())
                .await
                .unwrap();
        assert_eq!(facet_count.0, 0);
    }

    #[tokio::test]
    async fn transient_provider_error_propagates_as_transient() {
        let provider = FakeProviderClient::new();
        provider.push_generate_error(ProviderError::RateLimited);
        let handler = AnalysisHandler::new(
            Arc::new(provider),
            Arc::new(StaticCompiler(CompiledPrompt {
                system_text: None,
                user_text: "hi".into(),
                response_schema: None,
                model_name: "model-a".into(),
                fallback_models: vec![],
            })),
            memory_writer_only().await,
            false,
        );
        let job = job_with_payload(serde_json::json!({"conversation_id": "conv-1", "prompt_id": "p1"}));
        let err = handler.handle(Cancellation::new(), &job).await.unwrap_err();
        assert_eq!(err.class, engine_core::ErrorClass::Transient);
    }

    #[tokio::test]
    async fn parse_failure_without_fallback_is_permanent() {
        let provider = FakeProviderClient::new();
        provider.push_generate_response(engine_provider::GenerateContentResponse {
            text: Some("not json".into()),
            block_reason: None,
        });
        let handler = AnalysisHandler::new(
            Arc::new(provider),
            Arc::new(StaticCompiler(CompiledPrompt {
                system_text: None,
                user_text: "hi".into(),
                response_schema: None,
                model_name: "model-a".into(),
                fallback_models: vec![],
            })),
            memory_writer_only().await,
            true,
        );
        let job = job_with_payload(serde_json::json!({"conversation_id": "conv-1", "prompt_id": "p1"}));
        let err = handler.handle(Cancellation::new(), &job).await.unwrap_err();
        assert_eq!(err.class, engine_core::ErrorClass::Permanent);
    }

    #[tokio::test]
    async fn parse_failure_retries_once_against_fallback_model() {
        let provider = FakeProviderClient::new();
        provider.push_generate_response(engine_provider::GenerateContentResponse {
            text: Some("not json".into()),
            block_reason: None,
        });
        provider.push_generate_response(engine_provider::GenerateContentResponse {
            text: Some(serde_json::json!({"topics": [], "entities": [], "emotions": [], "humor_items": []}).to_string()),
            block_reason: None,
        });
        let handler = AnalysisHandler::new(
            Arc::new(provider),
            Arc::new(StaticCompiler(CompiledPrompt {
                system_text: None,
                user_text: "hi".into(),
                response_schema: None,
                model_name: "model-a".into(),
                fallback_models: vec!["model-b".into()],
            })),
            memory_writer_only().await,
            true,
        );
        let job = job_with_payload(serde_json::json!({"conversation_id": "conv-1", "prompt_id": "p1"}));
        handler.handle(Cancellation::new(), &job).await.unwrap();
    }
}
