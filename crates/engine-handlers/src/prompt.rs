//! The prompt/context compilation layer is an external collaborator
//! (spec.md S1 "Out of scope"): `engine-handlers` only consumes the
//! shape it returns, `compile(conversationId, promptId) -> prompt text +
//! response schema`.

use async_trait::async_trait;
use engine_core::HandlerError;

/// What the compiler hands back for one (conversation, prompt) pair.
#[derive(Debug, Clone)]
pub struct CompiledPrompt {
    pub system_text: Option<String>,
    pub user_text: String,
    pub response_schema: Option<serde_json::Value>,
    pub model_name: String,
    /// Models to try, in order, if the primary model's response fails to
    /// parse against `response_schema` (spec.md S9 open question: capped
    /// at one fallback per queue attempt, does not re-enqueue).
    pub fallback_models: Vec<String>,
}

/// Compiles a conversation + prompt id into the text and schema the
/// provider call needs. A missing conversation or prompt is a permanent
/// failure (spec.md S4.7 step 2) — implementations should return a
/// [`HandlerError::permanent`] in that case, not an `Ok` with empty text.
#[async_trait]
pub trait PromptCompiler: Send + Sync + 'static {
    async fn compile(&self, conversation_id: &str, prompt_id: &str) -> Result<CompiledPrompt, HandlerError>;
}
