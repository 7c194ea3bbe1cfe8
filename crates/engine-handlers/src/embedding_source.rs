//! Derives the text an embedding job embeds, keyed by `entity_type`
//! (spec.md S4.7 "Embedding handler" step 2). Like [`crate::prompt::PromptCompiler`]
//! this is a boundary onto data the core doesn't own; implementations
//! live alongside the ETL, not here.

use async_trait::async_trait;
use engine_core::HandlerError;

/// The raw material an embedding source hands back for one entity.
/// Conversation transcripts arrive already base64-encoded (the ETL's
/// on-disk representation); facet titles and humor snippets are already
/// plain text.
#[derive(Debug, Clone)]
pub enum EmbeddingInput {
    PlainText(String),
    EncodedTranscript(String),
}

#[async_trait]
pub trait EmbeddingSource: Send + Sync + 'static {
    /// Missing source data (entity not found, transcript not yet ETL'd)
    /// is a permanent failure (spec.md S4.7 step 2).
    async fn text_for(&self, entity_type: &str, entity_id: &str) -> Result<EmbeddingInput, HandlerError>;
}

/// Decode an [`EmbeddingInput`] into the plain text `embed_content` sends.
pub fn resolve_input_text(input: EmbeddingInput) -> Result<String, HandlerError> {
    match input {
        EmbeddingInput::PlainText(text) => Ok(text),
        EmbeddingInput::EncodedTranscript(encoded) => {
            use base64::Engine;
            let bytes = base64::engine::general_purpose::STANDARD
                .decode(encoded.as_bytes())
                .map_err(|err| HandlerError::permanent(format!("invalid base64 transcript: {err}")))?;
            String::from_utf8(bytes)
                .map_err(|err| HandlerError::permanent(format!("transcript is not valid utf-8: {err}")))
        }
    }
}
