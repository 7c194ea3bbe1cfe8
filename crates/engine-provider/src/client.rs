use crate::error::ProviderError;
use crate::types::{
    BatchEmbedContentsRequest, BatchEmbedContentsResponse, EmbedContentRequest,
    EmbedContentResponse, GenerateContentRequest, GenerateContentResponse,
};
use async_trait::async_trait;
use engine_core::Cancellation;

/// The three provider calls the engine consumes (spec.md S6). Retry,
/// backoff, pacing, and pressure reporting are the implementation's
/// concern; callers get either a response or a final, already-classified
/// error.
#[async_trait]
pub trait ProviderClient: Send + Sync + 'static {
    async fn generate_content(
        &self,
        model: &str,
        request: GenerateContentRequest,
        cancellation: Cancellation,
    ) -> Result<GenerateContentResponse, ProviderError>;

    async fn embed_content(
        &self,
        request: EmbedContentRequest,
        cancellation: Cancellation,
    ) -> Result<EmbedContentResponse, ProviderError>;

    async fn batch_embed_contents(
        &self,
        request: BatchEmbedContentsRequest,
        cancellation: Cancellation,
    ) -> Result<BatchEmbedContentsResponse, ProviderError>;
}
