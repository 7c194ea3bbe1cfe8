//! A scriptable [`ProviderClient`] fake: tests push canned responses or
//! errors onto per-call queues, then assert on what the handler did with
//! them. Unset queues default to an innocuous success so tests that don't
//! care about the provider's answer don't have to prime it.

use async_trait::async_trait;
use engine_core::Cancellation;
use engine_provider::{
    BatchEmbedContentsRequest, BatchEmbedContentsResponse, EmbedContentRequest,
    EmbedContentResponse, GenerateContentRequest, GenerateContentResponse, ProviderClient,
    ProviderError,
};
use std::collections::VecDeque;
use std::sync::Mutex;

enum Canned<T> {
    Ok(T),
    Err(ProviderError),
}

/// Clone of a [`ProviderError`]'s discriminant, since `ProviderError`
/// doesn't implement `Clone` (its variants carry non-Clone-derived data
/// only incidentally, but `thiserror` doesn't derive it for us).
fn clone_error(err: &ProviderError) -> ProviderError {
    match err {
        ProviderError::RateLimited => ProviderError::RateLimited,
        ProviderError::ServerError { status } => ProviderError::ServerError { status: *status },
        ProviderError::Network(msg) => ProviderError::Network(msg.clone()),
        ProviderError::Timeout => ProviderError::Timeout,
        ProviderError::Cancelled => ProviderError::Cancelled,
        ProviderError::UnexpectedResponse(msg) => ProviderError::UnexpectedResponse(msg.clone()),
    }
}

#[derive(Default)]
struct Queues {
    generate: VecDeque<Canned<GenerateContentResponse>>,
    embed: VecDeque<Canned<EmbedContentResponse>>,
}

/// Fake provider client for handler and engine tests. `new()` starts
/// empty (every call returns an empty-but-successful response until
/// primed); [`FakeProviderClient::always_success`] is the same thing
/// under a name that reads better at call sites that never inspect the
/// response.
pub struct FakeProviderClient {
    queues: Mutex<Queues>,
}

impl Default for FakeProviderClient {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeProviderClient {
    pub fn new() -> Self {
        Self {
            queues: Mutex::new(Queues::default()),
        }
    }

    /// Equivalent to [`FakeProviderClient::new`]: with no canned
    /// responses pushed, every call already succeeds.
    pub fn always_success() -> Self {
        Self::new()
    }

    pub fn push_generate_response(&self, response: GenerateContentResponse) {
        self.queues.lock().unwrap().generate.push_back(Canned::Ok(response));
    }

    pub fn push_generate_error(&self, error: ProviderError) {
        self.queues.lock().unwrap().generate.push_back(Canned::Err(error));
    }

    pub fn push_embed_response(&self, response: EmbedContentResponse) {
        self.queues.lock().unwrap().embed.push_back(Canned::Ok(response));
    }

    pub fn push_embed_error(&self, error: ProviderError) {
        self.queues.lock().unwrap().embed.push_back(Canned::Err(error));
    }
}

#[async_trait]
impl ProviderClient for FakeProviderClient {
    async fn generate_content(
        &self,
        _model: &str,
        _request: GenerateContentRequest,
        _cancellation: Cancellation,
    ) -> Result<GenerateContentResponse, ProviderError> {
        let next = self.queues.lock().unwrap().generate.pop_front();
        match next {
            Some(Canned::Ok(response)) => Ok(response),
            Some(Canned::Err(err)) => Err(clone_error(&err)),
            None => Ok(GenerateContentResponse {
                text: Some(String::new()),
                block_reason: None,
            }),
        }
    }

    async fn embed_content(
        &self,
        _request: EmbedContentRequest,
        _cancellation: Cancellation,
    ) -> Result<EmbedContentResponse, ProviderError> {
        let next = self.queues.lock().unwrap().embed.pop_front();
        match next {
            Some(Canned::Ok(response)) => Ok(response),
            Some(Canned::Err(err)) => Err(clone_error(&err)),
            None => Ok(EmbedContentResponse { values: vec![] }),
        }
    }

    async fn batch_embed_contents(
        &self,
        request: BatchEmbedContentsRequest,
        cancellation: Cancellation,
    ) -> Result<BatchEmbedContentsResponse, ProviderError> {
        let mut embeddings = Vec::with_capacity(request.requests.len());
        for req in request.requests {
            let response = self.embed_content(req, cancellation.child()).await?;
            embeddings.push(response.values);
        }
        Ok(BatchEmbedContentsResponse { embeddings })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unprimed_generate_succeeds_with_empty_text() {
        let provider = FakeProviderClient::new();
        let response = provider
            .generate_content(
                "model-a",
                GenerateContentRequest {
                    system_text: None,
                    user_text: "hi".into(),
                    response_schema: None,
                    thinking_level: None,
                },
                Cancellation::new(),
            )
            .await
            .unwrap();
        assert_eq!(response.text.as_deref(), Some(""));
    }

    #[tokio::test]
    async fn generate_responses_are_consumed_in_order() {
        let provider = FakeProviderClient::new();
        provider.push_generate_response(GenerateContentResponse {
            text: Some("first".into()),
            block_reason: None,
        });
        provider.push_generate_error(ProviderError::RateLimited);

        let first = provider
            .generate_content(
                "model-a",
                GenerateContentRequest {
                    system_text: None,
                    user_text: "hi".into(),
                    response_schema: None,
                    thinking_level: None,
                },
                Cancellation::new(),
            )
            .await
            .unwrap();
        assert_eq!(first.text.as_deref(), Some("first"));

        let second = provider
            .generate_content(
                "model-a",
                GenerateContentRequest {
                    system_text: None,
                    user_text: "hi".into(),
                    response_schema: None,
                    thinking_level: None,
                },
                Cancellation::new(),
            )
            .await;
        assert!(matches!(second, Err(ProviderError::RateLimited)));
    }

    #[tokio::test]
    async fn batch_embed_delegates_to_single_embed_queue() {
        let provider = FakeProviderClient::new();
        provider.push_embed_response(EmbedContentResponse { values: vec![1.0] });
        provider.push_embed_response(EmbedContentResponse { values: vec![2.0] });

        let response = provider
            .batch_embed_contents(
                BatchEmbedContentsRequest {
                    model: "model-a".into(),
                    requests: vec![
                        EmbedContentRequest { model: "model-a".into(), text: "a".into() },
                        EmbedContentRequest { model: "model-a".into(), text: "b".into() },
                    ],
                },
                Cancellation::new(),
            )
            .await
            .unwrap();
        assert_eq!(response.embeddings, vec![vec![1.0], vec![2.0]]);
    }
}
