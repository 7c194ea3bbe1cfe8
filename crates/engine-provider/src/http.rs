//! `reqwest`-based [`ProviderClient`], with retry/backoff and pressure
//! reporting folded into the call site (spec.md S4.7 step 3, S6, S9).
//!
//! The leaky bucket and both adaptive controllers are driven from here
//! rather than from the engine's worker loop: this is the one place in
//! the system with the granular HTTP outcome (status code, timeout,
//! connection reset) that pressure classification needs.

use crate::client::ProviderClient;
use crate::error::ProviderError;
use crate::observer::{InflightObserver, RateObserver};
use crate::types::{
    BatchEmbedContentsRequest, BatchEmbedContentsResponse, EmbedContentRequest,
    EmbedContentResponse, GenerateContentRequest, GenerateContentResponse,
};
use async_trait::async_trait;
use engine_core::{Cancellation, LeakyBucket};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub base_url: String,
    pub api_key: String,
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub request_timeout: Duration,
}

impl ProviderConfig {
    /// Defaults match `EngineConfig`'s provider_* fields (spec.md S9).
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
            max_retries: 5,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
            request_timeout: Duration::from_secs(60),
        }
    }
}

pub struct HttpProviderClient {
    http: reqwest::Client,
    config: ProviderConfig,
    leaky_bucket: LeakyBucket,
    rate_observer: Arc<dyn RateObserver>,
    inflight_observer: Arc<dyn InflightObserver>,
}

impl HttpProviderClient {
    pub fn new(
        config: ProviderConfig,
        leaky_bucket: LeakyBucket,
        rate_observer: Arc<dyn RateObserver>,
        inflight_observer: Arc<dyn InflightObserver>,
    ) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;
        Ok(Self {
            http,
            config,
            leaky_bucket,
            rate_observer,
            inflight_observer,
        })
    }

    /// Wait for a pacing slot, run `attempt`, observe the outcome, and
    /// retry with exponential backoff + jitter on a retryable error, up
    /// to `max_retries`. Shared by all three endpoint calls.
    async fn with_retries<T, F, Fut>(
        &self,
        cancellation: &Cancellation,
        mut attempt: F,
    ) -> Result<T, ProviderError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, ProviderError>>,
    {
        let mut backoff = self.config.initial_backoff;
        for try_index in 0..=self.config.max_retries {
            if self.leaky_bucket.wait(cancellation).await == engine_core::WaitOutcome::Cancelled {
                return Err(ProviderError::Cancelled);
            }
            if cancellation.is_cancelled() {
                return Err(ProviderError::Cancelled);
            }

            let start = Instant::now();
            let result = attempt().await;
            let latency = start.elapsed();

            if let Some(class) = result.as_ref().err().and_then(ProviderError::pressure_class) {
                self.rate_observer.observe(class, latency);
                self.inflight_observer.observe(latency, class);
            } else if result.is_ok() {
                self.rate_observer
                    .observe(engine_core::PressureClass::Success, latency);
                self.inflight_observer
                    .observe(latency, engine_core::PressureClass::Success);
            }

            match result {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retryable() && try_index < self.config.max_retries => {
                    warn!(attempt = try_index, %err, "provider call failed, retrying");
                    let jitter = 1.0 + fastrand::f64() * 0.2;
                    let sleep_for = backoff.mul_f64(jitter).min(self.config.max_backoff);
                    if cancellation.race(tokio::time::sleep(sleep_for)).await.is_none() {
                        return Err(ProviderError::Cancelled);
                    }
                    backoff = (backoff * 2).min(self.config.max_backoff);
                }
                Err(err) => return Err(err),
            }
        }
        unreachable!("loop always returns on its last iteration")
    }

    async fn post_json<B: serde::Serialize, R: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<R, ProviderError> {
        let url = format!("{}{}", self.config.base_url, path);
        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.config.api_key)
            .json(body)
            .send()
            .await
            .map_err(classify_reqwest_error)?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            return Err(ProviderError::from_status(status.as_u16(), body_text));
        }

        response
            .json::<R>()
            .await
            .map_err(|err| ProviderError::UnexpectedResponse(err.to_string()))
    }
}

fn classify_reqwest_error(err: reqwest::Error) -> ProviderError {
    if err.is_timeout() {
        ProviderError::Timeout
    } else if err.is_connect() || err.is_request() {
        ProviderError::Network(err.to_string())
    } else {
        ProviderError::Network(err.to_string())
    }
}

#[async_trait]
impl ProviderClient for HttpProviderClient {
    async fn generate_content(
        &self,
        model: &str,
        request: GenerateContentRequest,
        cancellation: Cancellation,
    ) -> Result<GenerateContentResponse, ProviderError> {
        let path = format!("/v1/models/{model}:generateContent");
        self.with_retries(&cancellation, || self.post_json(&path, &request))
            .await
    }

    async fn embed_content(
        &self,
        request: EmbedContentRequest,
        cancellation: Cancellation,
    ) -> Result<EmbedContentResponse, ProviderError> {
        let path = format!("/v1/models/{}:embedContent", request.model);
        self.with_retries(&cancellation, || self.post_json(&path, &request))
            .await
    }

    async fn batch_embed_contents(
        &self,
        request: BatchEmbedContentsRequest,
        cancellation: Cancellation,
    ) -> Result<BatchEmbedContentsResponse, ProviderError> {
        let path = format!("/v1/models/{}:batchEmbedContents", request.model);
        self.with_retries(&cancellation, || self.post_json(&path, &request))
            .await
    }
}
