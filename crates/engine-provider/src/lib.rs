//! Generative-AI provider HTTP client (spec.md S6): `generateContent`,
//! `embedContent`, `batchEmbedContents`, each with retry/backoff and
//! pressure classification feeding the two adaptive controllers.

pub mod client;
pub mod error;
pub mod http;
pub mod observer;
pub mod types;

pub use client::ProviderClient;
pub use error::ProviderError;
pub use http::{HttpProviderClient, ProviderConfig};
pub use observer::{InflightObserver, RateObserver};
pub use types::{
    BatchEmbedContentsRequest, BatchEmbedContentsResponse, EmbedContentRequest,
    EmbedContentResponse, GenerateContentRequest, GenerateContentResponse,
};
