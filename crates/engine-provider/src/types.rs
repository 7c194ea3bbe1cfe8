//! Wire shapes for the three provider calls named in spec.md S6. The
//! provider itself is out of scope; these are plain structs mirroring
//! the one concrete example in the retrieved pack (`ai-summarizer`'s
//! "just reqwest + serde" style) rather than a generated client.

use serde::{Deserialize, Serialize};

/// One chat-style completion request. `response_schema` constrains the
/// model's JSON output when present; `thinking_level` is an optional
/// provider-specific reasoning-effort hint.
#[derive(Debug, Clone, Serialize)]
pub struct GenerateContentRequest {
    pub system_text: Option<String>,
    pub user_text: String,
    pub response_schema: Option<serde_json::Value>,
    pub thinking_level: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GenerateContentResponse {
    pub text: Option<String>,
    /// Present when the provider declined to generate content (safety
    /// filters, policy). spec.md S4.7 step 4 / S7: recorded as `ok` with
    /// a `blocked` warehouse status, not as an error.
    pub block_reason: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EmbedContentRequest {
    pub model: String,
    pub text: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EmbedContentResponse {
    pub values: Vec<f32>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchEmbedContentsRequest {
    pub model: String,
    pub requests: Vec<EmbedContentRequest>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BatchEmbedContentsResponse {
    pub embeddings: Vec<Vec<f32>>,
}
