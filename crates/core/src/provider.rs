//! Provider and model-client traits: the abstraction over LLM backends.
//!
//! A [`Provider`] knows how to send a conversation to one vendor and get a
//! response back, either complete or as a stream of chunks.
//!
//! A [`ModelClient`] is what the request loop talks to: it picks a provider,
//! optionally falls back to others, forwards streamed chunks, and honors
//! cancellation.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::ProviderError;
use crate::message::Message;

/// Configuration for a provider request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderRequest {
    /// The model to use (e.g., "anthropic/claude-sonnet-4", "gpt-4o")
    pub model: String,

    /// The conversation messages
    pub messages: Vec<Message>,

    /// Temperature (0.0 = deterministic, 1.0 = creative)
    #[serde(default = "default_temperature")]
    pub temperature: f32,

    /// Maximum tokens to generate
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,

    /// Whether to stream the response
    #[serde(default)]
    pub stream: bool,
}

fn default_temperature() -> f32 {
    0.7
}

/// A complete (non-streaming) response from a provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderResponse {
    /// The generated message
    pub message: Message,

    /// Token usage statistics
    pub usage: Option<Usage>,

    /// Which model actually responded (may differ from requested)
    pub model: String,
}

/// Token usage information.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

/// A single chunk in a streaming response.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StreamChunk {
    /// Partial content delta
    #[serde(default)]
    pub content: Option<String>,

    /// Whether this is the final chunk
    #[serde(default)]
    pub done: bool,

    /// Usage info (typically only in the final chunk)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

/// The core Provider trait.
///
/// Every LLM backend implements this trait. The fallback chain calls
/// `complete()` or `stream()` without knowing which vendor is behind it.
#[async_trait]
pub trait Provider: Send + Sync {
    /// A human-readable name for this provider (e.g., "openrouter", "ollama").
    fn name(&self) -> &str;

    /// The model this provider uses when the caller does not pick one.
    fn default_model(&self) -> Option<&str> {
        None
    }

    /// Send a request and get a complete response.
    async fn complete(&self, request: ProviderRequest) -> Result<ProviderResponse, ProviderError>;

    /// Send a request and get a stream of response chunks.
    ///
    /// Default implementation calls `complete()` and wraps the result as a single chunk.
    async fn stream(
        &self,
        request: ProviderRequest,
    ) -> Result<tokio::sync::mpsc::Receiver<Result<StreamChunk, ProviderError>>, ProviderError>
    {
        let response = self.complete(request).await?;
        let (tx, rx) = tokio::sync::mpsc::channel(1);
        let _ = tx
            .send(Ok(StreamChunk {
                content: Some(response.message.content),
                done: true,
                usage: response.usage,
            }))
            .await;
        Ok(rx)
    }

    /// Health check: can we reach the provider?
    async fn health_check(&self) -> Result<bool, ProviderError> {
        Ok(true)
    }
}

/// Callback receiving streamed text deltas as they arrive.
pub type ChunkCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// Per-call options for [`ModelClient::chat`].
#[derive(Clone, Default)]
pub struct ChatOptions {
    /// Request a streamed response.
    pub stream: bool,

    /// Receives each streamed delta. Ignored when `stream` is false.
    pub on_chunk: Option<ChunkCallback>,

    /// Fired to abort the in-flight call.
    pub cancel: CancellationToken,

    /// Try this provider first instead of the active one.
    pub preferred_provider: Option<String>,
}

impl std::fmt::Debug for ChatOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatOptions")
            .field("stream", &self.stream)
            .field("on_chunk", &self.on_chunk.is_some())
            .field("cancelled", &self.cancel.is_cancelled())
            .field("preferred_provider", &self.preferred_provider)
            .finish()
    }
}

/// The assembled reply from a model client.
#[derive(Debug, Clone)]
pub struct ChatReply {
    /// The assistant message (fully assembled, even when streamed)
    pub message: Message,

    /// Token usage, when the provider reported it
    pub usage: Option<Usage>,

    /// Provider that produced the reply
    pub provider: String,

    /// Model that produced the reply
    pub model: String,

    /// Whether a provider other than the first choice answered
    pub fallback_used: bool,

    /// The first-choice provider, when fallback occurred
    pub original_provider: Option<String>,
}

/// The model-call collaborator used by the request loop.
#[async_trait]
pub trait ModelClient: Send + Sync {
    /// Name of the provider that will be tried first.
    fn active_provider(&self) -> String;

    /// Send the conversation and return the assembled reply.
    ///
    /// Must return [`ProviderError::Cancelled`] promptly once
    /// `options.cancel` fires.
    async fn chat(&self, messages: &[Message], options: ChatOptions)
        -> Result<ChatReply, ProviderError>;
}
