//! Upstream capability surface. The routing engine only sees this trait, so
//! tests drive it with a deterministic fake while the binary wires in the
//! real OpenRouter client.

mod openrouter;

use async_trait::async_trait;
use tokio::sync::mpsc;

use orproxy_protocol::catalog::CatalogModel;
use orproxy_protocol::openai::{ChatCompletion, ChatCompletionChunk, ChatMessage};

pub use openrouter::{OpenRouterClient, OPENROUTER_BASE_URL};

#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    #[error("model name cannot be empty")]
    EmptyModel,
    #[error("messages cannot be empty")]
    EmptyMessages,
    #[error("upstream transport error: {0}")]
    Transport(String),
    #[error("upstream returned {status}: {message}")]
    Api { status: u16, message: String },
    #[error("invalid upstream payload: {0}")]
    Decode(String),
    #[error("no embeddings returned")]
    EmptyEmbedding,
}

/// Handle over a live token stream. Dropping it releases the upstream
/// connection: the pump task notices the closed channel and stops reading.
pub struct ChatStream {
    rx: mpsc::Receiver<Result<ChatCompletionChunk, UpstreamError>>,
}

impl ChatStream {
    pub fn new(rx: mpsc::Receiver<Result<ChatCompletionChunk, UpstreamError>>) -> Self {
        Self { rx }
    }

    /// Build a stream from pre-baked chunks (test fixtures).
    pub fn from_chunks(chunks: Vec<Result<ChatCompletionChunk, UpstreamError>>) -> Self {
        let (tx, rx) = mpsc::channel(chunks.len().max(1));
        for chunk in chunks {
            // Capacity matches the fixture; a failed send is unreachable.
            let _ = tx.try_send(chunk);
        }
        Self { rx }
    }

    /// `None` marks the end of the stream (`[DONE]` or upstream EOF).
    pub async fn recv(&mut self) -> Option<Result<ChatCompletionChunk, UpstreamError>> {
        self.rx.recv().await
    }
}

#[async_trait]
pub trait Upstream: Send + Sync {
    /// Buffered chat completion. Validates inputs before any network I/O.
    async fn chat(
        &self,
        messages: &[ChatMessage],
        model: &str,
    ) -> Result<ChatCompletion, UpstreamError>;

    /// Streaming chat completion; the handle yields decoded chunks.
    async fn chat_stream(
        &self,
        messages: &[ChatMessage],
        model: &str,
    ) -> Result<ChatStream, UpstreamError>;

    async fn list_models(&self) -> Result<Vec<CatalogModel>, UpstreamError>;

    async fn embeddings(&self, input: &str, model: &str) -> Result<Vec<f32>, UpstreamError>;

    /// Resolve a display-name alias against the catalog: exact match first,
    /// then suffix match, then the alias verbatim. Returning the input for an
    /// unknown alias is deliberate; the failure then surfaces at the upstream
    /// call instead of here.
    async fn full_model_name(&self, alias: &str) -> Result<String, UpstreamError>;
}

pub(crate) fn validate_chat_input(
    messages: &[ChatMessage],
    model: &str,
) -> Result<(), UpstreamError> {
    if model.is_empty() {
        return Err(UpstreamError::EmptyModel);
    }
    if messages.is_empty() {
        return Err(UpstreamError::EmptyMessages);
    }
    Ok(())
}
