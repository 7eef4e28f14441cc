use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::{mpsc, RwLock};
use tokio::time::{timeout, timeout_at, Instant};
use tracing::debug;
use wreq::{Client, Method};

use orproxy_protocol::catalog::{CatalogModel, CatalogResponse};
use orproxy_protocol::openai::{ChatCompletion, ChatCompletionChunk, ChatMessage};
use orproxy_protocol::sse::SseDecoder;

use super::{validate_chat_input, ChatStream, Upstream, UpstreamError};

pub const OPENROUTER_BASE_URL: &str = "https://openrouter.ai/api/v1";

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const CHAT_TIMEOUT: Duration = Duration::from_secs(30);
/// Bounds the whole streamed response, first byte to last.
const STREAM_TIMEOUT: Duration = Duration::from_secs(60);
const LIST_TIMEOUT: Duration = Duration::from_secs(10);
const EMBEDDINGS_TIMEOUT: Duration = Duration::from_secs(10);
const STREAM_IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// Real upstream client over the OpenRouter chat-completions API.
pub struct OpenRouterClient {
    client: Client,
    base_url: String,
    api_key: String,
    /// Fully-qualified ids from the last catalog fetch, for alias resolution.
    model_names: RwLock<Vec<String>>,
}

impl OpenRouterClient {
    pub fn new(api_key: impl Into<String>) -> Result<Self, UpstreamError> {
        Self::with_base_url(api_key, OPENROUTER_BASE_URL)
    }

    pub fn with_base_url(
        api_key: impl Into<String>,
        base_url: impl Into<String>,
    ) -> Result<Self, UpstreamError> {
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .read_timeout(STREAM_IDLE_TIMEOUT)
            .build()
            .map_err(map_transport)?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            model_names: RwLock::new(Vec::new()),
        })
    }

    fn request(&self, method: Method, path: &str) -> wreq::RequestBuilder {
        self.client
            .request(method, format!("{}{}", self.base_url, path))
            .header("Authorization", format!("Bearer {}", self.api_key))
    }

    async fn post_json(
        &self,
        path: &str,
        body: &serde_json::Value,
    ) -> Result<wreq::Response, UpstreamError> {
        let payload = serde_json::to_vec(body).map_err(|err| {
            UpstreamError::Decode(format!("request serialization failed: {err}"))
        })?;
        self.request(Method::POST, path)
            .header("Content-Type", "application/json")
            .body(payload)
            .send()
            .await
            .map_err(map_transport)
    }
}

#[async_trait]
impl Upstream for OpenRouterClient {
    async fn chat(
        &self,
        messages: &[ChatMessage],
        model: &str,
    ) -> Result<ChatCompletion, UpstreamError> {
        validate_chat_input(messages, model)?;

        let body = json!({
            "model": model,
            "messages": messages,
            "stream": false,
        });
        let bytes = deadline(CHAT_TIMEOUT, "chat completion", async {
            let resp = into_api_error(self.post_json("/chat/completions", &body).await?).await?;
            resp.bytes().await.map_err(map_transport)
        })
        .await?;
        serde_json::from_slice(&bytes).map_err(|err| UpstreamError::Decode(err.to_string()))
    }

    async fn chat_stream(
        &self,
        messages: &[ChatMessage],
        model: &str,
    ) -> Result<ChatStream, UpstreamError> {
        validate_chat_input(messages, model)?;

        let body = json!({
            "model": model,
            "messages": messages,
            "stream": true,
        });
        let stream_deadline = Instant::now() + STREAM_TIMEOUT;
        let resp = deadline(STREAM_TIMEOUT, "stream creation", async {
            into_api_error(self.post_json("/chat/completions", &body).await?).await
        })
        .await?;

        let (tx, rx) = mpsc::channel::<Result<ChatCompletionChunk, UpstreamError>>(16);
        tokio::spawn(async move {
            let mut decoder = SseDecoder::new();
            let mut bytes = resp.bytes_stream();
            loop {
                // The client-level read timeout bounds idle gaps; this
                // deadline bounds the stream as a whole.
                let item = match timeout_at(stream_deadline, bytes.next()).await {
                    Ok(item) => item,
                    Err(_) => {
                        let _ = tx
                            .send(Err(UpstreamError::Transport(
                                "stream timed out".to_string(),
                            )))
                            .await;
                        return;
                    }
                };
                let Some(item) = item else {
                    return;
                };
                let chunk = match item {
                    Ok(chunk) => chunk,
                    Err(err) => {
                        let _ = tx.send(Err(map_transport(err))).await;
                        return;
                    }
                };
                for payload in decoder.feed_bytes(&chunk) {
                    if payload == "[DONE]" {
                        return;
                    }
                    let parsed = serde_json::from_str::<ChatCompletionChunk>(&payload)
                        .map_err(|err| UpstreamError::Decode(err.to_string()));
                    let failed = parsed.is_err();
                    if tx.send(parsed).await.is_err() || failed {
                        // Receiver dropped (client went away) or the payload
                        // was garbage; stop reading either way.
                        return;
                    }
                }
            }
        });

        Ok(ChatStream::new(rx))
    }

    async fn list_models(&self) -> Result<Vec<CatalogModel>, UpstreamError> {
        let bytes = deadline(LIST_TIMEOUT, "model listing", async {
            let resp = self
                .request(Method::GET, "/models")
                .send()
                .await
                .map_err(map_transport)?;
            let resp = into_api_error(resp).await?;
            resp.bytes().await.map_err(map_transport)
        })
        .await?;
        let catalog: CatalogResponse =
            serde_json::from_slice(&bytes).map_err(|err| UpstreamError::Decode(err.to_string()))?;

        let mut names = self.model_names.write().await;
        *names = catalog.data.iter().map(|m| m.id.clone()).collect();
        debug!(models = names.len(), "catalog refreshed");

        Ok(catalog.data)
    }

    async fn embeddings(&self, input: &str, model: &str) -> Result<Vec<f32>, UpstreamError> {
        let body = json!({
            "model": model,
            "input": [input],
        });
        let bytes = deadline(EMBEDDINGS_TIMEOUT, "embeddings", async {
            let resp = into_api_error(self.post_json("/embeddings", &body).await?).await?;
            resp.bytes().await.map_err(map_transport)
        })
        .await?;
        let parsed: EmbeddingsEnvelope =
            serde_json::from_slice(&bytes).map_err(|err| UpstreamError::Decode(err.to_string()))?;
        parsed
            .data
            .into_iter()
            .next()
            .map(|d| d.embedding)
            .ok_or(UpstreamError::EmptyEmbedding)
    }

    async fn full_model_name(&self, alias: &str) -> Result<String, UpstreamError> {
        {
            let names = self.model_names.read().await;
            if !names.is_empty() {
                return Ok(resolve_alias(&names, alias));
            }
        }
        self.list_models().await?;
        let names = self.model_names.read().await;
        Ok(resolve_alias(&names, alias))
    }
}

fn resolve_alias(names: &[String], alias: &str) -> String {
    if let Some(exact) = names.iter().find(|name| *name == alias) {
        return exact.clone();
    }
    if let Some(suffix) = names.iter().find(|name| name.ends_with(alias)) {
        return suffix.clone();
    }
    alias.to_string()
}

async fn deadline<T, F>(limit: Duration, label: &str, fut: F) -> Result<T, UpstreamError>
where
    F: Future<Output = Result<T, UpstreamError>>,
{
    match timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(UpstreamError::Transport(format!(
            "{label} timed out after {}s",
            limit.as_secs()
        ))),
    }
}

async fn into_api_error(resp: wreq::Response) -> Result<wreq::Response, UpstreamError> {
    let status = resp.status().as_u16();
    if (200..300).contains(&status) {
        return Ok(resp);
    }
    let message = match resp.bytes().await {
        Ok(bytes) => String::from_utf8_lossy(&bytes).trim().to_string(),
        Err(_) => String::new(),
    };
    Err(UpstreamError::Api { status, message })
}

fn map_transport(err: wreq::Error) -> UpstreamError {
    UpstreamError::Transport(err.to_string())
}

#[derive(Debug, Deserialize)]
struct EmbeddingsEnvelope {
    #[serde(default)]
    data: Vec<EmbeddingsRow>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingsRow {
    #[serde(default)]
    embedding: Vec<f32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alias_resolution_prefers_exact_then_suffix() {
        let names = vec![
            "vendor/big-model:free".to_string(),
            "other/model".to_string(),
        ];
        assert_eq!(resolve_alias(&names, "other/model"), "other/model");
        assert_eq!(resolve_alias(&names, "big-model:free"), "vendor/big-model:free");
        assert_eq!(resolve_alias(&names, "missing"), "missing");
    }

    #[tokio::test]
    async fn chat_rejects_empty_input_before_any_io() {
        let client = OpenRouterClient::with_base_url("key", "http://127.0.0.1:1").unwrap();
        let err = client.chat(&[], "m").await.unwrap_err();
        assert!(matches!(err, UpstreamError::EmptyMessages));

        let err = client
            .chat(&[ChatMessage::user("hi")], "")
            .await
            .unwrap_err();
        assert!(matches!(err, UpstreamError::EmptyModel));
    }
}
