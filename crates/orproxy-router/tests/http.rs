//! End-to-end tests over a real listener: fake upstream, real engine, real
//! axum surface, real HTTP client.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use orproxy_core::upstream::{ChatStream, Upstream, UpstreamError};
use orproxy_core::{ModelFilter, RouterEngine};
use orproxy_protocol::catalog::CatalogModel;
use orproxy_protocol::openai::{
    ChatChoice, ChatCompletion, ChatCompletionChunk, ChatMessage, ChunkChoice, ChunkDelta, Usage,
};
use orproxy_router::{api_router, AppState};
use orproxy_storage::FailureStore;

enum Outcome {
    Chat(&'static str),
    Stream(Vec<&'static str>),
    Fail(u16, &'static str),
}

#[derive(Default)]
struct FakeUpstream {
    outcomes: Mutex<HashMap<String, VecDeque<Outcome>>>,
    calls: Mutex<Vec<String>>,
}

impl FakeUpstream {
    fn new() -> Self {
        Self::default()
    }

    fn script(&self, model: &str, outcome: Outcome) {
        self.outcomes
            .lock()
            .unwrap()
            .entry(model.to_string())
            .or_default()
            .push_back(outcome);
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn take(&self, model: &str) -> Option<Outcome> {
        self.calls.lock().unwrap().push(model.to_string());
        self.outcomes
            .lock()
            .unwrap()
            .get_mut(model)
            .and_then(|queue| queue.pop_front())
    }
}

fn chunk(model: &str, content: &str) -> ChatCompletionChunk {
    ChatCompletionChunk {
        id: "gen-fake".to_string(),
        object: "chat.completion.chunk".to_string(),
        created: 0,
        model: model.to_string(),
        choices: vec![ChunkChoice {
            index: 0,
            delta: ChunkDelta {
                role: None,
                content: Some(content.to_string()),
            },
            finish_reason: None,
        }],
    }
}

#[async_trait]
impl Upstream for FakeUpstream {
    async fn chat(
        &self,
        _messages: &[ChatMessage],
        model: &str,
    ) -> Result<ChatCompletion, UpstreamError> {
        match self.take(model) {
            Some(Outcome::Chat(content)) => Ok(ChatCompletion {
                id: "gen-fake".to_string(),
                object: "chat.completion".to_string(),
                created: 0,
                model: model.to_string(),
                choices: vec![ChatChoice {
                    index: 0,
                    message: ChatMessage::assistant(content),
                    finish_reason: Some("stop".to_string()),
                }],
                usage: Usage {
                    prompt_tokens: 3,
                    completion_tokens: 5,
                    total_tokens: 8,
                },
            }),
            Some(Outcome::Fail(status, message)) => Err(UpstreamError::Api {
                status,
                message: message.to_string(),
            }),
            _ => Err(UpstreamError::Api {
                status: 404,
                message: "model not found".to_string(),
            }),
        }
    }

    async fn chat_stream(
        &self,
        _messages: &[ChatMessage],
        model: &str,
    ) -> Result<ChatStream, UpstreamError> {
        match self.take(model) {
            Some(Outcome::Stream(deltas)) => Ok(ChatStream::from_chunks(
                deltas.into_iter().map(|d| Ok(chunk(model, d))).collect(),
            )),
            Some(Outcome::Fail(status, message)) => Err(UpstreamError::Api {
                status,
                message: message.to_string(),
            }),
            _ => Err(UpstreamError::Api {
                status: 404,
                message: "model not found".to_string(),
            }),
        }
    }

    async fn list_models(&self) -> Result<Vec<CatalogModel>, UpstreamError> {
        Ok(Vec::new())
    }

    async fn embeddings(&self, _input: &str, _model: &str) -> Result<Vec<f32>, UpstreamError> {
        Ok(vec![0.25, 0.5])
    }

    async fn full_model_name(&self, alias: &str) -> Result<String, UpstreamError> {
        Ok(alias.to_string())
    }
}

async fn free_state(
    upstream: Arc<FakeUpstream>,
    pool: &[&str],
    filter: ModelFilter,
) -> AppState {
    let store = FailureStore::connect(
        "sqlite::memory:",
        Duration::from_secs(300),
        Duration::from_secs(60),
    )
    .await
    .unwrap();
    let engine = Arc::new(RouterEngine::new(
        upstream.clone(),
        store,
        pool.iter().map(|m| m.to_string()).collect(),
        filter.clone(),
    ));
    AppState {
        upstream,
        engine: Some(engine),
        filter: Arc::new(filter),
        tool_use_only: false,
    }
}

async fn spawn_app(state: AppState) -> String {
    let app = api_router(state);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

fn client() -> wreq::Client {
    wreq::Client::builder().build().unwrap()
}

async fn post_json(base: &str, path: &str, body: Value) -> (u16, Value, Option<String>) {
    let resp = client()
        .request(wreq::Method::POST, format!("{base}{path}"))
        .header("Content-Type", "application/json")
        .body(serde_json::to_vec(&body).unwrap())
        .send()
        .await
        .unwrap();
    let status = resp.status().as_u16();
    let content_type = resp
        .headers()
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string());
    let bytes = resp.bytes().await.unwrap();
    let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, value, content_type)
}

async fn post_raw(base: &str, path: &str, body: Value) -> (u16, String, Option<String>) {
    let resp = client()
        .request(wreq::Method::POST, format!("{base}{path}"))
        .header("Content-Type", "application/json")
        .body(serde_json::to_vec(&body).unwrap())
        .send()
        .await
        .unwrap();
    let status = resp.status().as_u16();
    let content_type = resp
        .headers()
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string());
    let bytes = resp.bytes().await.unwrap();
    (status, String::from_utf8_lossy(&bytes).to_string(), content_type)
}

async fn get_json(base: &str, path: &str) -> (u16, Value) {
    let resp = client()
        .request(wreq::Method::GET, format!("{base}{path}"))
        .send()
        .await
        .unwrap();
    let status = resp.status().as_u16();
    let bytes = resp.bytes().await.unwrap();
    (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
}

fn user_message() -> Value {
    json!([{"role": "user", "content": "hi"}])
}

#[tokio::test]
async fn non_streaming_chat_happy_path() {
    let upstream = Arc::new(FakeUpstream::new());
    upstream.script("p/m1:free", Outcome::Chat("Hello!"));
    let base = spawn_app(free_state(upstream, &["p/m1:free"], ModelFilter::default()).await).await;

    let (status, body, _) = post_json(
        &base,
        "/api/chat",
        json!({"model": "m1:free", "messages": user_message(), "stream": false}),
    )
    .await;

    assert_eq!(status, 200);
    assert_eq!(body["model"], "p/m1:free");
    assert_eq!(body["message"]["role"], "assistant");
    assert_eq!(body["message"]["content"], "Hello!");
    assert_eq!(body["done"], true);
    assert_eq!(body["finish_reason"], "stop");
}

#[tokio::test]
async fn empty_model_is_a_validation_error() {
    let upstream = Arc::new(FakeUpstream::new());
    let base = spawn_app(free_state(upstream, &["p/a"], ModelFilter::default()).await).await;

    let (status, body, _) = post_json(
        &base,
        "/api/chat",
        json!({"model": "", "messages": user_message()}),
    )
    .await;
    assert_eq!(status, 400);
    assert!(body["error"].as_str().unwrap().contains("Model name"));

    let (status, _, _) = post_json(&base, "/api/chat", json!({"model": "x", "messages": []})).await;
    assert_eq!(status, 400);
}

#[tokio::test]
async fn permanent_failure_fails_over_and_disappears_from_tags() {
    let upstream = Arc::new(FakeUpstream::new());
    upstream.script("p/a", Outcome::Fail(502, "model not available"));
    upstream.script("p/b", Outcome::Chat("from b"));
    let base = spawn_app(
        free_state(upstream.clone(), &["p/a", "p/b"], ModelFilter::default()).await,
    )
    .await;

    let (status, body, _) = post_json(
        &base,
        "/api/chat",
        json!({"model": "unknown", "messages": user_message(), "stream": false}),
    )
    .await;

    assert_eq!(status, 200);
    assert_eq!(body["model"], "p/b");
    assert_eq!(upstream.calls(), vec!["p/a", "p/b"]);

    let (status, tags) = get_json(&base, "/api/tags").await;
    assert_eq!(status, 200);
    let names: Vec<&str> = tags["models"]
        .as_array()
        .unwrap()
        .iter()
        .map(|m| m["name"].as_str().unwrap())
        .collect();
    assert_eq!(names, vec!["b"]);
}

#[tokio::test]
async fn rate_limited_pool_returns_503_and_skips_upstream() {
    let upstream = Arc::new(FakeUpstream::new());
    upstream.script("p/a", Outcome::Fail(429, "429 too many requests"));
    let base = spawn_app(free_state(upstream.clone(), &["p/a"], ModelFilter::default()).await).await;

    let request = json!({"model": "nope", "messages": user_message(), "stream": false});
    let (status, _, _) = post_json(&base, "/api/chat", request.clone()).await;
    assert_eq!(status, 503);
    assert_eq!(upstream.calls().len(), 1);

    // Inside the rate-limit cooldown the model is suppressed by the store,
    // so the retry fails fast without touching upstream.
    let (status, body, _) = post_json(&base, "/api/chat", request).await;
    assert_eq!(status, 503);
    assert_eq!(body["error"], "no free models available");
    assert_eq!(upstream.calls().len(), 1);
}

#[tokio::test]
async fn sse_stream_frames_and_termination() {
    let upstream = Arc::new(FakeUpstream::new());
    upstream.script("p/m1:free", Outcome::Stream(vec!["Hel", "lo"]));
    let base = spawn_app(free_state(upstream, &["p/m1:free"], ModelFilter::default()).await).await;

    let (status, body, content_type) = post_raw(
        &base,
        "/v1/chat/completions",
        json!({"model": "m1:free", "messages": user_message(), "stream": true}),
    )
    .await;

    assert_eq!(status, 200);
    assert_eq!(content_type.as_deref(), Some("text/event-stream"));

    let frames: Vec<&str> = body.split("\n\n").filter(|f| !f.is_empty()).collect();
    assert_eq!(frames.len(), 3);
    assert_eq!(frames[2], "data: [DONE]");

    let first: Value =
        serde_json::from_str(frames[0].strip_prefix("data: ").unwrap()).unwrap();
    assert_eq!(first["object"], "chat.completion.chunk");
    assert_eq!(first["model"], "p/m1:free");
    assert_eq!(first["choices"][0]["delta"]["content"], "Hel");
    let second: Value =
        serde_json::from_str(frames[1].strip_prefix("data: ").unwrap()).unwrap();
    assert_eq!(second["choices"][0]["delta"]["content"], "lo");
}

#[tokio::test]
async fn ndjson_stream_frames_and_terminal_frame() {
    let upstream = Arc::new(FakeUpstream::new());
    upstream.script("p/m1:free", Outcome::Stream(vec!["to", "ken"]));
    let base = spawn_app(free_state(upstream, &["p/m1:free"], ModelFilter::default()).await).await;

    // Streaming is the default for /api/chat.
    let (status, body, content_type) = post_raw(
        &base,
        "/api/chat",
        json!({"model": "m1:free", "messages": user_message()}),
    )
    .await;

    assert_eq!(status, 200);
    assert_eq!(content_type.as_deref(), Some("application/x-ndjson"));

    let frames: Vec<Value> = body
        .lines()
        .filter(|line| !line.is_empty())
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();
    assert_eq!(frames.len(), 3);
    assert_eq!(frames[0]["message"]["content"], "to");
    assert_eq!(frames[0]["done"], false);
    assert_eq!(frames[1]["message"]["content"], "ken");
    assert_eq!(frames[2]["done"], true);
    assert_eq!(frames[2]["finish_reason"], "stop");
    assert_eq!(frames[2]["message"]["content"], "");
}

#[tokio::test]
async fn filter_limits_tag_listing() {
    let upstream = Arc::new(FakeUpstream::new());
    let base = spawn_app(
        free_state(
            upstream,
            &["p/gemini-2:free", "p/claude-3:free"],
            ModelFilter::from_patterns(vec!["gemini".to_string()]),
        )
        .await,
    )
    .await;

    let (status, tags) = get_json(&base, "/api/tags").await;
    assert_eq!(status, 200);
    let models = tags["models"].as_array().unwrap();
    assert_eq!(models.len(), 1);
    assert_eq!(models[0]["name"], "gemini-2:free");
    assert_eq!(models[0]["model"], "gemini-2:free");
}

#[tokio::test]
async fn openai_models_lists_the_visible_pool() {
    let upstream = Arc::new(FakeUpstream::new());
    let base = spawn_app(
        free_state(upstream, &["p/big:free", "p/small:free"], ModelFilter::default()).await,
    )
    .await;

    let (status, body) = get_json(&base, "/v1/models").await;
    assert_eq!(status, 200);
    assert_eq!(body["object"], "list");
    let ids: Vec<&str> = body["data"]
        .as_array()
        .unwrap()
        .iter()
        .map(|m| m["id"].as_str().unwrap())
        .collect();
    assert_eq!(ids, vec!["big:free", "small:free"]);
}

#[tokio::test]
async fn openai_non_streaming_overwrites_envelope_fields() {
    let upstream = Arc::new(FakeUpstream::new());
    upstream.script("p/m1:free", Outcome::Chat("pong"));
    let base = spawn_app(free_state(upstream, &["p/m1:free"], ModelFilter::default()).await).await;

    let (status, body, _) = post_json(
        &base,
        "/v1/chat/completions",
        json!({"model": "m1:free", "messages": user_message()}),
    )
    .await;

    assert_eq!(status, 200);
    assert_eq!(body["object"], "chat.completion");
    assert_eq!(body["model"], "p/m1:free");
    assert!(body["id"].as_str().unwrap().starts_with("chatcmpl-"));
    assert_eq!(body["choices"][0]["message"]["content"], "pong");
}

#[tokio::test]
async fn stub_endpoints_answer_politely() {
    let upstream = Arc::new(FakeUpstream::new());
    let base = spawn_app(free_state(upstream, &[], ModelFilter::default()).await).await;

    let (status, body, _) = post_json(&base, "/api/create", json!({"name": "x"})).await;
    assert_eq!(status, 200);
    assert!(body["message"].as_str().unwrap().contains("not supported"));

    let (status, body) = get_json(&base, "/api/ps").await;
    assert_eq!(status, 200);
    assert_eq!(body["models"].as_array().unwrap().len(), 0);

    let (status, body) = get_json(&base, "/api/version").await;
    assert_eq!(status, 200);
    assert_eq!(body["version"], "0.1.0");

    let (status, body) = get_json(&base, "/health").await;
    assert_eq!(status, 200);
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn ollama_embeddings_roundtrip() {
    let upstream = Arc::new(FakeUpstream::new());
    let base = spawn_app(free_state(upstream, &[], ModelFilter::default()).await).await;

    let (status, body, _) = post_json(
        &base,
        "/api/embeddings",
        json!({"model": "embed-model", "prompt": "vectorize me"}),
    )
    .await;
    assert_eq!(status, 200);
    assert_eq!(body["embedding"].as_array().unwrap().len(), 2);

    let (status, body, _) = post_json(
        &base,
        "/v1/embeddings",
        json!({"model": "embed-model", "input": "vectorize me"}),
    )
    .await;
    assert_eq!(status, 200);
    assert_eq!(body["object"], "list");
    assert_eq!(body["data"][0]["object"], "embedding");
    assert_eq!(body["data"][0]["index"], 0);
    assert_eq!(body["model"], "embed-model");
    assert_eq!(body["usage"]["prompt_tokens"], 12);
}
