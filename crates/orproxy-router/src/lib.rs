//! HTTP surface: the Ollama-shaped `/api/*` routes and the OpenAI-shaped
//! `/v1/*` routes over one shared state.

mod ollama;
mod openai;
mod stream;

use std::sync::Arc;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::de::DeserializeOwned;
use serde_json::json;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use orproxy_core::{ModelFilter, RouteError, RouterEngine, Upstream};
use orproxy_protocol::openai::{ChatCompletion, ChatMessage};

pub const VERSION: &str = "0.1.0";

/// Everything the handlers share. Built once at startup; the engine is only
/// present in free mode.
pub struct AppState {
    pub upstream: Arc<dyn Upstream>,
    pub engine: Option<Arc<RouterEngine>>,
    pub filter: Arc<ModelFilter>,
    pub tool_use_only: bool,
}

pub fn api_router(state: AppState) -> Router {
    let state = Arc::new(state);
    Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        // Local-inference dialect
        .route("/api/chat", post(ollama::chat))
        .route("/api/generate", post(ollama::generate))
        .route("/api/tags", get(ollama::tags))
        .route("/api/show", post(ollama::show))
        .route("/api/create", post(ollama::create_model))
        .route("/api/copy", post(ollama::copy_model))
        .route("/api/delete", delete(ollama::delete_model))
        .route("/api/pull", post(ollama::pull_model))
        .route("/api/push", post(ollama::push_model))
        .route("/api/embeddings", post(ollama::embeddings))
        .route("/api/ps", get(ollama::running_models))
        .route("/api/version", get(ollama::version))
        // Chat-completions dialect
        .route("/v1/models", get(openai::models))
        .route("/v1/chat/completions", post(openai::chat_completions))
        .route("/v1/embeddings", post(openai::embeddings))
        .with_state(state)
}

async fn root() -> &'static str {
    "Ollama is running"
}

async fn health() -> Response {
    Json(json!({"status": "ok"})).into_response()
}

pub(crate) fn now_rfc3339() -> String {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_default()
}

pub(crate) fn unix_now() -> i64 {
    OffsetDateTime::now_utc().unix_timestamp()
}

pub(crate) fn parse_json<T: DeserializeOwned>(body: &[u8]) -> Result<T, String> {
    serde_json::from_slice(body).map_err(|err| err.to_string())
}

pub(crate) fn ollama_error(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({"error": message.into()}))).into_response()
}

pub(crate) fn openai_error(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({"error": {"message": message.into()}}))).into_response()
}

fn route_error_status(err: &RouteError) -> StatusCode {
    match err {
        RouteError::AllModelsFailed(_) | RouteError::NoFreeModels => StatusCode::SERVICE_UNAVAILABLE,
    }
}

/// Resolve and call the upstream in buffered mode, free or direct.
pub(crate) async fn acquire_chat(
    state: &AppState,
    model: &str,
    messages: &[ChatMessage],
) -> Result<(ChatCompletion, String), (StatusCode, String)> {
    match &state.engine {
        Some(engine) => engine
            .chat_for_model(messages, model)
            .await
            .map_err(|err| (route_error_status(&err), err.to_string())),
        None => {
            let full = state
                .upstream
                .full_model_name(model)
                .await
                .map_err(|err| (StatusCode::NOT_FOUND, err.to_string()))?;
            let response = state
                .upstream
                .chat(messages, &full)
                .await
                .map_err(|err| (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()))?;
            Ok((response, full))
        }
    }
}

/// Resolve and open an upstream stream, free or direct. Any failover happens
/// in here, before the response starts.
pub(crate) async fn acquire_stream(
    state: &AppState,
    model: &str,
    messages: &[ChatMessage],
) -> Result<(orproxy_core::ChatStream, String), (StatusCode, String)> {
    match &state.engine {
        Some(engine) => engine
            .stream_for_model(messages, model)
            .await
            .map_err(|err| (route_error_status(&err), err.to_string())),
        None => {
            let full = state
                .upstream
                .full_model_name(model)
                .await
                .map_err(|err| (StatusCode::NOT_FOUND, err.to_string()))?;
            let stream = state
                .upstream
                .chat_stream(messages, &full)
                .await
                .map_err(|err| (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()))?;
            Ok((stream, full))
        }
    }
}
