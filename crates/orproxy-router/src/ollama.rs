//! `/api/*` handlers.

use std::sync::Arc;
use std::time::Instant;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use bytes::Bytes;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::debug;

use orproxy_core::display_name;
use orproxy_protocol::ollama::{
    ChatRequest, ChatResponse, ChatStreamFrame, CopyModelRequest, CreateModelRequest,
    DeleteModelRequest, EmbeddingsRequest, EmbeddingsResponse, GenerateRequest, GenerateResponse,
    ModelDetails, PsResponse, PullModelRequest, PushModelRequest, ShowRequest, StatusMessage,
    TagModel, TagsResponse, VersionResponse, STUB_MODEL_DIGEST, STUB_MODEL_SIZE,
};
use orproxy_protocol::openai::ChatMessage;

use crate::stream::{ndjson_response, send_json_line, FRAME_CHANNEL_CAPACITY};
use crate::{acquire_chat, acquire_stream, now_rfc3339, ollama_error, parse_json, AppState, VERSION};

pub(crate) async fn chat(State(state): State<Arc<AppState>>, body: Bytes) -> Response {
    let request: ChatRequest = match parse_json(&body) {
        Ok(request) => request,
        Err(err) => return ollama_error(StatusCode::BAD_REQUEST, format!("Invalid JSON: {err}")),
    };
    if request.model.is_empty() {
        return ollama_error(StatusCode::BAD_REQUEST, "Model name is required");
    }
    if request.messages.is_empty() {
        return ollama_error(StatusCode::BAD_REQUEST, "Messages cannot be empty");
    }

    if request.stream.unwrap_or(true) {
        streaming_chat(&state, &request.model, &request.messages).await
    } else {
        non_streaming_chat(&state, &request.model, &request.messages).await
    }
}

async fn non_streaming_chat(state: &AppState, model: &str, messages: &[ChatMessage]) -> Response {
    let (response, full_model_name) = match acquire_chat(state, model, messages).await {
        Ok(acquired) => acquired,
        Err((status, message)) => return ollama_error(status, message),
    };
    let Some(choice) = response.choices.first() else {
        return ollama_error(StatusCode::INTERNAL_SERVER_ERROR, "No response");
    };

    let finish_reason = choice
        .finish_reason
        .clone()
        .filter(|reason| !reason.is_empty())
        .unwrap_or_else(|| "stop".to_string());
    Json(ChatResponse {
        model: full_model_name,
        created_at: now_rfc3339(),
        message: ChatMessage::assistant(choice.message.content.clone()),
        done: true,
        finish_reason,
        total_duration: response.usage.total_tokens * 10,
        load_duration: 0,
        prompt_eval_count: response.usage.prompt_tokens,
        eval_count: response.usage.completion_tokens,
        eval_duration: response.usage.completion_tokens * 10,
    })
    .into_response()
}

async fn streaming_chat(state: &AppState, model: &str, messages: &[ChatMessage]) -> Response {
    let (mut upstream_stream, full_model_name) = match acquire_stream(state, model, messages).await
    {
        Ok(acquired) => acquired,
        Err((status, message)) => return ollama_error(status, message),
    };

    let (tx, rx) = mpsc::channel::<Bytes>(FRAME_CHANNEL_CAPACITY);
    tokio::spawn(async move {
        let mut finish_reason: Option<String> = None;
        loop {
            match upstream_stream.recv().await {
                Some(Ok(chunk)) => {
                    let Some(choice) = chunk.choices.first() else {
                        continue;
                    };
                    if let Some(reason) = &choice.finish_reason {
                        if !reason.is_empty() {
                            finish_reason = Some(reason.clone());
                        }
                    }
                    let frame = ChatStreamFrame {
                        model: full_model_name.clone(),
                        created_at: now_rfc3339(),
                        message: ChatMessage::assistant(
                            choice.delta.content.clone().unwrap_or_default(),
                        ),
                        done: false,
                    };
                    if send_json_line(&tx, &frame).await.is_err() {
                        // Client disconnect; dropping the stream handle is the
                        // release, and no failure is recorded for the model.
                        return;
                    }
                }
                Some(Err(err)) => {
                    debug!(error = %err, "stream ended with upstream error");
                    let _ = send_json_line(
                        &tx,
                        &json!({"error": format!("Stream error: {err}")}),
                    )
                    .await;
                    break;
                }
                None => break,
            }
        }

        let terminal = ChatResponse {
            model: full_model_name,
            created_at: now_rfc3339(),
            message: ChatMessage::assistant(""),
            done: true,
            finish_reason: finish_reason.unwrap_or_else(|| "stop".to_string()),
            total_duration: 0,
            load_duration: 0,
            prompt_eval_count: 0,
            eval_count: 0,
            eval_duration: 0,
        };
        let _ = send_json_line(&tx, &terminal).await;
    });

    ndjson_response(rx)
}

pub(crate) async fn generate(State(state): State<Arc<AppState>>, body: Bytes) -> Response {
    let started_at = Instant::now();
    let request: GenerateRequest = match parse_json(&body) {
        Ok(request) => request,
        Err(err) => return ollama_error(StatusCode::BAD_REQUEST, err),
    };
    if request.model.is_empty() {
        return ollama_error(StatusCode::BAD_REQUEST, "Model name is required");
    }
    if request.prompt.is_empty() {
        return ollama_error(StatusCode::BAD_REQUEST, "Prompt is required");
    }

    let mut messages = Vec::new();
    if let Some(system) = request.system.as_deref().filter(|s| !s.is_empty()) {
        messages.push(ChatMessage::system(system));
    }
    messages.push(ChatMessage::user(request.prompt.clone()));

    if request.stream.unwrap_or(true) {
        streaming_generate(&state, &request.model, &messages, started_at).await
    } else {
        non_streaming_generate(&state, &request.model, &messages, started_at).await
    }
}

async fn non_streaming_generate(
    state: &AppState,
    model: &str,
    messages: &[ChatMessage],
    started_at: Instant,
) -> Response {
    let (response, full_model_name) = match acquire_chat(state, model, messages).await {
        Ok(acquired) => acquired,
        Err((status, message)) => return ollama_error(status, message),
    };
    let Some(choice) = response.choices.first() else {
        return ollama_error(StatusCode::INTERNAL_SERVER_ERROR, "No response");
    };

    Json(GenerateResponse {
        model: full_model_name,
        created_at: now_rfc3339(),
        response: choice.message.content.clone(),
        done: true,
        done_reason: Some("stop".to_string()),
        total_duration: Some(started_at.elapsed().as_nanos() as i64),
        prompt_eval_count: Some(response.usage.prompt_tokens),
        eval_count: Some(response.usage.completion_tokens),
        ..Default::default()
    })
    .into_response()
}

async fn streaming_generate(
    state: &AppState,
    model: &str,
    messages: &[ChatMessage],
    started_at: Instant,
) -> Response {
    let (mut upstream_stream, full_model_name) = match acquire_stream(state, model, messages).await
    {
        Ok(acquired) => acquired,
        Err((status, message)) => return ollama_error(status, message),
    };

    let (tx, rx) = mpsc::channel::<Bytes>(FRAME_CHANNEL_CAPACITY);
    tokio::spawn(async move {
        let mut eval_count: i64 = 0;
        loop {
            match upstream_stream.recv().await {
                Some(Ok(chunk)) => {
                    let Some(choice) = chunk.choices.first() else {
                        continue;
                    };
                    eval_count += 1;
                    let frame = GenerateResponse {
                        model: full_model_name.clone(),
                        created_at: now_rfc3339(),
                        response: choice.delta.content.clone().unwrap_or_default(),
                        done: false,
                        ..Default::default()
                    };
                    if send_json_line(&tx, &frame).await.is_err() {
                        return;
                    }
                }
                Some(Err(err)) => {
                    debug!(error = %err, "stream ended with upstream error");
                    break;
                }
                None => break,
            }
        }

        let terminal = GenerateResponse {
            model: full_model_name,
            created_at: now_rfc3339(),
            response: String::new(),
            done: true,
            done_reason: Some("stop".to_string()),
            total_duration: Some(started_at.elapsed().as_nanos() as i64),
            eval_count: Some(eval_count),
            ..Default::default()
        };
        let _ = send_json_line(&tx, &terminal).await;
    });

    ndjson_response(rx)
}

pub(crate) async fn tags(State(state): State<Arc<AppState>>) -> Response {
    if let Some(engine) = &state.engine {
        let now = now_rfc3339();
        let models = engine
            .visible_pool()
            .await
            .into_iter()
            .map(|model| {
                let display = display_name(&model).to_string();
                TagModel {
                    name: display.clone(),
                    model: display,
                    modified_at: now.clone(),
                    size: STUB_MODEL_SIZE,
                    digest: STUB_MODEL_DIGEST.to_string(),
                    details: ModelDetails::stub("free", "varies"),
                }
            })
            .collect();
        return Json(TagsResponse { models }).into_response();
    }

    let catalog = match state.upstream.list_models().await {
        Ok(catalog) => catalog,
        Err(err) => return ollama_error(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
    };
    let now = now_rfc3339();
    let models = catalog
        .iter()
        .filter(|m| !state.tool_use_only || m.supports_tool_use())
        .map(|m| display_name(&m.id).to_string())
        .filter(|display| state.filter.matches(display))
        .map(|display| {
            if state.tool_use_only {
                TagModel {
                    name: display.clone(),
                    model: display,
                    modified_at: now.clone(),
                    size: STUB_MODEL_SIZE,
                    digest: STUB_MODEL_DIGEST.to_string(),
                    details: ModelDetails::stub("tool-enabled", "varies"),
                }
            } else {
                TagModel {
                    name: display.clone(),
                    model: display.clone(),
                    modified_at: now.clone(),
                    size: 0,
                    digest: display,
                    details: ModelDetails::stub("claude", "175B"),
                }
            }
        })
        .collect();
    Json(TagsResponse { models }).into_response()
}

pub(crate) async fn show(body: Bytes) -> Response {
    let request: ShowRequest = match parse_json(&body) {
        Ok(request) => request,
        Err(_) => return ollama_error(StatusCode::BAD_REQUEST, "Invalid JSON payload"),
    };
    if request.name.is_empty() {
        return ollama_error(StatusCode::BAD_REQUEST, "Model name is required");
    }

    Json(json!({
        "license": "STUB License",
        "system": "STUB SYSTEM",
        "modifiedAt": now_rfc3339(),
        "details": {
            "format": "gguf",
            "parameter_size": "200B",
            "quantization_level": "Q4_K_M",
        },
        "model_info": {
            "architecture": "STUB",
            "context_length": 200_000,
            "parameter_count": 200_000_000_000u64,
        },
    }))
    .into_response()
}

pub(crate) async fn create_model(body: Bytes) -> Response {
    let request: CreateModelRequest = match parse_json(&body) {
        Ok(request) => request,
        Err(err) => return ollama_error(StatusCode::BAD_REQUEST, err),
    };
    if request.name.is_empty() {
        return ollama_error(StatusCode::BAD_REQUEST, "Model name is required");
    }
    Json(StatusMessage::unsupported(
        "Model creation is not supported with OpenRouter provider",
    ))
    .into_response()
}

pub(crate) async fn copy_model(body: Bytes) -> Response {
    let request: CopyModelRequest = match parse_json(&body) {
        Ok(request) => request,
        Err(err) => return ollama_error(StatusCode::BAD_REQUEST, err),
    };
    if request.source.is_empty() || request.destination.is_empty() {
        return ollama_error(StatusCode::BAD_REQUEST, "Source and destination are required");
    }
    Json(StatusMessage::unsupported(
        "Model copy is not supported with OpenRouter provider",
    ))
    .into_response()
}

pub(crate) async fn delete_model(body: Bytes) -> Response {
    let request: DeleteModelRequest = match parse_json(&body) {
        Ok(request) => request,
        Err(err) => return ollama_error(StatusCode::BAD_REQUEST, err),
    };
    if request.name.is_empty() {
        return ollama_error(StatusCode::BAD_REQUEST, "Model name is required");
    }
    Json(StatusMessage::unsupported(
        "Model deletion is not supported with OpenRouter provider",
    ))
    .into_response()
}

pub(crate) async fn pull_model(body: Bytes) -> Response {
    let request: PullModelRequest = match parse_json(&body) {
        Ok(request) => request,
        Err(err) => return ollama_error(StatusCode::BAD_REQUEST, err),
    };
    if request.name.is_empty() {
        return ollama_error(StatusCode::BAD_REQUEST, "Model name is required");
    }
    Json(StatusMessage::unsupported(
        "Model pull is not required with OpenRouter provider",
    ))
    .into_response()
}

pub(crate) async fn push_model(body: Bytes) -> Response {
    let request: PushModelRequest = match parse_json(&body) {
        Ok(request) => request,
        Err(err) => return ollama_error(StatusCode::BAD_REQUEST, err),
    };
    if request.name.is_empty() {
        return ollama_error(StatusCode::BAD_REQUEST, "Model name is required");
    }
    Json(StatusMessage::unsupported(
        "Model push is not supported with OpenRouter provider",
    ))
    .into_response()
}

pub(crate) async fn embeddings(State(state): State<Arc<AppState>>, body: Bytes) -> Response {
    let request: EmbeddingsRequest = match parse_json(&body) {
        Ok(request) => request,
        Err(err) => return ollama_error(StatusCode::BAD_REQUEST, err),
    };
    if request.model.is_empty() || request.prompt.is_empty() {
        return ollama_error(StatusCode::BAD_REQUEST, "Model and prompt are required");
    }

    match state.upstream.embeddings(&request.prompt, &request.model).await {
        Ok(embedding) => Json(EmbeddingsResponse { embedding }).into_response(),
        Err(err) => ollama_error(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
    }
}

pub(crate) async fn running_models() -> Response {
    Json(PsResponse { models: Vec::new() }).into_response()
}

pub(crate) async fn version() -> Response {
    Json(VersionResponse { version: VERSION }).into_response()
}
