//! `/v1/*` handlers.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::debug;

use orproxy_core::display_name;
use orproxy_protocol::openai::{
    ChatCompletionChunk, ChatCompletionRequest, ChunkChoice, ChunkDelta, EmbeddingsRequest,
    EmbeddingsResponse, ModelEntry, ModelList,
};

use crate::stream::{send_sse_done, send_sse_json, sse_response, FRAME_CHANNEL_CAPACITY};
use crate::{acquire_chat, acquire_stream, openai_error, parse_json, unix_now, AppState};

pub(crate) async fn models(State(state): State<Arc<AppState>>) -> Response {
    if let Some(engine) = &state.engine {
        let created = unix_now();
        let data = engine
            .visible_pool()
            .await
            .into_iter()
            .map(|model| ModelEntry::new(display_name(&model), created))
            .collect();
        return Json(ModelList::new(data)).into_response();
    }

    let catalog = match state.upstream.list_models().await {
        Ok(catalog) => catalog,
        Err(err) => return openai_error(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
    };
    let created = unix_now();
    let data = catalog
        .iter()
        .filter(|m| !state.tool_use_only || m.supports_tool_use())
        .map(|m| display_name(&m.id).to_string())
        .filter(|display| state.filter.matches(display))
        .map(|display| ModelEntry::new(display, created))
        .collect();
    Json(ModelList::new(data)).into_response()
}

pub(crate) async fn chat_completions(State(state): State<Arc<AppState>>, body: Bytes) -> Response {
    let request: ChatCompletionRequest = match parse_json(&body) {
        Ok(request) => request,
        Err(_) => return openai_error(StatusCode::BAD_REQUEST, "Invalid JSON"),
    };
    if request.messages.is_empty() {
        return openai_error(StatusCode::BAD_REQUEST, "Messages cannot be empty");
    }

    if request.stream.unwrap_or(false) {
        streaming(&state, &request).await
    } else {
        non_streaming(&state, &request).await
    }
}

async fn non_streaming(state: &AppState, request: &ChatCompletionRequest) -> Response {
    let (mut response, full_model_name) =
        match acquire_chat(state, &request.model, &request.messages).await {
            Ok(acquired) => acquired,
            Err((status, message)) => return openai_error(status, message),
        };

    response.id = format!("chatcmpl-{}", unix_now());
    response.object = "chat.completion".to_string();
    response.created = unix_now();
    response.model = full_model_name;
    Json(response).into_response()
}

async fn streaming(state: &AppState, request: &ChatCompletionRequest) -> Response {
    let (mut upstream_stream, full_model_name) =
        match acquire_stream(state, &request.model, &request.messages).await {
            Ok(acquired) => acquired,
            Err((status, message)) => return openai_error(status, message),
        };

    let (tx, rx) = mpsc::channel::<Bytes>(FRAME_CHANNEL_CAPACITY);
    tokio::spawn(async move {
        let id = format!("chatcmpl-{}", unix_now());
        let created = unix_now();
        loop {
            match upstream_stream.recv().await {
                Some(Ok(chunk)) => {
                    let choice = chunk.choices.into_iter().next().unwrap_or_default();
                    let frame = ChatCompletionChunk {
                        id: id.clone(),
                        object: "chat.completion.chunk".to_string(),
                        created,
                        model: full_model_name.clone(),
                        choices: vec![ChunkChoice {
                            index: 0,
                            delta: ChunkDelta {
                                role: None,
                                content: choice.delta.content,
                            },
                            finish_reason: choice.finish_reason,
                        }],
                    };
                    if send_sse_json(&tx, &frame).await.is_err() {
                        // Client disconnect releases the upstream stream.
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
        send_sse_done(&tx).await;
    });

    sse_response(rx)
}

pub(crate) async fn embeddings(State(state): State<Arc<AppState>>, body: Bytes) -> Response {
    let request: EmbeddingsRequest = match parse_json(&body) {
        Ok(request) => request,
        Err(_) => return openai_error(StatusCode::BAD_REQUEST, "Invalid JSON"),
    };
    if request.model.is_empty() || request.input.is_empty() {
        return openai_error(StatusCode::BAD_REQUEST, "Model and input are required");
    }

    match state.upstream.embeddings(&request.input, &request.model).await {
        Ok(embedding) => Json(EmbeddingsResponse::single(
            request.model,
            embedding,
            request.input.len(),
        ))
        .into_response(),
        Err(err) => openai_error(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
    }
}
