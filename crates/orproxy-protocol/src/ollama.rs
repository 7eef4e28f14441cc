//! Local-inference dialect (`/api/*`) shapes.
//!
//! Frame layout mirrors what Ollama clients expect: NDJSON for streams, one
//! JSON object per line, `done:false` deltas and a `done:true` terminal frame.

use serde::{Deserialize, Serialize};

use crate::openai::ChatMessage;

#[derive(Debug, Clone, Deserialize)]
pub struct ChatRequest {
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub stream: Option<bool>,
}

/// Non-streaming chat response; doubles as the `done:true` terminal frame of
/// a stream (with empty content and zeroed timings).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatResponse {
    pub model: String,
    pub created_at: String,
    pub message: ChatMessage,
    pub done: bool,
    pub finish_reason: String,
    pub total_duration: i64,
    pub load_duration: i64,
    pub prompt_eval_count: i64,
    pub eval_count: i64,
    pub eval_duration: i64,
}

/// Intermediate `done:false` frame of a chat stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatStreamFrame {
    pub model: String,
    pub created_at: String,
    pub message: ChatMessage,
    pub done: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GenerateRequest {
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub prompt: String,
    #[serde(default)]
    pub suffix: Option<String>,
    #[serde(default)]
    pub system: Option<String>,
    #[serde(default)]
    pub template: Option<String>,
    #[serde(default)]
    pub context: Option<Vec<i64>>,
    #[serde(default)]
    pub stream: Option<bool>,
    #[serde(default)]
    pub raw: bool,
    #[serde(default)]
    pub format: Option<String>,
    #[serde(default)]
    pub options: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GenerateResponse {
    pub model: String,
    pub created_at: String,
    pub response: String,
    pub done: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub done_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<Vec<i64>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_duration: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub load_duration: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt_eval_count: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt_eval_duration: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub eval_count: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub eval_duration: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TagsResponse {
    pub models: Vec<TagModel>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TagModel {
    pub name: String,
    pub model: String,
    pub modified_at: String,
    pub size: i64,
    pub digest: String,
    pub details: ModelDetails,
}

pub const STUB_MODEL_SIZE: i64 = 270_898_672;
pub const STUB_MODEL_DIGEST: &str =
    "9077fe9d2ae1a4a41a868836b56b8163731a8fe16621397028c2c76f838c6907";

#[derive(Debug, Clone, Serialize)]
pub struct ModelDetails {
    pub parent_model: String,
    pub format: String,
    pub family: String,
    pub families: Vec<String>,
    pub parameter_size: String,
    pub quantization_level: String,
}

impl ModelDetails {
    /// Fixed detail block; only family and parameter size vary per listing.
    pub fn stub(family: &str, parameter_size: &str) -> Self {
        Self {
            parent_model: String::new(),
            format: "gguf".to_string(),
            family: family.to_string(),
            families: vec![family.to_string()],
            parameter_size: parameter_size.to_string(),
            quantization_level: "Q4_K_M".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ShowRequest {
    #[serde(default, alias = "model")]
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateModelRequest {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub modelfile: Option<String>,
    #[serde(default)]
    pub path: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CopyModelRequest {
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub destination: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeleteModelRequest {
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PullModelRequest {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub stream: Option<bool>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PushModelRequest {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub stream: Option<bool>,
}

/// Fixed 200 body for the model-management operations OpenRouter cannot back.
#[derive(Debug, Clone, Serialize)]
pub struct StatusMessage {
    pub status: &'static str,
    pub message: &'static str,
}

impl StatusMessage {
    pub fn unsupported(message: &'static str) -> Self {
        Self {
            status: "success",
            message,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct EmbeddingsRequest {
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub prompt: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct EmbeddingsResponse {
    pub embedding: Vec<f32>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PsResponse {
    pub models: Vec<RunningModel>,
}

/// Model residency is a local-runtime concept; the proxy is stateless, so
/// `/api/ps` always answers with an empty list of these.
#[derive(Debug, Clone, Serialize)]
pub struct RunningModel {
    pub name: String,
    pub model: String,
    pub size: i64,
    pub digest: String,
    pub details: ModelDetails,
    pub expires_at: String,
    pub size_vram: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct VersionResponse {
    pub version: &'static str,
}
