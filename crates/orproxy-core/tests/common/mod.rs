#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;

use orproxy_core::upstream::{ChatStream, Upstream, UpstreamError};
use orproxy_protocol::catalog::CatalogModel;
use orproxy_protocol::openai::{
    ChatChoice, ChatCompletion, ChatCompletionChunk, ChatMessage, ChunkChoice, ChunkDelta, Usage,
};

/// One scripted reply for a given model.
pub enum Outcome {
    Chat(&'static str),
    Stream(Vec<&'static str>),
    Fail(u16, &'static str),
}

/// Deterministic stand-in for the OpenRouter client. Replies are scripted
/// per model and consumed in order; unscripted models answer 404.
#[derive(Default)]
pub struct FakeUpstream {
    outcomes: Mutex<HashMap<String, VecDeque<Outcome>>>,
    catalog: Mutex<VecDeque<Result<Vec<CatalogModel>, (u16, &'static str)>>>,
    calls: Mutex<Vec<String>>,
    list_calls: Mutex<usize>,
}

impl FakeUpstream {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(&self, model: &str, outcome: Outcome) {
        self.outcomes
            .lock()
            .unwrap()
            .entry(model.to_string())
            .or_default()
            .push_back(outcome);
    }

    pub fn script_catalog(&self, result: Result<Vec<CatalogModel>, (u16, &'static str)>) {
        self.catalog.lock().unwrap().push_back(result);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn list_calls(&self) -> usize {
        *self.list_calls.lock().unwrap()
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

pub fn completion(model: &str, content: &str) -> ChatCompletion {
    ChatCompletion {
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
    }
}

pub fn delta_chunk(model: &str, content: &str) -> ChatCompletionChunk {
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
            Some(Outcome::Chat(content)) => Ok(completion(model, content)),
            Some(Outcome::Stream(deltas)) => Ok(completion(model, &deltas.concat())),
            Some(Outcome::Fail(status, message)) => Err(UpstreamError::Api {
                status,
                message: message.to_string(),
            }),
            None => Err(UpstreamError::Api {
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
                deltas
                    .into_iter()
                    .map(|delta| Ok(delta_chunk(model, delta)))
                    .collect(),
            )),
            Some(Outcome::Chat(content)) => {
                Ok(ChatStream::from_chunks(vec![Ok(delta_chunk(model, content))]))
            }
            Some(Outcome::Fail(status, message)) => Err(UpstreamError::Api {
                status,
                message: message.to_string(),
            }),
            None => Err(UpstreamError::Api {
                status: 404,
                message: "model not found".to_string(),
            }),
        }
    }

    async fn list_models(&self) -> Result<Vec<CatalogModel>, UpstreamError> {
        *self.list_calls.lock().unwrap() += 1;
        match self.catalog.lock().unwrap().pop_front() {
            Some(Ok(models)) => Ok(models),
            Some(Err((status, message))) => Err(UpstreamError::Api {
                status,
                message: message.to_string(),
            }),
            None => Err(UpstreamError::Api {
                status: 500,
                message: "unscripted catalog fetch".to_string(),
            }),
        }
    }

    async fn embeddings(&self, _input: &str, _model: &str) -> Result<Vec<f32>, UpstreamError> {
        Ok(vec![0.1, 0.2, 0.3])
    }

    async fn full_model_name(&self, alias: &str) -> Result<String, UpstreamError> {
        Ok(alias.to_string())
    }
}
