pub mod catalog;
pub mod ollama;
pub mod openai;
pub mod sse;

pub use openai::ChatMessage;
