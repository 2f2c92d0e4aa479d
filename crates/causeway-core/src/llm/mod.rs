//! LLM integration over an OpenAI-compatible chat-completions API

mod client;
mod types;

pub use client::{LlmClient, LlmClientBuilder, OPENROUTER_BASE_URL};
pub use types::{ChatRequest, ChatResponse, Choice, FinishReason, LlmResponse, Message, MessageRole, Usage};
