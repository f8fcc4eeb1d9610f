pub mod openrouter;

use async_trait::async_trait;
use serde::{ Deserialize, Serialize };
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use super::LlmConfig;
use super::budget::ReasoningOptions;
use self::openrouter::OpenRouterChatClient;
use crate::models::chat::HistoryEntry;

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("OpenRouter API key is required")]
    MissingApiKey,
    #[error("invalid request header: {0}")] InvalidHeader(String),
    #[error("HTTP request failed: {0}")] Http(#[from] reqwest::Error),
    #[error("upstream returned status {status}: {body}")] Status {
        status: u16,
        body: String,
    },
    #[error("malformed upstream response: {0}")] Malformed(String),
    #[error("upstream request timed out after {0:?}")] Timeout(Duration),
}

/// One completion call: the full ordered history plus sizing for the target model.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub model: String,
    pub messages: Vec<HistoryEntry>,
    pub max_tokens: u32,
    pub temperature: f32,
    pub reasoning: Option<ReasoningOptions>,
    pub timeout: Duration,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct Usage {
    #[serde(default)]
    pub prompt_tokens: u32,
    #[serde(default)]
    pub completion_tokens: u32,
    #[serde(default)]
    pub total_tokens: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompletionResponse {
    pub content: String,
    pub reasoning: Option<String>,
    pub usage: Option<Usage>,
}

#[async_trait]
pub trait ChatClient: Send + Sync {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError>;
}

pub fn new_client(config: &LlmConfig) -> Result<Arc<dyn ChatClient>, LlmError> {
    let client = OpenRouterChatClient::from_config(config)?;
    Ok(Arc::new(client))
}
