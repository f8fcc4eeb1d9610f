pub mod budget;
pub mod chat;
pub mod directory;
pub mod resolver;

use std::time::Duration;
use crate::cli::Args;
use crate::llm::resolver::ResolverSettings;

/// Connection settings for the OpenRouter chat-completions endpoint.
#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub api_key: Option<String>,
    pub base_url: String,
    pub referer: String,
    pub title: String,
    pub default_temperature: f32,
    pub rate_limit_per_minute: u32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: "https://openrouter.ai/api/v1".to_string(),
            referer: "https://claude.ai".to_string(),
            title: "OpenRouter MCP Server".to_string(),
            default_temperature: 0.7,
            rate_limit_per_minute: 60,
        }
    }
}

impl LlmConfig {
    pub fn from_args(args: &Args) -> Self {
        Self {
            api_key: Some(args.api_key.clone()).filter(|k| !k.trim().is_empty()),
            base_url: args.base_url.clone(),
            referer: args.referer.clone(),
            title: args.title.clone(),
            default_temperature: args.default_temperature,
            rate_limit_per_minute: args.rate_limit_per_minute,
        }
    }
}

impl ResolverSettings {
    pub fn from_args(args: &Args) -> Self {
        Self {
            default_model: args.default_model.clone(),
            force_internet_search: args.force_internet_search,
            max_reasoning_tokens: args.max_reasoning_tokens,
            standard_timeout: Duration::from_secs(args.standard_timeout_secs),
            reasoning_timeout: Duration::from_secs(args.reasoning_timeout_secs),
        }
    }
}
