use async_trait::async_trait;
use governor::{ RateLimiter, Quota, state::{ InMemoryState, NotKeyed }, clock::DefaultClock };
use log::{ debug, error, info };
use reqwest::{ Client as HttpClient, header::{ HeaderMap, HeaderValue, CONTENT_TYPE, AUTHORIZATION } };
use serde::{ Deserialize, Serialize };
use std::num::NonZeroU32;

use super::{ ChatClient, CompletionRequest, CompletionResponse, LlmError, Usage };
use crate::llm::LlmConfig;
use crate::llm::budget::ReasoningOptions;

pub struct OpenRouterChatClient {
    http: HttpClient,
    base_url: String,
    limiter: Option<RateLimiter<NotKeyed, InMemoryState, DefaultClock>>,
}

#[derive(Serialize, Deserialize)]
struct OpenRouterMessage {
    role: String,
    #[serde(default)]
    content: Option<String>,
    #[serde(default, skip_serializing)]
    reasoning: Option<String>,
}

#[derive(Serialize)]
struct OpenRouterChatRequest<'a> {
    model: &'a str,
    messages: Vec<OpenRouterMessage>,
    max_tokens: u32,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    reasoning: Option<&'a ReasoningOptions>,
}

#[derive(Deserialize)]
struct OpenRouterResponse {
    #[serde(default)]
    choices: Vec<OpenRouterChoice>,
    #[serde(default)]
    usage: Option<Usage>,
    #[serde(default)]
    error: Option<OpenRouterError>,
}

#[derive(Deserialize)]
struct OpenRouterChoice {
    message: OpenRouterMessage,
}

#[derive(Deserialize)]
struct OpenRouterError {
    #[serde(default)]
    code: Option<serde_json::Value>,
    #[serde(default)]
    message: String,
}

fn build_body(request: &CompletionRequest) -> OpenRouterChatRequest<'_> {
    let messages = request.messages
        .iter()
        .map(|m| OpenRouterMessage {
            role: m.role.as_str().to_string(),
            content: Some(m.content.clone()),
            reasoning: None,
        })
        .collect();

    OpenRouterChatRequest {
        model: &request.model,
        messages,
        max_tokens: request.max_tokens,
        temperature: request.temperature,
        reasoning: request.reasoning.as_ref(),
    }
}

/// Extracts `choices[0].message` and `usage` from a response body.
fn parse_completion(body: &str) -> Result<CompletionResponse, LlmError> {
    let resp: OpenRouterResponse = serde_json
        ::from_str(body)
        .map_err(|e| LlmError::Malformed(format!("invalid JSON: {}", e)))?;

    if let Some(err) = resp.error {
        let code = err.code.map(|c| c.to_string()).unwrap_or_else(|| "unknown".to_string());
        return Err(LlmError::Malformed(format!("upstream error {}: {}", code, err.message)));
    }

    let message = resp.choices
        .into_iter()
        .next()
        .ok_or_else(|| LlmError::Malformed("response has no choices".to_string()))?.message;

    let reasoning = message.reasoning.filter(|r| !r.trim().is_empty());
    let content = match (message.content, &reasoning) {
        (Some(content), _) => content,
        (None, Some(_)) => String::new(),
        (None, None) => {
            return Err(LlmError::Malformed("response message has no content".to_string()));
        }
    };

    Ok(CompletionResponse {
        content,
        reasoning,
        usage: resp.usage,
    })
}

impl OpenRouterChatClient {
    pub fn new(
        api_key: String,
        base_url: String,
        referer: &str,
        title: &str,
        rate_limit_per_minute: u32
    ) -> Result<Self, LlmError> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", api_key)).map_err(|e|
                LlmError::InvalidHeader(format!("Invalid API key format: {}", e))
            )?
        );
        headers.insert(
            "http-referer",
            HeaderValue::from_str(referer).map_err(|e|
                LlmError::InvalidHeader(format!("Invalid referer: {}", e))
            )?
        );
        headers.insert(
            "x-title",
            HeaderValue::from_str(title).map_err(|e|
                LlmError::InvalidHeader(format!("Invalid title: {}", e))
            )?
        );

        let http = HttpClient::builder().default_headers(headers).build()?;
        let limiter = NonZeroU32::new(rate_limit_per_minute).map(|n|
            RateLimiter::direct(Quota::per_minute(n))
        );

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            limiter,
        })
    }

    pub fn from_config(config: &LlmConfig) -> Result<Self, LlmError> {
        let api_key = config.api_key.clone().ok_or(LlmError::MissingApiKey)?;
        Self::new(
            api_key,
            config.base_url.clone(),
            &config.referer,
            &config.title,
            config.rate_limit_per_minute
        )
    }
}

#[async_trait]
impl ChatClient for OpenRouterChatClient {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        if let Some(limiter) = &self.limiter {
            limiter.until_ready().await;
        }

        let url = format!("{}/chat/completions", self.base_url);
        let body = build_body(&request);
        info!(
            "Calling OpenRouter model {} with {} messages, max_tokens {}, reasoning {:?}",
            request.model,
            request.messages.len(),
            request.max_tokens,
            request.reasoning.as_ref().map(|r| r.max_tokens())
        );

        let resp = self.http
            .post(&url)
            .timeout(request.timeout)
            .json(&body)
            .send().await
            .map_err(|e| {
                if e.is_timeout() { LlmError::Timeout(request.timeout) } else { LlmError::Http(e) }
            })?;

        let status = resp.status();
        let text = resp.text().await.map_err(|e| {
            if e.is_timeout() { LlmError::Timeout(request.timeout) } else { LlmError::Http(e) }
        })?;

        if !status.is_success() {
            error!("OpenRouter returned {} for model {}: {}", status, request.model, text);
            return Err(LlmError::Status {
                status: status.as_u16(),
                body: text,
            });
        }

        debug!("OpenRouter response length: {} bytes", text.len());
        parse_completion(&text)
    }
}
