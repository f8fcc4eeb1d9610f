use crate::history::{ ConversationStore, StoreError };
use crate::llm::budget::cap_requested_output_tokens;
use crate::llm::chat::{ ChatClient, CompletionRequest, LlmError, Usage };
use crate::llm::directory::Capability;
use crate::llm::resolver::ModelResolver;
use crate::models::chat::{ Conversation, ConversationSummary, Metadata, Role };
use crate::models::mcp::ChatArgs;

use log::{ info, warn, error, debug };
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tokio::fs;
use tokio_util::sync::CancellationToken;

const REASONING_HEADER: &str = "## Reasoning";
const ANSWER_SEPARATOR: &str = "\n\n---\n\n";

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("{0}")] InvalidArgument(String),
    #[error("conversation not found: {0}")] NotFound(String),
    #[error("conversation storage failed: {source}")] Storage {
        #[source]
        source: StoreError,
        continuation_id: Option<String>,
    },
    #[error("conversation storage did not confirm the write for {continuation_id}")] Unconfirmed {
        continuation_id: String,
    },
    #[error("model {model} request failed: {source}")] Upstream {
        #[source]
        source: LlmError,
        model: String,
        continuation_id: String,
    },
    #[error("request cancelled")] Cancelled {
        continuation_id: Option<String>,
    },
}

impl AgentError {
    pub fn kind(&self) -> &'static str {
        match self {
            AgentError::InvalidArgument(_) => "invalid_argument",
            AgentError::NotFound(_) => "not_found",
            AgentError::Storage { .. } | AgentError::Unconfirmed { .. } => "storage_failure",
            AgentError::Upstream { .. } => "upstream_failure",
            AgentError::Cancelled { .. } => "cancelled",
        }
    }

    pub fn continuation_id(&self) -> Option<&str> {
        match self {
            AgentError::Storage { continuation_id, .. } => continuation_id.as_deref(),
            AgentError::Cancelled { continuation_id } => continuation_id.as_deref(),
            AgentError::Unconfirmed { continuation_id } => Some(continuation_id.as_str()),
            AgentError::Upstream { continuation_id, .. } => Some(continuation_id.as_str()),
            AgentError::InvalidArgument(_) | AgentError::NotFound(_) => None,
        }
    }

    pub fn model(&self) -> Option<&str> {
        match self {
            AgentError::Upstream { model, .. } => Some(model.as_str()),
            _ => None,
        }
    }

    fn storage(source: StoreError, continuation_id: Option<&str>) -> Self {
        AgentError::Storage {
            source,
            continuation_id: continuation_id.map(str::to_string),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatReply {
    pub text: String,
    pub continuation_id: String,
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelEntry {
    pub alias: String,
    pub model: String,
    pub capabilities: Vec<String>,
    pub context_window: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelListing {
    pub default_model: String,
    pub models: Vec<ModelEntry>,
    pub suggestions: Vec<String>,
}

/// Places reasoning text ahead of the answer under a visible header.
pub fn merge_reasoning(reasoning: Option<&str>, content: &str) -> String {
    match reasoning.map(str::trim).filter(|r| !r.is_empty()) {
        Some(reasoning) => format!("{}\n\n{}{}{}", REASONING_HEADER, reasoning, ANSWER_SEPARATOR, content),
        None => content.to_string(),
    }
}

/// Appends labeled file contents and image references to the prompt.
pub async fn enrich_prompt(prompt: &str, files: &[String], images: &[String]) -> String {
    let mut parts = Vec::with_capacity(files.len() + images.len());

    for file_path in files {
        match fs::read_to_string(file_path).await {
            Ok(content) => parts.push(format!("File: {}\n```\n{}\n```", file_path, content)),
            Err(e) => {
                warn!("Could not read attached file {}: {}", file_path, e);
                parts.push(format!("Error reading {}: {}", file_path, e));
            }
        }
    }

    for image_path in images {
        if fs::try_exists(Path::new(image_path)).await.unwrap_or(false) {
            parts.push(format!("Image: {}", image_path));
        } else {
            parts.push(format!("Image not found: {}", image_path));
        }
    }

    if parts.is_empty() {
        prompt.to_string()
    } else {
        format!("{}\n\nContext:\n{}", prompt, parts.join("\n\n"))
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

pub struct ChatAgent {
    store: Arc<ConversationStore>,
    resolver: Arc<ModelResolver>,
    chat_client: Arc<dyn ChatClient>,
    default_temperature: f32,
}

impl ChatAgent {
    pub fn new(
        store: Arc<ConversationStore>,
        resolver: Arc<ModelResolver>,
        chat_client: Arc<dyn ChatClient>,
        default_temperature: f32
    ) -> Self {
        Self {
            store,
            resolver,
            chat_client,
            default_temperature,
        }
    }

    /// Returns the conversation to continue, creating a fresh one when the caller gave
    /// no id or an id that does not exist.
    async fn open_conversation(&self, requested: Option<&str>) -> Result<String, AgentError> {
        if let Some(id) = requested {
            match self.store.load(id).await {
                Ok(Some(conversation)) => {
                    info!(
                        "CONTINUATION: Continuing conversation {} with {} messages",
                        id,
                        conversation.messages.len()
                    );
                    return Ok(id.to_string());
                }
                Ok(None) => {
                    warn!("CONTINUATION: Conversation {} not found, starting a new one", id);
                }
                Err(e) => {
                    return Err(AgentError::storage(e, Some(id)));
                }
            }
        }

        let id = self.store.create().await.map_err(|e| AgentError::storage(e, None))?;
        info!("CONTINUATION: Created new conversation: {}", id);
        Ok(id)
    }

    pub async fn run_chat(
        &self,
        args: ChatArgs,
        cancel: CancellationToken
    ) -> Result<ChatReply, AgentError> {
        let prompt = args.prompt.trim();
        if prompt.is_empty() {
            return Err(AgentError::InvalidArgument("prompt must not be empty".to_string()));
        }
        if let Some(t) = args.temperature {
            if !(0.0..=2.0).contains(&t) {
                return Err(
                    AgentError::InvalidArgument(format!("temperature must be between 0 and 2, got {}", t))
                );
            }
        }

        let (canonical, model) = match non_empty(&args.custom_model) {
            Some(custom) => (custom.to_string(), custom.to_string()),
            None => {
                let requested = non_empty(&args.model).unwrap_or("");
                let canonical = self.resolver.resolve(requested, prompt);
                let model = self.resolver.dispatch_id(
                    &canonical,
                    args.force_internet_search.unwrap_or(true)
                );
                (canonical, model)
            }
        };

        let continuation_id = self.open_conversation(non_empty(&args.continuation_id)).await?;
        info!(
            "Chat request - Model: {} (dispatch {}), Files: {}, Images: {}, Continuation: {}",
            canonical,
            model,
            args.files.len(),
            args.images.len(),
            continuation_id
        );
        if
            !args.images.is_empty() &&
            !self.resolver.directory().has_capability(&canonical, Capability::Vision)
        {
            warn!("Model {} is not known to support images; sending references only", canonical);
        }

        let content = enrich_prompt(prompt, &args.files, &args.images).await;

        let mut metadata = Metadata::new();
        metadata.insert("model".into(), model.as_str().into());
        metadata.insert("file_count".into(), args.files.len().into());
        metadata.insert("image_count".into(), args.images.len().into());

        info!("STORAGE: Adding user message to conversation {}", continuation_id);
        let appended = self.store
            .append(&continuation_id, Role::User, &content, Some(metadata)).await
            .map_err(|e| AgentError::storage(e, Some(&continuation_id)))?;
        if !appended {
            error!("STORAGE: User message was not confirmed for conversation {}", continuation_id);
            return Err(AgentError::Unconfirmed { continuation_id });
        }

        let messages = self.store
            .history(&continuation_id, None).await
            .map_err(|e| AgentError::storage(e, Some(&continuation_id)))?;
        debug!("Sending {} history messages to {}", messages.len(), model);

        let max_tokens = match args.max_tokens {
            Some(requested) => cap_requested_output_tokens(&model, requested),
            None => self.resolver.compute_max_output_tokens(&model, &messages),
        };
        let request = CompletionRequest {
            reasoning: self.resolver.reasoning_options(&model, args.thinking_effort.as_deref()),
            timeout: self.resolver.request_timeout(&model),
            temperature: args.temperature.unwrap_or(self.default_temperature),
            model: model.clone(),
            messages,
            max_tokens,
        };

        let result =
            tokio::select! {
            _ = cancel.cancelled() => {
                warn!("Chat request for conversation {} was cancelled", continuation_id);
                return Err(AgentError::Cancelled { continuation_id: Some(continuation_id) });
            }
            result = self.chat_client.complete(request) => result,
        };

        let response = result.map_err(|source| {
            error!("Model {} failed for conversation {}: {}", model, continuation_id, source);
            AgentError::Upstream {
                source,
                model: model.clone(),
                continuation_id: continuation_id.clone(),
            }
        })?;

        let mut metadata = Metadata::new();
        metadata.insert("model".into(), model.as_str().into());
        metadata.insert("has_reasoning".into(), response.reasoning.is_some().into());
        if let Some(usage) = &response.usage {
            metadata.insert("prompt_tokens".into(), usage.prompt_tokens.into());
            metadata.insert("completion_tokens".into(), usage.completion_tokens.into());
            metadata.insert("total_tokens".into(), usage.total_tokens.into());
        }

        let text = merge_reasoning(response.reasoning.as_deref(), &response.content);
        match
            self.store.append(&continuation_id, Role::Assistant, &text, Some(metadata)).await
        {
            Ok(true) => {
                info!("STORAGE: Stored assistant reply in conversation {}", continuation_id);
            }
            Ok(false) => {
                error!("STORAGE: Assistant reply was not confirmed for conversation {}", continuation_id);
            }
            Err(e) => {
                error!("STORAGE: Failed to store assistant reply for {}: {}", continuation_id, e);
            }
        }

        Ok(ChatReply {
            text,
            continuation_id,
            model,
            usage: response.usage,
        })
    }

    /// Same as [`run_chat`](Self::run_chat) but the caller must name the model.
    pub async fn chat_with_model(
        &self,
        args: ChatArgs,
        cancel: CancellationToken
    ) -> Result<ChatReply, AgentError> {
        if non_empty(&args.model).is_none() && non_empty(&args.custom_model).is_none() {
            return Err(AgentError::InvalidArgument("model is required".to_string()));
        }
        self.run_chat(args, cancel).await
    }

    pub async fn get_conversation(&self, id: Option<&str>) -> Result<Conversation, AgentError> {
        let id = id
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| AgentError::InvalidArgument("continuation_id is required".to_string()))?;
        self.store
            .load(id).await
            .map_err(|e| AgentError::storage(e, Some(id)))?
            .ok_or_else(|| AgentError::NotFound(id.to_string()))
    }

    pub async fn list_conversations(&self) -> Result<Vec<ConversationSummary>, AgentError> {
        self.store.list_all().await.map_err(|e| AgentError::storage(e, None))
    }

    pub async fn delete_conversation(&self, id: Option<&str>) -> Result<bool, AgentError> {
        let id = id
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| AgentError::InvalidArgument("continuation_id is required".to_string()))?;
        self.store.delete(id).await.map_err(|e| AgentError::storage(e, Some(id)))
    }

    /// Known aliases, optionally narrowed by `filter`. An unmatched filter yields suggestions.
    pub fn list_models(&self, filter: Option<&str>) -> ModelListing {
        let directory = self.resolver.directory();
        let filter = filter
            .map(|f| f.trim().to_lowercase())
            .filter(|f| !f.is_empty());

        let models: Vec<ModelEntry> = directory
            .aliases()
            .into_iter()
            .filter(|(alias, canonical)| {
                match &filter {
                    Some(f) => alias.to_lowercase().contains(f) || canonical.to_lowercase().contains(f),
                    None => true,
                }
            })
            .map(|(alias, canonical)| ModelEntry {
                alias: alias.to_string(),
                model: canonical.to_string(),
                capabilities: directory
                    .capabilities_of(canonical)
                    .iter()
                    .map(|c| c.to_string())
                    .collect(),
                context_window: directory.context_window(canonical),
            })
            .collect();

        let suggestions = match (&filter, models.is_empty()) {
            (Some(f), true) => directory.suggest(f),
            _ => Vec::new(),
        };

        ModelListing {
            default_model: self.resolver.settings().default_model.clone(),
            models,
            suggestions,
        }
    }
}
