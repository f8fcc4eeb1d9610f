use crate::agent::{ AgentError, ChatAgent, ChatReply, ModelListing };
use crate::models::chat::{ Conversation, ConversationSummary };
use crate::models::mcp::{
    ChatArgs,
    ConversationIdArgs,
    ListModelsArgs,
    RpcError,
    ToolCallResult,
    INVALID_PARAMS,
};
use log::{ info, warn };
use once_cell::sync::Lazy;
use serde::de::DeserializeOwned;
use serde_json::{ json, Value as JsonValue };
use tokio_util::sync::CancellationToken;

const PREVIEW_CHARS: usize = 80;

fn chat_properties(model_required: bool) -> JsonValue {
    let model_description = if model_required {
        "Model alias (e.g. 'gemini', 'deepseek', 'kimi', 'grok', 'qwen3-coder') or full OpenRouter id"
    } else {
        "Model alias (e.g. 'gemini', 'deepseek', 'kimi', 'grok', 'qwen3-coder'); defaults to the configured model"
    };
    json!({
        "prompt": { "type": "string", "description": "Message to send, with full context" },
        "model": { "type": "string", "description": model_description },
        "custom_model": {
            "type": "string",
            "description": "Exact OpenRouter model id, bypassing alias resolution and web-search gating"
        },
        "continuation_id": {
            "type": "string",
            "description": "Conversation id from a previous response, to continue that conversation"
        },
        "files": {
            "type": "array",
            "items": { "type": "string" },
            "description": "Absolute paths of files to attach as context"
        },
        "images": {
            "type": "array",
            "items": { "type": "string" },
            "description": "Absolute paths of images to reference"
        },
        "max_tokens": { "type": "integer", "minimum": 1, "description": "Output token limit" },
        "temperature": { "type": "number", "minimum": 0, "maximum": 2 },
        "thinking_effort": {
            "type": "string",
            "enum": ["low", "medium", "high"],
            "description": "Reasoning effort for reasoning-capable models (default high)"
        },
        "force_internet_search": {
            "type": "boolean",
            "description": "Set false to keep web search off for internet-capable models"
        }
    })
}

static TOOL_DEFINITIONS: Lazy<Vec<JsonValue>> = Lazy::new(|| {
    let id_schema =
        json!({
        "type": "object",
        "properties": {
            "continuation_id": { "type": "string", "description": "Conversation id" }
        },
        "required": ["continuation_id"]
    });
    vec![
        json!({
            "name": "chat",
            "description": "Chat with OpenRouter models. Pass the returned continuation_id in follow-up calls to keep the conversation.",
            "inputSchema": {
                "type": "object",
                "properties": chat_properties(false),
                "required": ["prompt"]
            }
        }),
        json!({
            "name": "chat_with_model",
            "description": "Chat with an explicitly named OpenRouter model.",
            "inputSchema": {
                "type": "object",
                "properties": chat_properties(true),
                "required": ["prompt", "model"]
            }
        }),
        json!({
            "name": "list_conversations",
            "description": "List stored conversations, most recently updated first.",
            "inputSchema": { "type": "object", "properties": {} }
        }),
        json!({
            "name": "get_conversation",
            "description": "Show the full message history of a conversation.",
            "inputSchema": id_schema.clone()
        }),
        json!({
            "name": "delete_conversation",
            "description": "Delete a conversation permanently.",
            "inputSchema": id_schema
        }),
        json!({
            "name": "list_models",
            "description": "List model aliases with their OpenRouter ids and capabilities.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "filter": { "type": "string", "description": "Only aliases or ids containing this text" }
                }
            }
        })
    ]
});

pub fn tool_definitions() -> &'static [JsonValue] {
    &TOOL_DEFINITIONS
}

fn invalid_params(message: impl Into<String>) -> RpcError {
    RpcError {
        code: INVALID_PARAMS,
        message: message.into(),
        data: None,
    }
}

fn parse_arguments<T: DeserializeOwned + Default>(arguments: Option<JsonValue>) -> Result<T, RpcError> {
    match arguments {
        None | Some(JsonValue::Null) => Ok(T::default()),
        Some(value) =>
            serde_json::from_value(value).map_err(|e| invalid_params(format!("Invalid arguments: {}", e))),
    }
}

fn preview(text: &str) -> String {
    let flat = text.replace('\n', " ");
    if flat.chars().count() > PREVIEW_CHARS {
        format!("{}...", flat.chars().take(PREVIEW_CHARS).collect::<String>())
    } else {
        flat
    }
}

/// Argument errors become JSON-RPC errors; every other failure is reported as a tool error.
fn agent_failure(err: AgentError) -> Result<ToolCallResult, RpcError> {
    if let AgentError::InvalidArgument(message) = &err {
        return Err(invalid_params(message.clone()));
    }
    warn!("Tool call failed ({}): {}", err.kind(), err);
    let structured =
        json!({
        "kind": err.kind(),
        "message": err.to_string(),
        "continuation_id": err.continuation_id(),
        "model": err.model(),
    });
    let mut text = format!("Error ({}): {}", err.kind(), err);
    if let Some(id) = err.continuation_id() {
        text.push_str(&format!("\n\ncontinuation_id: {}", id));
    }
    let mut result = ToolCallResult::error(text, structured);
    if let Some(id) = err.continuation_id() {
        result = result.with_continuation(id);
    }
    Ok(result)
}

fn render_chat(reply: ChatReply) -> ToolCallResult {
    let structured =
        json!({
        "continuation_id": reply.continuation_id,
        "model": reply.model,
        "usage": reply.usage,
    });
    ToolCallResult::text(reply.text)
        .with_structured(structured)
        .with_continuation(reply.continuation_id)
}

fn render_summaries(summaries: &[ConversationSummary]) -> String {
    if summaries.is_empty() {
        return "No conversations stored.".to_string();
    }
    let mut text = format!("# Conversations ({})\n", summaries.len());
    for summary in summaries {
        let updated = summary.updated_at
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| "never".to_string());
        text.push_str(
            &format!(
                "\n- `{}` | {} messages | created {} | updated {}",
                summary.id,
                summary.message_count,
                summary.created_at.to_rfc3339(),
                updated
            )
        );
        if let Some(last) = &summary.last_message {
            text.push_str(&format!("\n  last ({}): {}", last.role, preview(&last.content)));
        }
    }
    text
}

fn render_conversation(conversation: &Conversation) -> String {
    let mut text = format!(
        "# Conversation `{}`\n\nCreated: {}\nUpdated: {}\nMessages: {}\n",
        conversation.id,
        conversation.created_at.to_rfc3339(),
        conversation.updated_at.map(|t| t.to_rfc3339()).unwrap_or_else(|| "never".to_string()),
        conversation.messages.len()
    );
    for (index, message) in conversation.messages.iter().enumerate() {
        text.push_str(
            &format!(
                "\n### {}. {} ({})\n\n{}\n",
                index + 1,
                message.role,
                message.timestamp.to_rfc3339(),
                message.content
            )
        );
        if let Some(metadata) = &message.metadata {
            let pairs: Vec<String> = metadata
                .iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect();
            text.push_str(&format!("\n_{}_\n", pairs.join(", ")));
        }
    }
    text
}

fn conversation_record(conversation: &Conversation) -> JsonValue {
    json!({
        "id": conversation.id,
        "created_at": conversation.created_at,
        "updated_at": conversation.updated_at,
        "message_count": conversation.messages.len(),
        "messages": conversation.messages,
    })
}

fn render_models(listing: &ModelListing) -> String {
    if listing.models.is_empty() {
        let mut text = "No matching models.".to_string();
        if !listing.suggestions.is_empty() {
            text.push_str(&format!(" Did you mean: {}?", listing.suggestions.join(", ")));
        }
        return text;
    }
    let mut text = format!(
        "# Models\n\nDefault: `{}`\n\n| Alias | Model | Capabilities | Context |\n|---|---|---|---|\n",
        listing.default_model
    );
    for entry in &listing.models {
        text.push_str(
            &format!(
                "| {} | {} | {} | {} |\n",
                entry.alias,
                entry.model,
                entry.capabilities.join(", "),
                entry.context_window.map(|w| w.to_string()).unwrap_or_else(|| "-".to_string())
            )
        );
    }
    text
}

/// Runs one `tools/call`.
pub async fn call_tool(
    agent: &ChatAgent,
    name: &str,
    arguments: Option<JsonValue>,
    cancel: CancellationToken
) -> Result<ToolCallResult, RpcError> {
    info!("Tool call: {}", name);
    match name {
        "chat" => {
            let args: ChatArgs = parse_arguments(arguments)?;
            match agent.run_chat(args, cancel).await {
                Ok(reply) => Ok(render_chat(reply)),
                Err(e) => agent_failure(e),
            }
        }
        "chat_with_model" => {
            let args: ChatArgs = parse_arguments(arguments)?;
            match agent.chat_with_model(args, cancel).await {
                Ok(reply) => Ok(render_chat(reply)),
                Err(e) => agent_failure(e),
            }
        }
        "list_conversations" => {
            match agent.list_conversations().await {
                Ok(summaries) => {
                    let text = render_summaries(&summaries);
                    Ok(ToolCallResult::text(text).with_structured(json!({ "conversations": summaries })))
                }
                Err(e) => agent_failure(e),
            }
        }
        "get_conversation" => {
            let args: ConversationIdArgs = parse_arguments(arguments)?;
            match agent.get_conversation(args.continuation_id.as_deref()).await {
                Ok(conversation) => {
                    let text = render_conversation(&conversation);
                    Ok(ToolCallResult::text(text).with_structured(conversation_record(&conversation)))
                }
                Err(AgentError::NotFound(id)) => {
                    info!("Conversation {} not found", id);
                    Ok(
                        ToolCallResult::text(format!("Conversation '{}' not found.", id)).with_structured(
                            json!({ "found": false, "continuation_id": id })
                        )
                    )
                }
                Err(e) => agent_failure(e),
            }
        }
        "delete_conversation" => {
            let args: ConversationIdArgs = parse_arguments(arguments)?;
            let id = args.continuation_id.clone().unwrap_or_default();
            match agent.delete_conversation(args.continuation_id.as_deref()).await {
                Ok(deleted) => {
                    let text = if deleted {
                        format!("Deleted conversation {}", id)
                    } else {
                        format!("Conversation {} not found", id)
                    };
                    Ok(
                        ToolCallResult::text(text).with_structured(
                            json!({ "deleted": deleted, "continuation_id": id })
                        )
                    )
                }
                Err(e) => agent_failure(e),
            }
        }
        "list_models" => {
            let args: ListModelsArgs = parse_arguments(arguments)?;
            let listing = agent.list_models(args.filter.as_deref());
            let structured = serde_json::to_value(&listing).unwrap_or(JsonValue::Null);
            Ok(ToolCallResult::text(render_models(&listing)).with_structured(structured))
        }
        other => Err(invalid_params(format!("Unknown tool: {}", other))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_tool_has_an_object_schema() {
        let names: Vec<&str> = tool_definitions()
            .iter()
            .map(|t| t["name"].as_str().unwrap())
            .collect();
        assert_eq!(
            names,
            vec![
                "chat",
                "chat_with_model",
                "list_conversations",
                "get_conversation",
                "delete_conversation",
                "list_models"
            ]
        );
        for tool in tool_definitions() {
            assert_eq!(tool["inputSchema"]["type"], json!("object"));
        }
    }

    #[test]
    fn preview_flattens_and_shortens() {
        assert_eq!(preview("a\nb"), "a b");
        let long = "x".repeat(200);
        assert_eq!(preview(&long).chars().count(), PREVIEW_CHARS + 3);
    }

    #[test]
    fn bad_argument_types_are_invalid_params() {
        let err = parse_arguments::<ChatArgs>(Some(json!({"prompt": 5}))).unwrap_err();
        assert_eq!(err.code, INVALID_PARAMS);
        let empty: ChatArgs = parse_arguments(None).unwrap();
        assert!(empty.prompt.is_empty());
    }

    #[test]
    fn invalid_argument_maps_to_rpc_error() {
        let err = agent_failure(AgentError::InvalidArgument("prompt must not be empty".into())).unwrap_err();
        assert_eq!(err.code, INVALID_PARAMS);

        let result = agent_failure(AgentError::NotFound("abc".into())).unwrap();
        assert!(result.is_error);
        assert_eq!(result.structured_content.unwrap()["kind"], json!("not_found"));
    }
}
