use serde::{ Serialize, Deserialize };
use serde_json::Value as JsonValue;

pub const JSONRPC_VERSION: &str = "2.0";
pub const DEFAULT_PROTOCOL_VERSION: &str = "2024-11-05";

pub const PARSE_ERROR: i64 = -32700;
pub const INVALID_REQUEST: i64 = -32600;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;
pub const INTERNAL_ERROR: i64 = -32603;

/// Incoming line from the host. Requests carry an `id`, notifications do not.
#[derive(Deserialize, Debug, Clone)]
pub struct IncomingMessage {
    #[serde(default)]
    pub jsonrpc: Option<String>,
    #[serde(default)]
    pub id: Option<JsonValue>,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub params: Option<JsonValue>,
}

impl IncomingMessage {
    pub fn is_notification(&self) -> bool {
        matches!(self.id, None | Some(JsonValue::Null))
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<JsonValue>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct RpcResponse {
    pub jsonrpc: String,
    pub id: JsonValue,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<JsonValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

impl RpcResponse {
    pub fn success(id: JsonValue, result: JsonValue) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(id: JsonValue, code: i64, message: impl Into<String>, data: Option<JsonValue>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: None,
            error: Some(RpcError {
                code,
                message: message.into(),
                data,
            }),
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
pub struct ToolCallParams {
    pub name: String,
    #[serde(default)]
    pub arguments: Option<JsonValue>,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct CancelledParams {
    pub request_id: JsonValue,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Serialize, Debug, Clone)]
#[serde(tag = "type")]
pub enum ToolContent {
    #[serde(rename = "text")] Text {
        text: String,
    },
}

#[derive(Serialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallResult {
    pub content: Vec<ToolContent>,
    pub is_error: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub structured_content: Option<JsonValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub continuation_id: Option<String>,
}

impl ToolCallResult {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            content: vec![ToolContent::Text { text: text.into() }],
            is_error: false,
            structured_content: None,
            continuation_id: None,
        }
    }

    pub fn error(text: impl Into<String>, structured: JsonValue) -> Self {
        Self {
            content: vec![ToolContent::Text { text: text.into() }],
            is_error: true,
            structured_content: Some(structured),
            continuation_id: None,
        }
    }

    pub fn with_structured(mut self, structured: JsonValue) -> Self {
        self.structured_content = Some(structured);
        self
    }

    pub fn with_continuation(mut self, continuation_id: impl Into<String>) -> Self {
        self.continuation_id = Some(continuation_id.into());
        self
    }
}

/// Arguments of the `chat` and `chat_with_model` tools.
#[derive(Deserialize, Debug, Clone, Default)]
pub struct ChatArgs {
    #[serde(default)]
    pub prompt: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub custom_model: Option<String>,
    #[serde(default)]
    pub continuation_id: Option<String>,
    #[serde(default)]
    pub files: Vec<String>,
    #[serde(default)]
    pub images: Vec<String>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub thinking_effort: Option<String>,
    #[serde(default)]
    pub force_internet_search: Option<bool>,
}

#[derive(Deserialize, Debug, Clone, Default)]
pub struct ConversationIdArgs {
    #[serde(default)]
    pub continuation_id: Option<String>,
}

#[derive(Deserialize, Debug, Clone, Default)]
pub struct ListModelsArgs {
    #[serde(default)]
    pub filter: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn notification_has_no_id() {
        let msg: IncomingMessage = serde_json
            ::from_value(json!({"jsonrpc": "2.0", "method": "notifications/initialized"}))
            .unwrap();
        assert!(msg.is_notification());
    }

    #[test]
    fn tool_result_uses_mcp_field_names() {
        let result = ToolCallResult::text("hi").with_continuation("abc");
        let value = serde_json::to_value(&result).unwrap();
        assert_eq!(value["isError"], json!(false));
        assert_eq!(value["content"][0]["type"], json!("text"));
        assert_eq!(value["continuation_id"], json!("abc"));
    }

    #[test]
    fn chat_args_accept_partial_input() {
        let args: ChatArgs = serde_json
            ::from_value(json!({"prompt": "hi", "files": ["/tmp/a.rs"], "max_tokens": 512}))
            .unwrap();
        assert_eq!(args.prompt, "hi");
        assert_eq!(args.files.len(), 1);
        assert_eq!(args.max_tokens, Some(512));
        assert!(args.continuation_id.is_none());
    }
}
