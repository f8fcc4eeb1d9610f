pub mod tools;

use crate::agent::ChatAgent;
use crate::cli::Args;
use crate::models::mcp::{
    CancelledParams,
    IncomingMessage,
    RpcResponse,
    ToolCallParams,
    DEFAULT_PROTOCOL_VERSION,
    INTERNAL_ERROR,
    INVALID_PARAMS,
    INVALID_REQUEST,
    METHOD_NOT_FOUND,
    PARSE_ERROR,
};
use futures::StreamExt;
use log::{ debug, error, info, warn };
use serde_json::{ json, Value as JsonValue };
use std::collections::HashMap;
use std::error::Error;
use std::sync::Arc;
use tokio::io::{ AsyncRead, AsyncWrite, AsyncWriteExt };
use tokio::sync::{ mpsc, Mutex, Semaphore };
use tokio::task::JoinSet;
use tokio_util::codec::{ FramedRead, LinesCodec, LinesCodecError };
use tokio_util::sync::CancellationToken;

const RESPONSE_QUEUE: usize = 64;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub max_message_size: usize,
    pub max_concurrent_requests: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_message_size: 10 * 1024 * 1024,
            max_concurrent_requests: 10,
        }
    }
}

impl ServerConfig {
    pub fn from_args(args: &Args) -> Self {
        Self {
            max_message_size: args.max_message_size,
            max_concurrent_requests: args.max_concurrent_requests.max(1),
        }
    }
}

/// MCP server speaking line-delimited JSON-RPC.
///
/// Each request runs on its own task, at most `max_concurrent_requests` at a time.
/// Responses go through a single writer task so output lines never interleave.
pub struct Server {
    agent: Arc<ChatAgent>,
    config: ServerConfig,
    in_flight: Mutex<HashMap<String, CancellationToken>>,
    shutdown: CancellationToken,
}

impl Server {
    pub fn new(agent: Arc<ChatAgent>, config: ServerConfig) -> Self {
        Self {
            agent,
            config,
            in_flight: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        }
    }

    /// Cancelling this token stops reading input and cancels every in-flight request.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Serves on stdin/stdout until EOF or Ctrl-C.
    pub async fn run(self: Arc<Self>) -> Result<(), Box<dyn Error + Send + Sync>> {
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Interrupt received, shutting down");
                shutdown.cancel();
            }
        });

        info!("MCP server listening on stdio");
        self.serve(tokio::io::stdin(), tokio::io::stdout()).await
    }

    pub async fn serve<R, W>(
        self: Arc<Self>,
        reader: R,
        writer: W
    ) -> Result<(), Box<dyn Error + Send + Sync>>
        where R: AsyncRead + Unpin, W: AsyncWrite + Unpin + Send + 'static
    {
        let (tx, mut rx) = mpsc::channel::<RpcResponse>(RESPONSE_QUEUE);
        let writer_task = tokio::spawn(async move {
            let mut writer = writer;
            while let Some(response) = rx.recv().await {
                let mut line = match serde_json::to_string(&response) {
                    Ok(line) => line,
                    Err(e) => {
                        error!("Failed to encode response: {}", e);
                        continue;
                    }
                };
                line.push('\n');
                if let Err(e) = writer.write_all(line.as_bytes()).await {
                    error!("Failed to write response: {}", e);
                    break;
                }
                if let Err(e) = writer.flush().await {
                    error!("Failed to flush response: {}", e);
                    break;
                }
            }
        });

        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent_requests));
        let mut tasks = JoinSet::new();
        let mut lines = FramedRead::new(
            reader,
            LinesCodec::new_with_max_length(self.config.max_message_size)
        );

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    info!("Shutdown requested, cancelling {} in-flight requests", tasks.len());
                    break;
                }
                next = lines.next() => {
                    match next {
                        None => {
                            info!("Input closed, waiting for {} in-flight requests", tasks.len());
                            break;
                        }
                        Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                            warn!("Rejected message larger than {} bytes", self.config.max_message_size);
                            let response = RpcResponse::failure(
                                JsonValue::Null,
                                INVALID_REQUEST,
                                format!("Message exceeds {} bytes", self.config.max_message_size),
                                None
                            );
                            let _ = tx.send(response).await;
                        }
                        Some(Err(LinesCodecError::Io(e))) => {
                            error!("Failed to read input: {}", e);
                            break;
                        }
                        Some(Ok(line)) => {
                            self.clone().dispatch(line, &tx, &semaphore, &mut tasks).await;
                        }
                    }
                }
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = joined {
                        error!("Request task failed: {}", e);
                    }
                }
            }
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!("Request task failed: {}", e);
            }
        }
        drop(tx);
        writer_task.await?;
        info!("MCP server stopped");
        Ok(())
    }

    async fn dispatch(
        self: Arc<Self>,
        line: String,
        tx: &mpsc::Sender<RpcResponse>,
        semaphore: &Arc<Semaphore>,
        tasks: &mut JoinSet<()>
    ) {
        let line = line.trim();
        if line.is_empty() {
            return;
        }

        let message: IncomingMessage = match serde_json::from_str(line) {
            Ok(message) => message,
            Err(e) => {
                warn!("Unparseable message: {}", e);
                let response = RpcResponse::failure(
                    JsonValue::Null,
                    PARSE_ERROR,
                    format!("Parse error: {}", e),
                    None
                );
                let _ = tx.send(response).await;
                return;
            }
        };

        let Some(method) = message.method.clone() else {
            if !message.is_notification() {
                let id = message.id.unwrap_or(JsonValue::Null);
                let response = RpcResponse::failure(id, INVALID_REQUEST, "Missing method", None);
                let _ = tx.send(response).await;
            }
            return;
        };

        if message.is_notification() {
            self.handle_notification(&method, message.params).await;
            return;
        }

        let params = message.params;
        let id = message.id.unwrap_or(JsonValue::Null);
        let key = id.to_string();
        let cancel = self.shutdown.child_token();
        self.in_flight.lock().await.insert(key.clone(), cancel.clone());

        let tx = tx.clone();
        let semaphore = semaphore.clone();
        tasks.spawn(async move {
            let response = match semaphore.acquire_owned().await {
                Ok(_permit) => self.handle_request(id, &method, params, cancel).await,
                Err(_) => RpcResponse::failure(id, INTERNAL_ERROR, "Server is shutting down", None),
            };
            self.in_flight.lock().await.remove(&key);
            if tx.send(response).await.is_err() {
                warn!("Response for request {} dropped: writer closed", key);
            }
        });
    }

    async fn handle_notification(&self, method: &str, params: Option<JsonValue>) {
        match method {
            "notifications/cancelled" => {
                let Some(params) = params else {
                    return;
                };
                match serde_json::from_value::<CancelledParams>(params) {
                    Ok(cancelled) => {
                        let key = cancelled.request_id.to_string();
                        if let Some(token) = self.in_flight.lock().await.get(&key) {
                            info!(
                                "Cancelling request {} ({})",
                                key,
                                cancelled.reason.as_deref().unwrap_or("no reason given")
                            );
                            token.cancel();
                        } else {
                            debug!("Cancellation for unknown request {}", key);
                        }
                    }
                    Err(e) => warn!("Invalid cancellation notification: {}", e),
                }
            }
            "notifications/initialized" => info!("MCP client initialized"),
            other => debug!("Ignoring notification: {}", other),
        }
    }

    /// Answers one request. Never fails: errors become JSON-RPC error responses.
    pub async fn handle_request(
        &self,
        id: JsonValue,
        method: &str,
        params: Option<JsonValue>,
        cancel: CancellationToken
    ) -> RpcResponse {
        debug!("Handling request: {} (id: {})", method, id);
        match method {
            "initialize" => {
                let protocol_version = params
                    .as_ref()
                    .and_then(|p| p.get("protocolVersion"))
                    .and_then(JsonValue::as_str)
                    .unwrap_or(DEFAULT_PROTOCOL_VERSION)
                    .to_string();
                RpcResponse::success(
                    id,
                    json!({
                        "protocolVersion": protocol_version,
                        "capabilities": { "tools": {} },
                        "serverInfo": {
                            "name": env!("CARGO_PKG_NAME"),
                            "version": env!("CARGO_PKG_VERSION"),
                        }
                    })
                )
            }
            "ping" => RpcResponse::success(id, json!({})),
            "tools/list" => RpcResponse::success(id, json!({ "tools": tools::tool_definitions() })),
            "tools/call" => {
                let call: ToolCallParams = match params.map(serde_json::from_value) {
                    Some(Ok(call)) => call,
                    Some(Err(e)) => {
                        return RpcResponse::failure(id, INVALID_PARAMS, format!("Invalid params: {}", e), None);
                    }
                    None => {
                        return RpcResponse::failure(id, INVALID_PARAMS, "Missing params", None);
                    }
                };
                match tools::call_tool(&self.agent, &call.name, call.arguments, cancel).await {
                    Ok(result) =>
                        match serde_json::to_value(result) {
                            Ok(value) => RpcResponse::success(id, value),
                            Err(e) => RpcResponse::failure(id, INTERNAL_ERROR, e.to_string(), None),
                        }
                    Err(err) => RpcResponse::failure(id, err.code, err.message, err.data),
                }
            }
            other => RpcResponse::failure(id, METHOD_NOT_FOUND, format!("Method not found: {}", other), None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::{ ConversationStore, MemoryHistoryBackend };
    use crate::llm::chat::{ ChatClient, CompletionRequest, CompletionResponse, LlmError };
    use crate::llm::directory::ModelDirectory;
    use crate::llm::resolver::{ ModelResolver, ResolverSettings };
    use async_trait::async_trait;

    struct EchoClient;

    #[async_trait]
    impl ChatClient for EchoClient {
        async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
            let last = request.messages.last().map(|m| m.content.clone()).unwrap_or_default();
            Ok(CompletionResponse { content: format!("echo: {}", last), reasoning: None, usage: None })
        }
    }

    fn server() -> Server {
        let store = Arc::new(ConversationStore::new(Arc::new(MemoryHistoryBackend::new())));
        let resolver = Arc::new(
            ModelResolver::new(Arc::new(ModelDirectory::builtin()), ResolverSettings::default())
        );
        let agent = Arc::new(ChatAgent::new(store, resolver, Arc::new(EchoClient), 0.7));
        Server::new(agent, ServerConfig::default())
    }

    #[tokio::test]
    async fn initialize_echoes_protocol_version() {
        let server = server();
        let resp = server.handle_request(
            json!(1),
            "initialize",
            Some(json!({"protocolVersion": "2025-03-26"})),
            CancellationToken::new()
        ).await;
        let result = resp.result.unwrap();
        assert_eq!(result["protocolVersion"], json!("2025-03-26"));
        assert_eq!(result["capabilities"], json!({"tools": {}}));

        let resp = server.handle_request(json!(2), "initialize", None, CancellationToken::new()).await;
        assert_eq!(resp.result.unwrap()["protocolVersion"], json!(DEFAULT_PROTOCOL_VERSION));
    }

    #[tokio::test]
    async fn unknown_method_is_not_found() {
        let resp = server().handle_request(json!(7), "resources/list", None, CancellationToken::new()).await;
        assert_eq!(resp.error.unwrap().code, METHOD_NOT_FOUND);
        assert_eq!(resp.id, json!(7));
    }

    #[tokio::test]
    async fn chat_tool_returns_continuation_id() {
        let resp = server().handle_request(
            json!("a"),
            "tools/call",
            Some(json!({"name": "chat", "arguments": {"prompt": "hello"}})),
            CancellationToken::new()
        ).await;
        let result = resp.result.unwrap();
        assert_eq!(result["isError"], json!(false));
        assert_eq!(result["content"][0]["text"], json!("echo: hello"));
        assert!(result["continuation_id"].as_str().is_some());
        assert_eq!(result["structuredContent"]["continuation_id"], result["continuation_id"]);
    }

    #[tokio::test]
    async fn empty_prompt_is_invalid_params() {
        let resp = server().handle_request(
            json!(3),
            "tools/call",
            Some(json!({"name": "chat", "arguments": {"prompt": ""}})),
            CancellationToken::new()
        ).await;
        assert_eq!(resp.error.unwrap().code, INVALID_PARAMS);
    }

    #[tokio::test]
    async fn missing_conversation_is_reported_as_text() {
        let id = uuid::Uuid::new_v4().to_string();
        let resp = server().handle_request(
            json!(4),
            "tools/call",
            Some(json!({"name": "get_conversation", "arguments": {"continuation_id": id}})),
            CancellationToken::new()
        ).await;
        let result = resp.result.unwrap();
        assert_eq!(result["isError"], json!(false));
        assert_eq!(result["content"][0]["text"], json!(format!("Conversation '{}' not found.", id)));
        assert_eq!(result["structuredContent"], json!({"found": false, "continuation_id": id}));
    }
}
