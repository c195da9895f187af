use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::protocol::{
    CallToolResult, ERROR_INTERNAL, ERROR_INVALID_PARAMS, ERROR_INVALID_REQUEST,
    ERROR_METHOD_NOT_FOUND, ERROR_PARSE, ERROR_SERVER, InitializeResult, McpRequest, McpResponse,
    METHOD_CALL_TOOL, METHOD_INITIALIZE, METHOD_INITIALIZED, METHOD_LIST_TOOLS,
    METHOD_NOTIFICATIONS_INITIALIZED, METHOD_SHUTDOWN, ServerCapabilities, ServerInfo, ToolContent,
    ToolDescriptor, ToolsCapability, parse_message,
};
use crate::coordinator::{Coordinator, SubmitParams};
use crate::error::Error;

const PROTOCOL_VERSION: &str = "2.0";

const INSTRUCTIONS: &str = "Greenlight MCP server for human-in-the-loop workflows. \
     Use request_human_input to send a prompt to a human operator via Telegram, \
     then check_request_status to retrieve the decision.";

/// JSON-RPC tool runtime exposing the coordinator over two transports:
/// line-delimited stdio and single-shot HTTP POST (the edge calls
/// [`handle_line`](Self::handle_line) for both).
pub struct McpServer {
    coordinator: Arc<Coordinator>,
    initialized: AtomicBool,
    tools: Vec<ToolDescriptor>,
    server_info: ServerInfo,
}

impl McpServer {
    pub fn new(coordinator: Arc<Coordinator>) -> Self {
        Self {
            coordinator,
            initialized: AtomicBool::new(false),
            tools: default_tools(),
            server_info: ServerInfo {
                name: "greenlight".into(),
                version: env!("CARGO_PKG_VERSION").into(),
            },
        }
    }

    /// Tool descriptors, for `tools/list` and the read-only HTTP endpoint.
    pub fn tools(&self) -> &[ToolDescriptor] {
        &self.tools
    }

    pub fn capabilities(&self) -> ServerCapabilities {
        ServerCapabilities {
            tools: ToolsCapability {
                list_changed: false,
            },
        }
    }

    pub fn server_info(&self) -> &ServerInfo {
        &self.server_info
    }

    /// Process one raw JSON-RPC message. Returns `None` for notifications.
    pub async fn handle_line(&self, raw: &str) -> Option<McpResponse> {
        let request = match parse_message(raw) {
            Ok(request) => request,
            Err(e) => return Some(McpResponse::error(None, ERROR_PARSE, e.to_string())),
        };
        self.handle_request(request).await
    }

    /// Dispatch a parsed envelope. Returns `None` for notifications.
    pub async fn handle_request(&self, request: McpRequest) -> Option<McpResponse> {
        match request.method.as_str() {
            METHOD_INITIALIZE => Some(self.handle_initialize(request)),
            METHOD_INITIALIZED | METHOD_NOTIFICATIONS_INITIALIZED => None,
            METHOD_LIST_TOOLS => Some(self.handle_list_tools(request)),
            METHOD_CALL_TOOL => Some(self.handle_call_tool(request).await),
            METHOD_SHUTDOWN => Some(McpResponse::success(request.id, Value::Null)),
            other => Some(McpResponse::error(
                request.id,
                ERROR_METHOD_NOT_FOUND,
                format!("method not found: {other}"),
            )),
        }
    }

    /// Run the line-delimited stdio transport: one request per line,
    /// newline-terminated responses.
    pub async fn run_stdio(self: Arc<Self>, cancel: CancellationToken) -> Result<(), Error> {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        let mut stdout = tokio::io::stdout();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("MCP stdio transport shutting down");
                    return Ok(());
                }
                line = lines.next_line() => {
                    let Some(line) = line? else {
                        tracing::info!("MCP stdin closed");
                        return Ok(());
                    };
                    if line.trim().is_empty() {
                        continue;
                    }
                    let Some(response) = self.handle_line(&line).await else {
                        continue;
                    };
                    let mut payload = serde_json::to_vec(&response)?;
                    payload.push(b'\n');
                    stdout.write_all(&payload).await?;
                    stdout.flush().await?;
                }
            }
        }
    }

    fn handle_initialize(&self, request: McpRequest) -> McpResponse {
        self.initialized.store(true, Ordering::SeqCst);
        let result = InitializeResult {
            protocol_version: PROTOCOL_VERSION.into(),
            capabilities: self.capabilities(),
            server_info: self.server_info.clone(),
            instructions: Some(INSTRUCTIONS.into()),
        };
        match serde_json::to_value(result) {
            Ok(value) => McpResponse::success(request.id, value),
            Err(e) => McpResponse::error(request.id, ERROR_INTERNAL, e.to_string()),
        }
    }

    fn handle_list_tools(&self, request: McpRequest) -> McpResponse {
        if !self.initialized.load(Ordering::SeqCst) {
            return McpResponse::error(request.id, ERROR_INVALID_REQUEST, "server not initialized");
        }
        match serde_json::to_value(&self.tools) {
            Ok(tools) => McpResponse::success(request.id, json!({ "tools": tools })),
            Err(e) => McpResponse::error(request.id, ERROR_INTERNAL, e.to_string()),
        }
    }

    async fn handle_call_tool(&self, request: McpRequest) -> McpResponse {
        if !self.initialized.load(Ordering::SeqCst) {
            return McpResponse::error(request.id, ERROR_INVALID_REQUEST, "server not initialized");
        }
        let params = request.params.unwrap_or(Value::Null);
        let Some(name) = params.get("name").and_then(Value::as_str) else {
            return McpResponse::error(request.id, ERROR_INVALID_PARAMS, "missing tool name");
        };
        let args = params.get("arguments").cloned().unwrap_or_else(|| json!({}));

        match name {
            "request_human_input" => self.tool_request_human_input(request.id, &args).await,
            "check_request_status" => self.tool_check_request_status(request.id, &args),
            "list_pending_requests" => self.tool_list_pending_requests(request.id),
            "cancel_request" => self.tool_cancel_request(request.id, &args),
            other => McpResponse::error(
                request.id,
                ERROR_METHOD_NOT_FOUND,
                format!("tool not found: {other}"),
            ),
        }
    }

    async fn tool_request_human_input(&self, id: Option<Value>, args: &Value) -> McpResponse {
        let session_id = get_str(args, "session_id");
        let client_id = get_str(args, "client_id");
        let message = get_str(args, "message");
        if session_id.is_empty() || client_id.is_empty() || message.is_empty() {
            return McpResponse::error(
                id,
                ERROR_INVALID_PARAMS,
                "missing required parameters: session_id, client_id, message",
            );
        }
        // Accepted for wire compatibility; choice-vs-input behavior follows
        // from whether options are present.
        if let Some(request_type) = args.get("request_type").and_then(Value::as_str) {
            tracing::debug!(request_type, "request_type argument accepted");
        }

        let params = SubmitParams {
            session_id: session_id.to_string(),
            client_id: client_id.to_string(),
            message: message.to_string(),
            options: get_string_vec(args, "options"),
            metadata: get_map(args, "metadata"),
            timeout_seconds: args.get("timeout_seconds").and_then(Value::as_u64),
        };

        match self.coordinator.submit(params).await {
            Ok(request) => tool_result(
                id,
                format!("HITL request {} submitted, awaiting human response", request.id),
                json!({ "request_id": request.id, "status": request.status }),
            ),
            Err(e @ Error::InvalidArgument(_)) => {
                McpResponse::error(id, ERROR_INVALID_PARAMS, e.to_string())
            }
            Err(e) => McpResponse::error(id, ERROR_SERVER, e.to_string()),
        }
    }

    fn tool_check_request_status(&self, id: Option<Value>, args: &Value) -> McpResponse {
        let Some(request_id) = parse_request_id(args) else {
            return McpResponse::error(id, ERROR_INVALID_PARAMS, "missing or invalid request_id");
        };
        match self.coordinator.poll(request_id) {
            Ok(request) => {
                let snapshot = match serde_json::to_string_pretty(&request) {
                    Ok(s) => s,
                    Err(e) => return McpResponse::error(id, ERROR_INTERNAL, e.to_string()),
                };
                tool_result(
                    id,
                    snapshot,
                    json!({ "request_id": request.id, "status": request.status }),
                )
            }
            Err(e) => McpResponse::error(id, ERROR_SERVER, e.to_string()),
        }
    }

    fn tool_list_pending_requests(&self, id: Option<Value>) -> McpResponse {
        match self.coordinator.list_pending() {
            Ok(pending) => {
                let count = pending.len();
                let body = match serde_json::to_string_pretty(
                    &json!({ "count": count, "pending_requests": pending }),
                ) {
                    Ok(s) => s,
                    Err(e) => return McpResponse::error(id, ERROR_INTERNAL, e.to_string()),
                };
                tool_result(id, body, json!({ "count": count }))
            }
            Err(e) => McpResponse::error(id, ERROR_SERVER, e.to_string()),
        }
    }

    fn tool_cancel_request(&self, id: Option<Value>, args: &Value) -> McpResponse {
        let Some(request_id) = parse_request_id(args) else {
            return McpResponse::error(id, ERROR_INVALID_PARAMS, "missing or invalid request_id");
        };
        match self.coordinator.cancel(request_id) {
            Ok(()) => tool_result(
                id,
                format!("Request {request_id} canceled"),
                json!({ "request_id": request_id, "status": "canceled" }),
            ),
            Err(e) => McpResponse::error(id, ERROR_SERVER, e.to_string()),
        }
    }
}

fn tool_result(id: Option<Value>, text: String, meta: Value) -> McpResponse {
    let result = CallToolResult {
        content: vec![ToolContent::text(text)],
        is_error: false,
        meta: Some(meta),
    };
    match serde_json::to_value(result) {
        Ok(value) => McpResponse::success(id, value),
        Err(e) => McpResponse::error(id, ERROR_INTERNAL, e.to_string()),
    }
}

fn parse_request_id(args: &Value) -> Option<Uuid> {
    args.get("request_id")
        .and_then(Value::as_str)
        .and_then(|s| Uuid::parse_str(s).ok())
}

fn get_str<'a>(args: &'a Value, key: &str) -> &'a str {
    args.get(key).and_then(Value::as_str).unwrap_or_default()
}

fn get_string_vec(args: &Value, key: &str) -> Vec<String> {
    args.get(key)
        .and_then(Value::as_array)
        .map(|values| {
            values
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

fn get_map(args: &Value, key: &str) -> HashMap<String, Value> {
    args.get(key)
        .and_then(Value::as_object)
        .map(|map| map.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
        .unwrap_or_default()
}

fn default_tools() -> Vec<ToolDescriptor> {
    vec![
        ToolDescriptor {
            name: "request_human_input".into(),
            description: "Send a human-in-the-loop request for approval or input".into(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "session_id": {
                        "type": "string",
                        "description": "Unique session identifier"
                    },
                    "client_id": {
                        "type": "string",
                        "description": "Client identifier"
                    },
                    "message": {
                        "type": "string",
                        "description": "Message to send to the human operator"
                    },
                    "options": {
                        "type": "array",
                        "description": "Optional list of choices for the user",
                        "items": { "type": "string" }
                    },
                    "metadata": {
                        "type": "object",
                        "description": "Additional metadata for the request"
                    },
                    "request_type": {
                        "type": "string",
                        "description": "Hint: 'choice' or 'input'; derived from options when absent"
                    },
                    "timeout_seconds": {
                        "type": "integer",
                        "description": "Seconds before the request times out (default 300)"
                    }
                },
                "required": ["session_id", "client_id", "message"]
            }),
        },
        ToolDescriptor {
            name: "check_request_status".into(),
            description: "Retrieve the current state of a HITL request".into(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "request_id": {
                        "type": "string",
                        "description": "Identifier returned by request_human_input"
                    }
                },
                "required": ["request_id"]
            }),
        },
        ToolDescriptor {
            name: "list_pending_requests".into(),
            description: "List all requests still waiting for a human response".into(),
            input_schema: json!({
                "type": "object",
                "properties": {}
            }),
        },
        ToolDescriptor {
            name: "cancel_request".into(),
            description: "Cancel a pending HITL request".into(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "request_id": {
                        "type": "string",
                        "description": "Identifier of the request to cancel"
                    }
                },
                "required": ["request_id"]
            }),
        },
    ]
}
