use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Error;

pub const JSONRPC_VERSION: &str = "2.0";

pub const METHOD_INITIALIZE: &str = "initialize";
pub const METHOD_INITIALIZED: &str = "initialized";
pub const METHOD_NOTIFICATIONS_INITIALIZED: &str = "notifications/initialized";
pub const METHOD_SHUTDOWN: &str = "shutdown";
pub const METHOD_LIST_TOOLS: &str = "tools/list";
pub const METHOD_CALL_TOOL: &str = "tools/call";

pub const ERROR_PARSE: i64 = -32700;
pub const ERROR_INVALID_REQUEST: i64 = -32600;
pub const ERROR_METHOD_NOT_FOUND: i64 = -32601;
pub const ERROR_INVALID_PARAMS: i64 = -32602;
pub const ERROR_INTERNAL: i64 = -32603;
pub const ERROR_SERVER: i64 = -32000;

/// JSON-RPC request envelope. `id` is absent for notifications.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpRequest {
    pub jsonrpc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

/// JSON-RPC response envelope: exactly one of `result` / `error` is set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpResponse {
    pub jsonrpc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<McpErrorObject>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpErrorObject {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl McpResponse {
    pub fn success(id: Option<Value>, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.into(),
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn error(id: Option<Value>, code: i64, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.into(),
            id,
            result: None,
            error: Some(McpErrorObject {
                code,
                message: message.into(),
                data: None,
            }),
        }
    }
}

/// A tool exposed through `tools/list`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    #[serde(rename = "inputSchema")]
    pub input_schema: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerInfo {
    pub name: String,
    pub version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolsCapability {
    #[serde(rename = "listChanged")]
    pub list_changed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerCapabilities {
    pub tools: ToolsCapability,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitializeResult {
    #[serde(rename = "protocolVersion")]
    pub protocol_version: String,
    pub capabilities: ServerCapabilities,
    #[serde(rename = "serverInfo")]
    pub server_info: ServerInfo,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
}

/// One content block of a tool call result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolContent {
    #[serde(rename = "type")]
    pub kind: String,
    pub text: String,
}

impl ToolContent {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            kind: "text".into(),
            text: text.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallToolResult {
    pub content: Vec<ToolContent>,
    #[serde(rename = "isError", default)]
    pub is_error: bool,
    #[serde(rename = "_meta", default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<Value>,
}

/// Parse a single JSON-RPC message, rejecting unsupported envelope versions.
pub fn parse_message(raw: &str) -> Result<McpRequest, Error> {
    let request: McpRequest = serde_json::from_str(raw)?;
    if request.jsonrpc != JSONRPC_VERSION {
        return Err(Error::InvalidArgument(format!(
            "unsupported JSON-RPC version: {}",
            request.jsonrpc
        )));
    }
    Ok(request)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_valid_request() {
        let request = parse_message(
            r#"{"jsonrpc":"2.0","id":1,"method":"tools/list"}"#,
        )
        .unwrap();
        assert_eq!(request.method, "tools/list");
        assert_eq!(request.id, Some(serde_json::json!(1)));
        assert!(request.params.is_none());
    }

    #[test]
    fn parse_notification_without_id() {
        let request = parse_message(r#"{"jsonrpc":"2.0","method":"initialized"}"#).unwrap();
        assert!(request.id.is_none());
    }

    #[test]
    fn parse_rejects_malformed_json() {
        assert!(parse_message("{not json").is_err());
    }

    #[test]
    fn parse_rejects_wrong_version() {
        let err = parse_message(r#"{"jsonrpc":"1.0","method":"ping"}"#).unwrap_err();
        assert!(err.to_string().contains("unsupported JSON-RPC version"));
    }

    #[test]
    fn success_response_shape() {
        let response = McpResponse::success(Some(serde_json::json!(7)), serde_json::json!({"ok": true}));
        let json = serde_json::to_string(&response).unwrap();
        assert!(json.contains(r#""jsonrpc":"2.0""#));
        assert!(json.contains(r#""id":7"#));
        assert!(json.contains(r#""result""#));
        assert!(!json.contains(r#""error""#));
    }

    #[test]
    fn error_response_shape() {
        let response = McpResponse::error(None, ERROR_METHOD_NOT_FOUND, "method not found: nope");
        let json = serde_json::to_string(&response).unwrap();
        assert!(json.contains("-32601"));
        assert!(!json.contains(r#""result""#));
        assert!(!json.contains(r#""id""#));
    }

    #[test]
    fn call_tool_result_meta_field_name() {
        let result = CallToolResult {
            content: vec![ToolContent::text("done")],
            is_error: false,
            meta: Some(serde_json::json!({"request_id": "abc"})),
        };
        let json = serde_json::to_string(&result).unwrap();
        assert!(json.contains(r#""_meta""#));
        assert!(json.contains(r#""isError":false"#));
        assert!(json.contains(r#""type":"text""#));
    }

    #[test]
    fn tool_descriptor_camel_case_schema() {
        let tool = ToolDescriptor {
            name: "cancel_request".into(),
            description: "Cancel a pending request".into(),
            input_schema: serde_json::json!({"type": "object"}),
        };
        let json = serde_json::to_string(&tool).unwrap();
        assert!(json.contains(r#""inputSchema""#));
    }
}
