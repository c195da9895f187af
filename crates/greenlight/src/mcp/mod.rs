pub mod protocol;
mod server;

pub use protocol::{
    CallToolResult, McpErrorObject, McpRequest, McpResponse, ServerCapabilities, ServerInfo,
    ToolContent, ToolDescriptor, parse_message,
};
pub use server::McpServer;
