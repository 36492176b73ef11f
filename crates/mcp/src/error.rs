//! Error types for the MCP crate.

use std::time::Duration;

use crate::types::{error_codes, JsonRpcError};

/// Errors that can occur during MCP operations.
#[derive(Debug, thiserror::Error)]
pub enum McpError {
    /// Failed to parse or serialize JSON.
    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    /// Transport I/O error.
    #[error("Transport error: {0}")]
    Transport(#[from] std::io::Error),

    /// The requested method is not supported.
    #[error("Method not found: {0}")]
    MethodNotFound(String),

    /// Invalid parameters for a method.
    #[error("Invalid params: {0}")]
    InvalidParams(String),

    /// The requested tool was not found in the catalogue.
    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    /// Internal failure while handling a request.
    #[error("{0}")]
    Internal(String),

    /// The peer returned a JSON-RPC error for one of our requests.
    #[error("Peer error {code}: {message}")]
    Peer { code: i64, message: String },

    /// No response arrived within the deadline.
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    /// The transport closed while a request was outstanding.
    #[error("Peer connection closed")]
    PeerClosed,
}

impl McpError {
    /// Convert to a JSON-RPC error object for an inbound-request response.
    pub fn to_rpc_error(&self) -> JsonRpcError {
        let code = match self {
            McpError::JsonParse(_) => error_codes::PARSE_ERROR,
            McpError::MethodNotFound(_) => error_codes::METHOD_NOT_FOUND,
            McpError::InvalidParams(_) | McpError::ToolNotFound(_) => error_codes::INVALID_PARAMS,
            _ => error_codes::INTERNAL_ERROR,
        };
        JsonRpcError {
            code,
            message: self.to_string(),
            data: None,
        }
    }
}
