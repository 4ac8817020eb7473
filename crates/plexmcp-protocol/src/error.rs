//! Protocol error taxonomy and JSON-RPC code mapping.

use serde_json::Value;
use std::time::Duration;

use crate::jsonrpc::JsonRpcError;

/// Result type alias for protocol operations
pub type Result<T> = std::result::Result<T, Error>;

/// JSON-RPC: bytes not parseable as a message
pub const PARSE_ERROR: i32 = -32700;
/// JSON-RPC: structurally invalid message
pub const INVALID_REQUEST: i32 = -32600;
/// JSON-RPC: unknown method, or capability not declared
pub const METHOD_NOT_FOUND: i32 = -32601;
/// JSON-RPC: schema validation failed, unknown or disabled tool
pub const INVALID_PARAMS: i32 = -32602;
/// JSON-RPC: uncaught handler error
pub const INTERNAL_ERROR: i32 = -32603;
/// MCP: unknown resource read
pub const RESOURCE_NOT_FOUND: i32 = -32002;
/// Server-scoped: session id mismatch or missing
pub const INVALID_SESSION: i32 = -32001;
/// Server-scoped: request cancelled by the caller
pub const REQUEST_CANCELLED: i32 = -32800;

/// Errors raised by the protocol engine, transports, and handlers.
///
/// Variants that correspond to a wire error carry a fixed JSON-RPC code;
/// local-only conditions (timeouts, closed transports) coerce to
/// `InternalError` if they ever have to cross the wire.
#[derive(Debug, Clone, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// Bytes were not parseable as JSON-RPC (-32700)
    #[error("parse error: {0}")]
    Parse(String),

    /// Structurally invalid message (-32600)
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Unknown method or undeclared capability (-32601)
    #[error("method not found: {0}")]
    MethodNotFound(String),

    /// Schema validation failed, unknown tool, disabled tool (-32602)
    #[error("invalid params: {0}")]
    InvalidParams(String),

    /// Uncaught handler error (-32603)
    #[error("internal error: {0}")]
    Internal(String),

    /// Unknown resource read (-32002)
    #[error("resource not found: {0}")]
    ResourceNotFound(String),

    /// Session id mismatch or missing (-32001)
    #[error("invalid session: {0}")]
    InvalidSession(String),

    /// Request cancelled (-32800)
    #[error("request cancelled: {0}")]
    Cancelled(String),

    /// Request timed out locally; same effect as an abort with reason "timeout"
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// Send attempted on a transport that is not connected
    #[error("transport not connected")]
    NotConnected,

    /// Transport closed while requests were pending
    #[error("transport closed")]
    TransportClosed,

    /// Transport-level failure
    #[error("transport error: {0}")]
    Transport(String),

    /// Error response received from the remote peer
    #[error("remote error {code}: {message}")]
    Rpc {
        /// JSON-RPC error code
        code: i32,
        /// Error message
        message: String,
        /// Additional error data
        data: Option<Value>,
    },
}

impl Error {
    /// Parse error constructor
    pub fn parse(message: impl Into<String>) -> Self {
        Self::Parse(message.into())
    }

    /// Invalid-request constructor
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::InvalidRequest(message.into())
    }

    /// Method-not-found constructor
    pub fn method_not_found(method: impl Into<String>) -> Self {
        Self::MethodNotFound(method.into())
    }

    /// Invalid-params constructor
    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::InvalidParams(message.into())
    }

    /// Internal-error constructor
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Resource-not-found constructor
    pub fn resource_not_found(uri: impl Into<String>) -> Self {
        Self::ResourceNotFound(uri.into())
    }

    /// Invalid-session constructor
    pub fn invalid_session(message: impl Into<String>) -> Self {
        Self::InvalidSession(message.into())
    }

    /// Cancellation constructor
    pub fn cancelled(reason: impl Into<String>) -> Self {
        Self::Cancelled(reason.into())
    }

    /// Transport-failure constructor
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport(message.into())
    }

    /// The JSON-RPC code this error maps to on the wire
    pub fn json_rpc_code(&self) -> i32 {
        match self {
            Self::Parse(_) => PARSE_ERROR,
            Self::InvalidRequest(_) => INVALID_REQUEST,
            Self::MethodNotFound(_) => METHOD_NOT_FOUND,
            Self::InvalidParams(_) => INVALID_PARAMS,
            Self::ResourceNotFound(_) => RESOURCE_NOT_FOUND,
            Self::InvalidSession(_) => INVALID_SESSION,
            Self::Cancelled(_) => REQUEST_CANCELLED,
            Self::Rpc { code, .. } => *code,
            Self::Internal(_)
            | Self::Timeout(_)
            | Self::NotConnected
            | Self::TransportClosed
            | Self::Transport(_) => INTERNAL_ERROR,
        }
    }

    /// Convert into a wire error object
    pub fn to_json_rpc(&self) -> JsonRpcError {
        let data = match self {
            Self::Rpc { data, .. } => data.clone(),
            _ => None,
        };
        JsonRpcError {
            code: self.json_rpc_code(),
            message: self.to_string(),
            data,
        }
    }

    /// Reconstruct from a wire error object, recovering known codes
    pub fn from_json_rpc(error: JsonRpcError) -> Self {
        match error.code {
            PARSE_ERROR => Self::Parse(error.message),
            INVALID_REQUEST => Self::InvalidRequest(error.message),
            METHOD_NOT_FOUND => Self::MethodNotFound(error.message),
            INVALID_PARAMS => Self::InvalidParams(error.message),
            RESOURCE_NOT_FOUND => Self::ResourceNotFound(error.message),
            INVALID_SESSION => Self::InvalidSession(error.message),
            REQUEST_CANCELLED => Self::Cancelled(error.message),
            code => Self::Rpc {
                code,
                message: error.message,
                data: error.data,
            },
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Parse(err.to_string())
    }
}
