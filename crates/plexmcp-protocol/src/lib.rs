//! # plexmcp-protocol
//!
//! Core protocol layer of the plexmcp SDK: JSON-RPC 2.0 framing, the MCP
//! data model, the single source-of-truth method table, the transport
//! abstraction, and the symmetric bidirectional protocol engine shared by
//! clients and servers.
//!
//! Higher layers build on this crate: `plexmcp-transport` implements the
//! [`transport::Transport`] trait, `plexmcp-server` and `plexmcp-client`
//! wire handlers into the [`engine::Protocol`].

pub mod codec;
pub mod engine;
pub mod error;
pub mod jsonrpc;
pub mod methods;
pub mod transport;
pub mod types;

pub use codec::{parse_message, serialize_message, ReadBuffer};
pub use engine::{
    Protocol, ProtocolOptions, RequestContext, RequestOptions, SessionGate, StreamFrame,
    DEFAULT_REQUEST_TIMEOUT,
};
pub use error::{Error, Result};
pub use jsonrpc::{
    JsonRpcError, JsonRpcMessage, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, RequestId,
};
pub use methods::{Direction, MethodDef, PeerSide};
pub use transport::{AuthInfo, MessageExtra, SendOptions, Transport, TransportEvent};
pub use types::{LATEST_PROTOCOL_VERSION, SUPPORTED_PROTOCOL_VERSIONS};

/// Maximum serialized message size accepted by bundled transports, bytes
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;
