//! Transport abstraction.
//!
//! A transport is a bidirectional message carrier. Instead of callback
//! registration, `start` hands back an event receiver: the protocol engine
//! owns the receiver and runs the dispatch loop, so message delivery order
//! is exactly arrival order and there is no shared callback state.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::error::Result;
use crate::jsonrpc::{JsonRpcMessage, RequestId};

/// Authentication details attached to inbound messages by transports that
/// perform bearer validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthInfo {
    /// The validated access token
    pub token: String,
    /// OAuth client id the token was issued to
    pub client_id: Option<String>,
    /// Scopes granted to the token
    pub scopes: Vec<String>,
    /// Unix expiry, seconds
    pub expires_at: Option<u64>,
}

/// Per-message delivery context supplied by the transport.
#[derive(Debug, Clone, Default)]
pub struct MessageExtra {
    /// Session the message arrived under, when the transport is sessionful
    pub session_id: Option<String>,
    /// Authentication info validated by the transport
    pub auth_info: Option<AuthInfo>,
    /// Arbitrary transport- or test-supplied context
    pub custom: Option<Arc<serde_json::Value>>,
}

/// Options for a single `send`.
#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    /// Correlates this message with an inbound request so stream-oriented
    /// transports can route it onto the matching response stream.
    pub related_request_id: Option<RequestId>,
}

/// Events surfaced by a running transport.
#[derive(Debug)]
pub enum TransportEvent {
    /// A message arrived
    Message {
        /// The parsed message
        message: JsonRpcMessage,
        /// Delivery context
        extra: MessageExtra,
    },
    /// A transport-level error occurred; the transport may still be usable
    Error(crate::error::Error),
    /// The transport closed; no further events follow
    Closed,
}

/// A bidirectional message carrier.
///
/// Contract:
/// - `start` may be called once; a second call fails. It returns the event
///   receiver the engine drains.
/// - `send` on a transport that is not started or already closed fails with
///   [`crate::error::Error::NotConnected`].
/// - `close` is idempotent and causes a final [`TransportEvent::Closed`].
#[async_trait]
pub trait Transport: Send + Sync + std::fmt::Debug {
    /// Start the transport and return its event stream
    async fn start(&self) -> Result<mpsc::Receiver<TransportEvent>>;

    /// Send a message
    async fn send(&self, message: JsonRpcMessage, options: SendOptions) -> Result<()>;

    /// Close the transport
    async fn close(&self) -> Result<()>;

    /// The durable session id owned by this transport, if any
    fn session_id(&self) -> Option<String> {
        None
    }
}

#[async_trait]
impl<T: Transport + ?Sized> Transport for Box<T> {
    async fn start(&self) -> Result<mpsc::Receiver<TransportEvent>> {
        (**self).start().await
    }

    async fn send(&self, message: JsonRpcMessage, options: SendOptions) -> Result<()> {
        (**self).send(message, options).await
    }

    async fn close(&self) -> Result<()> {
        (**self).close().await
    }

    fn session_id(&self) -> Option<String> {
        (**self).session_id()
    }
}
