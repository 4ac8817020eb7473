//! In-memory linked transport pair.
//!
//! Two cross-linked endpoints deliver messages to each other directly.
//! `send` on one end either hands the message to the peer's event channel
//! or, if the peer has not started yet, queues it for delivery on start.
//! Close propagates to the peer exactly once. Intended for tests and
//! same-process client/server wiring.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};

use async_trait::async_trait;
use tokio::sync::mpsc;

use plexmcp_protocol::error::{Error, Result};
use plexmcp_protocol::jsonrpc::JsonRpcMessage;
use plexmcp_protocol::transport::{
    AuthInfo, MessageExtra, SendOptions, Transport, TransportEvent,
};

#[derive(Debug)]
struct Endpoint {
    /// Messages received before this endpoint started
    queue: StdMutex<VecDeque<(JsonRpcMessage, MessageExtra)>>,
    /// Event channel once started
    events: StdMutex<Option<mpsc::Sender<TransportEvent>>>,
    started: AtomicBool,
    closed: AtomicBool,
    /// Peer back-reference; weak so a dropped peer does not leak the pair
    peer: StdMutex<Weak<Endpoint>>,
}

impl Endpoint {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            queue: StdMutex::new(VecDeque::new()),
            events: StdMutex::new(None),
            started: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            peer: StdMutex::new(Weak::new()),
        })
    }

    async fn deliver(&self, message: JsonRpcMessage, extra: MessageExtra) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        if self.started.load(Ordering::SeqCst) {
            let sender = self.events.lock().expect("events lock poisoned").clone();
            if let Some(sender) = sender {
                // Await capacity rather than dropping under backpressure.
                let _ = sender.send(TransportEvent::Message { message, extra }).await;
                return;
            }
        }
        self.queue
            .lock()
            .expect("queue lock poisoned")
            .push_back((message, extra));
    }

    fn close_from_peer(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let sender = self.events.lock().expect("events lock poisoned").take();
        if let Some(sender) = sender {
            let _ = sender.try_send(TransportEvent::Closed);
        }
    }
}

/// One end of an in-memory linked pair.
#[derive(Debug, Clone)]
pub struct InMemoryTransport {
    endpoint: Arc<Endpoint>,
    /// Attached to every message sent from this end
    auth_info: Option<AuthInfo>,
    /// Arbitrary test-harness context attached to every message
    custom_context: Option<Arc<serde_json::Value>>,
    session_id: Option<String>,
}

impl InMemoryTransport {
    /// Create a linked pair. Conventionally the first end is handed to the
    /// client and the second to the server.
    pub fn create_linked_pair() -> (Self, Self) {
        let a = Endpoint::new();
        let b = Endpoint::new();
        *a.peer.lock().expect("peer lock poisoned") = Arc::downgrade(&b);
        *b.peer.lock().expect("peer lock poisoned") = Arc::downgrade(&a);
        (
            Self {
                endpoint: a,
                auth_info: None,
                custom_context: None,
                session_id: None,
            },
            Self {
                endpoint: b,
                auth_info: None,
                custom_context: None,
                session_id: None,
            },
        )
    }

    /// Attach auth info to every message sent from this end
    #[must_use]
    pub fn with_auth_info(mut self, auth_info: AuthInfo) -> Self {
        self.auth_info = Some(auth_info);
        self
    }

    /// Attach arbitrary context to every message sent from this end
    #[must_use]
    pub fn with_custom_context(mut self, context: serde_json::Value) -> Self {
        self.custom_context = Some(Arc::new(context));
        self
    }

    /// Fix the session id messages from this end are delivered under
    #[must_use]
    pub fn with_session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    async fn start(&self) -> Result<mpsc::Receiver<TransportEvent>> {
        if self.endpoint.started.swap(true, Ordering::SeqCst) {
            return Err(Error::internal("in-memory transport already started"));
        }
        // Flush messages queued before start, preserving order.
        let queued: Vec<_> = self
            .endpoint
            .queue
            .lock()
            .expect("queue lock poisoned")
            .drain(..)
            .collect();
        let (tx, rx) = mpsc::channel(queued.len().max(256));
        for (message, extra) in queued {
            let _ = tx.try_send(TransportEvent::Message { message, extra });
        }
        *self.endpoint.events.lock().expect("events lock poisoned") = Some(tx);
        Ok(rx)
    }

    async fn send(&self, message: JsonRpcMessage, _options: SendOptions) -> Result<()> {
        if self.endpoint.closed.load(Ordering::SeqCst) {
            return Err(Error::NotConnected);
        }
        let peer = self
            .endpoint
            .peer
            .lock()
            .expect("peer lock poisoned")
            .upgrade()
            .ok_or(Error::NotConnected)?;
        peer.deliver(
            message,
            MessageExtra {
                session_id: self.session_id.clone(),
                auth_info: self.auth_info.clone(),
                custom: self.custom_context.clone(),
            },
        )
        .await;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if self.endpoint.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let sender = self
            .endpoint
            .events
            .lock()
            .expect("events lock poisoned")
            .take();
        if let Some(sender) = sender {
            let _ = sender.try_send(TransportEvent::Closed);
        }
        if let Some(peer) = self
            .endpoint
            .peer
            .lock()
            .expect("peer lock poisoned")
            .upgrade()
        {
            peer.close_from_peer();
        }
        Ok(())
    }

    fn session_id(&self) -> Option<String> {
        self.session_id.clone()
    }
}
