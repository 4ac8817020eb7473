//! Handlers for server-initiated traffic.
//!
//! Servers issue `sampling/createMessage`, `elicitation/create`, and
//! `roots/list` toward clients; hosts register implementations here before
//! `initialize` so the matching capabilities are declared in the handshake.

use async_trait::async_trait;
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock};

use plexmcp_protocol::error::Result;
use plexmcp_protocol::types::{
    CreateMessageParams, CreateMessageResult, ElicitParams, ElicitResult, LoggingMessageParams,
    Root,
};

/// Samples a message from the host's model on behalf of a server
#[async_trait]
pub trait SamplingHandler: Send + Sync {
    /// Handle a `sampling/createMessage` request
    async fn create_message(&self, params: CreateMessageParams) -> Result<CreateMessageResult>;
}

/// Collects structured user input on behalf of a server
#[async_trait]
pub trait ElicitationHandler: Send + Sync {
    /// Handle an `elicitation/create` request
    async fn elicit(&self, params: ElicitParams) -> Result<ElicitResult>;
}

/// Callback for `notifications/message` log traffic
pub type LogCallback = Arc<dyn Fn(LoggingMessageParams) + Send + Sync>;

/// Registry of host-side handlers, consulted when the handshake computes
/// the client's capability declaration.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    sampling: Arc<StdRwLock<Option<Arc<dyn SamplingHandler>>>>,
    elicitation: Arc<StdRwLock<Option<Arc<dyn ElicitationHandler>>>>,
    roots: Arc<StdRwLock<Option<Vec<Root>>>>,
    on_log: Arc<StdMutex<Option<LogCallback>>>,
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("sampling", &self.sampling_handler().is_some())
            .field("elicitation", &self.elicitation_handler().is_some())
            .field("roots", &self.roots().is_some())
            .finish()
    }
}

impl HandlerRegistry {
    /// Install the sampling handler
    pub fn set_sampling(&self, handler: Arc<dyn SamplingHandler>) {
        *self.sampling.write().expect("handler lock poisoned") = Some(handler);
    }

    /// Install the elicitation handler
    pub fn set_elicitation(&self, handler: Arc<dyn ElicitationHandler>) {
        *self.elicitation.write().expect("handler lock poisoned") = Some(handler);
    }

    /// Expose filesystem roots; enables the `roots` capability
    pub fn set_roots(&self, roots: Vec<Root>) {
        *self.roots.write().expect("handler lock poisoned") = Some(roots);
    }

    /// Install the log-message callback
    pub fn set_log_callback(&self, callback: LogCallback) {
        *self.on_log.lock().expect("handler lock poisoned") = Some(callback);
    }

    /// The installed sampling handler
    pub fn sampling_handler(&self) -> Option<Arc<dyn SamplingHandler>> {
        self.sampling.read().expect("handler lock poisoned").clone()
    }

    /// The installed elicitation handler
    pub fn elicitation_handler(&self) -> Option<Arc<dyn ElicitationHandler>> {
        self.elicitation
            .read()
            .expect("handler lock poisoned")
            .clone()
    }

    /// The declared roots
    pub fn roots(&self) -> Option<Vec<Root>> {
        self.roots.read().expect("handler lock poisoned").clone()
    }

    /// The installed log callback
    pub fn log_callback(&self) -> Option<LogCallback> {
        self.on_log.lock().expect("handler lock poisoned").clone()
    }
}
