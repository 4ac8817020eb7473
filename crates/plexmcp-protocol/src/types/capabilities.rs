//! Capability declarations exchanged at `initialize`.
//!
//! Capabilities are a nested option mapping; a `Some` leaf means the
//! feature is declared. [`ClientCapabilities::allows_method`] and
//! [`ServerCapabilities::allows_method`] are the single place the engine
//! consults before dispatching toward a peer.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Capabilities a client declares to a server
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClientCapabilities {
    /// Filesystem roots exposure
    #[serde(skip_serializing_if = "Option::is_none")]
    pub roots: Option<RootsCapability>,

    /// LLM sampling on behalf of the server
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sampling: Option<SamplingCapability>,

    /// User elicitation on behalf of the server
    #[serde(skip_serializing_if = "Option::is_none")]
    pub elicitation: Option<ElicitationCapability>,

    /// Experimental, non-standard capabilities
    #[serde(skip_serializing_if = "Option::is_none")]
    pub experimental: Option<HashMap<String, Value>>,
}

/// Capabilities a server declares to a client
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServerCapabilities {
    /// Tool listing and invocation
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<ToolsCapability>,

    /// Prompt listing and retrieval
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompts: Option<PromptsCapability>,

    /// Resource listing, reading, and subscriptions
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourcesCapability>,

    /// Log message notifications
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logging: Option<LoggingCapability>,

    /// Long-running task augmentation
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tasks: Option<TasksCapability>,

    /// Experimental, non-standard capabilities
    #[serde(skip_serializing_if = "Option::is_none")]
    pub experimental: Option<HashMap<String, Value>>,
}

/// Roots capability options
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RootsCapability {
    /// Whether the client emits `notifications/roots/list_changed`
    #[serde(rename = "listChanged", skip_serializing_if = "Option::is_none")]
    pub list_changed: Option<bool>,
}

/// Sampling capability options
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SamplingCapability {
    /// Whether sampling requests may carry tool definitions
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<bool>,
}

/// Elicitation capability marker
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElicitationCapability {}

/// Tools capability options
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolsCapability {
    /// Whether the server emits `notifications/tools/list_changed`
    #[serde(rename = "listChanged", skip_serializing_if = "Option::is_none")]
    pub list_changed: Option<bool>,
}

/// Prompts capability options
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptsCapability {
    /// Whether the server emits `notifications/prompts/list_changed`
    #[serde(rename = "listChanged", skip_serializing_if = "Option::is_none")]
    pub list_changed: Option<bool>,
}

/// Resources capability options
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourcesCapability {
    /// Whether `resources/subscribe` is available
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subscribe: Option<bool>,

    /// Whether the server emits `notifications/resources/list_changed`
    #[serde(rename = "listChanged", skip_serializing_if = "Option::is_none")]
    pub list_changed: Option<bool>,
}

/// Logging capability marker
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingCapability {}

/// Tasks capability options
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TasksCapability {
    /// Whether task listing is available
    #[serde(skip_serializing_if = "Option::is_none")]
    pub list: Option<bool>,

    /// Whether task cancellation is available
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cancel: Option<bool>,
}

impl ClientCapabilities {
    /// Whether a server may send the given method to a client that
    /// declared these capabilities.
    pub fn allows_method(&self, method: &str) -> bool {
        match method {
            "sampling/createMessage" => self.sampling.is_some(),
            "elicitation/create" => self.elicitation.is_some(),
            "roots/list" => self.roots.is_some(),
            "notifications/roots/list_changed" => self
                .roots
                .as_ref()
                .is_some_and(|r| r.list_changed.unwrap_or(false)),
            _ => true,
        }
    }
}

impl ServerCapabilities {
    /// Whether a client may send the given method to a server that
    /// declared these capabilities.
    pub fn allows_method(&self, method: &str) -> bool {
        match method {
            "tools/list" | "tools/call" => self.tools.is_some(),
            "prompts/list" | "prompts/get" => self.prompts.is_some(),
            "resources/list" | "resources/read" | "resources/templates/list" => {
                self.resources.is_some()
            }
            "resources/subscribe" | "resources/unsubscribe" => self
                .resources
                .as_ref()
                .is_some_and(|r| r.subscribe.unwrap_or(false)),
            "logging/setLevel" => self.logging.is_some(),
            "tasks/get" | "tasks/result" => self.tasks.is_some(),
            "tasks/list" => self
                .tasks
                .as_ref()
                .is_some_and(|t| t.list.unwrap_or(false)),
            "tasks/cancel" => self
                .tasks
                .as_ref()
                .is_some_and(|t| t.cancel.unwrap_or(false)),
            _ => true,
        }
    }
}

/// The remote peer's declared capabilities, as recorded after `initialize`.
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteCapabilities {
    /// The remote peer is a client
    Client(ClientCapabilities),
    /// The remote peer is a server
    Server(ServerCapabilities),
}

impl RemoteCapabilities {
    /// Whether the remote declared support for receiving `method`
    pub fn allows_method(&self, method: &str) -> bool {
        match self {
            Self::Client(caps) => caps.allows_method(method),
            Self::Server(caps) => caps.allows_method(method),
        }
    }
}
