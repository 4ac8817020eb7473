//! The `McpServer` facade.
//!
//! Owns the primitive registries and the task store, and wires a protocol
//! engine per connected transport. Registries are shared across
//! connections: a mutation burst produces one `list_changed` notification
//! broadcast to every live connection that negotiated the capability.

use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock, Weak};

use dashmap::DashMap;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use plexmcp_protocol::engine::{Protocol, ProtocolOptions, RequestContext, RequestOptions};
use plexmcp_protocol::error::{Error, Result};
use plexmcp_protocol::transport::Transport;
use plexmcp_protocol::types::{
    ClientCapabilities, CreateMessageParams, CreateMessageResult, ElicitParams, ElicitResult,
    GetPromptResult, Icon, Implementation, ListRootsResult, LoggingLevel, LoggingMessageParams,
    PromptsCapability, ReadResourceResult, ResourceUpdatedParams, ResourcesCapability,
    ServerCapabilities, TasksCapability, ToolsCapability,
};

use crate::registry::{
    BoxFuture, PromptArgDef, PromptCallback, PromptEntry, Registry, RegistryHandle,
    ResourceCallback, ResourceEntry, TemplateCallback, TemplateEntry, ToolCallback, ToolEntry,
};
use crate::router;
use crate::tasks::{InMemoryTaskStore, TaskStore};
use crate::uri_template::UriTemplate;

/// Default page size for registry list endpoints
const DEFAULT_PAGE_SIZE: usize = 50;

/// Tool registration options
#[derive(Clone, Default)]
pub struct ToolConfig {
    /// Display title
    pub title: Option<String>,
    /// Tool description
    pub description: Option<String>,
    /// JSON Schema for arguments; defaults to an open object schema
    pub input_schema: Option<Value>,
    /// JSON Schema for structured output
    pub output_schema: Option<Value>,
    /// Icons
    pub icons: Option<Vec<Icon>>,
    /// Allow task-augmented invocation
    pub supports_tasks: bool,
}

/// Prompt registration options
#[derive(Clone, Default)]
pub struct PromptConfig {
    /// Display title
    pub title: Option<String>,
    /// Prompt description
    pub description: Option<String>,
    /// Declared arguments
    pub arguments: Vec<PromptArgDef>,
    /// Icons
    pub icons: Option<Vec<Icon>>,
}

/// Resource registration options
#[derive(Clone, Default)]
pub struct ResourceConfig {
    /// Display title
    pub title: Option<String>,
    /// Resource description
    pub description: Option<String>,
    /// MIME type
    pub mime_type: Option<String>,
    /// Icons
    pub icons: Option<Vec<Icon>>,
}

pub(crate) struct ServerCore {
    pub(crate) info: Implementation,
    pub(crate) instructions: Option<String>,
    pub(crate) capabilities: ServerCapabilities,
    pub(crate) tools: Registry<ToolEntry>,
    pub(crate) prompts: Registry<PromptEntry>,
    pub(crate) resources: Registry<ResourceEntry>,
    pub(crate) templates: Registry<TemplateEntry>,
    pub(crate) task_store: Arc<dyn TaskStore>,
    pub(crate) page_size: usize,
    pub(crate) connections: StdMutex<Vec<Weak<ConnectionState>>>,
}

/// Per-connection state shared between the router and the connection handle
pub(crate) struct ConnectionState {
    pub(crate) protocol: Protocol,
    pub(crate) log_level: StdRwLock<Option<LoggingLevel>>,
    pub(crate) subscriptions: DashMap<String, ()>,
    pub(crate) initialized: AtomicBool,
}

/// Builder for [`McpServer`]
pub struct McpServerBuilder {
    info: Implementation,
    instructions: Option<String>,
    task_store: Option<Arc<dyn TaskStore>>,
    page_size: usize,
    enable_subscriptions: bool,
    enable_logging: bool,
    enable_tasks: bool,
}

impl McpServerBuilder {
    /// Start a builder with the server's name and version
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            info: Implementation::new(name, version),
            instructions: None,
            task_store: None,
            page_size: DEFAULT_PAGE_SIZE,
            enable_subscriptions: true,
            enable_logging: true,
            enable_tasks: true,
        }
    }

    /// Usage instructions surfaced to hosts at `initialize`
    #[must_use]
    pub fn instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = Some(instructions.into());
        self
    }

    /// Replace the in-memory task store
    #[must_use]
    pub fn task_store(mut self, store: Arc<dyn TaskStore>) -> Self {
        self.task_store = Some(store);
        self
    }

    /// Page size for list endpoints
    #[must_use]
    pub fn page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Disable `resources/subscribe`
    #[must_use]
    pub fn without_subscriptions(mut self) -> Self {
        self.enable_subscriptions = false;
        self
    }

    /// Disable the logging channel
    #[must_use]
    pub fn without_logging(mut self) -> Self {
        self.enable_logging = false;
        self
    }

    /// Disable task augmentation
    #[must_use]
    pub fn without_tasks(mut self) -> Self {
        self.enable_tasks = false;
        self
    }

    /// Build the server
    pub fn build(self) -> McpServer {
        let capabilities = ServerCapabilities {
            tools: Some(ToolsCapability {
                list_changed: Some(true),
            }),
            prompts: Some(PromptsCapability {
                list_changed: Some(true),
            }),
            resources: Some(ResourcesCapability {
                subscribe: Some(self.enable_subscriptions),
                list_changed: Some(true),
            }),
            logging: self.enable_logging.then(Default::default),
            tasks: self.enable_tasks.then(|| TasksCapability {
                list: Some(true),
                cancel: Some(true),
            }),
            experimental: None,
        };
        let core = Arc::new(ServerCore {
            info: self.info,
            instructions: self.instructions,
            capabilities,
            tools: Registry::new(),
            prompts: Registry::new(),
            resources: Registry::new(),
            templates: Registry::new(),
            task_store: self
                .task_store
                .unwrap_or_else(|| Arc::new(InMemoryTaskStore::default())),
            page_size: self.page_size,
            connections: StdMutex::new(Vec::new()),
        });
        McpServer::from_core(core)
    }
}

/// An MCP server: registries of primitives plus per-connection engines.
#[derive(Clone)]
pub struct McpServer {
    core: Arc<ServerCore>,
}

impl std::fmt::Debug for McpServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("McpServer")
            .field("name", &self.core.info.name)
            .field("version", &self.core.info.version)
            .finish()
    }
}

impl McpServer {
    /// Builder entry point
    pub fn builder(name: impl Into<String>, version: impl Into<String>) -> McpServerBuilder {
        McpServerBuilder::new(name, version)
    }

    fn from_core(core: Arc<ServerCore>) -> Self {
        let server = Self { core };
        server.wire_list_changed();
        server
    }

    fn wire_list_changed(&self) {
        for (registry_method, install) in [
            (
                "notifications/tools/list_changed",
                &self.core.tools as &dyn ListChangedSource,
            ),
            (
                "notifications/prompts/list_changed",
                &self.core.prompts as &dyn ListChangedSource,
            ),
            (
                "notifications/resources/list_changed",
                &self.core.resources as &dyn ListChangedSource,
            ),
            (
                "notifications/resources/list_changed",
                &self.core.templates as &dyn ListChangedSource,
            ),
        ] {
            let core = Arc::downgrade(&self.core);
            install.on_changed(Box::new(move || {
                if let Some(core) = core.upgrade() {
                    broadcast_notification(&core, registry_method);
                }
            }));
        }
    }

    /// Server implementation info
    pub fn info(&self) -> &Implementation {
        &self.core.info
    }

    /// The capabilities declared at `initialize`
    pub fn capabilities(&self) -> &ServerCapabilities {
        &self.core.capabilities
    }

    /// Register a tool
    pub fn register_tool<F>(
        &self,
        name: impl Into<String>,
        config: ToolConfig,
        callback: F,
    ) -> Result<RegistryHandle<ToolEntry>>
    where
        F: Fn(Map<String, Value>, RequestContext) -> BoxFuture<plexmcp_protocol::types::CallToolResult>
            + Send
            + Sync
            + 'static,
    {
        self.core.tools.register(ToolEntry {
            name: name.into(),
            title: config.title,
            description: config.description,
            input_schema: config
                .input_schema
                .unwrap_or_else(|| serde_json::json!({"type": "object"})),
            output_schema: config.output_schema,
            icons: config.icons,
            enabled: true,
            supports_tasks: config.supports_tasks,
            callback: Arc::new(callback) as ToolCallback,
        })
    }

    /// Register a prompt
    pub fn register_prompt<F>(
        &self,
        name: impl Into<String>,
        config: PromptConfig,
        callback: F,
    ) -> Result<RegistryHandle<PromptEntry>>
    where
        F: Fn(HashMap<String, Value>, RequestContext) -> BoxFuture<GetPromptResult>
            + Send
            + Sync
            + 'static,
    {
        self.core.prompts.register(PromptEntry {
            name: name.into(),
            title: config.title,
            description: config.description,
            arguments: config.arguments,
            icons: config.icons,
            enabled: true,
            callback: Arc::new(callback) as PromptCallback,
        })
    }

    /// Register a concrete resource at a fixed URI
    pub fn register_resource<F>(
        &self,
        name: impl Into<String>,
        uri: impl Into<String>,
        config: ResourceConfig,
        callback: F,
    ) -> Result<RegistryHandle<ResourceEntry>>
    where
        F: Fn(String, RequestContext) -> BoxFuture<ReadResourceResult> + Send + Sync + 'static,
    {
        self.core.resources.register(ResourceEntry {
            name: name.into(),
            uri: uri.into(),
            title: config.title,
            description: config.description,
            mime_type: config.mime_type,
            icons: config.icons,
            enabled: true,
            callback: Arc::new(callback) as ResourceCallback,
        })
    }

    /// Register a resource template
    pub fn register_resource_template<F>(
        &self,
        name: impl Into<String>,
        uri_template: &str,
        config: ResourceConfig,
        callback: F,
    ) -> Result<RegistryHandle<TemplateEntry>>
    where
        F: Fn(String, HashMap<String, String>, RequestContext) -> BoxFuture<ReadResourceResult>
            + Send
            + Sync
            + 'static,
    {
        self.core.templates.register(TemplateEntry {
            name: name.into(),
            template: UriTemplate::parse(uri_template)?,
            title: config.title,
            description: config.description,
            mime_type: config.mime_type,
            enabled: true,
            callback: Arc::new(callback) as TemplateCallback,
        })
    }

    /// Notify subscribers that a resource's contents changed
    pub fn notify_resource_updated(&self, uri: &str) {
        let params = match serde_json::to_value(ResourceUpdatedParams {
            uri: uri.to_string(),
        }) {
            Ok(params) => params,
            Err(err) => {
                warn!(error = %err, "failed to serialize resource update");
                return;
            }
        };
        for state in live_connections(&self.core) {
            if !state.subscriptions.contains_key(uri) {
                continue;
            }
            let protocol = state.protocol.clone();
            let params = params.clone();
            tokio::spawn(async move {
                if let Err(err) = protocol
                    .notify("notifications/resources/updated", Some(params))
                    .await
                {
                    debug!(error = %err, "resource update notification failed");
                }
            });
        }
    }

    /// Attach a transport: spawns an engine, registers all handlers, and
    /// returns the live connection.
    pub async fn connect<T: Transport + 'static>(&self, transport: T) -> Result<ServerConnection> {
        let protocol = Protocol::new(ProtocolOptions::server());
        let state = Arc::new(ConnectionState {
            protocol: protocol.clone(),
            log_level: StdRwLock::new(None),
            subscriptions: DashMap::new(),
            initialized: AtomicBool::new(false),
        });
        router::register_handlers(&self.core, &state);
        protocol.connect(transport).await?;

        let mut connections = self
            .core
            .connections
            .lock()
            .expect("connections lock poisoned");
        connections.retain(|c| c.upgrade().is_some());
        connections.push(Arc::downgrade(&state));
        drop(connections);

        Ok(ServerConnection {
            core: self.core.clone(),
            state,
        })
    }
}

trait ListChangedSource {
    fn on_changed(&self, f: Box<dyn Fn() + Send + Sync>);
}

impl<T: crate::registry::RegistryEntry> ListChangedSource for Registry<T> {
    fn on_changed(&self, f: Box<dyn Fn() + Send + Sync>) {
        self.on_list_changed(move || f());
    }
}

fn live_connections(core: &Arc<ServerCore>) -> Vec<Arc<ConnectionState>> {
    core.connections
        .lock()
        .expect("connections lock poisoned")
        .iter()
        .filter_map(Weak::upgrade)
        .filter(|c| !c.protocol.is_closed())
        .collect()
}

fn broadcast_notification(core: &Arc<ServerCore>, method: &'static str) {
    for state in live_connections(core) {
        let protocol = state.protocol.clone();
        tokio::spawn(async move {
            if let Err(err) = protocol.notify(method, None).await {
                debug!(method = %method, error = %err, "list_changed broadcast failed");
            }
        });
    }
}

/// A live server-side connection.
pub struct ServerConnection {
    core: Arc<ServerCore>,
    state: Arc<ConnectionState>,
}

impl ServerConnection {
    /// The underlying protocol engine
    pub fn protocol(&self) -> &Protocol {
        &self.state.protocol
    }

    /// Whether the client completed the `initialize` handshake
    pub fn is_initialized(&self) -> bool {
        self.state
            .initialized
            .load(std::sync::atomic::Ordering::SeqCst)
    }

    /// The client capabilities recorded at `initialize`
    pub fn client_capabilities(&self) -> Option<ClientCapabilities> {
        match self.state.protocol.remote_capabilities() {
            Some(plexmcp_protocol::types::RemoteCapabilities::Client(caps)) => Some(caps),
            _ => None,
        }
    }

    /// Emit a log message toward the client, honoring its `logging/setLevel`
    pub async fn log(
        &self,
        level: LoggingLevel,
        logger: Option<String>,
        data: Value,
    ) -> Result<()> {
        if self.core.capabilities.logging.is_none() {
            return Err(Error::method_not_found("logging capability not declared"));
        }
        let minimum = *self.state.log_level.read().expect("level lock poisoned");
        if let Some(minimum) = minimum {
            if level < minimum {
                return Ok(());
            }
        }
        let params = serde_json::to_value(LoggingMessageParams {
            level,
            logger,
            data,
        })?;
        self.state
            .protocol
            .notify("notifications/message", Some(params))
            .await
    }

    /// Request filesystem roots from the client
    pub async fn list_roots(&self) -> Result<ListRootsResult> {
        let result = self
            .state
            .protocol
            .request("roots/list", None, RequestOptions::default())
            .await?;
        Ok(serde_json::from_value(result)?)
    }

    /// Ask the client to sample a message from its model
    pub async fn create_message(&self, params: CreateMessageParams) -> Result<CreateMessageResult> {
        let result = self
            .state
            .protocol
            .request(
                "sampling/createMessage",
                Some(serde_json::to_value(params)?),
                RequestOptions::default(),
            )
            .await?;
        Ok(serde_json::from_value(result)?)
    }

    /// Ask the client to elicit structured input from the user
    pub async fn elicit(&self, params: ElicitParams) -> Result<ElicitResult> {
        let result = self
            .state
            .protocol
            .request(
                "elicitation/create",
                Some(serde_json::to_value(params)?),
                RequestOptions::default(),
            )
            .await?;
        Ok(serde_json::from_value(result)?)
    }

    /// Close the connection and its transport
    pub async fn close(&self) -> Result<()> {
        self.state.protocol.close().await
    }
}

impl std::fmt::Debug for ServerConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConnection")
            .field("initialized", &self.is_initialized())
            .finish()
    }
}
