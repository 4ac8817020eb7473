//! # plexmcp-server
//!
//! The server side of the plexmcp SDK: an [`McpServer`] owning registries
//! of tools, prompts, resources, and resource templates, a pluggable
//! [`tasks::TaskStore`] behind task-augmented requests, and the request
//! router that wires everything into a per-connection protocol engine.
//!
//! ```no_run
//! use plexmcp_server::{McpServer, ToolConfig};
//! use plexmcp_protocol::types::CallToolResult;
//! use plexmcp_transport::StdioTransport;
//!
//! # async fn example() -> plexmcp_protocol::Result<()> {
//! let server = McpServer::builder("echo-server", "1.0.0").build();
//! server.register_tool("echo", ToolConfig::default(), |args, _ctx| {
//!     Box::pin(async move {
//!         let message = args.get("message").and_then(|v| v.as_str()).unwrap_or("");
//!         Ok(CallToolResult::text(message.to_string()))
//!     })
//! })?;
//! let connection = server.connect(StdioTransport::new()).await?;
//! # drop(connection);
//! # Ok(())
//! # }
//! ```

pub mod pagination;
pub mod registry;
pub mod router;
pub mod server;
pub mod tasks;
pub mod uri_template;

pub use registry::{
    PromptArgDef, PromptEntry, Registry, RegistryEntry, RegistryHandle, ResourceEntry,
    TemplateEntry, ToolEntry,
};
pub use server::{
    McpServer, McpServerBuilder, PromptConfig, ResourceConfig, ServerConnection, ToolConfig,
};
pub use tasks::{InMemoryTaskStore, TaskStore};
pub use uri_template::UriTemplate;
