//! # plexmcp-client
//!
//! The client side of the plexmcp SDK: a typed [`Client`] over the
//! bidirectional protocol engine, with handler registration for
//! server-initiated sampling, elicitation, and roots requests.
//!
//! ```no_run
//! use plexmcp_client::Client;
//! use plexmcp_transport::InMemoryTransport;
//! # async fn example(transport: InMemoryTransport) -> plexmcp_protocol::Result<()> {
//! let client = Client::new("my-host", "1.0.0");
//! client.connect(transport).await?;
//! let init = client.initialize().await?;
//! println!("connected to {}", init.server_info.name);
//! let tools = client.list_tools(None).await?;
//! # drop(tools);
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod handlers;

pub use client::{CallToolOptions, Client, ToolOutcome};
pub use handlers::{ElicitationHandler, HandlerRegistry, LogCallback, SamplingHandler};
