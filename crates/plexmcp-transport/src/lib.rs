//! # plexmcp-transport
//!
//! Transport implementations for the plexmcp SDK:
//!
//! - [`stdio::StdioTransport`] — line-delimited JSON over stdin/stdout
//! - [`memory::InMemoryTransport`] — linked pair for tests and in-process
//!   wiring
//! - [`streamable`] — Streamable HTTP server and client with session
//!   binding and resumable SSE streams
//!
//! plus the [`session::SessionManager`] and the [`event_store::EventStore`]
//! seam backing resumability.

pub mod event_store;
pub mod memory;
pub mod session;
pub mod stdio;
pub mod streamable;

pub use event_store::{EventId, EventStore, InMemoryEventStore, StoredEvent};
pub use memory::InMemoryTransport;
pub use session::{ConnectionSessionGate, SessionManager, SessionState};
pub use stdio::StdioTransport;
pub use streamable::{
    StreamableHttpClientConfig, StreamableHttpClientTransport, StreamableHttpServerConfig,
    StreamableHttpServerTransport,
};
