//! Streamable HTTP transport: JSON-RPC over POST + Server-Sent Events with
//! durable session ids and resumable event streams.

pub mod client;
pub mod server;
pub mod sse;

pub use client::{StreamableHttpClientConfig, StreamableHttpClientTransport};
pub use server::{
    StreamableHttpServerConfig, StreamableHttpServerTransport, DEFAULT_MAX_BODY_BYTES,
    LAST_EVENT_ID_HEADER, SESSION_ID_HEADER,
};
pub use sse::{SseEvent, SseParser};
