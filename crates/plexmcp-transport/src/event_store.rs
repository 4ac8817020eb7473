//! Event store for resumable SSE streams.
//!
//! Every SSE frame on a Streamable HTTP connection gets an event id that is
//! monotonically increasing within its stream and globally unique for
//! replay. On reconnect with `Last-Event-Id`, the store replays the frames
//! after that id in order. Replay re-emits stored frames only; handlers are
//! never re-executed.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex as StdMutex;

use async_trait::async_trait;

use plexmcp_protocol::error::{Error, Result};
use plexmcp_protocol::jsonrpc::JsonRpcMessage;

/// An SSE event id: `<stream-id>_<sequence>`.
///
/// The stream id is embedded so a bare `Last-Event-Id` header is enough to
/// locate the stream it belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EventId {
    /// Stream the event belongs to
    pub stream_id: String,
    /// Per-stream sequence number, monotonically increasing
    pub sequence: u64,
}

impl EventId {
    /// Compose an event id
    pub fn new(stream_id: impl Into<String>, sequence: u64) -> Self {
        Self {
            stream_id: stream_id.into(),
            sequence,
        }
    }

    /// Parse the `<stream-id>_<sequence>` wire form
    pub fn parse(raw: &str) -> Result<Self> {
        let (stream_id, sequence) = raw
            .rsplit_once('_')
            .ok_or_else(|| Error::invalid_params(format!("malformed event id: {raw}")))?;
        let sequence = sequence
            .parse()
            .map_err(|_| Error::invalid_params(format!("malformed event id: {raw}")))?;
        Ok(Self::new(stream_id, sequence))
    }
}

impl std::fmt::Display for EventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}_{}", self.stream_id, self.sequence)
    }
}

/// A stored event ready for (re-)emission
#[derive(Debug, Clone)]
pub struct StoredEvent {
    /// Event id carried on the SSE frame
    pub event_id: EventId,
    /// The message payload
    pub message: JsonRpcMessage,
}

/// Persistence seam for resumable streams.
///
/// Implementations must be safe under concurrent access from multiple
/// engines. Retention is implementation-defined; replaying from an id that
/// has been evicted yields whatever suffix is still retained.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Persist a message on a stream and return its assigned event id
    async fn append(&self, stream_id: &str, message: JsonRpcMessage) -> Result<EventId>;

    /// Return all events on the stream after `last_event_id`, in order
    async fn replay_after(&self, last_event_id: &EventId) -> Result<Vec<StoredEvent>>;
}

#[derive(Debug, Default)]
struct StreamBuffer {
    next_sequence: u64,
    last_append: u64,
    events: VecDeque<StoredEvent>,
}

/// In-memory reference implementation: a per-stream ring buffer, with the
/// least-recently-appended stream evicted once the stream count exceeds
/// its cap.
#[derive(Debug)]
pub struct InMemoryEventStore {
    streams: StdMutex<HashMap<String, StreamBuffer>>,
    capacity_per_stream: usize,
    max_streams: usize,
    clock: std::sync::atomic::AtomicU64,
}

impl Default for InMemoryEventStore {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl InMemoryEventStore {
    /// Create a store retaining up to `capacity_per_stream` events per stream
    pub fn new(capacity_per_stream: usize) -> Self {
        Self {
            streams: StdMutex::new(HashMap::new()),
            capacity_per_stream,
            max_streams: 256,
            clock: std::sync::atomic::AtomicU64::new(0),
        }
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    async fn append(&self, stream_id: &str, message: JsonRpcMessage) -> Result<EventId> {
        let tick = self
            .clock
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let mut streams = self.streams.lock().expect("stream lock poisoned");
        if streams.len() >= self.max_streams && !streams.contains_key(stream_id) {
            if let Some(stalest) = streams
                .iter()
                .min_by_key(|(_, b)| b.last_append)
                .map(|(id, _)| id.clone())
            {
                streams.remove(&stalest);
            }
        }
        let buffer = streams.entry(stream_id.to_string()).or_default();
        buffer.last_append = tick;
        buffer.next_sequence += 1;
        let event_id = EventId::new(stream_id, buffer.next_sequence);
        if buffer.events.len() >= self.capacity_per_stream {
            buffer.events.pop_front();
        }
        buffer.events.push_back(StoredEvent {
            event_id: event_id.clone(),
            message,
        });
        Ok(event_id)
    }

    async fn replay_after(&self, last_event_id: &EventId) -> Result<Vec<StoredEvent>> {
        let streams = self.streams.lock().expect("stream lock poisoned");
        let Some(buffer) = streams.get(&last_event_id.stream_id) else {
            return Ok(Vec::new());
        };
        Ok(buffer
            .events
            .iter()
            .filter(|e| e.event_id.sequence > last_event_id.sequence)
            .cloned()
            .collect())
    }
}
