//! Incremental Server-Sent Events parser.
//!
//! Parses the `text/event-stream` wire format from arbitrary byte chunks:
//! `id:`/`event:`/`data:` fields accumulate until a blank line dispatches
//! the event. Comment lines (leading `:`) and unknown fields are ignored.

/// A parsed SSE event
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SseEvent {
    /// `id:` field, when present
    pub id: Option<String>,
    /// `event:` field; defaults to `message` when absent
    pub event: Option<String>,
    /// Concatenated `data:` lines, newline-joined
    pub data: String,
}

/// Streaming SSE parser retaining partial lines across feeds.
#[derive(Debug, Default)]
pub struct SseParser {
    buffer: Vec<u8>,
    current: SseEvent,
    has_data: bool,
}

impl SseParser {
    /// Create an empty parser
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk and return every event completed by it
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buffer.extend_from_slice(chunk);
        let mut events = Vec::new();
        while let Some(newline) = self.buffer.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=newline).collect();
            let mut line = &line[..line.len() - 1];
            if line.ends_with(b"\r") {
                line = &line[..line.len() - 1];
            }
            if line.is_empty() {
                if self.has_data || self.current.id.is_some() || self.current.event.is_some() {
                    events.push(std::mem::take(&mut self.current));
                    self.has_data = false;
                }
                continue;
            }
            let line = String::from_utf8_lossy(line);
            if let Some(rest) = line.strip_prefix(':') {
                let _ = rest; // comment line
                continue;
            }
            let (field, value) = match line.split_once(':') {
                Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
                None => (line.as_ref(), ""),
            };
            match field {
                "id" => self.current.id = Some(value.to_string()),
                "event" => self.current.event = Some(value.to_string()),
                "data" => {
                    if self.has_data {
                        self.current.data.push('\n');
                    }
                    self.current.data.push_str(value);
                    self.has_data = true;
                }
                _ => {}
            }
        }
        events
    }
}
