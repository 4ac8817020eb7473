//! Line-delimited message codec.
//!
//! Stdio framing is one JSON message per line, `\n`-terminated. The
//! [`ReadBuffer`] accumulates arbitrary byte chunks and yields complete
//! messages; lines that do not look like JSON objects are dropped so that
//! stray debug output interleaved on the stream does not poison the
//! connection.

use bytes::{BufMut, BytesMut};

use crate::error::{Error, Result};
use crate::jsonrpc::JsonRpcMessage;

/// Parse a single JSON-RPC message from raw bytes.
pub fn parse_message(bytes: &[u8]) -> Result<JsonRpcMessage> {
    serde_json::from_slice(bytes).map_err(|e| Error::parse(e.to_string()))
}

/// Serialize a message as JSON followed by a trailing newline.
///
/// Serialized messages must not contain embedded newlines; `serde_json`
/// never emits them, so the output is always exactly one line.
pub fn serialize_message(message: &JsonRpcMessage) -> Result<Vec<u8>> {
    let mut out = serde_json::to_vec(message).map_err(|e| Error::internal(e.to_string()))?;
    out.push(b'\n');
    Ok(out)
}

/// Incremental buffer over a line-delimited byte stream.
///
/// Chunk boundaries carry no meaning: `append(x); append(y)` yields the
/// same messages as `append(x ++ y)`. The trailing partial line is retained
/// across appends until its newline arrives.
#[derive(Debug, Default)]
pub struct ReadBuffer {
    buffer: BytesMut,
}

impl ReadBuffer {
    /// Create an empty buffer
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk of bytes
    pub fn append(&mut self, chunk: &[u8]) {
        self.buffer.put_slice(chunk);
    }

    /// Pop the next complete message, if a full line is buffered.
    ///
    /// Lines that do not both start with `{` and end with `}` are skipped
    /// silently (interleaved stderr noise, blank lines). A line that looks
    /// like JSON but fails validation returns a parse error.
    pub fn next_message(&mut self) -> Result<Option<JsonRpcMessage>> {
        loop {
            let Some(newline) = self.buffer.iter().position(|&b| b == b'\n') else {
                return Ok(None);
            };
            let line = self.buffer.split_to(newline + 1);
            let line = trim_line(&line[..newline]);
            if line.starts_with(b"{") && line.ends_with(b"}") {
                return parse_message(line).map(Some);
            }
        }
    }

    /// Drop all buffered bytes
    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}

fn trim_line(line: &[u8]) -> &[u8] {
    let start = line
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(line.len());
    let end = line
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map_or(start, |i| i + 1);
    &line[start..end]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jsonrpc::{JsonRpcRequest, RequestId};
    use pretty_assertions::assert_eq;

    fn ping(id: i64) -> JsonRpcMessage {
        JsonRpcRequest::new("ping", None, RequestId::Number(id)).into()
    }

    #[test]
    fn serialize_appends_newline() {
        let bytes = serialize_message(&ping(1)).unwrap();
        assert_eq!(*bytes.last().unwrap(), b'\n');
        assert_eq!(bytes.iter().filter(|&&b| b == b'\n').count(), 1);
    }

    #[test]
    fn round_trip_is_identity() {
        let bytes = serialize_message(&ping(42)).unwrap();
        let parsed = parse_message(&bytes[..bytes.len() - 1]).unwrap();
        let reserialized = serialize_message(&parsed).unwrap();
        assert_eq!(bytes, reserialized);
    }

    #[test]
    fn split_appends_equal_single_append() {
        let wire = serialize_message(&ping(1)).unwrap();
        let (a, b) = wire.split_at(wire.len() / 2);

        let mut split = ReadBuffer::new();
        split.append(a);
        assert!(split.next_message().unwrap().is_none());
        split.append(b);
        let from_split = split.next_message().unwrap().unwrap();

        let mut whole = ReadBuffer::new();
        whole.append(&wire);
        let from_whole = whole.next_message().unwrap().unwrap();

        assert_eq!(
            serialize_message(&from_split).unwrap(),
            serialize_message(&from_whole).unwrap()
        );
    }

    #[test]
    fn drops_non_json_lines() {
        let mut buf = ReadBuffer::new();
        buf.append(b"debug: starting up\n");
        buf.append(b"\n");
        let wire = serialize_message(&ping(7)).unwrap();
        buf.append(&wire);
        buf.append(b"warning: noise after\n");

        let msg = buf.next_message().unwrap().unwrap();
        assert_eq!(msg.method(), Some("ping"));
        assert!(buf.next_message().unwrap().is_none());
    }

    #[test]
    fn invalid_json_object_line_is_a_parse_error() {
        let mut buf = ReadBuffer::new();
        buf.append(b"{not json}\n");
        assert!(matches!(buf.next_message(), Err(Error::Parse(_))));
    }

    #[test]
    fn partial_line_retained() {
        let mut buf = ReadBuffer::new();
        buf.append(br#"{"jsonrpc":"2.0","meth"#);
        assert!(buf.next_message().unwrap().is_none());
        buf.append(b"od\":\"ping\",\"id\":1}\n");
        assert_eq!(buf.next_message().unwrap().unwrap().method(), Some("ping"));
    }

    #[test]
    fn crlf_tolerated() {
        let mut buf = ReadBuffer::new();
        buf.append(b"{\"jsonrpc\":\"2.0\",\"method\":\"ping\",\"id\":1}\r\n");
        assert_eq!(buf.next_message().unwrap().unwrap().method(), Some("ping"));
    }
}
