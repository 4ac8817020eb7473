//! Standard I/O transport.
//!
//! Line-delimited JSON over the process's stdin/stdout, the standard way
//! MCP servers are spawned by hosts. Incoming chunks run through
//! [`ReadBuffer`], so stray non-JSON lines interleaved on the stream are
//! dropped instead of killing the connection. Logging goes to stderr via
//! `tracing`, never stdout.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{mpsc, Mutex as TokioMutex};
use tracing::{debug, error, trace};

use plexmcp_protocol::codec::{serialize_message, ReadBuffer};
use plexmcp_protocol::error::{Error, Result};
use plexmcp_protocol::jsonrpc::JsonRpcMessage;
use plexmcp_protocol::transport::{MessageExtra, SendOptions, Transport, TransportEvent};

const READ_CHUNK_SIZE: usize = 8192;

/// Transport over the host process's stdin/stdout.
#[derive(Debug)]
pub struct StdioTransport {
    started: AtomicBool,
    closed: Arc<AtomicBool>,
    /// Held across await during writes; one writer at a time
    stdout: TokioMutex<Option<tokio::io::Stdout>>,
    events: TokioMutex<Option<mpsc::Sender<TransportEvent>>>,
}

impl Default for StdioTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl StdioTransport {
    /// Create a stdio transport
    pub fn new() -> Self {
        Self {
            started: AtomicBool::new(false),
            closed: Arc::new(AtomicBool::new(false)),
            stdout: TokioMutex::new(None),
            events: TokioMutex::new(None),
        }
    }

    async fn emit_close(&self) {
        let sender = self.events.lock().await.take();
        if let Some(sender) = sender {
            let _ = sender.send(TransportEvent::Closed).await;
        }
    }
}

#[async_trait]
impl Transport for StdioTransport {
    async fn start(&self) -> Result<mpsc::Receiver<TransportEvent>> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(Error::internal("stdio transport already started"));
        }
        *self.stdout.lock().await = Some(tokio::io::stdout());

        let (tx, rx) = mpsc::channel(256);
        *self.events.lock().await = Some(tx.clone());

        let closed = self.closed.clone();
        tokio::spawn(async move {
            let mut stdin = tokio::io::stdin();
            let mut buffer = ReadBuffer::new();
            let mut chunk = vec![0u8; READ_CHUNK_SIZE];
            loop {
                if closed.load(Ordering::SeqCst) {
                    break;
                }
                match stdin.read(&mut chunk).await {
                    Ok(0) => {
                        debug!("stdin reached EOF");
                        break;
                    }
                    Ok(n) => {
                        buffer.append(&chunk[..n]);
                        loop {
                            match buffer.next_message() {
                                Ok(Some(message)) => {
                                    trace!(method = ?message.method(), "stdio message received");
                                    if tx
                                        .send(TransportEvent::Message {
                                            message,
                                            extra: MessageExtra::default(),
                                        })
                                        .await
                                        .is_err()
                                    {
                                        return;
                                    }
                                }
                                Ok(None) => break,
                                Err(err) => {
                                    error!(error = %err, "failed to parse stdio line");
                                    if tx.send(TransportEvent::Error(err)).await.is_err() {
                                        return;
                                    }
                                }
                            }
                        }
                    }
                    Err(err) => {
                        error!(error = %err, "stdin read failed");
                        let _ = tx
                            .send(TransportEvent::Error(Error::transport(err.to_string())))
                            .await;
                        break;
                    }
                }
            }
            let _ = tx.send(TransportEvent::Closed).await;
        });

        Ok(rx)
    }

    async fn send(&self, message: JsonRpcMessage, _options: SendOptions) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::NotConnected);
        }
        let bytes = serialize_message(&message)?;
        let mut guard = self.stdout.lock().await;
        let Some(stdout) = guard.as_mut() else {
            return Err(Error::NotConnected);
        };
        let write = async {
            stdout.write_all(&bytes).await?;
            stdout.flush().await
        };
        if let Err(err) = write.await {
            // A broken pipe means the host went away: close and surface.
            if err.kind() == std::io::ErrorKind::BrokenPipe {
                drop(guard);
                self.closed.store(true, Ordering::SeqCst);
                self.emit_close().await;
            }
            return Err(Error::transport(err.to_string()));
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        *self.stdout.lock().await = None;
        self.emit_close().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use plexmcp_protocol::jsonrpc::{JsonRpcRequest, RequestId};

    #[tokio::test]
    async fn double_start_fails() {
        let transport = StdioTransport::new();
        let _rx = transport.start().await.unwrap();
        assert!(transport.start().await.is_err());
        transport.close().await.unwrap();
    }

    #[tokio::test]
    async fn send_after_close_is_not_connected() {
        let transport = StdioTransport::new();
        let _rx = transport.start().await.unwrap();
        transport.close().await.unwrap();
        let message: JsonRpcMessage = JsonRpcRequest::new("ping", None, RequestId::Number(1)).into();
        let err = transport
            .send(message, SendOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotConnected));
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let transport = StdioTransport::new();
        let _rx = transport.start().await.unwrap();
        transport.close().await.unwrap();
        transport.close().await.unwrap();
    }
}
