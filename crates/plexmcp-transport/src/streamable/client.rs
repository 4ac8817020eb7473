//! Client side of the Streamable HTTP transport.
//!
//! Wraps `reqwest`: messages go out as POSTs, responses come back either as
//! buffered JSON or as an SSE stream that is drained into the event
//! channel. A standalone GET stream carries server-initiated notifications
//! and reconnects with exponential backoff, resuming from the last seen
//! event id. Observing a 404 clears the session and fires the configured
//! session-recovery hook so the caller can re-initialize.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, CONTENT_TYPE};
use reqwest::StatusCode;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use plexmcp_protocol::error::{Error, Result};
use plexmcp_protocol::jsonrpc::JsonRpcMessage;
use plexmcp_protocol::transport::{MessageExtra, SendOptions, Transport, TransportEvent};

use super::server::{LAST_EVENT_ID_HEADER, SESSION_ID_HEADER};
use super::sse::SseParser;

/// Hook invoked when the server reports the session is gone
pub type SessionRecoveryHook = Arc<dyn Fn(&Error) + Send + Sync>;

/// Client transport configuration
#[derive(Debug, Clone)]
pub struct StreamableHttpClientConfig {
    /// The MCP endpoint URL
    pub url: String,
    /// Headers applied to every request
    pub common_headers: Vec<(String, String)>,
    /// Extra headers for POSTs; win over `common_headers` on conflict
    pub post_headers: Vec<(String, String)>,
    /// Extra headers for the standalone GET; win over `common_headers`
    pub get_headers: Vec<(String, String)>,
    /// First reconnect delay for the standalone stream
    pub reconnect_initial: Duration,
    /// Reconnect delay ceiling
    pub reconnect_max: Duration,
}

impl StreamableHttpClientConfig {
    /// Configuration for an endpoint URL with default reconnect policy
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            common_headers: Vec::new(),
            post_headers: Vec::new(),
            get_headers: Vec::new(),
            reconnect_initial: Duration::from_secs(1),
            reconnect_max: Duration::from_secs(30),
        }
    }
}

/// Merge header layers: later layers win per name, earlier entries survive
/// otherwise.
fn merge_headers(layers: &[&[(String, String)]]) -> Vec<(String, String)> {
    let mut merged: Vec<(String, String)> = Vec::new();
    for layer in layers {
        for (name, value) in *layer {
            if let Some(existing) = merged
                .iter_mut()
                .find(|(n, _)| n.eq_ignore_ascii_case(name))
            {
                existing.1 = value.clone();
            } else {
                merged.push((name.clone(), value.clone()));
            }
        }
    }
    merged
}

/// Exponential backoff with a ceiling
fn next_backoff(current: Duration, max: Duration) -> Duration {
    (current * 2).min(max)
}

struct ClientInner {
    config: StreamableHttpClientConfig,
    http: reqwest::Client,
    session_id: StdRwLock<Option<String>>,
    last_event_id: StdRwLock<Option<String>>,
    events: StdMutex<Option<mpsc::Sender<TransportEvent>>>,
    on_session_recovery: StdMutex<Option<SessionRecoveryHook>>,
    started: AtomicBool,
    closed: AtomicBool,
    standalone_running: AtomicBool,
}

/// Streamable HTTP client transport
#[derive(Clone)]
pub struct StreamableHttpClientTransport {
    inner: Arc<ClientInner>,
}

impl std::fmt::Debug for StreamableHttpClientTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamableHttpClientTransport")
            .field("url", &self.inner.config.url)
            .field("session_id", &self.session_id())
            .finish()
    }
}

impl StreamableHttpClientTransport {
    /// Create a client transport for the given endpoint
    pub fn new(config: StreamableHttpClientConfig) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                config,
                http: reqwest::Client::new(),
                session_id: StdRwLock::new(None),
                last_event_id: StdRwLock::new(None),
                events: StdMutex::new(None),
                on_session_recovery: StdMutex::new(None),
                started: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                standalone_running: AtomicBool::new(false),
            }),
        }
    }

    /// Install the hook fired when the server reports session loss.
    /// Recovered state starts empty: the session id is cleared before the
    /// hook runs, and the caller is expected to re-initialize.
    pub fn on_session_recovery<F: Fn(&Error) + Send + Sync + 'static>(&self, hook: F) {
        *self
            .inner
            .on_session_recovery
            .lock()
            .expect("hook lock poisoned") = Some(Arc::new(hook));
    }

    /// The last SSE event id observed on the standalone stream
    pub fn last_event_id(&self) -> Option<String> {
        self.inner
            .last_event_id
            .read()
            .expect("event id lock poisoned")
            .clone()
    }

    fn emit(&self, event: TransportEvent) {
        let sender = self
            .inner
            .events
            .lock()
            .expect("events lock poisoned")
            .clone();
        if let Some(sender) = sender {
            let _ = sender.try_send(event);
        }
    }

    fn emit_message(&self, message: JsonRpcMessage) {
        let session_id = self.session_id();
        self.emit(TransportEvent::Message {
            message,
            extra: MessageExtra {
                session_id,
                auth_info: None,
                custom: None,
            },
        });
    }

    fn handle_session_loss(&self, err: &Error) {
        *self
            .inner
            .session_id
            .write()
            .expect("session lock poisoned") = None;
        let hook = self
            .inner
            .on_session_recovery
            .lock()
            .expect("hook lock poisoned")
            .clone();
        if let Some(hook) = hook {
            hook(err);
        }
    }

    fn header_map(&self, per_call: &[(String, String)]) -> HeaderMap {
        let mut headers = HeaderMap::new();
        let layers = merge_headers(&[&self.inner.config.common_headers, per_call]);
        for (name, value) in layers {
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(&value),
            ) {
                headers.insert(name, value);
            }
        }
        if let Some(session) = self.session_id() {
            if let Ok(value) = HeaderValue::from_str(&session) {
                headers.insert(SESSION_ID_HEADER, value);
            }
        }
        headers
    }

    fn record_session(&self, headers: &reqwest::header::HeaderMap) {
        if let Some(session) = headers
            .get(SESSION_ID_HEADER)
            .and_then(|v| v.to_str().ok())
        {
            *self
                .inner
                .session_id
                .write()
                .expect("session lock poisoned") = Some(session.to_string());
        }
    }

    /// Drain an SSE response body into the event channel
    async fn drain_sse(&self, response: reqwest::Response, track_last_event_id: bool) {
        let mut parser = SseParser::new();
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(err) => {
                    debug!(error = %err, "SSE stream ended with error");
                    break;
                }
            };
            for event in parser.feed(&chunk) {
                if track_last_event_id {
                    if let Some(id) = &event.id {
                        *self
                            .inner
                            .last_event_id
                            .write()
                            .expect("event id lock poisoned") = Some(id.clone());
                    }
                }
                if event.data.is_empty() {
                    continue;
                }
                match serde_json::from_str::<JsonRpcMessage>(&event.data) {
                    Ok(message) => self.emit_message(message),
                    Err(err) => {
                        self.emit(TransportEvent::Error(Error::parse(err.to_string())));
                    }
                }
            }
        }
    }

    /// Open the standalone GET stream and keep it alive with exponential
    /// backoff, resuming from the last seen event id.
    pub fn start_standalone_stream(&self) {
        if self.inner.standalone_running.swap(true, Ordering::SeqCst) {
            return;
        }
        let transport = self.clone();
        tokio::spawn(async move {
            let mut backoff = transport.inner.config.reconnect_initial;
            loop {
                if transport.inner.closed.load(Ordering::SeqCst) {
                    break;
                }
                let mut headers = transport.header_map(&transport.inner.config.get_headers);
                headers.insert(ACCEPT, HeaderValue::from_static("text/event-stream"));
                if let Some(last) = transport.last_event_id() {
                    if let Ok(value) = HeaderValue::from_str(&last) {
                        headers.insert(LAST_EVENT_ID_HEADER, value);
                    }
                }
                let result = transport
                    .inner
                    .http
                    .get(&transport.inner.config.url)
                    .headers(headers)
                    .send()
                    .await;
                match result {
                    Ok(response) if response.status() == StatusCode::OK => {
                        backoff = transport.inner.config.reconnect_initial;
                        transport.record_session(response.headers());
                        transport.drain_sse(response, true).await;
                    }
                    Ok(response) if response.status() == StatusCode::NOT_FOUND => {
                        let err = Error::invalid_session("session lost");
                        transport.handle_session_loss(&err);
                        transport.emit(TransportEvent::Error(err));
                        break;
                    }
                    Ok(response) if response.status() == StatusCode::METHOD_NOT_ALLOWED => {
                        debug!("server does not offer a standalone stream");
                        break;
                    }
                    Ok(response) => {
                        debug!(status = %response.status(), "standalone stream request failed");
                    }
                    Err(err) => {
                        debug!(error = %err, "standalone stream connection failed");
                    }
                }
                tokio::time::sleep(backoff).await;
                backoff = next_backoff(backoff, transport.inner.config.reconnect_max);
            }
            transport
                .inner
                .standalone_running
                .store(false, Ordering::SeqCst);
        });
    }
}

#[async_trait]
impl Transport for StreamableHttpClientTransport {
    async fn start(&self) -> Result<mpsc::Receiver<TransportEvent>> {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return Err(Error::internal("streamable HTTP transport already started"));
        }
        let (tx, rx) = mpsc::channel(256);
        *self.inner.events.lock().expect("events lock poisoned") = Some(tx);
        Ok(rx)
    }

    async fn send(&self, message: JsonRpcMessage, _options: SendOptions) -> Result<()> {
        if self.inner.closed.load(Ordering::SeqCst) || !self.inner.started.load(Ordering::SeqCst) {
            return Err(Error::NotConnected);
        }
        let mut headers = self.header_map(&self.inner.config.post_headers);
        headers.insert(
            ACCEPT,
            HeaderValue::from_static("application/json, text/event-stream"),
        );
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let body = serde_json::to_vec(&message).map_err(|e| Error::internal(e.to_string()))?;
        let response = self
            .inner
            .http
            .post(&self.inner.config.url)
            .headers(headers)
            .body(body)
            .send()
            .await
            .map_err(|e| Error::transport(e.to_string()))?;

        let status = response.status();
        self.record_session(response.headers());

        match status {
            StatusCode::ACCEPTED => Ok(()),
            StatusCode::NOT_FOUND => {
                let err = Error::invalid_session("session lost");
                self.handle_session_loss(&err);
                Err(err)
            }
            StatusCode::UNAUTHORIZED => Err(Error::transport("unauthorized")),
            status if status.is_success() => {
                let content_type = response
                    .headers()
                    .get(CONTENT_TYPE)
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or("")
                    .to_string();
                if content_type.starts_with("text/event-stream") {
                    let transport = self.clone();
                    tokio::spawn(async move {
                        transport.drain_sse(response, false).await;
                    });
                    Ok(())
                } else {
                    let bytes = response
                        .bytes()
                        .await
                        .map_err(|e| Error::transport(e.to_string()))?;
                    if bytes.is_empty() {
                        return Ok(());
                    }
                    let value: serde_json::Value = serde_json::from_slice(&bytes)?;
                    let replies: Vec<JsonRpcMessage> = if value.is_array() {
                        serde_json::from_value(value)?
                    } else if value.is_null() {
                        Vec::new()
                    } else {
                        vec![serde_json::from_value(value)?]
                    };
                    for reply in replies {
                        self.emit_message(reply);
                    }
                    Ok(())
                }
            }
            status => {
                warn!(status = %status, "POST rejected");
                Err(Error::transport(format!("HTTP {status}")))
            }
        }
    }

    async fn close(&self) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        // Explicit termination is best-effort.
        if let Some(session) = self.session_id() {
            let mut headers = self.header_map(&[]);
            if let Ok(value) = HeaderValue::from_str(&session) {
                headers.insert(SESSION_ID_HEADER, value);
            }
            let _ = self
                .inner
                .http
                .delete(&self.inner.config.url)
                .headers(headers)
                .send()
                .await;
        }
        self.emit(TransportEvent::Closed);
        *self.inner.events.lock().expect("events lock poisoned") = None;
        Ok(())
    }

    fn session_id(&self) -> Option<String> {
        self.inner
            .session_id
            .read()
            .expect("session lock poisoned")
            .clone()
    }
}
