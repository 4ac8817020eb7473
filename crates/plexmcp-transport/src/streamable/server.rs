//! Server side of the Streamable HTTP transport.
//!
//! A single endpoint accepts POST (message submission), GET (standalone
//! notification stream), and DELETE (session termination). POST responses
//! are negotiated by `Accept`: buffered JSON, or an SSE stream that carries
//! related server traffic and ends with the final response frame. With an
//! [`EventStore`] configured every SSE frame gets a monotonically
//! increasing event id, and reconnects replay from `Last-Event-Id` without
//! re-executing handlers.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock};
use std::time::Duration;

use axum::body::Body;
use axum::extract::State;
use axum::http::{header, HeaderMap, HeaderValue, Method, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::any;
use axum::Router;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tracing::{debug, warn};
use uuid::Uuid;

use plexmcp_protocol::error::{Error, Result};
use plexmcp_protocol::jsonrpc::{JsonRpcMessage, JsonRpcResponse, RequestId};
use plexmcp_protocol::transport::{MessageExtra, SendOptions, Transport, TransportEvent};

use crate::event_store::{EventId, EventStore};
use crate::session::SessionManager;

/// Session id header exchanged on every request after `initialize`
pub const SESSION_ID_HEADER: &str = "mcp-session-id";
/// Resumption header carrying the last seen SSE event id
pub const LAST_EVENT_ID_HEADER: &str = "last-event-id";

/// Default cap on POST body size: 100 KiB
pub const DEFAULT_MAX_BODY_BYTES: usize = 100 * 1024;

/// Server transport configuration
#[derive(Clone)]
pub struct StreamableHttpServerConfig {
    /// Generate and require `Mcp-Session-Id` (stateful mode)
    pub stateful: bool,
    /// Session registry; required when `stateful`
    pub session_manager: Option<SessionManager>,
    /// Store enabling `Last-Event-Id` resumability
    pub event_store: Option<Arc<dyn EventStore>>,
    /// Reject POST bodies larger than this
    pub max_body_bytes: usize,
    /// Validate the `Host` header against `allowed_hosts`
    pub dns_rebinding_protection: bool,
    /// Accepted `Host` values (compared without port)
    pub allowed_hosts: Vec<String>,
    /// SSE keep-alive interval
    pub keep_alive: Duration,
}

impl Default for StreamableHttpServerConfig {
    fn default() -> Self {
        Self {
            stateful: true,
            session_manager: None,
            event_store: None,
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
            dns_rebinding_protection: true,
            allowed_hosts: vec![
                "localhost".to_string(),
                "127.0.0.1".to_string(),
                "[::1]".to_string(),
            ],
            keep_alive: Duration::from_secs(30),
        }
    }
}

/// An SSE frame ready for emission: optional event id plus JSON data
type SseFrame = (Option<String>, String);

enum ResponseSink {
    /// Frames flow onto the POST's SSE stream
    Sse {
        tx: mpsc::Sender<SseFrame>,
        stream_id: String,
        remaining: Arc<AtomicUsize>,
    },
    /// Responses are buffered and returned as one JSON body
    Json {
        tx: mpsc::Sender<JsonRpcResponse>,
        remaining: Arc<AtomicUsize>,
    },
}

struct Inner {
    config: StreamableHttpServerConfig,
    session_id: StdRwLock<Option<String>>,
    started: AtomicBool,
    closed: AtomicBool,
    events: StdMutex<Option<mpsc::Sender<TransportEvent>>>,
    /// Response routing: inbound request id → sink for its POST
    streams: DashMap<RequestId, Arc<ResponseSink>>,
    /// At most one standalone GET stream per session
    standalone: StdMutex<Option<mpsc::Sender<SseFrame>>>,
    standalone_stream_id: String,
}

/// Streamable HTTP server transport. One instance serves one session;
/// clones share state and an axum router can be built with [`Self::router`].
#[derive(Clone)]
pub struct StreamableHttpServerTransport {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for StreamableHttpServerTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamableHttpServerTransport")
            .field("session_id", &self.session_id())
            .field("stateful", &self.inner.config.stateful)
            .finish()
    }
}

impl StreamableHttpServerTransport {
    /// Create a transport with the given configuration
    pub fn new(config: StreamableHttpServerConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                session_id: StdRwLock::new(None),
                started: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                events: StdMutex::new(None),
                streams: DashMap::new(),
                standalone: StdMutex::new(None),
                standalone_stream_id: format!("standalone-{}", Uuid::new_v4()),
            }),
        }
    }

    /// Build an axum router serving the MCP endpoint at `/`
    pub fn router(&self) -> Router {
        Router::new()
            .route("/", any(handle_any))
            .with_state(self.clone())
    }

    /// Force-close the SSE stream carrying responses for `request_id`,
    /// causing the client to reconnect and resume.
    pub fn close_sse_stream(&self, request_id: &RequestId) {
        self.inner.streams.remove(request_id);
    }

    /// Force-close the standalone GET stream
    pub fn close_standalone_sse_stream(&self) {
        self.inner
            .standalone
            .lock()
            .expect("standalone lock poisoned")
            .take();
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

    fn current_session(&self) -> Option<String> {
        self.inner
            .session_id
            .read()
            .expect("session lock poisoned")
            .clone()
    }
}

#[async_trait::async_trait]
impl Transport for StreamableHttpServerTransport {
    async fn start(&self) -> Result<mpsc::Receiver<TransportEvent>> {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return Err(Error::internal("streamable HTTP transport already started"));
        }
        let (tx, rx) = mpsc::channel(256);
        *self.inner.events.lock().expect("events lock poisoned") = Some(tx);
        Ok(rx)
    }

    async fn send(&self, message: JsonRpcMessage, options: SendOptions) -> Result<()> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(Error::NotConnected);
        }
        if !self.inner.started.load(Ordering::SeqCst) {
            return Err(Error::NotConnected);
        }

        // Route onto the stream correlated with the originating request.
        if let Some(related) = options.related_request_id.as_ref() {
            let sink = self.inner.streams.get(related).map(|e| e.value().clone());
            if let Some(sink) = sink {
                match sink.as_ref() {
                    ResponseSink::Sse {
                        tx,
                        stream_id,
                        remaining,
                    } => {
                        let event_id = self.append_to_store(stream_id, &message).await?;
                        let data = serde_json::to_string(&message)
                            .map_err(|e| Error::internal(e.to_string()))?;
                        let _ = tx.send((event_id, data)).await;
                        if is_response_for(&message, related) {
                            self.inner.streams.remove(related);
                            remaining.fetch_sub(1, Ordering::SeqCst);
                        }
                        return Ok(());
                    }
                    ResponseSink::Json { tx, remaining } => {
                        if let JsonRpcMessage::Response(response) = &message {
                            if is_response_for(&message, related) {
                                let _ = tx.send(response.clone()).await;
                                self.inner.streams.remove(related);
                                remaining.fetch_sub(1, Ordering::SeqCst);
                                return Ok(());
                            }
                        }
                        // Related non-response traffic cannot ride a
                        // buffered JSON reply; fall through to the
                        // standalone stream.
                    }
                }
            }
        }

        // Standalone stream, live or stored for replay.
        let standalone = self
            .inner
            .standalone
            .lock()
            .expect("standalone lock poisoned")
            .clone();
        let event_id = self
            .append_to_store(&self.inner.standalone_stream_id.clone(), &message)
            .await?;
        match standalone {
            Some(tx) => {
                let data =
                    serde_json::to_string(&message).map_err(|e| Error::internal(e.to_string()))?;
                let _ = tx.send((event_id, data)).await;
                Ok(())
            }
            None if event_id.is_some() => Ok(()), // retained for replay
            None => {
                debug!(method = ?message.method(), "no open stream for message; dropped");
                Ok(())
            }
        }
    }

    async fn close(&self) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if let (Some(manager), Some(session)) =
            (&self.inner.config.session_manager, self.current_session())
        {
            manager.terminate(&session);
        }
        self.inner.streams.clear();
        self.close_standalone_sse_stream();
        self.emit(TransportEvent::Closed);
        Ok(())
    }

    fn session_id(&self) -> Option<String> {
        self.current_session()
    }
}

impl StreamableHttpServerTransport {
    async fn append_to_store(
        &self,
        stream_id: &str,
        message: &JsonRpcMessage,
    ) -> Result<Option<String>> {
        match &self.inner.config.event_store {
            Some(store) => {
                let id = store.append(stream_id, message.clone()).await?;
                Ok(Some(id.to_string()))
            }
            None => Ok(None),
        }
    }
}

fn is_response_for(message: &JsonRpcMessage, id: &RequestId) -> bool {
    matches!(message, JsonRpcMessage::Response(r) if r.request_id() == Some(id))
}

// ---------------------------------------------------------------------------
// HTTP handlers
// ---------------------------------------------------------------------------

async fn handle_any(
    State(transport): State<StreamableHttpServerTransport>,
    request: axum::extract::Request,
) -> Response {
    let (parts, body) = request.into_parts();

    if let Err(response) = validate_host(&transport, &parts.headers) {
        return response;
    }
    if transport.inner.closed.load(Ordering::SeqCst) {
        // A terminated session looks exactly like an unknown one, so
        // clients run their session-recovery path.
        return jsonrpc_error_response(
            StatusCode::NOT_FOUND,
            plexmcp_protocol::error::INVALID_SESSION,
            "session terminated".to_string(),
        );
    }
    if !transport.inner.started.load(Ordering::SeqCst) {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }

    match parts.method {
        Method::POST => handle_post(transport, parts.headers, body).await,
        Method::GET => handle_get(transport, parts.headers).await,
        Method::DELETE => handle_delete(transport, parts.headers).await,
        _ => (
            StatusCode::METHOD_NOT_ALLOWED,
            [(header::ALLOW, "GET, POST, DELETE")],
        )
            .into_response(),
    }
}

fn validate_host(
    transport: &StreamableHttpServerTransport,
    headers: &HeaderMap,
) -> std::result::Result<(), Response> {
    if !transport.inner.config.dns_rebinding_protection {
        return Ok(());
    }
    let host = headers
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    // Compare the host name only; `Host` may carry a port.
    let name = host
        .rsplit_once(':')
        .map_or(host, |(name, port)| if port.chars().all(|c| c.is_ascii_digit()) { name } else { host });
    let allowed = transport
        .inner
        .config
        .allowed_hosts
        .iter()
        .any(|h| h.eq_ignore_ascii_case(name) || h.eq_ignore_ascii_case(host));
    if allowed {
        Ok(())
    } else {
        warn!(host = %host, "rejected request for disallowed host");
        Err(jsonrpc_error_response(
            StatusCode::FORBIDDEN,
            -32000,
            format!("Host not allowed: {host}"),
        ))
    }
}

fn jsonrpc_error_response(status: StatusCode, code: i32, message: String) -> Response {
    let body = serde_json::json!({
        "jsonrpc": "2.0",
        "error": {"code": code, "message": message},
        "id": null,
    });
    (status, axum::Json(body)).into_response()
}

fn accepts(headers: &HeaderMap, mime: &str) -> bool {
    headers
        .get(header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|accept| accept.contains(mime) || accept.contains("*/*"))
}

fn session_header(headers: &HeaderMap) -> Option<&str> {
    headers.get(SESSION_ID_HEADER).and_then(|v| v.to_str().ok())
}

/// Outcome of the session check for non-initialize traffic
enum SessionCheck {
    Ok(Option<String>),
    Reject(Response),
}

fn check_session(
    transport: &StreamableHttpServerTransport,
    headers: &HeaderMap,
) -> SessionCheck {
    let provided = session_header(headers);
    let active = transport.current_session();
    match (&active, provided) {
        (None, _) => SessionCheck::Ok(None),
        (Some(_), None) => SessionCheck::Reject(jsonrpc_error_response(
            StatusCode::BAD_REQUEST,
            plexmcp_protocol::error::INVALID_SESSION,
            "Mcp-Session-Id header is required".to_string(),
        )),
        (Some(active), Some(provided)) if active == provided => {
            let live = transport
                .inner
                .config
                .session_manager
                .as_ref()
                .map_or(true, |m| m.is_live(provided));
            if live {
                SessionCheck::Ok(Some(provided.to_string()))
            } else {
                SessionCheck::Reject(jsonrpc_error_response(
                    StatusCode::NOT_FOUND,
                    plexmcp_protocol::error::INVALID_SESSION,
                    "session expired".to_string(),
                ))
            }
        }
        (Some(_), Some(_)) => SessionCheck::Reject(jsonrpc_error_response(
            StatusCode::NOT_FOUND,
            plexmcp_protocol::error::INVALID_SESSION,
            "unknown session".to_string(),
        )),
    }
}

fn with_session_headers(transport: &StreamableHttpServerTransport, headers: &mut HeaderMap) {
    if let Some(session) = transport.current_session() {
        if let Ok(value) = HeaderValue::from_str(&session) {
            headers.insert(SESSION_ID_HEADER, value);
        }
    }
}

async fn handle_post(
    transport: StreamableHttpServerTransport,
    headers: HeaderMap,
    body: Body,
) -> Response {
    let accepts_json = accepts(&headers, "application/json");
    let accepts_sse = accepts(&headers, "text/event-stream");
    if !accepts_json && !accepts_sse {
        return StatusCode::NOT_ACCEPTABLE.into_response();
    }

    let bytes = match axum::body::to_bytes(body, transport.inner.config.max_body_bytes).await {
        Ok(bytes) => bytes,
        Err(_) => return StatusCode::PAYLOAD_TOO_LARGE.into_response(),
    };

    let value: serde_json::Value = match serde_json::from_slice(&bytes) {
        Ok(value) => value,
        Err(err) => {
            return jsonrpc_error_response(
                StatusCode::BAD_REQUEST,
                plexmcp_protocol::error::PARSE_ERROR,
                format!("Parse error: {err}"),
            )
        }
    };
    let batched = value.is_array();
    let raw_messages: Vec<serde_json::Value> = if batched {
        value.as_array().cloned().unwrap_or_default()
    } else {
        vec![value]
    };
    let mut messages = Vec::with_capacity(raw_messages.len());
    for raw in raw_messages {
        match serde_json::from_value::<JsonRpcMessage>(raw) {
            Ok(message) => messages.push(message),
            Err(err) => {
                return jsonrpc_error_response(
                    StatusCode::BAD_REQUEST,
                    plexmcp_protocol::error::INVALID_REQUEST,
                    format!("Invalid Request: {err}"),
                )
            }
        }
    }
    if messages.is_empty() {
        return jsonrpc_error_response(
            StatusCode::BAD_REQUEST,
            plexmcp_protocol::error::INVALID_REQUEST,
            "empty batch".to_string(),
        );
    }

    let is_initialize = messages
        .iter()
        .any(|m| matches!(m, JsonRpcMessage::Request(r) if r.method == "initialize"));

    let session_id = if is_initialize {
        if let Some(active) = transport.current_session() {
            // Re-initialization is allowed only when the prior session has
            // expired: the recovery path starts from empty state.
            let live = transport
                .inner
                .config
                .session_manager
                .as_ref()
                .map_or(true, |m| m.is_live(&active));
            if live {
                return jsonrpc_error_response(
                    StatusCode::BAD_REQUEST,
                    plexmcp_protocol::error::INVALID_REQUEST,
                    "session already initialized".to_string(),
                );
            }
            *transport
                .inner
                .session_id
                .write()
                .expect("session lock poisoned") = None;
        }
        if transport.inner.config.stateful {
            let id = match &transport.inner.config.session_manager {
                Some(manager) => manager.create_session(),
                None => Uuid::new_v4().to_string(),
            };
            *transport
                .inner
                .session_id
                .write()
                .expect("session lock poisoned") = Some(id.clone());
            Some(id)
        } else {
            None
        }
    } else {
        match check_session(&transport, &headers) {
            SessionCheck::Ok(session) => session,
            SessionCheck::Reject(response) => return response,
        }
    };

    let request_ids: Vec<RequestId> = messages
        .iter()
        .filter_map(|m| match m {
            JsonRpcMessage::Request(r) => Some(r.id.clone()),
            _ => None,
        })
        .collect();

    // Notification/response-only POST: deliver and acknowledge.
    if request_ids.is_empty() {
        deliver(&transport, messages, session_id).await;
        let mut response_headers = HeaderMap::new();
        with_session_headers(&transport, &mut response_headers);
        return (StatusCode::ACCEPTED, response_headers).into_response();
    }

    if accepts_sse {
        // Register the stream sinks before delivering so responses cannot
        // race past registration.
        let (tx, rx) = mpsc::channel::<SseFrame>(64);
        let stream_id = format!("post-{}", Uuid::new_v4());
        let remaining = Arc::new(AtomicUsize::new(request_ids.len()));
        for id in &request_ids {
            transport.inner.streams.insert(
                id.clone(),
                Arc::new(ResponseSink::Sse {
                    tx: tx.clone(),
                    stream_id: stream_id.clone(),
                    remaining: remaining.clone(),
                }),
            );
        }
        drop(tx);
        deliver(&transport, messages, session_id).await;

        let keep_alive = transport.inner.config.keep_alive;
        let mut response_headers = HeaderMap::new();
        with_session_headers(&transport, &mut response_headers);
        let stream = ReceiverStream::new(rx).map(|(id, data)| {
            let mut event = Event::default().event("message").data(data);
            if let Some(id) = id {
                event = event.id(id);
            }
            Ok::<Event, std::convert::Infallible>(event)
        });
        let mut response = Sse::new(stream)
            .keep_alive(KeepAlive::new().interval(keep_alive))
            .into_response();
        response.headers_mut().extend(response_headers);
        response
    } else {
        let (tx, mut rx) = mpsc::channel::<JsonRpcResponse>(request_ids.len().max(1));
        let remaining = Arc::new(AtomicUsize::new(request_ids.len()));
        for id in &request_ids {
            transport.inner.streams.insert(
                id.clone(),
                Arc::new(ResponseSink::Json {
                    tx: tx.clone(),
                    remaining: remaining.clone(),
                }),
            );
        }
        drop(tx);
        deliver(&transport, messages, session_id).await;

        let mut responses = Vec::with_capacity(request_ids.len());
        while responses.len() < request_ids.len() {
            match rx.recv().await {
                Some(response) => responses.push(response),
                None => break,
            }
        }

        let mut response_headers = HeaderMap::new();
        with_session_headers(&transport, &mut response_headers);
        let body = if batched {
            serde_json::to_value(&responses)
        } else {
            serde_json::to_value(responses.first())
        };
        match body {
            Ok(body) => (StatusCode::OK, response_headers, axum::Json(body)).into_response(),
            Err(err) => jsonrpc_error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                plexmcp_protocol::error::INTERNAL_ERROR,
                err.to_string(),
            ),
        }
    }
}

async fn deliver(
    transport: &StreamableHttpServerTransport,
    messages: Vec<JsonRpcMessage>,
    session_id: Option<String>,
) {
    let sender = transport
        .inner
        .events
        .lock()
        .expect("events lock poisoned")
        .clone();
    let Some(sender) = sender else { return };
    for message in messages {
        let _ = sender
            .send(TransportEvent::Message {
                message,
                extra: MessageExtra {
                    session_id: session_id.clone(),
                    auth_info: None,
                    custom: None,
                },
            })
            .await;
    }
}

async fn handle_get(transport: StreamableHttpServerTransport, headers: HeaderMap) -> Response {
    if !accepts(&headers, "text/event-stream") {
        return StatusCode::NOT_ACCEPTABLE.into_response();
    }
    if let SessionCheck::Reject(response) = check_session(&transport, &headers) {
        return response;
    }

    // At most one standalone stream per session.
    {
        let mut standalone = transport
            .inner
            .standalone
            .lock()
            .expect("standalone lock poisoned");
        if standalone.as_ref().is_some_and(|tx| !tx.is_closed()) {
            return (
                StatusCode::CONFLICT,
                "standalone SSE stream already open for this session",
            )
                .into_response();
        }
        standalone.take();
    }

    // Replay after Last-Event-Id before going live.
    let mut replayed: Vec<SseFrame> = Vec::new();
    if let Some(last) = headers
        .get(LAST_EVENT_ID_HEADER)
        .and_then(|v| v.to_str().ok())
    {
        if let (Some(store), Ok(last_id)) =
            (&transport.inner.config.event_store, EventId::parse(last))
        {
            match store.replay_after(&last_id).await {
                Ok(events) => {
                    for event in events {
                        if let Ok(data) = serde_json::to_string(&event.message) {
                            replayed.push((Some(event.event_id.to_string()), data));
                        }
                    }
                }
                Err(err) => warn!(error = %err, "event replay failed"),
            }
        }
    }

    let (tx, rx) = mpsc::channel::<SseFrame>(replayed.len().max(64));
    for frame in replayed {
        let _ = tx.send(frame).await;
    }
    *transport
        .inner
        .standalone
        .lock()
        .expect("standalone lock poisoned") = Some(tx);

    let keep_alive = transport.inner.config.keep_alive;
    let mut response_headers = HeaderMap::new();
    with_session_headers(&transport, &mut response_headers);
    let stream = ReceiverStream::new(rx).map(|(id, data)| {
        let mut event = Event::default().event("message").data(data);
        if let Some(id) = id {
            event = event.id(id);
        }
        Ok::<Event, std::convert::Infallible>(event)
    });
    let mut response = Sse::new(stream)
        .keep_alive(KeepAlive::new().interval(keep_alive))
        .into_response();
    response.headers_mut().extend(response_headers);
    response
}

async fn handle_delete(transport: StreamableHttpServerTransport, headers: HeaderMap) -> Response {
    let Some(active) = transport.current_session() else {
        return StatusCode::BAD_REQUEST.into_response();
    };
    match session_header(&headers) {
        None => StatusCode::BAD_REQUEST.into_response(),
        Some(provided) if provided == active => {
            if let Err(err) = transport.close().await {
                warn!(error = %err, "error closing transport on DELETE");
            }
            StatusCode::OK.into_response()
        }
        Some(_) => StatusCode::NOT_FOUND.into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_store::InMemoryEventStore;
    use crate::streamable::sse::SseParser;
    use axum::http::Request;
    use plexmcp_protocol::jsonrpc::JsonRpcRequest;
    use tower::ServiceExt;

    fn config() -> StreamableHttpServerConfig {
        StreamableHttpServerConfig {
            stateful: true,
            session_manager: Some(SessionManager::new(None)),
            event_store: Some(Arc::new(InMemoryEventStore::default())),
            keep_alive: Duration::from_secs(600),
            ..Default::default()
        }
    }

    /// Starts the transport and spawns an echo engine responding `{}` to
    /// every request.
    async fn started(config: StreamableHttpServerConfig) -> StreamableHttpServerTransport {
        let transport = StreamableHttpServerTransport::new(config);
        let mut rx = transport.start().await.unwrap();
        let responder = transport.clone();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if let TransportEvent::Message {
                    message: JsonRpcMessage::Request(request),
                    ..
                } = event
                {
                    let response =
                        JsonRpcResponse::success(serde_json::json!({}), request.id.clone());
                    let _ = responder
                        .send(
                            response.into(),
                            SendOptions {
                                related_request_id: Some(request.id),
                            },
                        )
                        .await;
                }
            }
        });
        transport
    }

    fn init_body() -> String {
        serde_json::to_string(&JsonRpcMessage::from(JsonRpcRequest::new(
            "initialize",
            Some(serde_json::json!({
                "protocolVersion": "2025-06-18",
                "capabilities": {},
                "clientInfo": {"name": "test", "version": "0"}
            })),
            RequestId::Number(1),
        )))
        .unwrap()
    }

    fn post(body: &str, session: Option<&str>, accept: &str) -> Request<Body> {
        let mut builder = Request::builder()
            .method("POST")
            .uri("/")
            .header("host", "localhost:3000")
            .header("content-type", "application/json")
            .header("accept", accept);
        if let Some(session) = session {
            builder = builder.header(SESSION_ID_HEADER, session);
        }
        builder.body(Body::from(body.to_string())).unwrap()
    }

    async fn initialize(transport: &StreamableHttpServerTransport) -> String {
        let response = transport
            .router()
            .oneshot(post(&init_body(), None, "application/json"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        response
            .headers()
            .get(SESSION_ID_HEADER)
            .unwrap()
            .to_str()
            .unwrap()
            .to_string()
    }

    #[tokio::test]
    async fn initialize_assigns_session_header() {
        let transport = started(config()).await;
        let session = initialize(&transport).await;
        assert!(!session.is_empty());
        assert_eq!(transport.session_id().as_deref(), Some(session.as_str()));
    }

    #[tokio::test]
    async fn post_json_mode_returns_buffered_response() {
        let transport = started(config()).await;
        let session = initialize(&transport).await;
        let body = serde_json::to_string(&JsonRpcMessage::from(JsonRpcRequest::new(
            "ping",
            None,
            RequestId::Number(2),
        )))
        .unwrap();
        let response = transport
            .router()
            .oneshot(post(&body, Some(&session), "application/json"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), 1 << 20).await.unwrap();
        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["id"], serde_json::json!(2));
        assert_eq!(value["result"], serde_json::json!({}));
    }

    #[tokio::test]
    async fn post_sse_mode_ends_with_response_frame() {
        let transport = started(config()).await;
        let session = initialize(&transport).await;
        let body = serde_json::to_string(&JsonRpcMessage::from(JsonRpcRequest::new(
            "ping",
            None,
            RequestId::Number(2),
        )))
        .unwrap();
        let response = transport
            .router()
            .oneshot(post(&body, Some(&session), "text/event-stream"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response
            .headers()
            .get(header::CONTENT_TYPE)
            .unwrap()
            .to_str()
            .unwrap()
            .starts_with("text/event-stream"));
        let bytes = axum::body::to_bytes(response.into_body(), 1 << 20).await.unwrap();
        let mut parser = SseParser::new();
        let events = parser.feed(&bytes);
        let last = events.last().expect("at least one frame");
        let value: serde_json::Value = serde_json::from_str(&last.data).unwrap();
        assert_eq!(value["id"], serde_json::json!(2));
        assert!(last.id.is_some(), "event id assigned from the store");
    }

    #[tokio::test]
    async fn notification_only_post_returns_202() {
        let transport = started(config()).await;
        let session = initialize(&transport).await;
        let body = r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#;
        let response = transport
            .router()
            .oneshot(post(body, Some(&session), "application/json"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
    }

    #[tokio::test]
    async fn missing_session_is_400_unknown_is_404() {
        let transport = started(config()).await;
        let _session = initialize(&transport).await;
        let body = serde_json::to_string(&JsonRpcMessage::from(JsonRpcRequest::new(
            "ping",
            None,
            RequestId::Number(2),
        )))
        .unwrap();

        let response = transport
            .router()
            .oneshot(post(&body, None, "application/json"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = transport
            .router()
            .oneshot(post(&body, Some("bogus"), "application/json"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn disallowed_host_is_403_with_envelope() {
        let transport = started(config()).await;
        let request = Request::builder()
            .method("POST")
            .uri("/")
            .header("host", "evil.example.com")
            .header("accept", "application/json")
            .header("content-type", "application/json")
            .body(Body::from(init_body()))
            .unwrap();
        let response = transport.router().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        let bytes = axum::body::to_bytes(response.into_body(), 1 << 20).await.unwrap();
        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["error"]["code"], serde_json::json!(-32000));
    }

    #[tokio::test]
    async fn oversized_body_is_413() {
        let mut cfg = config();
        cfg.max_body_bytes = 64;
        let transport = started(cfg).await;
        let big = format!(
            r#"{{"jsonrpc":"2.0","method":"notifications/initialized","params":{{"pad":"{}"}}}}"#,
            "x".repeat(256)
        );
        let response = transport
            .router()
            .oneshot(post(&big, None, "application/json"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[tokio::test]
    async fn malformed_body_is_400_parse_error() {
        let transport = started(config()).await;
        let response = transport
            .router()
            .oneshot(post("{not json", None, "application/json"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let bytes = axum::body::to_bytes(response.into_body(), 1 << 20).await.unwrap();
        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["error"]["code"], serde_json::json!(-32700));
    }

    #[tokio::test]
    async fn second_standalone_get_conflicts() {
        let transport = started(config()).await;
        let session = initialize(&transport).await;
        let get = |session: &str| {
            Request::builder()
                .method("GET")
                .uri("/")
                .header("host", "localhost")
                .header("accept", "text/event-stream")
                .header(SESSION_ID_HEADER, session)
                .body(Body::empty())
                .unwrap()
        };
        let first = transport.router().oneshot(get(&session)).await.unwrap();
        assert_eq!(first.status(), StatusCode::OK);
        let second = transport.router().oneshot(get(&session)).await.unwrap();
        assert_eq!(second.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn delete_terminates_session() {
        let transport = started(config()).await;
        let session = initialize(&transport).await;
        let delete = Request::builder()
            .method("DELETE")
            .uri("/")
            .header("host", "localhost")
            .header(SESSION_ID_HEADER, session.clone())
            .body(Body::empty())
            .unwrap();
        let response = transport.router().oneshot(delete).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(transport.inner.closed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn unsupported_method_is_405() {
        let transport = started(config()).await;
        let request = Request::builder()
            .method("PUT")
            .uri("/")
            .header("host", "localhost")
            .body(Body::empty())
            .unwrap();
        let response = transport.router().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
    }

    #[tokio::test]
    async fn replay_after_last_event_id() {
        let transport = started(config()).await;
        let session = initialize(&transport).await;

        // Open a standalone stream, push three notifications, then drop it.
        let get = Request::builder()
            .method("GET")
            .uri("/")
            .header("host", "localhost")
            .header("accept", "text/event-stream")
            .header(SESSION_ID_HEADER, session.clone())
            .body(Body::empty())
            .unwrap();
        let first = transport.router().oneshot(get).await.unwrap();
        for i in 1..=3 {
            let note = plexmcp_protocol::jsonrpc::JsonRpcNotification::new(
                "notifications/progress",
                Some(serde_json::json!({"progressToken": 1, "progress": i})),
            );
            transport
                .send(note.into(), SendOptions::default())
                .await
                .unwrap();
        }
        transport.close_standalone_sse_stream();
        let bytes = axum::body::to_bytes(first.into_body(), 1 << 20).await.unwrap();
        let mut parser = SseParser::new();
        let events = parser.feed(&bytes);
        assert_eq!(events.len(), 3);
        let second_id = events[1].id.clone().unwrap();

        // Reconnect with Last-Event-Id = e2: replay must be exactly e3.
        let resume = Request::builder()
            .method("GET")
            .uri("/")
            .header("host", "localhost")
            .header("accept", "text/event-stream")
            .header(SESSION_ID_HEADER, session)
            .header(LAST_EVENT_ID_HEADER, second_id)
            .body(Body::empty())
            .unwrap();
        let response = transport.router().oneshot(resume).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        transport.close_standalone_sse_stream();
        let bytes = axum::body::to_bytes(response.into_body(), 1 << 20).await.unwrap();
        let mut parser = SseParser::new();
        let events = parser.feed(&bytes);
        assert_eq!(events.len(), 1);
        let value: serde_json::Value = serde_json::from_str(&events[0].data).unwrap();
        assert_eq!(value["params"]["progress"], serde_json::json!(3));
    }
}
