//! The symmetric bidirectional protocol engine.
//!
//! One `Protocol` instance sits on each end of a connection. Requests,
//! responses, and notifications flow in both directions over a single
//! transport; the engine correlates responses to outbound requests, routes
//! progress by token, propagates cancellation, and dispatches inbound
//! requests to registered handlers.
//!
//! The engine owns the transport once connected: closing the engine closes
//! the transport, and a transport-initiated close rejects every pending
//! outbound request.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock};
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::error::{Error, Result};
use crate::jsonrpc::{
    JsonRpcMessage, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, RequestId,
};
use crate::methods::{self, PeerSide};
use crate::transport::{AuthInfo, MessageExtra, SendOptions, Transport, TransportEvent};
use crate::types::{CancelledParams, ProgressParams, ProgressToken, RemoteCapabilities, RequestMeta};

/// Default timeout applied to outbound requests
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Boxed future returned by request handlers
pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<Value>> + Send>>;

/// A registered request handler
pub type RequestHandlerFn = Arc<dyn Fn(Option<Value>, RequestContext) -> HandlerFuture + Send + Sync>;

/// A registered notification handler
pub type NotificationHandlerFn =
    Arc<dyn Fn(Option<Value>, MessageExtra) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// Progress callback invoked for each `notifications/progress` routed to a
/// request's token
pub type ProgressCallback = Arc<dyn Fn(ProgressParams) + Send + Sync>;

/// Hook letting a session owner gate and observe inbound traffic.
///
/// Validation runs before capability checks and schema validation; an error
/// here is returned to the peer as `InvalidSession` without dispatching.
pub trait SessionGate: Send + Sync {
    /// Check an incoming session id against the active session
    fn validate(&self, incoming: Option<&str>) -> Result<()>;

    /// Record activity for the session
    fn touch(&self, session_id: &str);
}

/// Engine configuration
#[derive(Clone)]
pub struct ProtocolOptions {
    /// Which side of the connection this engine plays
    pub side: PeerSide,
    /// Timeout applied when a request gives none
    pub default_request_timeout: Duration,
    /// Refuse outbound methods the remote has not declared a capability for
    pub enforce_strict_capabilities: bool,
}

impl ProtocolOptions {
    /// Options for a client-side engine
    pub fn client() -> Self {
        Self {
            side: PeerSide::Client,
            default_request_timeout: DEFAULT_REQUEST_TIMEOUT,
            enforce_strict_capabilities: true,
        }
    }

    /// Options for a server-side engine
    pub fn server() -> Self {
        Self {
            side: PeerSide::Server,
            default_request_timeout: DEFAULT_REQUEST_TIMEOUT,
            enforce_strict_capabilities: true,
        }
    }
}

/// Per-request options for [`Protocol::request`]
#[derive(Clone, Default)]
pub struct RequestOptions {
    /// Overrides the engine's default timeout
    pub timeout: Option<Duration>,
    /// Progress callback; registering one threads `_meta.progressToken`
    pub on_progress: Option<ProgressCallback>,
    /// Caller-supplied cancellation
    pub cancellation: Option<CancellationToken>,
    /// Correlate with an inbound request (emitted from inside its handler)
    pub related_request_id: Option<RequestId>,
}

/// A frame yielded by [`Protocol::request_stream`]
#[derive(Debug)]
pub enum StreamFrame {
    /// A progress notification tied to the request
    Progress(ProgressParams),
    /// The final successful result; terminates the stream
    Result(Value),
    /// The final error; terminates the stream
    Error(Error),
}

struct PendingRequest {
    tx: oneshot::Sender<Result<Value>>,
    deadline: Arc<StdMutex<Instant>>,
    timeout: Duration,
}

struct InFlight {
    cancel: CancellationToken,
    responded: Arc<AtomicBool>,
}

struct Shared {
    options: ProtocolOptions,
    transport: StdRwLock<Option<Arc<dyn Transport>>>,
    next_id: AtomicI64,
    pending: StdMutex<HashMap<RequestId, PendingRequest>>,
    progress_handlers: StdMutex<HashMap<ProgressToken, ProgressCallback>>,
    request_handlers: StdRwLock<HashMap<String, RequestHandlerFn>>,
    notification_handlers: StdRwLock<HashMap<String, Vec<NotificationHandlerFn>>>,
    in_flight: StdMutex<HashMap<RequestId, InFlight>>,
    remote_capabilities: StdRwLock<Option<RemoteCapabilities>>,
    session_gate: StdRwLock<Option<Arc<dyn SessionGate>>>,
    on_close: StdMutex<Option<Box<dyn FnOnce() + Send>>>,
    closed: AtomicBool,
}

/// The protocol engine. Cheap to clone; clones share one connection.
#[derive(Clone)]
pub struct Protocol {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Protocol")
            .field("side", &self.shared.options.side)
            .field("closed", &self.shared.closed.load(Ordering::Relaxed))
            .finish()
    }
}

impl Protocol {
    /// Create a new, unconnected engine
    pub fn new(options: ProtocolOptions) -> Self {
        Self {
            shared: Arc::new(Shared {
                options,
                transport: StdRwLock::new(None),
                next_id: AtomicI64::new(1),
                pending: StdMutex::new(HashMap::new()),
                progress_handlers: StdMutex::new(HashMap::new()),
                request_handlers: StdRwLock::new(HashMap::new()),
                notification_handlers: StdRwLock::new(HashMap::new()),
                in_flight: StdMutex::new(HashMap::new()),
                remote_capabilities: StdRwLock::new(None),
                session_gate: StdRwLock::new(None),
                on_close: StdMutex::new(None),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Register a request handler for a method
    pub fn set_request_handler<F>(&self, method: &str, handler: F)
    where
        F: Fn(Option<Value>, RequestContext) -> HandlerFuture + Send + Sync + 'static,
    {
        self.shared
            .request_handlers
            .write()
            .expect("handler lock poisoned")
            .insert(method.to_string(), Arc::new(handler));
    }

    /// Remove a request handler
    pub fn remove_request_handler(&self, method: &str) {
        self.shared
            .request_handlers
            .write()
            .expect("handler lock poisoned")
            .remove(method);
    }

    /// Register a notification handler for a method; handlers stack
    pub fn on_notification<F>(&self, method: &str, handler: F)
    where
        F: Fn(Option<Value>, MessageExtra) -> Pin<Box<dyn Future<Output = ()> + Send>>
            + Send
            + Sync
            + 'static,
    {
        self.shared
            .notification_handlers
            .write()
            .expect("handler lock poisoned")
            .entry(method.to_string())
            .or_default()
            .push(Arc::new(handler));
    }

    /// Install the session gate consulted for every inbound message
    pub fn set_session_gate(&self, gate: Arc<dyn SessionGate>) {
        *self.shared.session_gate.write().expect("gate lock poisoned") = Some(gate);
    }

    /// Record the remote peer's declared capabilities
    pub fn set_remote_capabilities(&self, caps: RemoteCapabilities) {
        *self
            .shared
            .remote_capabilities
            .write()
            .expect("caps lock poisoned") = Some(caps);
    }

    /// The remote peer's declared capabilities, once initialized
    pub fn remote_capabilities(&self) -> Option<RemoteCapabilities> {
        self.shared
            .remote_capabilities
            .read()
            .expect("caps lock poisoned")
            .clone()
    }

    /// Install a callback fired exactly once when the connection closes
    pub fn on_close<F: FnOnce() + Send + 'static>(&self, f: F) {
        *self.shared.on_close.lock().expect("close lock poisoned") = Some(Box::new(f));
    }

    /// Whether the engine has closed
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    /// The transport's durable session id, if any
    pub fn session_id(&self) -> Option<String> {
        self.shared
            .transport
            .read()
            .expect("transport lock poisoned")
            .as_ref()
            .and_then(|t| t.session_id())
    }

    /// Attach a transport and start the dispatch loop.
    ///
    /// The engine owns the transport from here on.
    pub async fn connect<T: Transport + 'static>(&self, transport: T) -> Result<()> {
        let transport: Arc<dyn Transport> = Arc::new(transport);
        let mut events = transport.start().await?;
        {
            let mut slot = self
                .shared
                .transport
                .write()
                .expect("transport lock poisoned");
            if slot.is_some() {
                return Err(Error::internal("protocol already connected"));
            }
            *slot = Some(transport);
        }

        let shared = self.shared.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    TransportEvent::Message { message, extra } => {
                        Shared::dispatch(&shared, message, extra);
                    }
                    TransportEvent::Error(err) => {
                        warn!(error = %err, "transport error");
                    }
                    TransportEvent::Closed => break,
                }
            }
            Shared::handle_close(&shared);
        });
        Ok(())
    }

    /// Close the connection. Idempotent; pending requests reject with
    /// [`Error::TransportClosed`].
    pub async fn close(&self) -> Result<()> {
        let transport = self
            .shared
            .transport
            .read()
            .expect("transport lock poisoned")
            .clone();
        if let Some(t) = transport {
            t.close().await?;
        }
        Shared::handle_close(&self.shared);
        Ok(())
    }

    /// Send a notification
    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<()> {
        self.notify_related(method, params, None).await
    }

    /// Send a notification correlated with an inbound request
    pub async fn notify_related(
        &self,
        method: &str,
        params: Option<Value>,
        related_request_id: Option<RequestId>,
    ) -> Result<()> {
        let def = methods::lookup(method)
            .ok_or_else(|| Error::method_not_found(method.to_string()))?;
        if !self.shared.options.side.may_send(def.direction) {
            return Err(Error::invalid_request(format!(
                "{method} may not be sent from this side of the connection"
            )));
        }
        let transport = self.shared.transport_or_not_connected()?;
        transport
            .send(
                JsonRpcNotification::new(method, params).into(),
                SendOptions { related_request_id },
            )
            .await
    }

    /// Issue a request and await its result.
    ///
    /// Exactly one of a success result, an error result, or a local
    /// rejection (timeout, cancellation, transport close) occurs.
    pub async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        options: RequestOptions,
    ) -> Result<Value> {
        let def = methods::lookup(method)
            .ok_or_else(|| Error::method_not_found(method.to_string()))?;
        if def.notification {
            return Err(Error::invalid_request(format!("{method} is a notification")));
        }
        if !self.shared.options.side.may_send(def.direction) {
            return Err(Error::invalid_request(format!(
                "{method} may not be sent from this side of the connection"
            )));
        }
        self.assert_remote_capability(method)?;
        let transport = self.shared.transport_or_not_connected()?;

        let id = RequestId::Number(self.shared.next_id.fetch_add(1, Ordering::SeqCst));
        let token = ProgressToken::from(&id);

        let mut params = params;
        if let Some(on_progress) = options.on_progress.clone() {
            let obj = params
                .get_or_insert_with(|| Value::Object(serde_json::Map::new()))
                .as_object_mut()
                .ok_or_else(|| Error::invalid_params("request params must be an object"))?;
            let meta = obj
                .entry("_meta")
                .or_insert_with(|| Value::Object(serde_json::Map::new()));
            if let Some(meta) = meta.as_object_mut() {
                meta.insert("progressToken".into(), serde_json::to_value(&token)?);
            }
            self.shared
                .progress_handlers
                .lock()
                .expect("progress lock poisoned")
                .insert(token.clone(), on_progress);
        }

        let timeout = options
            .timeout
            .unwrap_or(self.shared.options.default_request_timeout);
        let deadline = Arc::new(StdMutex::new(Instant::now() + timeout));
        let (tx, rx) = oneshot::channel();
        self.shared
            .pending
            .lock()
            .expect("pending lock poisoned")
            .insert(
                id.clone(),
                PendingRequest {
                    tx,
                    deadline: deadline.clone(),
                    timeout,
                },
            );

        let cleanup = |shared: &Shared| {
            shared
                .pending
                .lock()
                .expect("pending lock poisoned")
                .remove(&id);
            shared
                .progress_handlers
                .lock()
                .expect("progress lock poisoned")
                .remove(&token);
        };

        let request = JsonRpcRequest::new(method, params, id.clone());
        if let Err(err) = transport
            .send(
                request.into(),
                SendOptions {
                    related_request_id: options.related_request_id.clone(),
                },
            )
            .await
        {
            cleanup(&self.shared);
            return Err(err);
        }

        let cancellation = options.cancellation.clone().unwrap_or_default();
        let mut rx = rx;
        let outcome = {
            tokio::select! {
                result = &mut rx => match result {
                    Ok(result) => result,
                    Err(_) => Err(Error::TransportClosed),
                },
                _ = cancellation.cancelled() => {
                    self.send_cancel_best_effort(&id, "cancelled").await;
                    Err(Error::cancelled("cancelled"))
                }
                _ = await_deadline(deadline.clone()) => {
                    self.send_cancel_best_effort(&id, "timeout").await;
                    Err(Error::Timeout(timeout))
                }
            }
        };
        cleanup(&self.shared);
        outcome
    }

    /// Issue a request and observe its progress and terminal frame as a
    /// lazy stream. The stream always ends with exactly one
    /// [`StreamFrame::Result`] or [`StreamFrame::Error`].
    pub fn request_stream(
        &self,
        method: &str,
        params: Option<Value>,
        mut options: RequestOptions,
    ) -> mpsc::Receiver<StreamFrame> {
        let (tx, rx) = mpsc::channel(32);
        let progress_tx = tx.clone();
        options.on_progress = Some(Arc::new(move |p| {
            let _ = progress_tx.try_send(StreamFrame::Progress(p));
        }));
        let engine = self.clone();
        let method = method.to_string();
        tokio::spawn(async move {
            let frame = match engine.request(&method, params, options).await {
                Ok(value) => StreamFrame::Result(value),
                Err(err) => StreamFrame::Error(err),
            };
            let _ = tx.send(frame).await;
        });
        rx
    }

    /// Ping the remote peer
    pub async fn ping(&self) -> Result<()> {
        self.request("ping", None, RequestOptions::default())
            .await
            .map(|_| ())
    }

    fn assert_remote_capability(&self, method: &str) -> Result<()> {
        if !self.shared.options.enforce_strict_capabilities {
            return Ok(());
        }
        let caps = self
            .shared
            .remote_capabilities
            .read()
            .expect("caps lock poisoned");
        match caps.as_ref() {
            // Capabilities unknown until initialize completes; the
            // handshake itself must pass.
            None => Ok(()),
            Some(remote) if remote.allows_method(method) => Ok(()),
            Some(_) => Err(Error::method_not_found(format!(
                "{method}: remote peer has not declared the required capability"
            ))),
        }
    }

    async fn send_cancel_best_effort(&self, id: &RequestId, reason: &str) {
        let params = serde_json::to_value(CancelledParams {
            request_id: id.clone(),
            reason: Some(reason.to_string()),
        })
        .ok();
        if let Ok(transport) = self.shared.transport_or_not_connected() {
            let note = JsonRpcNotification::new("notifications/cancelled", params);
            if let Err(err) = transport.send(note.into(), SendOptions::default()).await {
                debug!(error = %err, "failed to send cancellation notification");
            }
        }
    }
}

impl Shared {
    fn transport_or_not_connected(&self) -> Result<Arc<dyn Transport>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::NotConnected);
        }
        self.transport
            .read()
            .expect("transport lock poisoned")
            .clone()
            .ok_or(Error::NotConnected)
    }

    fn dispatch(shared: &Arc<Self>, message: JsonRpcMessage, extra: MessageExtra) {
        if let (Some(gate), Some(session_id)) = (
            shared
                .session_gate
                .read()
                .expect("gate lock poisoned")
                .clone(),
            extra.session_id.as_deref(),
        ) {
            gate.touch(session_id);
        }
        match message {
            JsonRpcMessage::Request(request) => Self::dispatch_request(shared, request, extra),
            JsonRpcMessage::Notification(note) => Self::dispatch_notification(shared, note, extra),
            JsonRpcMessage::Response(response) => Self::dispatch_response(shared, response),
        }
    }

    fn dispatch_request(shared: &Arc<Self>, request: JsonRpcRequest, extra: MessageExtra) {
        let id = request.id.clone();

        // Session gate runs before any capability or schema validation.
        let gate = shared
            .session_gate
            .read()
            .expect("gate lock poisoned")
            .clone();
        if let Some(gate) = gate {
            if let Err(err) = gate.validate(extra.session_id.as_deref()) {
                Self::respond_error(shared, id, err);
                return;
            }
        }

        let def = match methods::lookup(&request.method) {
            Some(def) if !def.notification => def,
            _ => {
                Self::respond_error(shared, id, Error::method_not_found(request.method));
                return;
            }
        };
        if !shared.options.side.may_receive(def.direction) {
            Self::respond_error(shared, id, Error::method_not_found(request.method));
            return;
        }
        let handler = shared
            .request_handlers
            .read()
            .expect("handler lock poisoned")
            .get(&request.method)
            .cloned();
        let Some(handler) = handler else {
            Self::respond_error(shared, id, Error::method_not_found(request.method));
            return;
        };

        let cancel = CancellationToken::new();
        let responded = Arc::new(AtomicBool::new(false));
        shared.in_flight.lock().expect("in-flight lock poisoned").insert(
            id.clone(),
            InFlight {
                cancel: cancel.clone(),
                responded: responded.clone(),
            },
        );

        let ctx = RequestContext {
            shared: shared.clone(),
            request_id: id.clone(),
            session_id: extra.session_id.clone(),
            auth_info: extra.auth_info.clone(),
            meta: RequestMeta::from_params(request.params.as_ref()),
            cancellation: cancel.clone(),
            responded: responded.clone(),
        };

        let shared = shared.clone();
        let method = request.method.clone();
        tokio::spawn(async move {
            trace!(method = %method, id = %id, "dispatching request");
            let result = handler(request.params, ctx).await;
            shared
                .in_flight
                .lock()
                .expect("in-flight lock poisoned")
                .remove(&id);
            if cancel.is_cancelled() {
                debug!(method = %method, id = %id, "dropping response for cancelled request");
                return;
            }
            if responded.swap(true, Ordering::SeqCst) {
                return;
            }
            let response = match result {
                Ok(value) => JsonRpcResponse::success(value, id),
                Err(err) => JsonRpcResponse::error(err.to_json_rpc(), id),
            };
            Self::send_response(&shared, response).await;
        });
    }

    fn dispatch_notification(shared: &Arc<Self>, note: JsonRpcNotification, extra: MessageExtra) {
        match note.method.as_str() {
            "notifications/cancelled" => {
                let Some(params) = note
                    .params
                    .and_then(|p| serde_json::from_value::<CancelledParams>(p).ok())
                else {
                    return;
                };
                let in_flight = shared.in_flight.lock().expect("in-flight lock poisoned");
                // Cancelling an id with no live handler (already responded,
                // or never seen) is a silent no-op.
                if let Some(entry) = in_flight.get(&params.request_id) {
                    debug!(id = %params.request_id, reason = ?params.reason, "request cancelled by peer");
                    entry.cancel.cancel();
                }
            }
            "notifications/progress" => {
                let Some(params) = note
                    .params
                    .and_then(|p| serde_json::from_value::<ProgressParams>(p).ok())
                else {
                    return;
                };
                // Any progress tied to a pending request pushes its
                // deadline out by the full timeout again.
                {
                    let pending = shared.pending.lock().expect("pending lock poisoned");
                    for (id, req) in pending.iter() {
                        if params.progress_token.matches(id) {
                            *req.deadline.lock().expect("deadline lock poisoned") =
                                Instant::now() + req.timeout;
                        }
                    }
                }
                let handler = shared
                    .progress_handlers
                    .lock()
                    .expect("progress lock poisoned")
                    .get(&params.progress_token)
                    .cloned();
                match handler {
                    Some(handler) => handler(params),
                    None => trace!(token = ?params.progress_token, "progress for unknown token ignored"),
                }
            }
            method => {
                let handlers = shared
                    .notification_handlers
                    .read()
                    .expect("handler lock poisoned")
                    .get(method)
                    .cloned()
                    .unwrap_or_default();
                for handler in handlers {
                    tokio::spawn(handler(note.params.clone(), extra.clone()));
                }
            }
        }
    }

    fn dispatch_response(shared: &Arc<Self>, response: JsonRpcResponse) {
        let Some(id) = response.request_id().cloned() else {
            debug!("ignoring response with null id");
            return;
        };
        let pending = shared
            .pending
            .lock()
            .expect("pending lock poisoned")
            .remove(&id);
        match pending {
            Some(req) => {
                let outcome = match response.payload {
                    crate::jsonrpc::JsonRpcResponsePayload::Success { result } => Ok(result),
                    crate::jsonrpc::JsonRpcResponsePayload::Error { error } => {
                        Err(Error::from_json_rpc(error))
                    }
                };
                let _ = req.tx.send(outcome);
            }
            // Unknown or duplicate response id: ignored by contract.
            None => debug!(id = %id, "ignoring response with no pending request"),
        }
    }

    fn respond_error(shared: &Arc<Self>, id: RequestId, err: Error) {
        let shared = shared.clone();
        tokio::spawn(async move {
            let response = JsonRpcResponse::error(err.to_json_rpc(), id);
            Self::send_response(&shared, response).await;
        });
    }

    async fn send_response(shared: &Arc<Self>, response: JsonRpcResponse) {
        let related = response.request_id().cloned();
        let Ok(transport) = shared.transport_or_not_connected() else {
            return;
        };
        if let Err(err) = transport
            .send(
                response.into(),
                SendOptions {
                    related_request_id: related,
                },
            )
            .await
        {
            warn!(error = %err, "failed to send response");
        }
    }

    fn handle_close(shared: &Arc<Self>) {
        if shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let pending: Vec<PendingRequest> = shared
            .pending
            .lock()
            .expect("pending lock poisoned")
            .drain()
            .map(|(_, v)| v)
            .collect();
        for req in pending {
            let _ = req.tx.send(Err(Error::TransportClosed));
        }
        let in_flight: Vec<InFlight> = shared
            .in_flight
            .lock()
            .expect("in-flight lock poisoned")
            .drain()
            .map(|(_, v)| v)
            .collect();
        for entry in in_flight {
            entry.cancel.cancel();
        }
        shared
            .progress_handlers
            .lock()
            .expect("progress lock poisoned")
            .clear();
        // Handlers hold back-references into the surrounding server or
        // client; dropping them here breaks those cycles.
        shared
            .request_handlers
            .write()
            .expect("handler lock poisoned")
            .clear();
        shared
            .notification_handlers
            .write()
            .expect("handler lock poisoned")
            .clear();
        if let Some(on_close) = shared.on_close.lock().expect("close lock poisoned").take() {
            on_close();
        }
    }
}

/// Context handed to request handlers.
///
/// Carries the identity of the inbound request plus a back-channel to the
/// engine for related notifications and requests.
#[derive(Clone)]
pub struct RequestContext {
    shared: Arc<Shared>,
    /// Id of the request being handled
    pub request_id: RequestId,
    /// Session the request arrived under
    pub session_id: Option<String>,
    /// Authentication info validated by the transport
    pub auth_info: Option<AuthInfo>,
    /// `_meta` of the request params
    pub meta: Option<RequestMeta>,
    cancellation: CancellationToken,
    responded: Arc<AtomicBool>,
}

impl std::fmt::Debug for RequestContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestContext")
            .field("request_id", &self.request_id)
            .field("session_id", &self.session_id)
            .finish()
    }
}

impl RequestContext {
    /// The cancellation token aborted when the caller cancels this request
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancellation
    }

    /// Whether the caller has cancelled this request
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// The progress token the caller supplied, if any
    pub fn progress_token(&self) -> Option<&ProgressToken> {
        self.meta.as_ref().and_then(|m| m.progress_token.as_ref())
    }

    fn engine(&self) -> Protocol {
        Protocol {
            shared: self.shared.clone(),
        }
    }

    /// Send a notification correlated with this request
    pub async fn send_notification(&self, method: &str, params: Option<Value>) -> Result<()> {
        self.engine()
            .notify_related(method, params, Some(self.request_id.clone()))
            .await
    }

    /// Issue a request to the peer, correlated with this request
    pub async fn send_request(
        &self,
        method: &str,
        params: Option<Value>,
        mut options: RequestOptions,
    ) -> Result<Value> {
        options.related_request_id = Some(self.request_id.clone());
        self.engine().request(method, params, options).await
    }

    /// Emit a progress notification toward the caller.
    ///
    /// No-op when the caller supplied no progress token, and suppressed
    /// once the response has been sent.
    pub async fn report_progress(
        &self,
        progress: f64,
        total: Option<f64>,
        message: Option<String>,
    ) -> Result<()> {
        let Some(token) = self.progress_token().cloned() else {
            return Ok(());
        };
        if self.responded.load(Ordering::SeqCst) {
            return Ok(());
        }
        let params = serde_json::to_value(ProgressParams {
            progress_token: token,
            progress,
            total,
            message,
        })?;
        self.send_notification("notifications/progress", Some(params))
            .await
    }
}

async fn await_deadline(deadline: Arc<StdMutex<Instant>>) {
    loop {
        let at = *deadline.lock().expect("deadline lock poisoned");
        if Instant::now() >= at {
            return;
        }
        tokio::time::sleep_until(at.into()).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ClientCapabilities, ServerCapabilities};
    use async_trait::async_trait;
    use serde_json::json;
    use tokio::sync::Mutex as TokioMutex;

    /// Channel-backed loopback transport for engine tests.
    #[derive(Debug)]
    struct TestTransport {
        outbound: mpsc::UnboundedSender<JsonRpcMessage>,
        inbound: TokioMutex<Option<mpsc::UnboundedReceiver<JsonRpcMessage>>>,
    }

    fn test_pair() -> (TestTransport, TestTransport) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        (
            TestTransport {
                outbound: a_tx,
                inbound: TokioMutex::new(Some(b_rx)),
            },
            TestTransport {
                outbound: b_tx,
                inbound: TokioMutex::new(Some(a_rx)),
            },
        )
    }

    #[async_trait]
    impl Transport for TestTransport {
        async fn start(&self) -> Result<mpsc::Receiver<TransportEvent>> {
            let mut inbound = self
                .inbound
                .lock()
                .await
                .take()
                .ok_or_else(|| Error::internal("already started"))?;
            let (tx, rx) = mpsc::channel(64);
            tokio::spawn(async move {
                while let Some(message) = inbound.recv().await {
                    if tx
                        .send(TransportEvent::Message {
                            message,
                            extra: MessageExtra::default(),
                        })
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                let _ = tx.send(TransportEvent::Closed).await;
            });
            Ok(rx)
        }

        async fn send(&self, message: JsonRpcMessage, _options: SendOptions) -> Result<()> {
            self.outbound
                .send(message)
                .map_err(|_| Error::NotConnected)
        }

        async fn close(&self) -> Result<()> {
            Ok(())
        }
    }

    fn connected_pair() -> (Protocol, Protocol) {
        let client = Protocol::new(ProtocolOptions::client());
        let server = Protocol::new(ProtocolOptions::server());
        (client, server)
    }

    #[tokio::test]
    async fn request_response_round_trip() {
        let (ct, st) = test_pair();
        let (client, server) = connected_pair();
        server.set_request_handler("ping", |_params, _ctx| {
            Box::pin(async { Ok(json!({})) })
        });
        server.connect(st).await.unwrap();
        client.connect(ct).await.unwrap();

        let result = client
            .request("ping", None, RequestOptions::default())
            .await
            .unwrap();
        assert_eq!(result, json!({}));
    }

    #[tokio::test]
    async fn unknown_method_rejected_by_callee() {
        let (ct, st) = test_pair();
        let (client, server) = connected_pair();
        server.connect(st).await.unwrap();
        client.connect(ct).await.unwrap();

        let err = client
            .request("tools/list", None, RequestOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::MethodNotFound(_)));
    }

    #[tokio::test]
    async fn direction_gate_refuses_locally() {
        let (ct, _st) = test_pair();
        let (client, _server) = connected_pair();
        client.connect(ct).await.unwrap();

        // A client may not issue server-to-client methods.
        let err = client
            .request("sampling/createMessage", None, RequestOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn capability_gate_refuses_before_send() {
        let (ct, _st) = test_pair();
        let (client, _server) = connected_pair();
        client.connect(ct).await.unwrap();
        client.set_remote_capabilities(RemoteCapabilities::Server(ServerCapabilities::default()));

        let err = client
            .request("tools/list", None, RequestOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::MethodNotFound(_)));
    }

    #[tokio::test]
    async fn progress_routed_and_final_response_after() {
        let (ct, st) = test_pair();
        let (client, server) = connected_pair();
        server.set_request_handler("tools/call", |_params, ctx| {
            Box::pin(async move {
                for i in 0..3 {
                    ctx.report_progress(f64::from(i), Some(3.0), None).await?;
                }
                Ok(json!({"content": []}))
            })
        });
        server.connect(st).await.unwrap();
        client.connect(ct).await.unwrap();

        let seen = Arc::new(StdMutex::new(Vec::new()));
        let seen_cb = seen.clone();
        let result = client
            .request(
                "tools/call",
                Some(json!({"name": "slow"})),
                RequestOptions {
                    on_progress: Some(Arc::new(move |p| {
                        seen_cb.lock().unwrap().push(p.progress);
                    })),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(result, json!({"content": []}));
        // All progress frames preceded the response.
        assert_eq!(*seen.lock().unwrap(), vec![0.0, 1.0, 2.0]);
    }

    #[tokio::test]
    async fn cancellation_rejects_locally_and_aborts_callee() {
        let (ct, st) = test_pair();
        let (client, server) = connected_pair();
        let aborted = Arc::new(AtomicBool::new(false));
        let aborted_handler = aborted.clone();
        server.set_request_handler("tools/call", move |_params, ctx| {
            let aborted = aborted_handler.clone();
            Box::pin(async move {
                ctx.cancellation_token().cancelled().await;
                aborted.store(true, Ordering::SeqCst);
                Err(Error::cancelled("aborted"))
            })
        });
        server.connect(st).await.unwrap();
        client.connect(ct).await.unwrap();

        let token = CancellationToken::new();
        let cancel = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            cancel.cancel();
        });
        let err = client
            .request(
                "tools/call",
                Some(json!({"name": "slow"})),
                RequestOptions {
                    cancellation: Some(token),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled(_)));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(aborted.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn timeout_produces_local_reject() {
        let (ct, st) = test_pair();
        let (client, server) = connected_pair();
        server.set_request_handler("tools/call", |_params, _ctx| {
            Box::pin(async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(json!({}))
            })
        });
        server.connect(st).await.unwrap();
        client.connect(ct).await.unwrap();

        let err = client
            .request(
                "tools/call",
                Some(json!({"name": "slow"})),
                RequestOptions {
                    timeout: Some(Duration::from_millis(30)),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
    }

    #[tokio::test]
    async fn request_stream_terminates_with_result() {
        let (ct, st) = test_pair();
        let (client, server) = connected_pair();
        server.set_request_handler("tools/call", |_params, ctx| {
            Box::pin(async move {
                ctx.report_progress(1.0, None, None).await?;
                Ok(json!({"done": true}))
            })
        });
        server.connect(st).await.unwrap();
        client.connect(ct).await.unwrap();

        let mut frames = client.request_stream(
            "tools/call",
            Some(json!({"name": "x"})),
            RequestOptions::default(),
        );
        let mut saw_result = false;
        while let Some(frame) = frames.recv().await {
            match frame {
                StreamFrame::Result(v) => {
                    assert_eq!(v, json!({"done": true}));
                    saw_result = true;
                    break;
                }
                StreamFrame::Progress(_) => {}
                StreamFrame::Error(e) => panic!("unexpected error frame: {e}"),
            }
        }
        assert!(saw_result);
    }

    #[tokio::test]
    async fn close_rejects_pending_requests() {
        let (ct, st) = test_pair();
        let (client, server) = connected_pair();
        server.set_request_handler("tools/call", |_params, _ctx| {
            Box::pin(async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(json!({}))
            })
        });
        server.connect(st).await.unwrap();
        client.connect(ct).await.unwrap();

        let pending = {
            let client = client.clone();
            tokio::spawn(async move {
                client
                    .request("tools/call", Some(json!({"name": "x"})), RequestOptions::default())
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        client.close().await.unwrap();
        let err = pending.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::TransportClosed | Error::NotConnected));
    }

    #[tokio::test]
    async fn remote_capability_check_respects_declaration() {
        let (ct, st) = test_pair();
        let (client, server) = connected_pair();
        // The server issues the request here, so it is gated on the
        // client's declared capabilities.
        server.connect(st).await.unwrap();
        client.connect(ct).await.unwrap();
        server.set_remote_capabilities(RemoteCapabilities::Client(ClientCapabilities::default()));

        let err = server
            .request("roots/list", None, RequestOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::MethodNotFound(_)));
    }
}
