//! Session lifecycle management.
//!
//! A session is the logical connection context identified by `sessionId`.
//! The manager validates incoming ids, refreshes activity on every valid
//! inbound message, and expires sessions whose idle time exceeds their
//! timeout. Expiry fires `on_session_closed` exactly once per session,
//! whether it is noticed lazily or by the background sweeper.

use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tracing::debug;
use uuid::Uuid;

use plexmcp_protocol::engine::SessionGate;
use plexmcp_protocol::error::{Error, Result};

/// Callback fired when a session is destroyed
pub type SessionClosedCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// State tracked per session
#[derive(Debug, Clone)]
pub struct SessionState {
    /// Session identifier
    pub session_id: String,
    /// Creation instant
    pub created_at: Instant,
    /// Instant of the most recent valid inbound message
    pub last_activity: Instant,
    /// Idle timeout; `None` means the session never expires
    pub timeout: Option<Duration>,
}

impl SessionState {
    fn expired(&self, now: Instant) -> bool {
        self.timeout
            .is_some_and(|t| now.duration_since(self.last_activity) > t)
    }
}

/// Manages session creation, validation, activity, and expiry.
///
/// Safe to share across engines; all state is behind concurrent maps.
#[derive(Clone)]
pub struct SessionManager {
    sessions: Arc<DashMap<String, SessionState>>,
    default_timeout: Option<Duration>,
    on_closed: Arc<StdMutex<Option<SessionClosedCallback>>>,
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("sessions", &self.sessions.len())
            .field("default_timeout", &self.default_timeout)
            .finish()
    }
}

impl SessionManager {
    /// Create a manager whose sessions expire after `default_timeout` idle
    pub fn new(default_timeout: Option<Duration>) -> Self {
        Self {
            sessions: Arc::new(DashMap::new()),
            default_timeout,
            on_closed: Arc::new(StdMutex::new(None)),
        }
    }

    /// Install the session-closed callback
    pub fn on_session_closed<F: Fn(&str) + Send + Sync + 'static>(&self, f: F) {
        *self.on_closed.lock().expect("callback lock poisoned") = Some(Arc::new(f));
    }

    /// Create a new session and return its id
    pub fn create_session(&self) -> String {
        let session_id = Uuid::new_v4().to_string();
        let now = Instant::now();
        self.sessions.insert(
            session_id.clone(),
            SessionState {
                session_id: session_id.clone(),
                created_at: now,
                last_activity: now,
                timeout: self.default_timeout,
            },
        );
        debug!(session_id = %session_id, "session created");
        session_id
    }

    /// Look up a live session, expiring it lazily if past its timeout
    pub fn get(&self, session_id: &str) -> Option<SessionState> {
        let expired = match self.sessions.get(session_id) {
            Some(entry) => entry.expired(Instant::now()),
            None => return None,
        };
        if expired {
            self.terminate(session_id);
            return None;
        }
        self.sessions.get(session_id).map(|e| e.value().clone())
    }

    /// Whether the id names a live session
    pub fn is_live(&self, session_id: &str) -> bool {
        self.get(session_id).is_some()
    }

    /// Record activity for a session
    pub fn touch(&self, session_id: &str) {
        if let Some(mut entry) = self.sessions.get_mut(session_id) {
            entry.last_activity = Instant::now();
        }
    }

    /// Destroy a session; fires the closed callback exactly once
    pub fn terminate(&self, session_id: &str) {
        if self.sessions.remove(session_id).is_some() {
            debug!(session_id = %session_id, "session closed");
            let callback = self
                .on_closed
                .lock()
                .expect("callback lock poisoned")
                .clone();
            if let Some(callback) = callback {
                callback(session_id);
            }
        }
    }

    /// Expire every session past its idle timeout
    pub fn sweep(&self) {
        let now = Instant::now();
        let expired: Vec<String> = self
            .sessions
            .iter()
            .filter(|e| e.expired(now))
            .map(|e| e.session_id.clone())
            .collect();
        for session_id in expired {
            self.terminate(&session_id);
        }
    }

    /// Spawn a background sweeper running at `interval`
    pub fn start_sweeper(&self, interval: Duration) -> tokio::task::JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                manager.sweep();
            }
        })
    }

    /// Number of live sessions
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Whether no sessions are live
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

/// Session gate bound to a single connection's session id.
///
/// Validation succeeds iff no session is active and none was provided, or
/// the provided id matches the bound session and it is still live.
#[derive(Debug, Clone)]
pub struct ConnectionSessionGate {
    manager: SessionManager,
    session_id: Option<String>,
}

impl ConnectionSessionGate {
    /// Gate for a connection bound to `session_id` (or sessionless)
    pub fn new(manager: SessionManager, session_id: Option<String>) -> Self {
        Self {
            manager,
            session_id,
        }
    }
}

impl SessionGate for ConnectionSessionGate {
    fn validate(&self, incoming: Option<&str>) -> Result<()> {
        match (&self.session_id, incoming) {
            (None, None) => Ok(()),
            (Some(active), Some(incoming)) if active == incoming => {
                if self.manager.is_live(incoming) {
                    Ok(())
                } else {
                    Err(Error::invalid_session(format!("session {incoming} expired")))
                }
            }
            (Some(_), None) => Err(Error::invalid_session("missing session id")),
            (None, Some(incoming)) => {
                Err(Error::invalid_session(format!("unexpected session id {incoming}")))
            }
            (Some(_), Some(incoming)) => {
                Err(Error::invalid_session(format!("unknown session id {incoming}")))
            }
        }
    }

    fn touch(&self, session_id: &str) {
        self.manager.touch(session_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryTransport;
    use plexmcp_protocol::engine::{Protocol, ProtocolOptions, RequestOptions};
    use plexmcp_protocol::error::Error;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn create_and_validate() {
        let manager = SessionManager::new(None);
        let id = manager.create_session();
        let gate = ConnectionSessionGate::new(manager.clone(), Some(id.clone()));
        assert!(gate.validate(Some(&id)).is_ok());
        assert!(gate.validate(None).is_err());
        assert!(gate.validate(Some("other")).is_err());
    }

    #[test]
    fn sessionless_gate_accepts_only_absent() {
        let manager = SessionManager::new(None);
        let gate = ConnectionSessionGate::new(manager, None);
        assert!(gate.validate(None).is_ok());
        assert!(gate.validate(Some("s1")).is_err());
    }

    #[tokio::test]
    async fn expiry_fires_callback_once() {
        let manager = SessionManager::new(Some(Duration::from_millis(10)));
        let closed = Arc::new(AtomicUsize::new(0));
        let counter = closed.clone();
        manager.on_session_closed(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let id = manager.create_session();
        tokio::time::sleep(Duration::from_millis(30)).await;
        // Lazy expiry and the sweeper may both observe it; only one wins.
        assert!(manager.get(&id).is_none());
        manager.sweep();
        assert_eq!(closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn activity_defers_expiry() {
        let manager = SessionManager::new(Some(Duration::from_millis(50)));
        let id = manager.create_session();
        for _ in 0..3 {
            tokio::time::sleep(Duration::from_millis(30)).await;
            manager.touch(&id);
        }
        assert!(manager.is_live(&id));
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(!manager.is_live(&id));
    }

    #[tokio::test]
    async fn engine_gate_rejects_before_dispatch() {
        let manager = SessionManager::new(None);
        let session_id = manager.create_session();

        // Client end sends without a session id; the gated server engine
        // must answer InvalidSession without ever reaching a handler.
        let (client_end, server_end) = InMemoryTransport::create_linked_pair();
        let server = Protocol::new(ProtocolOptions::server());
        server.set_session_gate(Arc::new(ConnectionSessionGate::new(
            manager.clone(),
            Some(session_id.clone()),
        )));
        server.set_request_handler("ping", |_params, _ctx| {
            Box::pin(async { Ok(serde_json::json!({})) })
        });
        server.connect(server_end).await.unwrap();

        let client = Protocol::new(ProtocolOptions::client());
        client.connect(client_end).await.unwrap();
        let err = client
            .request("ping", None, RequestOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidSession(_)));
        assert_eq!(err.json_rpc_code(), -32001);

        // With the session id attached, the same request goes through.
        let (client_end, server_end) = InMemoryTransport::create_linked_pair();
        let client_end = client_end.with_session_id(session_id.clone());
        let server = Protocol::new(ProtocolOptions::server());
        server.set_session_gate(Arc::new(ConnectionSessionGate::new(
            manager,
            Some(session_id),
        )));
        server.set_request_handler("ping", |_params, _ctx| {
            Box::pin(async { Ok(serde_json::json!({})) })
        });
        server.connect(server_end).await.unwrap();
        let client = Protocol::new(ProtocolOptions::client());
        client.connect(client_end).await.unwrap();
        client
            .request("ping", None, RequestOptions::default())
            .await
            .unwrap();
    }

    #[test]
    fn terminate_is_idempotent() {
        let manager = SessionManager::new(None);
        let closed = Arc::new(AtomicUsize::new(0));
        let counter = closed.clone();
        manager.on_session_closed(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let id = manager.create_session();
        manager.terminate(&id);
        manager.terminate(&id);
        assert_eq!(closed.load(Ordering::SeqCst), 1);
    }
}
