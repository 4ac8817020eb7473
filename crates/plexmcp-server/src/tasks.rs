//! Task subsystem: the store behind task-augmented requests.
//!
//! Taskable methods may return a task envelope instead of an inline result.
//! The [`TaskStore`] owns task state: the status lifecycle, the immutable
//! terminal result, session scoping, TTL retention, and the per-task
//! message queue that captures traffic emitted by the handler for delivery
//! over whichever stream is available.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use plexmcp_protocol::error::{Error, Result};
use plexmcp_protocol::jsonrpc::{JsonRpcMessage, RequestId};
use plexmcp_protocol::types::{Task, TaskRequest, TaskStatus};

use crate::pagination::{decode_cursor, encode_cursor};

/// Default page size for `tasks/list`
const LIST_PAGE_SIZE: usize = 100;

/// Storage seam for tasks.
///
/// Implementations must be safe under concurrent access from multiple
/// engines, and idempotent under retries: storing a result for a task that
/// is already terminal with the same status is a no-op.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Create a task in `working` state, bound to the originating request
    /// and session.
    async fn create_task(
        &self,
        request: TaskRequest,
        request_id: RequestId,
        method: String,
        params: Option<Value>,
        session_id: Option<String>,
    ) -> Result<Task>;

    /// Fetch a task; fails when absent or owned by another session
    async fn get_task(&self, task_id: &str, session_id: Option<&str>) -> Result<Task>;

    /// Move a task's status forward; regressions and transitions out of a
    /// terminal state are rejected.
    async fn update_task_status(
        &self,
        task_id: &str,
        status: TaskStatus,
        status_message: Option<String>,
        session_id: Option<&str>,
    ) -> Result<Task>;

    /// Store the terminal result. `status` must be `completed` or
    /// `failed`; the result is immutable once stored.
    async fn store_task_result(
        &self,
        task_id: &str,
        status: TaskStatus,
        result: Value,
        session_id: Option<&str>,
    ) -> Result<()>;

    /// Fetch the stored result; fails while the task is non-terminal
    async fn get_task_result(&self, task_id: &str, session_id: Option<&str>) -> Result<Value>;

    /// Cancel a non-terminal task
    async fn cancel_task(
        &self,
        task_id: &str,
        reason: Option<String>,
        session_id: Option<&str>,
    ) -> Result<Task>;

    /// List tasks visible to the session, oldest first, with an opaque
    /// cursor monotone in creation order.
    async fn list_tasks(
        &self,
        session_id: Option<&str>,
        cursor: Option<&str>,
    ) -> Result<(Vec<Task>, Option<String>)>;

    /// Queue a message emitted by the task's handler for later delivery
    async fn enqueue_message(&self, task_id: &str, message: JsonRpcMessage) -> Result<()>;

    /// Drain queued messages in order
    async fn drain_messages(&self, task_id: &str) -> Result<Vec<JsonRpcMessage>>;

    /// The cancellation token aborted when the task is cancelled
    async fn cancellation_token(&self, task_id: &str) -> Result<CancellationToken>;

    /// The request that created the task: `(request_id, method, params)`
    async fn originating_request(
        &self,
        task_id: &str,
        session_id: Option<&str>,
    ) -> Result<(RequestId, String, Option<Value>)>;
}

struct StoredTask {
    task: Task,
    session_id: Option<String>,
    /// Creation order; backs the list cursor
    sequence: u64,
    terminal_at: Option<Instant>,
    result: Option<Value>,
    queue: VecDeque<JsonRpcMessage>,
    cancel: CancellationToken,
    /// Originating request: `(request_id, method, params)`
    request: (RequestId, String, Option<Value>),
}

impl StoredTask {
    fn visible_to(&self, session_id: Option<&str>) -> bool {
        match (&self.session_id, session_id) {
            (Some(owner), Some(caller)) => owner == caller,
            (Some(_), None) => false,
            (None, _) => true,
        }
    }
}

struct StoreState {
    tasks: HashMap<String, StoredTask>,
    next_sequence: u64,
}

/// In-memory reference implementation of [`TaskStore`].
pub struct InMemoryTaskStore {
    state: StdMutex<StoreState>,
    default_ttl: Option<Duration>,
}

impl Default for InMemoryTaskStore {
    fn default() -> Self {
        Self::new(Some(Duration::from_secs(600)))
    }
}

impl InMemoryTaskStore {
    /// Create a store retaining terminal tasks for `default_ttl` when the
    /// creating request named none
    pub fn new(default_ttl: Option<Duration>) -> Self {
        Self {
            state: StdMutex::new(StoreState {
                tasks: HashMap::new(),
                next_sequence: 0,
            }),
            default_ttl,
        }
    }

    /// Evict terminal tasks whose retention window has elapsed
    pub fn sweep(&self) {
        let now = Instant::now();
        let mut state = self.state.lock().expect("task lock poisoned");
        state.tasks.retain(|task_id, stored| {
            let keep = match (stored.terminal_at, stored.task.ttl) {
                (Some(at), Some(ttl)) => now.duration_since(at) <= Duration::from_secs(ttl),
                _ => true,
            };
            if !keep {
                debug!(task_id = %task_id, "evicting expired task");
            }
            keep
        });
    }

    /// Spawn a background eviction sweeper
    pub fn start_cleanup(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                store.sweep();
            }
        })
    }

    fn with_task<R>(
        &self,
        task_id: &str,
        session_id: Option<&str>,
        f: impl FnOnce(&mut StoredTask) -> Result<R>,
    ) -> Result<R> {
        let mut state = self.state.lock().expect("task lock poisoned");
        let stored = state
            .tasks
            .get_mut(task_id)
            .filter(|t| t.visible_to(session_id))
            .ok_or_else(|| Error::invalid_params(format!("task not found: {task_id}")))?;
        f(stored)
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn create_task(
        &self,
        request: TaskRequest,
        request_id: RequestId,
        method: String,
        params: Option<Value>,
        session_id: Option<String>,
    ) -> Result<Task> {
        let task_id = Uuid::new_v4().to_string();
        let ttl = request
            .ttl
            .or_else(|| self.default_ttl.map(|d| d.as_secs()));
        let task = Task {
            task_id: task_id.clone(),
            status: TaskStatus::Working,
            status_message: None,
            created_at: Utc::now().to_rfc3339(),
            ttl,
            poll_interval: None,
        };
        let mut state = self.state.lock().expect("task lock poisoned");
        state.next_sequence += 1;
        let sequence = state.next_sequence;
        state.tasks.insert(
            task_id,
            StoredTask {
                task: task.clone(),
                session_id,
                sequence,
                terminal_at: None,
                result: None,
                queue: VecDeque::new(),
                cancel: CancellationToken::new(),
                request: (request_id, method, params),
            },
        );
        Ok(task)
    }

    async fn get_task(&self, task_id: &str, session_id: Option<&str>) -> Result<Task> {
        self.with_task(task_id, session_id, |stored| Ok(stored.task.clone()))
    }

    async fn update_task_status(
        &self,
        task_id: &str,
        status: TaskStatus,
        status_message: Option<String>,
        session_id: Option<&str>,
    ) -> Result<Task> {
        self.with_task(task_id, session_id, |stored| {
            if !stored.task.status.can_transition_to(status) {
                return Err(Error::invalid_params(format!(
                    "invalid task transition {:?} -> {:?}",
                    stored.task.status, status
                )));
            }
            stored.task.status = status;
            stored.task.status_message = status_message;
            if status.is_terminal() {
                stored.terminal_at = Some(Instant::now());
            }
            Ok(stored.task.clone())
        })
    }

    async fn store_task_result(
        &self,
        task_id: &str,
        status: TaskStatus,
        result: Value,
        session_id: Option<&str>,
    ) -> Result<()> {
        if !matches!(status, TaskStatus::Completed | TaskStatus::Failed) {
            return Err(Error::invalid_params(
                "task results are stored only for completed or failed status",
            ));
        }
        self.with_task(task_id, session_id, |stored| {
            if stored.task.status == status && stored.result.is_some() {
                // Idempotent retry: terminal with the same status already.
                return Ok(());
            }
            if !stored.task.status.can_transition_to(status) {
                return Err(Error::invalid_params(format!(
                    "invalid task transition {:?} -> {:?}",
                    stored.task.status, status
                )));
            }
            stored.task.status = status;
            stored.terminal_at = Some(Instant::now());
            stored.result = Some(result);
            Ok(())
        })
    }

    async fn get_task_result(&self, task_id: &str, session_id: Option<&str>) -> Result<Value> {
        self.with_task(task_id, session_id, |stored| {
            if !stored.task.status.is_terminal() {
                return Err(Error::invalid_params(format!(
                    "task {task_id} has no result yet"
                )));
            }
            stored
                .result
                .clone()
                .ok_or_else(|| Error::invalid_params(format!("task {task_id} stored no result")))
        })
    }

    async fn cancel_task(
        &self,
        task_id: &str,
        reason: Option<String>,
        session_id: Option<&str>,
    ) -> Result<Task> {
        self.with_task(task_id, session_id, |stored| {
            if !stored.task.status.can_transition_to(TaskStatus::Cancelled) {
                return Err(Error::invalid_params(format!(
                    "cannot cancel task in state {:?}",
                    stored.task.status
                )));
            }
            stored.cancel.cancel();
            stored.task.status = TaskStatus::Cancelled;
            stored.task.status_message = reason;
            stored.terminal_at = Some(Instant::now());
            Ok(stored.task.clone())
        })
    }

    async fn list_tasks(
        &self,
        session_id: Option<&str>,
        cursor: Option<&str>,
    ) -> Result<(Vec<Task>, Option<String>)> {
        let state = self.state.lock().expect("task lock poisoned");
        let mut visible: Vec<(u64, Task)> = state
            .tasks
            .values()
            .filter(|t| t.visible_to(session_id))
            .map(|t| (t.sequence, t.task.clone()))
            .collect();
        visible.sort_by_key(|(sequence, _)| *sequence);

        let after: u64 = cursor
            .and_then(decode_cursor)
            .and_then(|raw| raw.parse().ok())
            .unwrap_or(0);
        let page: Vec<(u64, Task)> = visible
            .into_iter()
            .filter(|(sequence, _)| *sequence > after)
            .collect();
        let has_more = page.len() > LIST_PAGE_SIZE;
        let page: Vec<(u64, Task)> = page.into_iter().take(LIST_PAGE_SIZE).collect();
        let next = has_more
            .then(|| page.last().map(|(sequence, _)| encode_cursor(&sequence.to_string())))
            .flatten();
        Ok((page.into_iter().map(|(_, task)| task).collect(), next))
    }

    async fn enqueue_message(&self, task_id: &str, message: JsonRpcMessage) -> Result<()> {
        self.with_task(task_id, None, |stored| {
            stored.queue.push_back(message);
            Ok(())
        })
    }

    async fn drain_messages(&self, task_id: &str) -> Result<Vec<JsonRpcMessage>> {
        self.with_task(task_id, None, |stored| Ok(stored.queue.drain(..).collect()))
    }

    async fn cancellation_token(&self, task_id: &str) -> Result<CancellationToken> {
        self.with_task(task_id, None, |stored| Ok(stored.cancel.clone()))
    }

    async fn originating_request(
        &self,
        task_id: &str,
        session_id: Option<&str>,
    ) -> Result<(RequestId, String, Option<Value>)> {
        self.with_task(task_id, session_id, |stored| Ok(stored.request.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn store() -> InMemoryTaskStore {
        InMemoryTaskStore::new(Some(Duration::from_secs(3600)))
    }

    async fn create(store: &InMemoryTaskStore, session: Option<&str>) -> Task {
        store
            .create_task(
                TaskRequest { ttl: None },
                RequestId::Number(1),
                "tools/call".into(),
                Some(json!({"name": "slow"})),
                session.map(String::from),
            )
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn lifecycle_forward_only() {
        let store = store();
        let task = create(&store, None).await;

        store
            .update_task_status(&task.task_id, TaskStatus::InputRequired, None, None)
            .await
            .unwrap();
        store
            .update_task_status(&task.task_id, TaskStatus::Working, None, None)
            .await
            .unwrap();
        store
            .store_task_result(&task.task_id, TaskStatus::Completed, json!({"ok": true}), None)
            .await
            .unwrap();

        // Terminal is immutable.
        let err = store
            .update_task_status(&task.task_id, TaskStatus::Working, None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidParams(_)));
    }

    #[tokio::test]
    async fn result_not_ready_until_terminal() {
        let store = store();
        let task = create(&store, None).await;
        assert!(store.get_task_result(&task.task_id, None).await.is_err());

        store
            .store_task_result(&task.task_id, TaskStatus::Completed, json!({"n": 1}), None)
            .await
            .unwrap();
        let result = store.get_task_result(&task.task_id, None).await.unwrap();
        assert_eq!(result, json!({"n": 1}));
    }

    #[tokio::test]
    async fn store_result_is_idempotent_on_same_status() {
        let store = store();
        let task = create(&store, None).await;
        store
            .store_task_result(&task.task_id, TaskStatus::Completed, json!({"n": 1}), None)
            .await
            .unwrap();
        // Retry with the same terminal status: a no-op, result unchanged.
        store
            .store_task_result(&task.task_id, TaskStatus::Completed, json!({"n": 2}), None)
            .await
            .unwrap();
        assert_eq!(
            store.get_task_result(&task.task_id, None).await.unwrap(),
            json!({"n": 1})
        );
        // A different terminal status is a rejected transition.
        assert!(store
            .store_task_result(&task.task_id, TaskStatus::Failed, json!({}), None)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn session_scoping_hides_foreign_tasks() {
        let store = store();
        let task = create(&store, Some("s1")).await;
        assert!(store.get_task(&task.task_id, Some("s1")).await.is_ok());
        assert!(store.get_task(&task.task_id, Some("s2")).await.is_err());
        assert!(store.get_task(&task.task_id, None).await.is_err());

        let (own, _) = store.list_tasks(Some("s1"), None).await.unwrap();
        assert_eq!(own.len(), 1);
        let (other, _) = store.list_tasks(Some("s2"), None).await.unwrap();
        assert!(other.is_empty());
    }

    #[tokio::test]
    async fn cancel_aborts_token() {
        let store = store();
        let task = create(&store, None).await;
        let token = store.cancellation_token(&task.task_id).await.unwrap();
        assert!(!token.is_cancelled());
        let cancelled = store
            .cancel_task(&task.task_id, Some("user".into()), None)
            .await
            .unwrap();
        assert_eq!(cancelled.status, TaskStatus::Cancelled);
        assert!(token.is_cancelled());
        // Cancelling twice is a rejected transition.
        assert!(store.cancel_task(&task.task_id, None, None).await.is_err());
    }

    #[tokio::test]
    async fn list_cursor_is_monotone_by_creation() {
        let store = store();
        let mut created = Vec::new();
        for _ in 0..5 {
            created.push(create(&store, None).await.task_id);
        }
        let (tasks, next) = store.list_tasks(None, None).await.unwrap();
        assert_eq!(
            tasks.iter().map(|t| t.task_id.clone()).collect::<Vec<_>>(),
            created
        );
        assert!(next.is_none());
    }

    #[tokio::test]
    async fn ttl_eviction_after_terminal() {
        let store = InMemoryTaskStore::new(Some(Duration::from_secs(0)));
        let task = create(&store, None).await;
        store
            .store_task_result(&task.task_id, TaskStatus::Completed, json!({}), None)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        store.sweep();
        assert!(store.get_task(&task.task_id, None).await.is_err());

        // Non-terminal tasks are never evicted.
        let live = create(&store, None).await;
        store.sweep();
        assert!(store.get_task(&live.task_id, None).await.is_ok());
    }

    #[tokio::test]
    async fn message_queue_drains_in_order() {
        let store = store();
        let task = create(&store, None).await;
        for i in 0..3 {
            store
                .enqueue_message(
                    &task.task_id,
                    plexmcp_protocol::jsonrpc::JsonRpcNotification::new(
                        "notifications/progress",
                        Some(json!({"progressToken": 1, "progress": i})),
                    )
                    .into(),
                )
                .await
                .unwrap();
        }
        let drained = store.drain_messages(&task.task_id).await.unwrap();
        assert_eq!(drained.len(), 3);
        assert!(store.drain_messages(&task.task_id).await.unwrap().is_empty());
    }
}
