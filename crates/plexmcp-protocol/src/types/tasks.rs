//! Long-running task types and the status lifecycle.

use serde::{Deserialize, Serialize};

use super::core::Cursor;

/// Task status lifecycle.
///
/// Transitions move only forward through
/// `working → {input_required → working}* → {completed | failed | cancelled}`;
/// terminal states are immutable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// The task is executing
    Working,
    /// The task is waiting on caller input (elicitation, sampling)
    InputRequired,
    /// The task finished and a result is stored
    Completed,
    /// The task finished with an error result
    Failed,
    /// The task was cancelled before completion
    Cancelled,
}

impl TaskStatus {
    /// Whether this status is terminal
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Whether a transition from `self` to `next` is allowed
    pub fn can_transition_to(self, next: Self) -> bool {
        match self {
            Self::Working => matches!(
                next,
                Self::InputRequired | Self::Completed | Self::Failed | Self::Cancelled
            ),
            Self::InputRequired => {
                matches!(next, Self::Working | Self::Completed | Self::Failed | Self::Cancelled)
            }
            Self::Completed | Self::Failed | Self::Cancelled => false,
        }
    }
}

/// Task augmentation request, carried in the `task` member of a request's
/// params for taskable methods.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRequest {
    /// Requested retention after the task reaches a terminal state, seconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ttl: Option<u64>,
}

/// A task as reported by `tasks/get`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    /// Unique task identifier
    pub task_id: String,

    /// Current status
    pub status: TaskStatus,

    /// Human-readable status message
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_message: Option<String>,

    /// Creation timestamp, RFC 3339
    pub created_at: String,

    /// Retention after terminal state, seconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ttl: Option<u64>,

    /// Suggested polling interval, milliseconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub poll_interval: Option<u64>,
}

/// The task envelope returned in place of an inline result when a handler
/// accepts task augmentation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateTaskResult {
    /// The created task
    pub task: Task,
}

/// `tasks/get` request params
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetTaskParams {
    /// Task identifier
    pub task_id: String,
}

/// `tasks/result` request params
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskResultParams {
    /// Task identifier
    pub task_id: String,
}

/// `tasks/cancel` request params
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelTaskParams {
    /// Task identifier
    pub task_id: String,

    /// Optional cancellation reason
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// `tasks/list` request params
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListTasksParams {
    /// Pagination cursor from a previous response
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cursor: Option<Cursor>,
}

/// `tasks/list` result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListTasksResult {
    /// Tasks visible to the caller's session
    pub tasks: Vec<Task>,

    /// Cursor for the next page, when more tasks remain
    #[serde(rename = "nextCursor", skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<Cursor>,
}

/// `notifications/tasks/status` params
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskStatusNotificationParams {
    /// Task identifier
    pub task_id: String,

    /// New status
    pub status: TaskStatus,

    /// Human-readable status message
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_message: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_dag() {
        use TaskStatus::*;
        assert!(Working.can_transition_to(InputRequired));
        assert!(InputRequired.can_transition_to(Working));
        assert!(Working.can_transition_to(Completed));
        assert!(Working.can_transition_to(Failed));
        assert!(Working.can_transition_to(Cancelled));
        assert!(!Completed.can_transition_to(Working));
        assert!(!Failed.can_transition_to(Cancelled));
        assert!(!Cancelled.can_transition_to(Working));
        assert!(!Working.can_transition_to(Working));
    }

    #[test]
    fn terminal_states() {
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(TaskStatus::Cancelled.is_terminal());
        assert!(!TaskStatus::Working.is_terminal());
        assert!(!TaskStatus::InputRequired.is_terminal());
    }

    #[test]
    fn status_wire_names() {
        assert_eq!(
            serde_json::to_string(&TaskStatus::InputRequired).unwrap(),
            "\"input_required\""
        );
    }
}
