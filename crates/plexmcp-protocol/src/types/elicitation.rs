//! Elicitation types for server-initiated `elicitation/create` requests.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::tasks::TaskRequest;

/// `elicitation/create` request params
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ElicitParams {
    /// Message shown to the user
    pub message: String,

    /// Flat JSON schema describing the requested fields
    pub requested_schema: Value,

    /// Request task augmentation instead of an inline result
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task: Option<TaskRequest>,
}

/// The user's disposition toward an elicitation request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ElicitAction {
    /// The user submitted the form
    Accept,
    /// The user explicitly declined
    Decline,
    /// The user dismissed without choosing
    Cancel,
}

/// `elicitation/create` result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ElicitResult {
    /// The user's action
    pub action: ElicitAction,

    /// Submitted field values, present when accepted
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<Map<String, Value>>,
}
