//! Filesystem roots exposed by clients.

use serde::{Deserialize, Serialize};

/// A root directory or file the client grants the server access to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Root {
    /// Root URI; must begin with `file://`
    pub uri: String,

    /// Display name
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// `roots/list` result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListRootsResult {
    /// The client's current roots
    pub roots: Vec<Root>,
}
