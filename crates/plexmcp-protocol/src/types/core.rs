//! Core protocol types shared across features.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::jsonrpc::RequestId;

/// Opaque pagination cursor
pub type Cursor = String;

/// Progress token carried in `_meta.progressToken`: echoed back in
/// `notifications/progress` to correlate them with a request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ProgressToken {
    /// Numeric token (the engine uses the outbound request id)
    Number(i64),
    /// String token
    String(String),
}

impl From<&RequestId> for ProgressToken {
    fn from(id: &RequestId) -> Self {
        match id {
            RequestId::Number(n) => Self::Number(*n),
            RequestId::String(s) => Self::String(s.clone()),
        }
    }
}

impl ProgressToken {
    /// Whether this token echoes the given request id
    pub fn matches(&self, id: &RequestId) -> bool {
        match (self, id) {
            (Self::Number(a), RequestId::Number(b)) => a == b,
            (Self::String(a), RequestId::String(b)) => a == b,
            _ => false,
        }
    }
}

/// Request metadata (`_meta` member of params)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RequestMeta {
    /// Token to correlate progress notifications with this request
    #[serde(rename = "progressToken", skip_serializing_if = "Option::is_none")]
    pub progress_token: Option<ProgressToken>,

    /// Additional metadata members
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl RequestMeta {
    /// Pull `_meta` out of a params value, if present and well-formed
    pub fn from_params(params: Option<&Value>) -> Option<Self> {
        let meta = params?.get("_meta")?;
        serde_json::from_value(meta.clone()).ok()
    }
}

/// Base metadata: `name` is the programmatic identifier, `title` the
/// human-readable display name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BaseMetadata {
    /// Programmatic identifier
    pub name: String,

    /// Display name; falls back to `name` when absent
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

/// Implementation information declared at `initialize`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Implementation {
    /// Implementation name
    pub name: String,

    /// Display title
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,

    /// Implementation version
    pub version: String,
}

impl Implementation {
    /// Create implementation info with name and version
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            title: None,
            version: version.into(),
        }
    }
}

/// An icon reference attached to a primitive
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Icon {
    /// Icon source URI
    pub src: String,

    /// MIME type of the icon
    #[serde(rename = "mimeType", skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,

    /// Icon sizes descriptor (e.g. `"48x48"`)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sizes: Option<String>,
}

/// Message role in sampling exchanges
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Content produced on behalf of the user
    User,
    /// Content produced by the model
    Assistant,
}

/// An empty result (`{}` on the wire)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmptyResult {}
