//! OAuth error taxonomy.
//!
//! OAuth failures surface as standard `{error, error_description}` JSON
//! bodies (RFC 6749 §5.2), never as JSON-RPC frames.

use axum::http::StatusCode;
use serde::{Deserialize, Serialize};

/// Result alias for OAuth operations
pub type AuthResult<T> = Result<T, AuthError>;

/// OAuth protocol errors, mapped to RFC 6749/6750 error codes.
#[derive(Debug, Clone, thiserror::Error)]
#[non_exhaustive]
pub enum AuthError {
    /// Malformed or incomplete request
    #[error("invalid_request: {0}")]
    InvalidRequest(String),

    /// Unknown client or failed client authentication
    #[error("invalid_client: {0}")]
    InvalidClient(String),

    /// Invalid, expired, or revoked grant (code or refresh token)
    #[error("invalid_grant: {0}")]
    InvalidGrant(String),

    /// The client may not use this grant type
    #[error("unauthorized_client: {0}")]
    UnauthorizedClient(String),

    /// Unsupported grant type
    #[error("unsupported_grant_type: {0}")]
    UnsupportedGrantType(String),

    /// Requested scope is invalid or exceeds the grant
    #[error("invalid_scope: {0}")]
    InvalidScope(String),

    /// Bearer token is missing, expired, or malformed (RFC 6750)
    #[error("invalid_token: {0}")]
    InvalidToken(String),

    /// Bearer token lacks a required scope (RFC 6750)
    #[error("insufficient_scope: {0}")]
    InsufficientScope(String),

    /// Resource indicator mismatch (RFC 8707)
    #[error("invalid_target: {0}")]
    InvalidTarget(String),

    /// Rate limit exceeded
    #[error("too_many_requests: {0}")]
    TooManyRequests(String),

    /// Internal failure
    #[error("server_error: {0}")]
    ServerError(String),
}

/// Wire shape of an OAuth error response body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OAuthErrorBody {
    /// RFC 6749 error code
    pub error: String,
    /// Human-readable detail
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_description: Option<String>,
}

impl AuthError {
    /// The RFC error code string
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::InvalidRequest(_) => "invalid_request",
            Self::InvalidClient(_) => "invalid_client",
            Self::InvalidGrant(_) => "invalid_grant",
            Self::UnauthorizedClient(_) => "unauthorized_client",
            Self::UnsupportedGrantType(_) => "unsupported_grant_type",
            Self::InvalidScope(_) => "invalid_scope",
            Self::InvalidToken(_) => "invalid_token",
            Self::InsufficientScope(_) => "insufficient_scope",
            Self::InvalidTarget(_) => "invalid_target",
            Self::TooManyRequests(_) => "too_many_requests",
            Self::ServerError(_) => "server_error",
        }
    }

    /// HTTP status for the error response
    pub fn status(&self) -> StatusCode {
        match self {
            Self::InvalidClient(_) | Self::InvalidToken(_) => StatusCode::UNAUTHORIZED,
            Self::InsufficientScope(_) => StatusCode::FORBIDDEN,
            Self::TooManyRequests(_) => StatusCode::TOO_MANY_REQUESTS,
            Self::ServerError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::BAD_REQUEST,
        }
    }

    /// The description half of the error body
    pub fn description(&self) -> String {
        match self {
            Self::InvalidRequest(d)
            | Self::InvalidClient(d)
            | Self::InvalidGrant(d)
            | Self::UnauthorizedClient(d)
            | Self::UnsupportedGrantType(d)
            | Self::InvalidScope(d)
            | Self::InvalidToken(d)
            | Self::InsufficientScope(d)
            | Self::InvalidTarget(d)
            | Self::TooManyRequests(d)
            | Self::ServerError(d) => d.clone(),
        }
    }

    /// Build the wire body
    pub fn body(&self) -> OAuthErrorBody {
        OAuthErrorBody {
            error: self.error_code().to_string(),
            error_description: Some(self.description()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_and_statuses() {
        assert_eq!(AuthError::InvalidGrant("x".into()).error_code(), "invalid_grant");
        assert_eq!(
            AuthError::InvalidGrant("x".into()).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            AuthError::InvalidToken("x".into()).status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            AuthError::TooManyRequests("x".into()).status(),
            StatusCode::TOO_MANY_REQUESTS
        );
    }

    #[test]
    fn body_shape() {
        let body = AuthError::InvalidScope("unknown scope".into()).body();
        let wire = serde_json::to_value(&body).unwrap();
        assert_eq!(wire["error"], "invalid_scope");
        assert_eq!(wire["error_description"], "unknown scope");
    }
}
