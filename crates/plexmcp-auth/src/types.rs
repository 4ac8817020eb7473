//! OAuth wire types: client registration, tokens, and metadata documents.

use serde::{Deserialize, Serialize};

/// Client metadata submitted at dynamic registration (RFC 7591)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OAuthClientMetadata {
    /// Allowed redirect URIs
    pub redirect_uris: Vec<String>,

    /// Token endpoint authentication method
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_endpoint_auth_method: Option<String>,

    /// Grant types the client will use
    #[serde(skip_serializing_if = "Option::is_none")]
    pub grant_types: Option<Vec<String>>,

    /// Response types the client will use
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_types: Option<Vec<String>>,

    /// Human-readable client name
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_name: Option<String>,

    /// Space-separated requested scopes
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
}

/// Full client record: issued identifiers plus the registered metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OAuthClientInformation {
    /// Issued client identifier
    pub client_id: String,

    /// Issued client secret; absent for public clients
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,

    /// Unix time the id was issued
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id_issued_at: Option<u64>,

    /// Unix time the secret expires; 0 means never
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_secret_expires_at: Option<u64>,

    /// Registered metadata
    #[serde(flatten)]
    pub metadata: OAuthClientMetadata,
}

/// Token endpoint success response (RFC 6749 §5.1)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OAuthTokens {
    /// The access token
    pub access_token: String,

    /// Always `Bearer` here
    pub token_type: String,

    /// Lifetime in seconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_in: Option<u64>,

    /// Refresh token, when the grant yields one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,

    /// Space-separated granted scopes
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
}

/// Verified access-token details attached to authenticated requests
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenInfo {
    /// The raw token
    pub token: String,
    /// Client the token was issued to
    pub client_id: String,
    /// Granted scopes
    pub scopes: Vec<String>,
    /// Unix expiry, seconds
    pub expires_at: Option<u64>,
    /// Audience the token is bound to (RFC 8707)
    pub resource: Option<String>,
}

impl TokenInfo {
    /// Whether every required scope was granted
    pub fn has_scopes(&self, required: &[String]) -> bool {
        required.iter().all(|s| self.scopes.contains(s))
    }
}

impl From<TokenInfo> for plexmcp_protocol::transport::AuthInfo {
    fn from(info: TokenInfo) -> Self {
        Self {
            token: info.token,
            client_id: Some(info.client_id),
            scopes: info.scopes,
            expires_at: info.expires_at,
        }
    }
}

/// `/.well-known/oauth-authorization-server` document (RFC 8414)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthorizationServerMetadata {
    /// Issuer URL
    pub issuer: String,
    /// Authorization endpoint
    pub authorization_endpoint: String,
    /// Token endpoint
    pub token_endpoint: String,
    /// Dynamic registration endpoint
    #[serde(skip_serializing_if = "Option::is_none")]
    pub registration_endpoint: Option<String>,
    /// Revocation endpoint
    #[serde(skip_serializing_if = "Option::is_none")]
    pub revocation_endpoint: Option<String>,
    /// Supported response types
    pub response_types_supported: Vec<String>,
    /// Supported grant types
    #[serde(skip_serializing_if = "Option::is_none")]
    pub grant_types_supported: Option<Vec<String>>,
    /// Supported PKCE methods
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code_challenge_methods_supported: Option<Vec<String>>,
    /// Supported scopes
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scopes_supported: Option<Vec<String>>,
}

/// `/.well-known/oauth-protected-resource` document (RFC 9728)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtectedResourceMetadata {
    /// The resource identifier
    pub resource: String,
    /// Authorization servers that issue tokens for this resource
    pub authorization_servers: Vec<String>,
    /// Scopes the resource understands
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scopes_supported: Option<Vec<String>>,
    /// Human-readable resource name
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource_name: Option<String>,
}

/// Parse a space-separated scope string
pub fn parse_scopes(scope: Option<&str>) -> Vec<String> {
    scope
        .unwrap_or("")
        .split_ascii_whitespace()
        .map(String::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scope_parsing() {
        assert_eq!(parse_scopes(Some("mcp read  write")), vec!["mcp", "read", "write"]);
        assert!(parse_scopes(None).is_empty());
    }

    #[test]
    fn scope_subset_check() {
        let info = TokenInfo {
            token: "t".into(),
            client_id: "c".into(),
            scopes: vec!["mcp".into(), "read".into()],
            expires_at: None,
            resource: None,
        };
        assert!(info.has_scopes(&["mcp".into()]));
        assert!(!info.has_scopes(&["mcp".into(), "admin".into()]));
    }

    #[test]
    fn client_information_flattens_metadata() {
        let info = OAuthClientInformation {
            client_id: "cid".into(),
            client_secret: None,
            client_id_issued_at: Some(1),
            client_secret_expires_at: None,
            metadata: OAuthClientMetadata {
                redirect_uris: vec!["http://localhost/cb".into()],
                token_endpoint_auth_method: Some("none".into()),
                grant_types: None,
                response_types: None,
                client_name: Some("demo".into()),
                scope: None,
            },
        };
        let wire = serde_json::to_value(&info).unwrap();
        assert_eq!(wire["client_id"], "cid");
        assert_eq!(wire["redirect_uris"][0], "http://localhost/cb");
    }
}
