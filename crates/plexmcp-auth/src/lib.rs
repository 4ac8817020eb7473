//! # plexmcp-auth
//!
//! OAuth 2.1 for the plexmcp Streamable HTTP transport: authorization-server
//! handlers (authorize/token/register/revoke + RFC 8414/9728 metadata),
//! PKCE S256, resource indicators (RFC 8707), token-bucket rate limiting,
//! bearer middleware for protected endpoints, and the client-side flows.
//!
//! OAuth errors are standard `{error, error_description}` JSON bodies,
//! never JSON-RPC frames.

pub mod bearer;
pub mod client;
pub mod error;
pub mod pkce;
pub mod provider;
pub mod rate_limit;
pub mod server;
pub mod types;

pub use bearer::{require_bearer, BearerConfig, BearerState};
pub use client::{build_authorization_url, ClientAssertion, ClientAuthMethod, OAuthClient};
pub use error::{AuthError, AuthResult};
pub use pkce::PkceChallenge;
pub use provider::{
    AuthorizationParams, InMemoryOAuthProvider, OAuthServerProvider, ResourcePolicy,
};
pub use rate_limit::{RateLimitConfig, RateLimiter};
pub use server::{oauth_router, AuthServerConfig};
pub use types::{
    AuthorizationServerMetadata, OAuthClientInformation, OAuthClientMetadata, OAuthTokens,
    ProtectedResourceMetadata, TokenInfo,
};
