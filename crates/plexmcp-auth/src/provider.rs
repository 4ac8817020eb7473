//! Authorization-server provider seam and the in-memory reference
//! implementation.
//!
//! Handlers stay thin: grant validation, PKCE verification, resource
//! binding, and token issuance all live behind [`OAuthServerProvider`], so
//! a production deployment can swap in a database-backed provider without
//! touching the HTTP surface.

use std::collections::HashMap;
use std::sync::Mutex as StdMutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use rand::distr::Alphanumeric;
use rand::Rng;
use subtle::ConstantTimeEq;
use uuid::Uuid;

use crate::error::{AuthError, AuthResult};
use crate::pkce;
use crate::types::{parse_scopes, OAuthClientInformation, OAuthClientMetadata, OAuthTokens, TokenInfo};

/// Authorization request details carried into [`OAuthServerProvider::authorize`]
#[derive(Debug, Clone)]
pub struct AuthorizationParams {
    /// Redirect URI the code will be delivered to
    pub redirect_uri: String,
    /// PKCE S256 challenge
    pub code_challenge: String,
    /// Requested scopes
    pub scopes: Vec<String>,
    /// Resource indicator (RFC 8707)
    pub resource: Option<String>,
    /// Opaque client state echoed on the redirect
    pub state: Option<String>,
}

/// How strictly the `resource` indicator is checked
#[derive(Debug, Clone, Default)]
pub enum ResourcePolicy {
    /// Accept any (or no) resource indicator
    #[default]
    Lenient,
    /// The indicator must equal the expected resource exactly
    Strict(String),
}

impl ResourcePolicy {
    fn check(&self, resource: Option<&str>) -> AuthResult<()> {
        match self {
            Self::Lenient => Ok(()),
            Self::Strict(expected) => match resource {
                Some(resource) if resource == expected => Ok(()),
                Some(resource) => Err(AuthError::InvalidTarget(format!(
                    "resource {resource} does not match {expected}"
                ))),
                None => Err(AuthError::InvalidTarget(format!(
                    "resource parameter required: {expected}"
                ))),
            },
        }
    }
}

/// Server-side OAuth behavior consumed by the HTTP handlers.
#[async_trait]
pub trait OAuthServerProvider: Send + Sync {
    /// Look up a registered client
    async fn get_client(&self, client_id: &str) -> AuthResult<Option<OAuthClientInformation>>;

    /// Dynamic client registration (RFC 7591)
    async fn register_client(
        &self,
        metadata: OAuthClientMetadata,
    ) -> AuthResult<OAuthClientInformation>;

    /// Issue an authorization code for a validated request
    async fn authorize(
        &self,
        client: &OAuthClientInformation,
        params: &AuthorizationParams,
    ) -> AuthResult<String>;

    /// Exchange an authorization code (PKCE verified here)
    async fn exchange_authorization_code(
        &self,
        client: &OAuthClientInformation,
        code: &str,
        code_verifier: Option<&str>,
        redirect_uri: Option<&str>,
        resource: Option<&str>,
    ) -> AuthResult<OAuthTokens>;

    /// Exchange a refresh token
    async fn exchange_refresh_token(
        &self,
        client: &OAuthClientInformation,
        refresh_token: &str,
        scopes: &[String],
        resource: Option<&str>,
    ) -> AuthResult<OAuthTokens>;

    /// Client-credentials grant
    async fn exchange_client_credentials(
        &self,
        client: &OAuthClientInformation,
        scopes: &[String],
        resource: Option<&str>,
    ) -> AuthResult<OAuthTokens>;

    /// Validate a bearer token
    async fn verify_access_token(&self, token: &str) -> AuthResult<TokenInfo>;

    /// Revoke an access or refresh token (RFC 7009)
    async fn revoke_token(&self, client: &OAuthClientInformation, token: &str) -> AuthResult<()>;
}

fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn random_token(len: usize) -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

fn secrets_match(a: &str, b: &str) -> bool {
    a.len() == b.len() && bool::from(a.as_bytes().ct_eq(b.as_bytes()))
}

#[derive(Debug, Clone)]
struct AuthCode {
    client_id: String,
    code_challenge: String,
    redirect_uri: String,
    scopes: Vec<String>,
    resource: Option<String>,
    expires_at: u64,
}

#[derive(Debug, Default)]
struct ProviderState {
    clients: HashMap<String, OAuthClientInformation>,
    codes: HashMap<String, AuthCode>,
    access_tokens: HashMap<String, TokenInfo>,
    refresh_tokens: HashMap<String, TokenInfo>,
}

/// In-memory provider: a process-scoped OAuth database with explicit
/// construction and teardown, suitable for tests and single-node servers.
pub struct InMemoryOAuthProvider {
    state: StdMutex<ProviderState>,
    resource_policy: ResourcePolicy,
    token_ttl: Duration,
    code_ttl: Duration,
}

impl Default for InMemoryOAuthProvider {
    fn default() -> Self {
        Self::new(ResourcePolicy::Lenient)
    }
}

impl InMemoryOAuthProvider {
    /// Create a provider with the given resource policy
    pub fn new(resource_policy: ResourcePolicy) -> Self {
        Self {
            state: StdMutex::new(ProviderState::default()),
            resource_policy,
            token_ttl: Duration::from_secs(3600),
            code_ttl: Duration::from_secs(300),
        }
    }

    /// Pre-register a client (outside dynamic registration)
    pub fn add_client(&self, client: OAuthClientInformation) {
        self.state
            .lock()
            .expect("provider lock poisoned")
            .clients
            .insert(client.client_id.clone(), client);
    }

    /// Authenticate a confidential client's secret in constant time
    pub fn authenticate(
        &self,
        client: &OAuthClientInformation,
        presented_secret: Option<&str>,
    ) -> AuthResult<()> {
        match (&client.client_secret, presented_secret) {
            (None, _) => Ok(()),
            (Some(expected), Some(presented)) if secrets_match(expected, presented) => Ok(()),
            (Some(_), _) => Err(AuthError::InvalidClient(
                "client authentication failed".into(),
            )),
        }
    }

    fn issue_tokens(
        &self,
        client_id: &str,
        scopes: Vec<String>,
        resource: Option<String>,
        with_refresh: bool,
    ) -> OAuthTokens {
        let mut state = self.state.lock().expect("provider lock poisoned");
        let access_token = format!("at-{}", random_token(48));
        let expires_at = now_unix() + self.token_ttl.as_secs();
        let info = TokenInfo {
            token: access_token.clone(),
            client_id: client_id.to_string(),
            scopes: scopes.clone(),
            expires_at: Some(expires_at),
            resource: resource.clone(),
        };
        state.access_tokens.insert(access_token.clone(), info.clone());

        let refresh_token = with_refresh.then(|| {
            let refresh = format!("rt-{}", random_token(48));
            state.refresh_tokens.insert(
                refresh.clone(),
                TokenInfo {
                    token: refresh.clone(),
                    ..info
                },
            );
            refresh
        });

        OAuthTokens {
            access_token,
            token_type: "Bearer".to_string(),
            expires_in: Some(self.token_ttl.as_secs()),
            refresh_token,
            scope: (!scopes.is_empty()).then(|| scopes.join(" ")),
        }
    }
}

#[async_trait]
impl OAuthServerProvider for InMemoryOAuthProvider {
    async fn get_client(&self, client_id: &str) -> AuthResult<Option<OAuthClientInformation>> {
        Ok(self
            .state
            .lock()
            .expect("provider lock poisoned")
            .clients
            .get(client_id)
            .cloned())
    }

    async fn register_client(
        &self,
        metadata: OAuthClientMetadata,
    ) -> AuthResult<OAuthClientInformation> {
        if metadata.redirect_uris.is_empty() {
            return Err(AuthError::InvalidRequest(
                "redirect_uris must not be empty".into(),
            ));
        }
        let public = metadata.token_endpoint_auth_method.as_deref() == Some("none");
        let client = OAuthClientInformation {
            client_id: Uuid::new_v4().to_string(),
            client_secret: (!public).then(|| random_token(48)),
            client_id_issued_at: Some(now_unix()),
            client_secret_expires_at: (!public).then_some(0),
            metadata,
        };
        self.add_client(client.clone());
        Ok(client)
    }

    async fn authorize(
        &self,
        client: &OAuthClientInformation,
        params: &AuthorizationParams,
    ) -> AuthResult<String> {
        if !client
            .metadata
            .redirect_uris
            .iter()
            .any(|uri| uri == &params.redirect_uri)
        {
            return Err(AuthError::InvalidRequest(format!(
                "unregistered redirect_uri: {}",
                params.redirect_uri
            )));
        }
        if params.code_challenge.is_empty() {
            return Err(AuthError::InvalidRequest("code_challenge required".into()));
        }
        self.resource_policy.check(params.resource.as_deref())?;

        let code = format!("ac-{}", random_token(40));
        self.state
            .lock()
            .expect("provider lock poisoned")
            .codes
            .insert(
                code.clone(),
                AuthCode {
                    client_id: client.client_id.clone(),
                    code_challenge: params.code_challenge.clone(),
                    redirect_uri: params.redirect_uri.clone(),
                    scopes: params.scopes.clone(),
                    resource: params.resource.clone(),
                    expires_at: now_unix() + self.code_ttl.as_secs(),
                },
            );
        Ok(code)
    }

    async fn exchange_authorization_code(
        &self,
        client: &OAuthClientInformation,
        code: &str,
        code_verifier: Option<&str>,
        redirect_uri: Option<&str>,
        resource: Option<&str>,
    ) -> AuthResult<OAuthTokens> {
        let stored = {
            let mut state = self.state.lock().expect("provider lock poisoned");
            // Single use: the code is consumed whether or not the
            // exchange succeeds.
            state
                .codes
                .remove(code)
                .ok_or_else(|| AuthError::InvalidGrant("unknown authorization code".into()))?
        };
        if stored.client_id != client.client_id {
            return Err(AuthError::InvalidGrant(
                "code was issued to another client".into(),
            ));
        }
        if stored.expires_at < now_unix() {
            return Err(AuthError::InvalidGrant("authorization code expired".into()));
        }
        if let Some(redirect_uri) = redirect_uri {
            if redirect_uri != stored.redirect_uri {
                return Err(AuthError::InvalidGrant("redirect_uri mismatch".into()));
            }
        }
        let verifier = code_verifier
            .ok_or_else(|| AuthError::InvalidRequest("code_verifier required".into()))?;
        if !pkce::verify(verifier, &stored.code_challenge) {
            return Err(AuthError::InvalidGrant("PKCE verification failed".into()));
        }
        // The token exchange must target the same resource the code was
        // issued for.
        if resource.is_some() && resource != stored.resource.as_deref() {
            return Err(AuthError::InvalidTarget(
                "resource differs from the authorization request".into(),
            ));
        }
        self.resource_policy.check(resource.or(stored.resource.as_deref()))?;

        Ok(self.issue_tokens(&client.client_id, stored.scopes, stored.resource, true))
    }

    async fn exchange_refresh_token(
        &self,
        client: &OAuthClientInformation,
        refresh_token: &str,
        scopes: &[String],
        resource: Option<&str>,
    ) -> AuthResult<OAuthTokens> {
        let stored = {
            let state = self.state.lock().expect("provider lock poisoned");
            state
                .refresh_tokens
                .get(refresh_token)
                .cloned()
                .ok_or_else(|| AuthError::InvalidGrant("unknown refresh token".into()))?
        };
        if stored.client_id != client.client_id {
            return Err(AuthError::InvalidGrant(
                "refresh token was issued to another client".into(),
            ));
        }
        let scopes = if scopes.is_empty() {
            stored.scopes.clone()
        } else {
            // Narrowing only.
            if !scopes.iter().all(|s| stored.scopes.contains(s)) {
                return Err(AuthError::InvalidScope(
                    "requested scope exceeds the original grant".into(),
                ));
            }
            scopes.to_vec()
        };
        self.resource_policy.check(resource.or(stored.resource.as_deref()))?;
        Ok(self.issue_tokens(&client.client_id, scopes, stored.resource, false))
    }

    async fn exchange_client_credentials(
        &self,
        client: &OAuthClientInformation,
        scopes: &[String],
        resource: Option<&str>,
    ) -> AuthResult<OAuthTokens> {
        if client.client_secret.is_none() {
            return Err(AuthError::UnauthorizedClient(
                "client_credentials requires a confidential client".into(),
            ));
        }
        self.resource_policy.check(resource)?;
        Ok(self.issue_tokens(
            &client.client_id,
            scopes.to_vec(),
            resource.map(String::from),
            false,
        ))
    }

    async fn verify_access_token(&self, token: &str) -> AuthResult<TokenInfo> {
        let info = self
            .state
            .lock()
            .expect("provider lock poisoned")
            .access_tokens
            .get(token)
            .cloned()
            .ok_or_else(|| AuthError::InvalidToken("unknown access token".into()))?;
        if info.expires_at.is_some_and(|at| at < now_unix()) {
            return Err(AuthError::InvalidToken("access token expired".into()));
        }
        Ok(info)
    }

    async fn revoke_token(
        &self,
        client: &OAuthClientInformation,
        token: &str,
    ) -> AuthResult<()> {
        let mut state = self.state.lock().expect("provider lock poisoned");
        // Revoking an unknown token succeeds per RFC 7009.
        if let Some(info) = state.access_tokens.get(token) {
            if info.client_id == client.client_id {
                state.access_tokens.remove(token);
            }
        }
        if let Some(info) = state.refresh_tokens.get(token) {
            if info.client_id == client.client_id {
                state.refresh_tokens.remove(token);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metadata() -> OAuthClientMetadata {
        OAuthClientMetadata {
            redirect_uris: vec!["http://localhost:7777/callback".into()],
            token_endpoint_auth_method: Some("none".into()),
            grant_types: None,
            response_types: None,
            client_name: Some("test".into()),
            scope: None,
        }
    }

    async fn registered(provider: &InMemoryOAuthProvider) -> OAuthClientInformation {
        provider.register_client(metadata()).await.unwrap()
    }

    #[tokio::test]
    async fn full_authorization_code_flow() {
        let provider = InMemoryOAuthProvider::default();
        let client = registered(&provider).await;
        let pair = pkce::generate();

        let code = provider
            .authorize(
                &client,
                &AuthorizationParams {
                    redirect_uri: "http://localhost:7777/callback".into(),
                    code_challenge: pair.challenge.clone(),
                    scopes: vec!["mcp".into()],
                    resource: None,
                    state: None,
                },
            )
            .await
            .unwrap();

        let tokens = provider
            .exchange_authorization_code(
                &client,
                &code,
                Some(&pair.verifier),
                Some("http://localhost:7777/callback"),
                None,
            )
            .await
            .unwrap();
        assert_eq!(tokens.token_type, "Bearer");
        assert_eq!(tokens.scope.as_deref(), Some("mcp"));

        let info = provider
            .verify_access_token(&tokens.access_token)
            .await
            .unwrap();
        assert_eq!(info.client_id, client.client_id);
        assert_eq!(info.scopes, vec!["mcp"]);
    }

    #[tokio::test]
    async fn wrong_verifier_rejected_and_code_consumed() {
        let provider = InMemoryOAuthProvider::default();
        let client = registered(&provider).await;
        let pair = pkce::generate();
        let code = provider
            .authorize(
                &client,
                &AuthorizationParams {
                    redirect_uri: "http://localhost:7777/callback".into(),
                    code_challenge: pair.challenge.clone(),
                    scopes: vec![],
                    resource: None,
                    state: None,
                },
            )
            .await
            .unwrap();

        let err = provider
            .exchange_authorization_code(&client, &code, Some("wrong"), None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::InvalidGrant(_)));

        // The code is single use, even after a failed exchange.
        let err = provider
            .exchange_authorization_code(&client, &code, Some(&pair.verifier), None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::InvalidGrant(_)));
    }

    #[tokio::test]
    async fn strict_resource_policy_enforced() {
        let provider =
            InMemoryOAuthProvider::new(ResourcePolicy::Strict("https://mcp.example".into()));
        let client = registered(&provider).await;
        let pair = pkce::generate();

        let err = provider
            .authorize(
                &client,
                &AuthorizationParams {
                    redirect_uri: "http://localhost:7777/callback".into(),
                    code_challenge: pair.challenge.clone(),
                    scopes: vec![],
                    resource: Some("https://other.example".into()),
                    state: None,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::InvalidTarget(_)));

        let code = provider
            .authorize(
                &client,
                &AuthorizationParams {
                    redirect_uri: "http://localhost:7777/callback".into(),
                    code_challenge: pair.challenge.clone(),
                    scopes: vec![],
                    resource: Some("https://mcp.example".into()),
                    state: None,
                },
            )
            .await
            .unwrap();
        let tokens = provider
            .exchange_authorization_code(
                &client,
                &code,
                Some(&pair.verifier),
                None,
                Some("https://mcp.example"),
            )
            .await
            .unwrap();
        let info = provider
            .verify_access_token(&tokens.access_token)
            .await
            .unwrap();
        assert_eq!(info.resource.as_deref(), Some("https://mcp.example"));
    }

    #[tokio::test]
    async fn refresh_narrows_scopes_only() {
        let provider = InMemoryOAuthProvider::default();
        let client = registered(&provider).await;
        let pair = pkce::generate();
        let code = provider
            .authorize(
                &client,
                &AuthorizationParams {
                    redirect_uri: "http://localhost:7777/callback".into(),
                    code_challenge: pair.challenge.clone(),
                    scopes: vec!["mcp".into(), "read".into()],
                    resource: None,
                    state: None,
                },
            )
            .await
            .unwrap();
        let tokens = provider
            .exchange_authorization_code(&client, &code, Some(&pair.verifier), None, None)
            .await
            .unwrap();
        let refresh = tokens.refresh_token.unwrap();

        let narrowed = provider
            .exchange_refresh_token(&client, &refresh, &["read".into()], None)
            .await
            .unwrap();
        assert_eq!(narrowed.scope.as_deref(), Some("read"));

        let err = provider
            .exchange_refresh_token(&client, &refresh, &["admin".into()], None)
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::InvalidScope(_)));
    }

    #[tokio::test]
    async fn revoked_token_fails_verification() {
        let provider = InMemoryOAuthProvider::default();
        let client = registered(&provider).await;
        let tokens = provider
            .exchange_client_credentials(
                &OAuthClientInformation {
                    client_secret: Some("secret".into()),
                    ..client.clone()
                },
                &["mcp".into()],
                None,
            )
            .await
            .unwrap();
        // Re-add the confidential variant so revocation sees it.
        provider.add_client(OAuthClientInformation {
            client_secret: Some("secret".into()),
            ..client.clone()
        });

        provider
            .revoke_token(
                &OAuthClientInformation {
                    client_secret: Some("secret".into()),
                    ..client
                },
                &tokens.access_token,
            )
            .await
            .unwrap();
        assert!(provider
            .verify_access_token(&tokens.access_token)
            .await
            .is_err());
    }

    #[test]
    fn secret_comparison_is_length_safe() {
        assert!(secrets_match("abc", "abc"));
        assert!(!secrets_match("abc", "abd"));
        assert!(!secrets_match("abc", "abcd"));
    }
}
