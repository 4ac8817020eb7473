//! OAuth client flows: discovery, PKCE, authorization-code and
//! client-credentials exchanges.
//!
//! Client authentication on the token request is pluggable through
//! [`ClientAuthMethod`], so deployments using `private_key_jwt` can set
//! `client_assertion`/`client_assertion_type` on the form without the core
//! knowing how the assertion is minted.

use url::Url;

use crate::error::{AuthError, AuthResult};
use crate::pkce::PkceChallenge;
use crate::types::{
    AuthorizationServerMetadata, OAuthClientInformation, OAuthTokens, ProtectedResourceMetadata,
};

/// Mutates the token-request form to authenticate the client.
pub trait ClientAuthMethod: Send + Sync {
    /// Add authentication members to the form
    fn apply(&self, form: &mut Vec<(String, String)>);
}

/// `client_secret_post`: secret in the body
pub struct ClientSecretPost {
    /// The client secret
    pub client_secret: String,
}

impl ClientAuthMethod for ClientSecretPost {
    fn apply(&self, form: &mut Vec<(String, String)>) {
        form.push(("client_secret".to_string(), self.client_secret.clone()));
    }
}

/// `private_key_jwt`-style assertion (RFC 7523); the caller supplies the
/// signed assertion.
pub struct ClientAssertion {
    /// The signed JWT assertion
    pub assertion: String,
}

impl ClientAuthMethod for ClientAssertion {
    fn apply(&self, form: &mut Vec<(String, String)>) {
        form.push((
            "client_assertion_type".to_string(),
            "urn:ietf:params:oauth:client-assertion-type:jwt-bearer".to_string(),
        ));
        form.push(("client_assertion".to_string(), self.assertion.clone()));
    }
}

/// OAuth client over `reqwest`.
pub struct OAuthClient {
    http: reqwest::Client,
}

impl Default for OAuthClient {
    fn default() -> Self {
        Self::new()
    }
}

impl OAuthClient {
    /// Create a client
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::new(),
        }
    }

    /// Fetch authorization-server metadata (RFC 8414)
    pub async fn discover(&self, issuer: &str) -> AuthResult<AuthorizationServerMetadata> {
        let url = well_known(issuer, "oauth-authorization-server")?;
        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| AuthError::ServerError(e.to_string()))?;
        if !response.status().is_success() {
            return Err(AuthError::ServerError(format!(
                "metadata fetch failed: HTTP {}",
                response.status()
            )));
        }
        response
            .json()
            .await
            .map_err(|e| AuthError::ServerError(e.to_string()))
    }

    /// Fetch protected-resource metadata (RFC 9728)
    pub async fn discover_protected_resource(
        &self,
        resource_url: &str,
    ) -> AuthResult<ProtectedResourceMetadata> {
        let url = well_known(resource_url, "oauth-protected-resource")?;
        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| AuthError::ServerError(e.to_string()))?;
        if !response.status().is_success() {
            return Err(AuthError::ServerError(format!(
                "resource metadata fetch failed: HTTP {}",
                response.status()
            )));
        }
        response
            .json()
            .await
            .map_err(|e| AuthError::ServerError(e.to_string()))
    }

    /// Exchange an authorization code for tokens
    pub async fn exchange_authorization_code(
        &self,
        metadata: &AuthorizationServerMetadata,
        client: &OAuthClientInformation,
        code: &str,
        code_verifier: &str,
        redirect_uri: &str,
        resource: Option<&str>,
        auth: Option<&dyn ClientAuthMethod>,
    ) -> AuthResult<OAuthTokens> {
        let mut form = vec![
            ("grant_type".to_string(), "authorization_code".to_string()),
            ("client_id".to_string(), client.client_id.clone()),
            ("code".to_string(), code.to_string()),
            ("code_verifier".to_string(), code_verifier.to_string()),
            ("redirect_uri".to_string(), redirect_uri.to_string()),
        ];
        push_resource(&mut form, resource);
        self.token_request(&metadata.token_endpoint, form, client, auth)
            .await
    }

    /// Refresh an access token
    pub async fn refresh(
        &self,
        metadata: &AuthorizationServerMetadata,
        client: &OAuthClientInformation,
        refresh_token: &str,
        resource: Option<&str>,
        auth: Option<&dyn ClientAuthMethod>,
    ) -> AuthResult<OAuthTokens> {
        let mut form = vec![
            ("grant_type".to_string(), "refresh_token".to_string()),
            ("client_id".to_string(), client.client_id.clone()),
            ("refresh_token".to_string(), refresh_token.to_string()),
        ];
        push_resource(&mut form, resource);
        self.token_request(&metadata.token_endpoint, form, client, auth)
            .await
    }

    /// Client-credentials grant
    pub async fn client_credentials(
        &self,
        metadata: &AuthorizationServerMetadata,
        client: &OAuthClientInformation,
        scopes: &[String],
        resource: Option<&str>,
        auth: Option<&dyn ClientAuthMethod>,
    ) -> AuthResult<OAuthTokens> {
        let mut form = vec![
            ("grant_type".to_string(), "client_credentials".to_string()),
            ("client_id".to_string(), client.client_id.clone()),
        ];
        if !scopes.is_empty() {
            form.push(("scope".to_string(), scopes.join(" ")));
        }
        push_resource(&mut form, resource);
        self.token_request(&metadata.token_endpoint, form, client, auth)
            .await
    }

    async fn token_request(
        &self,
        token_endpoint: &str,
        mut form: Vec<(String, String)>,
        client: &OAuthClientInformation,
        auth: Option<&dyn ClientAuthMethod>,
    ) -> AuthResult<OAuthTokens> {
        match auth {
            Some(auth) => auth.apply(&mut form),
            // Default to client_secret_post for confidential clients.
            None => {
                if let Some(secret) = &client.client_secret {
                    form.push(("client_secret".to_string(), secret.clone()));
                }
            }
        }
        let response = self
            .http
            .post(token_endpoint)
            .form(&form)
            .send()
            .await
            .map_err(|e| AuthError::ServerError(e.to_string()))?;
        let status = response.status();
        if status.is_success() {
            return response
                .json()
                .await
                .map_err(|e| AuthError::ServerError(e.to_string()));
        }
        let body: crate::error::OAuthErrorBody = response
            .json()
            .await
            .unwrap_or_else(|_| crate::error::OAuthErrorBody {
                error: "server_error".to_string(),
                error_description: Some(format!("HTTP {status}")),
            });
        Err(oauth_error_from_body(body))
    }
}

/// Build the authorization URL for the code + PKCE flow.
pub fn build_authorization_url(
    metadata: &AuthorizationServerMetadata,
    client_id: &str,
    redirect_uri: &str,
    pkce: &PkceChallenge,
    scopes: &[String],
    resource: Option<&str>,
    state: Option<&str>,
) -> AuthResult<String> {
    let mut url = Url::parse(&metadata.authorization_endpoint)
        .map_err(|e| AuthError::InvalidRequest(format!("invalid authorization endpoint: {e}")))?;
    {
        let mut query = url.query_pairs_mut();
        query
            .append_pair("response_type", "code")
            .append_pair("client_id", client_id)
            .append_pair("redirect_uri", redirect_uri)
            .append_pair("code_challenge", &pkce.challenge)
            .append_pair("code_challenge_method", "S256");
        if !scopes.is_empty() {
            query.append_pair("scope", &scopes.join(" "));
        }
        if let Some(resource) = resource {
            query.append_pair("resource", resource);
        }
        if let Some(state) = state {
            query.append_pair("state", state);
        }
    }
    Ok(url.to_string())
}

fn push_resource(form: &mut Vec<(String, String)>, resource: Option<&str>) {
    if let Some(resource) = resource {
        form.push(("resource".to_string(), resource.to_string()));
    }
}

fn well_known(base: &str, suffix: &str) -> AuthResult<Url> {
    let base = Url::parse(base).map_err(|e| AuthError::InvalidRequest(e.to_string()))?;
    let path = format!(
        "/.well-known/{suffix}{}",
        match base.path() {
            "/" | "" => String::new(),
            path => path.to_string(),
        }
    );
    let mut url = base;
    url.set_path(&path);
    url.set_query(None);
    Ok(url)
}

fn oauth_error_from_body(body: crate::error::OAuthErrorBody) -> AuthError {
    let description = body.error_description.unwrap_or_default();
    match body.error.as_str() {
        "invalid_client" => AuthError::InvalidClient(description),
        "invalid_grant" => AuthError::InvalidGrant(description),
        "unauthorized_client" => AuthError::UnauthorizedClient(description),
        "unsupported_grant_type" => AuthError::UnsupportedGrantType(description),
        "invalid_scope" => AuthError::InvalidScope(description),
        "invalid_target" => AuthError::InvalidTarget(description),
        "too_many_requests" => AuthError::TooManyRequests(description),
        "server_error" => AuthError::ServerError(description),
        _ => AuthError::InvalidRequest(description),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pkce;

    fn metadata() -> AuthorizationServerMetadata {
        AuthorizationServerMetadata {
            issuer: "http://localhost:9000".into(),
            authorization_endpoint: "http://localhost:9000/authorize".into(),
            token_endpoint: "http://localhost:9000/token".into(),
            registration_endpoint: None,
            revocation_endpoint: None,
            response_types_supported: vec!["code".into()],
            grant_types_supported: None,
            code_challenge_methods_supported: Some(vec!["S256".into()]),
            scopes_supported: None,
        }
    }

    #[test]
    fn authorization_url_carries_pkce_and_resource() {
        let pair = pkce::generate();
        let url = build_authorization_url(
            &metadata(),
            "cid",
            "http://localhost:7777/callback",
            &pair,
            &["mcp".into()],
            Some("https://mcp.example"),
            Some("xyz"),
        )
        .unwrap();
        let url = Url::parse(&url).unwrap();
        let pairs: std::collections::HashMap<_, _> = url.query_pairs().into_owned().collect();
        assert_eq!(pairs["response_type"], "code");
        assert_eq!(pairs["code_challenge"], pair.challenge);
        assert_eq!(pairs["code_challenge_method"], "S256");
        assert_eq!(pairs["resource"], "https://mcp.example");
        assert_eq!(pairs["state"], "xyz");
    }

    #[test]
    fn client_assertion_sets_both_members() {
        let mut form = vec![("grant_type".to_string(), "client_credentials".to_string())];
        ClientAssertion {
            assertion: "header.payload.sig".into(),
        }
        .apply(&mut form);
        assert!(form
            .iter()
            .any(|(k, v)| k == "client_assertion" && v == "header.payload.sig"));
        assert!(form.iter().any(|(k, v)| k == "client_assertion_type"
            && v == "urn:ietf:params:oauth:client-assertion-type:jwt-bearer"));
    }

    #[test]
    fn well_known_paths() {
        assert_eq!(
            well_known("http://localhost:9000", "oauth-authorization-server")
                .unwrap()
                .as_str(),
            "http://localhost:9000/.well-known/oauth-authorization-server"
        );
        assert_eq!(
            well_known("http://localhost:9000/tenant", "oauth-authorization-server")
                .unwrap()
                .as_str(),
            "http://localhost:9000/.well-known/oauth-authorization-server/tenant"
        );
    }

    #[test]
    fn error_body_mapping() {
        let err = oauth_error_from_body(crate::error::OAuthErrorBody {
            error: "invalid_grant".into(),
            error_description: Some("code expired".into()),
        });
        assert!(matches!(err, AuthError::InvalidGrant(_)));
    }
}
