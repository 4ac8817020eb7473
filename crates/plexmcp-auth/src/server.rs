//! OAuth authorization-server HTTP surface.
//!
//! Pure handlers over an [`OAuthServerProvider`]: `/authorize`, `/token`,
//! `/register`, `/revoke`, and the two well-known metadata documents, with
//! CORS preflight, per-client rate limiting, and `Cache-Control: no-store`
//! on every token-bearing response.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Redirect, Response};
use axum::routing::{get, post};
use axum::{Form, Json, Router};
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use tracing::debug;
use url::Url;

use crate::error::AuthError;
use crate::provider::{AuthorizationParams, OAuthServerProvider};
use crate::rate_limit::{RateLimitConfig, RateLimiter};
use crate::types::{
    parse_scopes, AuthorizationServerMetadata, OAuthClientInformation, OAuthClientMetadata,
    ProtectedResourceMetadata,
};

/// Authorization-server configuration
#[derive(Debug, Clone)]
pub struct AuthServerConfig {
    /// Issuer URL; endpoint URLs in metadata derive from it
    pub issuer: String,
    /// Scopes advertised in metadata
    pub scopes_supported: Vec<String>,
    /// Token-endpoint rate limiting; `None` disables it
    pub rate_limit: Option<RateLimitConfig>,
    /// Protected-resource metadata served at the RFC 9728 endpoint
    pub protected_resource: Option<ProtectedResourceMetadata>,
}

impl AuthServerConfig {
    /// Configuration for an issuer with default rate limiting
    pub fn new(issuer: impl Into<String>) -> Self {
        Self {
            issuer: issuer.into(),
            scopes_supported: vec!["mcp".to_string()],
            rate_limit: Some(RateLimitConfig::default()),
            protected_resource: None,
        }
    }

    fn metadata(&self) -> AuthorizationServerMetadata {
        let base = self.issuer.trim_end_matches('/');
        AuthorizationServerMetadata {
            issuer: self.issuer.clone(),
            authorization_endpoint: format!("{base}/authorize"),
            token_endpoint: format!("{base}/token"),
            registration_endpoint: Some(format!("{base}/register")),
            revocation_endpoint: Some(format!("{base}/revoke")),
            response_types_supported: vec!["code".to_string()],
            grant_types_supported: Some(vec![
                "authorization_code".to_string(),
                "refresh_token".to_string(),
                "client_credentials".to_string(),
            ]),
            code_challenge_methods_supported: Some(vec!["S256".to_string()]),
            scopes_supported: Some(self.scopes_supported.clone()),
        }
    }
}

/// Shared state behind the OAuth routes
#[derive(Clone)]
pub struct AuthServerState {
    provider: Arc<dyn OAuthServerProvider>,
    config: Arc<AuthServerConfig>,
    limiter: Option<Arc<RateLimiter>>,
}

/// Build the OAuth router
pub fn oauth_router(provider: Arc<dyn OAuthServerProvider>, config: AuthServerConfig) -> Router {
    let state = AuthServerState {
        limiter: config.rate_limit.map(|c| Arc::new(RateLimiter::new(c))),
        provider,
        config: Arc::new(config),
    };
    Router::new()
        .route("/authorize", get(authorize).options(preflight))
        .route("/token", post(token).options(preflight))
        .route("/register", post(register).options(preflight))
        .route("/revoke", post(revoke).options(preflight))
        .route(
            "/.well-known/oauth-authorization-server",
            get(authorization_server_metadata).options(preflight),
        )
        .route(
            "/.well-known/oauth-protected-resource",
            get(protected_resource_metadata).options(preflight),
        )
        .with_state(state)
}

async fn preflight() -> Response {
    let mut response = StatusCode::NO_CONTENT.into_response();
    let headers = response.headers_mut();
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static("GET, POST, OPTIONS"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static("authorization, content-type, mcp-protocol-version"),
    );
    cors(response)
}

fn cors(mut response: Response) -> Response {
    response.headers_mut().insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static("*"),
    );
    response
}

fn no_store(mut response: Response) -> Response {
    let headers = response.headers_mut();
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
    headers.insert(header::PRAGMA, HeaderValue::from_static("no-cache"));
    response
}

fn error_response(err: &AuthError) -> Response {
    cors(no_store((err.status(), Json(err.body())).into_response()))
}

/// Pull `client_id`/`client_secret` from the body or a Basic header
fn client_credentials_from(
    headers: &HeaderMap,
    form: &HashMap<String, String>,
) -> (Option<String>, Option<String>) {
    if let Some(basic) = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Basic "))
        .and_then(|v| BASE64_STANDARD.decode(v).ok())
        .and_then(|bytes| String::from_utf8(bytes).ok())
    {
        if let Some((id, secret)) = basic.split_once(':') {
            return (Some(id.to_string()), Some(secret.to_string()));
        }
    }
    (
        form.get("client_id").cloned(),
        form.get("client_secret").cloned(),
    )
}

async fn lookup_client(
    state: &AuthServerState,
    client_id: Option<&str>,
) -> Result<OAuthClientInformation, AuthError> {
    let client_id =
        client_id.ok_or_else(|| AuthError::InvalidRequest("client_id required".into()))?;
    state
        .provider
        .get_client(client_id)
        .await?
        .ok_or_else(|| AuthError::InvalidClient(format!("unknown client: {client_id}")))
}

// ---------------------------------------------------------------------------
// /authorize
// ---------------------------------------------------------------------------

async fn authorize(
    State(state): State<AuthServerState>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let redirect_uri = params.get("redirect_uri").cloned();
    match authorize_inner(&state, &params).await {
        Ok(location) => cors(Redirect::to(&location).into_response()),
        Err(err) => {
            // When the redirect target is known-good, errors ride the
            // redirect; otherwise they come back as a direct JSON body.
            if let Some(redirect_uri) = redirect_uri {
                if let Ok(client) = lookup_client(&state, params.get("client_id").map(String::as_str)).await {
                    if client.metadata.redirect_uris.contains(&redirect_uri) {
                        if let Ok(mut url) = Url::parse(&redirect_uri) {
                            url.query_pairs_mut()
                                .append_pair("error", err.error_code())
                                .append_pair("error_description", &err.description());
                            if let Some(req_state) = params.get("state") {
                                url.query_pairs_mut().append_pair("state", req_state);
                            }
                            return cors(Redirect::to(url.as_str()).into_response());
                        }
                    }
                }
            }
            error_response(&err)
        }
    }
}

async fn authorize_inner(
    state: &AuthServerState,
    params: &HashMap<String, String>,
) -> Result<String, AuthError> {
    if params.get("response_type").map(String::as_str) != Some("code") {
        return Err(AuthError::InvalidRequest(
            "response_type must be 'code'".into(),
        ));
    }
    // PKCE S256 is mandatory.
    match params.get("code_challenge_method").map(String::as_str) {
        None | Some("S256") => {}
        Some(other) => {
            return Err(AuthError::InvalidRequest(format!(
                "unsupported code_challenge_method: {other}"
            )))
        }
    }
    let code_challenge = params
        .get("code_challenge")
        .cloned()
        .ok_or_else(|| AuthError::InvalidRequest("code_challenge required".into()))?;
    let redirect_uri = params
        .get("redirect_uri")
        .cloned()
        .ok_or_else(|| AuthError::InvalidRequest("redirect_uri required".into()))?;

    let client = lookup_client(state, params.get("client_id").map(String::as_str)).await?;
    let authorization = AuthorizationParams {
        redirect_uri: redirect_uri.clone(),
        code_challenge,
        scopes: parse_scopes(params.get("scope").map(String::as_str)),
        resource: params.get("resource").cloned(),
        state: params.get("state").cloned(),
    };
    let code = state.provider.authorize(&client, &authorization).await?;
    debug!(client_id = %client.client_id, "authorization code issued");

    let mut url = Url::parse(&redirect_uri)
        .map_err(|e| AuthError::InvalidRequest(format!("invalid redirect_uri: {e}")))?;
    url.query_pairs_mut().append_pair("code", &code);
    if let Some(req_state) = &authorization.state {
        url.query_pairs_mut().append_pair("state", req_state);
    }
    Ok(url.to_string())
}

// ---------------------------------------------------------------------------
// /token
// ---------------------------------------------------------------------------

async fn token(
    State(state): State<AuthServerState>,
    headers: HeaderMap,
    Form(form): Form<HashMap<String, String>>,
) -> Response {
    let (client_id, client_secret) = client_credentials_from(&headers, &form);

    if let Some(limiter) = &state.limiter {
        let key = client_id.clone().unwrap_or_else(|| "anonymous".to_string());
        if !limiter.try_acquire(&key) {
            return error_response(&AuthError::TooManyRequests(
                "token endpoint rate limit exceeded".into(),
            ));
        }
    }

    match token_inner(&state, client_id, client_secret, &form).await {
        Ok(tokens) => cors(no_store(Json(tokens).into_response())),
        Err(err) => error_response(&err),
    }
}

async fn token_inner(
    state: &AuthServerState,
    client_id: Option<String>,
    client_secret: Option<String>,
    form: &HashMap<String, String>,
) -> Result<crate::types::OAuthTokens, AuthError> {
    let client = lookup_client(state, client_id.as_deref()).await?;
    authenticate_client(&client, client_secret.as_deref())?;

    let grant_type = form
        .get("grant_type")
        .ok_or_else(|| AuthError::InvalidRequest("grant_type required".into()))?;
    let resource = form.get("resource").map(String::as_str);

    match grant_type.as_str() {
        "authorization_code" => {
            let code = form
                .get("code")
                .ok_or_else(|| AuthError::InvalidRequest("code required".into()))?;
            state
                .provider
                .exchange_authorization_code(
                    &client,
                    code,
                    form.get("code_verifier").map(String::as_str),
                    form.get("redirect_uri").map(String::as_str),
                    resource,
                )
                .await
        }
        "refresh_token" => {
            let refresh_token = form
                .get("refresh_token")
                .ok_or_else(|| AuthError::InvalidRequest("refresh_token required".into()))?;
            let scopes = parse_scopes(form.get("scope").map(String::as_str));
            state
                .provider
                .exchange_refresh_token(&client, refresh_token, &scopes, resource)
                .await
        }
        "client_credentials" => {
            let scopes = parse_scopes(form.get("scope").map(String::as_str));
            state
                .provider
                .exchange_client_credentials(&client, &scopes, resource)
                .await
        }
        other => Err(AuthError::UnsupportedGrantType(other.to_string())),
    }
}

fn authenticate_client(
    client: &OAuthClientInformation,
    presented_secret: Option<&str>,
) -> Result<(), AuthError> {
    use subtle::ConstantTimeEq;
    match (&client.client_secret, presented_secret) {
        (None, _) => Ok(()),
        (Some(expected), Some(presented))
            if expected.len() == presented.len()
                && bool::from(expected.as_bytes().ct_eq(presented.as_bytes())) =>
        {
            Ok(())
        }
        (Some(_), _) => Err(AuthError::InvalidClient(
            "client authentication failed".into(),
        )),
    }
}

// ---------------------------------------------------------------------------
// /register, /revoke, metadata
// ---------------------------------------------------------------------------

async fn register(
    State(state): State<AuthServerState>,
    Json(metadata): Json<OAuthClientMetadata>,
) -> Response {
    match state.provider.register_client(metadata).await {
        Ok(client) => cors(no_store(
            (StatusCode::CREATED, Json(client)).into_response(),
        )),
        Err(err) => error_response(&err),
    }
}

async fn revoke(
    State(state): State<AuthServerState>,
    headers: HeaderMap,
    Form(form): Form<HashMap<String, String>>,
) -> Response {
    let (client_id, client_secret) = client_credentials_from(&headers, &form);
    let result = async {
        let client = lookup_client(&state, client_id.as_deref()).await?;
        authenticate_client(&client, client_secret.as_deref())?;
        let token = form
            .get("token")
            .ok_or_else(|| AuthError::InvalidRequest("token required".into()))?;
        state.provider.revoke_token(&client, token).await
    }
    .await;
    match result {
        Ok(()) => cors(no_store(Json(serde_json::json!({})).into_response())),
        Err(err) => error_response(&err),
    }
}

async fn authorization_server_metadata(State(state): State<AuthServerState>) -> Response {
    cors(Json(state.config.metadata()).into_response())
}

async fn protected_resource_metadata(State(state): State<AuthServerState>) -> Response {
    match &state.config.protected_resource {
        Some(metadata) => cors(Json(metadata.clone()).into_response()),
        None => cors(StatusCode::NOT_FOUND.into_response()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pkce;
    use crate::provider::InMemoryOAuthProvider;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    async fn setup() -> (Router, OAuthClientInformation) {
        let provider = Arc::new(InMemoryOAuthProvider::default());
        let client = provider
            .register_client(OAuthClientMetadata {
                redirect_uris: vec!["http://localhost:7777/callback".into()],
                token_endpoint_auth_method: Some("none".into()),
                grant_types: None,
                response_types: None,
                client_name: Some("test".into()),
                scope: None,
            })
            .await
            .unwrap();
        let router = oauth_router(provider, AuthServerConfig::new("http://localhost:9000"));
        (router, client)
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), 1 << 20).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn metadata_document_lists_endpoints() {
        let (router, _) = setup().await;
        let response = router
            .oneshot(
                Request::builder()
                    .uri("/.well-known/oauth-authorization-server")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let value = body_json(response).await;
        assert_eq!(value["token_endpoint"], "http://localhost:9000/token");
        assert_eq!(value["code_challenge_methods_supported"][0], "S256");
    }

    #[tokio::test]
    async fn authorize_redirects_with_code_and_state() {
        let (router, client) = setup().await;
        let pair = pkce::generate();
        let uri = format!(
            "/authorize?response_type=code&client_id={}&redirect_uri=http%3A%2F%2Flocalhost%3A7777%2Fcallback&code_challenge={}&code_challenge_method=S256&state=xyz",
            client.client_id, pair.challenge
        );
        let response = router
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert!(response.status().is_redirection());
        let location = response
            .headers()
            .get(header::LOCATION)
            .unwrap()
            .to_str()
            .unwrap();
        let url = Url::parse(location).unwrap();
        let pairs: HashMap<_, _> = url.query_pairs().into_owned().collect();
        assert!(pairs.contains_key("code"));
        assert_eq!(pairs.get("state").map(String::as_str), Some("xyz"));
    }

    #[tokio::test]
    async fn token_exchange_round_trip_over_http() {
        let (router, client) = setup().await;
        let pair = pkce::generate();
        let uri = format!(
            "/authorize?response_type=code&client_id={}&redirect_uri=http%3A%2F%2Flocalhost%3A7777%2Fcallback&code_challenge={}",
            client.client_id, pair.challenge
        );
        let response = router
            .clone()
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let location = response
            .headers()
            .get(header::LOCATION)
            .unwrap()
            .to_str()
            .unwrap();
        let url = Url::parse(location).unwrap();
        let code = url
            .query_pairs()
            .find(|(k, _)| k == "code")
            .map(|(_, v)| v.into_owned())
            .unwrap();

        let body = format!(
            "grant_type=authorization_code&client_id={}&code={}&code_verifier={}&redirect_uri=http%3A%2F%2Flocalhost%3A7777%2Fcallback",
            client.client_id, code, pair.verifier
        );
        let response = router
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/token")
                    .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
                    .body(Body::from(body))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(header::CACHE_CONTROL).unwrap(),
            "no-store"
        );
        let value = body_json(response).await;
        assert_eq!(value["token_type"], "Bearer");
        assert!(value["access_token"].as_str().unwrap().starts_with("at-"));
    }

    #[tokio::test]
    async fn unsupported_grant_type_is_oauth_error_body() {
        let (router, client) = setup().await;
        let body = format!("grant_type=password&client_id={}", client.client_id);
        let response = router
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/token")
                    .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
                    .body(Body::from(body))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let value = body_json(response).await;
        assert_eq!(value["error"], "unsupported_grant_type");
    }

    #[tokio::test]
    async fn rate_limit_returns_429() {
        let provider = Arc::new(InMemoryOAuthProvider::default());
        let mut config = AuthServerConfig::new("http://localhost:9000");
        config.rate_limit = Some(RateLimitConfig {
            capacity: 1,
            window: std::time::Duration::from_secs(3600),
        });
        let router = oauth_router(provider, config);
        let request = || {
            Request::builder()
                .method("POST")
                .uri("/token")
                .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
                .body(Body::from("grant_type=client_credentials&client_id=x"))
                .unwrap()
        };
        let first = router.clone().oneshot(request()).await.unwrap();
        // Unknown client, but the bucket was consumed.
        assert_eq!(first.status(), StatusCode::UNAUTHORIZED);
        let second = router.oneshot(request()).await.unwrap();
        assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);
        let value = body_json(second).await;
        assert_eq!(value["error"], "too_many_requests");
    }

    #[tokio::test]
    async fn preflight_carries_cors_headers() {
        let (router, _) = setup().await;
        let response = router
            .oneshot(
                Request::builder()
                    .method("OPTIONS")
                    .uri("/token")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        assert_eq!(
            response
                .headers()
                .get(header::ACCESS_CONTROL_ALLOW_ORIGIN)
                .unwrap(),
            "*"
        );
    }

    #[tokio::test]
    async fn dynamic_registration_issues_credentials() {
        let (router, _) = setup().await;
        let response = router
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/register")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(
                        serde_json::json!({
                            "redirect_uris": ["http://localhost:1/cb"],
                            "client_name": "dyn"
                        })
                        .to_string(),
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let value = body_json(response).await;
        assert!(value["client_id"].as_str().is_some());
        assert!(value["client_secret"].as_str().is_some());
    }
}
