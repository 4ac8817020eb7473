//! Bearer-token middleware for protected MCP endpoints.
//!
//! Validates the `Authorization: Bearer` token through the provider,
//! asserts the required scopes, and attaches the verified [`TokenInfo`] as
//! a request extension. Failures answer with a `WWW-Authenticate`
//! challenge carrying `resource_metadata` when configured (RFC 9728).

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;

use crate::error::AuthError;
use crate::provider::OAuthServerProvider;
use crate::types::TokenInfo;

/// Bearer middleware configuration
#[derive(Debug, Clone, Default)]
pub struct BearerConfig {
    /// Scopes every request must carry
    pub required_scopes: Vec<String>,
    /// Advertised in the challenge as `resource_metadata="…"`
    pub resource_metadata_url: Option<String>,
}

/// State for [`require_bearer`]; pass via
/// `axum::middleware::from_fn_with_state`.
#[derive(Clone)]
pub struct BearerState {
    /// Token validator
    pub provider: Arc<dyn OAuthServerProvider>,
    /// Scope and challenge configuration
    pub config: Arc<BearerConfig>,
}

impl BearerState {
    /// Bundle a provider and config
    pub fn new(provider: Arc<dyn OAuthServerProvider>, config: BearerConfig) -> Self {
        Self {
            provider,
            config: Arc::new(config),
        }
    }
}

/// Middleware entry point
pub async fn require_bearer(
    State(state): State<BearerState>,
    mut request: Request,
    next: Next,
) -> Response {
    let token = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    let Some(token) = token else {
        return challenge(
            &state,
            &AuthError::InvalidToken("missing bearer token".into()),
        );
    };

    let info = match state.provider.verify_access_token(token).await {
        Ok(info) => info,
        Err(err) => return challenge(&state, &err),
    };
    if !info.has_scopes(&state.config.required_scopes) {
        return challenge(
            &state,
            &AuthError::InsufficientScope(format!(
                "token lacks required scopes: {}",
                state.config.required_scopes.join(" ")
            )),
        );
    }

    request.extensions_mut().insert::<TokenInfo>(info);
    next.run(request).await
}

fn challenge(state: &BearerState, err: &AuthError) -> Response {
    let mut value = format!(
        "Bearer error=\"{}\", error_description=\"{}\"",
        err.error_code(),
        err.description().replace('"', "'")
    );
    if let Some(url) = &state.config.resource_metadata_url {
        value.push_str(&format!(", resource_metadata=\"{url}\""));
    }
    let status = match err {
        AuthError::InsufficientScope(_) => StatusCode::FORBIDDEN,
        _ => StatusCode::UNAUTHORIZED,
    };
    let mut response = (status, Json(err.body())).into_response();
    if let Ok(value) = HeaderValue::from_str(&value) {
        response
            .headers_mut()
            .insert(header::WWW_AUTHENTICATE, value);
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::InMemoryOAuthProvider;
    use crate::types::{OAuthClientInformation, OAuthClientMetadata};
    use axum::body::Body;
    use axum::http::Request as HttpRequest;
    use axum::routing::get;
    use axum::Router;
    use tower::ServiceExt;

    async fn protected_router(required_scopes: Vec<String>) -> (Router, String) {
        let provider = Arc::new(InMemoryOAuthProvider::default());
        provider.add_client(OAuthClientInformation {
            client_id: "cid".into(),
            client_secret: Some("secret".into()),
            client_id_issued_at: None,
            client_secret_expires_at: None,
            metadata: OAuthClientMetadata {
                redirect_uris: vec!["http://localhost/cb".into()],
                token_endpoint_auth_method: None,
                grant_types: None,
                response_types: None,
                client_name: None,
                scope: None,
            },
        });
        let client = provider.get_client("cid").await.unwrap().unwrap();
        let tokens = provider
            .exchange_client_credentials(&client, &["mcp".into()], None)
            .await
            .unwrap();

        let state = BearerState::new(
            provider,
            BearerConfig {
                required_scopes,
                resource_metadata_url: Some(
                    "http://localhost/.well-known/oauth-protected-resource".into(),
                ),
            },
        );
        let router = Router::new()
            .route(
                "/",
                get(|request: Request| async move {
                    let info = request.extensions().get::<TokenInfo>().cloned();
                    Json(serde_json::json!({"client": info.map(|i| i.client_id)}))
                }),
            )
            .layer(axum::middleware::from_fn_with_state(state, require_bearer));
        (router, tokens.access_token)
    }

    #[tokio::test]
    async fn valid_token_passes_and_attaches_info() {
        let (router, token) = protected_router(vec!["mcp".into()]).await;
        let response = router
            .oneshot(
                HttpRequest::builder()
                    .uri("/")
                    .header(header::AUTHORIZATION, format!("Bearer {token}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), 1 << 20).await.unwrap();
        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["client"], "cid");
    }

    #[tokio::test]
    async fn missing_token_gets_challenge_with_resource_metadata() {
        let (router, _) = protected_router(vec![]).await;
        let response = router
            .oneshot(HttpRequest::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let challenge = response
            .headers()
            .get(header::WWW_AUTHENTICATE)
            .unwrap()
            .to_str()
            .unwrap();
        assert!(challenge.contains("error=\"invalid_token\""));
        assert!(challenge.contains("resource_metadata="));
    }

    #[tokio::test]
    async fn missing_scope_is_403_insufficient_scope() {
        let (router, token) = protected_router(vec!["admin".into()]).await;
        let response = router
            .oneshot(
                HttpRequest::builder()
                    .uri("/")
                    .header(header::AUTHORIZATION, format!("Bearer {token}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        let challenge = response
            .headers()
            .get(header::WWW_AUTHENTICATE)
            .unwrap()
            .to_str()
            .unwrap();
        assert!(challenge.contains("insufficient_scope"));
    }

    #[tokio::test]
    async fn garbage_token_rejected() {
        let (router, _) = protected_router(vec![]).await;
        let response = router
            .oneshot(
                HttpRequest::builder()
                    .uri("/")
                    .header(header::AUTHORIZATION, "Bearer not-a-token")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }
}
