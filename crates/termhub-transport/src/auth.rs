//! Request authentication.
//!
//! HTTP Basic for operators and remotes calling HQ, bearer tokens for HQ
//! calling back into a remote. With neither configured every request passes.

use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::{StatusCode, header::AUTHORIZATION},
    middleware::Next,
    response::{IntoResponse, Response},
};
use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};

/// Accepted credentials.
#[derive(Debug, Clone, Default)]
pub struct AuthConfig {
    basic: Option<String>,
    bearer_tokens: Vec<String>,
}

impl AuthConfig {
    /// No authentication.
    #[must_use]
    pub fn open() -> Self {
        Self::default()
    }

    /// Accept Basic credentials.
    #[must_use]
    pub fn with_basic(mut self, username: &str, password: &str) -> Self {
        self.basic = Some(format!("Basic {}", BASE64.encode(format!("{username}:{password}"))));
        self
    }

    /// Accept a bearer token.
    #[must_use]
    pub fn with_bearer(mut self, token: impl Into<String>) -> Self {
        self.bearer_tokens.push(token.into());
        self
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        self.basic.is_none() && self.bearer_tokens.is_empty()
    }

    /// Check an `Authorization` header value.
    #[must_use]
    pub fn authorize(&self, header: Option<&str>) -> bool {
        if self.is_open() {
            return true;
        }
        let Some(header) = header.map(str::trim) else {
            return false;
        };
        if self.basic.as_deref() == Some(header) {
            return true;
        }
        header
            .strip_prefix("Bearer ")
            .is_some_and(|token| self.bearer_tokens.iter().any(|t| t == token))
    }
}

/// Axum middleware rejecting requests without valid credentials.
pub async fn require_auth(
    State(auth): State<Arc<AuthConfig>>,
    request: Request,
    next: Next,
) -> Response {
    let header = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok());
    if auth.authorize(header) {
        return next.run(request).await;
    }
    tracing::debug!(path = %request.uri().path(), "Rejected unauthenticated request");
    (
        StatusCode::UNAUTHORIZED,
        [("www-authenticate", "Basic realm=\"termhub\"")],
        "Unauthorized",
    )
        .into_response()
}
