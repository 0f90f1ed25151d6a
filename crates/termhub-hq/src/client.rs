//! Remote-side client for registering with HQ.
//!
//! Remote -> HQ calls use HTTP Basic auth with the HQ credentials. The
//! bearer token sent during registration is what HQ uses to call back.

use std::time::Duration;

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use reqwest::{StatusCode, header::AUTHORIZATION};
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

use crate::registry::RemoteRegistration;

/// HQ client error.
#[derive(Debug, Error)]
pub enum HqError {
    #[error("HQ rejected credentials ({status})")]
    Auth { status: u16 },
    #[error("HQ rejected request ({status}): {body}")]
    Rejected { status: u16, body: String },
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl HqError {
    /// HTTP status returned by HQ, if the request got that far.
    #[must_use]
    pub const fn status(&self) -> Option<u16> {
        match self {
            Self::Auth { status } | Self::Rejected { status, .. } => Some(*status),
            Self::Http(_) => None,
        }
    }
}

/// Session lifecycle action pushed to HQ.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionAction {
    Created,
    Deleted,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SessionChangeBody<'a> {
    action: SessionAction,
    session_id: &'a str,
}

/// Client used by a Remote to talk to its HQ.
#[derive(Debug, Clone)]
pub struct HqClient {
    http: reqwest::Client,
    hq_url: String,
    hq_auth: String,
    remote_id: String,
    name: String,
    url: String,
    token: String,
    request_timeout: Duration,
}

impl HqClient {
    /// Create a client. A fresh remote id is generated.
    #[must_use]
    pub fn new(
        hq_url: impl Into<String>,
        hq_username: &str,
        hq_password: &str,
        name: impl Into<String>,
        url: impl Into<String>,
        token: impl Into<String>,
    ) -> Self {
        let hq_url = hq_url.into().trim_end_matches('/').to_string();
        Self {
            http: reqwest::Client::new(),
            hq_auth: format!(
                "Basic {}",
                BASE64.encode(format!("{hq_username}:{hq_password}"))
            ),
            hq_url,
            remote_id: Uuid::new_v4().to_string(),
            name: name.into(),
            url: url.into(),
            token: token.into(),
            request_timeout: Duration::from_secs(5),
        }
    }

    /// Bound every call to HQ by `timeout`.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    #[must_use]
    pub fn remote_id(&self) -> &str {
        &self.remote_id
    }

    #[must_use]
    pub fn token(&self) -> &str {
        &self.token
    }

    #[must_use]
    pub fn hq_url(&self) -> &str {
        &self.hq_url
    }

    /// Value of the `Authorization` header sent to HQ.
    #[must_use]
    pub fn hq_auth(&self) -> &str {
        &self.hq_auth
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Register this remote with HQ.
    ///
    /// # Errors
    /// Returns `Auth` on 401/403, `Rejected` on any other non-2xx status and
    /// `Http` if HQ could not be reached. Nothing is retried.
    pub async fn register(&self) -> Result<(), HqError> {
        let body = RemoteRegistration {
            id: self.remote_id.clone(),
            name: self.name.clone(),
            url: self.url.clone(),
            token: self.token.clone(),
        };
        let response = self
            .http
            .post(format!("{}/api/remotes/register", self.hq_url))
            .header(AUTHORIZATION, &self.hq_auth)
            .timeout(self.request_timeout)
            .json(&body)
            .send()
            .await?;

        check_status(response).await?;
        tracing::info!(remote_id = %self.remote_id, hq = %self.hq_url, "Registered with HQ");
        Ok(())
    }

    /// Tell HQ about a session change so it can refresh this remote's
    /// session list right away.
    ///
    /// # Errors
    /// Same as [`Self::register`].
    pub async fn notify_session_change(
        &self,
        action: SessionAction,
        session_id: &str,
    ) -> Result<(), HqError> {
        let response = self
            .http
            .post(format!(
                "{}/api/remotes/{}/refresh-sessions",
                self.hq_url, self.name
            ))
            .header(AUTHORIZATION, &self.hq_auth)
            .timeout(self.request_timeout)
            .json(&SessionChangeBody { action, session_id })
            .send()
            .await?;
        check_status(response).await
    }

    /// Unregister from HQ. Best effort: failures are logged, never returned,
    /// and the call is bounded by the request timeout.
    pub async fn destroy(&self) {
        let request = self
            .http
            .delete(format!("{}/api/remotes/{}", self.hq_url, self.remote_id))
            .header(AUTHORIZATION, &self.hq_auth)
            .send();

        match tokio::time::timeout(self.request_timeout, request).await {
            Ok(Ok(response)) if response.status().is_success() => {
                tracing::info!(remote_id = %self.remote_id, "Unregistered from HQ");
            }
            Ok(Ok(response)) => {
                tracing::warn!(remote_id = %self.remote_id, status = %response.status(), "HQ refused unregistration");
            }
            Ok(Err(e)) => {
                tracing::warn!(remote_id = %self.remote_id, "Failed to unregister from HQ: {e}");
            }
            Err(_) => {
                tracing::warn!(remote_id = %self.remote_id, "Timed out unregistering from HQ");
            }
        }
    }
}

async fn check_status(response: reqwest::Response) -> Result<(), HqError> {
    let status = response.status();
    if status.is_success() {
        return Ok(());
    }
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return Err(HqError::Auth {
            status: status.as_u16(),
        });
    }
    let body = response.text().await.unwrap_or_default();
    Err(HqError::Rejected {
        status: status.as_u16(),
        body,
    })
}
