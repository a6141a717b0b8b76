//! Token Client
//!
//! Fetches a short-lived access credential for the media room from an external
//! HTTP token service. The service is asked with a single `GET` carrying the
//! room, the caller identity and the operator's prompt as query parameters and
//! is expected to answer with `application/json` of the form `{"token": "..."}`.

use crate::error::TokenError;
use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tracing::{debug, error, info, instrument};

/// Upper bound on how much of a non-JSON body ends up in the log.
const BODY_PREVIEW_CHARS: usize = 512;

/// A bearer token authorizing exactly one media connection.
///
/// Not `Clone`: the credential is moved into the connect call that consumes it.
#[derive(Debug)]
pub struct Credential(SecretString);

impl Credential {
    pub fn new(token: impl Into<String>) -> Self {
        Self(SecretString::from(token.into()))
    }

    /// Gives access to the raw token string for the transport handshake.
    pub fn expose(&self) -> &str {
        self.0.expose_secret()
    }
}

/// Anything able to trade a room/identity/prompt triple for a [`Credential`].
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TokenClient: Send + Sync {
    async fn request_token(
        &self,
        room: &str,
        identity: &str,
        prompt: &str,
    ) -> Result<Credential, TokenError>;
}

#[derive(Deserialize)]
struct TokenResponse {
    token: String,
}

/// [`TokenClient`] backed by a plain HTTP endpoint.
///
/// No retries are attempted; a failure is handed straight back to the caller.
pub struct HttpTokenClient {
    http: reqwest::Client,
    base_url: String,
}

impl HttpTokenClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(reqwest::Client::new(), base_url)
    }

    /// Uses a preconfigured `reqwest::Client` (proxies, TLS roots, ...).
    pub fn with_client(http: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

#[async_trait]
impl TokenClient for HttpTokenClient {
    #[instrument(name = "token_request", skip_all, fields(room = %room, user = %identity))]
    async fn request_token(
        &self,
        room: &str,
        identity: &str,
        prompt: &str,
    ) -> Result<Credential, TokenError> {
        debug!(url = %self.base_url, prompt_len = prompt.len(), "Fetching token");

        let response = self
            .http
            .get(&self.base_url)
            .query(&[("room", room), ("user", identity), ("prompt", prompt)])
            .send()
            .await
            .map_err(|e| TokenError::RequestFailed(e.to_string()))?;

        let status = response.status();
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        info!(%status, %content_type, "Token service responded");

        // Never hand a non-JSON body to the parser: an HTML error page from a
        // gateway would otherwise surface as an opaque parse error.
        if !content_type.contains("application/json") {
            let body = response.text().await.unwrap_or_default();
            let preview: String = body.chars().take(BODY_PREVIEW_CHARS).collect();
            error!(%status, body = %preview, "Token service did not return JSON");
            return Err(TokenError::ResponseInvalid(format!(
                "expected application/json, got '{content_type}' (HTTP {status})"
            )));
        }

        if !status.is_success() {
            return Err(TokenError::ResponseInvalid(format!(
                "token service answered HTTP {status}"
            )));
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| TokenError::RequestFailed(e.to_string()))?;
        let parsed: TokenResponse = serde_json::from_slice(&body)
            .map_err(|e| TokenError::ResponseInvalid(format!("malformed token document: {e}")))?;

        if parsed.token.is_empty() {
            return Err(TokenError::ResponseInvalid("token field is empty".into()));
        }

        info!("Received token");
        Ok(Credential::new(parsed.token))
    }
}
