//! Bearer tokens for the tunnel connection
//!
//! A token is either given directly or minted from a refresh token on every
//! connect, so an expired identity token never outlives one session.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use tracing::debug;

pub const DEFAULT_TOKEN_URL: &str = "https://www.googleapis.com/oauth2/v4/token";

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("{0} is set but {1} is missing")]
    IncompleteCredentials(&'static str, &'static str),

    #[error("token request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("token endpoint answered {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error("token response carried no id_token")]
    MissingIdToken,
}

/// Credentials exchanged for an identity token.
#[derive(Clone)]
pub struct RefreshCredentials {
    pub client_id: String,
    pub client_secret: String,
    pub refresh_token: String,
    /// Audience the identity token is minted for
    pub audience: Option<String>,
    pub token_url: String,
}

impl fmt::Debug for RefreshCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RefreshCredentials")
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .field("refresh_token", &"<redacted>")
            .field("audience", &self.audience)
            .field("token_url", &self.token_url)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub enum TokenSource {
    /// Connect without an Authorization header
    None,
    /// Fixed bearer token
    Static(String),
    /// Exchange a refresh token on each connect
    Refresh(RefreshCredentials),
}

impl TokenSource {
    /// Pick a source: an explicit bearer wins, then refresh credentials.
    pub fn from_lookup<F>(bearer: Option<String>, lookup: F) -> Result<Self, TokenError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(token) = bearer.filter(|t| !t.is_empty()) {
            return Ok(TokenSource::Static(token));
        }

        let Some(refresh_token) = lookup("REFRESH_TOKEN").filter(|t| !t.is_empty()) else {
            return Ok(TokenSource::None);
        };
        let client_id =
            lookup("CLIENT_ID").ok_or(TokenError::IncompleteCredentials("REFRESH_TOKEN", "CLIENT_ID"))?;
        let client_secret = lookup("CLIENT_SECRET")
            .ok_or(TokenError::IncompleteCredentials("REFRESH_TOKEN", "CLIENT_SECRET"))?;

        Ok(TokenSource::Refresh(RefreshCredentials {
            client_id,
            client_secret,
            refresh_token,
            audience: lookup("IAP_CLIENT_ID"),
            token_url: lookup("TOKEN_URL").unwrap_or_else(|| DEFAULT_TOKEN_URL.to_string()),
        }))
    }

    pub fn from_env(bearer: Option<String>) -> Result<Self, TokenError> {
        Self::from_lookup(bearer, |key| std::env::var(key).ok())
    }

    pub fn describe(&self) -> &'static str {
        match self {
            TokenSource::None => "none",
            TokenSource::Static(_) => "static bearer",
            TokenSource::Refresh(_) => "refresh token",
        }
    }
}

#[derive(Serialize)]
struct RefreshRequest<'a> {
    client_id: &'a str,
    client_secret: &'a str,
    refresh_token: &'a str,
    grant_type: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    audience: Option<&'a str>,
}

#[derive(Deserialize)]
struct RefreshResponse {
    id_token: Option<String>,
}

pub struct TokenProvider {
    source: TokenSource,
    http: reqwest::Client,
}

impl TokenProvider {
    pub fn new(source: TokenSource) -> Self {
        Self {
            source,
            http: reqwest::Client::new(),
        }
    }

    pub fn source(&self) -> &TokenSource {
        &self.source
    }

    /// Current bearer token, if any.
    pub async fn resolve(&self) -> Result<Option<String>, TokenError> {
        match &self.source {
            TokenSource::None => Ok(None),
            TokenSource::Static(token) => Ok(Some(token.clone())),
            TokenSource::Refresh(creds) => self.exchange(creds).await.map(Some),
        }
    }

    async fn exchange(&self, creds: &RefreshCredentials) -> Result<String, TokenError> {
        debug!(token_url = %creds.token_url, "exchanging refresh token");
        let resp = self
            .http
            .post(&creds.token_url)
            .json(&RefreshRequest {
                client_id: &creds.client_id,
                client_secret: &creds.client_secret,
                refresh_token: &creds.refresh_token,
                grant_type: "refresh_token",
                audience: creds.audience.as_deref(),
            })
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(TokenError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        resp.json::<RefreshResponse>()
            .await?
            .id_token
            .filter(|t| !t.is_empty())
            .ok_or(TokenError::MissingIdToken)
    }
}
