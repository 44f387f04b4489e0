//! Tunnel admission
//!
//! Runs once per tunnel connection attempt, before the connection may
//! register. Relayed HTTP requests inherit the channel's admission.

use async_trait::async_trait;
use axum::http::{header::AUTHORIZATION, HeaderMap, HeaderName};
use serde::{Deserialize, Deserializer};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use rtunnel_shared::RelayError;

/// Default header carrying an identity assertion already validated by a
/// fronting proxy (Google IAP).
pub const DEFAULT_ASSERTION_HEADER: &str = "x-goog-iap-jwt-assertion";

/// Default token-info endpoint used to verify bearer identity tokens.
pub const DEFAULT_VERIFY_URL: &str = "https://oauth2.googleapis.com/tokeninfo";

/// Claims returned by a successful verification.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Claims {
    #[serde(default)]
    pub sub: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub aud: Option<String>,
    #[serde(default)]
    pub iss: Option<String>,
    #[serde(default, deserialize_with = "lenient_i64")]
    pub exp: Option<i64>,
}

/// Verifies a presented bearer token.
#[async_trait]
pub trait TokenVerifier: Send + Sync {
    async fn verify(&self, token: &str) -> Result<Claims, String>;
}

/// Verifies identity tokens against a token-info endpoint.
pub struct TokenInfoVerifier {
    http: reqwest::Client,
    endpoint: String,
    audience: Option<String>,
}

impl TokenInfoVerifier {
    pub fn new(endpoint: impl Into<String>, audience: Option<String>) -> reqwest::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            http,
            endpoint: endpoint.into(),
            audience,
        })
    }
}

#[async_trait]
impl TokenVerifier for TokenInfoVerifier {
    async fn verify(&self, token: &str) -> Result<Claims, String> {
        let resp = self
            .http
            .get(&self.endpoint)
            .query(&[("id_token", token)])
            .send()
            .await
            .map_err(|e| format!("token info request failed: {}", e))?;

        if !resp.status().is_success() {
            return Err(format!("token info returned {}", resp.status()));
        }

        let claims: Claims = resp
            .json()
            .await
            .map_err(|e| format!("token info response unreadable: {}", e))?;

        check_claims(&claims, self.audience.as_deref(), chrono::Utc::now().timestamp())?;
        Ok(claims)
    }
}

/// Reject expired tokens and tokens minted for another audience.
pub fn check_claims(claims: &Claims, audience: Option<&str>, now: i64) -> Result<(), String> {
    if let Some(exp) = claims.exp {
        if exp <= now {
            return Err("token expired".into());
        }
    }
    if let Some(expected) = audience {
        match claims.aud.as_deref() {
            Some(aud) if aud == expected => {}
            Some(aud) => return Err(format!("unexpected audience {}", aud)),
            None => return Err("token has no audience".into()),
        }
    }
    Ok(())
}

/// Why a connection was let in. Held for the lifetime of the channel.
#[derive(Debug, Clone)]
pub enum Admission {
    /// No verifier configured
    Open,
    /// A fronting proxy already validated the caller
    Asserted,
    /// Bearer token verified
    Verified(Claims),
}

impl Admission {
    /// Identity for logs, if any.
    pub fn subject(&self) -> Option<&str> {
        match self {
            Admission::Verified(claims) => claims.email.as_deref().or(claims.sub.as_deref()),
            _ => None,
        }
    }
}

/// Admits or rejects tunnel connection attempts.
#[derive(Clone)]
pub struct AuthGate {
    verifier: Option<Arc<dyn TokenVerifier>>,
    assertion_header: HeaderName,
}

impl AuthGate {
    pub fn new(verifier: Option<Arc<dyn TokenVerifier>>, assertion_header: HeaderName) -> Self {
        Self {
            verifier,
            assertion_header,
        }
    }

    /// Gate that admits everything.
    pub fn open() -> Self {
        Self::new(None, HeaderName::from_static(DEFAULT_ASSERTION_HEADER))
    }

    pub async fn authorize(&self, headers: &HeaderMap) -> Result<Admission, RelayError> {
        let Some(verifier) = &self.verifier else {
            return Ok(Admission::Open);
        };

        if headers.contains_key(&self.assertion_header) {
            debug!(header = %self.assertion_header, "admitting pre-validated assertion");
            return Ok(Admission::Asserted);
        }

        let token = bearer_token(headers)?;
        verifier
            .verify(token)
            .await
            .map(Admission::Verified)
            .map_err(RelayError::AuthRejected)
    }
}

fn bearer_token(headers: &HeaderMap) -> Result<&str, RelayError> {
    let value = headers
        .get(AUTHORIZATION)
        .ok_or_else(|| RelayError::AuthRejected("missing Authorization header".into()))?
        .to_str()
        .map_err(|_| RelayError::AuthRejected("malformed Authorization header".into()))?;

    let (scheme, token) = value
        .split_once(' ')
        .ok_or_else(|| RelayError::AuthRejected("malformed Authorization header".into()))?;

    if !scheme.eq_ignore_ascii_case("bearer") {
        return Err(RelayError::AuthRejected(format!(
            "unsupported authorization scheme {}",
            scheme
        )));
    }

    let token = token.trim();
    if token.is_empty() {
        return Err(RelayError::AuthRejected("empty bearer token".into()));
    }
    Ok(token)
}

/// Token-info endpoints report numbers as strings.
fn lenient_i64<'de, D: Deserializer<'de>>(d: D) -> Result<Option<i64>, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Num(i64),
        Str(String),
    }

    match Option::<Raw>::deserialize(d)? {
        None => Ok(None),
        Some(Raw::Num(n)) => Ok(Some(n)),
        Some(Raw::Str(s)) => s.trim().parse().map(Some).map_err(serde::de::Error::custom),
    }
}
