//! OAuth2 client-credentials token manager.
//!
//! A [`TokenManager`] owns the cached access token for one backend API. Callers ask for an
//! `Authorization` header value before every outbound call:
//!
//! - no cached token, or the cached token is inside the refresh margin: one token request is
//!   started and every concurrent caller awaits that same request (single-flight)
//! - a fresh cached token is returned without touching the network
//! - a failed request leaves the manager in `Failed`; the next caller starts over
//!
//! The refresh runs on its own task, so a caller giving up does not abort a request that other
//! callers are waiting on.

use crate::safety::sanitize_reqwest_error;
use async_trait::async_trait;
use futures::FutureExt as _;
use futures::future::{BoxFuture, Shared};
use parking_lot::Mutex;
use serde::{Deserialize, Deserializer};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

/// Default refresh margin: tokens are treated as expired this long before they really are.
pub const DEFAULT_SAFETY_MARGIN: Duration = Duration::from_secs(30);

/// Lifetime assumed when the token endpoint omits `expires_in`.
pub const DEFAULT_TOKEN_LIFETIME: Duration = Duration::from_secs(3600);

/// Upper bound on an advertised `expires_in`; larger values are clamped.
pub const MAX_TOKEN_LIFETIME: Duration = Duration::from_secs(365 * 24 * 60 * 60);

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_ERROR_BODY_CHARS: usize = 512;

/// Client-credentials configuration for the backend API.
#[derive(Clone)]
pub struct AuthConfig {
    pub client_id: String,
    pub client_secret: String,
    pub token_url: String,
    pub scope: Option<String>,
}

impl std::fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthConfig")
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .field("token_url", &self.token_url)
            .field("scope", &self.scope)
            .finish()
    }
}

impl AuthConfig {
    /// Build a config only when all mandatory fields are present and non-empty.
    ///
    /// Returns `None` otherwise, which means outbound calls stay unauthenticated.
    #[must_use]
    pub fn from_parts(
        client_id: Option<String>,
        client_secret: Option<String>,
        token_url: Option<String>,
        scope: Option<String>,
    ) -> Option<Self> {
        let non_empty = |v: Option<String>| v.map(|s| s.trim().to_string()).filter(|s| !s.is_empty());
        Some(Self {
            client_id: non_empty(client_id)?,
            client_secret: non_empty(client_secret)?,
            token_url: non_empty(token_url)?,
            scope: non_empty(scope),
        })
    }
}

#[derive(Debug, Clone, Error)]
pub enum TokenError {
    #[error("token endpoint returned HTTP {status}: {body}")]
    Rejected { status: u16, body: String },
    #[error("token request failed: {0}")]
    Transport(String),
    #[error("invalid token response: {0}")]
    InvalidResponse(String),
}

/// Source of `Authorization` header values for outbound requests.
#[async_trait]
pub trait AuthorizationProvider: Send + Sync {
    /// Return a ready-to-send `Authorization` header value.
    async fn authorization_header(&self) -> Result<String, TokenError>;
}

/// A cached access token.
#[derive(Clone)]
pub struct Token {
    access_token: String,
    token_type: String,
    expires_at: Instant,
    refresh_at: Instant,
}

impl std::fmt::Debug for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Token")
            .field("token_type", &self.token_type)
            .field("expires_at", &self.expires_at)
            .finish_non_exhaustive()
    }
}

impl Token {
    /// `Authorization` header value, e.g. `Bearer abc`.
    #[must_use]
    pub fn authorization_value(&self) -> String {
        format!("{} {}", self.token_type, self.access_token)
    }

    fn is_fresh(&self, now: Instant) -> bool {
        now < self.refresh_at
    }
}

/// Observable lifecycle phase of a [`TokenManager`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenPhase {
    NoToken,
    Valid,
    Expiring,
    Refreshing,
    Failed,
}

type RefreshFuture = Shared<BoxFuture<'static, Result<Token, TokenError>>>;

enum TokenState {
    NoToken,
    Valid(Token),
    Refreshing(RefreshFuture),
    Failed(TokenError),
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    token_type: Option<String>,
    #[serde(default, deserialize_with = "lenient_seconds")]
    expires_in: Option<u64>,
}

fn lenient_seconds<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    // Some providers send `expires_in` as a string.
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(u64),
        Float(f64),
        Text(String),
    }

    Ok(match Option::<Raw>::deserialize(deserializer)? {
        Some(Raw::Number(n)) => Some(n),
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        Some(Raw::Float(f)) if f.is_finite() && f >= 0.0 => Some(f as u64),
        Some(Raw::Text(s)) => s.trim().parse().ok(),
        _ => None,
    })
}

/// Caching, single-flight OAuth2 client-credentials token source.
#[derive(Clone)]
pub struct TokenManager {
    inner: Arc<Inner>,
}

struct Inner {
    config: AuthConfig,
    http: reqwest::Client,
    safety_margin: Duration,
    request_timeout: Duration,
    state: Mutex<TokenState>,
}

impl TokenManager {
    #[must_use]
    pub fn new(http: reqwest::Client, config: AuthConfig) -> Self {
        Self::with_options(http, config, DEFAULT_SAFETY_MARGIN, DEFAULT_REQUEST_TIMEOUT)
    }

    #[must_use]
    pub fn with_options(
        http: reqwest::Client,
        config: AuthConfig,
        safety_margin: Duration,
        request_timeout: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                http,
                safety_margin,
                request_timeout,
                state: Mutex::new(TokenState::NoToken),
            }),
        }
    }

    #[must_use]
    pub fn phase(&self) -> TokenPhase {
        match &*self.inner.state.lock() {
            TokenState::NoToken => TokenPhase::NoToken,
            TokenState::Valid(t) if t.is_fresh(Instant::now()) => TokenPhase::Valid,
            TokenState::Valid(_) => TokenPhase::Expiring,
            TokenState::Refreshing(_) => TokenPhase::Refreshing,
            TokenState::Failed(_) => TokenPhase::Failed,
        }
    }

    /// Return a usable token, fetching one if needed.
    ///
    /// # Errors
    ///
    /// Returns a [`TokenError`] if the token request fails; the manager is left in
    /// [`TokenPhase::Failed`] and the next call retries.
    pub async fn get_token(&self) -> Result<Token, TokenError> {
        let refresh = {
            let mut state = self.inner.state.lock();
            match &*state {
                TokenState::Valid(token) if token.is_fresh(Instant::now()) => {
                    return Ok(token.clone());
                }
                TokenState::Refreshing(pending) => pending.clone(),
                TokenState::NoToken | TokenState::Valid(_) | TokenState::Failed(_) => {
                    if let TokenState::Failed(previous) = &*state {
                        tracing::debug!(error = %previous, "retrying token request after failure");
                    }
                    let pending = self.start_refresh();
                    *state = TokenState::Refreshing(pending.clone());
                    pending
                }
            }
        };
        refresh.await
    }

    fn start_refresh(&self) -> RefreshFuture {
        let inner = Arc::clone(&self.inner);
        let watcher = Arc::clone(&self.inner);
        let task = tokio::spawn(async move {
            let result = inner.request_token().await;
            let next = match &result {
                Ok(token) => TokenState::Valid(token.clone()),
                Err(e) => {
                    tracing::warn!(token_url = %inner.config.token_url, error = %e, "token request failed");
                    TokenState::Failed(e.clone())
                }
            };
            *inner.state.lock() = next;
            result
        });

        async move {
            task.await.unwrap_or_else(|e| {
                let err = TokenError::Transport(format!("token refresh task ended: {e}"));
                tracing::warn!(error = %err, "token refresh task did not finish");
                *watcher.state.lock() = TokenState::Failed(err.clone());
                Err(err)
            })
        }
        .boxed()
        .shared()
    }
}

impl Inner {
    async fn request_token(&self) -> Result<Token, TokenError> {
        let mut form: Vec<(&str, &str)> = vec![
            ("grant_type", "client_credentials"),
            ("client_id", &self.config.client_id),
            ("client_secret", &self.config.client_secret),
        ];
        if let Some(scope) = &self.config.scope {
            form.push(("scope", scope));
        }

        tracing::debug!(token_url = %self.config.token_url, "requesting access token");
        let resp = self
            .http
            .post(&self.config.token_url)
            .header(reqwest::header::ACCEPT, "application/json")
            .form(&form)
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(|e| TokenError::Transport(sanitize_reqwest_error(&e)))?;

        let status = resp.status();
        let bytes = resp
            .bytes()
            .await
            .map_err(|e| TokenError::Transport(sanitize_reqwest_error(&e)))?;

        if !status.is_success() {
            let body: String = String::from_utf8_lossy(&bytes)
                .chars()
                .take(MAX_ERROR_BODY_CHARS)
                .collect();
            return Err(TokenError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: TokenResponse = serde_json::from_slice(&bytes)
            .map_err(|e| TokenError::InvalidResponse(e.to_string()))?;
        if parsed.access_token.trim().is_empty() {
            return Err(TokenError::InvalidResponse(
                "empty access_token".to_string(),
            ));
        }

        let lifetime = parsed
            .expires_in
            .map_or(DEFAULT_TOKEN_LIFETIME, Duration::from_secs)
            .min(MAX_TOKEN_LIFETIME);
        let now = Instant::now();
        let expires_at = now.checked_add(lifetime).unwrap_or(now + DEFAULT_TOKEN_LIFETIME);
        let refresh_at = expires_at
            .checked_sub(self.safety_margin)
            .unwrap_or(now)
            .max(now);

        let token_type = match parsed.token_type.as_deref().map(str::trim) {
            None | Some("") => "Bearer".to_string(),
            Some(t) if t.eq_ignore_ascii_case("bearer") => "Bearer".to_string(),
            Some(t) => t.to_string(),
        };

        tracing::debug!(lifetime_secs = lifetime.as_secs(), "access token acquired");
        Ok(Token {
            access_token: parsed.access_token,
            token_type,
            expires_at,
            refresh_at,
        })
    }
}

#[async_trait]
impl AuthorizationProvider for TokenManager {
    async fn authorization_header(&self) -> Result<String, TokenError> {
        Ok(self.get_token().await?.authorization_value())
    }
}
