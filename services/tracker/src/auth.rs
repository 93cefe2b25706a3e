//! Upstream credential management.
//!
//! Holds the short-lived access token (a JWT carrying an `exp` claim) and
//! the long-lived refresh token.  Both are opaque beyond the expiry check.
//! All mutation goes through the single refresh routine under a mutex, and
//! every successful refresh is persisted back to the credential file.
//!
//! # Credential file format
//! ```json
//! { "tokens": { "auth-access-token": "...", "auth-refresh-token": "..." } }
//! ```

use base64::Engine;
use reqwest::header;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{info, warn};

/// Refresh calls must finish within this deadline.
const REFRESH_TIMEOUT: Duration = Duration::from_secs(5);
/// Tokens expiring within this window count as expired.
const EXPIRY_SKEW_SECS: i64 = 30;

const ACCESS_COOKIE: &str = "auth-access-token";
const REFRESH_COOKIE: &str = "auth-refresh-token";

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("reading credential file '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("credential file parse: {0}")]
    Parse(String),
    #[error("refresh request: {0}")]
    Request(String),
    /// 401/403 from the auth endpoint — an authoritative rejection.
    #[error("refresh rejected with HTTP {0}")]
    Rejected(u16),
    #[error("refresh returned HTTP {0}")]
    Http(u16),
    #[error("refresh response carried no access-token cookie")]
    MissingCookie,
}

// ---------------------------------------------------------------------------
// Credential file (de)serialization
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
struct CredentialFile {
    tokens: CredentialTokens,
}

#[derive(Debug, Serialize, Deserialize)]
struct CredentialTokens {
    #[serde(rename = "auth-access-token")]
    access: String,
    #[serde(rename = "auth-refresh-token")]
    refresh: String,
}

// ---------------------------------------------------------------------------
// Token pair
// ---------------------------------------------------------------------------

/// The current access/refresh pair, cloned out to callers so no lock is held
/// while a network call is in flight.
#[derive(Debug, Clone)]
pub struct TokenPair {
    pub access: String,
    pub refresh: String,
}

impl TokenPair {
    /// The Cookie header value both the streaming handshake and the
    /// enrichment endpoints expect.
    pub fn cookie_header(&self) -> String {
        format!(
            "{ACCESS_COOKIE}={}; {REFRESH_COOKIE}={}",
            self.access, self.refresh
        )
    }
}

// ---------------------------------------------------------------------------
// AuthSession
// ---------------------------------------------------------------------------

/// Configuration for the credential session.
#[derive(Debug, Clone)]
pub struct AuthConfig {
    pub credential_file: PathBuf,
    pub refresh_url: String,
    /// Origin header sent on auth and streaming requests, when configured.
    pub origin: Option<String>,
}

/// Owns the credential pair and the refresh exchange.
pub struct AuthSession {
    http: reqwest::Client,
    cfg: AuthConfig,
    tokens: Mutex<TokenPair>,
}

impl AuthSession {
    /// Load the credential pair from the configured file.
    pub fn load(cfg: AuthConfig, http: reqwest::Client) -> Result<Self, AuthError> {
        let text = std::fs::read_to_string(&cfg.credential_file).map_err(|e| AuthError::Io {
            path: cfg.credential_file.display().to_string(),
            source: e,
        })?;
        let file: CredentialFile =
            serde_json::from_str(&text).map_err(|e| AuthError::Parse(e.to_string()))?;
        Ok(AuthSession {
            http,
            cfg,
            tokens: Mutex::new(TokenPair {
                access: file.tokens.access,
                refresh: file.tokens.refresh,
            }),
        })
    }

    pub fn origin(&self) -> Option<&str> {
        self.cfg.origin.as_deref()
    }

    /// The current pair without any freshness guarantee.
    pub async fn current(&self) -> TokenPair {
        self.tokens.lock().await.clone()
    }

    /// Return a pair whose access token is current, refreshing if needed.
    ///
    /// Callers must invoke this before any outbound call that carries the
    /// credentials.  Concurrent callers serialize on the mutex, so at most
    /// one refresh exchange is in flight at a time.
    pub async fn ensure_fresh(&self) -> Result<TokenPair, AuthError> {
        let mut guard = self.tokens.lock().await;
        if token_is_current(&guard.access) {
            return Ok(guard.clone());
        }
        self.refresh_locked(&mut guard).await
    }

    /// Force a refresh exchange regardless of the access token's expiry.
    pub async fn force_refresh(&self) -> Result<TokenPair, AuthError> {
        let mut guard = self.tokens.lock().await;
        self.refresh_locked(&mut guard).await
    }

    async fn refresh_locked(&self, guard: &mut TokenPair) -> Result<TokenPair, AuthError> {
        let mut request = self
            .http
            .post(&self.cfg.refresh_url)
            .header(header::COOKIE, guard.cookie_header())
            .timeout(REFRESH_TIMEOUT);
        if let Some(origin) = &self.cfg.origin {
            request = request.header(header::ORIGIN, origin);
        }

        let response = request
            .send()
            .await
            .map_err(|e| AuthError::Request(e.to_string()))?;
        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            warn!(status = status.as_u16(), "credential refresh rejected");
            return Err(AuthError::Rejected(status.as_u16()));
        }
        if !status.is_success() {
            return Err(AuthError::Http(status.as_u16()));
        }

        let mut new_access = None;
        let mut new_refresh = None;
        for value in response.headers().get_all(header::SET_COOKIE) {
            if let Ok(text) = value.to_str() {
                if let Some(v) = cookie_value(text, ACCESS_COOKIE) {
                    new_access = Some(v);
                } else if let Some(v) = cookie_value(text, REFRESH_COOKIE) {
                    new_refresh = Some(v);
                }
            }
        }

        guard.access = new_access.ok_or(AuthError::MissingCookie)?;
        if let Some(refresh) = new_refresh {
            guard.refresh = refresh;
        }
        self.persist(guard);
        info!("access credential refreshed");
        Ok(guard.clone())
    }

    /// Write the pair back to the credential file.  A write failure is logged
    /// and otherwise ignored: the in-memory pair stays authoritative.
    fn persist(&self, pair: &TokenPair) {
        let file = CredentialFile {
            tokens: CredentialTokens {
                access: pair.access.clone(),
                refresh: pair.refresh.clone(),
            },
        };
        match serde_json::to_string_pretty(&file) {
            Ok(json) => {
                if let Err(e) = std::fs::write(&self.cfg.credential_file, json) {
                    warn!(
                        path = %self.cfg.credential_file.display(),
                        error = %e,
                        "failed to persist refreshed credentials"
                    );
                }
            }
            Err(e) => warn!(error = %e, "failed to serialize credentials"),
        }
    }
}

// ---------------------------------------------------------------------------
// Expiry check
// ---------------------------------------------------------------------------

/// True when the access token's `exp` claim is at least the skew window away.
///
/// A token that cannot be decoded counts as expired, which forces a refresh
/// on the next outbound call.
pub fn token_is_current(token: &str) -> bool {
    match token_expiry(token) {
        Some(exp) => chrono::Utc::now().timestamp() + EXPIRY_SKEW_SECS <= exp,
        None => false,
    }
}

fn token_expiry(token: &str) -> Option<i64> {
    let payload = token.split('.').nth(1)?;
    let bytes = base64::engine::general_purpose::URL_SAFE_NO_PAD
        .decode(payload.trim_end_matches('='))
        .ok()?;
    let value: serde_json::Value = serde_json::from_slice(&bytes).ok()?;
    value.get("exp")?.as_i64()
}

fn cookie_value(set_cookie: &str, name: &str) -> Option<String> {
    let first = set_cookie.split(';').next()?;
    let (key, value) = first.split_once('=')?;
    if key.trim() == name {
        Some(value.trim().to_owned())
    } else {
        None
    }
}
