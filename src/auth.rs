//! Bearer tokens for the CDSE identity service (Keycloak, OpenID Connect).

use std::fmt;
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, TimeDelta, Utc};

use crate::config::{ClientConfig, Credentials};
use crate::error::{Error, Result, summarize_body};
use crate::http::{Failure, Transport};

/// Tokens are treated as expired this long before the server says so.
const EXPIRY_MARGIN_SECS: i64 = 60;

#[derive(Clone, PartialEq, Eq)]
pub struct AuthToken {
    access_token: String,
    refresh_token: Option<String>,
    issued_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    refresh_expires_at: Option<DateTime<Utc>>,
}

impl AuthToken {
    fn from_response(resp: TokenResponse, issued_at: DateTime<Utc>) -> Self {
        let expires_at = after(issued_at, resp.expires_in);
        let refresh_expires_at = resp.refresh_token.as_ref().map(|_| {
            // Keycloak reports 0 for offline tokens that never expire.
            match resp.refresh_expires_in {
                Some(0) | None => DateTime::<Utc>::MAX_UTC,
                Some(secs) => after(issued_at, secs),
            }
        });
        Self {
            access_token: resp.access_token,
            refresh_token: resp.refresh_token,
            issued_at,
            expires_at,
            refresh_expires_at,
        }
    }

    pub fn access_token(&self) -> &str {
        &self.access_token
    }

    pub fn issued_at(&self) -> DateTime<Utc> {
        self.issued_at
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        after(now, EXPIRY_MARGIN_SECS) >= self.expires_at
    }

    fn usable_refresh_token(&self, now: DateTime<Utc>) -> Option<&str> {
        let expires = self.refresh_expires_at?;
        if after(now, EXPIRY_MARGIN_SECS) >= expires {
            return None;
        }
        self.refresh_token.as_deref()
    }
}

impl fmt::Debug for AuthToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthToken")
            .field("access_token", &"<redacted>")
            .field("has_refresh_token", &self.refresh_token.is_some())
            .field("issued_at", &self.issued_at)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

fn after(t: DateTime<Utc>, secs: i64) -> DateTime<Utc> {
    TimeDelta::try_seconds(secs)
        .and_then(|d| t.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[derive(Debug, serde::Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: i64,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    refresh_expires_in: Option<i64>,
}

/// Owns the token cache. Share one instance (behind an `Arc`) between the
/// catalog and the downloader.
///
/// The cache lock is held for the whole refresh, so concurrent callers that
/// find the token expired wait for the single in-flight exchange and then
/// receive its result.
pub struct TokenProvider {
    transport: Transport,
    token_url: String,
    client_id: String,
    credentials: Credentials,
    cached: Mutex<Option<AuthToken>>,
}

impl fmt::Debug for TokenProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenProvider")
            .field("token_url", &self.token_url)
            .field("client_id", &self.client_id)
            .field("credentials", &self.credentials)
            .finish_non_exhaustive()
    }
}

impl TokenProvider {
    pub fn from_config(cfg: &ClientConfig) -> Result<Self> {
        Ok(Self::new(Transport::new(cfg)?, cfg))
    }

    pub(crate) fn new(transport: Transport, cfg: &ClientConfig) -> Self {
        Self {
            transport,
            token_url: cfg.urls.identity.clone(),
            client_id: cfg.client_id.clone(),
            credentials: cfg.credentials.clone(),
            cached: Mutex::new(None),
        }
    }

    /// Returns a valid token, exchanging credentials when the cached one is
    /// absent or expired.
    pub fn token(&self) -> Result<AuthToken> {
        let mut cached = self.cached.lock().unwrap_or_else(PoisonError::into_inner);
        let now = Utc::now();
        if let Some(token) = cached.as_ref() {
            if !token.is_expired_at(now) {
                return Ok(token.clone());
            }
        }

        let refresh_token = cached
            .as_ref()
            .and_then(|t| t.usable_refresh_token(now))
            .map(str::to_string);

        let token = match refresh_token {
            Some(refresh_token) => match self.refresh_grant(&refresh_token) {
                Ok(token) => token,
                Err(Error::Authentication { status, message }) => {
                    tracing::debug!(status, %message, "refresh token rejected, falling back to password grant");
                    self.password_grant()?
                }
                Err(e) => return Err(e),
            },
            None => self.password_grant()?,
        };

        tracing::info!(expires_at = %token.expires_at, "obtained CDSE access token");
        *cached = Some(token.clone());
        Ok(token)
    }

    /// Drops the cached token if it is still `stale`. A token that another
    /// caller already replaced is kept.
    pub fn invalidate(&self, stale: &AuthToken) {
        let mut cached = self.cached.lock().unwrap_or_else(PoisonError::into_inner);
        if cached.as_ref() == Some(stale) {
            *cached = None;
        }
    }

    fn password_grant(&self) -> Result<AuthToken> {
        self.exchange(&[
            ("client_id", self.client_id.as_str()),
            ("grant_type", "password"),
            ("username", self.credentials.username.as_str()),
            ("password", self.credentials.password.as_str()),
        ])
    }

    fn refresh_grant(&self, refresh_token: &str) -> Result<AuthToken> {
        self.exchange(&[
            ("client_id", self.client_id.as_str()),
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
        ])
    }

    fn exchange(&self, form: &[(&str, &str)]) -> Result<AuthToken> {
        let url = self.token_url.as_str();
        tracing::debug!(url, "requesting access token");
        let issued_at = Utc::now();

        let resp = self
            .transport
            .robust_request(&|| false, |http| http.post(url).form(form))
            .map_err(|failure| match failure {
                Failure::Transport(source) => Error::IdentityRequest {
                    url: url.to_string(),
                    status: None,
                    body: source.to_string(),
                    source: Some(source),
                },
                other => Error::IdentityRequest {
                    url: url.to_string(),
                    status: None,
                    body: format!("{other:?}"),
                    source: None,
                },
            })?;

        let status = resp.status();
        let text = resp.text().unwrap_or_default();
        if matches!(status.as_u16(), 400 | 401 | 403) {
            return Err(Error::Authentication {
                status: status.as_u16(),
                message: format!(
                    "{}; check the credentials for https://dataspace.copernicus.eu/",
                    summarize_body(status, &text)
                ),
            });
        }
        if !status.is_success() {
            return Err(Error::IdentityRequest {
                url: url.to_string(),
                status: Some(status.as_u16()),
                body: summarize_body(status, &text),
                source: None,
            });
        }

        let parsed: TokenResponse =
            serde_json::from_str(&text).map_err(|e| Error::IdentityRequest {
                url: url.to_string(),
                status: Some(status.as_u16()),
                body: format!("unexpected token response: {e}"),
                source: None,
            })?;
        Ok(AuthToken::from_response(parsed, issued_at))
    }
}
