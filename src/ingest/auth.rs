// src/ingest/auth.rs
//! Bearer-token lifecycle for the remote alert API.
//!
//! The token is cached in the backend's state store so restarts reuse it.
//! A cached token is returned as long as it stays valid for longer than the
//! refresh buffer; otherwise a fresh one is requested. Cache read failures
//! fall through to re-authentication, authentication failures are returned.

use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use metrics::counter;
use reqwest::Client;
use serde::Deserialize;
use tokio::sync::Mutex;

use crate::error::{IngestError, IngestResult};
use crate::store::{AuthToken, BackendStore};

/// Refresh this long before the token actually expires.
pub const DEFAULT_REFRESH_BUFFER_SECS: i64 = 5 * 60;
/// Used when the auth response carries no expiry at all.
const FALLBACK_TOKEN_LIFETIME_SECS: i64 = 3_600;

const AUTH_PATH: &str = "auth/token";

#[derive(Debug, Deserialize)]
struct AuthResponse {
    #[serde(default, alias = "access_token", alias = "dmaToken")]
    token: Option<String>,
    /// Absolute expiry, epoch milliseconds.
    #[serde(default)]
    expire: Option<i64>,
    /// Relative expiry, seconds.
    #[serde(default)]
    expires_in: Option<i64>,
}

impl AuthResponse {
    fn into_token(self, now: DateTime<Utc>) -> IngestResult<AuthToken> {
        let token = self
            .token
            .filter(|t| !t.trim().is_empty())
            .ok_or(IngestError::MissingToken)?;
        let expiry = match (self.expire, self.expires_in) {
            (Some(ms), _) => Utc
                .timestamp_millis_opt(ms)
                .single()
                .ok_or_else(|| IngestError::Parse(format!("invalid token expiry {ms}")))?,
            (None, Some(secs)) => now + ChronoDuration::seconds(secs),
            (None, None) => now + ChronoDuration::seconds(FALLBACK_TOKEN_LIFETIME_SECS),
        };
        Ok(AuthToken { token, expiry })
    }
}

pub struct AuthManager {
    http: Client,
    auth_url: String,
    client_id: String,
    client_secret: String,
    store: BackendStore,
    refresh_buffer: ChronoDuration,
    refresh_lock: Mutex<()>,
}

impl AuthManager {
    pub fn new(
        http: Client,
        base_url: &str,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
        store: BackendStore,
    ) -> Self {
        Self {
            http,
            auth_url: join_url(base_url, AUTH_PATH),
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            store,
            refresh_buffer: ChronoDuration::seconds(DEFAULT_REFRESH_BUFFER_SECS),
            refresh_lock: Mutex::new(()),
        }
    }

    pub fn with_refresh_buffer(mut self, buffer: ChronoDuration) -> Self {
        self.refresh_buffer = buffer;
        self
    }

    pub fn refresh_buffer(&self) -> ChronoDuration {
        self.refresh_buffer
    }

    /// Return a token valid for longer than the refresh buffer, authenticating if needed.
    pub async fn get_valid_token(&self) -> IngestResult<AuthToken> {
        let _guard = self.refresh_lock.lock().await;

        match self.store.load_auth_token().await {
            Ok(Some(cached)) if self.is_fresh(&cached, Utc::now()) => return Ok(cached),
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(
                    target: "auth",
                    backend_id = %self.store.backend_id(),
                    error = %e,
                    "failed to load cached token; re-authenticating"
                );
            }
        }

        let fresh = self.authenticate().await?;
        if let Err(e) = self.store.save_auth_token(&fresh).await {
            // The token is still usable for this call; next call re-authenticates.
            tracing::warn!(
                target: "auth",
                backend_id = %self.store.backend_id(),
                error = %e,
                "failed to persist token"
            );
        }
        Ok(fresh)
    }

    /// Force the next [`get_valid_token`](Self::get_valid_token) to authenticate.
    pub async fn clear_cached_token(&self) -> IngestResult<()> {
        let _guard = self.refresh_lock.lock().await;
        self.store.clear_auth_token().await
    }

    fn is_fresh(&self, token: &AuthToken, now: DateTime<Utc>) -> bool {
        !token.is_empty() && token.expiry - now > self.refresh_buffer
    }

    async fn authenticate(&self) -> IngestResult<AuthToken> {
        let resp = self
            .http
            .post(&self.auth_url)
            .form(&[
                ("grant_type", "api_key"),
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
            ])
            .send()
            .await?;

        let status = resp.status();
        let body = resp.text().await?;
        if !status.is_success() {
            return Err(IngestError::from_status(status, &body, "authentication"));
        }

        let parsed: AuthResponse = serde_json::from_str(&body)
            .map_err(|e| IngestError::Parse(format!("auth response: {e}")))?;
        let token = parsed.into_token(Utc::now())?;

        counter!("auth_refresh_total").increment(1);
        tracing::info!(
            target: "auth",
            backend_id = %self.store.backend_id(),
            token_len = token.token.len(),
            expiry = %token.expiry.to_rfc3339(),
            "obtained new API token"
        );
        Ok(token)
    }
}

pub(crate) fn join_url(base: &str, path: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), path.trim_start_matches('/'))
}
