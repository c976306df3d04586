// src/store/backend_state.rs
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use super::KvStore;
use crate::error::{IngestError, IngestResult};

const KEY_AUTH: &str = "auth";
const KEY_CURSOR: &str = "cursor";
const KEY_LAST_POLL: &str = "last_poll";
const KEY_LAST_SUCCESS: &str = "last_success";
const KEY_FAILURES: &str = "failures";
const KEY_LAST_ERROR: &str = "last_error";

const ALL_KEYS: [&str; 6] = [
    KEY_AUTH,
    KEY_CURSOR,
    KEY_LAST_POLL,
    KEY_LAST_SUCCESS,
    KEY_FAILURES,
    KEY_LAST_ERROR,
];

/// Cached credential for the remote API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthToken {
    pub token: String,
    pub expiry: DateTime<Utc>,
}

impl AuthToken {
    /// Empty token with the zero expiry; forces re-authentication.
    pub fn cleared() -> Self {
        Self {
            token: String::new(),
            expiry: DateTime::<Utc>::UNIX_EPOCH,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.token.is_empty()
    }
}

/// Typed, per-backend view over a shared [`KvStore`].
///
/// Every key is `backend:<id>:<concern>`, so backends never see each other's
/// state even when they share one store.
#[derive(Clone)]
pub struct BackendStore {
    kv: Arc<dyn KvStore>,
    backend_id: Uuid,
}

impl BackendStore {
    pub fn new(kv: Arc<dyn KvStore>, backend_id: Uuid) -> Self {
        Self { kv, backend_id }
    }

    pub fn backend_id(&self) -> Uuid {
        self.backend_id
    }

    fn key(&self, concern: &str) -> String {
        format!("backend:{}:{}", self.backend_id, concern)
    }

    async fn load<T: DeserializeOwned>(&self, concern: &str) -> IngestResult<Option<T>> {
        let raw = self
            .kv
            .get(&self.key(concern))
            .await
            .map_err(|e| IngestError::store(format!("load {concern}: {e:#}")))?;
        match raw {
            None => Ok(None),
            Some(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| IngestError::store(format!("decode {concern}: {e}"))),
        }
    }

    async fn save<T: Serialize>(&self, concern: &str, value: &T) -> IngestResult<()> {
        let bytes = serde_json::to_vec(value)
            .map_err(|e| IngestError::store(format!("encode {concern}: {e}")))?;
        self.kv
            .set(&self.key(concern), bytes)
            .await
            .map_err(|e| IngestError::store(format!("save {concern}: {e:#}")))
    }

    async fn delete(&self, concern: &str) -> IngestResult<()> {
        self.kv
            .delete(&self.key(concern))
            .await
            .map_err(|e| IngestError::store(format!("delete {concern}: {e:#}")))
    }

    // --- auth ---

    pub async fn load_auth_token(&self) -> IngestResult<Option<AuthToken>> {
        self.load(KEY_AUTH).await
    }

    pub async fn save_auth_token(&self, token: &AuthToken) -> IngestResult<()> {
        self.save(KEY_AUTH, token).await
    }

    pub async fn clear_auth_token(&self) -> IngestResult<()> {
        self.save(KEY_AUTH, &AuthToken::cleared()).await
    }

    // --- cursor ---

    /// Empty string when no history has been consumed yet.
    pub async fn load_cursor(&self) -> IngestResult<String> {
        Ok(self.load::<String>(KEY_CURSOR).await?.unwrap_or_default())
    }

    pub async fn save_cursor(&self, cursor: &str) -> IngestResult<()> {
        self.save(KEY_CURSOR, &cursor).await
    }

    // --- timestamps ---

    pub async fn save_last_poll(&self, at: DateTime<Utc>) -> IngestResult<()> {
        self.save(KEY_LAST_POLL, &at).await
    }

    pub async fn load_last_poll(&self) -> IngestResult<Option<DateTime<Utc>>> {
        self.load(KEY_LAST_POLL).await
    }

    pub async fn save_last_success(&self, at: DateTime<Utc>) -> IngestResult<()> {
        self.save(KEY_LAST_SUCCESS, &at).await
    }

    pub async fn load_last_success(&self) -> IngestResult<Option<DateTime<Utc>>> {
        self.load(KEY_LAST_SUCCESS).await
    }

    // --- failures ---

    pub async fn load_failures(&self) -> IngestResult<u32> {
        Ok(self.load::<u32>(KEY_FAILURES).await?.unwrap_or(0))
    }

    /// Load, add one, store. Callers serialize per backend; not atomic across processes.
    pub async fn increment_failures(&self) -> IngestResult<u32> {
        let next = self.load_failures().await?.saturating_add(1);
        self.save(KEY_FAILURES, &next).await?;
        Ok(next)
    }

    pub async fn reset_failures(&self) -> IngestResult<()> {
        self.save(KEY_FAILURES, &0u32).await
    }

    pub async fn save_last_error(&self, message: &str) -> IngestResult<()> {
        self.save(KEY_LAST_ERROR, &message).await
    }

    pub async fn load_last_error(&self) -> IngestResult<String> {
        Ok(self.load::<String>(KEY_LAST_ERROR).await?.unwrap_or_default())
    }

    pub async fn clear_last_error(&self) -> IngestResult<()> {
        self.delete(KEY_LAST_ERROR).await
    }

    /// Drop every key for this backend (backend removed for good).
    pub async fn clear_all(&self) -> IngestResult<()> {
        for concern in ALL_KEYS {
            self.delete(concern).await?;
        }
        Ok(())
    }
}
