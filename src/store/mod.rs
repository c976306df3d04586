// src/store/mod.rs
//! Persistence port: a flat key/value store of byte blobs.
//!
//! Keys are namespaced per backend by [`BackendStore`]; implementations only
//! need `get`/`set`/`delete` and make no multi-key transactional promises.

pub mod backend_state;

pub use backend_state::{AuthToken, BackendStore};

use anyhow::{Context, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::Mutex;

#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;
    async fn set(&self, key: &str, value: Vec<u8>) -> Result<()>;
    async fn delete(&self, key: &str) -> Result<()>;
}

/// In-process store. Used by tests and single-node setups without a state dir.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.inner.read().keys().cloned().collect();
        keys.sort();
        keys
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.inner.read().get(key).cloned())
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> Result<()> {
        self.inner.write().insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.inner.write().remove(key);
        Ok(())
    }
}

/// JSON-document store under a state directory, rewritten atomically on each
/// mutation (temp file + rename).
pub struct FileStore {
    path: PathBuf,
    cache: Mutex<Option<HashMap<String, Vec<u8>>>>,
}

const STATE_FILE: &str = "state.json";

impl FileStore {
    pub fn new(state_dir: impl AsRef<Path>) -> Self {
        Self {
            path: state_dir.as_ref().join(STATE_FILE),
            cache: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn load(&self) -> Result<HashMap<String, Vec<u8>>> {
        match fs::read(&self.path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .with_context(|| format!("parsing state file {}", self.path.display())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(HashMap::new()),
            Err(e) => {
                Err(e).with_context(|| format!("reading state file {}", self.path.display()))
            }
        }
    }

    async fn persist(&self, map: &HashMap<String, Vec<u8>>) -> Result<()> {
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir)
                .await
                .with_context(|| format!("creating state dir {}", dir.display()))?;
        }
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec(map)?)
            .await
            .with_context(|| format!("writing {}", tmp.display()))?;
        fs::rename(&tmp, &self.path)
            .await
            .with_context(|| format!("replacing {}", self.path.display()))?;
        Ok(())
    }
}

#[async_trait]
impl KvStore for FileStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut guard = self.cache.lock().await;
        if guard.is_none() {
            *guard = Some(self.load().await?);
        }
        Ok(guard.as_ref().and_then(|m| m.get(key).cloned()))
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> Result<()> {
        let mut guard = self.cache.lock().await;
        let mut map = match guard.take() {
            Some(m) => m,
            None => self.load().await?,
        };
        map.insert(key.to_string(), value);
        let res = self.persist(&map).await;
        *guard = Some(map);
        res
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut guard = self.cache.lock().await;
        let mut map = match guard.take() {
            Some(m) => m,
            None => self.load().await?,
        };
        let existed = map.remove(key).is_some();
        let res = if existed {
            self.persist(&map).await
        } else {
            Ok(())
        };
        *guard = Some(map);
        res
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_store_roundtrip_and_delete() {
        let s = MemoryStore::new();
        assert!(s.get("a").await.unwrap().is_none());
        s.set("a", b"1".to_vec()).await.unwrap();
        assert_eq!(s.get("a").await.unwrap().as_deref(), Some(&b"1"[..]));
        s.delete("a").await.unwrap();
        assert!(s.get("a").await.unwrap().is_none());
        // deleting a missing key is not an error
        s.delete("a").await.unwrap();
    }

    #[tokio::test]
    async fn file_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let s = FileStore::new(dir.path());
            s.set("backend:x:cursor", b"\"c1\"".to_vec()).await.unwrap();
            s.set("backend:x:failures", b"2".to_vec()).await.unwrap();
            s.delete("backend:x:failures").await.unwrap();
        }
        let reopened = FileStore::new(dir.path());
        assert_eq!(
            reopened.get("backend:x:cursor").await.unwrap().as_deref(),
            Some(&b"\"c1\""[..])
        );
        assert!(reopened.get("backend:x:failures").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn corrupt_state_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(STATE_FILE), b"not json").unwrap();
        let s = FileStore::new(dir.path());
        assert!(s.get("anything").await.is_err());
    }
}
