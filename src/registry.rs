// src/registry.rs
//! Thread-safe map of running backends keyed by id.

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Weak};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::backend::{BackendInstance, BackendStatus};
use crate::config::set_backend_enabled;
use crate::error::{IngestError, IngestResult};
use crate::ingest::poller::DisableCallback;

#[derive(Default)]
pub struct Registry {
    backends: RwLock<HashMap<Uuid, Arc<dyn BackendInstance>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a backend. Does not start it.
    pub async fn register(&self, backend: Arc<dyn BackendInstance>) -> IngestResult<()> {
        let id = backend.id();
        if id.is_nil() {
            return Err(IngestError::InvalidConfig(
                "backend id must not be nil".to_string(),
            ));
        }
        let mut map = self.backends.write().await;
        if map.contains_key(&id) {
            return Err(IngestError::Duplicate(id.to_string()));
        }
        map.insert(id, backend);
        tracing::debug!(target: "registry", backend_id = %id, "backend registered");
        Ok(())
    }

    /// Remove and stop. The entry is gone even when stopping fails; the stop
    /// error is still reported.
    pub async fn unregister(&self, id: Uuid) -> IngestResult<()> {
        let removed = self.backends.write().await.remove(&id);
        let Some(backend) = removed else {
            return Err(IngestError::NotFound(id.to_string()));
        };
        tracing::info!(target: "registry", backend = %backend.name(), backend_id = %id, "backend unregistered");
        backend.stop().await
    }

    pub async fn get(&self, id: Uuid) -> Option<Arc<dyn BackendInstance>> {
        self.backends.read().await.get(&id).cloned()
    }

    pub async fn get_by_name(&self, name: &str) -> Option<Arc<dyn BackendInstance>> {
        self.backends
            .read()
            .await
            .values()
            .find(|b| b.name().eq_ignore_ascii_case(name))
            .cloned()
    }

    /// Snapshot ordered by name.
    pub async fn list(&self) -> Vec<Arc<dyn BackendInstance>> {
        let mut all: Vec<_> = self.backends.read().await.values().cloned().collect();
        all.sort_by(|a, b| a.name().cmp(b.name()));
        all
    }

    pub async fn count(&self) -> usize {
        self.backends.read().await.len()
    }

    pub async fn statuses(&self) -> Vec<BackendStatus> {
        let mut out = Vec::new();
        for b in self.list().await {
            out.push(b.status().await);
        }
        out
    }

    /// Stop everything, then empty the map. Stop errors are logged, not returned.
    pub async fn stop_all(&self) {
        let mut map = self.backends.write().await;
        for (id, backend) in map.iter() {
            if let Err(e) = backend.stop().await {
                tracing::warn!(target: "registry", backend_id = %id, error = %e, "failed to stop backend");
            }
        }
        let stopped = map.len();
        map.clear();
        tracing::info!(target: "registry", stopped, "all backends stopped");
    }

    /// Callback for pollers: persist `enabled = false`, then stop the backend.
    /// It stays registered so its status remains visible.
    pub fn disable_callback(self: &Arc<Self>, writer: Arc<dyn ConfigWriter>) -> Arc<dyn DisableCallback> {
        Arc::new(RegistryDisable {
            registry: Arc::downgrade(self),
            writer,
        })
    }
}

/// Durable backend configuration updates.
#[async_trait]
pub trait ConfigWriter: Send + Sync {
    async fn set_enabled(&self, backend_id: Uuid, enabled: bool) -> IngestResult<()>;
}

/// Rewrites the config file the process was started from.
pub struct FileConfigWriter {
    path: PathBuf,
}

impl FileConfigWriter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl ConfigWriter for FileConfigWriter {
    async fn set_enabled(&self, backend_id: Uuid, enabled: bool) -> IngestResult<()> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || set_backend_enabled(&path, backend_id, enabled))
            .await
            .map_err(|e| IngestError::Disable {
                backend_id: backend_id.to_string(),
                message: e.to_string(),
            })?
            .map_err(|e| IngestError::Disable {
                backend_id: backend_id.to_string(),
                message: format!("{e:#}"),
            })
    }
}

/// Writer for deployments without a config file; the disable lasts until restart.
#[derive(Debug, Default)]
pub struct NoopConfigWriter;

#[async_trait]
impl ConfigWriter for NoopConfigWriter {
    async fn set_enabled(&self, backend_id: Uuid, enabled: bool) -> IngestResult<()> {
        tracing::warn!(target: "registry", %backend_id, enabled, "no config file; change not persisted");
        Ok(())
    }
}

struct RegistryDisable {
    registry: Weak<Registry>,
    writer: Arc<dyn ConfigWriter>,
}

#[async_trait]
impl DisableCallback for RegistryDisable {
    async fn disable(&self, backend_id: Uuid) -> IngestResult<()> {
        self.writer.set_enabled(backend_id, false).await?;
        let Some(registry) = self.registry.upgrade() else {
            return Ok(());
        };
        let Some(backend) = registry.get(backend_id).await else {
            return Ok(());
        };
        backend.set_enabled(false);
        tracing::warn!(target: "registry", backend = %backend.name(), %backend_id, "backend auto-disabled");
        backend.stop().await
    }
}
