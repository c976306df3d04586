// src/backend.rs
//! One configured ingestion source: auth + fetcher + processor + poller,
//! all sharing the backend's namespaced state.

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::config::{BackendConfig, PollerSettings};
use crate::error::{IngestError, IngestResult};
use crate::ingest::auth::AuthManager;
use crate::ingest::dedup::Deduplicator;
use crate::ingest::fetcher::{AlertFetcher, ApiFetcher};
use crate::ingest::poller::{DisableCallback, Poller, PollerDeps, PollerPhase, PollerStatus};
use crate::ingest::processor::AlertProcessor;
use crate::ingest::scheduler::JobScheduler;
use crate::notify::AlertSink;
use crate::store::{BackendStore, KvStore};

/// Lifecycle surface the registry manages.
#[async_trait]
pub trait BackendInstance: Send + Sync {
    fn id(&self) -> Uuid;
    fn name(&self) -> &str;
    /// Flip the live enabled flag. Does not start or stop anything.
    fn set_enabled(&self, enabled: bool);
    async fn start(&self) -> IngestResult<()>;
    async fn stop(&self) -> IngestResult<()>;
    async fn status(&self) -> BackendStatus;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Health {
    Healthy,
    Degraded,
    Disabled,
}

#[derive(Debug, Clone, Serialize)]
pub struct BackendStatus {
    pub id: Uuid,
    pub name: String,
    pub enabled: bool,
    pub health: Health,
    #[serde(flatten)]
    pub poller: PollerStatus,
}

impl BackendStatus {
    pub fn from_parts(id: Uuid, name: &str, enabled: bool, poller: PollerStatus) -> Self {
        let health = if !enabled || poller.phase == PollerPhase::Disabled {
            Health::Disabled
        } else if poller.consecutive_failures > 0 {
            Health::Degraded
        } else {
            Health::Healthy
        };
        Self {
            id,
            name: name.to_string(),
            enabled,
            health,
            poller,
        }
    }
}

/// Shared collaborators handed to every backend.
#[derive(Clone)]
pub struct BackendDeps {
    pub kv: Arc<dyn KvStore>,
    pub scheduler: Arc<dyn JobScheduler>,
    pub sink: Arc<dyn AlertSink>,
    pub disable: Option<Arc<dyn DisableCallback>>,
    pub settings: PollerSettings,
}

pub struct Backend {
    config: BackendConfig,
    enabled: AtomicBool,
    settings: PollerSettings,
    store: BackendStore,
    auth: Option<Arc<AuthManager>>,
    dedup: Arc<Deduplicator>,
    poller: Poller,
}

impl Backend {
    /// Wire the HTTP client, auth manager and fetcher for the configured API.
    /// Must be called within a tokio runtime (the dedup sweep is spawned here).
    pub fn new(config: BackendConfig, deps: BackendDeps) -> IngestResult<Self> {
        let http = Client::builder()
            .user_agent(concat!("alert-ingestor/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(Duration::from_secs(10))
            .timeout(deps.settings.http_timeout)
            .build()
            .map_err(|e| IngestError::InvalidConfig(format!("http client: {e}")))?;

        let store = BackendStore::new(deps.kv.clone(), config.id);
        let auth = Arc::new(AuthManager::new(
            http.clone(),
            &config.url,
            config.api_id.clone(),
            config.api_key.clone(),
            store.clone(),
        ));
        let fetcher = Arc::new(ApiFetcher::new(http, &config.url, auth.clone()));
        Ok(Self::assemble(config, deps, store, Some(auth), fetcher))
    }

    /// Same composition with a caller-supplied fetcher (no auth manager).
    pub fn with_fetcher(
        config: BackendConfig,
        deps: BackendDeps,
        fetcher: Arc<dyn AlertFetcher>,
    ) -> Self {
        let store = BackendStore::new(deps.kv.clone(), config.id);
        Self::assemble(config, deps, store, None, fetcher)
    }

    fn assemble(
        config: BackendConfig,
        deps: BackendDeps,
        store: BackendStore,
        auth: Option<Arc<AuthManager>>,
        fetcher: Arc<dyn AlertFetcher>,
    ) -> Self {
        let settings = deps.settings;
        let dedup = Arc::new(Deduplicator::spawn(
            settings.dedup_ttl,
            settings.dedup_sweep_interval,
        ));
        let processor = Arc::new(AlertProcessor::new(
            config.name.clone(),
            config.id.to_string(),
            config.destination_id.clone(),
            dedup.clone(),
            deps.sink,
        ));
        let poller = Poller::new(
            config.id,
            config.name.clone(),
            config.poll_interval(),
            settings,
            PollerDeps {
                fetcher,
                processor,
                store: store.clone(),
                scheduler: deps.scheduler,
                disable: deps.disable,
            },
        );
        Self {
            enabled: AtomicBool::new(config.enabled),
            config,
            settings,
            store,
            auth,
            dedup,
            poller,
        }
    }

    pub fn config(&self) -> &BackendConfig {
        &self.config
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn poller(&self) -> &Poller {
        &self.poller
    }

    pub fn deduplicator(&self) -> &Arc<Deduplicator> {
        &self.dedup
    }

    /// Diagnostics: force re-authentication on the next fetch.
    pub async fn clear_cached_token(&self) -> IngestResult<()> {
        match &self.auth {
            Some(auth) => auth.clear_cached_token().await,
            None => self.store.clear_auth_token().await,
        }
    }

    /// Drop all persisted state; for backends being deleted for good.
    pub async fn purge_state(&self) -> IngestResult<()> {
        self.store.clear_all().await
    }
}

#[async_trait]
impl BackendInstance for Backend {
    fn id(&self) -> Uuid {
        self.config.id
    }

    fn name(&self) -> &str {
        &self.config.name
    }

    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    async fn start(&self) -> IngestResult<()> {
        if !self.is_enabled() {
            tracing::info!(target: "backend", backend = %self.config.name, "backend disabled; not starting");
            return Ok(());
        }
        self.dedup.start_sweeper(self.settings.dedup_sweep_interval);
        self.poller.start().await?;
        tracing::info!(
            target: "backend",
            backend = %self.config.name,
            backend_id = %self.config.id,
            destination = %self.config.destination_id,
            "backend started"
        );
        Ok(())
    }

    async fn stop(&self) -> IngestResult<()> {
        let res = self.poller.stop();
        self.dedup.stop().await;
        tracing::info!(target: "backend", backend = %self.config.name, "backend stopped");
        res
    }

    async fn status(&self) -> BackendStatus {
        let poller = self.poller.status().await;
        BackendStatus::from_parts(self.config.id, &self.config.name, self.is_enabled(), poller)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::fetcher::ScriptedFetcher;
    use crate::ingest::scheduler::ManualScheduler;
    use crate::notify::RecordingSink;
    use crate::store::MemoryStore;

    fn deps(kv: Arc<MemoryStore>, scheduler: ManualScheduler) -> BackendDeps {
        BackendDeps {
            kv,
            scheduler: Arc::new(scheduler),
            sink: Arc::new(RecordingSink::new()),
            disable: None,
            settings: PollerSettings::default(),
        }
    }

    fn config() -> BackendConfig {
        BackendConfig::new("primary", "https://api.example.com")
            .with_credentials("id", "key")
            .with_destination("alerts")
    }

    #[tokio::test]
    async fn disabled_backend_does_not_start() {
        let kv = Arc::new(MemoryStore::new());
        let mut cfg = config();
        cfg.enabled = false;
        let b = Backend::with_fetcher(cfg, deps(kv, ManualScheduler::new()), Arc::new(ScriptedFetcher::default()));
        b.start().await.unwrap();
        assert!(!b.poller().is_running());
        let st = b.status().await;
        assert_eq!(st.health, Health::Disabled);
        b.stop().await.unwrap();
    }

    #[tokio::test]
    async fn start_with_cursor_registers_job_and_stop_halts_sweep() {
        let kv = Arc::new(MemoryStore::new());
        let cfg = config();
        BackendStore::new(kv.clone(), cfg.id).save_cursor("c0").await.unwrap();
        let sched = ManualScheduler::new();
        let b = Backend::with_fetcher(cfg, deps(kv, sched.clone()), Arc::new(ScriptedFetcher::default()));

        b.start().await.unwrap();
        assert_eq!(sched.active_count(), 1);
        assert!(b.deduplicator().is_sweeping());

        b.stop().await.unwrap();
        assert_eq!(sched.active_count(), 0);
        assert!(!b.deduplicator().is_sweeping());
        let st = b.status().await;
        assert_eq!(st.health, Health::Healthy);
        assert!(st.poller.has_cursor);
    }

    #[tokio::test]
    async fn disabled_flag_blocks_restart() {
        let kv = Arc::new(MemoryStore::new());
        let cfg = config();
        BackendStore::new(kv.clone(), cfg.id).save_cursor("c0").await.unwrap();
        let sched = ManualScheduler::new();
        let b = Backend::with_fetcher(cfg, deps(kv, sched.clone()), Arc::new(ScriptedFetcher::default()));

        b.set_enabled(false);
        b.start().await.unwrap();
        assert_eq!(sched.scheduled_count(), 0);
        assert!(!b.status().await.enabled);

        b.set_enabled(true);
        b.start().await.unwrap();
        assert_eq!(sched.active_count(), 1);
        b.stop().await.unwrap();
    }

    #[test]
    fn health_reflects_failures() {
        let poller = PollerStatus {
            phase: PollerPhase::Polling,
            running: true,
            consecutive_failures: 2,
            last_error: "fetch alerts: boom".into(),
            last_poll: None,
            last_success: None,
            has_cursor: true,
        };
        let st = BackendStatus::from_parts(Uuid::new_v4(), "b", true, poller);
        assert_eq!(st.health, Health::Degraded);
    }
}
