//! Alert ingestor binary entrypoint.
//! Loads config, registers every configured backend, starts the enabled ones
//! and serves status routes.

use anyhow::Context;
use std::sync::Arc;

use alert_ingestor::{
    api::{self, AppState},
    backend::{Backend, BackendDeps, BackendInstance},
    config::load_config_default,
    ingest::scheduler::LocalScheduler,
    metrics::Metrics,
    notify::{AlertSink, LogSink, WebhookSink},
    registry::{ConfigWriter, FileConfigWriter, NoopConfigWriter, Registry},
    store::FileStore,
};
use shuttle_axum::ShuttleAxum;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const DEFAULT_FILTER: &str =
    "ingest=info,poller=info,backend=info,registry=info,auth=info,sink=info,warn";

/// Compact logs by default; `ALERT_INGESTOR_LOG_JSON=1` switches to JSON lines.
fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let json = std::env::var("ALERT_INGESTOR_LOG_JSON")
        .ok()
        .is_some_and(|v| v == "1");

    // try_init: the shuttle runtime may already have installed a subscriber
    let res = if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().compact())
            .try_init()
    };
    if res.is_err() {
        tracing::debug!("tracing subscriber already installed");
    }
}

#[shuttle_runtime::main]
async fn axum() -> ShuttleAxum {
    // Load .env in local/dev; no-op in prod environments.
    let _ = dotenvy::dotenv();
    init_tracing();

    let metrics = Metrics::init()?;
    let (cfg, cfg_path) = load_config_default()?;
    tracing::info!(
        target: "ingest",
        backends = cfg.backends.len(),
        config = ?cfg_path,
        "configuration loaded"
    );

    let kv = Arc::new(FileStore::new(&cfg.state_dir));
    let sink: Arc<dyn AlertSink> = match &cfg.webhook_url {
        Some(url) => Arc::new(WebhookSink::new(url.clone())),
        None => {
            tracing::warn!(target: "ingest", "no webhook_url configured; alerts will only be logged");
            Arc::new(LogSink)
        }
    };
    let writer: Arc<dyn ConfigWriter> = match &cfg_path {
        Some(path) => Arc::new(FileConfigWriter::new(path.clone())),
        None => Arc::new(NoopConfigWriter),
    };

    let registry = Arc::new(Registry::new());
    let deps = BackendDeps {
        kv,
        scheduler: Arc::new(LocalScheduler::new()),
        sink,
        disable: Some(registry.disable_callback(writer)),
        settings: cfg.poller_settings(),
    };

    // Disabled backends are registered too so their status stays queryable.
    for backend_cfg in &cfg.backends {
        let backend = Arc::new(
            Backend::new(backend_cfg.clone(), deps.clone())
                .with_context(|| format!("building backend {}", backend_cfg.name))?,
        );
        registry
            .register(backend.clone())
            .await
            .with_context(|| format!("registering backend {}", backend_cfg.name))?;
        if let Err(e) = backend.start().await {
            tracing::error!(
                target: "ingest",
                backend = %backend_cfg.name,
                error = %e,
                "failed to start backend"
            );
        }
    }
    let registered = registry.count().await;
    let enabled = cfg.backends.iter().filter(|b| b.enabled).count();
    tracing::info!(target: "ingest", registered, enabled, "backends started");

    let router = api::router(AppState { registry }).merge(metrics.router());
    Ok(router.into())
}
