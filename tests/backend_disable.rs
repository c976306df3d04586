// tests/backend_disable.rs
//
// Full auto-disable path: a backend keeps failing, its poller escalates, the
// registry callback rewrites the config file and stops the backend, which
// stays visible through the status API.

use std::fs;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value as Json;
use shuttle_axum::axum::{
    body::{self, Body},
    http::{Request, StatusCode},
};
use tower::ServiceExt as _;

use alert_ingestor::api::{self, AppState};
use alert_ingestor::backend::{Backend, BackendDeps, BackendInstance, Health};
use alert_ingestor::config::{load_config_from, PollerSettings};
use alert_ingestor::error::IngestError;
use alert_ingestor::ingest::fetcher::ScriptedFetcher;
use alert_ingestor::ingest::poller::job_id;
use alert_ingestor::ingest::scheduler::ManualScheduler;
use alert_ingestor::notify::RecordingSink;
use alert_ingestor::registry::{FileConfigWriter, Registry};
use alert_ingestor::store::{BackendStore, MemoryStore};

const CONFIG: &str = r#"{
  "max_consecutive_failures": 3,
  "backends": [
    {
      "id": "0b7e6f8e-3a64-4c55-a0c4-6f0f2f1d9b21",
      "name": "flaky",
      "type": "alert_api",
      "url": "https://api.example.com",
      "api_id": "client",
      "api_key": "ENV:FLAKY_BACKEND_KEY",
      "destination_id": "alerts"
    }
  ]
}"#;

#[tokio::test]
async fn repeated_failures_persist_disable_and_keep_status_visible() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ingestor.json");
    fs::write(&path, CONFIG).unwrap();
    std::env::set_var("FLAKY_BACKEND_KEY", "s3cret");

    let cfg = load_config_from(&path).unwrap();
    let backend_cfg = cfg.backends[0].clone();
    assert_eq!(backend_cfg.api_key, "s3cret");

    let registry = Arc::new(Registry::new());
    let kv = Arc::new(MemoryStore::new());
    let scheduler = ManualScheduler::new();
    let settings = PollerSettings {
        max_consecutive_failures: cfg.max_consecutive_failures,
        ..PollerSettings::default()
    };
    let fetcher = Arc::new(ScriptedFetcher::new(
        (0..3)
            .map(|_| Err(IngestError::Server { status: 502, message: "bad gateway".into() }))
            .collect(),
    ));
    let deps = BackendDeps {
        kv: kv.clone(),
        scheduler: Arc::new(scheduler.clone()),
        sink: Arc::new(RecordingSink::new()),
        disable: Some(registry.disable_callback(Arc::new(FileConfigWriter::new(&path)))),
        settings,
    };
    let backend = Arc::new(Backend::with_fetcher(backend_cfg.clone(), deps, fetcher));
    BackendStore::new(kv.clone(), backend_cfg.id)
        .save_cursor("c0")
        .await
        .unwrap();
    registry.register(backend.clone()).await.unwrap();
    backend.start().await.unwrap();

    let id = job_id(backend_cfg.id);
    assert!(scheduler.trigger(&id).await);
    assert!(scheduler.trigger(&id).await);
    assert_eq!(backend.status().await.health, Health::Degraded);
    assert!(scheduler.trigger(&id).await);

    for _ in 0..200 {
        if !backend.status().await.enabled {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(!backend.status().await.enabled);
    assert!(registry.get(backend_cfg.id).await.is_some());
    assert!(!scheduler.trigger(&id).await);
    assert_eq!(backend.status().await.health, Health::Disabled);

    let app = api::router(AppState {
        registry: registry.clone(),
    });
    let req = Request::builder()
        .method("GET")
        .uri(format!("/backends/{}", backend_cfg.id))
        .body(Body::empty())
        .unwrap();
    let resp = app.oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let bytes = body::to_bytes(resp.into_body(), 1024 * 1024).await.unwrap();
    let json: Json = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(json["health"], "disabled");
    assert_eq!(json["enabled"], false);
    assert_eq!(json["consecutive_failures"], 3);
    assert!(!json["last_error"].as_str().unwrap_or_default().is_empty());

    // persisted with the secret reference left intact
    let raw = fs::read_to_string(&path).unwrap();
    assert!(raw.contains("ENV:FLAKY_BACKEND_KEY"));
    let reloaded = load_config_from(&path).unwrap();
    assert!(!reloaded.backends[0].enabled);

    std::env::remove_var("FLAKY_BACKEND_KEY");
}
