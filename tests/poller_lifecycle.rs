// tests/poller_lifecycle.rs
//
// Poller state machine driven through the in-memory store, the scripted
// fetcher and the manual scheduler. No real timers beyond the short catch-up
// page delay; the only socket use is a refused loopback connection.
//
// Covered:
// - catch-up from an empty cursor, stopping at the first recent page
// - catch-up across N historical pages
// - start twice / stop twice
// - escalation after N failed cycles and the disable callback
// - escalation when the API host refuses connections
// - per-cycle dedup (A, A, B with B already delivered)

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use reqwest::Client;
use serde_json::json;
use uuid::Uuid;

use alert_ingestor::config::PollerSettings;
use alert_ingestor::error::{IngestError, IngestResult};
use alert_ingestor::ingest::dedup::Deduplicator;
use alert_ingestor::ingest::auth::AuthManager;
use alert_ingestor::ingest::fetcher::{AlertFetcher, ApiFetcher, ScriptedFetcher};
use alert_ingestor::ingest::poller::{job_id, DisableCallback, Poller, PollerDeps, PollerPhase};
use alert_ingestor::ingest::processor::AlertProcessor;
use alert_ingestor::ingest::scheduler::ManualScheduler;
use alert_ingestor::ingest::types::{AlertPage, RawAlert};
use alert_ingestor::notify::RecordingSink;
use alert_ingestor::store::{AuthToken, BackendStore, MemoryStore};

#[derive(Default)]
struct RecordingDisable {
    calls: Mutex<Vec<Uuid>>,
}

#[async_trait]
impl DisableCallback for RecordingDisable {
    async fn disable(&self, backend_id: Uuid) -> IngestResult<()> {
        self.calls.lock().push(backend_id);
        Ok(())
    }
}

struct Harness {
    backend_id: Uuid,
    poller: Poller,
    fetcher: Arc<ScriptedFetcher>,
    sink: Arc<RecordingSink>,
    store: BackendStore,
    scheduler: ManualScheduler,
    disable: Arc<RecordingDisable>,
}

fn settings() -> PollerSettings {
    PollerSettings {
        max_consecutive_failures: 5,
        catchup_page_delay: Duration::from_millis(5),
        ..PollerSettings::default()
    }
}

fn build_poller(
    backend_id: Uuid,
    fetcher: Arc<dyn AlertFetcher>,
    store: &BackendStore,
    sink: Arc<RecordingSink>,
    scheduler: &ManualScheduler,
    disable: Arc<RecordingDisable>,
) -> Poller {
    let dedup = Arc::new(Deduplicator::new(Duration::from_secs(3_600)));
    let processor = Arc::new(AlertProcessor::new(
        "primary",
        backend_id.to_string(),
        "alerts-channel",
        dedup,
        sink,
    ));
    Poller::new(
        backend_id,
        "primary",
        Duration::from_secs(60),
        settings(),
        PollerDeps {
            fetcher,
            processor,
            store: store.clone(),
            scheduler: Arc::new(scheduler.clone()),
            disable: Some(disable),
        },
    )
}

fn harness(script: Vec<IngestResult<AlertPage>>) -> Harness {
    let backend_id = Uuid::new_v4();
    let kv = Arc::new(MemoryStore::new());
    let store = BackendStore::new(kv, backend_id);
    let fetcher = Arc::new(ScriptedFetcher::new(script));
    let sink = Arc::new(RecordingSink::new());
    let scheduler = ManualScheduler::new();
    let disable = Arc::new(RecordingDisable::default());
    let poller = build_poller(
        backend_id,
        fetcher.clone(),
        &store,
        sink.clone(),
        &scheduler,
        disable.clone(),
    );
    Harness {
        backend_id,
        poller,
        fetcher,
        sink,
        store,
        scheduler,
        disable,
    }
}

fn alert(id: &str, age: ChronoDuration) -> RawAlert {
    RawAlert {
        alert_id: id.to_string(),
        headline: format!("headline {id}"),
        event_time: Some(json!((Utc::now() - age).timestamp_millis())),
        ..RawAlert::default()
    }
}

fn page(alerts: Vec<RawAlert>, cursor: &str) -> IngestResult<AlertPage> {
    Ok(AlertPage {
        alerts,
        cursor: cursor.to_string(),
    })
}

async fn wait_for_job(h: &Harness) {
    for _ in 0..300 {
        if h.poller.has_job() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("poll job was never registered");
}

#[tokio::test]
async fn catch_up_skips_history_and_registers_job() {
    let h = harness(vec![
        page(vec![alert("old", ChronoDuration::hours(48))], "c1"),
        page(vec![alert("recent", ChronoDuration::hours(1))], "c2"),
    ]);

    h.poller.start().await.expect("start");
    wait_for_job(&h).await;

    assert_eq!(h.fetcher.call_count(), 2);
    assert_eq!(h.fetcher.calls.lock().as_slice(), &["", "c1"]);
    assert_eq!(h.sink.count(), 0, "catch-up must not deliver");
    assert_eq!(h.store.load_cursor().await.unwrap(), "c2");
    assert_eq!(h.poller.phase(), PollerPhase::Polling);
    assert!(h.scheduler.is_active(&job_id(h.backend_id)));
    assert!(h.store.load_last_success().await.unwrap().is_some());
}

#[tokio::test]
async fn catch_up_fetches_exactly_n_pages() {
    let n = 4;
    let mut script = Vec::new();
    for i in 1..n {
        script.push(page(
            vec![alert(&format!("h{i}"), ChronoDuration::hours(72))],
            &format!("c{i}"),
        ));
    }
    script.push(page(vec![alert("now", ChronoDuration::minutes(5))], &format!("c{n}")));
    let h = harness(script);

    h.poller.start().await.unwrap();
    wait_for_job(&h).await;

    assert_eq!(h.fetcher.call_count(), n);
    assert_eq!(h.sink.count(), 0);
    assert_eq!(h.store.load_cursor().await.unwrap(), format!("c{n}"));
    assert_eq!(h.scheduler.scheduled_count(), 1);
}

#[tokio::test]
async fn start_twice_fails_and_stop_is_idempotent() {
    let h = harness(vec![]);
    h.store.save_cursor("c0").await.unwrap();

    h.poller.start().await.unwrap();
    assert!(h.poller.has_job());
    let err = h.poller.start().await.unwrap_err();
    assert!(matches!(err, IngestError::AlreadyRunning(_)));
    assert_eq!(h.scheduler.scheduled_count(), 1);

    h.poller.stop().unwrap();
    h.poller.stop().unwrap();
    assert!(!h.poller.has_job());
    assert_eq!(h.poller.phase(), PollerPhase::Idle);
    assert_eq!(h.scheduler.active_count(), 0);

    // restartable after stop
    h.poller.start().await.unwrap();
    assert!(h.poller.is_running());
    h.poller.stop().unwrap();
}

#[tokio::test]
async fn repeated_failures_disable_backend_once() {
    let failing = || -> IngestResult<AlertPage> { Err(IngestError::Parse("connection reset".into())) };
    let h = harness((0..6).map(|_| failing()).collect());
    h.store.save_cursor("c0").await.unwrap();
    h.poller.start().await.unwrap();

    let id = job_id(h.backend_id);
    for cycle in 1..=4 {
        assert!(h.scheduler.trigger(&id).await);
        assert_eq!(h.store.load_failures().await.unwrap(), cycle);
        assert!(h.poller.has_job());
    }
    assert!(h.scheduler.trigger(&id).await);
    assert_eq!(h.store.load_failures().await.unwrap(), 5);
    assert!(!h.poller.has_job());
    assert_eq!(h.poller.phase(), PollerPhase::Disabled);

    // callback runs on its own task
    for _ in 0..100 {
        if !h.disable.calls.lock().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(h.disable.calls.lock().as_slice(), &[h.backend_id]);

    // job handle closed: a sixth cycle never runs
    assert!(!h.scheduler.trigger(&id).await);
    assert_eq!(h.fetcher.call_count(), 5);

    let status = h.poller.status().await;
    assert!(!status.running);
    assert!(status.last_error.starts_with("fetch alerts:"));

    // stopping a disabled poller keeps it disabled
    h.poller.stop().unwrap();
    assert_eq!(h.poller.phase(), PollerPhase::Disabled);
}

/// Address nothing listens on: bind an ephemeral port, then release it.
fn refused_base_url() -> String {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    format!("http://127.0.0.1:{port}")
}

#[tokio::test]
async fn unreachable_api_disables_after_threshold() {
    let backend_id = Uuid::new_v4();
    let store = BackendStore::new(Arc::new(MemoryStore::new()), backend_id);
    // valid token so the alerts request itself is what fails
    store
        .save_auth_token(&AuthToken {
            token: "cached".into(),
            expiry: Utc::now() + ChronoDuration::hours(2),
        })
        .await
        .unwrap();
    store.save_cursor("c0").await.unwrap();

    let http = Client::builder()
        .timeout(Duration::from_secs(2))
        .build()
        .unwrap();
    let base = refused_base_url();
    let auth = Arc::new(AuthManager::new(
        http.clone(),
        &base,
        "client-id",
        "client-secret",
        store.clone(),
    ));
    let fetcher = Arc::new(ApiFetcher::new(http, &base, auth));
    let sink = Arc::new(RecordingSink::new());
    let scheduler = ManualScheduler::new();
    let disable = Arc::new(RecordingDisable::default());
    let poller = build_poller(
        backend_id,
        fetcher,
        &store,
        sink.clone(),
        &scheduler,
        disable.clone(),
    );
    poller.start().await.unwrap();

    let id = job_id(backend_id);
    for _ in 0..5 {
        assert!(scheduler.trigger(&id).await);
    }
    assert_eq!(store.load_failures().await.unwrap(), 5);
    assert!(!poller.has_job());
    assert_eq!(poller.phase(), PollerPhase::Disabled);

    for _ in 0..100 {
        if !disable.calls.lock().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(disable.calls.lock().as_slice(), &[backend_id]);
    assert!(!scheduler.trigger(&id).await);

    let last_error = store.load_last_error().await.unwrap();
    assert!(
        last_error.starts_with("fetch alerts: transport error"),
        "unexpected last error: {last_error}"
    );
    assert_eq!(sink.count(), 0);
}

#[tokio::test]
async fn success_resets_failure_counter() {
    let h = harness(vec![
        Err(IngestError::RateLimited("slow down".into())),
        Err(IngestError::RateLimited("slow down".into())),
        page(vec![], "c1"),
    ]);
    h.store.save_cursor("c0").await.unwrap();
    h.poller.start().await.unwrap();

    let id = job_id(h.backend_id);
    h.scheduler.trigger(&id).await;
    h.scheduler.trigger(&id).await;
    assert_eq!(h.store.load_failures().await.unwrap(), 2);
    assert!(!h.store.load_last_error().await.unwrap().is_empty());

    h.scheduler.trigger(&id).await;
    assert_eq!(h.store.load_failures().await.unwrap(), 0);
    assert_eq!(h.store.load_last_error().await.unwrap(), "");
    assert_eq!(h.store.load_cursor().await.unwrap(), "c1");
    assert!(h.disable.calls.lock().is_empty());
}

#[tokio::test]
async fn cycle_delivers_each_new_alert_once() {
    let b = alert("B", ChronoDuration::minutes(1));
    let a = alert("A", ChronoDuration::minutes(1));
    let h = harness(vec![
        page(vec![b.clone()], "c1"),
        page(vec![a.clone(), a, b], "c2"),
    ]);
    h.store.save_cursor("c0").await.unwrap();
    h.poller.start().await.unwrap();
    let id = job_id(h.backend_id);

    h.scheduler.trigger(&id).await;
    assert_eq!(h.sink.posted_ids(), vec!["B"]);

    h.scheduler.trigger(&id).await;
    assert_eq!(h.sink.posted_ids(), vec!["B", "A"]);
    assert_eq!(h.fetcher.calls.lock().as_slice(), &["c0", "c1"]);
    assert_eq!(h.store.load_cursor().await.unwrap(), "c2");
    let (_, destination) = h.sink.posted.lock()[1].clone();
    assert_eq!(destination, "alerts-channel");
}

#[tokio::test]
async fn stop_cancels_catch_up() {
    let h = harness(
        (1..=50)
            .map(|i| page(vec![alert("h", ChronoDuration::hours(96))], &format!("c{i}")))
            .collect(),
    );
    h.poller.start().await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(h.poller.phase(), PollerPhase::CatchingUp);
    assert!(matches!(
        h.poller.start().await,
        Err(IngestError::AlreadyRunning(_))
    ));

    h.poller.stop().unwrap();
    let seen = h.fetcher.call_count();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(h.fetcher.call_count() <= seen + 1);
    assert_eq!(h.poller.phase(), PollerPhase::Idle);
    assert!(!h.poller.has_job());
    assert_eq!(h.scheduler.scheduled_count(), 0);
}

#[tokio::test]
async fn catch_up_failure_returns_to_idle() {
    let h = harness(vec![Err(IngestError::Server {
        status: 503,
        message: "unavailable".into(),
    })]);
    h.poller.start().await.unwrap();
    for _ in 0..100 {
        if h.poller.phase() == PollerPhase::Idle {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(h.poller.phase(), PollerPhase::Idle);
    assert!(!h.poller.has_job());
    assert_eq!(h.store.load_failures().await.unwrap(), 1);
    assert_eq!(h.store.load_cursor().await.unwrap(), "");
}
