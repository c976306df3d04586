// src/ingest/poller.rs
//! Poll orchestration for one backend.
//!
//! ```text
//! Idle ──start, no cursor──▶ CatchingUp ──recent page──▶ Polling
//!   │                            │ fetch error               │ N failures
//!   └──start, cursor──▶ Polling  ▼                           ▼
//!                              Idle                       Disabled
//! ```
//!
//! Catch-up walks the cursor forward past historical alerts without
//! delivering any of them, then hands over to the scheduler-driven job.
//! Each failed cycle increments the persisted failure counter; reaching
//! `max_consecutive_failures` halts the poller and fires the disable callback.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use metrics::{counter, gauge};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::PollerSettings;
use crate::error::{IngestError, IngestResult};
use crate::ingest::fetcher::AlertFetcher;
use crate::ingest::processor::AlertProcessor;
use crate::ingest::scheduler::{JobHandle, JobScheduler, ScheduledJob};
use crate::store::BackendStore;

/// Persists `enabled = false` for a backend that kept failing.
#[async_trait]
pub trait DisableCallback: Send + Sync {
    async fn disable(&self, backend_id: Uuid) -> IngestResult<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PollerPhase {
    Idle,
    CatchingUp,
    Polling,
    Disabled,
}

/// Operator-facing snapshot. Store read failures show up as defaults.
#[derive(Debug, Clone, Serialize)]
pub struct PollerStatus {
    pub phase: PollerPhase,
    pub running: bool,
    pub consecutive_failures: u32,
    pub last_error: String,
    pub last_poll: Option<DateTime<Utc>>,
    pub last_success: Option<DateTime<Utc>>,
    pub has_cursor: bool,
}

/// Time until the next run: zero before the first run, otherwise what is
/// left of `poll_interval` since the previous run finished, never negative.
pub fn next_wait_interval(
    poll_interval: Duration,
    now: DateTime<Utc>,
    last_finished: Option<DateTime<Utc>>,
) -> Duration {
    let Some(last) = last_finished else {
        return Duration::ZERO;
    };
    let elapsed = (now - last).to_std().unwrap_or(Duration::ZERO);
    poll_interval.saturating_sub(elapsed)
}

pub fn job_id(backend_id: Uuid) -> String {
    format!("alert_poll_{backend_id}")
}

pub struct PollerDeps {
    pub fetcher: Arc<dyn AlertFetcher>,
    pub processor: Arc<AlertProcessor>,
    pub store: BackendStore,
    pub scheduler: Arc<dyn JobScheduler>,
    pub disable: Option<Arc<dyn DisableCallback>>,
}

struct Runtime {
    job: Option<Box<dyn JobHandle>>,
    catchup: Option<CancellationToken>,
    phase: PollerPhase,
}

struct PollerInner {
    backend_id: Uuid,
    backend_name: String,
    poll_interval: Duration,
    settings: PollerSettings,
    fetcher: Arc<dyn AlertFetcher>,
    processor: Arc<AlertProcessor>,
    store: BackendStore,
    scheduler: Arc<dyn JobScheduler>,
    disable: Option<Arc<dyn DisableCallback>>,
    runtime: Mutex<Runtime>,
}

pub struct Poller {
    inner: Arc<PollerInner>,
}

/// Scheduler-facing job. Weak so a forgotten handle never keeps the poller alive.
struct PollJob {
    inner: Weak<PollerInner>,
    poll_interval: Duration,
}

#[async_trait]
impl ScheduledJob for PollJob {
    fn next_wait(&self, now: DateTime<Utc>, last_finished: Option<DateTime<Utc>>) -> Duration {
        next_wait_interval(self.poll_interval, now, last_finished)
    }

    async fn run(&self) {
        if let Some(inner) = self.inner.upgrade() {
            inner.run_cycle().await;
        }
    }
}

impl Poller {
    pub fn new(
        backend_id: Uuid,
        backend_name: impl Into<String>,
        poll_interval: Duration,
        settings: PollerSettings,
        deps: PollerDeps,
    ) -> Self {
        Self {
            inner: Arc::new(PollerInner {
                backend_id,
                backend_name: backend_name.into(),
                poll_interval,
                settings,
                fetcher: deps.fetcher,
                processor: deps.processor,
                store: deps.store,
                scheduler: deps.scheduler,
                disable: deps.disable,
                runtime: Mutex::new(Runtime {
                    job: None,
                    catchup: None,
                    phase: PollerPhase::Idle,
                }),
            }),
        }
    }

    pub fn backend_id(&self) -> Uuid {
        self.inner.backend_id
    }

    /// Begin catch-up (no cursor persisted) or regular polling. Never blocks
    /// on catch-up; fails if a job or catch-up is already active.
    pub async fn start(&self) -> IngestResult<()> {
        let inner = &self.inner;
        if inner.is_active() {
            return Err(IngestError::AlreadyRunning(inner.backend_name.clone()));
        }
        let cursor = inner.store.load_cursor().await?;

        let mut rt = inner.runtime.lock();
        if rt.job.is_some() || rt.catchup.is_some() {
            return Err(IngestError::AlreadyRunning(inner.backend_name.clone()));
        }

        if cursor.is_empty() {
            let token = CancellationToken::new();
            rt.catchup = Some(token.clone());
            rt.phase = PollerPhase::CatchingUp;
            drop(rt);

            tracing::info!(
                target: "poller",
                backend = %inner.backend_name,
                "no cursor persisted; starting catch-up"
            );
            let task_inner = inner.clone();
            tokio::spawn(async move { task_inner.catch_up(token).await });
        } else {
            inner.schedule_job(&mut rt)?;
            tracing::info!(
                target: "poller",
                backend = %inner.backend_name,
                interval_secs = inner.poll_interval.as_secs(),
                "polling started"
            );
        }
        Ok(())
    }

    /// Cancel catch-up and close the job handle. Stopping a stopped poller is a no-op.
    pub fn stop(&self) -> IngestResult<()> {
        let mut rt = self.inner.runtime.lock();
        let next = if rt.phase == PollerPhase::Disabled {
            PollerPhase::Disabled
        } else {
            PollerPhase::Idle
        };
        self.inner.halt(&mut rt, next)
    }

    /// One regular poll cycle, exactly as the scheduler would run it.
    pub async fn run_once(&self) {
        self.inner.run_cycle().await;
    }

    pub fn next_wait_interval(&self, now: DateTime<Utc>, last_finished: Option<DateTime<Utc>>) -> Duration {
        next_wait_interval(self.inner.poll_interval, now, last_finished)
    }

    pub fn phase(&self) -> PollerPhase {
        self.inner.runtime.lock().phase
    }

    pub fn has_job(&self) -> bool {
        self.inner.runtime.lock().job.is_some()
    }

    pub fn is_running(&self) -> bool {
        self.inner.is_active()
    }

    pub async fn status(&self) -> PollerStatus {
        let inner = &self.inner;
        let (phase, running) = {
            let rt = inner.runtime.lock();
            (rt.phase, rt.job.is_some() || rt.catchup.is_some())
        };
        PollerStatus {
            phase,
            running,
            consecutive_failures: inner.read_or_default("failures", inner.store.load_failures()).await,
            last_error: inner.read_or_default("last error", inner.store.load_last_error()).await,
            last_poll: inner.read_or_default("last poll", inner.store.load_last_poll()).await,
            last_success: inner
                .read_or_default("last success", inner.store.load_last_success())
                .await,
            has_cursor: !inner
                .read_or_default("cursor", inner.store.load_cursor())
                .await
                .is_empty(),
        }
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        let mut rt = self.inner.runtime.lock();
        if rt.job.is_some() || rt.catchup.is_some() {
            let _ = self.inner.halt(&mut rt, PollerPhase::Idle);
        }
    }
}

impl PollerInner {
    fn is_active(&self) -> bool {
        let rt = self.runtime.lock();
        rt.job.is_some() || rt.catchup.is_some()
    }

    fn schedule_job(self: &Arc<Self>, rt: &mut Runtime) -> IngestResult<()> {
        let job = Arc::new(PollJob {
            inner: Arc::downgrade(self),
            poll_interval: self.poll_interval,
        });
        let handle = self.scheduler.schedule(&job_id(self.backend_id), job)?;
        rt.job = Some(handle);
        rt.phase = PollerPhase::Polling;
        Ok(())
    }

    fn halt(&self, rt: &mut Runtime, next: PollerPhase) -> IngestResult<()> {
        if let Some(token) = rt.catchup.take() {
            token.cancel();
        }
        let closed = match rt.job.take() {
            Some(job) => job.close(),
            None => Ok(()),
        };
        rt.phase = next;
        if let Err(e) = &closed {
            tracing::warn!(target: "poller", backend = %self.backend_name, error = %e, "failed to close poll job");
        }
        closed
    }

    async fn catch_up(self: Arc<Self>, token: CancellationToken) {
        let mut cursor = String::new();
        let mut pages = 0usize;

        loop {
            if token.is_cancelled() {
                tracing::info!(target: "poller", backend = %self.backend_name, pages, "catch-up cancelled");
                return;
            }

            let now = Utc::now();
            self.record_last_poll(now).await;

            let page = match self.fetcher.fetch_alerts(&cursor).await {
                Ok(page) => page,
                Err(e) => {
                    self.handle_failure(IngestError::stage("catch-up fetch", e)).await;
                    self.abort_catchup(&token);
                    return;
                }
            };
            pages += 1;

            let advanced = !page.cursor.is_empty() && page.cursor != cursor;
            if advanced {
                if let Err(e) = self.store.save_cursor(&page.cursor).await {
                    self.handle_failure(IngestError::stage("catch-up save cursor", e)).await;
                    self.abort_catchup(&token);
                    return;
                }
                cursor = page.cursor.clone();
            }
            self.record_success(Utc::now()).await;

            let cutoff = now
                - ChronoDuration::from_std(self.settings.catchup_recency_window)
                    .unwrap_or_else(|_| ChronoDuration::hours(24));
            let reached_recent = page.alerts.is_empty()
                || page
                    .alerts
                    .iter()
                    .any(|a| a.event_time().is_some_and(|t| t >= cutoff));

            if reached_recent || !advanced {
                tracing::info!(
                    target: "poller",
                    backend = %self.backend_name,
                    pages,
                    skipped = page.alerts.len(),
                    "catch-up complete"
                );
                self.complete_catchup(&token);
                return;
            }

            tracing::debug!(
                target: "poller",
                backend = %self.backend_name,
                pages,
                skipped = page.alerts.len(),
                "catch-up page skipped; continuing"
            );
            tokio::select! {
                _ = token.cancelled() => {
                    tracing::info!(target: "poller", backend = %self.backend_name, pages, "catch-up cancelled");
                    return;
                }
                _ = tokio::time::sleep(self.settings.catchup_page_delay) => {}
            }
        }
    }

    fn complete_catchup(self: &Arc<Self>, token: &CancellationToken) {
        let mut rt = self.runtime.lock();
        // stop() cancels under this same lock
        if token.is_cancelled() {
            return;
        }
        rt.catchup = None;
        if let Err(e) = self.schedule_job(&mut rt) {
            rt.phase = PollerPhase::Idle;
            tracing::error!(
                target: "poller",
                backend = %self.backend_name,
                error = %e,
                "failed to register poll job after catch-up"
            );
        }
    }

    fn abort_catchup(&self, token: &CancellationToken) {
        let mut rt = self.runtime.lock();
        if token.is_cancelled() {
            return;
        }
        rt.catchup = None;
        rt.phase = PollerPhase::Idle;
    }

    async fn run_cycle(&self) {
        counter!("poll_cycles_total").increment(1);
        match self.poll_once().await {
            Ok(delivered) => {
                tracing::debug!(target: "poller", backend = %self.backend_name, delivered, "poll cycle ok");
            }
            Err(e) => self.handle_failure(e).await,
        }
    }

    async fn poll_once(&self) -> IngestResult<usize> {
        self.record_last_poll(Utc::now()).await;

        let cursor = self
            .store
            .load_cursor()
            .await
            .map_err(|e| IngestError::stage("load cursor", e))?;
        let page = self
            .fetcher
            .fetch_alerts(&cursor)
            .await
            .map_err(|e| IngestError::stage("fetch alerts", e))?;
        let delivered = self
            .processor
            .process_alerts(&page.alerts)
            .await
            .map_err(|e| IngestError::stage("process alerts", e))?;
        if !page.cursor.is_empty() && page.cursor != cursor {
            self.store
                .save_cursor(&page.cursor)
                .await
                .map_err(|e| IngestError::stage("save cursor", e))?;
        }

        self.record_success(Utc::now()).await;
        Ok(delivered)
    }

    async fn record_last_poll(&self, at: DateTime<Utc>) {
        if let Err(e) = self.store.save_last_poll(at).await {
            tracing::warn!(target: "poller", backend = %self.backend_name, error = %e, "failed to save last poll time");
        }
    }

    async fn record_success(&self, at: DateTime<Utc>) {
        gauge!("poll_last_success_ts").set(at.timestamp() as f64);
        if let Err(e) = self.store.save_last_success(at).await {
            tracing::warn!(target: "poller", backend = %self.backend_name, error = %e, "failed to save last success time");
        }
        if let Err(e) = self.store.reset_failures().await {
            tracing::warn!(target: "poller", backend = %self.backend_name, error = %e, "failed to reset failure counter");
        }
        if let Err(e) = self.store.clear_last_error().await {
            tracing::warn!(target: "poller", backend = %self.backend_name, error = %e, "failed to clear last error");
        }
    }

    async fn handle_failure(&self, err: IngestError) {
        counter!("poll_failures_total").increment(1);
        let message = err.to_string();
        tracing::warn!(target: "poller", backend = %self.backend_name, error = %message, "poll failed");

        if let Err(e) = self.store.save_last_error(&message).await {
            tracing::warn!(target: "poller", backend = %self.backend_name, error = %e, "failed to save last error");
        }
        let failures = match self.store.increment_failures().await {
            Ok(n) => n,
            Err(e) => {
                tracing::error!(
                    target: "poller",
                    backend = %self.backend_name,
                    error = %e,
                    "failed to persist failure counter"
                );
                return;
            }
        };

        if failures >= self.settings.max_consecutive_failures {
            self.escalate(failures);
        }
    }

    /// Halt locally, then hand the durable disable to the callback off-task so
    /// it can call back into stop() without deadlocking.
    fn escalate(&self, failures: u32) {
        {
            let mut rt = self.runtime.lock();
            if !matches!(rt.phase, PollerPhase::Polling | PollerPhase::CatchingUp) {
                return;
            }
            let _ = self.halt(&mut rt, PollerPhase::Disabled);
        }

        counter!("backends_disabled_total").increment(1);
        tracing::error!(
            target: "poller",
            backend = %self.backend_name,
            backend_id = %self.backend_id,
            failures,
            "too many consecutive failures; disabling backend"
        );

        let Some(callback) = self.disable.clone() else {
            tracing::warn!(target: "poller", backend = %self.backend_name, "no disable callback; poller stopped locally");
            return;
        };
        let backend_id = self.backend_id;
        let name = self.backend_name.clone();
        tokio::spawn(async move {
            if let Err(e) = callback.disable(backend_id).await {
                tracing::error!(
                    target: "poller",
                    backend = %name,
                    error = %e,
                    "disable callback failed; poller remains stopped locally"
                );
            }
        });
    }

    async fn read_or_default<T: Default>(
        &self,
        what: &str,
        fut: impl std::future::Future<Output = IngestResult<T>>,
    ) -> T {
        match fut.await {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(target: "poller", backend = %self.backend_name, error = %e, "failed to read {what}");
                T::default()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t0() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2025-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn first_run_is_immediate() {
        assert_eq!(next_wait_interval(Duration::from_secs(60), t0(), None), Duration::ZERO);
    }

    #[test]
    fn wait_is_remaining_interval_and_never_negative() {
        let interval = Duration::from_secs(60);
        let last = t0();
        for elapsed in [0i64, 1, 30, 59, 60, 61, 600] {
            let now = last + ChronoDuration::seconds(elapsed);
            let wait = next_wait_interval(interval, now, Some(last));
            let expected = Duration::from_secs(60u64.saturating_sub(elapsed as u64));
            assert_eq!(wait, expected, "elapsed={elapsed}");
        }
    }

    #[test]
    fn clock_skew_does_not_exceed_interval() {
        let interval = Duration::from_secs(60);
        let now = t0();
        let last = now + ChronoDuration::seconds(5);
        assert_eq!(next_wait_interval(interval, now, Some(last)), interval);
    }

    #[test]
    fn job_id_is_namespaced_by_backend() {
        let id = Uuid::new_v4();
        assert_eq!(job_id(id), format!("alert_poll_{id}"));
    }
}
