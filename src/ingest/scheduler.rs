// src/ingest/scheduler.rs
//! Recurring-job scheduling port.
//!
//! A deployment spanning several nodes plugs in a scheduler that holds a
//! cluster-wide lease per job id; [`LocalScheduler`] covers the single-node
//! case and [`ManualScheduler`] lets tests drive invocations by hand.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::error::{IngestError, IngestResult};

#[async_trait]
pub trait ScheduledJob: Send + Sync {
    /// How long to wait before the next invocation. `last_finished` is `None`
    /// before the first run.
    fn next_wait(&self, now: DateTime<Utc>, last_finished: Option<DateTime<Utc>>) -> Duration;

    async fn run(&self);
}

pub trait JobHandle: Send + Sync {
    /// Prevent future invocations. Does not interrupt a run in flight.
    fn close(&self) -> IngestResult<()>;
}

pub trait JobScheduler: Send + Sync {
    /// At most one invocation of `job` is active at a time for `job_id`.
    fn schedule(&self, job_id: &str, job: Arc<dyn ScheduledJob>) -> IngestResult<Box<dyn JobHandle>>;
}

/// Single-node scheduler on top of tokio tasks.
#[derive(Default, Clone)]
pub struct LocalScheduler {
    active: Arc<Mutex<HashSet<String>>>,
}

impl LocalScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_active(&self, job_id: &str) -> bool {
        self.active.lock().contains(job_id)
    }
}

struct LocalJobHandle {
    job_id: String,
    token: CancellationToken,
    active: Arc<Mutex<HashSet<String>>>,
}

impl JobHandle for LocalJobHandle {
    fn close(&self) -> IngestResult<()> {
        self.token.cancel();
        self.active.lock().remove(&self.job_id);
        Ok(())
    }
}

impl JobScheduler for LocalScheduler {
    fn schedule(&self, job_id: &str, job: Arc<dyn ScheduledJob>) -> IngestResult<Box<dyn JobHandle>> {
        if !self.active.lock().insert(job_id.to_string()) {
            return Err(IngestError::AlreadyRunning(job_id.to_string()));
        }

        let token = CancellationToken::new();
        let child = token.clone();
        let id = job_id.to_string();
        tokio::spawn(async move {
            let mut last_finished: Option<DateTime<Utc>> = None;
            loop {
                let wait = job.next_wait(Utc::now(), last_finished);
                tokio::select! {
                    _ = child.cancelled() => break,
                    _ = tokio::time::sleep(wait) => {}
                }
                if child.is_cancelled() {
                    break;
                }
                job.run().await;
                last_finished = Some(Utc::now());
            }
            tracing::debug!(target: "scheduler", job_id = %id, "job loop exited");
        });

        Ok(Box::new(LocalJobHandle {
            job_id: job_id.to_string(),
            token,
            active: self.active.clone(),
        }))
    }
}

// --- Test helper ---

struct ManualEntry {
    job_id: String,
    job: Arc<dyn ScheduledJob>,
    closed: Arc<AtomicBool>,
}

/// Records scheduled jobs; tests call [`trigger`](ManualScheduler::trigger)
/// to run an invocation.
#[derive(Default, Clone)]
pub struct ManualScheduler {
    entries: Arc<Mutex<Vec<ManualEntry>>>,
}

struct ManualHandle {
    closed: Arc<AtomicBool>,
}

impl JobHandle for ManualHandle {
    fn close(&self) -> IngestResult<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

impl ManualScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `schedule` calls so far (open or closed).
    pub fn scheduled_count(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn active_count(&self) -> usize {
        self.entries
            .lock()
            .iter()
            .filter(|e| !e.closed.load(Ordering::SeqCst))
            .count()
    }

    pub fn is_active(&self, job_id: &str) -> bool {
        self.entries
            .lock()
            .iter()
            .any(|e| e.job_id == job_id && !e.closed.load(Ordering::SeqCst))
    }

    /// Run the open job registered under `job_id` once. Returns `false` when
    /// there is none (never scheduled, or its handle was closed).
    pub async fn trigger(&self, job_id: &str) -> bool {
        let job = self
            .entries
            .lock()
            .iter()
            .rev()
            .find(|e| e.job_id == job_id && !e.closed.load(Ordering::SeqCst))
            .map(|e| e.job.clone());
        match job {
            Some(job) => {
                job.run().await;
                true
            }
            None => false,
        }
    }

    pub fn next_wait(
        &self,
        job_id: &str,
        now: DateTime<Utc>,
        last_finished: Option<DateTime<Utc>>,
    ) -> Option<Duration> {
        self.entries
            .lock()
            .iter()
            .rev()
            .find(|e| e.job_id == job_id)
            .map(|e| e.job.next_wait(now, last_finished))
    }
}

impl JobScheduler for ManualScheduler {
    fn schedule(&self, job_id: &str, job: Arc<dyn ScheduledJob>) -> IngestResult<Box<dyn JobHandle>> {
        if self.is_active(job_id) {
            return Err(IngestError::AlreadyRunning(job_id.to_string()));
        }
        let closed = Arc::new(AtomicBool::new(false));
        self.entries.lock().push(ManualEntry {
            job_id: job_id.to_string(),
            job,
            closed: closed.clone(),
        });
        Ok(Box::new(ManualHandle { closed }))
    }
}
