// src/ingest/dedup.rs
//! Time-bounded memory of delivered alert ids.
//!
//! `record_alert` tests-and-marks in one critical section. The two-call
//! `is_duplicate` / `mark_seen` pair is kept for read-only checks. A background
//! sweep evicts entries older than the TTL; it takes the write lock only while
//! mutating the map. Losing this state (restart) may re-deliver alerts.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use metrics::counter;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub const DEFAULT_TTL: Duration = Duration::from_secs(3_600);
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(600);

type SeenMap = HashMap<(String, String), DateTime<Utc>>;

pub struct Deduplicator {
    seen: Arc<RwLock<SeenMap>>,
    ttl: ChronoDuration,
    sweeper: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl Deduplicator {
    /// Deduplicator without a background sweep; call [`sweep_expired`](Self::sweep_expired) manually.
    pub fn new(ttl: Duration) -> Self {
        Self {
            seen: Arc::new(RwLock::new(HashMap::new())),
            ttl: ChronoDuration::from_std(ttl).unwrap_or_else(|_| ChronoDuration::hours(1)),
            sweeper: Mutex::new(None),
        }
    }

    /// Deduplicator with a sweep task running every `sweep_interval`.
    /// Must be called from within a tokio runtime.
    pub fn spawn(ttl: Duration, sweep_interval: Duration) -> Self {
        let dedup = Self::new(ttl);
        dedup.start_sweeper(sweep_interval);
        dedup
    }

    /// Start the sweep task unless one is already running.
    pub fn start_sweeper(&self, every: Duration) {
        let mut slot = self.sweeper.lock();
        if slot.is_some() {
            return;
        }
        let token = CancellationToken::new();
        let seen = self.seen.clone();
        let ttl = self.ttl;
        let child = token.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            // first tick completes immediately
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = child.cancelled() => break,
                    _ = ticker.tick() => {
                        let removed = sweep(&seen, Utc::now() - ttl);
                        if removed > 0 {
                            tracing::debug!(target: "dedup", removed, "evicted expired alert ids");
                        }
                    }
                }
            }
        });
        *slot = Some((token, handle));
    }

    /// Atomically check and mark. Returns `true` if the id was not seen before.
    pub fn record_alert(&self, scope: &str, id: &str) -> bool {
        let key = (scope.to_string(), id.to_string());
        let mut seen = self.seen.write();
        if seen.contains_key(&key) {
            counter!("alerts_duplicate_total").increment(1);
            return false;
        }
        seen.insert(key, Utc::now());
        true
    }

    pub fn is_duplicate(&self, scope: &str, id: &str) -> bool {
        self.seen
            .read()
            .contains_key(&(scope.to_string(), id.to_string()))
    }

    pub fn mark_seen(&self, scope: &str, id: &str) {
        self.seen
            .write()
            .entry((scope.to_string(), id.to_string()))
            .or_insert_with(Utc::now);
    }

    /// Evict entries first seen before `now - ttl`. Returns how many were removed.
    pub fn sweep_expired(&self, now: DateTime<Utc>) -> usize {
        sweep(&self.seen, now - self.ttl)
    }

    pub fn len(&self) -> usize {
        self.seen.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop the sweep task and wait for it to exit. Idempotent.
    pub async fn stop(&self) {
        let taken = self.sweeper.lock().take();
        if let Some((token, handle)) = taken {
            token.cancel();
            if let Err(e) = handle.await {
                tracing::warn!(target: "dedup", error = %e, "sweep task ended abnormally");
            }
        }
    }

    pub fn is_sweeping(&self) -> bool {
        self.sweeper.lock().is_some()
    }
}

impl Drop for Deduplicator {
    fn drop(&mut self) {
        if let Some((token, _)) = self.sweeper.get_mut().take() {
            token.cancel();
        }
    }
}

fn sweep(seen: &RwLock<SeenMap>, cutoff: DateTime<Utc>) -> usize {
    let mut map = seen.write();
    let before = map.len();
    map.retain(|_, first_seen| *first_seen >= cutoff);
    before - map.len()
}
