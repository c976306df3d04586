// src/ingest/processor.rs
use metrics::counter;
use std::sync::Arc;

use crate::error::IngestResult;
use crate::ingest::dedup::Deduplicator;
use crate::ingest::normalize::normalize_alert;
use crate::ingest::types::RawAlert;
use crate::notify::AlertSink;

/// Deduplicates, normalizes and delivers a batch of raw alerts, in order.
pub struct AlertProcessor {
    backend_name: String,
    /// Dedup scope; the backend id so renames keep history.
    scope: String,
    destination: String,
    dedup: Arc<Deduplicator>,
    sink: Arc<dyn AlertSink>,
}

impl AlertProcessor {
    pub fn new(
        backend_name: impl Into<String>,
        scope: impl Into<String>,
        destination: impl Into<String>,
        dedup: Arc<Deduplicator>,
        sink: Arc<dyn AlertSink>,
    ) -> Self {
        Self {
            backend_name: backend_name.into(),
            scope: scope.into(),
            destination: destination.into(),
            dedup,
            sink,
        }
    }

    pub fn deduplicator(&self) -> &Arc<Deduplicator> {
        &self.dedup
    }

    /// Returns how many alerts were newly delivered. A failing alert is
    /// logged and skipped; it never aborts the rest of the batch.
    pub async fn process_alerts(&self, raw_alerts: &[RawAlert]) -> IngestResult<usize> {
        let mut delivered = 0usize;

        for raw in raw_alerts {
            let id = raw.alert_id.trim();
            if id.is_empty() {
                tracing::warn!(
                    target: "ingest",
                    backend = %self.backend_name,
                    "skipping alert without id"
                );
                continue;
            }
            if !self.dedup.record_alert(&self.scope, id) {
                tracing::trace!(target: "ingest", backend = %self.backend_name, alert_id = id, "duplicate");
                continue;
            }

            let alert = normalize_alert(&self.backend_name, raw);
            match self.sink.post_alert(&alert, &self.destination).await {
                Ok(()) => {
                    delivered += 1;
                    counter!("alerts_delivered_total").increment(1);
                }
                Err(e) => {
                    counter!("alerts_sink_errors_total").increment(1);
                    tracing::warn!(
                        target: "ingest",
                        backend = %self.backend_name,
                        alert_id = id,
                        error = %format!("{e:#}"),
                        "failed to deliver alert"
                    );
                }
            }
        }

        if delivered > 0 {
            tracing::info!(
                target: "ingest",
                backend = %self.backend_name,
                delivered,
                batch = raw_alerts.len(),
                "delivered new alerts"
            );
        }
        Ok(delivered)
    }
}
