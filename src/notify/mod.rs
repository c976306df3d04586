// src/notify/mod.rs
//! Output sinks: where normalized alerts end up.

pub mod webhook;

pub use webhook::WebhookSink;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashSet;

use crate::ingest::types::NormalizedAlert;

#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn post_alert(&self, alert: &NormalizedAlert, destination: &str) -> Result<()>;
}

/// Logs alerts instead of posting them. Used when no webhook is configured.
#[derive(Debug, Default, Clone)]
pub struct LogSink;

#[async_trait]
impl AlertSink for LogSink {
    async fn post_alert(&self, alert: &NormalizedAlert, destination: &str) -> Result<()> {
        tracing::info!(
            target: "sink",
            backend = %alert.backend_name,
            alert_id = %alert.alert_id,
            alert_type = %alert.alert_type,
            destination,
            headline = %alert.headline,
            "alert"
        );
        Ok(())
    }
}

// --- Test helper ---

/// Records every posted alert; ids listed in `fail_ids` are rejected.
#[derive(Default)]
pub struct RecordingSink {
    pub posted: Mutex<Vec<(NormalizedAlert, String)>>,
    fail_ids: Mutex<HashSet<String>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_on(&self, alert_id: &str) {
        self.fail_ids.lock().insert(alert_id.to_string());
    }

    pub fn posted_ids(&self) -> Vec<String> {
        self.posted
            .lock()
            .iter()
            .map(|(a, _)| a.alert_id.clone())
            .collect()
    }

    pub fn count(&self) -> usize {
        self.posted.lock().len()
    }
}

#[async_trait]
impl AlertSink for RecordingSink {
    async fn post_alert(&self, alert: &NormalizedAlert, destination: &str) -> Result<()> {
        if self.fail_ids.lock().contains(&alert.alert_id) {
            return Err(anyhow!("sink rejected alert {}", alert.alert_id));
        }
        self.posted
            .lock()
            .push((alert.clone(), destination.to_string()));
        Ok(())
    }
}
