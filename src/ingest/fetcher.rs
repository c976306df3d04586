// src/ingest/fetcher.rs
use async_trait::async_trait;
use metrics::{counter, histogram};
use parking_lot::Mutex;
use reqwest::Client;
use serde::Deserialize;
use std::collections::VecDeque;
use std::sync::Arc;

use crate::error::{IngestError, IngestResult};
use crate::ingest::auth::{join_url, AuthManager};
use crate::ingest::types::{AlertPage, RawAlert};

const ALERTS_PATH: &str = "alerts";
const DEFAULT_PAGE_SIZE: u32 = 40;

/// Fetch one page of alerts starting at `cursor` ("" means the API default).
#[async_trait]
pub trait AlertFetcher: Send + Sync {
    async fn fetch_alerts(&self, cursor: &str) -> IngestResult<AlertPage>;
}

#[derive(Debug, Deserialize)]
struct AlertsResponse {
    #[serde(default)]
    alerts: Vec<RawAlert>,
    /// Cursor for the next call.
    #[serde(default, alias = "nextCursor")]
    to: Option<String>,
}

/// reqwest-backed fetcher. Holds no state besides its collaborators.
pub struct ApiFetcher {
    http: Client,
    alerts_url: String,
    auth: Arc<AuthManager>,
    page_size: u32,
}

impl ApiFetcher {
    pub fn new(http: Client, base_url: &str, auth: Arc<AuthManager>) -> Self {
        Self {
            http,
            alerts_url: join_url(base_url, ALERTS_PATH),
            auth,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    pub fn with_page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn auth(&self) -> &Arc<AuthManager> {
        &self.auth
    }
}

#[async_trait]
impl AlertFetcher for ApiFetcher {
    async fn fetch_alerts(&self, cursor: &str) -> IngestResult<AlertPage> {
        let token = self.auth.get_valid_token().await?;
        let t0 = std::time::Instant::now();

        let page_size = self.page_size.to_string();
        let mut query: Vec<(&str, &str)> = vec![("pageSize", page_size.as_str())];
        if !cursor.is_empty() {
            query.push(("from", cursor));
        }

        let resp = self
            .http
            .get(&self.alerts_url)
            .bearer_auth(&token.token)
            .query(&query)
            .send()
            .await?;

        let status = resp.status();
        let body = resp.text().await?;
        if !status.is_success() {
            let err = IngestError::from_status(status, &body, "fetch alerts");
            if matches!(err, IngestError::Auth { .. }) {
                // The cached token was rejected; make the next cycle re-authenticate.
                if let Err(e) = self.auth.clear_cached_token().await {
                    tracing::warn!(target: "auth", error = %e, "failed to clear rejected token");
                }
            }
            return Err(err);
        }

        let parsed: AlertsResponse = serde_json::from_str(&body)
            .map_err(|e| IngestError::Parse(format!("alerts response: {e}")))?;

        let ms = t0.elapsed().as_secs_f64() * 1_000.0;
        histogram!("alerts_fetch_ms").record(ms);
        counter!("alerts_fetched_total").increment(parsed.alerts.len() as u64);

        Ok(AlertPage {
            alerts: parsed.alerts,
            cursor: parsed.to.unwrap_or_default(),
        })
    }
}

// --- Test helper ---

/// Replays a scripted sequence of pages/errors and records requested cursors.
/// Once the script runs out, every call returns an empty page.
#[derive(Default)]
pub struct ScriptedFetcher {
    script: Mutex<VecDeque<IngestResult<AlertPage>>>,
    pub calls: Mutex<Vec<String>>,
}

impl ScriptedFetcher {
    pub fn new(script: Vec<IngestResult<AlertPage>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn push(&self, next: IngestResult<AlertPage>) {
        self.script.lock().push_back(next);
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }
}

#[async_trait]
impl AlertFetcher for ScriptedFetcher {
    async fn fetch_alerts(&self, cursor: &str) -> IngestResult<AlertPage> {
        self.calls.lock().push(cursor.to_string());
        self.script
            .lock()
            .pop_front()
            .unwrap_or_else(|| Ok(AlertPage::default()))
    }
}
