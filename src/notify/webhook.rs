// src/notify/webhook.rs
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use std::time::Duration;

use super::AlertSink;
use crate::ingest::types::NormalizedAlert;

/// Posts alerts as JSON to an incoming-webhook endpoint.
#[derive(Clone)]
pub struct WebhookSink {
    webhook: String,
    client: Client,
    timeout: Duration,
    max_retries: u8,
}

#[derive(Serialize)]
struct WebhookPayload<'a> {
    channel: &'a str,
    text: String,
    alert: &'a NormalizedAlert,
}

impl WebhookSink {
    pub fn new(webhook: String) -> Self {
        Self {
            webhook,
            client: Client::new(),
            timeout: Duration::from_secs(5),
            max_retries: 3,
        }
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout = Duration::from_secs(secs);
        self
    }

    pub fn with_retries(mut self, retries: u8) -> Self {
        self.max_retries = retries.max(1);
        self
    }
}

/// One-line summary; rich rendering is the receiving side's job.
pub fn summary_line(alert: &NormalizedAlert) -> String {
    let mut text = format!("[{}] {}", alert.alert_type, alert.headline);
    if let Some(loc) = &alert.location {
        if !loc.address.is_empty() {
            text.push_str(&format!(" - {}", loc.address));
        }
    }
    if let Some(ts) = alert.event_time {
        text.push_str(&format!(" ({})", ts.format("%Y-%m-%d %H:%M UTC")));
    }
    text
}

#[async_trait]
impl AlertSink for WebhookSink {
    async fn post_alert(&self, alert: &NormalizedAlert, destination: &str) -> Result<()> {
        let payload = WebhookPayload {
            channel: destination,
            text: summary_line(alert),
            alert,
        };

        let mut attempt: u8 = 0;
        loop {
            attempt += 1;
            let res = self
                .client
                .post(&self.webhook)
                .timeout(self.timeout)
                .json(&payload)
                .send()
                .await;

            let err = match res {
                Ok(rsp) => match rsp.error_for_status() {
                    Ok(_) => return Ok(()),
                    Err(e) => anyhow!("webhook HTTP error: {e}"),
                },
                Err(e) => anyhow!("webhook request failed: {e}"),
            };
            if attempt >= self.max_retries {
                return Err(err);
            }
            tokio::time::sleep(Duration::from_millis(500u64 << (attempt - 1))).await;
        }
    }
}
