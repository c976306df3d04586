// src/ingest/mod.rs
pub mod auth;
pub mod dedup;
pub mod fetcher;
pub mod normalize;
pub mod poller;
pub mod processor;
pub mod scheduler;
pub mod types;

pub use normalize::{normalize_alert, normalize_text};

use metrics::{describe_counter, describe_gauge, describe_histogram};
use once_cell::sync::OnceCell;

/// One-time metrics registration (so series show up on /metrics).
pub fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!("alerts_fetched_total", "Raw alerts returned by the remote API.");
        describe_counter!(
            "alerts_delivered_total",
            "Alerts newly delivered to the output sink."
        );
        describe_counter!(
            "alerts_duplicate_total",
            "Alerts skipped because their id was already delivered."
        );
        describe_counter!(
            "alerts_sink_errors_total",
            "Alerts the output sink failed to accept."
        );
        describe_counter!("poll_cycles_total", "Regular poll cycles executed.");
        describe_counter!("poll_failures_total", "Failed poll or catch-up cycles.");
        describe_counter!(
            "backends_disabled_total",
            "Backends auto-disabled after repeated failures."
        );
        describe_counter!("auth_refresh_total", "Successful API authentications.");
        describe_histogram!("alerts_fetch_ms", "Alerts page fetch time in milliseconds.");
        describe_gauge!(
            "poll_last_success_ts",
            "Unix ts of the most recent successful poll."
        );
    });
}
