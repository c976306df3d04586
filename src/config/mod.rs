// src/config/mod.rs
pub mod backend;

pub use backend::{BackendConfig, BackendKind};

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use uuid::Uuid;

use crate::error::{IngestError, IngestResult};

pub const ENV_CONFIG_PATH: &str = "ALERT_INGESTOR_CONFIG";
pub const DEFAULT_TOML_PATH: &str = "config/ingestor.toml";
pub const DEFAULT_JSON_PATH: &str = "config/ingestor.json";

fn default_min_poll() -> u64 {
    30
}
fn default_max_failures() -> u32 {
    5
}
fn default_recency_hours() -> u64 {
    24
}
fn default_page_delay_ms() -> u64 {
    5_000
}
fn default_dedup_ttl() -> u64 {
    3_600
}
fn default_dedup_sweep() -> u64 {
    600
}
fn default_http_timeout() -> u64 {
    30
}
fn default_state_dir() -> PathBuf {
    PathBuf::from("state")
}

/// Process-wide settings plus the configured backends.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_min_poll")]
    pub min_poll_interval_secs: u64,
    #[serde(default = "default_max_failures")]
    pub max_consecutive_failures: u32,
    #[serde(default = "default_recency_hours")]
    pub catchup_recency_hours: u64,
    #[serde(default = "default_page_delay_ms")]
    pub catchup_page_delay_ms: u64,
    #[serde(default = "default_dedup_ttl")]
    pub dedup_ttl_secs: u64,
    #[serde(default = "default_dedup_sweep")]
    pub dedup_sweep_secs: u64,
    #[serde(default = "default_http_timeout")]
    pub http_timeout_secs: u64,
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webhook_url: Option<String>,
    #[serde(default)]
    pub backends: Vec<BackendConfig>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            min_poll_interval_secs: default_min_poll(),
            max_consecutive_failures: default_max_failures(),
            catchup_recency_hours: default_recency_hours(),
            catchup_page_delay_ms: default_page_delay_ms(),
            dedup_ttl_secs: default_dedup_ttl(),
            dedup_sweep_secs: default_dedup_sweep(),
            http_timeout_secs: default_http_timeout(),
            state_dir: default_state_dir(),
            webhook_url: None,
            backends: Vec::new(),
        }
    }
}

/// Tunables handed to each backend at construction time.
#[derive(Debug, Clone, Copy)]
pub struct PollerSettings {
    pub max_consecutive_failures: u32,
    pub catchup_recency_window: Duration,
    pub catchup_page_delay: Duration,
    pub dedup_ttl: Duration,
    pub dedup_sweep_interval: Duration,
    pub http_timeout: Duration,
}

impl Default for PollerSettings {
    fn default() -> Self {
        AppConfig::default().poller_settings()
    }
}

impl AppConfig {
    pub fn poller_settings(&self) -> PollerSettings {
        PollerSettings {
            max_consecutive_failures: self.max_consecutive_failures.max(1),
            catchup_recency_window: Duration::from_secs(self.catchup_recency_hours * 3600),
            catchup_page_delay: Duration::from_millis(self.catchup_page_delay_ms),
            dedup_ttl: Duration::from_secs(self.dedup_ttl_secs),
            dedup_sweep_interval: Duration::from_secs(self.dedup_sweep_secs.max(1)),
            http_timeout: Duration::from_secs(self.http_timeout_secs.max(1)),
        }
    }

    /// Check every backend plus id/name uniqueness across backends.
    pub fn validate(&self) -> IngestResult<()> {
        let mut ids = HashSet::new();
        let mut names = HashSet::new();
        for b in &self.backends {
            b.validate(self.min_poll_interval_secs)?;
            if !ids.insert(b.id) {
                return Err(IngestError::InvalidConfig(format!(
                    "duplicate backend id {}",
                    b.id
                )));
            }
            if !names.insert(b.name.trim().to_ascii_lowercase()) {
                return Err(IngestError::InvalidConfig(format!(
                    "duplicate backend name '{}'",
                    b.name
                )));
            }
        }
        Ok(())
    }

    pub fn backend(&self, id: Uuid) -> Option<&BackendConfig> {
        self.backends.iter().find(|b| b.id == id)
    }
}

/// Load config from an explicit path. Supports TOML or JSON formats.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let mut cfg = read_raw(path)?;
    for b in &mut cfg.backends {
        b.resolve_secrets()?;
    }
    cfg.validate()?;
    Ok(cfg)
}

/// Load config using env var + fallbacks:
/// 1) $ALERT_INGESTOR_CONFIG
/// 2) config/ingestor.toml
/// 3) config/ingestor.json
pub fn load_config_default() -> Result<(AppConfig, Option<PathBuf>)> {
    if let Ok(p) = std::env::var(ENV_CONFIG_PATH) {
        let pb = PathBuf::from(p);
        if pb.exists() {
            return Ok((load_config_from(&pb)?, Some(pb)));
        }
        return Err(anyhow!("{ENV_CONFIG_PATH} points to non-existent path"));
    }
    for candidate in [DEFAULT_TOML_PATH, DEFAULT_JSON_PATH] {
        let pb = PathBuf::from(candidate);
        if pb.exists() {
            return Ok((load_config_from(&pb)?, Some(pb)));
        }
    }
    Ok((AppConfig::default(), None))
}

/// Durably flip `enabled` for one backend, leaving secrets unresolved on disk.
pub fn set_backend_enabled(path: &Path, id: Uuid, enabled: bool) -> Result<()> {
    let mut raw = read_raw(path)?;
    let backend = raw
        .backends
        .iter_mut()
        .find(|b| b.id == id)
        .ok_or_else(|| anyhow!("backend {id} not present in {}", path.display()))?;
    backend.enabled = enabled;

    let body = if is_json(path) {
        serde_json::to_string_pretty(&raw)?
    } else {
        toml::to_string_pretty(&raw)?
    };
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, body).with_context(|| format!("writing {}", tmp.display()))?;
    fs::rename(&tmp, path).with_context(|| format!("replacing {}", path.display()))?;
    Ok(())
}

fn read_raw(path: &Path) -> Result<AppConfig> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("reading config from {}", path.display()))?;
    parse_config(&content, is_json(path))
}

fn is_json(path: &Path) -> bool {
    path.extension()
        .and_then(|s| s.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("json"))
}

fn parse_config(s: &str, json_hint: bool) -> Result<AppConfig> {
    if json_hint {
        return serde_json::from_str(s).context("parsing JSON config");
    }
    match toml::from_str(s) {
        Ok(cfg) => Ok(cfg),
        // Fallback: JSON content behind a non-.json name
        Err(toml_err) => serde_json::from_str(s)
            .map_err(|_| anyhow!(toml_err))
            .context("parsing TOML config"),
    }
}
