// src/config/backend.rs
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

use crate::error::{IngestError, IngestResult};

/// Backend kinds this build knows how to poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    #[default]
    AlertApi,
}

fn default_poll_interval() -> u64 {
    60
}

fn default_enabled() -> bool {
    true
}

/// Identity and connection parameters for one ingestion source.
#[derive(Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Immutable, never reused. Must be written in the config file; a
    /// missing id deserializes as nil and fails validation.
    #[serde(default)]
    pub id: Uuid,
    pub name: String,
    #[serde(rename = "type", default)]
    pub kind: BackendKind,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub url: String,
    pub api_id: String,
    /// "ENV:NAME" is resolved from the environment at load time.
    pub api_key: String,
    pub destination_id: String,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
}

impl std::fmt::Debug for BackendConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendConfig")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("enabled", &self.enabled)
            .field("url", &self.url)
            .field("api_id", &self.api_id)
            .field("api_key_len", &self.api_key.len())
            .field("destination_id", &self.destination_id)
            .field("poll_interval_secs", &self.poll_interval_secs)
            .finish()
    }
}

impl BackendConfig {
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            kind: BackendKind::AlertApi,
            enabled: true,
            url: url.into(),
            api_id: String::new(),
            api_key: String::new(),
            destination_id: String::new(),
            poll_interval_secs: default_poll_interval(),
        }
    }

    pub fn with_credentials(mut self, api_id: impl Into<String>, api_key: impl Into<String>) -> Self {
        self.api_id = api_id.into();
        self.api_key = api_key.into();
        self
    }

    pub fn with_destination(mut self, destination_id: impl Into<String>) -> Self {
        self.destination_id = destination_id.into();
        self
    }

    pub fn with_poll_interval(mut self, secs: u64) -> Self {
        self.poll_interval_secs = secs;
        self
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    /// Replace `ENV:NAME` credential references with the variable's value.
    pub fn resolve_secrets(&mut self) -> IngestResult<()> {
        self.api_id = resolve_secret(&self.api_id, &self.name)?;
        self.api_key = resolve_secret(&self.api_key, &self.name)?;
        Ok(())
    }

    pub fn validate(&self, min_poll_interval_secs: u64) -> IngestResult<()> {
        let invalid = |msg: String| Err(IngestError::InvalidConfig(msg));

        if self.id.is_nil() {
            return invalid(format!("backend '{}' has no id", self.name));
        }
        if self.name.trim().is_empty() {
            return invalid(format!("backend {} has an empty name", self.id));
        }
        match reqwest::Url::parse(&self.url) {
            Ok(u) if matches!(u.scheme(), "http" | "https") => {}
            Ok(u) => {
                return invalid(format!(
                    "backend '{}': unsupported URL scheme '{}'",
                    self.name,
                    u.scheme()
                ))
            }
            Err(e) => return invalid(format!("backend '{}': invalid URL: {e}", self.name)),
        }
        if self.api_id.trim().is_empty() || self.api_key.trim().is_empty() {
            return invalid(format!("backend '{}': missing API credentials", self.name));
        }
        if self.destination_id.trim().is_empty() {
            return invalid(format!("backend '{}': missing destination", self.name));
        }
        if self.poll_interval_secs < min_poll_interval_secs {
            return invalid(format!(
                "backend '{}': poll interval {}s is below the minimum of {}s",
                self.name, self.poll_interval_secs, min_poll_interval_secs
            ));
        }
        Ok(())
    }
}

fn resolve_secret(raw: &str, backend: &str) -> IngestResult<String> {
    let Some(var) = raw.trim().strip_prefix("ENV:") else {
        return Ok(raw.to_string());
    };
    std::env::var(var.trim()).map_err(|_| {
        IngestError::InvalidConfig(format!(
            "backend '{backend}': missing env var {} for credentials",
            var.trim()
        ))
    })
}
