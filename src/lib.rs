// src/lib.rs
// Public library surface for the binary and integration tests.

pub mod api;
pub mod backend;
pub mod config;
pub mod error;
pub mod ingest;
pub mod metrics;
pub mod notify;
pub mod registry;
pub mod store;

// ---- Re-exports for stable public API ----
pub use crate::api::router;
pub use crate::backend::{Backend, BackendDeps, BackendInstance, BackendStatus, Health};
pub use crate::config::{AppConfig, BackendConfig, PollerSettings};
pub use crate::error::{IngestError, IngestResult};
pub use crate::registry::Registry;
