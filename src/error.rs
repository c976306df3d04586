//! Typed error taxonomy shared by the ingestion core.

use reqwest::StatusCode;

/// Errors surfaced by the auth manager, fetcher, store, poller and registry.
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    /// 401/403 from the remote API: bad credentials or a rejected token.
    #[error("authentication failed ({status}): {message}")]
    Auth { status: u16, message: String },

    #[error("rate limited by remote API: {0}")]
    RateLimited(String),

    #[error("remote API server error ({status}): {message}")]
    Server { status: u16, message: String },

    #[error("malformed request: {0}")]
    BadRequest(String),

    /// Any other non-2xx status.
    #[error("unexpected HTTP status {status}: {message}")]
    Http { status: u16, message: String },

    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("failed to parse response: {0}")]
    Parse(String),

    #[error("authentication response did not contain a token")]
    MissingToken,

    #[error("state store error: {0}")]
    Store(String),

    #[error("poller for backend {0} is already running")]
    AlreadyRunning(String),

    #[error("backend not found: {0}")]
    NotFound(String),

    #[error("backend already registered: {0}")]
    Duplicate(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("failed to disable backend {backend_id}: {message}")]
    Disable { backend_id: String, message: String },

    /// A poll-cycle stage failure; `stage` names the step that short-circuited.
    #[error("{stage}: {source}")]
    Stage {
        stage: &'static str,
        #[source]
        source: Box<IngestError>,
    },
}

pub type IngestResult<T> = Result<T, IngestError>;

impl IngestError {
    /// Map a non-success HTTP status to the error taxonomy.
    pub fn from_status(status: StatusCode, body: &str, context: &str) -> Self {
        let message = format!("{context}: {}", truncate(body, 200));
        let code = status.as_u16();
        match code {
            401 | 403 => IngestError::Auth {
                status: code,
                message,
            },
            429 => IngestError::RateLimited(message),
            400 => IngestError::BadRequest(message),
            500..=599 => IngestError::Server {
                status: code,
                message,
            },
            _ => IngestError::Http {
                status: code,
                message,
            },
        }
    }

    pub fn stage(stage: &'static str, source: IngestError) -> Self {
        IngestError::Stage {
            stage,
            source: Box::new(source),
        }
    }

    pub fn store(e: impl std::fmt::Display) -> Self {
        IngestError::Store(e.to_string())
    }

    /// The innermost error, unwrapping stage wrappers.
    pub fn root(&self) -> &IngestError {
        match self {
            IngestError::Stage { source, .. } => source.root(),
            other => other,
        }
    }
}

impl From<serde_json::Error> for IngestError {
    fn from(e: serde_json::Error) -> Self {
        IngestError::Parse(e.to_string())
    }
}

fn truncate(s: &str, max: usize) -> String {
    let trimmed = s.trim();
    if trimmed.chars().count() <= max {
        trimmed.to_string()
    } else {
        let mut out: String = trimmed.chars().take(max).collect();
        out.push('…');
        out
    }
}
