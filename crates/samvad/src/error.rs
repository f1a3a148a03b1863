//! Error taxonomy for the orchestration core.
//!
//! Strategy-level functions return these over the HTTP boundary as structured
//! payloads rather than panicking across it. Best-effort stages (intent
//! classification, query rewriting) swallow their own failures and never
//! surface here.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ChatError {
    /// Missing or malformed input (query, URL, required tool parameter).
    /// Surfaced immediately, never retried.
    #[error("{0}")]
    Validation(String),

    /// Non-2xx from a search/crawl/provider backend, status passed through.
    #[error("upstream error {status}: {message}")]
    Upstream { status: u16, message: String },

    /// The search backend could not be reached at all. Retryable, and
    /// distinct from a downstream non-2xx.
    #[error("{0}")]
    Unreachable(String),

    /// Missing credentials, endpoint, or deployment. Fatal for the request.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The abort signal fired. The UI resets silently; this is not shown as
    /// a user-facing failure.
    #[error("generation cancelled")]
    Cancelled,

    /// Every strategy in a fallback chain failed. The message combines each
    /// attempt's failure.
    #[error("{0}")]
    FallbackExhausted(String),
}

impl ChatError {
    pub fn missing_key(name: &str) -> Self {
        ChatError::Configuration(format!("{name} API key not found"))
    }

    /// HTTP status for the JSON error contract.
    pub fn status(&self) -> u16 {
        match self {
            ChatError::Validation(_) => 400,
            ChatError::Upstream { status, .. } => *status,
            ChatError::Unreachable(_) => 503,
            ChatError::Configuration(_) => 500,
            ChatError::Cancelled => 499,
            ChatError::FallbackExhausted(_) => 500,
        }
    }
}

impl From<reqwest::Error> for ChatError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_connect() {
            return ChatError::Unreachable(format!("backend unreachable: {err}"));
        }
        let status = err.status().map(|s| s.as_u16()).unwrap_or(502);
        ChatError::Upstream {
            status,
            message: err.to_string(),
        }
    }
}
