//! Crate-level error type.
//!
//! Per-event failures (`Framing`, `Protocol`) are contained by the stream pump:
//! they are logged and the offending event is dropped. Everything else ends the
//! current operation and is returned to the caller.

use thiserror::Error;

/// Errors produced by the synchronization engine and its backend.
#[derive(Debug, Error)]
pub enum SyncError {
    /// A protocol line could not be decoded into an event.
    #[error("malformed stream line: {detail}")]
    Framing { detail: String },

    /// A patch is missing a field required by the action it implies.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// The streaming connection was refused or dropped.
    #[error("transport failure talking to {url}: {detail}")]
    Transport { url: String, detail: String },

    /// A REST call reached the backend but was rejected.
    #[error("backend returned HTTP {status} for {url}: {detail}")]
    Backend {
        status: u16,
        url: String,
        detail: String,
    },

    /// A second streaming connection was requested while one is still open.
    #[error("a stream is already open for this conversation ({0})")]
    StreamBusy(&'static str),

    /// The stream pump was driven with no stream open.
    #[error("no stream is open")]
    NoStream,

    /// Configuration file or override could not be used.
    #[error("configuration error: {0}")]
    Config(String),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl SyncError {
    pub fn protocol(detail: impl Into<String>) -> Self {
        SyncError::Protocol(detail.into())
    }

    pub fn transport(url: impl Into<String>, err: impl std::fmt::Display) -> Self {
        SyncError::Transport {
            url: url.into(),
            detail: err.to_string(),
        }
    }

    /// True for errors that only affect a single event and never end a stream.
    pub fn is_per_event(&self) -> bool {
        matches!(self, SyncError::Framing { .. } | SyncError::Protocol(_))
    }

    /// Whether a caller-side retry policy may reasonably try again.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Transport { .. } => true,
            SyncError::Backend { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;
