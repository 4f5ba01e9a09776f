use reqwest::StatusCode;
use thiserror::Error;

/// Errors from the page driver. DOM-interaction failures never escape the
/// executor as errors; they are folded into `success: false` outcomes there.
#[derive(Debug, Error)]
pub enum PageError {
    #[error("page evaluation failed: {0}")]
    Eval(String),

    #[error("element no longer attached: {0}")]
    Detached(String),

    #[error("unknown overlay: {0}")]
    UnknownOverlay(String),

    #[error("browser session error: {0}")]
    Session(String),
}

/// Errors from the completion and retrieval backends.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("HTTP {status}: {message}")]
    Status { status: StatusCode, message: String },

    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("unexpected response: {0}")]
    InvalidResponse(String),

    /// The request was abandoned by a newer send or a navigation. Swallowed
    /// silently by the orchestrator, never surfaced to the user.
    #[error("request cancelled")]
    Cancelled,
}

impl BackendError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, BackendError::Cancelled)
    }
}
