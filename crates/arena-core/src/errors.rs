//! Error taxonomy for the arena client.
//!
//! Every user-visible failure maps onto one variant here. HTTP status
//! classification (429/402, 401, 403 with and without anti-bot markers)
//! lives in the transport helper; this enum is the vocabulary it targets.

use thiserror::Error;

/// Convenience alias used across all arena crates.
pub type Result<T> = std::result::Result<T, ArenaError>;

/// All failures surfaced by the arena client.
#[derive(Debug, Error)]
pub enum ArenaError {
    /// A hard bootstrap wait exceeded its budget.
    #[error("timeout waiting for {what} ({seconds}s)")]
    BootstrapTimeout {
        /// What was being waited for (cookie name, JS predicate label).
        what: String,
        /// Budget that was exceeded, in seconds.
        seconds: u64,
    },

    /// Liveness probe failed. Consumed internally by a relaunch; surfaces
    /// only when the relaunch itself fails.
    #[error("browser session unhealthy: {0}")]
    SessionUnhealthy(String),

    /// 403 carrying anti-bot markers in the response body.
    #[error("blocked by anti-bot challenge: {0}")]
    ChallengeBlocked(String),

    /// 401 from the upstream service.
    #[error("authentication failure: {0}")]
    AuthFailure(String),

    /// 429 or 402 from the upstream service.
    #[error("rate limited: {0}")]
    RateLimited(String),

    /// 403 without anti-bot markers.
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// Any other non-2xx response.
    #[error("upstream error (HTTP {status}): {message}")]
    Upstream {
        /// HTTP status code.
        status: u16,
        /// Reason phrase plus best-effort detail extracted from the body.
        message: String,
    },

    /// The requested model is not in the discovered catalog.
    #[error("unknown model: {0:?}")]
    ModelUnavailable(String),

    /// Assets were supplied but the model cannot accept image input.
    #[error("model {0:?} does not support vision input")]
    VisionUnsupported(String),

    /// Malformed stream frame or an explicit error frame from the wire.
    #[error("stream protocol error: {0}")]
    Protocol(String),

    /// Asset upload failed after retries.
    #[error("upload failed: {0}")]
    UploadFailure(String),

    /// Discovery never recovered both required action identifiers.
    #[error("server action identifiers not loaded")]
    ActionsNotLoaded,

    /// Browser transport failure (launch, websocket, devtools command).
    #[error("browser error: {0}")]
    Browser(String),

    /// Transport-level HTTP failure.
    #[error(transparent)]
    Http(#[from] reqwest::Error),

    /// JSON encode/decode failure.
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl ArenaError {
    /// Shorthand for a [`ArenaError::BootstrapTimeout`].
    pub fn timeout(what: impl Into<String>, seconds: u64) -> Self {
        Self::BootstrapTimeout {
            what: what.into(),
            seconds,
        }
    }
}
