//! Error taxonomy shared by the builder and the runtime.
//!
//! Every fallible call site wraps its cause with a short contextual prefix
//! (e.g. `"embed batch 7"`, `"parse triples response"`) so a failure can be
//! traced without a backtrace. Variants map onto user-visible behavior:
//!
//! | Variant | Runtime mapping |
//! |---------|-----------------|
//! | `InvalidConfig` / `InvalidInput` | build refuses to run, exit 1 |
//! | `UpstreamFailure` | `502 Bad Gateway` (REST), terminal SSE error event (streaming) |
//! | `RateLimited` | retried with backoff by the builder |
//! | `RetrievalFailure` | surfaced to the caller; graph-side failures degrade instead |
//! | `Unauthorized` | `401` with a JSON error body |
//! | `NotFound` | treated as an empty result, not an error |

use thiserror::Error;

pub type Result<T> = std::result::Result<T, KilnError>;

#[derive(Error, Debug)]
pub enum KilnError {
    /// A required configuration key is missing or invalid.
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// Caller-supplied input is unusable (bad UTF-8, empty query, empty corpus).
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// An upstream HTTP API failed: network error, non-2xx status, or an
    /// unparseable body.
    #[error("upstream failure: {0}")]
    UpstreamFailure(String),

    /// The upstream provider returned HTTP 429.
    #[error("rate limited: {0}")]
    RateLimited(String),

    /// The embedding API returned a vector shorter than the declared
    /// dimension. Long vectors are truncated; short ones are a hard error.
    #[error("dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    /// The vector side of hybrid retrieval failed.
    #[error("retrieval failure: {0}")]
    RetrievalFailure(String),

    /// No results / no artifact at the given path.
    #[error("not found: {0}")]
    NotFound(String),

    /// Missing or mismatched bearer credentials.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// An internal invariant was violated.
    #[error("internal error: {0}")]
    Internal(String),
}

impl KilnError {
    /// Wrap an upstream error with a call-site context prefix.
    pub fn upstream(context: &str, err: impl std::fmt::Display) -> Self {
        KilnError::UpstreamFailure(format!("{context}: {err}"))
    }

    /// Wrap an internal error with a call-site context prefix.
    pub fn internal(context: &str, err: impl std::fmt::Display) -> Self {
        KilnError::Internal(format!("{context}: {err}"))
    }

    /// True for failures worth retrying: rate limits and transient upstream
    /// errors.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            KilnError::RateLimited(_) | KilnError::UpstreamFailure(_)
        )
    }
}

impl From<reqwest::Error> for KilnError {
    fn from(err: reqwest::Error) -> Self {
        KilnError::UpstreamFailure(err.to_string())
    }
}

impl From<sqlx::Error> for KilnError {
    fn from(err: sqlx::Error) -> Self {
        KilnError::Internal(format!("database: {err}"))
    }
}

impl From<std::io::Error> for KilnError {
    fn from(err: std::io::Error) -> Self {
        KilnError::Internal(format!("io: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(KilnError::RateLimited("429".into()).is_transient());
        assert!(KilnError::UpstreamFailure("boom".into()).is_transient());
        assert!(!KilnError::InvalidConfig("bad".into()).is_transient());
        assert!(!KilnError::DimensionMismatch {
            expected: 8,
            got: 4
        }
        .is_transient());
    }

    #[test]
    fn context_prefix_is_preserved() {
        let err = KilnError::upstream("embed batch 7", "connection reset");
        assert_eq!(
            err.to_string(),
            "upstream failure: embed batch 7: connection reset"
        );
    }
}
