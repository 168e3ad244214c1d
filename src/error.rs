//! Relay error types
//!
//! Errors are scoped: ingest-loop errors stay inside the ingest loop (which
//! decides retry or termination), viewer errors kill only that viewer, and
//! registry lookups surface to the HTTP layer.

use thiserror::Error;

/// Error type for relay operations
#[derive(Debug, Error)]
pub enum RelayError {
    /// Could not connect to the upstream, or it answered with a non-200
    /// status during the initial handshake. Retried with backoff.
    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    /// The upstream closed the connection mid-stream (EOF at a tag
    /// boundary). The ingest loop reconnects and clears replay state.
    #[error("upstream closed the connection")]
    UpstreamClosed,

    /// Malformed FLV data (bad signature, short read inside a tag).
    #[error("flv parse error: {0}")]
    Parse(String),

    /// The initial-tag capture deadline elapsed before the script tag and
    /// sequence headers were seen.
    #[error("timed out capturing flv header and initial tags")]
    HeaderTimeout,

    /// No broker registered under the requested stream key, or no cached
    /// segment under the requested file name. Surfaced as 404.
    #[error("not found: {0}")]
    NotFound(String),

    /// The initial prologue/replay block could not be handed to a viewer.
    /// Terminates just that viewer's attach.
    #[error("failed to write to viewer {0}")]
    WriteFailed(String),

    /// The response channel cannot stream. Surfaced as 500 at attach time.
    #[error("response does not support streaming")]
    StreamingUnsupported,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
}

impl RelayError {
    /// Whether the ingest loop should keep retrying after this error.
    ///
    /// Parse failures and header timeouts count as the upstream being
    /// unusable right now, not as permanent faults.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RelayError::UpstreamUnavailable(_)
                | RelayError::UpstreamClosed
                | RelayError::Parse(_)
                | RelayError::HeaderTimeout
                | RelayError::Http(_)
                | RelayError::Io(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, RelayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(RelayError::UpstreamUnavailable("503".into()).is_retryable());
        assert!(RelayError::UpstreamClosed.is_retryable());
        assert!(RelayError::Parse("short read".into()).is_retryable());
        assert!(RelayError::HeaderTimeout.is_retryable());

        assert!(!RelayError::NotFound("room1".into()).is_retryable());
        assert!(!RelayError::WriteFailed("c1".into()).is_retryable());
        assert!(!RelayError::StreamingUnsupported.is_retryable());
    }

    #[test]
    fn test_display() {
        let err = RelayError::NotFound("room1".into());
        assert_eq!(err.to_string(), "not found: room1");

        let err = RelayError::UpstreamUnavailable("status 502".into());
        assert!(err.to_string().contains("502"));
    }
}
