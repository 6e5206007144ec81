//! Error taxonomy for the refresh pipeline.
//!
//! Transient errors are retried by [`crate::retry::RetryPolicy`]; everything
//! else points at a setup defect and is surfaced immediately.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    /// A persisted file exists but is not the JSON shape we expect.
    #[error("malformed file {path}: {reason}")]
    Malformed { path: PathBuf, reason: String },

    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Missing credentials, bad config values.
    #[error("configuration error: {0}")]
    Config(String),

    /// Network timeout, rate limit, 5xx from an external endpoint.
    #[error("transient source error: {0}")]
    Transient(String),

    /// The endpoint answered but the answer is unusable (4xx, unparseable body).
    #[error("source rejected request: {0}")]
    Rejected(String),

    /// A snapshot value does not fit the shape its key promises.
    #[error("unexpected payload for key {key}: {reason}")]
    Payload { key: String, reason: String },
}

impl PipelineError {
    pub fn malformed(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        Self::Malformed {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Only transient errors are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    /// Setup defects: never retried, never swallowed.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Malformed { .. } | Self::Config(_))
    }
}

/// Classify an `anyhow` chain: untyped errors are treated as transient so a
/// flaky closure still gets its bounded retries.
pub fn is_retryable(err: &anyhow::Error) -> bool {
    match err.downcast_ref::<PipelineError>() {
        Some(e) => e.is_retryable(),
        None => err
            .downcast_ref::<reqwest::Error>()
            .map(|e| e.is_timeout() || e.is_connect() || e.is_request())
            .unwrap_or(true),
    }
}

/// True if any error in the chain is a fatal [`PipelineError`].
pub fn is_fatal(err: &anyhow::Error) -> bool {
    err.chain()
        .filter_map(|e| e.downcast_ref::<PipelineError>())
        .any(PipelineError::is_fatal)
}

pub type Result<T> = std::result::Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transient_is_retryable() {
        assert!(PipelineError::Transient("429".into()).is_retryable());
        assert!(!PipelineError::Rejected("400".into()).is_retryable());
        assert!(!PipelineError::Config("no key".into()).is_retryable());
    }

    #[test]
    fn fatal_is_found_through_context() {
        let err = anyhow::Error::new(PipelineError::malformed("x.json", "not an array"))
            .context("loading history");
        assert!(is_fatal(&err));
        assert!(!is_retryable(&err));
        assert!(!is_fatal(&anyhow::anyhow!("plain")));
    }

    #[test]
    fn untyped_errors_are_retried() {
        assert!(is_retryable(&anyhow::anyhow!("connection reset")));
    }
}
