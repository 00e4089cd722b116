//! Typed error hierarchy for the Conveyor engine.
//!
//! Two top-level enums cover the two subsystems:
//! - `ProviderError` — failures at the LLM provider port
//! - `OrchestratorError` — run-level failures in the engine itself
//!
//! The retry machinery inspects variants, never stringified messages:
//! `ProviderError::RateLimit` and `ProviderError::Transient` are retried
//! with backoff, `ProviderError::Authentication` is fatal to the run, and
//! everything else is a per-unit `api`-stage failure.

use thiserror::Error;

/// Errors surfaced by the provider port (realtime and batch operations).
#[derive(Debug, Error)]
pub enum ProviderError {
    /// 429 / quota exhaustion. Retryable with exponential backoff.
    #[error("Rate limit exceeded: {0}")]
    RateLimit(String),

    /// 503 / timeout / temporarily unavailable. Retryable with backoff.
    #[error("Transient provider error: {0}")]
    Transient(String),

    /// Auth or billing failure (400/401/403). Fatal to the run: every
    /// subsequent call is guaranteed to fail identically.
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// Any other provider-side failure. Not retryable; surfaces as an
    /// `api`-stage failure for the affected unit(s).
    #[error("Provider error: {0}")]
    Api(String),

    #[error("HTTP transport error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Provider I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProviderError {
    /// Whether this error should be retried with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::RateLimit(_) | Self::Transient(_))
    }

    /// Whether this error aborts the whole run.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Authentication(_))
    }

    /// Classify an HTTP status + response body into the taxonomy above.
    pub fn from_status(status: u16, body: &str) -> Self {
        let lower = body.to_lowercase();
        match status {
            429 => Self::RateLimit(format!("HTTP 429: {body}")),
            400 | 401 | 403 => Self::Authentication(format!("HTTP {status}: {body}")),
            503 | 504 => Self::Transient(format!("HTTP {status}: {body}")),
            _ if lower.contains("resource_exhausted") || lower.contains("rate limit") => {
                Self::RateLimit(format!("HTTP {status}: {body}"))
            }
            _ if lower.contains("unavailable") || lower.contains("timeout") => {
                Self::Transient(format!("HTTP {status}: {body}"))
            }
            _ => Self::Api(format!("HTTP {status}: {body}")),
        }
    }
}

/// Errors from the orchestrator loop and step runners.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("Run directory {path} already has a live orchestrator (pid {pid})")]
    WriterLocked { path: std::path::PathBuf, pid: u32 },

    #[error("Failed to read manifest at {path}: {source}")]
    ManifestReadFailed {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed manifest at {path}: {source}")]
    ManifestMalformed {
        path: std::path::PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Failed to write manifest at {path}: {source}")]
    ManifestWriteFailed {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Chunk {chunk} has unrecognised state '{state}'")]
    CorruptChunkState { chunk: String, state: String },

    #[error("Pipeline step '{0}' not found in config")]
    UnknownStep(String),

    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limit_is_retryable_not_fatal() {
        let err = ProviderError::RateLimit("quota".into());
        assert!(err.is_retryable());
        assert!(!err.is_fatal());
    }

    #[test]
    fn authentication_is_fatal_not_retryable() {
        let err = ProviderError::Authentication("bad key".into());
        assert!(err.is_fatal());
        assert!(!err.is_retryable());
    }

    #[test]
    fn from_status_classifies_429_as_rate_limit() {
        let err = ProviderError::from_status(429, "slow down");
        assert!(matches!(err, ProviderError::RateLimit(_)));
    }

    #[test]
    fn from_status_classifies_auth_codes_as_fatal() {
        for status in [400u16, 401, 403] {
            let err = ProviderError::from_status(status, "denied");
            assert!(err.is_fatal(), "status {status} should be fatal");
        }
    }

    #[test]
    fn from_status_classifies_resource_exhausted_body() {
        let err = ProviderError::from_status(500, "RESOURCE_EXHAUSTED: try later");
        assert!(matches!(err, ProviderError::RateLimit(_)));
    }

    #[test]
    fn from_status_falls_back_to_api() {
        let err = ProviderError::from_status(500, "internal");
        assert!(matches!(err, ProviderError::Api(_)));
        assert!(!err.is_retryable());
    }

    #[test]
    fn corrupt_chunk_state_names_chunk_and_state() {
        let err = OrchestratorError::CorruptChunkState {
            chunk: "chunk_003".into(),
            state: "score_WAITING".into(),
        };
        let message = err.to_string();
        assert!(message.contains("chunk_003"));
        assert!(message.contains("score_WAITING"));
    }

    #[test]
    fn writer_locked_carries_pid() {
        let err = OrchestratorError::WriterLocked {
            path: std::path::PathBuf::from("/runs/r1"),
            pid: 4242,
        };
        assert!(err.to_string().contains("4242"));
    }
}
