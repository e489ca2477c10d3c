//! Error taxonomy shared by the store, aggregation, catalog, and enrichment layers.
//!
//! Record-level and batch-level failures are contained where they happen;
//! only the variants of [`EnrichmentError`] and [`StoreError::EmptyInput`]
//! ever reach the caller as run-level failures.

use std::path::PathBuf;
use std::time::Duration;

/// A local timestamp that does not split into a parseable `date time` pair.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("malformed timestamp '{raw}'")]
pub struct MalformedTimestamp {
    pub raw: String,
}

impl MalformedTimestamp {
    pub fn new(raw: &str) -> Self {
        Self {
            raw: raw.to_string(),
        }
    }
}

/// A period filter string that is neither `year`, a short month name, nor `YYYY-MM`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unrecognised period filter '{0}' (expected 'year', a month like 'Jan', or 'YYYY-MM')")]
pub struct InvalidFilter(pub String);

/// Failures while loading or persisting JSON documents.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to write {}: {source}", path.display())]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse {context}: {source}")]
    Parse {
        context: String,
        source: serde_json::Error,
    },
    #[error("event log contains no usable user entries")]
    EmptyInput,
}

/// Failures reported by a catalog transport for a single request.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CatalogError {
    #[error("rate limited by catalog (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },
    #[error("catalog rejected credentials: {0}")]
    Unauthorized(String),
    #[error("catalog returned HTTP {code}: {message}")]
    Status { code: u16, message: String },
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("malformed catalog response: {0}")]
    MalformedBody(String),
}

impl CatalogError {
    /// Whether the failure belongs to the retry-with-backoff class.
    pub fn is_transient(&self) -> bool {
        !matches!(self, Self::Unauthorized(_))
    }
}

/// Run-level enrichment failures. Batch failures never surface here.
#[derive(Debug, thiserror::Error)]
pub enum EnrichmentError {
    #[error("authentication failed: {0}")]
    AuthFailure(String),
    #[error("access token expired or revoked mid-run: {0}")]
    AuthExpired(String),
    #[error("enrichment cancelled after {completed_batches} completed batches")]
    Cancelled { completed_batches: usize },
    #[error("enrichment requires client credentials")]
    MissingCredentials,
    #[error(transparent)]
    Artifact(#[from] StoreError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unauthorized_is_not_transient() {
        assert!(!CatalogError::Unauthorized("401".to_string()).is_transient());
        assert!(CatalogError::RateLimited { retry_after: None }.is_transient());
        assert!(CatalogError::Transport("reset".to_string()).is_transient());
        assert!(CatalogError::MalformedBody("eof".to_string()).is_transient());
        assert!(CatalogError::Status {
            code: 503,
            message: "unavailable".to_string()
        }
        .is_transient());
    }

    #[test]
    fn test_malformed_timestamp_message_includes_raw_value() {
        let error = MalformedTimestamp::new("yesterday");
        assert_eq!(error.to_string(), "malformed timestamp 'yesterday'");
    }
}
