//! Error types for dataset acquisition.

use crate::types::Split;
use reqwest::StatusCode;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur while acquiring a dataset.
#[derive(Error, Debug)]
pub enum DatasetError {
    /// The identifier is not present in the registry.
    #[error("Unknown dataset '{id}' (split: {split})")]
    UnknownDataset { id: String, split: Split },

    /// All mirrors and retries were exhausted.
    #[error("Failed to fetch {dataset} from {url}: {source}")]
    Fetch {
        dataset: String,
        url: String,
        #[source]
        source: TransferError,
    },

    /// The downloaded bytes do not match the expected digest or length.
    #[error("Integrity check failed for {dataset}/{file} from {url}: expected {expected}, got {actual}")]
    Integrity {
        dataset: String,
        file: String,
        url: String,
        expected: String,
        actual: String,
    },

    /// Permission, space or other local filesystem failure.
    #[error("Filesystem error at {}: {source}", path.display())]
    Filesystem {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The dataset table is malformed.
    #[error("Invalid dataset registry: {0}")]
    Registry(String),

    /// The dataset table is not valid JSON.
    #[error(transparent)]
    RegistryParse(#[from] serde_json::Error),

    /// The HTTP client could not be constructed.
    #[error(transparent)]
    Client(#[from] reqwest::Error),
}

impl DatasetError {
    pub(crate) fn fs(path: impl Into<PathBuf>, source: io::Error) -> Self {
        DatasetError::Filesystem {
            path: path.into(),
            source,
        }
    }
}

/// A single failed transfer attempt.
#[derive(Error, Debug)]
pub enum TransferError {
    /// Connection, protocol or body error reported by the HTTP client.
    #[error(transparent)]
    Http(#[from] reqwest::Error),

    /// The server answered with a non-success status.
    #[error("HTTP {0}")]
    Status(StatusCode),

    /// No progress within the configured timeout.
    #[error("timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// The body ended before the advertised length.
    #[error("truncated body: expected {expected} bytes, got {received}")]
    Truncated { expected: u64, received: u64 },

    /// Writing the temp file failed.
    #[error("local I/O error at {}: {source}", path.display())]
    Local {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The resource lists no URL at all.
    #[error("no source URL configured")]
    NoSources,
}

impl TransferError {
    /// Whether another attempt against the same URL may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            TransferError::Http(e) => !(e.is_builder() || e.is_redirect()),
            TransferError::Status(status) => {
                status.is_server_error()
                    || *status == StatusCode::TOO_MANY_REQUESTS
                    || *status == StatusCode::REQUEST_TIMEOUT
            }
            TransferError::Timeout(_) | TransferError::Truncated { .. } => true,
            TransferError::Local { .. } | TransferError::NoSources => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn server_errors_and_throttling_are_transient() {
        for code in [500u16, 502, 503, 429, 408] {
            let status = StatusCode::from_u16(code).unwrap();
            assert!(TransferError::Status(status).is_transient(), "{code}");
        }
    }

    #[test]
    fn client_errors_are_permanent() {
        for code in [400u16, 403, 404, 410] {
            let status = StatusCode::from_u16(code).unwrap();
            assert!(!TransferError::Status(status).is_transient(), "{code}");
        }
    }

    #[test]
    fn local_failures_are_never_retried() {
        let err = TransferError::Local {
            path: PathBuf::from("/tmp/x.part"),
            source: io::Error::new(io::ErrorKind::PermissionDenied, "denied"),
        };
        assert!(!err.is_transient());
        assert!(TransferError::Timeout(Duration::from_secs(30)).is_transient());
        assert!(TransferError::Truncated {
            expected: 10,
            received: 4
        }
        .is_transient());
    }

    #[test]
    fn errors_carry_context() {
        let err = DatasetError::Fetch {
            dataset: "MNIST".into(),
            url: "https://example.com/a.gz".into(),
            source: TransferError::Status(StatusCode::SERVICE_UNAVAILABLE),
        };
        let msg = err.to_string();
        assert!(msg.contains("MNIST"));
        assert!(msg.contains("https://example.com/a.gz"));
        assert!(msg.contains("503"));
    }
}
