use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur while fetching, decoding, reading or walking
/// catalogs.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum Error {
    /// The storage or network read failed.
    #[error("unable to fetch catalog: {0}")]
    Fetch(String),

    /// The store answered, but doesn't have the blob. Reported with the
    /// [ErrorKind::Fetch] kind.
    #[error("not found: {0}")]
    NotFound(String),

    /// Decompression failed, or the blob does not match its content hash.
    #[error("unable to decode catalog: {0}")]
    Decode(String),

    /// The expected catalog tables or columns are absent or malformed.
    #[error("incompatible catalog schema: {0}")]
    Schema(String),

    /// A duplicate mount path or a cycle was observed.
    #[error("invariant violated: {0}")]
    InvariantViolation(String),

    #[error("time budget of {0:?} exceeded")]
    Timeout(Duration),

    #[error("invalid catalog hash: {0}")]
    InvalidHash(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

/// The kind of an [Error], without its message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Fetch,
    Decode,
    Schema,
    InvariantViolation,
    Timeout,
    InvalidHash,
    InvalidRequest,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Fetch(_) | Error::NotFound(_) => ErrorKind::Fetch,
            Error::Decode(_) => ErrorKind::Decode,
            Error::Schema(_) => ErrorKind::Schema,
            Error::InvariantViolation(_) => ErrorKind::InvariantViolation,
            Error::Timeout(_) => ErrorKind::Timeout,
            Error::InvalidHash(_) => ErrorKind::InvalidHash,
            Error::InvalidRequest(_) => ErrorKind::InvalidRequest,
        }
    }

    /// Errors scoped to a single catalog. The walker turns these into a
    /// partial marker on the parent instead of aborting.
    pub fn is_catalog_local(&self) -> bool {
        matches!(
            self,
            Error::Fetch(_) | Error::NotFound(_) | Error::Decode(_) | Error::Schema(_)
        )
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorKind::Fetch => "fetch",
            ErrorKind::Decode => "decode",
            ErrorKind::Schema => "schema",
            ErrorKind::InvariantViolation => "invariant_violation",
            ErrorKind::Timeout => "timeout",
            ErrorKind::InvalidHash => "invalid_hash",
            ErrorKind::InvalidRequest => "invalid_request",
        };
        f.write_str(s)
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        if value.kind() == std::io::ErrorKind::InvalidInput {
            Error::InvalidRequest(value.to_string())
        } else {
            Error::Fetch(value.to_string())
        }
    }
}

impl From<rusqlite::Error> for Error {
    fn from(value: rusqlite::Error) -> Self {
        Error::Schema(value.to_string())
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(value: tokio::task::JoinError) -> Self {
        Error::Fetch(format!("background task failed: {}", value))
    }
}
