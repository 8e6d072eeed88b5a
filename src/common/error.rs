//! Error types for minicatalog

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    // === I/O Errors ===
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // === Consensus Errors ===
    #[error("Not primary: current leader is {}", .0.as_deref().unwrap_or("unknown"))]
    NotPrimary(Option<String>),

    #[error("Operation timeout: {0}")]
    Timeout(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Member {member} is not electable: {reason}")]
    NotElectable { member: String, reason: String },

    #[error("Unknown replica member: {0}")]
    UnknownMember(String),

    // === Catalog Errors ===
    /// Not a failure: the connection target was already registered.
    #[error("Shard {shard_id} already registered for {target}")]
    DuplicateIgnored { shard_id: String, target: String },

    /// Resolved inside the caches by flushing and reloading.
    #[error("Stale read on {key}: have version {have}, need {need}")]
    StaleRead { key: String, have: u64, need: u64 },

    #[error("No shards registered")]
    NoShards,

    #[error("Shard not found: {0}")]
    ShardNotFound(String),

    #[error("Database not found: {0}")]
    DatabaseNotFound(String),

    #[error("Namespace not found: {0}")]
    NamespaceNotFound(String),

    #[error("No document {id} in {namespace}")]
    DocumentNotFound { namespace: String, id: String },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    // === Storage Errors ===
    #[error("Corrupted data: {0}")]
    Corrupted(String),

    #[error("RocksDB error: {0}")]
    RocksDb(#[from] rocksdb::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    // === Network Errors ===
    #[error("HTTP error: {0}")]
    Http(String),

    // === Config Errors ===
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // === Generic ===
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Is this a retryable error?
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::NotPrimary(_)
                | Error::Timeout(_)
                | Error::Http(_)
                | Error::NotElectable { .. }
                | Error::StaleRead { .. }
        )
    }

    /// Named condition reported to administrative clients.
    pub fn code(&self) -> &'static str {
        match self {
            Error::Io(_) => "IoError",
            Error::NotPrimary(_) => "NotPrimary",
            Error::Timeout(_) => "Timeout",
            Error::Cancelled => "Cancelled",
            Error::NotElectable { .. } => "NotElectable",
            Error::UnknownMember(_) => "UnknownMember",
            Error::DuplicateIgnored { .. } => "DuplicateIgnored",
            Error::StaleRead { .. } => "StaleRead",
            Error::NoShards => "NoShards",
            Error::ShardNotFound(_) => "ShardNotFound",
            Error::DatabaseNotFound(_) => "DatabaseNotFound",
            Error::NamespaceNotFound(_) => "NamespaceNotFound",
            Error::DocumentNotFound { .. } => "NoMatchingDocument",
            Error::InvalidArgument(_) => "InvalidArgument",
            Error::Corrupted(_) => "Corrupted",
            Error::RocksDb(_) => "StorageError",
            Error::Serialization(_) => "SerializationError",
            Error::Http(_) => "HostUnreachable",
            Error::InvalidConfig(_) => "InvalidOptions",
            Error::Internal(_) => "InternalError",
        }
    }

    /// Leader hint carried by a `NotPrimary` error.
    pub fn leader_hint(&self) -> Option<&str> {
        match self {
            Error::NotPrimary(leader) => leader.as_deref(),
            _ => None,
        }
    }

    /// Convert to HTTP status code
    pub fn to_http_status(&self) -> axum::http::StatusCode {
        use axum::http::StatusCode;
        match self {
            Error::NotPrimary(_) => StatusCode::TEMPORARY_REDIRECT,
            Error::InvalidArgument(_) | Error::InvalidConfig(_) => StatusCode::BAD_REQUEST,
            Error::ShardNotFound(_)
            | Error::DatabaseNotFound(_)
            | Error::NamespaceNotFound(_)
            | Error::DocumentNotFound { .. }
            | Error::UnknownMember(_) => StatusCode::NOT_FOUND,
            Error::Timeout(_) => StatusCode::REQUEST_TIMEOUT,
            Error::NoShards | Error::NotElectable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Error::DuplicateIgnored { .. } => StatusCode::OK,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Error::Timeout(e.to_string())
        } else {
            Error::Http(e.to_string())
        }
    }
}

impl From<tokio::time::error::Elapsed> for Error {
    fn from(e: tokio::time::error::Elapsed) -> Self {
        Error::Timeout(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_kinds() {
        assert!(Error::NotPrimary(None).is_retryable());
        assert!(Error::Timeout("majority".into()).is_retryable());
        assert!(!Error::Corrupted("crc".into()).is_retryable());
        assert!(!Error::InvalidArgument("empty".into()).is_retryable());
    }

    #[test]
    fn test_not_primary_carries_hint() {
        let err = Error::NotPrimary(Some("cfg-2".into()));
        assert_eq!(err.leader_hint(), Some("cfg-2"));
        assert_eq!(err.code(), "NotPrimary");
        assert_eq!(
            err.to_http_status(),
            axum::http::StatusCode::TEMPORARY_REDIRECT
        );
        assert!(err.to_string().contains("cfg-2"));
        assert!(Error::NotPrimary(None).to_string().contains("unknown"));
    }
}
