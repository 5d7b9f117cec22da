//! Error types for minishard

use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    // === I/O Errors ===
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Corrupted data: {0}")]
    Corrupted(String),

    #[error("Update log error: {0}")]
    UpdateLog(String),

    // === Write Path Errors ===
    #[error("No registered leader was found for {collection}/{shard}")]
    NoLeader { collection: String, shard: String },

    #[error("Write rejected by replica {replica}: {reason}")]
    WriteRejected { replica: String, reason: String },

    #[error("Replica {0} is not active")]
    ReplicaNotActive(String),

    // === Cluster State Errors ===
    #[error("Timed out after {waited:?} waiting for state of collection {collection}")]
    StateWaitTimeout { collection: String, waited: Duration },

    #[error("Coordination substrate unavailable: {0}")]
    CoordinationUnavailable(String),

    #[error("Version conflict on {0}")]
    VersionConflict(String),

    #[error("Collection not found: {0}")]
    CollectionNotFound(String),

    #[error("Collection already exists: {0}")]
    CollectionExists(String),

    #[error("Shard not found: {collection}/{shard}")]
    ShardNotFound { collection: String, shard: String },

    #[error("Replica not found: {collection}/{shard}/{replica}")]
    ReplicaNotFound {
        collection: String,
        shard: String,
        replica: String,
    },

    // === Election / Lifecycle Errors ===
    #[error("Replica {replica} with role {role} cannot take part in leader election")]
    IneligibleRole { replica: String, role: String },

    #[error("Illegal transition for {replica}: {from} on {event}")]
    IllegalTransition {
        replica: String,
        from: String,
        event: String,
    },

    // === Replication Errors ===
    #[error("Catch-up failed on {replica}: {reason}")]
    CatchUpFailed { replica: String, reason: String },

    // === Placement Errors ===
    #[error("Insufficient nodes: need {needed}, have {available}")]
    InsufficientNodes { needed: usize, available: usize },

    // === Network Errors ===
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    // === Metadata Errors ===
    #[error("RocksDB error: {0}")]
    RocksDb(#[from] rocksdb::Error),

    #[error("Metadata corrupted: {0}")]
    MetadataCorrupted(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    // === Request / Config Errors ===
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Unknown cluster property: {0}")]
    UnknownClusterProperty(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // === Generic ===
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Operation timeout: {0}")]
    Timeout(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Is this a retryable error?
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Timeout(_) | Error::ConnectionFailed(_) | Error::VersionConflict(_)
        )
    }

    /// Short machine-readable kind, used in API responses.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::NoLeader { .. } => "no_leader",
            Error::WriteRejected { .. } => "write_rejected_by_replica",
            Error::StateWaitTimeout { .. } => "state_wait_timeout",
            Error::CoordinationUnavailable(_) => "coordination_unavailable",
            Error::CatchUpFailed { .. } => "replication_catch_up_failure",
            Error::CollectionNotFound(_)
            | Error::ShardNotFound { .. }
            | Error::ReplicaNotFound { .. } => "not_found",
            Error::CollectionExists(_) => "already_exists",
            Error::InvalidRequest(_)
            | Error::UnknownClusterProperty(_)
            | Error::IneligibleRole { .. } => "invalid_request",
            Error::InsufficientNodes { .. } => "insufficient_nodes",
            Error::Timeout(_) => "timeout",
            _ => "internal",
        }
    }

    /// Convert to HTTP status code
    pub fn to_http_status(&self) -> axum::http::StatusCode {
        use axum::http::StatusCode;
        match self {
            Error::CollectionNotFound(_)
            | Error::ShardNotFound { .. }
            | Error::ReplicaNotFound { .. } => StatusCode::NOT_FOUND,
            Error::CollectionExists(_) | Error::VersionConflict(_) => StatusCode::CONFLICT,
            Error::InvalidRequest(_)
            | Error::InvalidConfig(_)
            | Error::UnknownClusterProperty(_)
            | Error::IneligibleRole { .. } => StatusCode::BAD_REQUEST,
            Error::WriteRejected { .. } => StatusCode::FORBIDDEN,
            Error::StateWaitTimeout { .. } | Error::Timeout(_) => StatusCode::REQUEST_TIMEOUT,
            Error::NoLeader { .. }
            | Error::ReplicaNotActive(_)
            | Error::CoordinationUnavailable(_)
            | Error::InsufficientNodes { .. }
            | Error::ConnectionFailed(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

// Implement From for common error types
impl From<&str> for Error {
    fn from(s: &str) -> Self {
        Error::Other(s.to_string())
    }
}

impl From<String> for Error {
    fn from(s: String) -> Self {
        Error::Other(s)
    }
}

impl From<anyhow::Error> for Error {
    fn from(e: anyhow::Error) -> Self {
        Error::Other(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}
