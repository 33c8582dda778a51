// src/error.rs

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::TransferId;

/// Errors surfaced synchronously to callers of the manager.
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("invalid transfer: {0}")]
    Invalid(#[from] InvalidTransferError),
    #[error("persistence error: {0}")]
    Persistence(#[from] PersistenceError),
    #[error("transfer {0} not found")]
    NotFound(TransferId),
    #[error("transfer manager is already running")]
    AlreadyRunning,
}

/// A transfer request that can never be planned. Rejected at `add`, never persisted.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum InvalidTransferError {
    #[error("{kind} requires a {expected} source and a {other} destination")]
    WrongDirection {
        kind: &'static str,
        expected: &'static str,
        other: &'static str,
    },
    #[error("remote endpoint is malformed: {0}")]
    MalformedRemote(String),
    #[error("local path is empty")]
    EmptyLocalPath,
    #[error("range end {end} precedes start {start}")]
    InvertedRange { start: u64, end: u64 },
    #[error("upload source {path} is unreadable: {reason}")]
    UnreadableSource { path: String, reason: String },
    #[error("chunk size must be greater than zero")]
    ZeroChunkSize,
}

/// Store failures. Fatal to the operation that hit them.
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("database error: {0}")]
    Database(#[from] tokio_rusqlite::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("database query failed: {0}")]
    Query(#[from] rusqlite::Error),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Outcome of a failed chunk execution.
///
/// Transient variants are retried by the manager; everything else fails the
/// owning transfer. The value is persisted on the failed record so it can be
/// inspected after a restart.
#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "detail")]
pub enum ExecutionError {
    #[error("network error: {0}")]
    Network(String),
    #[error("request timed out")]
    Timeout,
    #[error("server error: HTTP {0}")]
    Server(u16),
    #[error("not authorized: HTTP {0}")]
    Unauthorized(u16),
    #[error("remote object not found")]
    NotFound,
    #[error("request rejected: HTTP {0}")]
    Rejected(u16),
    #[error("checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },
    #[error("local io error: {0}")]
    Io(String),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("chunk execution aborted")]
    Aborted,
}

impl ExecutionError {
    /// Classify an HTTP status that is not a success.
    pub fn from_status(status: u16) -> Self {
        match status {
            401 | 403 => Self::Unauthorized(status),
            404 => Self::NotFound,
            408 | 429 | 500..=599 => Self::Server(status),
            _ => Self::Rejected(status),
        }
    }

    /// Network, timeout and 5xx-equivalent failures are worth retrying.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Network(_) | Self::Timeout | Self::Server(_))
    }
}

impl From<std::io::Error> for ExecutionError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}
