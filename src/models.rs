// src/models.rs

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use uuid::Uuid;

use crate::error::ExecutionError;

/// Stable external handle of a transfer or chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TransferId(pub Uuid);

impl TransferId {
    /// Generate a fresh random identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for TransferId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TransferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for TransferId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferKind {
    Upload,
    Download,
}

/// Lifecycle state shared by top-level transfers and their chunks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferState {
    Pending,
    InProgress,
    Paused,
    Complete,
    Failed,
    Cancelled,
}

impl TransferState {
    /// `Complete`, `Failed` and `Cancelled` admit no further automatic transitions.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Failed | Self::Cancelled)
    }

    /// Name used in the store's indexed `state` column.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Paused => "paused",
            Self::Complete => "complete",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for TransferState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One side of a transfer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Endpoint {
    /// An object in the remote store, addressed as `container/blob`.
    Remote { container: String, blob: String },
    Local(PathBuf),
}

impl Endpoint {
    pub fn remote(container: impl Into<String>, blob: impl Into<String>) -> Self {
        Self::Remote {
            container: container.into(),
            blob: blob.into(),
        }
    }

    pub fn local(path: impl Into<PathBuf>) -> Self {
        Self::Local(path.into())
    }

    /// `container/blob` for remote endpoints.
    pub fn remote_path(&self) -> Option<String> {
        match self {
            Self::Remote { container, blob } => Some(format!("{}/{}", container, blob)),
            Self::Local(_) => None,
        }
    }

    pub fn local_path(&self) -> Option<&Path> {
        match self {
            Self::Local(path) => Some(path),
            Self::Remote { .. } => None,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Remote { container, blob } => write!(f, "{}/{}", container, blob),
            Self::Local(path) => write!(f, "{}", path.display()),
        }
    }
}

/// What a record stands for inside its transfer tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkRole {
    /// A top-level transfer; its state is derived from its chunks.
    Transfer,
    /// A byte range of a download.
    Range,
    /// First range of a download whose total size is not yet known.
    Probe,
    /// One block of an upload.
    Block,
    /// Final block-list commit of an upload.
    Commit,
    /// Final digest check of a download.
    Verify,
}

impl ChunkRole {
    /// Data chunks move payload bytes; finishing steps wait for all of them.
    pub fn is_data(self) -> bool {
        matches!(self, Self::Range | Self::Probe | Self::Block)
    }

    pub fn is_finishing_step(self) -> bool {
        matches!(self, Self::Commit | Self::Verify)
    }
}

/// Byte-level progress snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Progress {
    pub bytes_transferred: u64,
    /// `None` while the size is still unknown.
    pub total_bytes: Option<u64>,
}

impl Progress {
    /// Fraction in `0.0..=1.0` when the total is known.
    pub fn fraction(&self) -> Option<f32> {
        match self.total_bytes {
            Some(0) => Some(1.0),
            Some(total) => Some(self.bytes_transferred as f32 / total as f32),
            None => None,
        }
    }
}

/// The persisted unit: a top-level transfer or one of its chunks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferRecord {
    pub id: TransferId,
    pub kind: TransferKind,
    pub source: Endpoint,
    pub destination: Endpoint,
    pub start_offset: u64,
    pub end_offset: Option<u64>,
    pub state: TransferState,
    pub bytes_transferred: u64,
    pub parent_id: Option<TransferId>,
    pub block_id: Option<String>,
    pub role: ChunkRole,
    /// Expected SHA-256 (hex) of a downloaded object.
    pub content_sha256: Option<String>,
    pub error: Option<ExecutionError>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TransferRecord {
    /// A new top-level transfer in the `Pending` state.
    pub fn new(
        kind: TransferKind,
        source: Endpoint,
        destination: Endpoint,
        start_offset: u64,
        end_offset: Option<u64>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: TransferId::new(),
            kind,
            source,
            destination,
            start_offset,
            end_offset,
            state: TransferState::Pending,
            bytes_transferred: 0,
            parent_id: None,
            block_id: None,
            role: ChunkRole::Transfer,
            content_sha256: None,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// A chunk of `self` covering `[start, end)`.
    pub fn child(&self, role: ChunkRole, start: u64, end: u64) -> Self {
        let now = Utc::now();
        Self {
            id: TransferId::new(),
            kind: self.kind,
            source: self.source.clone(),
            destination: self.destination.clone(),
            start_offset: start,
            end_offset: Some(end),
            state: TransferState::Pending,
            bytes_transferred: 0,
            parent_id: Some(self.id),
            block_id: None,
            role,
            content_sha256: None,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_top_level(&self) -> bool {
        self.parent_id.is_none()
    }

    /// Bytes covered by this record, once known.
    pub fn total_bytes(&self) -> Option<u64> {
        self.end_offset.map(|end| end.saturating_sub(self.start_offset))
    }

    pub fn progress(&self) -> Progress {
        Progress {
            bytes_transferred: self.bytes_transferred,
            total_bytes: self.total_bytes(),
        }
    }

    /// The endpoint on this device.
    pub fn local_endpoint(&self) -> &Endpoint {
        match self.kind {
            TransferKind::Download => &self.destination,
            TransferKind::Upload => &self.source,
        }
    }

    /// The endpoint in the remote store.
    pub fn remote_endpoint(&self) -> &Endpoint {
        match self.kind {
            TransferKind::Download => &self.source,
            TransferKind::Upload => &self.destination,
        }
    }

    /// Set `state` and bump `updated_at`.
    pub fn set_state(&mut self, state: TransferState) {
        self.state = state;
        self.touch();
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}
