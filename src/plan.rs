// src/plan.rs

//! Chunk planning: how a transfer is split into independently retryable pieces.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use std::path::PathBuf;

use crate::config::ManagerConfig;
use crate::error::InvalidTransferError;
use crate::models::{ChunkRole, Endpoint, TransferKind, TransferRecord, TransferState};

/// What a caller asks the manager to move.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferRequest {
    pub kind: TransferKind,
    pub source: Endpoint,
    pub destination: Endpoint,
    pub start_offset: u64,
    /// Exclusive end of a download range; `None` reads to the end of the object.
    pub end_offset: Option<u64>,
    pub content_sha256: Option<String>,
}

impl TransferRequest {
    /// Download `container/blob` into `destination`.
    pub fn download(
        container: impl Into<String>,
        blob: impl Into<String>,
        destination: impl Into<PathBuf>,
    ) -> Self {
        Self {
            kind: TransferKind::Download,
            source: Endpoint::remote(container, blob),
            destination: Endpoint::local(destination),
            start_offset: 0,
            end_offset: None,
            content_sha256: None,
        }
    }

    /// Upload the local file `source` as `container/blob`.
    pub fn upload(
        source: impl Into<PathBuf>,
        container: impl Into<String>,
        blob: impl Into<String>,
    ) -> Self {
        Self {
            kind: TransferKind::Upload,
            source: Endpoint::local(source),
            destination: Endpoint::remote(container, blob),
            start_offset: 0,
            end_offset: None,
            content_sha256: None,
        }
    }

    /// Restrict a download to `[start, end)`; with `end = None` the size is
    /// learned from the first response.
    pub fn with_range(mut self, start: u64, end: Option<u64>) -> Self {
        self.start_offset = start;
        self.end_offset = end;
        self
    }

    /// Expected SHA-256 (hex) of the downloaded bytes.
    pub fn with_sha256(mut self, digest: impl Into<String>) -> Self {
        self.content_sha256 = Some(digest.into());
        self
    }
}

/// A persisted-to-be transfer and its chunks, ordered data first then finishing steps.
#[derive(Debug, Clone)]
pub struct Plan {
    pub parent: TransferRecord,
    pub chunks: Vec<TransferRecord>,
}

/// Validate `request`, resolve upload sizes and compute the chunk plan.
pub async fn plan_transfer(
    request: TransferRequest,
    config: &ManagerConfig,
) -> Result<Plan, InvalidTransferError> {
    validate(&request, config)?;

    let end_offset = match request.kind {
        TransferKind::Download => request.end_offset,
        TransferKind::Upload => Some(source_size(&request.source).await?),
    };
    let start_offset = match request.kind {
        TransferKind::Download => request.start_offset,
        TransferKind::Upload => 0,
    };

    let mut parent = TransferRecord::new(
        request.kind,
        request.source,
        request.destination,
        start_offset,
        end_offset,
    );
    parent.content_sha256 = request.content_sha256;

    let chunks = match parent.kind {
        TransferKind::Download => plan_download(&parent, config),
        TransferKind::Upload => plan_upload(&parent, config),
    };
    Ok(Plan { parent, chunks })
}

fn validate(request: &TransferRequest, config: &ManagerConfig) -> Result<(), InvalidTransferError> {
    let (remote, local) = match (request.kind, &request.source, &request.destination) {
        (TransferKind::Download, remote @ Endpoint::Remote { .. }, Endpoint::Local(path)) => {
            (remote, path)
        }
        (TransferKind::Upload, Endpoint::Local(path), remote @ Endpoint::Remote { .. }) => {
            (remote, path)
        }
        (TransferKind::Download, _, _) => {
            return Err(InvalidTransferError::WrongDirection {
                kind: "download",
                expected: "remote",
                other: "local",
            })
        }
        (TransferKind::Upload, _, _) => {
            return Err(InvalidTransferError::WrongDirection {
                kind: "upload",
                expected: "local",
                other: "remote",
            })
        }
    };

    if let Endpoint::Remote { container, blob } = remote {
        if container.is_empty() || blob.is_empty() {
            return Err(InvalidTransferError::MalformedRemote(remote.to_string()));
        }
        if container.contains('/') {
            return Err(InvalidTransferError::MalformedRemote(format!(
                "container name {container:?} contains '/'"
            )));
        }
    }
    if local.as_os_str().is_empty() {
        return Err(InvalidTransferError::EmptyLocalPath);
    }
    if let Some(end) = request.end_offset {
        if end < request.start_offset {
            return Err(InvalidTransferError::InvertedRange {
                start: request.start_offset,
                end,
            });
        }
    }
    let chunk_size = match request.kind {
        TransferKind::Download => config.download_chunk_size,
        TransferKind::Upload => config.upload_block_size,
    };
    if chunk_size == 0 {
        return Err(InvalidTransferError::ZeroChunkSize);
    }
    Ok(())
}

async fn source_size(source: &Endpoint) -> Result<u64, InvalidTransferError> {
    let Some(path) = source.local_path() else {
        return Err(InvalidTransferError::EmptyLocalPath);
    };
    let unreadable = |reason: String| InvalidTransferError::UnreadableSource {
        path: path.display().to_string(),
        reason,
    };
    let metadata = tokio::fs::metadata(path)
        .await
        .map_err(|e| unreadable(e.to_string()))?;
    if !metadata.is_file() {
        return Err(unreadable("not a regular file".into()));
    }
    // Metadata alone does not prove the bytes can be read.
    tokio::fs::File::open(path)
        .await
        .map_err(|e| unreadable(e.to_string()))?;
    Ok(metadata.len())
}

/// Chunks for a download.
pub fn plan_download(parent: &TransferRecord, config: &ManagerConfig) -> Vec<TransferRecord> {
    let start = parent.start_offset;
    let chunk_size = config.download_chunk_size;

    let mut chunks = match parent.end_offset {
        None => vec![parent.child(ChunkRole::Probe, start, start.saturating_add(chunk_size))],
        Some(end) if end == start => {
            let mut only = parent.child(ChunkRole::Range, start, end);
            only.set_state(TransferState::Complete);
            return vec![only];
        }
        Some(end) if end - start > config.download_split_threshold => {
            split_ranges(parent, ChunkRole::Range, start, end, chunk_size)
        }
        Some(end) => vec![parent.child(ChunkRole::Range, start, end)],
    };

    if parent.content_sha256.is_some() {
        chunks.push(parent.child(ChunkRole::Verify, start, start));
    }
    chunks
}

/// Range chunks for the rest of a download after its probe learned the object size.
///
/// `probe` must already be trimmed to the bytes it wrote and `parent.end_offset`
/// set to the object end.
pub fn plan_after_probe(
    parent: &TransferRecord,
    probe: &TransferRecord,
    config: &ManagerConfig,
) -> Vec<TransferRecord> {
    let resume_at = probe.end_offset.unwrap_or(probe.start_offset);
    match parent.end_offset {
        Some(end) if end > resume_at => {
            if end - resume_at > config.download_split_threshold {
                split_ranges(
                    parent,
                    ChunkRole::Range,
                    resume_at,
                    end,
                    config.download_chunk_size,
                )
            } else {
                vec![parent.child(ChunkRole::Range, resume_at, end)]
            }
        }
        _ => Vec::new(),
    }
}

/// Blocks and the final commit for an upload.
pub fn plan_upload(parent: &TransferRecord, config: &ManagerConfig) -> Vec<TransferRecord> {
    let size = parent.end_offset.unwrap_or(0);
    let mut chunks = if size == 0 {
        let mut only = parent.child(ChunkRole::Block, 0, 0);
        only.block_id = Some(block_id(parent, 0));
        only.set_state(TransferState::Complete);
        vec![only]
    } else {
        split_ranges(parent, ChunkRole::Block, 0, size, config.upload_block_size)
    };
    for (index, chunk) in chunks.iter_mut().enumerate() {
        if chunk.block_id.is_none() {
            chunk.block_id = Some(block_id(parent, index));
        }
    }
    chunks.push(parent.child(ChunkRole::Commit, size, size));
    chunks
}

fn split_ranges(
    parent: &TransferRecord,
    role: ChunkRole,
    start: u64,
    end: u64,
    chunk_size: u64,
) -> Vec<TransferRecord> {
    let chunk_size = chunk_size.max(1);
    let mut chunks = Vec::with_capacity(((end - start) / chunk_size + 1) as usize);
    let mut offset = start;
    while offset < end {
        let chunk_end = offset.saturating_add(chunk_size).min(end);
        chunks.push(parent.child(role, offset, chunk_end));
        offset = chunk_end;
    }
    chunks
}

/// Block ids must have the same length for every block of one object.
fn block_id(parent: &TransferRecord, index: usize) -> String {
    BASE64.encode(format!("{}-{:06}", parent.id.as_uuid().simple(), index))
}
