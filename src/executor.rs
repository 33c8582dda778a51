// src/executor.rs

use async_trait::async_trait;
use bytes::Bytes;
use std::path::Path;
use tokio::fs::OpenOptions;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, SeekFrom};
use tracing::debug;

use crate::error::ExecutionError;
use crate::integrity;
use crate::limiter::SpeedLimiter;
use crate::models::{ChunkRole, Endpoint, TransferRecord};
use crate::pipeline::{Pipeline, PipelineRequest};

/// One unit of network work, with everything the executor needs to run it.
#[derive(Debug, Clone, PartialEq)]
pub enum ChunkJob {
    /// Ranged read into the local destination. Also used for probes.
    Range { chunk: TransferRecord },
    /// Send one block of the local source.
    Block { chunk: TransferRecord },
    /// Commit the ordered block list of an upload.
    Commit {
        chunk: TransferRecord,
        block_ids: Vec<String>,
    },
    /// Hash the finished download.
    Verify {
        chunk: TransferRecord,
        expected_sha256: String,
    },
}

impl ChunkJob {
    /// Build the job for `chunk`, pulling commit and verify inputs from its family.
    pub fn build(
        chunk: &TransferRecord,
        parent: &TransferRecord,
        siblings: &[TransferRecord],
    ) -> Result<Self, ExecutionError> {
        let job = match chunk.role {
            ChunkRole::Range | ChunkRole::Probe => Self::Range {
                chunk: chunk.clone(),
            },
            ChunkRole::Block => Self::Block {
                chunk: chunk.clone(),
            },
            ChunkRole::Commit => {
                let mut blocks: Vec<&TransferRecord> = siblings
                    .iter()
                    .filter(|c| c.role == ChunkRole::Block && c.total_bytes().unwrap_or(0) > 0)
                    .collect();
                blocks.sort_by_key(|c| c.start_offset);
                let block_ids = blocks
                    .into_iter()
                    .map(|c| {
                        c.block_id
                            .clone()
                            .ok_or_else(|| ExecutionError::Protocol("block without an id".into()))
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                Self::Commit {
                    chunk: chunk.clone(),
                    block_ids,
                }
            }
            ChunkRole::Verify => Self::Verify {
                chunk: chunk.clone(),
                expected_sha256: parent.content_sha256.clone().ok_or_else(|| {
                    ExecutionError::Protocol("verify step without an expected digest".into())
                })?,
            },
            ChunkRole::Transfer => {
                return Err(ExecutionError::Protocol(
                    "a top-level transfer is not executable".into(),
                ))
            }
        };
        Ok(job)
    }

    pub fn chunk(&self) -> &TransferRecord {
        match self {
            Self::Range { chunk }
            | Self::Block { chunk }
            | Self::Commit { chunk, .. }
            | Self::Verify { chunk, .. } => chunk,
        }
    }
}

/// What a successful execution did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ChunkOutcome {
    pub bytes_written: u64,
    /// Absolute end of the remote object, when the response revealed it.
    pub object_size: Option<u64>,
}

impl ChunkOutcome {
    pub fn bytes(bytes_written: u64) -> Self {
        Self {
            bytes_written,
            object_size: None,
        }
    }
}

/// Performs the network and file I/O of a single chunk.
///
/// Implementations must be safe to re-run: executing the same job again only
/// rewrites its own byte range or re-sends its own block.
#[async_trait]
pub trait ChunkExecutor: Send + Sync {
    async fn execute(&self, job: &ChunkJob) -> Result<ChunkOutcome, ExecutionError>;

    /// Change the bandwidth cap; `0` lifts it. Executors without one ignore it.
    async fn set_rate_limit(&self, _rate_bytes_per_sec: u64) {}
}

/// Executes chunks against a block-blob style service through a [`Pipeline`].
pub struct HttpChunkExecutor<P> {
    pipeline: P,
    limiter: SpeedLimiter,
}

impl<P: Pipeline> HttpChunkExecutor<P> {
    pub fn new(pipeline: P) -> Self {
        Self {
            pipeline,
            limiter: SpeedLimiter::new(0),
        }
    }

    pub fn with_limiter(mut self, limiter: SpeedLimiter) -> Self {
        self.limiter = limiter;
        self
    }

    async fn throttle(&self, bytes: u64) {
        self.limiter.take(bytes).await;
    }

    async fn download_range(&self, chunk: &TransferRecord) -> Result<ChunkOutcome, ExecutionError> {
        let path = remote_path(&chunk.source)?;
        let dest = local_path(&chunk.destination)?;
        let start = chunk.start_offset;
        let end = chunk
            .end_offset
            .ok_or_else(|| ExecutionError::Protocol("range chunk without an end offset".into()))?;
        if end <= start {
            write_at(dest, start, &[]).await?;
            return Ok(ChunkOutcome::default());
        }

        let resp = self
            .pipeline
            .send(PipelineRequest::get(path).with_range(start, end))
            .await?;

        // An empty object, or a probe starting at its end, answers 416.
        if resp.status == 416 && chunk.role == ChunkRole::Probe {
            write_at(dest, start, &[]).await?;
            return Ok(ChunkOutcome {
                bytes_written: 0,
                object_size: resp.content_range_total(),
            });
        }
        let resp = resp.error_for_status()?;

        let wanted = (end - start) as usize;
        let (body, object_size) = if resp.status == 206 {
            let total = resp.content_range_total();
            (resp.body, total)
        } else {
            if start != 0 {
                return Err(ExecutionError::Protocol(
                    "server ignored the range request".into(),
                ));
            }
            let total = resp.body.len() as u64;
            (resp.body, Some(total))
        };
        let body: Bytes = if body.len() > wanted {
            body.slice(..wanted)
        } else {
            body
        };
        if chunk.role == ChunkRole::Range && body.len() < wanted {
            return Err(ExecutionError::Network(format!(
                "short read: {} of {} bytes",
                body.len(),
                wanted
            )));
        }

        self.throttle(body.len() as u64).await;
        write_at(dest, start, &body).await?;
        debug!(chunk = %chunk.id, start, bytes = body.len(), "range written");
        Ok(ChunkOutcome {
            bytes_written: body.len() as u64,
            object_size,
        })
    }

    async fn upload_block(&self, chunk: &TransferRecord) -> Result<ChunkOutcome, ExecutionError> {
        let source = local_path(&chunk.source)?;
        let path = remote_path(&chunk.destination)?;
        let block_id = chunk
            .block_id
            .as_deref()
            .ok_or_else(|| ExecutionError::Protocol("block chunk without a block id".into()))?;
        let len = chunk.total_bytes().unwrap_or(0);

        let data = read_at(source, chunk.start_offset, len).await?;
        self.throttle(len).await;
        let request = PipelineRequest::put(path, Bytes::from(data))
            .with_query("comp", "block")
            .with_query("blockid", block_id);
        self.pipeline.send(request).await?.error_for_status()?;
        debug!(chunk = %chunk.id, block_id, bytes = len, "block sent");
        Ok(ChunkOutcome::bytes(len))
    }

    async fn commit_blocks(
        &self,
        chunk: &TransferRecord,
        block_ids: &[String],
    ) -> Result<ChunkOutcome, ExecutionError> {
        let path = remote_path(&chunk.destination)?;
        let request = PipelineRequest::put(path, Bytes::from(block_list_xml(block_ids)))
            .with_query("comp", "blocklist")
            .with_header("content-type", "application/xml");
        self.pipeline.send(request).await?.error_for_status()?;
        debug!(chunk = %chunk.id, blocks = block_ids.len(), "block list committed");
        Ok(ChunkOutcome::default())
    }
}

#[async_trait]
impl<P: Pipeline> ChunkExecutor for HttpChunkExecutor<P> {
    async fn execute(&self, job: &ChunkJob) -> Result<ChunkOutcome, ExecutionError> {
        match job {
            ChunkJob::Range { chunk } => self.download_range(chunk).await,
            ChunkJob::Block { chunk } => self.upload_block(chunk).await,
            ChunkJob::Commit { chunk, block_ids } => self.commit_blocks(chunk, block_ids).await,
            ChunkJob::Verify {
                chunk,
                expected_sha256,
            } => {
                integrity::verify_sha256(local_path(&chunk.destination)?, expected_sha256).await?;
                Ok(ChunkOutcome::default())
            }
        }
    }

    async fn set_rate_limit(&self, rate_bytes_per_sec: u64) {
        self.limiter.set_rate(rate_bytes_per_sec).await;
    }
}

/// Body of a Put Block List request.
pub fn block_list_xml(block_ids: &[String]) -> String {
    let mut xml = String::from(r#"<?xml version="1.0" encoding="utf-8"?><BlockList>"#);
    for id in block_ids {
        xml.push_str("<Latest>");
        xml.push_str(id);
        xml.push_str("</Latest>");
    }
    xml.push_str("</BlockList>");
    xml
}

fn remote_path(endpoint: &Endpoint) -> Result<String, ExecutionError> {
    endpoint
        .remote_path()
        .ok_or_else(|| ExecutionError::Protocol(format!("{endpoint} is not a remote object")))
}

fn local_path(endpoint: &Endpoint) -> Result<&Path, ExecutionError> {
    endpoint
        .local_path()
        .ok_or_else(|| ExecutionError::Protocol(format!("{endpoint} is not a local path")))
}

/// Write `data` at `offset`, leaving every other byte of the file untouched.
async fn write_at(path: &Path, offset: u64, data: &[u8]) -> Result<(), ExecutionError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await?;
        }
    }
    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(false)
        .open(path)
        .await?;
    file.seek(SeekFrom::Start(offset)).await?;
    file.write_all(data).await?;
    file.sync_data().await?;
    Ok(())
}

async fn read_at(path: &Path, offset: u64, len: u64) -> Result<Vec<u8>, ExecutionError> {
    let mut file = tokio::fs::File::open(path).await?;
    file.seek(SeekFrom::Start(offset)).await?;
    let mut buf = vec![0u8; len as usize];
    file.read_exact(&mut buf).await?;
    Ok(buf)
}
