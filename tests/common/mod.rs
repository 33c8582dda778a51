//! Shared fixtures for the integration tests: a scripted chunk executor, an
//! in-process blob service speaking the block-blob subset the HTTP executor
//! uses, and polling helpers.

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

use blob_transfer::prelude::*;
use blob_transfer::pipeline::{Method, PipelineError};

pub const MIB: u64 = 1024 * 1024;

// ============================================================================
// Manager helpers
// ============================================================================

/// Config with millisecond backoff so retry tests stay fast.
pub fn test_config() -> ManagerConfig {
    ManagerConfig::new()
        .with_download_chunk_size(2 * MIB)
        .with_download_split_threshold(2 * MIB)
        .with_retry(RetryPolicy::exponential(3).with_initial_delay(Duration::from_millis(1)))
}

pub async fn manager_with(
    store: Arc<dyn TransferStore>,
    executor: Arc<dyn ChunkExecutor>,
    config: ManagerConfig,
) -> TransferManager {
    TransferManager::new(store, executor, config)
        .await
        .expect("manager starts")
}

/// Spawn the dispatcher of `manager`.
pub fn spawn_dispatcher(manager: &TransferManager) -> JoinHandle<Result<(), TransferError>> {
    let manager = manager.clone();
    tokio::spawn(async move { manager.run().await })
}

/// Poll `check` until it holds, panicking after five seconds.
pub async fn wait_for<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !check().await {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

pub async fn wait_for_state(manager: &TransferManager, id: &TransferId, state: TransferState) {
    wait_for(&format!("transfer to become {state}"), || async {
        manager.get(id).await.map(|t| t.state) == Some(state)
    })
    .await;
}

pub async fn chunk_states(manager: &TransferManager, id: &TransferId) -> Vec<TransferState> {
    manager
        .chunks(id)
        .await
        .unwrap_or_default()
        .iter()
        .map(|c| c.state)
        .collect()
}

// ============================================================================
// Scripted executor
// ============================================================================

/// Executor that moves no bytes but reports them, with optional gating and
/// scripted failures.
#[derive(Default)]
pub struct ScriptedExecutor {
    started: Mutex<Vec<ChunkJob>>,
    failures: Mutex<HashMap<(ChunkRole, u64), VecDeque<ExecutionError>>>,
    gate: Option<Semaphore>,
    object_size: Option<u64>,
    rate_limits: Mutex<Vec<u64>>,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every execution blocks until a matching [`release`](Self::release).
    pub fn gated() -> Self {
        Self {
            gate: Some(Semaphore::new(0)),
            ..Self::default()
        }
    }

    /// Size reported by probes.
    pub fn with_object_size(mut self, size: u64) -> Self {
        self.object_size = Some(size);
        self
    }

    /// The next executions of the chunk with `role` at `start` fail with `errors`, in order.
    pub fn fail(&self, role: ChunkRole, start: u64, errors: Vec<ExecutionError>) {
        self.failures
            .lock()
            .unwrap()
            .entry((role, start))
            .or_default()
            .extend(errors);
    }

    pub fn release(&self, executions: usize) {
        if let Some(gate) = &self.gate {
            gate.add_permits(executions);
        }
    }

    pub fn started(&self) -> Vec<ChunkJob> {
        self.started.lock().unwrap().clone()
    }

    pub fn started_count(&self) -> usize {
        self.started.lock().unwrap().len()
    }

    pub fn started_chunks(&self) -> Vec<TransferId> {
        self.started().iter().map(|j| j.chunk().id).collect()
    }

    /// Every bandwidth cap set through the manager, oldest first.
    pub fn rate_limits(&self) -> Vec<u64> {
        self.rate_limits.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChunkExecutor for ScriptedExecutor {
    async fn execute(&self, job: &ChunkJob) -> Result<ChunkOutcome, ExecutionError> {
        self.started.lock().unwrap().push(job.clone());
        if let Some(gate) = &self.gate {
            gate.acquire()
                .await
                .map_err(|_| ExecutionError::Aborted)?
                .forget();
        }

        let chunk = job.chunk();
        let scripted = self
            .failures
            .lock()
            .unwrap()
            .get_mut(&(chunk.role, chunk.start_offset))
            .and_then(VecDeque::pop_front);
        if let Some(error) = scripted {
            return Err(error);
        }

        let requested = chunk.total_bytes().unwrap_or(0);
        let outcome = match chunk.role {
            ChunkRole::Probe => {
                let size = self.object_size.unwrap_or(requested);
                ChunkOutcome {
                    bytes_written: requested.min(size.saturating_sub(chunk.start_offset)),
                    object_size: Some(size),
                }
            }
            ChunkRole::Range | ChunkRole::Block => ChunkOutcome::bytes(requested),
            _ => ChunkOutcome::default(),
        };
        Ok(outcome)
    }

    async fn set_rate_limit(&self, rate_bytes_per_sec: u64) {
        self.rate_limits.lock().unwrap().push(rate_bytes_per_sec);
    }
}

// ============================================================================
// In-process blob service
// ============================================================================

#[derive(Default)]
struct ServiceState {
    objects: HashMap<String, Vec<u8>>,
    /// Uncommitted blocks per object path.
    blocks: HashMap<String, HashMap<String, Vec<u8>>>,
    requests: Vec<PipelineRequest>,
    deny: Option<u16>,
}

/// Block-blob service kept in memory. Clones share state.
#[derive(Clone, Default)]
pub struct FakeBlobService {
    state: Arc<Mutex<ServiceState>>,
}

impl FakeBlobService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_object(&self, path: &str, data: &[u8]) {
        self.state
            .lock()
            .unwrap()
            .objects
            .insert(path.to_string(), data.to_vec());
    }

    pub fn object(&self, path: &str) -> Option<Vec<u8>> {
        self.state.lock().unwrap().objects.get(path).cloned()
    }

    /// Answer every request with `status`.
    pub fn deny_with(&self, status: u16) {
        self.state.lock().unwrap().deny = Some(status);
    }

    pub fn requests(&self) -> Vec<PipelineRequest> {
        self.state.lock().unwrap().requests.clone()
    }
}

fn parse_range(header: &str) -> Option<(u64, u64)> {
    let (start, end) = header.strip_prefix("bytes=")?.split_once('-')?;
    Some((start.parse().ok()?, end.parse().ok()?))
}

fn block_list(body: &[u8]) -> Vec<String> {
    let text = String::from_utf8_lossy(body);
    text.split("<Latest>")
        .skip(1)
        .filter_map(|part| part.split_once("</Latest>").map(|(id, _)| id.to_string()))
        .collect()
}

#[async_trait]
impl Pipeline for FakeBlobService {
    async fn send(&self, request: PipelineRequest) -> Result<PipelineResponse, PipelineError> {
        let mut state = self.state.lock().unwrap();
        state.requests.push(request.clone());
        if let Some(status) = state.deny {
            return Ok(PipelineResponse::new(status, Bytes::new()));
        }

        let response = match request.method {
            Method::Get => {
                let Some(object) = state.objects.get(&request.path) else {
                    return Ok(PipelineResponse::new(404, Bytes::new()));
                };
                let len = object.len() as u64;
                match request.header("range").and_then(parse_range) {
                    Some((start, _)) if start >= len => PipelineResponse::new(416, Bytes::new())
                        .with_header("content-range", format!("bytes */{len}")),
                    Some((start, last)) => {
                        let end = (last + 1).min(len);
                        PipelineResponse::new(
                            206,
                            Bytes::copy_from_slice(&object[start as usize..end as usize]),
                        )
                        .with_header("content-range", format!("bytes {start}-{}/{len}", end - 1))
                    }
                    None => PipelineResponse::new(200, Bytes::copy_from_slice(object)),
                }
            }
            Method::Put => match request.query_value("comp") {
                Some("block") => {
                    let id = request.query_value("blockid").unwrap_or_default().to_string();
                    state
                        .blocks
                        .entry(request.path.clone())
                        .or_default()
                        .insert(id, request.body.to_vec());
                    PipelineResponse::new(201, Bytes::new())
                }
                Some("blocklist") => {
                    let staged = state.blocks.remove(&request.path).unwrap_or_default();
                    let mut data = Vec::new();
                    for id in block_list(&request.body) {
                        match staged.get(&id) {
                            Some(block) => data.extend_from_slice(block),
                            None => return Ok(PipelineResponse::new(400, Bytes::new())),
                        }
                    }
                    state.objects.insert(request.path.clone(), data);
                    PipelineResponse::new(201, Bytes::new())
                }
                _ => {
                    state
                        .objects
                        .insert(request.path.clone(), request.body.to_vec());
                    PipelineResponse::new(201, Bytes::new())
                }
            },
            Method::Head | Method::Delete => PipelineResponse::new(405, Bytes::new()),
        };
        Ok(response)
    }
}
