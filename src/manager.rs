// src/manager.rs

use std::collections::HashMap;
use std::io::ErrorKind;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::{Mutex, RwLock, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::collection::TransferCollection;
use crate::config::ManagerConfig;
use crate::error::{ExecutionError, PersistenceError, TransferError};
use crate::executor::{ChunkExecutor, ChunkJob, ChunkOutcome};
use crate::models::{ChunkRole, TransferId, TransferKind, TransferRecord, TransferState};
use crate::observer::{ObserverHub, TransferEvent, TransferObserver};
use crate::plan::{self, Plan, TransferRequest};
use crate::queue::{ChunkQueue, ChunkTicket};
use crate::reconcile;
use crate::store::{TransferQuery, TransferStore};

/// A top-level transfer and its chunks, guarded by one lock.
struct TransferGroup {
    parent: TransferRecord,
    /// Data chunks ordered by offset, finishing steps last.
    chunks: Vec<TransferRecord>,
    cancel: CancellationToken,
    /// Background persistence failure not yet followed by a successful write.
    last_error: Option<String>,
    removed: bool,
}

/// Working copy of a group. Installed only after it has been persisted.
struct Staged {
    parent: TransferRecord,
    chunks: Vec<TransferRecord>,
}

impl TransferGroup {
    fn new(parent: TransferRecord, mut chunks: Vec<TransferRecord>, cancel: CancellationToken) -> Self {
        sort_chunks(&mut chunks);
        Self {
            parent,
            chunks,
            cancel,
            last_error: None,
            removed: false,
        }
    }

    fn chunk_index(&self, id: TransferId) -> Option<usize> {
        self.chunks.iter().position(|c| c.id == id)
    }

    fn stage(&self) -> Staged {
        Staged {
            parent: self.parent.clone(),
            chunks: self.chunks.clone(),
        }
    }

    /// Records of `staged` that differ from what the group holds now.
    fn changes(&self, staged: &Staged) -> Vec<TransferRecord> {
        let current: HashMap<TransferId, &TransferRecord> =
            self.chunks.iter().map(|c| (c.id, c)).collect();
        let mut changed = Vec::new();
        if staged.parent != self.parent {
            changed.push(staged.parent.clone());
        }
        changed.extend(
            staged
                .chunks
                .iter()
                .filter(|c| current.get(&c.id).map_or(true, |old| *old != *c))
                .cloned(),
        );
        changed
    }

    fn install(&mut self, staged: Staged) {
        self.parent = staged.parent;
        self.chunks = staged.chunks;
    }

    fn ready(&self) -> Vec<TransferId> {
        reconcile::ready_chunks(&self.parent, &self.chunks)
    }
}

fn sort_chunks(chunks: &mut [TransferRecord]) {
    chunks.sort_by_key(|c| (c.role.is_finishing_step(), c.start_offset));
}

/// A chunk that passed its pre-dispatch checks and is now `InProgress`.
struct Claim {
    job: Result<ChunkJob, ExecutionError>,
    cancel: CancellationToken,
}

struct Inner {
    store: Arc<dyn TransferStore>,
    executor: Arc<dyn ChunkExecutor>,
    config: ManagerConfig,
    index: RwLock<HashMap<TransferId, Arc<Mutex<TransferGroup>>>>,
    queue: ChunkQueue,
    slots: Arc<Semaphore>,
    observers: ObserverHub,
    shutdown: CancellationToken,
}

/// Schedules, persists and reconciles chunked transfers.
///
/// Cloning is cheap; every clone drives the same set of transfers. Chunks are
/// only executed while [`TransferManager::run`] is being polled.
#[derive(Clone)]
pub struct TransferManager {
    inner: Arc<Inner>,
}

impl TransferManager {
    /// Build a manager over `store` and resume whatever it left unfinished.
    pub async fn new(
        store: Arc<dyn TransferStore>,
        executor: Arc<dyn ChunkExecutor>,
        config: ManagerConfig,
    ) -> Result<Self, TransferError> {
        let slots = config.max_concurrent_chunks.max(1);
        let inner = Arc::new(Inner {
            store,
            executor,
            config,
            index: RwLock::new(HashMap::new()),
            queue: ChunkQueue::new(),
            slots: Arc::new(Semaphore::new(slots)),
            observers: ObserverHub::new(),
            shutdown: CancellationToken::new(),
        });
        inner.recover().await?;
        Ok(Self { inner })
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.inner.config
    }

    /// Persist a new transfer with its chunk plan and admit its ready chunks.
    pub async fn add(&self, request: TransferRequest) -> Result<TransferId, TransferError> {
        let Plan { mut parent, chunks } = plan::plan_transfer(request, &self.inner.config).await?;
        reconcile::apply(&mut parent, &chunks);

        let mut records = Vec::with_capacity(chunks.len() + 1);
        records.push(parent.clone());
        records.extend(chunks.iter().cloned());
        self.inner.store.save_all(&records).await?;

        let id = parent.id;
        let group = Arc::new(Mutex::new(TransferGroup::new(
            parent,
            chunks,
            self.inner.shutdown.child_token(),
        )));
        let guard = group.lock().await;
        self.inner.index.write().await.insert(id, group.clone());
        let ready = guard.ready();
        info!(
            transfer = %id,
            kind = ?guard.parent.kind,
            source = %guard.parent.source,
            destination = %guard.parent.destination,
            chunks = guard.chunks.len(),
            "transfer added"
        );
        self.inner.queue.push_all(id, ready);
        self.inner.announce(&guard);
        Ok(id)
    }

    /// Stop admitting chunks. In-flight chunks finish and are reconciled.
    pub async fn pause(&self, id: &TransferId) -> Result<(), TransferError> {
        let group = self.inner.require(id).await?;
        let mut group = group.lock().await;
        if group.parent.state.is_terminal() || group.parent.state == TransferState::Paused {
            return Ok(());
        }
        let mut staged = group.stage();
        staged.parent.set_state(TransferState::Paused);
        self.inner.persist(&mut group, staged).await?;
        info!(transfer = %id, "transfer paused");
        self.inner.announce(&group);
        Ok(())
    }

    /// Re-admit the unfinished chunks of a paused transfer.
    pub async fn resume(&self, id: &TransferId) -> Result<(), TransferError> {
        let group = self.inner.require(id).await?;
        let mut group = group.lock().await;
        if group.parent.state != TransferState::Paused {
            return Ok(());
        }
        let mut staged = group.stage();
        staged.parent.set_state(TransferState::Pending);
        reconcile::apply(&mut staged.parent, &staged.chunks);
        self.inner.persist(&mut group, staged).await?;

        let ready = group.ready();
        info!(transfer = %id, readmitted = ready.len(), "transfer resumed");
        self.inner.queue.push_all(*id, ready);
        self.inner.announce(&group);
        Ok(())
    }

    /// Mark the transfer cancelled and abort its in-flight chunks.
    pub async fn cancel(&self, id: &TransferId) -> Result<(), TransferError> {
        let group = self.inner.require(id).await?;
        let mut group = group.lock().await;
        self.inner.cancel_locked(&mut group).await?;
        Ok(())
    }

    /// Cancel, delete the records and any partial download.
    pub async fn remove(&self, id: &TransferId) -> Result<(), TransferError> {
        let group = self.inner.require(id).await?;
        {
            let mut group = group.lock().await;
            self.inner.cancel_locked(&mut group).await?;
            self.inner.store.delete(id).await?;
            group.removed = true;

            let parent = &group.parent;
            if parent.kind == TransferKind::Download && parent.state != TransferState::Complete {
                if let Some(path) = parent.local_endpoint().local_path() {
                    match tokio::fs::remove_file(path).await {
                        Ok(()) => debug!(transfer = %id, path = %path.display(), "partial download deleted"),
                        Err(e) if e.kind() == ErrorKind::NotFound => {}
                        Err(e) => warn!(
                            transfer = %id,
                            path = %path.display(),
                            error = %e,
                            "could not delete partial download"
                        ),
                    }
                }
            }
        }
        self.inner.index.write().await.remove(id);
        info!(transfer = %id, "transfer removed");
        Ok(())
    }

    /// Current top-level record of a transfer.
    pub async fn get(&self, id: &TransferId) -> Option<TransferRecord> {
        let group = self.inner.group(id).await?;
        let group = group.lock().await;
        Some(group.parent.clone())
    }

    /// Chunks of a transfer, data first then finishing steps.
    pub async fn chunks(&self, id: &TransferId) -> Option<Vec<TransferRecord>> {
        let group = self.inner.group(id).await?;
        let group = group.lock().await;
        Some(group.chunks.clone())
    }

    /// The most recent problem with a transfer: an outstanding background
    /// persistence failure, otherwise the cause of a failed transfer.
    pub async fn error(&self, id: &TransferId) -> Option<String> {
        let group = self.inner.group(id).await?;
        let group = group.lock().await;
        group
            .last_error
            .clone()
            .or_else(|| group.parent.error.as_ref().map(ToString::to_string))
    }

    /// Snapshot of every known top-level transfer, oldest first.
    pub async fn transfers(&self) -> TransferCollection {
        let groups: Vec<_> = self.inner.index.read().await.values().cloned().collect();
        let mut records = Vec::with_capacity(groups.len());
        for group in groups {
            let group = group.lock().await;
            if !group.removed {
                records.push(group.parent.clone());
            }
        }
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        TransferCollection::new(self.clone(), records)
    }

    /// Change the bandwidth cap for running and future chunks; `0` lifts it.
    pub async fn set_speed_limit(&self, rate_bytes_per_sec: u64) {
        self.inner.executor.set_rate_limit(rate_bytes_per_sec).await;
        info!(rate_bytes_per_sec, "speed limit changed");
    }

    /// Receive every transfer event published from now on.
    pub fn subscribe(&self) -> UnboundedReceiver<TransferEvent> {
        self.inner.observers.subscribe()
    }

    pub fn add_observer(&self, observer: Arc<dyn TransferObserver>) -> JoinHandle<()> {
        self.inner.observers.attach(observer)
    }

    /// Dispatch admitted chunks to the worker pool until [`shutdown`](Self::shutdown).
    ///
    /// Only one dispatcher may run per manager.
    pub async fn run(&self) -> Result<(), TransferError> {
        let mut tickets = self
            .inner
            .queue
            .take_receiver()
            .await
            .ok_or(TransferError::AlreadyRunning)?;
        info!(slots = self.inner.config.max_concurrent_chunks, "dispatcher started");

        loop {
            let permit = tokio::select! {
                _ = self.inner.shutdown.cancelled() => break,
                permit = self.inner.slots.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };
            let ticket = tokio::select! {
                _ = self.inner.shutdown.cancelled() => break,
                ticket = tickets.recv() => match ticket {
                    Some(ticket) => ticket,
                    None => break,
                },
            };

            let inner = self.inner.clone();
            tokio::spawn(async move {
                inner.run_chunk(ticket).await;
                drop(permit);
            });
        }

        info!(admitted = self.inner.queue.admitted(), "dispatcher stopped");
        Ok(())
    }

    /// Stop the dispatcher and abort in-flight chunks; they resume on restart.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
    }
}

impl Inner {
    async fn group(&self, id: &TransferId) -> Option<Arc<Mutex<TransferGroup>>> {
        self.index.read().await.get(id).cloned()
    }

    async fn require(&self, id: &TransferId) -> Result<Arc<Mutex<TransferGroup>>, TransferError> {
        self.group(id).await.ok_or(TransferError::NotFound(*id))
    }

    /// Write the differences between `staged` and `group`, then install them.
    /// Returns whether the top-level record changed.
    async fn persist(&self, group: &mut TransferGroup, staged: Staged) -> Result<bool, PersistenceError> {
        let changes = group.changes(&staged);
        if changes.is_empty() {
            return Ok(false);
        }
        self.store.save_all(&changes).await?;
        let parent_changed = staged.parent != group.parent;
        group.install(staged);
        Ok(parent_changed)
    }

    fn announce(&self, group: &TransferGroup) {
        self.observers.publish(TransferEvent::for_record(&group.parent));
    }

    async fn cancel_locked(&self, group: &mut TransferGroup) -> Result<(), PersistenceError> {
        if group.parent.state.is_terminal() {
            group.cancel.cancel();
            return Ok(());
        }
        let mut staged = group.stage();
        staged.parent.set_state(TransferState::Cancelled);
        for chunk in staged.chunks.iter_mut().filter(|c| !c.state.is_terminal()) {
            chunk.set_state(TransferState::Cancelled);
        }
        self.persist(group, staged).await?;
        group.cancel.cancel();
        info!(transfer = %group.parent.id, "transfer cancelled");
        self.announce(group);
        Ok(())
    }

    /// Rebuild the index from the store and re-admit unfinished chunks.
    async fn recover(&self) -> Result<(), PersistenceError> {
        let parents = self.store.query(&TransferQuery::top_level()).await?;
        let mut resumed = 0usize;
        let mut readmitted = 0usize;

        for parent in parents {
            let id = parent.id;
            let chunks = self.store.query(&TransferQuery::children_of(id)).await?;
            let mut group = TransferGroup::new(parent, chunks, self.shutdown.child_token());

            if !group.parent.state.is_terminal() {
                let mut staged = group.stage();
                for chunk in staged
                    .chunks
                    .iter_mut()
                    .filter(|c| c.state == TransferState::InProgress)
                {
                    chunk.set_state(TransferState::Pending);
                }
                reconcile::apply(&mut staged.parent, &staged.chunks);
                self.persist(&mut group, staged).await?;

                let ready = group.ready();
                if !ready.is_empty() {
                    resumed += 1;
                    readmitted += ready.len();
                    debug!(transfer = %id, chunks = ready.len(), "re-admitting chunks");
                }
                self.queue.push_all(id, ready);
            }
            self.index
                .write()
                .await
                .insert(id, Arc::new(Mutex::new(group)));
        }

        let known = self.index.read().await.len();
        info!(
            known,
            resumed,
            readmitted,
            "transfers recovered from store"
        );
        Ok(())
    }

    async fn run_chunk(self: Arc<Self>, ticket: ChunkTicket) {
        let Some(group) = self.group(&ticket.transfer).await else {
            debug!(transfer = %ticket.transfer, "ticket for unknown transfer dropped");
            return;
        };
        let claim = match self.claim(&group, ticket.chunk).await {
            Ok(Some(claim)) => claim,
            Ok(None) => return,
            Err(_) => {
                self.readmit_later(ticket);
                return;
            }
        };
        let result = match claim.job {
            Ok(job) => self.execute_with_retry(&job, &claim.cancel).await,
            Err(e) => Err(e),
        };
        if self.settle(&group, ticket.chunk, result).await.is_err() {
            self.readmit_later(ticket);
        }
    }

    /// Queue `ticket` again after the first retry delay, unless shutting down.
    fn readmit_later(self: &Arc<Self>, ticket: ChunkTicket) {
        let inner = Arc::clone(self);
        let delay = self.config.retry.delay_for(1);
        tokio::spawn(async move {
            tokio::select! {
                _ = inner.shutdown.cancelled() => {}
                _ = tokio::time::sleep(delay) => inner.queue.push(ticket),
            }
        });
    }

    /// Re-check a ticket under the group lock and mark its chunk `InProgress`.
    /// `Ok(None)` drops a stale ticket.
    async fn claim(
        &self,
        group: &Mutex<TransferGroup>,
        chunk_id: TransferId,
    ) -> Result<Option<Claim>, PersistenceError> {
        let mut group = group.lock().await;
        if group.removed || group.cancel.is_cancelled() {
            return Ok(None);
        }
        if !matches!(
            group.parent.state,
            TransferState::Pending | TransferState::InProgress
        ) {
            return Ok(None);
        }
        let Some(index) = group.chunk_index(chunk_id) else {
            return Ok(None);
        };
        let chunk = &group.chunks[index];
        if chunk.state != TransferState::Pending {
            return Ok(None);
        }
        if chunk.role.is_finishing_step() && !reconcile::data_complete(&group.chunks) {
            return Ok(None);
        }
        let job = ChunkJob::build(chunk, &group.parent, &group.chunks);

        let mut staged = group.stage();
        let running = &mut staged.chunks[index];
        running.bytes_transferred = 0;
        running.error = None;
        running.set_state(TransferState::InProgress);
        reconcile::apply(&mut staged.parent, &staged.chunks);

        match self.persist(&mut group, staged).await {
            Ok(parent_changed) => {
                if parent_changed {
                    self.announce(&group);
                }
            }
            Err(e) => {
                error!(transfer = %group.parent.id, chunk = %chunk_id, error = %e, "could not record chunk start");
                group.last_error = Some(e.to_string());
                return Err(e);
            }
        }
        debug!(transfer = %group.parent.id, chunk = %chunk_id, "chunk started");
        Ok(Some(Claim {
            job,
            cancel: group.cancel.clone(),
        }))
    }

    async fn execute_with_retry(
        &self,
        job: &ChunkJob,
        cancel: &CancellationToken,
    ) -> Result<ChunkOutcome, ExecutionError> {
        let retry = &self.config.retry;
        let chunk = job.chunk().id;
        let mut attempt = 1;
        loop {
            let result = tokio::select! {
                _ = cancel.cancelled() => return Err(ExecutionError::Aborted),
                result = self.executor.execute(job) => result,
            };
            match result {
                Ok(outcome) => return Ok(outcome),
                Err(e) if e.is_transient() && retry.should_retry(attempt) => {
                    let delay = retry.delay_for(attempt);
                    warn!(chunk = %chunk, attempt, error = %e, ?delay, "chunk failed, retrying");
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(ExecutionError::Aborted),
                        _ = tokio::time::sleep(delay) => {}
                    }
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Record a chunk's outcome, reconcile its parent and admit what became ready.
    ///
    /// If the outcome cannot be written the chunk goes back to `Pending` in
    /// memory and the error is returned so the caller can run it again.
    async fn settle(
        &self,
        group: &Mutex<TransferGroup>,
        chunk_id: TransferId,
        result: Result<ChunkOutcome, ExecutionError>,
    ) -> Result<(), PersistenceError> {
        let mut group = group.lock().await;
        if group.removed {
            return Ok(());
        }
        let Some(index) = group.chunk_index(chunk_id) else {
            return Ok(());
        };
        // Cancelled while running.
        if group.chunks[index].state != TransferState::InProgress {
            return Ok(());
        }

        let ready_before = group.ready();
        let mut staged = group.stage();
        let transfer = staged.parent.id;
        let result = result.and_then(|outcome| self.complete_chunk(&mut staged, index, outcome));

        match result {
            Ok(()) => {
                debug!(
                    transfer = %transfer,
                    chunk = %chunk_id,
                    bytes = staged.chunks.iter().find(|c| c.id == chunk_id).map_or(0, |c| c.bytes_transferred),
                    "chunk complete"
                );
            }
            Err(ExecutionError::Aborted) => {
                debug!(transfer = %transfer, chunk = %chunk_id, "chunk aborted");
                staged.chunks[index].set_state(TransferState::Pending);
            }
            Err(e) => {
                warn!(transfer = %transfer, chunk = %chunk_id, error = %e, "chunk failed");
                let chunk = &mut staged.chunks[index];
                chunk.error = Some(e.clone());
                chunk.set_state(TransferState::Failed);
                if !staged.parent.state.is_terminal() && staged.parent.error.is_none() {
                    staged.parent.error = Some(e);
                }
            }
        }
        sort_chunks(&mut staged.chunks);
        reconcile::apply(&mut staged.parent, &staged.chunks);

        let parent_changed = match self.persist(&mut group, staged).await {
            Ok(changed) => changed,
            Err(e) => {
                error!(transfer = %transfer, chunk = %chunk_id, error = %e, "could not record chunk outcome");
                group.last_error = Some(e.to_string());
                // The stored `InProgress` is read back as `Pending` on recovery.
                group.chunks[index].set_state(TransferState::Pending);
                let TransferGroup { parent, chunks, .. } = &mut *group;
                reconcile::apply(parent, chunks);
                self.announce(&group);
                return Err(e);
            }
        };
        group.last_error = None;

        let fresh: Vec<TransferId> = group
            .ready()
            .into_iter()
            .filter(|id| !ready_before.contains(id))
            .collect();
        self.queue.push_all(transfer, fresh);

        if parent_changed {
            match group.parent.state {
                TransferState::Complete => info!(
                    transfer = %transfer,
                    bytes = group.parent.bytes_transferred,
                    "transfer complete"
                ),
                TransferState::Failed => error!(
                    transfer = %transfer,
                    error = ?group.parent.error,
                    "transfer failed"
                ),
                _ => {}
            }
            self.announce(&group);
        }
        Ok(())
    }

    /// Apply a successful outcome to the staged chunk. A probe also fixes the
    /// transfer's size and plans the rest of the download.
    fn complete_chunk(
        &self,
        staged: &mut Staged,
        index: usize,
        outcome: ChunkOutcome,
    ) -> Result<(), ExecutionError> {
        let chunk = &mut staged.chunks[index];
        chunk.bytes_transferred = outcome.bytes_written;
        chunk.error = None;

        if chunk.role == ChunkRole::Probe {
            let start = chunk.start_offset;
            let requested = chunk.total_bytes().unwrap_or(0);
            let object_end = match outcome.object_size {
                Some(size) => size.max(start),
                None if outcome.bytes_written < requested => start + outcome.bytes_written,
                None => {
                    return Err(ExecutionError::Protocol(
                        "response did not reveal the object size".into(),
                    ))
                }
            };
            let end = staged
                .parent
                .end_offset
                .map_or(object_end, |limit| limit.min(object_end));
            chunk.end_offset = Some((start + outcome.bytes_written).min(end));
            chunk.bytes_transferred = chunk.total_bytes().unwrap_or(0);
            chunk.set_state(TransferState::Complete);

            staged.parent.end_offset = Some(end);
            staged.parent.touch();
            let probe = chunk.clone();
            let rest = plan::plan_after_probe(&staged.parent, &probe, &self.config);
            debug!(
                transfer = %staged.parent.id,
                size = end - staged.parent.start_offset,
                remaining_chunks = rest.len(),
                "object size learned"
            );
            staged.chunks.extend(rest);
        } else {
            chunk.set_state(TransferState::Complete);
        }
        Ok(())
    }
}
