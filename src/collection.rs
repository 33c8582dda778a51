// src/collection.rs

use std::path::{Path, PathBuf};

use crate::error::TransferError;
use crate::manager::TransferManager;
use crate::models::{Endpoint, TransferId, TransferRecord, TransferState};

/// Conjunctive filter over top-level transfers. Unset fields match anything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransferFilter {
    /// Prefix of the remote `container/blob` path.
    pub container_name: Option<String>,
    /// Suffix of the remote `container/blob` path.
    pub blob_name: Option<String>,
    /// Exact local path.
    pub local_path: Option<PathBuf>,
    pub state: Option<TransferState>,
}

impl TransferFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn container(mut self, name: impl Into<String>) -> Self {
        self.container_name = Some(name.into());
        self
    }

    pub fn blob(mut self, name: impl Into<String>) -> Self {
        self.blob_name = Some(name.into());
        self
    }

    pub fn local_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.local_path = Some(path.into());
        self
    }

    pub fn state(mut self, state: TransferState) -> Self {
        self.state = Some(state);
        self
    }

    pub fn matches(&self, record: &TransferRecord) -> bool {
        let remote = record.remote_endpoint().remote_path().unwrap_or_default();
        if let Some(container) = &self.container_name {
            if !remote.starts_with(container.as_str()) {
                return false;
            }
        }
        if let Some(blob) = &self.blob_name {
            if !remote.ends_with(blob.as_str()) {
                return false;
            }
        }
        if let Some(path) = &self.local_path {
            match record.local_endpoint() {
                Endpoint::Local(local) if local.as_path() == path.as_path() => {}
                _ => return false,
            }
        }
        if let Some(state) = self.state {
            if record.state != state {
                return false;
            }
        }
        true
    }
}

/// Point-in-time view of the manager's transfers.
///
/// Queries run against the snapshot; bulk operations go through the manager
/// one transfer at a time and are not atomic as a group.
#[derive(Clone)]
pub struct TransferCollection {
    manager: TransferManager,
    transfers: Vec<TransferRecord>,
}

impl TransferCollection {
    pub(crate) fn new(manager: TransferManager, transfers: Vec<TransferRecord>) -> Self {
        Self { manager, transfers }
    }

    pub fn all(&self) -> &[TransferRecord] {
        &self.transfers
    }

    pub fn len(&self) -> usize {
        self.transfers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transfers.is_empty()
    }

    pub fn get(&self, id: &TransferId) -> Option<&TransferRecord> {
        self.transfers.iter().find(|t| t.id == *id)
    }

    pub fn filter_where(&self, filter: &TransferFilter) -> Self {
        self.filter(|t| filter.matches(t))
    }

    pub fn first_with(&self, filter: &TransferFilter) -> Option<&TransferRecord> {
        self.first(|t| filter.matches(t))
    }

    pub fn filter(&self, predicate: impl Fn(&TransferRecord) -> bool) -> Self {
        Self {
            manager: self.manager.clone(),
            transfers: self
                .transfers
                .iter()
                .filter(|t| predicate(t))
                .cloned()
                .collect(),
        }
    }

    pub fn first(&self, predicate: impl Fn(&TransferRecord) -> bool) -> Option<&TransferRecord> {
        self.transfers.iter().find(|t| predicate(t))
    }

    pub fn ids(&self) -> Vec<TransferId> {
        self.transfers.iter().map(|t| t.id).collect()
    }

    /// Transfers whose local endpoint is `path`.
    pub fn for_local_path(&self, path: &Path) -> Self {
        self.filter_where(&TransferFilter::new().local_path(path))
    }

    pub async fn cancel_all(&self) -> Result<(), TransferError> {
        let mut first_error = None;
        for id in self.ids() {
            if let Err(e) = self.manager.cancel(&id).await {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    pub async fn remove_all(&self) -> Result<(), TransferError> {
        let mut first_error = None;
        for id in self.ids() {
            if let Err(e) = self.manager.remove(&id).await {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    pub async fn pause_all(&self) -> Result<(), TransferError> {
        let mut first_error = None;
        for id in self.ids() {
            if let Err(e) = self.manager.pause(&id).await {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    pub async fn resume_all(&self) -> Result<(), TransferError> {
        let mut first_error = None;
        for id in self.ids() {
            if let Err(e) = self.manager.resume(&id).await {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

impl std::fmt::Debug for TransferCollection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferCollection")
            .field("transfers", &self.transfers)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TransferKind;

    fn download(container: &str, blob: &str, path: &str) -> TransferRecord {
        TransferRecord::new(
            TransferKind::Download,
            Endpoint::remote(container, blob),
            Endpoint::local(path),
            0,
            Some(10),
        )
    }

    fn upload(path: &str, container: &str, blob: &str) -> TransferRecord {
        TransferRecord::new(
            TransferKind::Upload,
            Endpoint::local(path),
            Endpoint::remote(container, blob),
            0,
            Some(10),
        )
    }

    #[test]
    fn test_container_is_a_prefix_of_the_remote_path() {
        let filter = TransferFilter::new().container("c1");
        assert!(filter.matches(&download("c1", "a.bin", "/tmp/a")));
        assert!(filter.matches(&download("c10", "a.bin", "/tmp/a")));
        assert!(filter.matches(&upload("/tmp/u", "c1", "u.bin")));
        assert!(!filter.matches(&download("c2", "c1", "/tmp/a")));
    }

    #[test]
    fn test_blob_is_a_suffix_of_the_remote_path() {
        let filter = TransferFilter::new().blob("a.bin");
        assert!(filter.matches(&download("c1", "dir/a.bin", "/tmp/a")));
        assert!(!filter.matches(&download("c1", "a.bin.part", "/tmp/a")));
    }

    #[test]
    fn test_local_path_and_state_are_exact() {
        let mut record = upload("/tmp/u", "c1", "u.bin");
        let filter = TransferFilter::new()
            .local_path("/tmp/u")
            .state(TransferState::Pending);
        assert!(filter.matches(&record));
        assert!(!TransferFilter::new().local_path("/tmp").matches(&record));
        record.state = TransferState::Paused;
        assert!(!filter.matches(&record));
    }

    #[test]
    fn test_empty_filter_matches_everything() {
        assert!(TransferFilter::new().matches(&download("c", "b", "/x")));
    }
}
