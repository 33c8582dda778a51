// src/store.rs

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};

use crate::error::PersistenceError;
use crate::models::{TransferId, TransferRecord, TransferState};

/// Durable storage for transfer records.
///
/// Every write is atomic: a crash between two calls leaves each earlier call
/// fully applied, and `save_all` never exposes a partial group of records.
#[async_trait]
pub trait TransferStore: Send + Sync {
    /// Insert or update one record.
    async fn save(&self, record: &TransferRecord) -> Result<(), PersistenceError>;

    /// Insert or update several records in a single transaction.
    async fn save_all(&self, records: &[TransferRecord]) -> Result<(), PersistenceError>;

    async fn load(&self, id: &TransferId) -> Result<Option<TransferRecord>, PersistenceError>;

    async fn query(&self, query: &TransferQuery) -> Result<Vec<TransferRecord>, PersistenceError>;

    /// Remove a record together with all of its children.
    async fn delete(&self, id: &TransferId) -> Result<(), PersistenceError>;
}

/// Which part of the record tree a query looks at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParentScope {
    TopLevel,
    ChildrenOf(TransferId),
    Any,
}

/// Predicate over stored records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferQuery {
    pub scope: ParentScope,
    /// Restrict to these states; `None` accepts every state.
    pub states: Option<Vec<TransferState>>,
}

impl TransferQuery {
    pub fn all() -> Self {
        Self {
            scope: ParentScope::Any,
            states: None,
        }
    }

    pub fn top_level() -> Self {
        Self {
            scope: ParentScope::TopLevel,
            states: None,
        }
    }

    pub fn children_of(id: TransferId) -> Self {
        Self {
            scope: ParentScope::ChildrenOf(id),
            states: None,
        }
    }

    pub fn with_states(mut self, states: &[TransferState]) -> Self {
        self.states = Some(states.to_vec());
        self
    }

    /// Restrict to `pending`, `inProgress` and `paused`.
    pub fn non_terminal(self) -> Self {
        self.with_states(&[
            TransferState::Pending,
            TransferState::InProgress,
            TransferState::Paused,
        ])
    }

    pub fn matches(&self, record: &TransferRecord) -> bool {
        let scope_ok = match self.scope {
            ParentScope::TopLevel => record.parent_id.is_none(),
            ParentScope::ChildrenOf(parent) => record.parent_id == Some(parent),
            ParentScope::Any => true,
        };
        let state_ok = match &self.states {
            Some(states) => states.contains(&record.state),
            None => true,
        };
        scope_ok && state_ok
    }
}

/// Process-local store. Nothing survives the process; used by tests and
/// short-lived tools.
#[derive(Debug, Default)]
pub struct MemoryTransferStore {
    records: Mutex<HashMap<TransferId, TransferRecord>>,
    unavailable: AtomicBool,
}

impl MemoryTransferStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent call fail with `PersistenceError::Unavailable`.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.records.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check_available(&self) -> Result<(), PersistenceError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(PersistenceError::Unavailable("memory store is offline".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl TransferStore for MemoryTransferStore {
    async fn save(&self, record: &TransferRecord) -> Result<(), PersistenceError> {
        self.save_all(std::slice::from_ref(record)).await
    }

    async fn save_all(&self, records: &[TransferRecord]) -> Result<(), PersistenceError> {
        self.check_available()?;
        let mut map = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        for record in records {
            map.insert(record.id, record.clone());
        }
        Ok(())
    }

    async fn load(&self, id: &TransferId) -> Result<Option<TransferRecord>, PersistenceError> {
        self.check_available()?;
        let map = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(map.get(id).cloned())
    }

    async fn query(&self, query: &TransferQuery) -> Result<Vec<TransferRecord>, PersistenceError> {
        self.check_available()?;
        let map = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        let mut found: Vec<TransferRecord> =
            map.values().filter(|r| query.matches(r)).cloned().collect();
        found.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then(a.start_offset.cmp(&b.start_offset))
        });
        Ok(found)
    }

    async fn delete(&self, id: &TransferId) -> Result<(), PersistenceError> {
        self.check_available()?;
        let mut map = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        map.retain(|key, record| key != id && record.parent_id != Some(*id));
        Ok(())
    }
}
