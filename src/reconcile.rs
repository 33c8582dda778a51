// src/reconcile.rs

//! Derivation of a composite transfer's state and progress from its chunks.
//!
//! Everything here is a pure function of the full child set, so applying a
//! completion twice or out of order yields the same parent.

use crate::models::{TransferId, TransferRecord, TransferState};

/// Derived view of a composite transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Aggregate {
    pub state: TransferState,
    pub bytes_transferred: u64,
}

/// Recompute a parent's state and byte count from `children`.
///
/// Terminal parents keep their state. A paused parent stays paused unless its
/// children make it complete or failed.
pub fn aggregate(parent_state: TransferState, children: &[TransferRecord]) -> Aggregate {
    let bytes_transferred = children
        .iter()
        .filter(|c| c.state == TransferState::Complete)
        .map(|c| c.bytes_transferred)
        .sum();

    let state = if parent_state.is_terminal() || children.is_empty() {
        parent_state
    } else if children.iter().any(|c| c.state == TransferState::Failed) {
        TransferState::Failed
    } else if children.iter().all(|c| c.state == TransferState::Complete) {
        TransferState::Complete
    } else if parent_state == TransferState::Paused {
        TransferState::Paused
    } else if children.iter().any(|c| c.state == TransferState::InProgress) {
        TransferState::InProgress
    } else {
        TransferState::Pending
    };

    Aggregate {
        state,
        bytes_transferred,
    }
}

/// Apply [`aggregate`] to `parent`. Returns whether anything changed.
pub fn apply(parent: &mut TransferRecord, children: &[TransferRecord]) -> bool {
    let derived = aggregate(parent.state, children);
    let changed =
        derived.state != parent.state || derived.bytes_transferred != parent.bytes_transferred;
    if changed {
        parent.state = derived.state;
        parent.bytes_transferred = derived.bytes_transferred;
        parent.touch();
    }
    changed
}

/// Pending chunks that may be handed to the worker pool right now.
///
/// Nothing is ready unless the parent is `Pending` or `InProgress`. Commit and
/// verify steps wait until every data chunk is complete.
pub fn ready_chunks(parent: &TransferRecord, children: &[TransferRecord]) -> Vec<TransferId> {
    if !matches!(
        parent.state,
        TransferState::Pending | TransferState::InProgress
    ) {
        return Vec::new();
    }
    let data_done = data_complete(children);
    children
        .iter()
        .filter(|c| c.state == TransferState::Pending)
        .filter(|c| c.role.is_data() || (c.role.is_finishing_step() && data_done))
        .map(|c| c.id)
        .collect()
}

/// Whether every payload-carrying chunk has completed.
pub fn data_complete(children: &[TransferRecord]) -> bool {
    children
        .iter()
        .filter(|c| c.role.is_data())
        .all(|c| c.state == TransferState::Complete)
}
