// src/queue.rs

use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::Mutex;

use crate::models::TransferId;

/// A chunk admitted to the worker pool.
///
/// Tickets are hints: the dispatcher re-checks the chunk's persisted state
/// before running it, so stale or duplicate tickets are harmless.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChunkTicket {
    pub transfer: TransferId,
    pub chunk: TransferId,
}

/// FIFO of ready chunks shared by the manager and its dispatcher.
#[derive(Debug)]
pub struct ChunkQueue {
    tx: UnboundedSender<ChunkTicket>,
    rx: Mutex<Option<UnboundedReceiver<ChunkTicket>>>,
    admitted: AtomicU64,
}

impl ChunkQueue {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Mutex::new(Some(rx)),
            admitted: AtomicU64::new(0),
        }
    }

    /// Admit a chunk. Dropped silently once the dispatcher has shut down.
    pub fn push(&self, ticket: ChunkTicket) {
        if self.tx.send(ticket).is_ok() {
            self.admitted.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn push_all(&self, transfer: TransferId, chunks: impl IntoIterator<Item = TransferId>) {
        for chunk in chunks {
            self.push(ChunkTicket { transfer, chunk });
        }
    }

    /// Hand the receiving side to the single dispatcher. `None` if already taken.
    pub async fn take_receiver(&self) -> Option<UnboundedReceiver<ChunkTicket>> {
        self.rx.lock().await.take()
    }

    /// Total tickets admitted since creation.
    pub fn admitted(&self) -> u64 {
        self.admitted.load(Ordering::Relaxed)
    }
}

impl Default for ChunkQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_tickets_come_out_in_order() {
        let queue = ChunkQueue::new();
        let transfer = TransferId::new();
        let a = TransferId::new();
        let b = TransferId::new();
        queue.push_all(transfer, [a, b]);

        let mut rx = queue.take_receiver().await.unwrap();
        assert_eq!(rx.recv().await.unwrap().chunk, a);
        assert_eq!(rx.recv().await.unwrap().chunk, b);
        assert_eq!(queue.admitted(), 2);
    }

    #[tokio::test]
    async fn test_receiver_is_taken_once() {
        let queue = ChunkQueue::new();
        assert!(queue.take_receiver().await.is_some());
        assert!(queue.take_receiver().await.is_none());
    }
}
