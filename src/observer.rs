// src/observer.rs

use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;

use crate::error::ExecutionError;
use crate::models::{Progress, TransferId, TransferRecord, TransferState};

/// A persisted transition of a top-level transfer.
#[derive(Debug, Clone, PartialEq)]
pub enum TransferEvent {
    Progress {
        id: TransferId,
        state: TransferState,
        progress: Progress,
    },
    Failed {
        id: TransferId,
        error: ExecutionError,
    },
    Completed {
        id: TransferId,
    },
}

impl TransferEvent {
    /// The event describing `parent`'s current persisted state.
    pub fn for_record(parent: &TransferRecord) -> Self {
        match parent.state {
            TransferState::Complete => Self::Completed { id: parent.id },
            TransferState::Failed => Self::Failed {
                id: parent.id,
                error: parent
                    .error
                    .clone()
                    .unwrap_or_else(|| ExecutionError::Protocol("failed without a recorded cause".into())),
            },
            state => Self::Progress {
                id: parent.id,
                state,
                progress: parent.progress(),
            },
        }
    }

    pub fn id(&self) -> TransferId {
        match self {
            Self::Progress { id, .. } | Self::Failed { id, .. } | Self::Completed { id } => *id,
        }
    }

    pub fn is_terminal(&self) -> bool {
        match self {
            Self::Progress { state, .. } => state.is_terminal(),
            Self::Failed { .. } | Self::Completed { .. } => true,
        }
    }
}

/// Callback-style observer. Invoked from a dedicated task, never from the
/// reconciliation path.
pub trait TransferObserver: Send + Sync + 'static {
    fn on_progress(&self, _id: TransferId, _state: TransferState, _progress: Progress) {}
    fn on_failed(&self, _id: TransferId, _error: &ExecutionError) {}
    fn on_completed(&self, _id: TransferId) {}
}

/// Fan-out of transfer events to registered subscribers.
#[derive(Debug, Default)]
pub struct ObserverHub {
    subscribers: Mutex<Vec<UnboundedSender<TransferEvent>>>,
}

impl ObserverHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// A new channel receiving every event published from now on.
    pub fn subscribe(&self) -> UnboundedReceiver<TransferEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tx);
        rx
    }

    /// Drive `observer` from its own task until the hub is dropped.
    pub fn attach(&self, observer: Arc<dyn TransferObserver>) -> JoinHandle<()> {
        let mut rx = self.subscribe();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                match &event {
                    TransferEvent::Progress {
                        id,
                        state,
                        progress,
                    } => observer.on_progress(*id, *state, *progress),
                    TransferEvent::Failed { id, error } => observer.on_failed(*id, error),
                    TransferEvent::Completed { id } => observer.on_completed(*id),
                }
            }
        })
    }

    /// Deliver `event` to every live subscriber; closed ones are dropped.
    pub fn publish(&self, event: TransferEvent) {
        let mut subscribers = self
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Endpoint, TransferKind};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn record(state: TransferState) -> TransferRecord {
        let mut r = TransferRecord::new(
            TransferKind::Download,
            Endpoint::remote("c", "b"),
            Endpoint::local("/tmp/b"),
            0,
            Some(10),
        );
        r.state = state;
        r
    }

    #[tokio::test]
    async fn test_events_arrive_in_publish_order() {
        let hub = ObserverHub::new();
        let mut rx = hub.subscribe();
        let r = record(TransferState::InProgress);
        hub.publish(TransferEvent::for_record(&r));
        hub.publish(TransferEvent::Completed { id: r.id });

        assert!(matches!(rx.recv().await, Some(TransferEvent::Progress { state: TransferState::InProgress, .. })));
        assert_eq!(rx.recv().await, Some(TransferEvent::Completed { id: r.id }));
    }

    #[tokio::test]
    async fn test_closed_subscribers_are_pruned() {
        let hub = ObserverHub::new();
        let rx = hub.subscribe();
        let _kept = hub.subscribe();
        drop(rx);
        hub.publish(TransferEvent::Completed { id: TransferId::new() });
        assert_eq!(hub.subscriber_count(), 1);
    }

    #[test]
    fn test_failed_record_maps_to_failed_event() {
        let mut r = record(TransferState::Failed);
        r.error = Some(ExecutionError::Unauthorized(403));
        assert_eq!(
            TransferEvent::for_record(&r),
            TransferEvent::Failed {
                id: r.id,
                error: ExecutionError::Unauthorized(403)
            }
        );
        assert!(TransferEvent::for_record(&r).is_terminal());
        assert!(!TransferEvent::for_record(&record(TransferState::Paused)).is_terminal());
    }

    struct Counter {
        completed: AtomicUsize,
    }

    impl TransferObserver for Counter {
        fn on_completed(&self, _id: TransferId) {
            self.completed.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_attached_observer_is_invoked() {
        let hub = ObserverHub::new();
        let counter = Arc::new(Counter {
            completed: AtomicUsize::new(0),
        });
        let handle = hub.attach(counter.clone());
        hub.publish(TransferEvent::Completed { id: TransferId::new() });
        hub.publish(TransferEvent::Completed { id: TransferId::new() });
        drop(hub);
        handle.await.unwrap();
        assert_eq!(counter.completed.load(Ordering::SeqCst), 2);
    }
}
