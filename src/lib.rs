pub mod collection;
pub mod config;
pub mod error;
pub mod executor;
pub mod integrity;
pub mod limiter;
pub mod manager;
pub mod models;
pub mod observer;
pub mod pipeline;
pub mod plan;
pub mod queue;
pub mod reconcile;
pub mod retry;
pub mod sqlite_store;
pub mod store;

/// Convenient type alias exposing common structs.
pub mod prelude {
    pub use crate::collection::{TransferCollection, TransferFilter};
    pub use crate::config::ManagerConfig;
    pub use crate::error::{ExecutionError, InvalidTransferError, PersistenceError, TransferError};
    pub use crate::executor::{ChunkExecutor, ChunkJob, ChunkOutcome, HttpChunkExecutor};
    pub use crate::limiter::SpeedLimiter;
    pub use crate::manager::TransferManager;
    pub use crate::models::{
        ChunkRole, Endpoint, Progress, TransferId, TransferKind, TransferRecord, TransferState,
    };
    pub use crate::observer::{TransferEvent, TransferObserver};
    pub use crate::pipeline::{Pipeline, PipelineRequest, PipelineResponse, ReqwestPipeline};
    pub use crate::plan::TransferRequest;
    pub use crate::retry::RetryPolicy;
    pub use crate::sqlite_store::SqliteTransferStore;
    pub use crate::store::{MemoryTransferStore, TransferQuery, TransferStore};
}
