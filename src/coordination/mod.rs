pub mod backend;
pub mod keys;
pub mod monitor;
pub mod orchestrator;

pub use backend::{
    CoordinationBackend, CoordinationPool, InMemoryCoordination, RedisCoordination,
    DEFAULT_TENANT,
};
pub use keys::{FencePayload, SyncKey, SyncScope, SyncTaskId};
pub use monitor::SyncMonitor;
pub use orchestrator::{SyncOrchestrator, SyncTask, SyncTaskKind};
