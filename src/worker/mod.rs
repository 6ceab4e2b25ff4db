pub mod executor;
pub mod pool;
pub mod process;

pub use executor::SyncTaskExecutor;
pub use pool::SyncWorkerPool;
pub use process::WorkerProcess;
