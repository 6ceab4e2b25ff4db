//! Process lifecycle: wiring, singleton scheduling, shutdown.

use crate::config::Config;
use crate::connectors::ConnectorRegistry;
use crate::coordination::{
    CoordinationBackend, CoordinationPool, SyncMonitor, SyncOrchestrator, DEFAULT_TENANT,
};
use crate::error::Result;
use crate::index::{DocumentIndex, DualStoreIndex};
use crate::indexing::{create_embedding_client, Chunker, Embedder, IndexingPipeline};
use crate::models::{NewGenerationParams, SettingsStatus};
use crate::scheduler::SchedulerService;
use crate::settings::SwapManager;
use crate::store::{create_metadata_store, DocumentLockRegistry, MetadataStore};
use crate::worker::executor::SyncTaskExecutor;
use crate::worker::pool::SyncWorkerPool;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

const SCHEDULER_LOCK: &str = "scheduler";

/// One sync-engine process.
///
/// Every process runs a worker pool; the cron jobs that generate work run
/// only on the process holding the scheduler lock, so concurrent replicas
/// never double-orchestrate.
pub struct WorkerProcess {
    store: Arc<dyn MetadataStore>,
    index: Arc<dyn DocumentIndex>,
    pipeline: Arc<IndexingPipeline>,
    registry: Arc<ConnectorRegistry>,
    backend: Arc<dyn CoordinationBackend>,
    scheduler: SchedulerService,
    lock_owner: String,
    holds_scheduler_lock: bool,
    pool_handle: Option<JoinHandle<()>>,
    refresh_handle: Option<JoinHandle<()>>,
    // Dropped on stop so the pool's channel closes
    orchestrator: Option<Arc<SyncOrchestrator>>,
}

impl WorkerProcess {
    /// Build every component, bootstrap settings, and start the pool and
    /// (when the lock is won) the scheduler.
    pub async fn start(config: &Config) -> Result<Self> {
        let store = create_metadata_store(&config.metadata)?;

        let coordination = CoordinationPool::from_config(&config.coordination).await?;
        let backend = coordination.tenant(DEFAULT_TENANT)?;

        let index: Arc<dyn DocumentIndex> = Arc::new(DualStoreIndex::new(&config.index)?);
        let client = create_embedding_client(&config.embedding)?;
        let embedder = Arc::new(Embedder::new(client, &config.embedding));
        embedder.warm_up().await?;
        let chunker = Chunker::new(&config.chunking)?;

        let pipeline = Arc::new(IndexingPipeline::new(
            store.clone(),
            index.clone(),
            embedder,
            chunker,
            Arc::new(DocumentLockRegistry::new()),
            &config.pipeline,
        ));
        let registry = Arc::new(ConnectorRegistry::new());

        // A PRESENT settings generation must exist before any indexing runs
        let swap = Arc::new(SwapManager::new(store.clone()));
        swap.ensure_present(&NewGenerationParams {
            index_name: "chunks_v1".to_string(),
            model_name: config.embedding.model.clone(),
            model_dimension: config.embedding.dimension,
            query_prefix: config.embedding.query_prefix.clone(),
            passage_prefix: config.embedding.passage_prefix.clone(),
        })
        .await?;
        // A swap may have become promotable while no scheduler was running
        swap.check_and_promote().await?;

        let (dispatcher, task_rx) = mpsc::unbounded_channel();
        let orchestrator = Arc::new(SyncOrchestrator::new(
            store.clone(),
            backend.clone(),
            registry.clone(),
            dispatcher,
        ));
        let monitor = Arc::new(SyncMonitor::new(
            store.clone(),
            backend.clone(),
            registry.clone(),
            config.coordination.stale_fence_timeout_secs,
        ));

        let executor = Arc::new(SyncTaskExecutor::new(
            store.clone(),
            index.clone(),
            registry.clone(),
            pipeline.clone(),
        ));
        let pool = Arc::new(SyncWorkerPool::new(
            executor,
            backend.clone(),
            config.worker.max_concurrent_tasks,
        ));
        let pool_handle = pool.spawn(task_rx);

        let mut process = Self {
            store,
            index,
            pipeline,
            registry,
            backend,
            scheduler: SchedulerService::new(config.scheduler.enabled).await?,
            lock_owner: uuid::Uuid::new_v4().to_string(),
            holds_scheduler_lock: false,
            pool_handle: Some(pool_handle),
            refresh_handle: None,
            orchestrator: Some(orchestrator.clone()),
        };

        let lock_ttl = Duration::from_secs(config.coordination.lock_ttl_secs);
        process.holds_scheduler_lock = process
            .backend
            .acquire_lock(SCHEDULER_LOCK, &process.lock_owner, lock_ttl)
            .await?;

        if process.holds_scheduler_lock {
            process.refresh_handle = Some(process.spawn_lock_refresh(lock_ttl));
            process
                .register_jobs(&config.scheduler, orchestrator, monitor, swap)
                .await?;
            process.scheduler.start().await?;
            info!(owner = %process.lock_owner, "Scheduler lock acquired, running as scheduler");
        } else {
            info!("Scheduler lock held elsewhere, running as worker only");
        }

        Ok(process)
    }

    async fn register_jobs(
        &mut self,
        config: &crate::config::SchedulerConfig,
        orchestrator: Arc<SyncOrchestrator>,
        monitor: Arc<SyncMonitor>,
        swap: Arc<SwapManager>,
    ) -> Result<()> {
        let o = orchestrator.clone();
        self.scheduler
            .add_job("document_set_sync", &config.document_set_sync_schedule, move || {
                let o = o.clone();
                async move { o.orchestrate_document_sets().await }
            })
            .await?;

        let o = orchestrator.clone();
        self.scheduler
            .add_job("user_group_sync", &config.group_sync_schedule, move || {
                let o = o.clone();
                async move { o.orchestrate_user_groups().await }
            })
            .await?;

        let o = orchestrator.clone();
        self.scheduler
            .add_job("permission_sync", &config.permission_sync_schedule, move || {
                let o = o.clone();
                async move { o.orchestrate_permission_sync().await }
            })
            .await?;

        // Indexing, deletion, and pruning share a cadence; the fences keep
        // overlapping passes from stacking work
        let o = orchestrator;
        self.scheduler
            .add_job(
                "connector_lifecycle",
                &config.connector_lifecycle_schedule,
                move || {
                    let o = o.clone();
                    async move {
                        o.orchestrate_connector_indexing().await?;
                        o.orchestrate_connector_deletions().await?;
                        o.orchestrate_pruning().await
                    }
                },
            )
            .await?;

        self.scheduler
            .add_job("sync_monitor", &config.monitor_schedule, move || {
                let monitor = monitor.clone();
                async move { monitor.tick().await.map(|_| ()) }
            })
            .await?;

        self.scheduler
            .add_job("settings_check", &config.settings_check_schedule, move || {
                let swap = swap.clone();
                async move { swap.check_and_promote().await.map(|_| ()) }
            })
            .await?;

        Ok(())
    }

    /// Keep the scheduler lock alive at a quarter of its TTL.
    fn spawn_lock_refresh(&self, ttl: Duration) -> JoinHandle<()> {
        let backend = self.backend.clone();
        let owner = self.lock_owner.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(ttl / 4);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                match backend.refresh_lock(SCHEDULER_LOCK, &owner, ttl).await {
                    Ok(true) => {}
                    Ok(false) => {
                        warn!("Scheduler lock lost, refresh loop exiting");
                        break;
                    }
                    Err(e) => warn!(error = %e, "Scheduler lock refresh failed"),
                }
            }
        })
    }

    /// Graceful shutdown: stop generating work, drain the pool, release
    /// the lock.
    pub async fn stop(&mut self) -> Result<()> {
        self.scheduler.shutdown().await?;
        if let Some(handle) = self.refresh_handle.take() {
            handle.abort();
        }

        // Soft-cancel running attempts so connector runs stop at the next
        // batch boundary instead of holding the drain open
        if let Some(present) = self
            .store
            .get_settings_with_status(SettingsStatus::Present)
            .await?
        {
            let cancelled = self
                .store
                .request_cancellation_for_settings(present.id)
                .await?;
            if cancelled > 0 {
                info!(cancelled, "Requested cancellation of running index attempts");
            }
        }

        // Dropping the last dispatcher closes the pool's channel
        self.orchestrator.take();
        if let Some(handle) = self.pool_handle.take() {
            if tokio::time::timeout(Duration::from_secs(30), handle)
                .await
                .is_err()
            {
                warn!("Worker pool did not drain within 30s");
            }
        }

        if self.holds_scheduler_lock {
            self.backend
                .release_lock(SCHEDULER_LOCK, &self.lock_owner)
                .await?;
            self.holds_scheduler_lock = false;
        }
        info!("Worker process stopped");
        Ok(())
    }

    pub fn store(&self) -> Arc<dyn MetadataStore> {
        self.store.clone()
    }

    pub fn index(&self) -> Arc<dyn DocumentIndex> {
        self.index.clone()
    }

    /// Pipeline handle for push-based ingestion alongside the scheduler
    pub fn pipeline(&self) -> Arc<IndexingPipeline> {
        self.pipeline.clone()
    }

    pub fn registry(&self) -> Arc<ConnectorRegistry> {
        self.registry.clone()
    }
}
