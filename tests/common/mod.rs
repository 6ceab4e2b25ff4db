//! Shared harness for integration tests: a fully wired engine on in-memory
//! backends with a tempdir-backed keyword index.

#![allow(dead_code)]

use docsync::config::{ChunkingConfig, EmbeddingConfig, EmbeddingProvider, IndexConfig, PipelineConfig};
use docsync::connectors::ConnectorRegistry;
use docsync::coordination::{
    CoordinationBackend, InMemoryCoordination, SyncMonitor, SyncOrchestrator, SyncTask,
};
use docsync::index::DualStoreIndex;
use docsync::indexing::{Chunker, Embedder, IndexingPipeline, LocalEmbeddingClient};
use docsync::models::{
    AccessType, ConnectorCredentialPair, Document, DocumentSource, SearchSettings, Section,
    SettingsStatus,
};
use docsync::store::{DocumentLockRegistry, InMemoryMetadataStore, MetadataStore};
use docsync::worker::SyncTaskExecutor;
use std::sync::Arc;
use tempfile::TempDir;
use tokio::sync::mpsc;

pub const EMBED_DIM: usize = 16;

pub struct TestEngine {
    pub store: Arc<InMemoryMetadataStore>,
    pub backend: Arc<InMemoryCoordination>,
    pub registry: Arc<ConnectorRegistry>,
    pub index: Arc<DualStoreIndex>,
    pub embedder: Arc<Embedder>,
    pub pipeline: Arc<IndexingPipeline>,
    pub orchestrator: SyncOrchestrator,
    pub monitor: SyncMonitor,
    pub executor: Arc<SyncTaskExecutor>,
    pub task_rx: mpsc::UnboundedReceiver<SyncTask>,
    _dir: TempDir,
}

pub async fn engine() -> TestEngine {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(InMemoryMetadataStore::new());
    let backend = Arc::new(InMemoryCoordination::new());
    let registry = Arc::new(ConnectorRegistry::new());

    let index = Arc::new(
        DualStoreIndex::new(&IndexConfig {
            keyword_path: dir.path().to_path_buf(),
            writer_heap_bytes: 15_000_000,
            realtime_commit: true,
            max_retries: 2,
            retry_backoff_ms: 5,
        })
        .unwrap(),
    );

    let embedding_config = EmbeddingConfig {
        provider: EmbeddingProvider::Local,
        endpoint: None,
        model: "local-test".to_string(),
        dimension: EMBED_DIM,
        batch_size: 8,
        query_prefix: String::new(),
        passage_prefix: String::new(),
    };
    let embedder = Arc::new(Embedder::new(
        Arc::new(LocalEmbeddingClient::new(EMBED_DIM)),
        &embedding_config,
    ));
    let chunker = Chunker::new(&ChunkingConfig {
        chunk_token_limit: 128,
        chunk_overlap: 16,
        enable_mini_chunks: true,
        mini_chunk_divisor: 4,
    })
    .unwrap();

    let pipeline = Arc::new(IndexingPipeline::new(
        store.clone(),
        index.clone(),
        embedder.clone(),
        chunker,
        Arc::new(DocumentLockRegistry::new()),
        &PipelineConfig {
            index_batch_size: 4,
            continue_on_failure: false,
        },
    ));

    let (dispatcher, task_rx) = mpsc::unbounded_channel();
    let orchestrator = SyncOrchestrator::new(
        store.clone(),
        backend.clone(),
        registry.clone(),
        dispatcher,
    );
    let monitor = SyncMonitor::new(store.clone(), backend.clone(), registry.clone(), 3600);
    let executor = Arc::new(SyncTaskExecutor::new(
        store.clone(),
        index.clone(),
        registry.clone(),
        pipeline.clone(),
    ));

    TestEngine {
        store,
        backend,
        registry,
        index,
        embedder,
        pipeline,
        orchestrator,
        monitor,
        executor,
        task_rx,
        _dir: dir,
    }
}

impl TestEngine {
    /// Execute every dispatched task inline, clearing each from its taskset
    /// on success, the way the worker pool does. Returns how many ran.
    pub async fn run_dispatched(&mut self) -> usize {
        let mut ran = 0;
        while let Ok(task) = self.task_rx.try_recv() {
            if self.executor.execute(&task).await.is_ok() {
                self.backend
                    .taskset_remove(task.id.key(), &task.id)
                    .await
                    .unwrap();
            }
            ran += 1;
        }
        ran
    }

    pub async fn seed_present_settings(&self) {
        self.store
            .insert_search_settings(&SearchSettings::new(
                1,
                "chunks_v1",
                SettingsStatus::Present,
                "local-test",
                EMBED_DIM,
            ))
            .await
            .unwrap();
    }

    pub async fn seed_pair(&self, id: i64, access_type: AccessType) -> ConnectorCredentialPair {
        let pair = ConnectorCredentialPair::new(id, id, id, format!("pair-{}", id), access_type);
        self.store.upsert_cc_pair(&pair).await.unwrap();
        pair
    }
}

pub fn doc(id: &str, title: &str, body: &str) -> Document {
    Document::new(
        id,
        DocumentSource::Web,
        title,
        vec![Section::new(body, Some(format!("https://example.com/{}", id)))],
    )
}
