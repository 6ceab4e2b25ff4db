//! The indexing pipeline: connector documents in, dual-store writes out.
//!
//! Writes are at-least-once. Chunk refs are derived from `(document id,
//! ordinal)`, so re-running a batch overwrites rather than duplicates, and a
//! crash mid-batch is repaired by the next connector cycle.

use crate::access::AccessResolver;
use crate::config::PipelineConfig;
use crate::error::{AppError, Result};
use crate::index::{DocumentIndex, DocumentIndexingMetadata};
use crate::indexing::chunker::Chunker;
use crate::indexing::embedder::Embedder;
use crate::metrics::{DOCUMENTS_FAILED_TOTAL, DOCUMENTS_INDEXED_TOTAL};
use crate::models::{Document, IndexChunk};
use crate::store::{DocumentLockRegistry, MetadataStore, StoredDocument};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};
use validator::Validate;

/// Outcome of one pipeline run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexingStats {
    /// Documents not previously known to the metadata store
    pub new_docs: u64,
    /// Documents written this run
    pub total_docs: u64,
    pub chunks_written: u64,
    pub failures: u64,
}

pub struct IndexingPipeline {
    store: Arc<dyn MetadataStore>,
    index: Arc<dyn DocumentIndex>,
    embedder: Arc<Embedder>,
    chunker: Chunker,
    resolver: AccessResolver,
    locks: Arc<DocumentLockRegistry>,
    batch_size: usize,
    continue_on_failure: bool,
}

impl IndexingPipeline {
    pub fn new(
        store: Arc<dyn MetadataStore>,
        index: Arc<dyn DocumentIndex>,
        embedder: Arc<Embedder>,
        chunker: Chunker,
        locks: Arc<DocumentLockRegistry>,
        config: &PipelineConfig,
    ) -> Self {
        Self {
            resolver: AccessResolver::new(store.clone()),
            store,
            index,
            embedder,
            chunker,
            locks,
            batch_size: config.index_batch_size.max(1),
            continue_on_failure: config.continue_on_failure,
        }
    }

    /// Index a set of connector documents under one credential pair.
    ///
    /// When `attempt_id` is given, progress is written back to the attempt
    /// record and its soft-cancel flag is polled between batches.
    pub async fn index_documents(
        &self,
        documents: &[Document],
        cc_pair_id: i64,
        attempt_id: Option<i64>,
        tenant_id: Option<&str>,
    ) -> Result<IndexingStats> {
        let mut stats = IndexingStats::default();

        for batch in documents.chunks(self.batch_size) {
            if let Some(id) = attempt_id {
                self.check_cancellation(id).await?;
            }

            for document in batch {
                match self.index_one(document, cc_pair_id, tenant_id).await {
                    Ok((is_new, chunks)) => {
                        if is_new {
                            stats.new_docs += 1;
                        }
                        stats.total_docs += 1;
                        stats.chunks_written += chunks;
                        DOCUMENTS_INDEXED_TOTAL
                            .with_label_values(&[&document.source.to_string()])
                            .inc();
                    }
                    Err(e) if self.continue_on_failure => {
                        warn!(
                            document_id = %document.id,
                            error = %e,
                            "Dropping document after indexing failure"
                        );
                        stats.failures += 1;
                        DOCUMENTS_FAILED_TOTAL
                            .with_label_values(&[&document.source.to_string()])
                            .inc();
                    }
                    Err(e) => return Err(e),
                }
            }

            if let Some(id) = attempt_id {
                self.record_progress(id, &stats).await?;
            }
        }

        info!(
            cc_pair_id,
            new_docs = stats.new_docs,
            total_docs = stats.total_docs,
            chunks = stats.chunks_written,
            failures = stats.failures,
            "Indexing run complete"
        );

        Ok(stats)
    }

    /// Process one document end to end under its advisory lock.
    async fn index_one(
        &self,
        document: &Document,
        cc_pair_id: i64,
        tenant_id: Option<&str>,
    ) -> Result<(bool, u64)> {
        document
            .validate()
            .map_err(|e| AppError::Validation(e.to_string()))?;

        let _guard = self.locks.acquire(&document.id).await;

        // Merge into any existing row, keeping curation state
        let existing = self.store.get_document(&document.id).await?;
        let is_new = existing.is_none();
        let stored = match existing {
            Some(mut row) => {
                row.document = document.clone();
                if !row.cc_pair_ids.contains(&cc_pair_id) {
                    row.cc_pair_ids.push(cc_pair_id);
                }
                row
            }
            None => StoredDocument::new(document.clone(), cc_pair_id),
        };
        self.store.upsert_document(&stored).await?;

        let raw_chunks = self.chunker.chunk_document(document);
        if raw_chunks.is_empty() {
            // Nothing indexable; the row exists but carries no chunks
            self.store
                .mark_document_synced(&document.id, Utc::now())
                .await?;
            return Ok((is_new, 0));
        }

        // One passage batch covers full chunks then all mini-chunks. Full
        // chunks embed with the title (and any summarizer context)
        // prepended; stored content stays raw.
        let mut texts: Vec<String> = raw_chunks
            .iter()
            .map(|c| c.embeddable_text(&document.semantic_identifier))
            .collect();
        let mini_offsets: Vec<(usize, usize)> = {
            let mut offsets = Vec::with_capacity(raw_chunks.len());
            for chunk in &raw_chunks {
                let start = texts.len();
                texts.extend(chunk.mini_texts.iter().cloned());
                offsets.push((start, texts.len()));
            }
            offsets
        };
        let embeddings = self.embedder.embed_passages(&texts).await?;
        let title_embedding = self
            .embedder
            .embed_title(&document.semantic_identifier)
            .await?;

        let chunks: Vec<IndexChunk> = raw_chunks
            .iter()
            .enumerate()
            .map(|(i, raw)| IndexChunk {
                document_id: document.id.clone(),
                chunk_ordinal: raw.ordinal,
                content: raw.text.clone(),
                title: document.semantic_identifier.clone(),
                content_embedding: embeddings[i].clone(),
                mini_chunk_embeddings: embeddings[mini_offsets[i].0..mini_offsets[i].1].to_vec(),
                title_embedding: title_embedding.clone(),
                source_links: raw.source_link.iter().cloned().collect(),
                boost: stored.boost,
                hidden: stored.hidden,
            })
            .collect();

        let access = self.resolver.for_document(&document.id).await?;
        let document_sets = self
            .store
            .document_set_names_for_document(&document.id)
            .await?;

        let mut metadata = HashMap::new();
        metadata.insert(
            document.id.clone(),
            DocumentIndexingMetadata {
                acl_tokens: access.to_acl_tokens(),
                document_sets,
                tags: document
                    .metadata
                    .iter()
                    .map(|(k, v)| format!("{}={}", k, v))
                    .collect(),
                source: document.source,
                tenant_id: tenant_id.map(|t| t.to_string()),
                updated_at: document.updated_at,
                boost: stored.boost,
                hidden: stored.hidden,
            },
        );

        // Re-indexing may shrink the chunk count; drop old chunks first so
        // no stale tail survives
        if !is_new {
            self.index.delete(std::slice::from_ref(&document.id)).await?;
        }
        let accepted = self.index.index(&chunks, &metadata).await?;
        if !accepted.contains(&document.id) {
            return Err(AppError::Index(format!(
                "Document {} not accepted by any index store",
                document.id
            )));
        }

        self.store
            .mark_document_synced(&document.id, Utc::now())
            .await?;

        Ok((is_new, chunks.len() as u64))
    }

    async fn check_cancellation(&self, attempt_id: i64) -> Result<()> {
        let attempt = self
            .store
            .get_index_attempt(attempt_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Index attempt {}", attempt_id)))?;

        if attempt.cancellation_requested {
            let mut attempt = attempt;
            attempt.mark_cancelled();
            self.store.update_index_attempt(&attempt).await?;
            info!(attempt_id, "Index attempt cancelled between batches");
            return Err(AppError::Cancelled(format!("Index attempt {}", attempt_id)));
        }
        Ok(())
    }

    async fn record_progress(&self, attempt_id: i64, stats: &IndexingStats) -> Result<()> {
        if let Some(mut attempt) = self.store.get_index_attempt(attempt_id).await? {
            attempt.new_docs_indexed = stats.new_docs;
            attempt.total_docs_indexed = stats.total_docs;
            self.store.update_index_attempt(&attempt).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ChunkingConfig, EmbeddingConfig, IndexConfig};
    use crate::index::DualStoreIndex;
    use crate::indexing::embedder::LocalEmbeddingClient;
    use crate::models::{DocumentSource, Section};
    use crate::store::InMemoryMetadataStore;
    use tempfile::TempDir;

    fn pipeline(dir: &TempDir) -> (IndexingPipeline, Arc<InMemoryMetadataStore>) {
        let store = Arc::new(InMemoryMetadataStore::new());
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
            provider: crate::config::EmbeddingProvider::Local,
            endpoint: None,
            model: "local-test".to_string(),
            dimension: 8,
            batch_size: 16,
            query_prefix: String::new(),
            passage_prefix: String::new(),
        };
        let embedder = Arc::new(Embedder::new(
            Arc::new(LocalEmbeddingClient::new(8)),
            &embedding_config,
        ));
        let chunker = Chunker::new(&ChunkingConfig {
            chunk_token_limit: 64,
            chunk_overlap: 8,
            enable_mini_chunks: true,
            mini_chunk_divisor: 4,
        })
        .unwrap();

        let pipeline = IndexingPipeline::new(
            store.clone(),
            index,
            embedder,
            chunker,
            Arc::new(DocumentLockRegistry::new()),
            &PipelineConfig {
                index_batch_size: 2,
                continue_on_failure: false,
            },
        );
        (pipeline, store)
    }

    fn doc(id: &str, text: &str) -> Document {
        Document::new(
            id,
            DocumentSource::Web,
            format!("Title of {}", id),
            vec![Section::new(text, Some(format!("https://x/{}", id)))],
        )
    }

    #[tokio::test]
    async fn test_index_documents_counts_new_docs() {
        let dir = TempDir::new().unwrap();
        let (pipeline, store) = pipeline(&dir);

        let docs = vec![doc("d1", "first body"), doc("d2", "second body")];
        let stats = pipeline.index_documents(&docs, 1, None, None).await.unwrap();

        assert_eq!(stats.new_docs, 2);
        assert_eq!(stats.total_docs, 2);
        assert!(stats.chunks_written >= 2);

        // Re-run: same docs are no longer new
        let stats = pipeline.index_documents(&docs, 1, None, None).await.unwrap();
        assert_eq!(stats.new_docs, 0);
        assert_eq!(stats.total_docs, 2);

        let stored = store.get_document("d1").await.unwrap().unwrap();
        assert!(stored.last_synced_at.is_some());
        assert_eq!(stored.cc_pair_ids, vec![1]);
    }

    #[tokio::test]
    async fn test_second_cc_pair_recorded_on_shared_document() {
        let dir = TempDir::new().unwrap();
        let (pipeline, store) = pipeline(&dir);

        let docs = vec![doc("d1", "shared body")];
        pipeline.index_documents(&docs, 1, None, None).await.unwrap();
        pipeline.index_documents(&docs, 2, None, None).await.unwrap();

        let stored = store.get_document("d1").await.unwrap().unwrap();
        assert_eq!(stored.cc_pair_ids, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_invalid_document_fails_batch() {
        let dir = TempDir::new().unwrap();
        let (pipeline, _store) = pipeline(&dir);

        let mut bad = doc("d1", "body");
        bad.id = String::new();
        let result = pipeline.index_documents(&[bad], 1, None, None).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_soft_cancel_stops_between_batches() {
        let dir = TempDir::new().unwrap();
        let (pipeline, store) = pipeline(&dir);

        let attempt = store.create_index_attempt(1, 1).await.unwrap();
        store
            .request_cancellation_for_settings(1)
            .await
            .unwrap();

        let docs = vec![doc("d1", "a"), doc("d2", "b"), doc("d3", "c")];
        let result = pipeline
            .index_documents(&docs, 1, Some(attempt.id), None)
            .await;

        assert!(matches!(result, Err(AppError::Cancelled(_))));
        let attempt = store.get_index_attempt(attempt.id).await.unwrap().unwrap();
        assert_eq!(
            attempt.status,
            crate::models::IndexAttemptStatus::Cancelled
        );
    }
}
