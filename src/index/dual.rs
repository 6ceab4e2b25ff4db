//! Dual-store document index: Tantivy for keywords, an in-process vector
//! store for embeddings.
//!
//! Writes go to both stores with per-store bounded retries. There is no
//! cross-store transaction; a document accepted by only one store is logged
//! and counted, and the union is reported so callers can mark it synced
//! and let the next indexing cycle converge the stores.

use crate::config::IndexConfig;
use crate::error::{AppError, Result};
use crate::index::filters::IndexFilters;
use crate::index::keyword::KeywordIndex;
use crate::index::vector::VectorIndex;
use crate::index::{DocumentIndex, DocumentIndexingMetadata, RetrievedChunk, UpdateRequest};
use crate::metrics::INDEX_DIVERGENCES_TOTAL;
use crate::models::IndexChunk;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tracing::{debug, warn};

pub struct DualStoreIndex {
    keyword: KeywordIndex,
    vector: VectorIndex,
    max_retries: u32,
    retry_backoff: Duration,
}

impl DualStoreIndex {
    pub fn new(config: &IndexConfig) -> Result<Self> {
        Ok(Self {
            keyword: KeywordIndex::new(config)?,
            vector: VectorIndex::new(),
            max_retries: config.max_retries,
            retry_backoff: Duration::from_millis(config.retry_backoff_ms),
        })
    }

    /// Retry a store operation on transient errors with linear backoff.
    async fn with_retries<T, F, Fut>(&self, store: &'static str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let mut attempt = 0u32;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < self.max_retries => {
                    attempt += 1;
                    warn!(
                        store = store,
                        attempt = attempt,
                        error = %e,
                        "Transient index store failure, retrying"
                    );
                    tokio::time::sleep(self.retry_backoff * attempt).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn record_divergence(
        keyword_accepted: &HashSet<String>,
        vector_accepted: &HashSet<String>,
    ) {
        for doc_id in keyword_accepted.symmetric_difference(vector_accepted) {
            INDEX_DIVERGENCES_TOTAL.inc();
            warn!(
                document_id = %doc_id,
                in_keyword = keyword_accepted.contains(doc_id),
                in_vector = vector_accepted.contains(doc_id),
                "Index stores diverged for document"
            );
        }
    }
}

#[async_trait]
impl DocumentIndex for DualStoreIndex {
    async fn index(
        &self,
        chunks: &[IndexChunk],
        metadata: &HashMap<String, DocumentIndexingMetadata>,
    ) -> Result<HashSet<String>> {
        let keyword_accepted = self
            .with_retries("keyword", || self.keyword.index_chunks(chunks, metadata))
            .await?;

        let vector_accepted = self
            .with_retries("vector", || {
                let result = self.vector.index_chunks(chunks, metadata);
                async move { result }
            })
            .await?;

        Self::record_divergence(&keyword_accepted, &vector_accepted);

        debug!(
            chunks = chunks.len(),
            documents = keyword_accepted.union(&vector_accepted).count(),
            "Indexed chunk batch"
        );

        Ok(keyword_accepted.union(&vector_accepted).cloned().collect())
    }

    async fn update(&self, requests: &[UpdateRequest]) -> Result<()> {
        self.with_retries("keyword", || self.keyword.update(requests))
            .await?;
        self.with_retries("vector", || {
            let result = self.vector.update(requests);
            async move { result }
        })
        .await?;
        Ok(())
    }

    async fn delete(&self, document_ids: &[String]) -> Result<()> {
        self.with_retries("keyword", || self.keyword.delete(document_ids))
            .await?;
        self.with_retries("vector", || {
            let result = self.vector.delete(document_ids);
            async move { result }
        })
        .await?;

        debug!(documents = document_ids.len(), "Deleted documents from both stores");
        Ok(())
    }

    async fn keyword_retrieval(
        &self,
        query: &str,
        filters: &IndexFilters,
        limit: usize,
    ) -> Result<Vec<RetrievedChunk>> {
        if limit == 0 {
            return Err(AppError::Validation("Retrieval limit must be positive".to_string()));
        }
        self.keyword.search(query, filters, limit).await
    }

    async fn semantic_retrieval(
        &self,
        query_embedding: &[f32],
        filters: &IndexFilters,
        limit: usize,
    ) -> Result<Vec<RetrievedChunk>> {
        if limit == 0 {
            return Err(AppError::Validation("Retrieval limit must be positive".to_string()));
        }
        self.vector.search(query_embedding, filters, limit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::DocumentSource;
    use chrono::Utc;
    use tempfile::TempDir;

    fn test_config(dir: &TempDir) -> IndexConfig {
        IndexConfig {
            keyword_path: dir.path().to_path_buf(),
            writer_heap_bytes: 15_000_000,
            realtime_commit: true,
            max_retries: 2,
            retry_backoff_ms: 5,
        }
    }

    fn meta() -> DocumentIndexingMetadata {
        DocumentIndexingMetadata {
            acl_tokens: ["PUBLIC".to_string()].into_iter().collect(),
            document_sets: Vec::new(),
            tags: Vec::new(),
            source: DocumentSource::Web,
            tenant_id: None,
            updated_at: Some(Utc::now()),
            boost: 0,
            hidden: false,
        }
    }

    fn chunk(doc_id: &str, content: &str) -> IndexChunk {
        IndexChunk {
            document_id: doc_id.to_string(),
            chunk_ordinal: 0,
            content: content.to_string(),
            title: "title".to_string(),
            content_embedding: vec![1.0, 0.0, 0.0],
            mini_chunk_embeddings: Vec::new(),
            title_embedding: None,
            source_links: Vec::new(),
            boost: 0,
            hidden: false,
        }
    }

    #[tokio::test]
    async fn test_both_stores_serve_results() {
        let dir = TempDir::new().unwrap();
        let index = DualStoreIndex::new(&test_config(&dir)).unwrap();

        let mut metadata = HashMap::new();
        metadata.insert("d1".to_string(), meta());

        let accepted = index
            .index(&[chunk("d1", "kubernetes upgrade guide")], &metadata)
            .await
            .unwrap();
        assert!(accepted.contains("d1"));

        let kw = index
            .keyword_retrieval("kubernetes", &IndexFilters::default(), 5)
            .await
            .unwrap();
        assert_eq!(kw.len(), 1);

        let sem = index
            .semantic_retrieval(&[1.0, 0.0, 0.0], &IndexFilters::default(), 5)
            .await
            .unwrap();
        assert_eq!(sem.len(), 1);
    }

    #[tokio::test]
    async fn test_delete_applies_to_both_stores() {
        let dir = TempDir::new().unwrap();
        let index = DualStoreIndex::new(&test_config(&dir)).unwrap();

        let mut metadata = HashMap::new();
        metadata.insert("d1".to_string(), meta());
        index
            .index(&[chunk("d1", "terraform module layout")], &metadata)
            .await
            .unwrap();

        index.delete(&["d1".to_string()]).await.unwrap();

        assert!(index
            .keyword_retrieval("terraform", &IndexFilters::default(), 5)
            .await
            .unwrap()
            .is_empty());
        assert!(index
            .semantic_retrieval(&[1.0, 0.0, 0.0], &IndexFilters::default(), 5)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_zero_limit_rejected() {
        let dir = TempDir::new().unwrap();
        let index = DualStoreIndex::new(&test_config(&dir)).unwrap();

        assert!(index
            .keyword_retrieval("anything", &IndexFilters::default(), 0)
            .await
            .is_err());
    }
}
