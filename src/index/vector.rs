use crate::error::{AppError, Result};
use crate::index::filters::{ChunkFilterView, IndexFilters};
use crate::index::{DocumentIndexingMetadata, RetrievedChunk, UpdateRequest};
use crate::models::{DocumentSource, IndexChunk};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

/// One chunk as held by the vector store: embeddings plus the filterable
/// fields partial updates can rewrite.
#[derive(Debug, Clone)]
struct VectorRecord {
    document_id: String,
    chunk_ordinal: usize,
    content: String,
    title: String,
    source_links: Vec<String>,
    content_embedding: Vec<f32>,
    mini_chunk_embeddings: Vec<Vec<f32>>,
    title_embedding: Option<Vec<f32>>,
    acl_tokens: BTreeSet<String>,
    document_sets: Vec<String>,
    tags: Vec<String>,
    source: DocumentSource,
    tenant_id: Option<String>,
    updated_at: Option<DateTime<Utc>>,
    boost: i32,
    hidden: bool,
}

/// In-process nearest-neighbor store over chunk embeddings.
///
/// Brute-force cosine scan; the record count per deployment is bounded by
/// chunk granularity, and the store is rebuildable from the metadata store
/// at any time.
#[derive(Clone, Default)]
pub struct VectorIndex {
    records: Arc<DashMap<String, VectorRecord>>,
    /// document id -> chunk refs, for delete/update fan-out
    doc_chunks: Arc<DashMap<String, HashSet<String>>>,
}

impl VectorIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn chunk_count(&self) -> usize {
        self.records.len()
    }

    pub fn index_chunks(
        &self,
        chunks: &[IndexChunk],
        metadata: &HashMap<String, DocumentIndexingMetadata>,
    ) -> Result<HashSet<String>> {
        let mut accepted = HashSet::new();

        for chunk in chunks {
            let meta = metadata.get(&chunk.document_id).ok_or_else(|| {
                AppError::Validation(format!(
                    "No indexing metadata for document {}",
                    chunk.document_id
                ))
            })?;

            let chunk_ref = chunk.chunk_ref();
            let record = VectorRecord {
                document_id: chunk.document_id.clone(),
                chunk_ordinal: chunk.chunk_ordinal,
                content: chunk.content.clone(),
                title: chunk.title.clone(),
                source_links: chunk.source_links.clone(),
                content_embedding: chunk.content_embedding.clone(),
                mini_chunk_embeddings: chunk.mini_chunk_embeddings.clone(),
                title_embedding: chunk.title_embedding.clone(),
                acl_tokens: meta.acl_tokens.clone(),
                document_sets: meta.document_sets.clone(),
                tags: meta.tags.clone(),
                source: meta.source,
                tenant_id: meta.tenant_id.clone(),
                updated_at: meta.updated_at,
                boost: meta.boost,
                hidden: meta.hidden,
            };

            self.records.insert(chunk_ref.clone(), record);
            self.doc_chunks
                .entry(chunk.document_id.clone())
                .or_default()
                .insert(chunk_ref);
            accepted.insert(chunk.document_id.clone());
        }

        Ok(accepted)
    }

    pub fn update(&self, requests: &[UpdateRequest]) -> Result<()> {
        for request in requests {
            let Some(chunk_refs) = self
                .doc_chunks
                .get(&request.document_id)
                .map(|e| e.clone())
            else {
                continue;
            };

            for chunk_ref in chunk_refs {
                if let Some(mut record) = self.records.get_mut(&chunk_ref) {
                    if let Some(ref acl) = request.acl_tokens {
                        record.acl_tokens = acl.clone();
                    }
                    if let Some(ref sets) = request.document_sets {
                        record.document_sets = sets.clone();
                    }
                    if let Some(boost) = request.boost {
                        record.boost = boost;
                    }
                    if let Some(hidden) = request.hidden {
                        record.hidden = hidden;
                    }
                }
            }
        }
        Ok(())
    }

    pub fn delete(&self, document_ids: &[String]) -> Result<()> {
        for doc_id in document_ids {
            if let Some((_, chunk_refs)) = self.doc_chunks.remove(doc_id) {
                for chunk_ref in chunk_refs {
                    self.records.remove(&chunk_ref);
                }
            }
        }
        Ok(())
    }

    /// Cosine scan; a chunk scores as the best of its full-content vector
    /// and any mini-chunk vector, nudged by the document boost.
    pub fn search(
        &self,
        query_embedding: &[f32],
        filters: &IndexFilters,
        limit: usize,
    ) -> Result<Vec<RetrievedChunk>> {
        let mut hits: Vec<RetrievedChunk> = Vec::new();

        for entry in self.records.iter() {
            let record = entry.value();
            let v = ChunkFilterView {
                acl_tokens: &record.acl_tokens,
                source: record.source,
                tags: &record.tags,
                document_sets: &record.document_sets,
                tenant_id: record.tenant_id.as_deref(),
                updated_at: record.updated_at,
                hidden: record.hidden,
            };
            if !filters.matches(&v) {
                continue;
            }

            let mut score = cosine(query_embedding, &record.content_embedding);
            for mini in &record.mini_chunk_embeddings {
                score = score.max(cosine(query_embedding, mini));
            }
            if let Some(ref title) = record.title_embedding {
                // Title relevance contributes a fraction of its similarity.
                score = score.max(0.5 * cosine(query_embedding, title));
            }
            score *= boost_multiplier(record.boost);

            hits.push(RetrievedChunk {
                document_id: record.document_id.clone(),
                chunk_ordinal: record.chunk_ordinal,
                content: record.content.clone(),
                title: record.title.clone(),
                source_links: record.source_links.clone(),
                score,
            });
        }

        hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        hits.truncate(limit);
        Ok(hits)
    }
}

fn cosine(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

fn boost_multiplier(boost: i32) -> f32 {
    (1.0 + 0.05 * boost as f32).max(0.1)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(acl: &[&str]) -> DocumentIndexingMetadata {
        DocumentIndexingMetadata {
            acl_tokens: acl.iter().map(|s| s.to_string()).collect(),
            document_sets: Vec::new(),
            tags: Vec::new(),
            source: DocumentSource::Web,
            tenant_id: None,
            updated_at: Some(Utc::now()),
            boost: 0,
            hidden: false,
        }
    }

    fn chunk(doc_id: &str, ordinal: usize, embedding: Vec<f32>) -> IndexChunk {
        IndexChunk {
            document_id: doc_id.to_string(),
            chunk_ordinal: ordinal,
            content: format!("content {}", ordinal),
            title: "title".to_string(),
            content_embedding: embedding,
            mini_chunk_embeddings: Vec::new(),
            title_embedding: None,
            source_links: Vec::new(),
            boost: 0,
            hidden: false,
        }
    }

    #[test]
    fn test_index_and_search() {
        let index = VectorIndex::new();
        let mut metadata = HashMap::new();
        metadata.insert("d1".to_string(), meta(&["PUBLIC"]));
        metadata.insert("d2".to_string(), meta(&["PUBLIC"]));

        index
            .index_chunks(
                &[
                    chunk("d1", 0, vec![1.0, 0.0, 0.0]),
                    chunk("d2", 0, vec![0.0, 1.0, 0.0]),
                ],
                &metadata,
            )
            .unwrap();

        let hits = index
            .search(&[1.0, 0.0, 0.0], &IndexFilters::default(), 10)
            .unwrap();
        assert_eq!(hits[0].document_id, "d1");
        assert!(hits[0].score > hits[1].score);
    }

    #[test]
    fn test_delete_removes_all_chunks() {
        let index = VectorIndex::new();
        let mut metadata = HashMap::new();
        metadata.insert("d1".to_string(), meta(&["PUBLIC"]));

        index
            .index_chunks(
                &[
                    chunk("d1", 0, vec![1.0, 0.0]),
                    chunk("d1", 1, vec![0.9, 0.1]),
                ],
                &metadata,
            )
            .unwrap();
        assert_eq!(index.chunk_count(), 2);

        index.delete(&["d1".to_string()]).unwrap();
        assert_eq!(index.chunk_count(), 0);
        let hits = index
            .search(&[1.0, 0.0], &IndexFilters::default(), 10)
            .unwrap();
        assert!(hits.is_empty());
    }

    #[test]
    fn test_upsert_replaces_chunk() {
        let index = VectorIndex::new();
        let mut metadata = HashMap::new();
        metadata.insert("d1".to_string(), meta(&["PUBLIC"]));

        index
            .index_chunks(&[chunk("d1", 0, vec![1.0, 0.0])], &metadata)
            .unwrap();
        index
            .index_chunks(&[chunk("d1", 0, vec![0.0, 1.0])], &metadata)
            .unwrap();

        assert_eq!(index.chunk_count(), 1);
    }

    #[test]
    fn test_update_hides_document() {
        let index = VectorIndex::new();
        let mut metadata = HashMap::new();
        metadata.insert("d1".to_string(), meta(&["PUBLIC"]));
        index
            .index_chunks(&[chunk("d1", 0, vec![1.0, 0.0])], &metadata)
            .unwrap();

        index
            .update(&[UpdateRequest::for_document("d1").with_hidden(true)])
            .unwrap();

        let hits = index
            .search(&[1.0, 0.0], &IndexFilters::default(), 10)
            .unwrap();
        assert!(hits.is_empty());
    }

    #[test]
    fn test_acl_filtering() {
        let index = VectorIndex::new();
        let mut metadata = HashMap::new();
        metadata.insert("d1".to_string(), meta(&["group:eng"]));
        index
            .index_chunks(&[chunk("d1", 0, vec![1.0, 0.0])], &metadata)
            .unwrap();

        let allowed = IndexFilters::for_user_tokens(["group:eng".to_string()].into());
        let denied = IndexFilters::for_user_tokens(["group:sales".to_string()].into());

        assert_eq!(index.search(&[1.0, 0.0], &allowed, 10).unwrap().len(), 1);
        assert!(index.search(&[1.0, 0.0], &denied, 10).unwrap().is_empty());
    }

    #[test]
    fn test_mini_chunk_best_score_wins() {
        let index = VectorIndex::new();
        let mut metadata = HashMap::new();
        metadata.insert("d1".to_string(), meta(&["PUBLIC"]));

        let mut c = chunk("d1", 0, vec![0.0, 1.0]);
        c.mini_chunk_embeddings = vec![vec![1.0, 0.0]];
        index.index_chunks(&[c], &metadata).unwrap();

        let hits = index
            .search(&[1.0, 0.0], &IndexFilters::default(), 10)
            .unwrap();
        assert!(hits[0].score > 0.9);
    }
}
