pub mod dual;
pub mod filters;
pub mod keyword;
pub mod vector;

pub use dual::DualStoreIndex;
pub use filters::{IndexFilters, UNDATED_GRACE_DAYS};
pub use keyword::KeywordIndex;
pub use vector::VectorIndex;

use crate::error::Result;
use crate::models::{DocumentSource, IndexChunk};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};

/// Per-document fields written alongside a chunk batch
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentIndexingMetadata {
    /// Flattened ACL token set from the access resolver
    pub acl_tokens: BTreeSet<String>,
    pub document_sets: Vec<String>,
    pub tags: Vec<String>,
    pub source: DocumentSource,
    pub tenant_id: Option<String>,
    pub updated_at: Option<DateTime<Utc>>,
    pub boost: i32,
    pub hidden: bool,
}

/// Partial field update for one document's chunks; nothing is re-embedded
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateRequest {
    pub document_id: String,
    pub acl_tokens: Option<BTreeSet<String>>,
    pub document_sets: Option<Vec<String>>,
    pub boost: Option<i32>,
    pub hidden: Option<bool>,
}

impl UpdateRequest {
    pub fn for_document(document_id: impl Into<String>) -> Self {
        Self {
            document_id: document_id.into(),
            ..Default::default()
        }
    }

    pub fn with_acl(mut self, acl_tokens: BTreeSet<String>) -> Self {
        self.acl_tokens = Some(acl_tokens);
        self
    }

    pub fn with_document_sets(mut self, document_sets: Vec<String>) -> Self {
        self.document_sets = Some(document_sets);
        self
    }

    pub fn with_boost(mut self, boost: i32) -> Self {
        self.boost = Some(boost);
        self
    }

    pub fn with_hidden(mut self, hidden: bool) -> Self {
        self.hidden = Some(hidden);
        self
    }
}

/// A chunk returned by retrieval
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievedChunk {
    pub document_id: String,
    pub chunk_ordinal: usize,
    pub content: String,
    pub title: String,
    pub source_links: Vec<String>,
    pub score: f32,
}

/// The dual-store (keyword + vector) writer/reader abstraction.
///
/// Writes are idempotent upserts keyed by chunk reference; at-least-once
/// delivery is the contract, so re-indexing the same chunk is always safe.
#[async_trait]
pub trait DocumentIndex: Send + Sync {
    /// Upsert chunks into both stores. Returns the document ids each store
    /// accepted, unioned best-effort when the stores diverge.
    async fn index(
        &self,
        chunks: &[IndexChunk],
        metadata: &HashMap<String, DocumentIndexingMetadata>,
    ) -> Result<HashSet<String>>;

    /// Apply partial field updates without re-embedding
    async fn update(&self, requests: &[UpdateRequest]) -> Result<()>;

    /// Remove every chunk of the given documents from both stores
    async fn delete(&self, document_ids: &[String]) -> Result<()>;

    /// BM25 retrieval over chunk content and titles
    async fn keyword_retrieval(
        &self,
        query: &str,
        filters: &IndexFilters,
        limit: usize,
    ) -> Result<Vec<RetrievedChunk>>;

    /// Nearest-neighbor retrieval over chunk embeddings
    async fn semantic_retrieval(
        &self,
        query_embedding: &[f32],
        filters: &IndexFilters,
        limit: usize,
    ) -> Result<Vec<RetrievedChunk>>;
}
