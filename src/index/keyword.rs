//! Tantivy-backed keyword store

use crate::config::IndexConfig;
use crate::error::{AppError, Result};
use crate::index::filters::IndexFilters;
use crate::index::{DocumentIndexingMetadata, RetrievedChunk, UpdateRequest};
use crate::models::IndexChunk;
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use tantivy::collector::TopDocs;
use tantivy::query::{
    AllQuery, BooleanQuery, DisjunctionMaxQuery, Occur, Query, QueryParser, RangeQuery, TermQuery,
};
use tantivy::schema::{Schema, Value, FAST, INDEXED, STORED, STRING, TEXT};
use tantivy::{Index, IndexReader, IndexWriter, ReloadPolicy, TantivyDocument, Term};
use tokio::sync::RwLock;

/// Maximum chunks one document is expected to hold; bounds the stored-field
/// re-read during partial updates.
const MAX_CHUNKS_PER_DOCUMENT: usize = 10_000;

fn build_chunk_schema() -> Schema {
    let mut schema_builder = Schema::builder();

    // Chunk identity: unique ref plus parent document id
    schema_builder.add_text_field("id", STRING | STORED);
    schema_builder.add_text_field("doc_id", STRING | STORED);
    schema_builder.add_i64_field("ordinal", STORED);

    // Searchable text
    schema_builder.add_text_field("content", TEXT | STORED);
    schema_builder.add_text_field("title", TEXT | STORED);
    schema_builder.add_text_field("source_link", STRING | STORED);

    // Filterable metadata; all stored so partial updates can re-read them
    schema_builder.add_text_field("acl", STRING | STORED);
    schema_builder.add_text_field("document_set", STRING | STORED);
    schema_builder.add_text_field("tag", STRING | STORED);
    schema_builder.add_text_field("source", STRING | STORED);
    schema_builder.add_text_field("tenant", STRING | STORED);
    schema_builder.add_i64_field("boost", STORED);
    schema_builder.add_i64_field("hidden", INDEXED | STORED);

    // updated_at for dated documents; undated=1 marks documents without one
    schema_builder.add_date_field("updated_at", INDEXED | STORED | FAST);
    schema_builder.add_i64_field("undated", INDEXED | STORED);

    schema_builder.build()
}

/// Keyword (BM25) half of the dual store, built on a Tantivy index
/// with one document per chunk.
pub struct KeywordIndex {
    index: Index,
    schema: Schema,
    writer: Arc<RwLock<IndexWriter>>,
    reader: IndexReader,
}

impl KeywordIndex {
    pub fn new(config: &IndexConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.keyword_path)?;

        let schema = build_chunk_schema();
        let index = if Self::index_exists(&config.keyword_path) {
            Index::open_in_dir(&config.keyword_path)?
        } else {
            Index::create_in_dir(&config.keyword_path, schema.clone())?
        };

        let writer = index.writer(config.writer_heap_bytes)?;
        let reader = index
            .reader_builder()
            .reload_policy(if config.realtime_commit {
                ReloadPolicy::OnCommitWithDelay
            } else {
                ReloadPolicy::Manual
            })
            .try_into()?;

        Ok(Self {
            index,
            schema,
            writer: Arc::new(RwLock::new(writer)),
            reader,
        })
    }

    fn index_exists(path: &Path) -> bool {
        path.join("meta.json").exists()
    }

    fn field(&self, name: &str) -> Result<tantivy::schema::Field> {
        self.schema
            .get_field(name)
            .map_err(|_| AppError::Index(format!("Schema field missing: {}", name)))
    }

    fn chunk_to_doc(
        &self,
        chunk: &IndexChunk,
        meta: &DocumentIndexingMetadata,
    ) -> Result<TantivyDocument> {
        let mut doc = TantivyDocument::new();

        doc.add_text(self.field("id")?, chunk.chunk_ref());
        doc.add_text(self.field("doc_id")?, &chunk.document_id);
        doc.add_i64(self.field("ordinal")?, chunk.chunk_ordinal as i64);
        doc.add_text(self.field("content")?, &chunk.content);
        doc.add_text(self.field("title")?, &chunk.title);
        for link in &chunk.source_links {
            doc.add_text(self.field("source_link")?, link);
        }

        let acl = self.field("acl")?;
        for token in &meta.acl_tokens {
            doc.add_text(acl, token);
        }
        let sets = self.field("document_set")?;
        for name in &meta.document_sets {
            doc.add_text(sets, name);
        }
        let tags = self.field("tag")?;
        for tag in &meta.tags {
            doc.add_text(tags, tag);
        }
        doc.add_text(self.field("source")?, meta.source.to_string());
        if let Some(ref tenant) = meta.tenant_id {
            doc.add_text(self.field("tenant")?, tenant);
        }
        doc.add_i64(self.field("boost")?, meta.boost as i64);
        doc.add_i64(self.field("hidden")?, meta.hidden as i64);

        match meta.updated_at {
            Some(ts) => {
                doc.add_date(
                    self.field("updated_at")?,
                    tantivy::DateTime::from_timestamp_secs(ts.timestamp()),
                );
                doc.add_i64(self.field("undated")?, 0);
            }
            None => {
                doc.add_date(
                    self.field("updated_at")?,
                    tantivy::DateTime::from_timestamp_secs(0),
                );
                doc.add_i64(self.field("undated")?, 1);
            }
        }

        Ok(doc)
    }

    /// Upsert a batch of chunks; returns the document ids accepted.
    pub async fn index_chunks(
        &self,
        chunks: &[IndexChunk],
        metadata: &HashMap<String, DocumentIndexingMetadata>,
    ) -> Result<HashSet<String>> {
        let id_field = self.field("id")?;
        let mut accepted = HashSet::new();

        let mut writer = self.writer.write().await;
        for chunk in chunks {
            let meta = metadata.get(&chunk.document_id).ok_or_else(|| {
                AppError::Validation(format!(
                    "No indexing metadata for document {}",
                    chunk.document_id
                ))
            })?;

            // Replace any previous revision of the same chunk
            writer.delete_term(Term::from_field_text(id_field, &chunk.chunk_ref()));
            writer.add_document(self.chunk_to_doc(chunk, meta)?)?;
            accepted.insert(chunk.document_id.clone());
        }
        writer.commit()?;

        Ok(accepted)
    }

    /// Rewrite the filterable metadata for whole documents without
    /// re-embedding: re-read each chunk's stored fields, patch, re-add.
    pub async fn update(&self, requests: &[UpdateRequest]) -> Result<()> {
        let doc_id_field = self.field("doc_id")?;
        let id_field = self.field("id")?;

        self.reader.reload()?;
        let searcher = self.reader.searcher();

        let mut writer = self.writer.write().await;
        for request in requests {
            let query = TermQuery::new(
                Term::from_field_text(doc_id_field, &request.document_id),
                tantivy::schema::IndexRecordOption::Basic,
            );
            let top_docs =
                searcher.search(&query, &TopDocs::with_limit(MAX_CHUNKS_PER_DOCUMENT))?;

            for (_score, addr) in top_docs {
                let stored: TantivyDocument = searcher.doc(addr)?;
                let patched = self.patch_stored_doc(&stored, request)?;

                let chunk_ref = stored
                    .get_first(id_field)
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| AppError::Index("Stored chunk missing id".to_string()))?
                    .to_string();
                writer.delete_term(Term::from_field_text(id_field, &chunk_ref));
                writer.add_document(patched)?;
            }
        }
        writer.commit()?;

        Ok(())
    }

    fn patch_stored_doc(
        &self,
        stored: &TantivyDocument,
        request: &UpdateRequest,
    ) -> Result<TantivyDocument> {
        let mut doc = TantivyDocument::new();

        // Copy-through text fields
        for name in [
            "id",
            "doc_id",
            "content",
            "title",
            "source_link",
            "tag",
            "source",
            "tenant",
        ] {
            let field = self.field(name)?;
            for value in stored.get_all(field) {
                if let Some(s) = value.as_str() {
                    doc.add_text(field, s);
                }
            }
        }
        for name in ["ordinal", "undated"] {
            let field = self.field(name)?;
            if let Some(v) = stored.get_first(field).and_then(|v| v.as_i64()) {
                doc.add_i64(field, v);
            }
        }
        let updated_field = self.field("updated_at")?;
        if let Some(dt) = stored.get_first(updated_field).and_then(|v| v.as_datetime()) {
            doc.add_date(updated_field, dt);
        }

        // Patched fields, falling back to the stored values
        let acl_field = self.field("acl")?;
        match request.acl_tokens {
            Some(ref tokens) => {
                for token in tokens {
                    doc.add_text(acl_field, token);
                }
            }
            None => {
                for value in stored.get_all(acl_field) {
                    if let Some(s) = value.as_str() {
                        doc.add_text(acl_field, s);
                    }
                }
            }
        }

        let sets_field = self.field("document_set")?;
        match request.document_sets {
            Some(ref sets) => {
                for name in sets {
                    doc.add_text(sets_field, name);
                }
            }
            None => {
                for value in stored.get_all(sets_field) {
                    if let Some(s) = value.as_str() {
                        doc.add_text(sets_field, s);
                    }
                }
            }
        }

        let boost_field = self.field("boost")?;
        let boost = match request.boost {
            Some(b) => b as i64,
            None => stored
                .get_first(boost_field)
                .and_then(|v| v.as_i64())
                .unwrap_or(0),
        };
        doc.add_i64(boost_field, boost);

        let hidden_field = self.field("hidden")?;
        let hidden = match request.hidden {
            Some(h) => h as i64,
            None => stored
                .get_first(hidden_field)
                .and_then(|v| v.as_i64())
                .unwrap_or(0),
        };
        doc.add_i64(hidden_field, hidden);

        Ok(doc)
    }

    /// Remove every chunk of the given documents.
    pub async fn delete(&self, document_ids: &[String]) -> Result<()> {
        let doc_id_field = self.field("doc_id")?;

        let mut writer = self.writer.write().await;
        for document_id in document_ids {
            writer.delete_term(Term::from_field_text(doc_id_field, document_id));
        }
        writer.commit()?;

        Ok(())
    }

    /// BM25 retrieval over content and title under the given filters.
    pub async fn search(
        &self,
        query_text: &str,
        filters: &IndexFilters,
        limit: usize,
    ) -> Result<Vec<RetrievedChunk>> {
        let compiled = self.compile_query(query_text, filters)?;

        self.reader.reload()?;
        let searcher = self.reader.searcher();
        let top_docs = searcher.search(&*compiled, &TopDocs::with_limit(limit))?;

        let doc_id_field = self.field("doc_id")?;
        let ordinal_field = self.field("ordinal")?;
        let content_field = self.field("content")?;
        let title_field = self.field("title")?;
        let link_field = self.field("source_link")?;
        let boost_field = self.field("boost")?;

        let mut hits = Vec::with_capacity(top_docs.len());
        for (score, addr) in top_docs {
            let doc: TantivyDocument = searcher.doc(addr)?;

            let boost = doc
                .get_first(boost_field)
                .and_then(|v| v.as_i64())
                .unwrap_or(0) as i32;

            hits.push(RetrievedChunk {
                document_id: doc
                    .get_first(doc_id_field)
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string(),
                chunk_ordinal: doc
                    .get_first(ordinal_field)
                    .and_then(|v| v.as_i64())
                    .unwrap_or(0) as usize,
                content: doc
                    .get_first(content_field)
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string(),
                title: doc
                    .get_first(title_field)
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string(),
                source_links: doc
                    .get_all(link_field)
                    .filter_map(|v| v.as_str())
                    .map(|s| s.to_string())
                    .collect(),
                score: score * boost_multiplier(boost),
            });
        }

        // Boost adjustment can reorder relative to raw BM25
        hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        Ok(hits)
    }

    fn compile_query(&self, query_text: &str, filters: &IndexFilters) -> Result<Box<dyn Query>> {
        let mut subqueries: Vec<(Occur, Box<dyn Query>)> = Vec::new();

        if !query_text.is_empty() {
            let text_fields = vec![self.field("content")?, self.field("title")?];
            let parser = QueryParser::for_index(&self.index, text_fields);
            let parsed = parser
                .parse_query(query_text)
                .map_err(|e| AppError::Index(format!("Query parse failed: {}", e)))?;
            subqueries.push((Occur::Must, parsed));
        }

        // Hidden documents never come back
        subqueries.push((
            Occur::Must,
            Box::new(TermQuery::new(
                Term::from_field_i64(self.field("hidden")?, 0),
                tantivy::schema::IndexRecordOption::Basic,
            )),
        ));

        // ACL: the chunk must carry at least one of the caller's tokens
        if let Some(ref tokens) = filters.access_tokens {
            let acl_field = self.field("acl")?;
            let token_queries: Vec<Box<dyn Query>> = tokens
                .iter()
                .map(|token| {
                    Box::new(TermQuery::new(
                        Term::from_field_text(acl_field, token),
                        tantivy::schema::IndexRecordOption::Basic,
                    )) as Box<dyn Query>
                })
                .collect();
            if token_queries.is_empty() {
                // No tokens at all matches nothing
                subqueries.push((
                    Occur::Must,
                    Box::new(BooleanQuery::from(Vec::<(Occur, Box<dyn Query>)>::new())),
                ));
            } else {
                subqueries.push((Occur::Must, Box::new(DisjunctionMaxQuery::new(token_queries))));
            }
        }

        if !filters.sources.is_empty() {
            let source_field = self.field("source")?;
            let source_queries: Vec<Box<dyn Query>> = filters
                .sources
                .iter()
                .map(|source| {
                    Box::new(TermQuery::new(
                        Term::from_field_text(source_field, &source.to_string()),
                        tantivy::schema::IndexRecordOption::Basic,
                    )) as Box<dyn Query>
                })
                .collect();
            subqueries.push((Occur::Must, Box::new(DisjunctionMaxQuery::new(source_queries))));
        }

        if !filters.tags.is_empty() {
            let tag_field = self.field("tag")?;
            let tag_queries: Vec<Box<dyn Query>> = filters
                .tags
                .iter()
                .map(|tag| {
                    Box::new(TermQuery::new(
                        Term::from_field_text(tag_field, tag),
                        tantivy::schema::IndexRecordOption::Basic,
                    )) as Box<dyn Query>
                })
                .collect();
            subqueries.push((Occur::Must, Box::new(DisjunctionMaxQuery::new(tag_queries))));
        }

        if !filters.document_sets.is_empty() {
            let sets_field = self.field("document_set")?;
            let set_queries: Vec<Box<dyn Query>> = filters
                .document_sets
                .iter()
                .map(|name| {
                    Box::new(TermQuery::new(
                        Term::from_field_text(sets_field, name),
                        tantivy::schema::IndexRecordOption::Basic,
                    )) as Box<dyn Query>
                })
                .collect();
            subqueries.push((Occur::Must, Box::new(DisjunctionMaxQuery::new(set_queries))));
        }

        if let Some(ref tenant) = filters.tenant_id {
            subqueries.push((
                Occur::Must,
                Box::new(TermQuery::new(
                    Term::from_field_text(self.field("tenant")?, tenant),
                    tantivy::schema::IndexRecordOption::Basic,
                )),
            ));
        }

        // Recency cutoff; undated documents pass inside the grace window
        if let Some(cutoff) = filters.cutoff(Utc::now()) {
            let mut recency: Vec<(Occur, Box<dyn Query>)> = Vec::new();

            let range_query = RangeQuery::new_date_bounds(
                "updated_at".to_string(),
                std::ops::Bound::Included(tantivy::DateTime::from_timestamp_secs(
                    cutoff.timestamp(),
                )),
                std::ops::Bound::Unbounded,
            );
            recency.push((Occur::Should, Box::new(range_query)));

            if filters.includes_undated() {
                recency.push((
                    Occur::Should,
                    Box::new(TermQuery::new(
                        Term::from_field_i64(self.field("undated")?, 1),
                        tantivy::schema::IndexRecordOption::Basic,
                    )),
                ));
            }

            subqueries.push((Occur::Must, Box::new(BooleanQuery::from(recency))));
        }

        if subqueries.is_empty() {
            Ok(Box::new(AllQuery))
        } else {
            Ok(Box::new(BooleanQuery::from(subqueries)))
        }
    }
}

fn boost_multiplier(boost: i32) -> f32 {
    (1.0 + 0.05 * boost as f32).max(0.1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::DocumentSource;
    use chrono::Duration;
    use tempfile::TempDir;

    fn test_config(dir: &TempDir) -> IndexConfig {
        IndexConfig {
            keyword_path: dir.path().to_path_buf(),
            writer_heap_bytes: 15_000_000,
            realtime_commit: true,
            max_retries: 3,
            retry_backoff_ms: 10,
        }
    }

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

    fn chunk(doc_id: &str, ordinal: usize, content: &str) -> IndexChunk {
        IndexChunk {
            document_id: doc_id.to_string(),
            chunk_ordinal: ordinal,
            content: content.to_string(),
            title: "handbook".to_string(),
            content_embedding: Vec::new(),
            mini_chunk_embeddings: Vec::new(),
            title_embedding: None,
            source_links: vec![format!("https://example.com/{}", doc_id)],
            boost: 0,
            hidden: false,
        }
    }

    #[tokio::test]
    async fn test_index_and_keyword_search() {
        let dir = TempDir::new().unwrap();
        let index = KeywordIndex::new(&test_config(&dir)).unwrap();

        let mut metadata = HashMap::new();
        metadata.insert("d1".to_string(), meta(&["PUBLIC"]));
        metadata.insert("d2".to_string(), meta(&["PUBLIC"]));

        let accepted = index
            .index_chunks(
                &[
                    chunk("d1", 0, "vacation policy for engineers"),
                    chunk("d2", 0, "quarterly revenue report"),
                ],
                &metadata,
            )
            .await
            .unwrap();
        assert_eq!(accepted.len(), 2);

        let hits = index
            .search("vacation policy", &IndexFilters::default(), 10)
            .await
            .unwrap();
        assert_eq!(hits[0].document_id, "d1");
    }

    #[tokio::test]
    async fn test_acl_enforced() {
        let dir = TempDir::new().unwrap();
        let index = KeywordIndex::new(&test_config(&dir)).unwrap();

        let mut metadata = HashMap::new();
        metadata.insert("d1".to_string(), meta(&["group:eng"]));
        index
            .index_chunks(&[chunk("d1", 0, "deployment runbook")], &metadata)
            .await
            .unwrap();

        let allowed = IndexFilters::for_user_tokens(["group:eng".to_string()].into());
        let denied = IndexFilters::for_user_tokens(["group:sales".to_string()].into());

        assert_eq!(index.search("runbook", &allowed, 10).await.unwrap().len(), 1);
        assert!(index.search("runbook", &denied, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete_removes_from_results() {
        let dir = TempDir::new().unwrap();
        let index = KeywordIndex::new(&test_config(&dir)).unwrap();

        let mut metadata = HashMap::new();
        metadata.insert("d1".to_string(), meta(&["PUBLIC"]));
        index
            .index_chunks(&[chunk("d1", 0, "incident postmortem")], &metadata)
            .await
            .unwrap();

        index.delete(&["d1".to_string()]).await.unwrap();

        let hits = index
            .search("postmortem", &IndexFilters::default(), 10)
            .await
            .unwrap();
        assert!(hits.is_empty());
    }

    #[tokio::test]
    async fn test_partial_update_swaps_acl() {
        let dir = TempDir::new().unwrap();
        let index = KeywordIndex::new(&test_config(&dir)).unwrap();

        let mut metadata = HashMap::new();
        metadata.insert("d1".to_string(), meta(&["group:eng"]));
        index
            .index_chunks(&[chunk("d1", 0, "oncall rotation schedule")], &metadata)
            .await
            .unwrap();

        index
            .update(&[UpdateRequest::for_document("d1")
                .with_acl(["group:sales".to_string()].into_iter().collect())])
            .await
            .unwrap();

        let sales = IndexFilters::for_user_tokens(["group:sales".to_string()].into());
        let eng = IndexFilters::for_user_tokens(["group:eng".to_string()].into());

        assert_eq!(index.search("oncall", &sales, 10).await.unwrap().len(), 1);
        assert!(index.search("oncall", &eng, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_hidden_update_excludes_document() {
        let dir = TempDir::new().unwrap();
        let index = KeywordIndex::new(&test_config(&dir)).unwrap();

        let mut metadata = HashMap::new();
        metadata.insert("d1".to_string(), meta(&["PUBLIC"]));
        index
            .index_chunks(&[chunk("d1", 0, "legacy migration notes")], &metadata)
            .await
            .unwrap();

        index
            .update(&[UpdateRequest::for_document("d1").with_hidden(true)])
            .await
            .unwrap();

        let hits = index
            .search("migration", &IndexFilters::default(), 10)
            .await
            .unwrap();
        assert!(hits.is_empty());
    }

    #[tokio::test]
    async fn test_undated_grace_window() {
        let dir = TempDir::new().unwrap();
        let index = KeywordIndex::new(&test_config(&dir)).unwrap();

        let mut undated = meta(&["PUBLIC"]);
        undated.updated_at = None;
        let mut stale = meta(&["PUBLIC"]);
        stale.updated_at = Some(Utc::now() - Duration::days(400));

        let mut metadata = HashMap::new();
        metadata.insert("undated".to_string(), undated);
        metadata.insert("stale".to_string(), stale);
        index
            .index_chunks(
                &[
                    chunk("undated", 0, "release checklist draft"),
                    chunk("stale", 0, "release checklist final"),
                ],
                &metadata,
            )
            .await
            .unwrap();

        // Narrow window keeps undated documents, drops genuinely stale ones
        let mut narrow = IndexFilters::default();
        narrow.max_age_days = Some(10);
        let hits = index.search("checklist", &narrow, 10).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].document_id, "undated");

        // A window past the grace period is a request for old documents only
        let mut wide = IndexFilters::default();
        wide.max_age_days = Some(200);
        let hits = index.search("checklist", &wide, 10).await.unwrap();
        assert!(hits.is_empty());
    }
}
