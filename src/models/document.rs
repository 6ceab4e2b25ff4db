use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use strum::{Display, EnumString};
use validator::Validate;

/// A single contiguous span of a source document, with an optional deep link
/// back to the place it came from.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Section {
    pub text: String,
    pub link: Option<String>,
}

impl Section {
    pub fn new(text: impl Into<String>, link: Option<String>) -> Self {
        Self {
            text: text.into(),
            link,
        }
    }
}

/// Where a document was pulled from
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, EnumString, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum DocumentSource {
    Web,
    Slack,
    GoogleDrive,
    Github,
    Confluence,
    Jira,
    File,
    /// Synthetic source for direct API ingestion
    Ingestion,
}

/// A document as emitted by a connector.
///
/// Mutated on re-index or ACL change; destroyed when its connector-credential
/// pair is deleted or the connector prunes it.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct Document {
    /// Source-assigned identifier, unique within the deployment
    #[validate(length(min = 1, max = 512))]
    pub id: String,

    /// Ordered content sections
    pub sections: Vec<Section>,

    /// Source system
    pub source: DocumentSource,

    /// Human-meaningful identifier (title, path, channel name)
    #[validate(length(min = 1, max = 1024))]
    pub semantic_identifier: String,

    /// Free-form metadata attached by the connector
    #[serde(default)]
    pub metadata: HashMap<String, String>,

    /// Owner emails as reported by the source
    #[serde(default)]
    pub owners: Vec<String>,

    /// Source-side last-modified time; `None` for sources that do not track it
    pub updated_at: Option<DateTime<Utc>>,
}

impl Document {
    pub fn new(
        id: impl Into<String>,
        source: DocumentSource,
        semantic_identifier: impl Into<String>,
        sections: Vec<Section>,
    ) -> Self {
        Self {
            id: id.into(),
            sections,
            source,
            semantic_identifier: semantic_identifier.into(),
            metadata: HashMap::new(),
            owners: Vec::new(),
            updated_at: None,
        }
    }

    pub fn with_updated_at(mut self, updated_at: DateTime<Utc>) -> Self {
        self.updated_at = Some(updated_at);
        self
    }

    pub fn with_owners(mut self, owners: Vec<String>) -> Self {
        self.owners = owners;
        self
    }

    /// Concatenated section text, used by the chunker
    pub fn full_text(&self) -> String {
        self.sections
            .iter()
            .map(|s| s.text.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// A derived, rebuildable unit of the search index.
///
/// One tantivy document and one vector record per chunk; everything here can
/// be regenerated from the owning [`Document`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexChunk {
    /// Owning document id
    pub document_id: String,

    /// Chunk ordinal within the document
    pub chunk_ordinal: usize,

    /// Chunk text as stored and searched
    pub content: String,

    /// Title of the owning document (semantic identifier)
    pub title: String,

    /// Embedding of the full chunk content
    pub content_embedding: Vec<f32>,

    /// Embeddings of sub-chunks, for finer retrieval granularity
    #[serde(default)]
    pub mini_chunk_embeddings: Vec<Vec<f32>>,

    /// Embedding of the title; shared across chunks of the same document
    pub title_embedding: Option<Vec<f32>>,

    /// Deep links of the sections this chunk was cut from
    #[serde(default)]
    pub source_links: Vec<String>,

    /// Score multiplier applied at retrieval time
    pub boost: i32,

    /// Hidden chunks are never returned by retrieval
    pub hidden: bool,
}

impl IndexChunk {
    /// Stable identifier for this chunk across re-index runs.
    ///
    /// Derived from the document id and ordinal so an upsert of the same
    /// chunk replaces rather than duplicates.
    pub fn chunk_ref(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.document_id.as_bytes());
        hasher.update([0u8]);
        hasher.update(self.chunk_ordinal.to_be_bytes());
        let digest = hasher.finalize();
        format!("{:x}", digest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(doc_id: &str, ordinal: usize) -> IndexChunk {
        IndexChunk {
            document_id: doc_id.to_string(),
            chunk_ordinal: ordinal,
            content: "body".to_string(),
            title: "title".to_string(),
            content_embedding: vec![0.0; 4],
            mini_chunk_embeddings: Vec::new(),
            title_embedding: None,
            source_links: Vec::new(),
            boost: 0,
            hidden: false,
        }
    }

    #[test]
    fn test_full_text_joins_sections() {
        let doc = Document::new(
            "doc-1",
            DocumentSource::Web,
            "Handbook",
            vec![
                Section::new("first", Some("https://x/1".to_string())),
                Section::new("second", None),
            ],
        );
        assert_eq!(doc.full_text(), "first\nsecond");
    }

    #[test]
    fn test_chunk_ref_stable_and_distinct() {
        assert_eq!(chunk("a", 0).chunk_ref(), chunk("a", 0).chunk_ref());
        assert_ne!(chunk("a", 0).chunk_ref(), chunk("a", 1).chunk_ref());
        assert_ne!(chunk("a", 0).chunk_ref(), chunk("b", 0).chunk_ref());
    }

    #[test]
    fn test_source_display() {
        assert_eq!(DocumentSource::GoogleDrive.to_string(), "google_drive");
    }
}
