//! Token-budgeted document chunking.
//!
//! Sections are split independently so each chunk keeps the link of the
//! section it came from. Token counting prefers tiktoken's `cl100k_base`
//! encoding and falls back to whitespace counting when the tokenizer cannot
//! be constructed.

use crate::config::ChunkingConfig;
use crate::error::{AppError, Result};
use crate::models::Document;
use std::sync::Arc;
use tiktoken_rs::{cl100k_base, CoreBPE};
use tracing::warn;

type TokenCounter = Arc<dyn Fn(&str) -> usize + Send + Sync>;

/// Optional strategy that prepends a short generated context to a chunk's
/// embedded text. The stored content is never touched. No implementation
/// ships by default; deployments wire their own.
pub trait ContextualSummarizer: Send + Sync {
    fn summarize(&self, document: &Document, chunk_text: &str) -> Option<String>;
}

/// A chunk of document text before embedding
#[derive(Debug, Clone, PartialEq)]
pub struct RawChunk {
    pub ordinal: usize,
    pub text: String,
    /// Finer-grained sub-spans of `text` for retrieval precision
    pub mini_texts: Vec<String>,
    pub source_link: Option<String>,
    /// Summarizer output, embedded ahead of `text` but never stored
    pub context: Option<String>,
}

impl RawChunk {
    /// The text the embedder sees: document title and any generated
    /// context ahead of the chunk body.
    pub fn embeddable_text(&self, title: &str) -> String {
        let mut parts = Vec::with_capacity(3);
        if !title.trim().is_empty() {
            parts.push(title);
        }
        if let Some(ref context) = self.context {
            parts.push(context);
        }
        parts.push(&self.text);
        parts.join("\n")
    }
}

pub struct Chunker {
    chunk_token_limit: usize,
    chunk_overlap: usize,
    enable_mini_chunks: bool,
    mini_chunk_limit: usize,
    counter: TokenCounter,
    summarizer: Option<Arc<dyn ContextualSummarizer>>,
}

impl Chunker {
    pub fn new(config: &ChunkingConfig) -> Result<Self> {
        if config.chunk_token_limit == 0 {
            return Err(AppError::Configuration(
                "chunk_token_limit must be positive".to_string(),
            ));
        }
        if config.chunk_overlap >= config.chunk_token_limit {
            return Err(AppError::Configuration(
                "chunk_overlap must be smaller than chunk_token_limit".to_string(),
            ));
        }

        let mini_chunk_limit =
            (config.chunk_token_limit / config.mini_chunk_divisor.max(1)).max(1);

        Ok(Self {
            chunk_token_limit: config.chunk_token_limit,
            chunk_overlap: config.chunk_overlap,
            enable_mini_chunks: config.enable_mini_chunks,
            mini_chunk_limit,
            counter: build_token_counter(),
            summarizer: None,
        })
    }

    pub fn with_summarizer(mut self, summarizer: Arc<dyn ContextualSummarizer>) -> Self {
        self.summarizer = Some(summarizer);
        self
    }

    /// Chunk a whole document, numbering chunks across all sections.
    pub fn chunk_document(&self, document: &Document) -> Vec<RawChunk> {
        let mut chunks = Vec::new();
        let mut ordinal = 0usize;

        for section in &document.sections {
            for text in self.split_text(&section.text, self.chunk_token_limit, self.chunk_overlap)
            {
                let mini_texts = if self.enable_mini_chunks {
                    self.split_text(&text, self.mini_chunk_limit, 0)
                } else {
                    Vec::new()
                };
                // A single mini-chunk adds nothing over the full text
                let mini_texts = if mini_texts.len() > 1 {
                    mini_texts
                } else {
                    Vec::new()
                };

                let context = self
                    .summarizer
                    .as_ref()
                    .and_then(|s| s.summarize(document, &text));

                chunks.push(RawChunk {
                    ordinal,
                    text,
                    mini_texts,
                    source_link: section.link.clone(),
                    context,
                });
                ordinal += 1;
            }
        }

        chunks
    }

    /// Greedy word accumulation under a token budget with a trailing-word
    /// overlap between adjacent chunks.
    fn split_text(&self, text: &str, token_limit: usize, overlap: usize) -> Vec<String> {
        if text.trim().is_empty() {
            return Vec::new();
        }

        let words: Vec<&str> = text.split_whitespace().collect();
        let mut chunks = Vec::new();
        let mut current: Vec<&str> = Vec::new();
        let mut current_tokens = 0usize;

        for word in &words {
            let word_tokens = (self.counter)(word).max(1);

            if current_tokens + word_tokens > token_limit && !current.is_empty() {
                chunks.push(current.join(" "));

                if overlap > 0 {
                    // Retain trailing words worth roughly `overlap` tokens
                    let mut kept: Vec<&str> = Vec::new();
                    let mut kept_tokens = 0usize;
                    for prev in current.iter().rev() {
                        let t = (self.counter)(prev).max(1);
                        if kept_tokens + t > overlap {
                            break;
                        }
                        kept_tokens += t;
                        kept.push(prev);
                    }
                    kept.reverse();
                    current = kept;
                    current_tokens = kept_tokens;
                } else {
                    current.clear();
                    current_tokens = 0;
                }
            }

            // A single over-budget word still becomes its own chunk
            if word_tokens > token_limit && current.is_empty() {
                chunks.push((*word).to_string());
                continue;
            }

            current.push(word);
            current_tokens += word_tokens;
        }

        if !current.is_empty() {
            chunks.push(current.join(" "));
        }

        chunks
    }

    pub fn count_tokens(&self, text: &str) -> usize {
        (self.counter)(text)
    }
}

fn build_token_counter() -> TokenCounter {
    match cl100k_base() {
        Ok(bpe) => {
            let bpe: Arc<CoreBPE> = Arc::new(bpe);
            Arc::new(move |text: &str| bpe.encode_with_special_tokens(text).len())
        }
        Err(e) => {
            warn!(error = %e, "Tokenizer unavailable, falling back to whitespace counting");
            Arc::new(|text: &str| text.split_whitespace().count())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DocumentSource, Section};

    fn chunker(limit: usize, overlap: usize, minis: bool) -> Chunker {
        Chunker::new(&ChunkingConfig {
            chunk_token_limit: limit,
            chunk_overlap: overlap,
            enable_mini_chunks: minis,
            mini_chunk_divisor: 4,
        })
        .unwrap()
    }

    fn doc(sections: Vec<Section>) -> Document {
        Document::new("doc-1", DocumentSource::Web, "Test Doc", sections)
    }

    #[test]
    fn test_short_section_single_chunk() {
        let c = chunker(512, 32, false);
        let d = doc(vec![Section::new("a short piece of text", None)]);

        let chunks = c.chunk_document(&d);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].ordinal, 0);
        assert_eq!(chunks[0].text, "a short piece of text");
    }

    #[test]
    fn test_long_section_splits_under_budget() {
        let c = chunker(20, 0, false);
        let text = (0..100).map(|i| format!("word{}", i)).collect::<Vec<_>>().join(" ");
        let d = doc(vec![Section::new(text, None)]);

        let chunks = c.chunk_document(&d);
        assert!(chunks.len() > 1);
        for chunk in &chunks {
            assert!(c.count_tokens(&chunk.text) <= 25); // join spacing slack
        }
    }

    #[test]
    fn test_ordinals_continue_across_sections() {
        let c = chunker(512, 32, false);
        let d = doc(vec![
            Section::new("first section", Some("https://a".to_string())),
            Section::new("second section", Some("https://b".to_string())),
        ]);

        let chunks = c.chunk_document(&d);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].ordinal, 0);
        assert_eq!(chunks[1].ordinal, 1);
        assert_eq!(chunks[0].source_link.as_deref(), Some("https://a"));
        assert_eq!(chunks[1].source_link.as_deref(), Some("https://b"));
    }

    #[test]
    fn test_empty_sections_produce_no_chunks() {
        let c = chunker(512, 32, false);
        let d = doc(vec![Section::new("   ", None), Section::new("", None)]);
        assert!(c.chunk_document(&d).is_empty());
    }

    #[test]
    fn test_overlap_repeats_trailing_words() {
        let c = chunker(10, 4, false);
        let text = (0..40).map(|i| format!("w{}", i)).collect::<Vec<_>>().join(" ");
        let d = doc(vec![Section::new(text, None)]);

        let chunks = c.chunk_document(&d);
        assert!(chunks.len() > 1);
        // The start of chunk 1 must repeat the tail of chunk 0
        let tail: Vec<&str> = chunks[0].text.split_whitespace().rev().take(1).collect();
        assert!(chunks[1].text.split_whitespace().any(|w| w == tail[0]));
    }

    #[test]
    fn test_mini_chunks_generated_for_long_chunks() {
        let c = chunker(40, 0, true);
        let text = (0..35).map(|i| format!("word{}", i)).collect::<Vec<_>>().join(" ");
        let d = doc(vec![Section::new(text, None)]);

        let chunks = c.chunk_document(&d);
        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].mini_texts.len() > 1);
    }

    #[test]
    fn test_embeddable_text_prepends_title_and_context() {
        struct FixedSummarizer;
        impl ContextualSummarizer for FixedSummarizer {
            fn summarize(&self, _document: &Document, _chunk_text: &str) -> Option<String> {
                Some("about testing".to_string())
            }
        }

        let c = chunker(512, 32, false).with_summarizer(Arc::new(FixedSummarizer));
        let d = doc(vec![Section::new("body text", None)]);

        let chunks = c.chunk_document(&d);
        assert_eq!(chunks[0].text, "body text");
        assert_eq!(
            chunks[0].embeddable_text("Test Doc"),
            "Test Doc\nabout testing\nbody text"
        );
        // Stored content is untouched by the summarizer
        assert_eq!(chunks[0].embeddable_text(""), "about testing\nbody text");
    }

    #[test]
    fn test_invalid_overlap_rejected() {
        let result = Chunker::new(&ChunkingConfig {
            chunk_token_limit: 10,
            chunk_overlap: 10,
            enable_mini_chunks: false,
            mini_chunk_divisor: 4,
        });
        assert!(result.is_err());
    }
}
