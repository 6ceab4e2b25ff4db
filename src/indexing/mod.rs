pub mod chunker;
pub mod embedder;
pub mod pipeline;

pub use chunker::{Chunker, ContextualSummarizer, RawChunk};
pub use embedder::{
    create_embedding_client, Embedder, EmbeddingClient, HttpEmbeddingClient, LocalEmbeddingClient,
};
pub use pipeline::{IndexingPipeline, IndexingStats};
