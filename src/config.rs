use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Metadata store configuration
    pub metadata: MetadataConfig,

    /// Redis coordination configuration
    pub coordination: CoordinationConfig,

    /// Document index configuration
    pub index: IndexConfig,

    /// Embedding model configuration
    pub embedding: EmbeddingConfig,

    /// Chunking configuration
    pub chunking: ChunkingConfig,

    /// Indexing pipeline configuration
    pub pipeline: PipelineConfig,

    /// Scheduler configuration
    pub scheduler: SchedulerConfig,

    /// Worker pool configuration
    pub worker: WorkerConfig,

    /// Observability configuration
    pub observability: ObservabilityConfig,
}

impl Config {
    /// Load configuration from file and environment
    pub fn load() -> Result<Self, config::ConfigError> {
        let config_path =
            std::env::var("CONFIG_PATH").unwrap_or_else(|_| "config/default.toml".to_string());

        config::Config::builder()
            // Start with default values
            .add_source(config::File::from_str(
                include_str!("../config/default.toml"),
                config::FileFormat::Toml,
            ))
            // Override with config file if it exists
            .add_source(config::File::with_name(&config_path).required(false))
            // Override with environment variables (prefix: DOCSYNC_)
            .add_source(
                config::Environment::with_prefix("DOCSYNC")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetadataConfig {
    /// Metadata store backend
    #[serde(default)]
    pub backend: MetadataBackend,

    /// Path for the embedded database (sled)
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum MetadataBackend {
    #[default]
    InMemory,
    Sled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinationConfig {
    /// Coordination backend
    #[serde(default)]
    pub backend: CoordinationBackendKind,

    /// Redis connection string
    pub redis_url: Option<String>,

    /// Tenants served by this worker; one backend handle per tenant
    #[serde(default = "default_tenants")]
    pub tenants: Vec<String>,

    /// Singleton scheduler lock TTL (seconds); the lock is refreshed at a
    /// quarter of this interval so a long cursor scan is not lost mid-pass
    #[serde(default = "default_lock_ttl")]
    pub lock_ttl_secs: u64,

    /// A fence whose taskset has not drained after this long is cleared so
    /// the next orchestration pass regenerates and re-dispatches its tasks
    #[serde(default = "default_stale_fence_timeout")]
    pub stale_fence_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum CoordinationBackendKind {
    #[default]
    InMemory,
    Redis,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexConfig {
    /// Directory for the tantivy keyword index
    #[serde(default = "default_keyword_path")]
    pub keyword_path: PathBuf,

    /// Writer heap size in bytes
    #[serde(default = "default_writer_heap")]
    pub writer_heap_bytes: usize,

    /// Commit after every write batch
    #[serde(default = "default_true")]
    pub realtime_commit: bool,

    /// Bounded retry attempts for transient store errors
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Backoff between retries (milliseconds)
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    /// Embedding provider strategy, selected once at process start
    #[serde(default)]
    pub provider: EmbeddingProvider,

    /// Model server endpoint (http provider)
    pub endpoint: Option<String>,

    /// Model name
    #[serde(default = "default_model")]
    pub model: String,

    /// Embedding dimension
    #[serde(default = "default_dimension")]
    pub dimension: usize,

    /// Texts per embedding request
    #[serde(default = "default_embed_batch")]
    pub batch_size: usize,

    /// Prefix prepended to query-side text
    #[serde(default)]
    pub query_prefix: String,

    /// Prefix prepended to passage-side text
    #[serde(default)]
    pub passage_prefix: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum EmbeddingProvider {
    #[default]
    Local,
    Http,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkingConfig {
    /// Hard upper bound on tokens per chunk
    #[serde(default = "default_chunk_tokens")]
    pub chunk_token_limit: usize,

    /// Sliding token overlap between adjacent chunks
    #[serde(default = "default_chunk_overlap")]
    pub chunk_overlap: usize,

    /// Generate sub-chunks for finer retrieval granularity
    #[serde(default = "default_true")]
    pub enable_mini_chunks: bool,

    /// Mini-chunk budget = chunk_token_limit / divisor
    #[serde(default = "default_mini_divisor")]
    pub mini_chunk_divisor: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Documents per indexing batch
    #[serde(default = "default_index_batch")]
    pub index_batch_size: usize,

    /// Drop a document whose embedding fails instead of failing the batch
    #[serde(default)]
    pub continue_on_failure: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Master enable switch
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Cron schedules (6-field, seconds resolution)
    #[serde(default = "default_fast_schedule")]
    pub document_set_sync_schedule: String,

    #[serde(default = "default_fast_schedule")]
    pub group_sync_schedule: String,

    #[serde(default = "default_slow_schedule")]
    pub permission_sync_schedule: String,

    #[serde(default = "default_slow_schedule")]
    pub connector_lifecycle_schedule: String,

    #[serde(default = "default_monitor_schedule")]
    pub monitor_schedule: String,

    #[serde(default = "default_settings_schedule")]
    pub settings_check_schedule: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Bound on concurrently executing sync tasks
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_tasks: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Enable JSON logging
    #[serde(default)]
    pub json_logs: bool,

    /// Enable Prometheus metrics
    #[serde(default = "default_true")]
    pub prometheus_enabled: bool,
}

// Default value functions
fn default_tenants() -> Vec<String> {
    vec!["default".to_string()]
}

fn default_lock_ttl() -> u64 {
    120
}

fn default_stale_fence_timeout() -> u64 {
    3600
}

fn default_keyword_path() -> PathBuf {
    PathBuf::from("/tmp/docsync-index")
}

fn default_writer_heap() -> usize {
    50_000_000
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_backoff_ms() -> u64 {
    250
}

fn default_model() -> String {
    "nomic-embed-text".to_string()
}

fn default_dimension() -> usize {
    384
}

fn default_embed_batch() -> usize {
    8
}

fn default_chunk_tokens() -> usize {
    512
}

fn default_chunk_overlap() -> usize {
    32
}

fn default_mini_divisor() -> usize {
    4
}

fn default_index_batch() -> usize {
    16
}

fn default_fast_schedule() -> String {
    "1/20 * * * * *".to_string()
}

fn default_slow_schedule() -> String {
    "1/30 * * * * *".to_string()
}

fn default_monitor_schedule() -> String {
    "1/15 * * * * *".to_string()
}

fn default_settings_schedule() -> String {
    "0 * * * * *".to_string()
}

fn default_max_concurrent() -> usize {
    16
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_values() {
        assert_eq!(default_dimension(), 384);
        assert_eq!(default_chunk_tokens(), 512);
        assert_eq!(default_lock_ttl(), 120);
        assert!(default_true());
    }

    #[test]
    fn test_backend_defaults() {
        assert_eq!(MetadataBackend::default(), MetadataBackend::InMemory);
        assert_eq!(
            CoordinationBackendKind::default(),
            CoordinationBackendKind::InMemory
        );
        assert_eq!(EmbeddingProvider::default(), EmbeddingProvider::Local);
    }

    #[test]
    fn test_embedded_defaults_parse() {
        let cfg: Config = config::Config::builder()
            .add_source(config::File::from_str(
                include_str!("../config/default.toml"),
                config::FileFormat::Toml,
            ))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();

        assert_eq!(cfg.embedding.provider, EmbeddingProvider::Local);
        assert_eq!(cfg.chunking.chunk_token_limit, 512);
        assert!(cfg.scheduler.enabled);
    }
}
