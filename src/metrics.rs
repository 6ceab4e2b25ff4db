//! Prometheus metrics for the sync engine.
//!
//! All metrics live in a dedicated registry so `gather_metrics` exports only
//! what this process owns.

use lazy_static::lazy_static;
use prometheus::{CounterVec, Gauge, HistogramOpts, HistogramVec, IntCounter, Opts, Registry};

lazy_static! {
    /// Registry for all sync-engine metrics
    pub static ref PROMETHEUS_REGISTRY: Registry = Registry::new();

    /// Sync tasks dispatched to the worker pool
    ///
    /// Labels: scope
    pub static ref SYNC_TASKS_DISPATCHED_TOTAL: CounterVec = CounterVec::new(
        Opts::new("sync_tasks_dispatched_total", "Sync tasks dispatched to workers")
            .namespace("docsync"),
        &["scope"]
    ).expect("Failed to create SYNC_TASKS_DISPATCHED_TOTAL metric");

    /// Sync tasks completed by workers
    ///
    /// Labels: scope, outcome (succeeded | failed)
    pub static ref SYNC_TASKS_COMPLETED_TOTAL: CounterVec = CounterVec::new(
        Opts::new("sync_tasks_completed_total", "Sync tasks completed by workers")
            .namespace("docsync"),
        &["scope", "outcome"]
    ).expect("Failed to create SYNC_TASKS_COMPLETED_TOTAL metric");

    /// Fences finalized by the monitor
    ///
    /// Labels: scope
    pub static ref SYNC_FINALIZATIONS_TOTAL: CounterVec = CounterVec::new(
        Opts::new("sync_finalizations_total", "Fences finalized by the sync monitor")
            .namespace("docsync"),
        &["scope"]
    ).expect("Failed to create SYNC_FINALIZATIONS_TOTAL metric");

    /// Fences cleared after their taskset stalled past the stale timeout
    ///
    /// Labels: scope
    pub static ref SYNC_STALE_FENCES_CLEARED_TOTAL: CounterVec = CounterVec::new(
        Opts::new("sync_stale_fences_cleared_total", "Stalled fences cleared for re-orchestration")
            .namespace("docsync"),
        &["scope"]
    ).expect("Failed to create SYNC_STALE_FENCES_CLEARED_TOTAL metric");

    /// Documents for which the two index stores disagreed on acceptance
    pub static ref INDEX_DIVERGENCES_TOTAL: IntCounter = IntCounter::with_opts(
        Opts::new("index_divergences_total", "Documents accepted by only one index store")
            .namespace("docsync"),
    ).expect("Failed to create INDEX_DIVERGENCES_TOTAL metric");

    /// Documents indexed through the pipeline
    ///
    /// Labels: source
    pub static ref DOCUMENTS_INDEXED_TOTAL: CounterVec = CounterVec::new(
        Opts::new("documents_indexed_total", "Documents written to the dual index")
            .namespace("docsync"),
        &["source"]
    ).expect("Failed to create DOCUMENTS_INDEXED_TOTAL metric");

    /// Documents that failed during indexing
    ///
    /// Labels: source
    pub static ref DOCUMENTS_FAILED_TOTAL: CounterVec = CounterVec::new(
        Opts::new("documents_failed_total", "Documents dropped by the indexing pipeline")
            .namespace("docsync"),
        &["source"]
    ).expect("Failed to create DOCUMENTS_FAILED_TOTAL metric");

    /// Embedding request latency in seconds
    ///
    /// Labels: provider
    pub static ref EMBEDDING_REQUEST_DURATION_SECONDS: HistogramVec = HistogramVec::new(
        HistogramOpts::new(
            "embedding_request_duration_seconds",
            "Embedding batch request duration in seconds"
        )
        .namespace("docsync")
        .buckets(vec![0.005, 0.025, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]),
        &["provider"]
    ).expect("Failed to create EMBEDDING_REQUEST_DURATION_SECONDS metric");

    /// Whether a search-settings reindex is currently in progress (0/1)
    pub static ref REINDEX_IN_PROGRESS: Gauge = Gauge::with_opts(
        Opts::new("reindex_in_progress", "1 while a new index generation is being built")
            .namespace("docsync")
    ).expect("Failed to create REINDEX_IN_PROGRESS metric");
}

/// Register all metrics with the registry. Call once at startup.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    PROMETHEUS_REGISTRY.register(Box::new(SYNC_TASKS_DISPATCHED_TOTAL.clone()))?;
    PROMETHEUS_REGISTRY.register(Box::new(SYNC_TASKS_COMPLETED_TOTAL.clone()))?;
    PROMETHEUS_REGISTRY.register(Box::new(SYNC_FINALIZATIONS_TOTAL.clone()))?;
    PROMETHEUS_REGISTRY.register(Box::new(SYNC_STALE_FENCES_CLEARED_TOTAL.clone()))?;
    PROMETHEUS_REGISTRY.register(Box::new(INDEX_DIVERGENCES_TOTAL.clone()))?;
    PROMETHEUS_REGISTRY.register(Box::new(DOCUMENTS_INDEXED_TOTAL.clone()))?;
    PROMETHEUS_REGISTRY.register(Box::new(DOCUMENTS_FAILED_TOTAL.clone()))?;
    PROMETHEUS_REGISTRY.register(Box::new(EMBEDDING_REQUEST_DURATION_SECONDS.clone()))?;
    PROMETHEUS_REGISTRY.register(Box::new(REINDEX_IN_PROGRESS.clone()))?;
    Ok(())
}

/// Export the registry in the Prometheus text format.
pub fn gather_metrics() -> Result<String, prometheus::Error> {
    use prometheus::Encoder;

    let encoder = prometheus::TextEncoder::new();
    let metric_families = PROMETHEUS_REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer).unwrap_or_default())
}
