//! Prometheus metrics for the chunk store.
//!
//! Every crate records into these statics; binaries call
//! [`register_metrics`] once and render with [`gather_text`].

use prometheus::{
    self, Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts, Registry,
    TextEncoder,
};
use std::sync::{LazyLock, Once};

/// Global Prometheus registry for all metrics.
pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

// Cache metrics
pub static CACHE_OPERATIONS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "folio_chunk_cache_operations_total",
            "Chunk cache operations by operation and status",
        ),
        &["operation", "status"],
    )
    .expect("metric creation failed")
});

pub static CACHE_VALIDITY_CHECKS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "folio_chunk_cache_validity_total",
            "Cache validity checks by result (valid, invalid, miss)",
        ),
        &["result"],
    )
    .expect("metric creation failed")
});

pub static CACHE_DIVERGENCES: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "folio_chunk_cache_divergences_total",
        "Cached chunks that differed from durable storage",
    )
    .expect("metric creation failed")
});

// Chunk store metrics
pub static CHUNK_OPERATIONS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "folio_chunk_store_operations_total",
            "Chunk store write operations by operation, backend and status",
        ),
        &["operation", "backend", "status"],
    )
    .expect("metric creation failed")
});

pub static CHUNK_LOAD_DURATION: LazyLock<HistogramVec> = LazyLock::new(|| {
    HistogramVec::new(
        HistogramOpts::new(
            "folio_chunk_load_duration_seconds",
            "Time taken to load a chunk, by source (cache, storage)",
        )
        .buckets(vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5]),
        &["source"],
    )
    .expect("metric creation failed")
});

pub static VERSION_CONFLICTS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "folio_chunk_version_conflicts_total",
            "Chunk creations or updates rejected by a version conflict",
        ),
        &["backend"],
    )
    .expect("metric creation failed")
});

pub static BACKEND_ERRORS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "folio_chunk_backend_errors_total",
            "Metadata backend errors by backend and operation",
        ),
        &["backend", "operation"],
    )
    .expect("metric creation failed")
});

// GC metrics
pub static GC_CHUNKS_DELETED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "folio_gc_chunks_deleted_total",
        "Old chunks physically deleted by garbage collection",
    )
    .expect("metric creation failed")
});

pub static GC_BATCHES: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new("folio_gc_batches_total", "GC batches by backend and status"),
        &["backend", "status"],
    )
    .expect("metric creation failed")
});

static REGISTER_ONCE: Once = Once::new();

/// Register all metrics with the global registry. Safe to call repeatedly.
pub fn register_metrics() {
    REGISTER_ONCE.call_once(|| {
        REGISTRY
            .register(Box::new(CACHE_OPERATIONS.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(CACHE_VALIDITY_CHECKS.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(CACHE_DIVERGENCES.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(CHUNK_OPERATIONS.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(CHUNK_LOAD_DURATION.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(VERSION_CONFLICTS.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(BACKEND_ERRORS.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(GC_CHUNKS_DELETED.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(GC_BATCHES.clone()))
            .expect("metric registration failed");
    });
}

/// Render all registered metrics in the Prometheus text format.
pub fn gather_text() -> String {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&REGISTRY.gather(), &mut buffer) {
        tracing::error!(error = %e, "failed to encode metrics");
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}
