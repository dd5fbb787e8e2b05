//! Prometheus metrics for the worker harness.
//!
//! Conditionally compiled behind the `metrics` feature. Gauges are updated
//! opportunistically by the dispatch and commit loops; scraping is the
//! embedder's concern.
#![cfg(feature = "metrics")]

use prometheus::{IntGauge, IntGaugeVec, Opts, Registry};
use std::sync::LazyLock;

use crate::pool::BoundedWorkPool;

/// Global Prometheus registry for harness metrics.
pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

/// Live worker tasks in the execution pool.
pub static POOL_WORKERS: LazyLock<IntGauge> = LazyLock::new(|| {
    IntGauge::new("millrace_pool_workers", "Live worker tasks in the pool")
        .expect("millrace_pool_workers metric creation failed")
});

/// Workers currently running a work item.
pub static POOL_ACTIVE: LazyLock<IntGauge> = LazyLock::new(|| {
    IntGauge::new(
        "millrace_pool_active",
        "Workers currently running a work item",
    )
    .expect("millrace_pool_active metric creation failed")
});

/// Depth of the bounded admission queue.
pub static POOL_QUEUE_DEPTH: LazyLock<IntGauge> = LazyLock::new(|| {
    IntGauge::new(
        "millrace_pool_queue_depth",
        "Depth of the bounded admission queue",
    )
    .expect("millrace_pool_queue_depth metric creation failed")
});

/// Commits awaiting aggregation, per computation.
pub static COMMIT_QUEUE_DEPTH: LazyLock<IntGaugeVec> = LazyLock::new(|| {
    let opts = Opts::new(
        "millrace_commit_queue_depth",
        "Commits awaiting aggregation per computation",
    );
    IntGaugeVec::new(opts, &["computation"])
        .expect("millrace_commit_queue_depth metric creation failed")
});

/// Register all harness metrics with [`struct@REGISTRY`]. Idempotent at the
/// process level only; a second call returns an error from prometheus.
pub fn register_all() -> prometheus::Result<()> {
    REGISTRY.register(Box::new(POOL_WORKERS.clone()))?;
    REGISTRY.register(Box::new(POOL_ACTIVE.clone()))?;
    REGISTRY.register(Box::new(POOL_QUEUE_DEPTH.clone()))?;
    REGISTRY.register(Box::new(COMMIT_QUEUE_DEPTH.clone()))?;
    Ok(())
}

/// Record the pool's current occupancy.
pub fn observe_pool(pool: &BoundedWorkPool) {
    POOL_WORKERS.set(pool.worker_count() as i64);
    POOL_ACTIVE.set(pool.active_count() as i64);
    POOL_QUEUE_DEPTH.set(pool.queue_depth() as i64);
}

/// Record one computation's commit-queue depth.
pub fn set_commit_queue_depth(computation: &str, depth: usize) {
    COMMIT_QUEUE_DEPTH
        .with_label_values(&[computation])
        .set(depth as i64);
}
