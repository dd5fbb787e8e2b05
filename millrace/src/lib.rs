//! Millrace - a streaming compute worker harness.
//!
//! A millrace worker is the execution endpoint of a distributed
//! stream-processing system: it leases keyed work items from a remote
//! coordination service, runs each item through a per-computation pipeline
//! executor, and commits the resulting state mutations and output messages
//! back in batches. Many workers run side by side; the service shards keys
//! across them and owns all durability.
//!
//! # Core Concepts
//!
//! - **Computation**: one logical stage of a streaming pipeline, identified
//!   by a stable id and configured by an opaque [`ComputationDescriptor`].
//!
//! - **Work item**: one leased unit of execution addressed by
//!   `(key, work_token)`. A token identifies a single lease attempt; the
//!   service acknowledges a commit for it at most once.
//!
//! - **Executor**: the user-pipeline engine behind the [`PipelineExecutor`]
//!   seam. Executors are expensive, restartable, and cached per computation
//!   in a LIFO free-list.
//!
//! - **Harness**: the [`StreamingWorkerHarness`] ties together the dispatch
//!   loop, the bounded execution pool, and the commit aggregator.
//!
//! # Back-pressure
//!
//! The worker degrades by shedding new work, never by queueing without
//! bound: a memory gate upstream of leasing pauses intake near the memory
//! ceiling, and the pool's bounded admission queue makes the dispatch loop
//! drop leases the pool cannot absorb (the service re-leases them on token
//! expiry). Only failure retries bypass the bound, through
//! [`BoundedWorkPool::force_execute`].
//!
//! # Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use millrace::{StreamingWorkerHarness, WorkerConfig};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let harness = StreamingWorkerHarness::builder()
//!         .config(WorkerConfig::new("work-service-host:12345"))
//!         .service(my_service)
//!         .executor_factory(my_factory)
//!         .state_fetcher(my_fetcher)
//!         .register_serialized(r#"{"computation_id":"c1"}"#)?
//!         .build()?;
//!     harness.start().await?;
//!     // ... run until told otherwise ...
//!     harness.stop().await
//! }
//! ```
//!
//! See `examples/local_worker.rs` for a runnable worker wired to the
//! in-memory service stub from `millrace-testkit`.
//!
//! # Feature Flags
//!
//! - `metrics` - Prometheus gauges for pool occupancy and commit backlogs.

/// Work-item commit requests, commit builders, and output queues.
pub mod commit;

/// Worker configuration and tunables.
pub mod config;

/// Counter delta translation from executor counters to commit updates.
pub mod counters;

/// Computation ids and descriptors.
pub mod descriptor;

/// The executor seam: pipeline executors, execution contexts, and the
/// per-computation free-list.
pub mod executor;

/// Failure classification, exception reports, and the last-exception cell.
pub mod failure;

/// Memory-pressure introspection for the dispatch gate.
pub mod memory;

/// The bounded execution pool with its forced retry path.
pub mod pool;

/// The computation registry binding descriptors, output queues, and
/// executor free-lists.
pub mod registry;

/// The worker harness runtime: dispatch, execution, and commit actors.
pub mod runtime;

/// The work-service client trait, wire structures, and stub registry.
pub mod service;

/// Keyed-state fetching capability.
pub mod state;

pub(crate) mod status;

#[cfg(feature = "metrics")]
/// Prometheus metrics instrumentation.
pub mod metrics;

pub use commit::{CommitBuilder, OutputMessage, OutputQueue, ValueUpdate, WorkItemCommit};
pub use config::WorkerConfig;
pub use counters::{
    translate_counters, CounterAggregate, CounterKind, CounterSnapshot,
    CounterUpdate, CounterValue,
};
pub use descriptor::{parse_descriptor, ComputationDescriptor, ComputationId};
pub use executor::{
    ExecutionContext, ExecutorFactory, ExecutorPair, ExecutorStack,
    PipelineExecutor,
};
pub use failure::{
    is_key_token_invalid, unwrap_user_code, ExceptionReport, KeyTokenInvalid,
    LastExceptionCell, UserCodeError,
};
pub use memory::{MemoryGauge, ProcStatusGauge};
pub use pool::{BoundedWorkPool, PoolSaturated, PoolTask, WorkPoolConfig};
pub use registry::{ComputationRegistry, ComputationState};
pub use runtime::{HarnessBuilder, RunState, StreamingWorkerHarness};
pub use service::{
    CommitWorkRequest, ComputationCommitRequest, ComputationWorkItems,
    GetConfigRequest, GetConfigResponse, GetWorkRequest, GetWorkResponse,
    InputMessage, ReportStatsRequest, ReportStatsResponse, StubConstructor,
    StubRegistry, WorkItem, WorkService,
};
pub use state::StateFetcher;
