//! The work-service client surface.
//!
//! The coordination service owns sharding, durability, and retry at the
//! lease level; the harness only consumes the four RPCs modeled here. The
//! transport behind [`WorkService`] is a collaborator: production builds
//! wire in a remote stub, tests an in-memory one, selected by string tag
//! through a [`StubRegistry`].

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::descriptor::ComputationId;
use crate::failure::ExceptionReport;
use crate::commit::WorkItemCommit;

/// One message embedded in a leased work item.
#[derive(Clone, Debug, PartialEq)]
pub struct InputMessage {
    /// Event timestamp in microseconds.
    pub timestamp_micros: i64,
    /// Encoded message payload.
    pub data: Vec<u8>,
}

/// One leased unit of execution, addressed by `(key, work_token)`.
#[derive(Clone, Debug)]
pub struct WorkItem {
    /// Key the item is sharded under. Opaque bytes.
    pub key: Vec<u8>,
    /// Identifier of this lease attempt for the key.
    pub work_token: u64,
    /// Embedded inputs, consumed by the executor.
    pub messages: Vec<InputMessage>,
}

/// A batch of work items for one computation, with the batch watermark.
#[derive(Clone, Debug)]
pub struct ComputationWorkItems {
    /// Computation the items belong to.
    pub computation_id: ComputationId,
    /// Input data watermark for the batch, in microseconds.
    pub input_data_watermark_micros: i64,
    /// The leased items.
    pub work: Vec<WorkItem>,
}

/// Lease request.
#[derive(Clone, Debug)]
pub struct GetWorkRequest {
    /// Random worker identity, stable for the process lifetime, letting the
    /// service deduplicate a restarted worker.
    pub client_id: u64,
    /// Upper bound on items returned.
    pub max_items: usize,
}

/// Lease response, grouped per computation.
#[derive(Clone, Debug, Default)]
pub struct GetWorkResponse {
    /// Per-computation batches. May be empty.
    pub work: Vec<ComputationWorkItems>,
}

impl GetWorkResponse {
    /// Total number of work items across all batches.
    pub fn work_count(&self) -> usize {
        self.work.iter().map(|batch| batch.work.len()).sum()
    }
}

/// Request for computation descriptors by id.
#[derive(Clone, Debug)]
pub struct GetConfigRequest {
    /// Ids to fetch descriptors for.
    pub computations: Vec<ComputationId>,
}

/// Configuration response.
#[derive(Clone, Debug, Default)]
pub struct GetConfigResponse {
    /// Serialized computation descriptors, parsed with
    /// [`crate::descriptor::parse_descriptor`].
    pub descriptors: Vec<String>,
}

/// Commit requests for one computation, in output-queue order.
#[derive(Clone, Debug)]
pub struct ComputationCommitRequest {
    /// Computation the requests belong to.
    pub computation_id: ComputationId,
    /// The commits, FIFO within this computation.
    pub requests: Vec<WorkItemCommit>,
}

/// A batched commit spanning multiple computations.
#[derive(Clone, Debug, Default)]
pub struct CommitWorkRequest {
    /// Per-computation sub-requests. Only non-empty sub-requests are sent.
    pub requests: Vec<ComputationCommitRequest>,
}

/// Failure report for one work item.
#[derive(Clone, Debug)]
pub struct ReportStatsRequest {
    /// Computation the failed item belongs to.
    pub computation_id: ComputationId,
    /// Key of the failed item.
    pub key: Vec<u8>,
    /// Lease token of the failed attempt.
    pub work_token: u64,
    /// Structured failure reports, outermost first.
    pub exceptions: Vec<ExceptionReport>,
}

/// Service verdict on a reported failure.
#[derive(Clone, Copy, Debug, Default)]
pub struct ReportStatsResponse {
    /// `true` means the item is poisoned at the service and must not be
    /// retried locally; `false` means a local retry is acceptable.
    pub failed: bool,
}

/// Client surface of the coordination service.
///
/// Implementations own the transport. All methods may be called
/// concurrently from the dispatch, commit, and execution actors.
#[async_trait]
pub trait WorkService: Send + Sync {
    /// Lease up to `max_items` work items for this worker.
    async fn get_work(
        &self,
        request: GetWorkRequest,
    ) -> anyhow::Result<GetWorkResponse>;

    /// Fetch serialized descriptors for the given computation ids.
    async fn get_config(
        &self,
        request: GetConfigRequest,
    ) -> anyhow::Result<GetConfigResponse>;

    /// Commit a batch of work-item results. Idempotent at the service,
    /// keyed by `(key, work_token)`.
    async fn commit_work(
        &self,
        request: CommitWorkRequest,
    ) -> anyhow::Result<()>;

    /// Report a work-item failure and learn whether to retry locally.
    async fn report_stats(
        &self,
        request: ReportStatsRequest,
    ) -> anyhow::Result<ReportStatsResponse>;
}

impl std::fmt::Debug for dyn WorkService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkService").finish()
    }
}

/// Constructor for a [`WorkService`] stub, given the service endpoint.
pub type StubConstructor =
    Box<dyn Fn(&str) -> anyhow::Result<Arc<dyn WorkService>> + Send + Sync>;

/// Maps stub tags to constructors.
///
/// Deployments register the transports they compile in ("remote", "local",
/// ...) and pick one by configuration at startup. This replaces dynamic
/// class lookup with an explicit constructor table.
#[derive(Default)]
pub struct StubRegistry {
    constructors: HashMap<String, StubConstructor>,
}

impl StubRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a constructor under `tag`, replacing any previous entry.
    pub fn register(
        &mut self,
        tag: impl Into<String>,
        constructor: StubConstructor,
    ) {
        self.constructors.insert(tag.into(), constructor);
    }

    /// Construct the stub registered under `tag` against `endpoint`.
    pub fn create(
        &self,
        tag: &str,
        endpoint: &str,
    ) -> anyhow::Result<Arc<dyn WorkService>> {
        match self.constructors.get(tag) {
            Some(constructor) => constructor(endpoint),
            None => {
                let mut known: Vec<&str> =
                    self.constructors.keys().map(String::as_str).collect();
                known.sort_unstable();
                anyhow::bail!(
                    "unknown work service stub {tag:?}; registered stubs: {known:?}"
                )
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullService;

    #[async_trait]
    impl WorkService for NullService {
        async fn get_work(
            &self,
            _request: GetWorkRequest,
        ) -> anyhow::Result<GetWorkResponse> {
            Ok(GetWorkResponse::default())
        }

        async fn get_config(
            &self,
            _request: GetConfigRequest,
        ) -> anyhow::Result<GetConfigResponse> {
            Ok(GetConfigResponse::default())
        }

        async fn commit_work(
            &self,
            _request: CommitWorkRequest,
        ) -> anyhow::Result<()> {
            Ok(())
        }

        async fn report_stats(
            &self,
            _request: ReportStatsRequest,
        ) -> anyhow::Result<ReportStatsResponse> {
            Ok(ReportStatsResponse::default())
        }
    }

    #[test]
    fn test_stub_registry_creates_registered_tag() {
        let mut registry = StubRegistry::new();
        registry.register("null", Box::new(|_| Ok(Arc::new(NullService))));
        assert!(registry.create("null", "host:1234").is_ok());
    }

    #[test]
    fn test_stub_registry_rejects_unknown_tag() {
        let registry = StubRegistry::new();
        let err = registry.create("missing", "host:1234").unwrap_err();
        assert!(err.to_string().contains("missing"));
    }

    #[test]
    fn test_work_count_sums_batches() {
        let item = WorkItem {
            key: b"k".to_vec(),
            work_token: 1,
            messages: Vec::new(),
        };
        let response = GetWorkResponse {
            work: vec![
                ComputationWorkItems {
                    computation_id: ComputationId::from("a"),
                    input_data_watermark_micros: 0,
                    work: vec![item.clone(), item.clone()],
                },
                ComputationWorkItems {
                    computation_id: ComputationId::from("b"),
                    input_data_watermark_micros: 0,
                    work: vec![item],
                },
            ],
        };
        assert_eq!(response.work_count(), 3);
    }
}
