use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use millrace::{
    CommitWorkRequest, ComputationId, ComputationWorkItems, GetConfigRequest,
    GetConfigResponse, GetWorkRequest, GetWorkResponse, InputMessage,
    ReportStatsRequest, ReportStatsResponse, WorkItem, WorkItemCommit,
    WorkService,
};
use parking_lot::Mutex;

/// Build a work item with one payload message.
pub fn work_item(key: &[u8], work_token: u64) -> WorkItem {
    WorkItem {
        key: key.to_vec(),
        work_token,
        messages: vec![InputMessage {
            timestamp_micros: 0,
            data: b"payload".to_vec(),
        }],
    }
}

/// Build a per-computation lease batch.
pub fn work_batch(
    computation: &str,
    watermark_micros: i64,
    work: Vec<WorkItem>,
) -> ComputationWorkItems {
    ComputationWorkItems {
        computation_id: ComputationId::from(computation),
        input_data_watermark_micros: watermark_micros,
        work,
    }
}

/// In-memory work service.
///
/// Lease responses are staged with [`InMemoryWorkService::push_work`] and
/// handed out one staged response per `get_work` call; everything the
/// harness sends back is recorded for assertions.
#[derive(Default)]
pub struct InMemoryWorkService {
    staged_work: Mutex<VecDeque<Vec<ComputationWorkItems>>>,
    staged_configs: Mutex<HashMap<ComputationId, Vec<String>>>,
    commits: Mutex<Vec<CommitWorkRequest>>,
    reports: Mutex<Vec<ReportStatsRequest>>,
    config_requests: Mutex<Vec<Vec<ComputationId>>>,
    get_work_calls: AtomicUsize,
    report_failed: AtomicBool,
    reporting_errors: AtomicBool,
}

impl InMemoryWorkService {
    /// Create an empty service.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Stage one lease response; each `get_work` call consumes one.
    pub fn push_work(&self, batches: Vec<ComputationWorkItems>) {
        self.staged_work.lock().push_back(batches);
    }

    /// Stage a serialized descriptor returned for configuration requests
    /// naming `computation`.
    pub fn stage_config(&self, computation: &str, serialized: impl Into<String>) {
        self.staged_configs
            .lock()
            .entry(ComputationId::from(computation))
            .or_default()
            .push(serialized.into());
    }

    /// Make `report_stats` answer `failed = true` (refuse local retries).
    pub fn set_report_failed(&self, failed: bool) {
        self.report_failed.store(failed, Ordering::SeqCst);
    }

    /// Make `report_stats` fail as an RPC.
    pub fn set_reporting_errors(&self, erroring: bool) {
        self.reporting_errors.store(erroring, Ordering::SeqCst);
    }

    /// Number of `get_work` calls so far.
    pub fn get_work_calls(&self) -> usize {
        self.get_work_calls.load(Ordering::SeqCst)
    }

    /// Every configuration request received, in order.
    pub fn config_requests(&self) -> Vec<Vec<ComputationId>> {
        self.config_requests.lock().clone()
    }

    /// Every commit batch received, in order.
    pub fn commits(&self) -> Vec<CommitWorkRequest> {
        self.commits.lock().clone()
    }

    /// All committed work items flattened across batches, tagged by
    /// computation, in arrival order.
    pub fn committed_items(&self) -> Vec<(ComputationId, WorkItemCommit)> {
        self.commits
            .lock()
            .iter()
            .flat_map(|batch| {
                batch.requests.iter().flat_map(|sub| {
                    sub.requests
                        .iter()
                        .map(|commit| (sub.computation_id.clone(), commit.clone()))
                })
            })
            .collect()
    }

    /// Every failure report received, in order.
    pub fn reports(&self) -> Vec<ReportStatsRequest> {
        self.reports.lock().clone()
    }
}

#[async_trait]
impl WorkService for InMemoryWorkService {
    async fn get_work(
        &self,
        _request: GetWorkRequest,
    ) -> anyhow::Result<GetWorkResponse> {
        self.get_work_calls.fetch_add(1, Ordering::SeqCst);
        let work = self.staged_work.lock().pop_front().unwrap_or_default();
        Ok(GetWorkResponse { work })
    }

    async fn get_config(
        &self,
        request: GetConfigRequest,
    ) -> anyhow::Result<GetConfigResponse> {
        self.config_requests.lock().push(request.computations.clone());
        let staged = self.staged_configs.lock();
        let mut descriptors = Vec::new();
        for id in &request.computations {
            if let Some(entries) = staged.get(id) {
                descriptors.extend(entries.iter().cloned());
            }
        }
        Ok(GetConfigResponse { descriptors })
    }

    async fn commit_work(
        &self,
        request: CommitWorkRequest,
    ) -> anyhow::Result<()> {
        self.commits.lock().push(request);
        Ok(())
    }

    async fn report_stats(
        &self,
        request: ReportStatsRequest,
    ) -> anyhow::Result<ReportStatsResponse> {
        if self.reporting_errors.load(Ordering::SeqCst) {
            anyhow::bail!("stats endpoint unavailable");
        }
        self.reports.lock().push(request);
        Ok(ReportStatsResponse {
            failed: self.report_failed.load(Ordering::SeqCst),
        })
    }
}
