//! The streaming worker harness.
//!
//! Three actor classes cooperate around the computation registry: one
//! dispatch task leases work from the service and feeds the bounded pool,
//! pool workers run one item each through a cached executor pair, and one
//! commit task drains the per-computation output queues into batched
//! commit calls. The service owns durability and per-key ordering; the
//! harness sheds load instead of queueing unboundedly, via the memory gate
//! upstream of leasing and the pool's bounded admission queue.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::Instrument;

use crate::commit::{CommitBuilder, WorkItemCommit};
use crate::config::WorkerConfig;
use crate::counters::translate_counters;
use crate::descriptor::{parse_descriptor, ComputationDescriptor, ComputationId};
use crate::executor::{
    ExecutionContext, ExecutorFactory, ExecutorPair,
};
use crate::failure::{
    is_key_token_invalid, unwrap_user_code, ExceptionReport, LastExceptionCell,
};
use crate::memory::MemoryGauge;
use crate::pool::{BoundedWorkPool, PoolTask};
use crate::registry::{ComputationRegistry, ComputationState};
use crate::service::{
    CommitWorkRequest, ComputationCommitRequest, GetConfigRequest,
    GetWorkRequest, GetWorkResponse, ReportStatsRequest, WorkItem, WorkService,
};
use crate::state::StateFetcher;
use crate::status::StatusServer;

/// Shared start/stop flag polled by the dispatch and commit loops.
///
/// Stopping is level-triggered: loops observe the flag at iteration
/// boundaries rather than being cancelled mid-sleep.
#[derive(Clone, Debug, Default)]
pub struct RunState {
    inner: Arc<RunStateInner>,
}

#[derive(Debug, Default)]
struct RunStateInner {
    running: AtomicBool,
    notify: Notify,
}

impl RunState {
    /// Create a state that is not yet running.
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn set_running(&self) {
        self.inner.running.store(true, Ordering::SeqCst);
    }

    /// Clear the running flag and wake anyone waiting on [`RunState::stopped`].
    pub fn stop(&self) {
        self.inner.running.store(false, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    /// Whether the harness is running.
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Wait until the running flag is cleared.
    pub async fn stopped(&self) {
        if !self.is_running() {
            return;
        }
        self.inner.notify.notified().await;
    }
}

pub(crate) struct HarnessInner {
    pub(crate) config: WorkerConfig,
    pub(crate) service: Arc<dyn WorkService>,
    pub(crate) factory: Arc<dyn ExecutorFactory>,
    pub(crate) state_fetcher: Arc<dyn StateFetcher>,
    pub(crate) memory: Arc<dyn MemoryGauge>,
    pub(crate) registry: ComputationRegistry,
    pub(crate) pool: BoundedWorkPool,
    pub(crate) running: RunState,
    pub(crate) client_id: u64,
    pub(crate) last_exception: LastExceptionCell,
}

/// A streaming compute worker.
///
/// Built through [`crate::runtime::HarnessBuilder`]; [`start`] spawns the
/// dispatch and commit actors plus the status server, [`stop`] winds them
/// down in dependency order. Work in flight at shutdown is abandoned and
/// re-leased by the service.
///
/// [`start`]: StreamingWorkerHarness::start
/// [`stop`]: StreamingWorkerHarness::stop
pub struct StreamingWorkerHarness {
    inner: Arc<HarnessInner>,
    dispatch_handle: parking_lot::Mutex<Option<JoinHandle<()>>>,
    commit_handle: parking_lot::Mutex<Option<JoinHandle<()>>>,
    status_server: parking_lot::Mutex<Option<StatusServer>>,
}

impl std::fmt::Debug for StreamingWorkerHarness {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamingWorkerHarness").finish()
    }
}

impl StreamingWorkerHarness {
    /// Start building a harness.
    pub fn builder() -> crate::runtime::HarnessBuilder {
        crate::runtime::HarnessBuilder::new()
    }

    pub(crate) fn from_inner(inner: Arc<HarnessInner>) -> Self {
        Self {
            inner,
            dispatch_handle: parking_lot::Mutex::new(None),
            commit_handle: parking_lot::Mutex::new(None),
            status_server: parking_lot::Mutex::new(None),
        }
    }

    /// The computation registry.
    pub fn registry(&self) -> &ComputationRegistry {
        &self.inner.registry
    }

    /// The execution pool.
    pub fn pool(&self) -> &BoundedWorkPool {
        &self.inner.pool
    }

    /// Random worker identity sent with every lease request.
    pub fn client_id(&self) -> u64 {
        self.inner.client_id
    }

    /// Whether the harness is running.
    pub fn is_running(&self) -> bool {
        self.inner.running.is_running()
    }

    /// Rendered form of the most recent execution failure, if any.
    pub fn last_exception(&self) -> Option<String> {
        self.inner.last_exception.get()
    }

    /// Address the status server bound to, when enabled and started.
    pub fn status_addr(&self) -> Option<std::net::SocketAddr> {
        self.status_server.lock().as_ref().map(StatusServer::addr)
    }

    /// Register a computation ahead of its first lease.
    pub fn register_computation(&self, descriptor: ComputationDescriptor) {
        self.inner.registry.register(descriptor);
    }

    /// Spawn the dispatch and commit actors and the status server.
    pub async fn start(&self) -> anyhow::Result<()> {
        self.inner.running.set_running();

        if self.inner.config.status_enabled {
            let server = crate::status::bind(
                Arc::clone(&self.inner),
                self.inner.config.status_port,
            )
            .await?;
            tracing::info!(addr = %server.addr(), "status server started");
            *self.status_server.lock() = Some(server);
        }

        let dispatch = tokio::spawn(dispatch_loop(Arc::clone(&self.inner)));
        *self.dispatch_handle.lock() = Some(dispatch);
        let commit = tokio::spawn(commit_loop(Arc::clone(&self.inner)));
        *self.commit_handle.lock() = Some(commit);
        Ok(())
    }

    /// Wind the harness down: status server, dispatch, execution pool,
    /// idle executors, commit loop, in that order. Exceeding the pool's
    /// shutdown grace is a hard error.
    pub async fn stop(&self) -> anyhow::Result<()> {
        let status = self.status_server.lock().take();
        if let Some(server) = status {
            server.stop().await;
        }

        self.inner.running.stop();

        let dispatch = self.dispatch_handle.lock().take();
        if let Some(handle) = dispatch {
            let _ = handle.await;
        }

        self.inner
            .pool
            .shutdown(self.inner.config.shutdown_grace())
            .await
            .context("execution pool did not drain before the shutdown deadline")?;

        self.inner.registry.drain_executors();

        let commit = self.commit_handle.lock().take();
        if let Some(handle) = commit {
            let _ = handle.await;
        }

        tracing::info!("worker harness stopped");
        Ok(())
    }
}

pub(crate) async fn dispatch_loop(inner: Arc<HarnessInner>) {
    tracing::info!("dispatch starting");
    let mut last_pushback_log: Option<Instant> = None;

    while inner.running.is_running() {
        memory_gate(&inner, &mut last_pushback_log).await;
        if !inner.running.is_running() {
            break;
        }

        let response = lease_with_backoff(&inner).await;

        #[cfg(feature = "metrics")]
        crate::metrics::observe_pool(&inner.pool);

        for batch in response.work {
            let computation_id = batch.computation_id;
            if !inner.registry.contains(&computation_id) {
                fetch_config(&inner, &computation_id).await;
            }

            // Watermarks arrive in micros; execution contexts run in millis.
            let input_watermark_ms = batch.input_data_watermark_micros / 1000;

            for work in batch.work {
                let task = process_work(
                    Arc::clone(&inner),
                    computation_id.clone(),
                    input_watermark_ms,
                    work,
                );
                if inner.pool.execute(task).is_err() {
                    // The lease expires at the service and is re-handed out.
                    tracing::debug!(
                        computation = %computation_id,
                        "admission queue full, dropping leased item"
                    );
                }
            }
        }
    }
    tracing::info!("dispatch done");
}

async fn memory_gate(
    inner: &Arc<HarnessInner>,
    last_pushback_log: &mut Option<Instant>,
) {
    loop {
        if !inner.running.is_running() {
            return;
        }
        let used = inner.memory.used_bytes();
        let ceiling = inner.memory.ceiling_bytes();
        if (used as f64) <= inner.config.pushback_ratio * ceiling as f64 {
            return;
        }
        let should_log = last_pushback_log.map_or(true, |last| {
            last.elapsed() >= inner.config.pushback_log_interval()
        });
        if should_log {
            *last_pushback_log = Some(Instant::now());
            tracing::warn!(
                used_mib = used >> 20,
                ceiling_mib = ceiling >> 20,
                "in pushback, not accepting new work"
            );
        }
        tokio::time::sleep(inner.config.memory_poll()).await;
    }
}

async fn lease_with_backoff(inner: &Arc<HarnessInner>) -> GetWorkResponse {
    let mut backoff = inner.config.lease_backoff_floor();
    let ceiling = inner.config.lease_backoff_ceiling();

    while inner.running.is_running() {
        let request = GetWorkRequest {
            client_id: inner.client_id,
            max_items: inner.config.lease_batch_size,
        };
        match inner.service.get_work(request).await {
            Ok(response) if response.work_count() > 0 => return response,
            Ok(_) => {}
            Err(err) => {
                tracing::warn!(error = %format!("{err:#}"), "work lease failed");
            }
        }
        tokio::time::sleep(backoff).await;
        backoff = (backoff * 2).min(ceiling);
    }
    GetWorkResponse::default()
}

async fn fetch_config(inner: &Arc<HarnessInner>, computation_id: &ComputationId) {
    let request = GetConfigRequest {
        computations: vec![computation_id.clone()],
    };
    match inner.service.get_config(request).await {
        Ok(response) => {
            for serialized in response.descriptors {
                match parse_descriptor(&serialized) {
                    Ok(descriptor) => {
                        inner.registry.register(descriptor);
                    }
                    Err(err) => {
                        tracing::warn!(
                            error = %format!("{err:#}"),
                            payload = %serialized,
                            "failed to parse computation descriptor"
                        );
                    }
                }
            }
        }
        Err(err) => {
            tracing::warn!(
                computation = %computation_id,
                error = %format!("{err:#}"),
                "configuration fetch failed"
            );
        }
    }
}

/// Build the pool task that runs one work item end to end.
///
/// Returned erased so the failure path can resubmit the same entry point
/// through the pool's unbounded channel.
pub(crate) fn process_work(
    inner: Arc<HarnessInner>,
    computation_id: ComputationId,
    input_watermark_ms: i64,
    work: WorkItem,
) -> PoolTask {
    Box::pin(async move {
        let span = tracing::info_span!(
            "process_work",
            computation = %computation_id,
            key = %String::from_utf8_lossy(&work.key),
            work_token = work.work_token,
        );
        async {
            let Some(state) = inner.registry.lookup(&computation_id) else {
                // The descriptor arrives with the next lease of this id.
                tracing::info!("received work for unknown computation");
                return;
            };

            if let Err(err) =
                run_item(&inner, &state, &computation_id, input_watermark_ms, &work)
                    .await
            {
                apply_failure_policy(
                    &inner,
                    &computation_id,
                    input_watermark_ms,
                    work,
                    err,
                )
                .await;
            }
        }
        .instrument(span)
        .await
    })
}

async fn run_item(
    inner: &Arc<HarnessInner>,
    state: &Arc<ComputationState>,
    computation_id: &ComputationId,
    input_watermark_ms: i64,
    work: &WorkItem,
) -> anyhow::Result<()> {
    let mut pair = match state.executors().acquire() {
        Some(pair) => pair,
        None => fresh_pair(inner, state, computation_id).await?,
    };

    pair.context.start(
        work.clone(),
        input_watermark_ms,
        CommitBuilder::new(work.key.clone(), work.work_token),
    );

    match execute_bound(&mut pair).await {
        Ok(commit) => {
            state.output_queue().push(commit);
            state.executors().release(pair);
            tracing::debug!("processing done");
            Ok(())
        }
        Err(err) => {
            // Failed executors are never reused.
            if let Err(close_err) = pair.executor.close() {
                tracing::warn!(
                    error = %format!("{close_err:#}"),
                    "failed to close executor"
                );
            }
            Err(err)
        }
    }
}

async fn fresh_pair(
    inner: &Arc<HarnessInner>,
    state: &Arc<ComputationState>,
    computation_id: &ComputationId,
) -> anyhow::Result<ExecutorPair> {
    let context = ExecutionContext::new(
        computation_id.clone(),
        Arc::clone(&inner.state_fetcher),
    );
    let mut executor = inner.factory.create(state.descriptor(), &context).await?;
    assert!(
        executor.supports_restart(),
        "streaming execution requires restartable executors, got one for {computation_id} that is not"
    );
    // Progress update results go unused for streaming work.
    executor.set_progress_update_interval(Duration::ZERO);
    Ok(ExecutorPair::new(executor, context))
}

async fn execute_bound(pair: &mut ExecutorPair) -> anyhow::Result<WorkItemCommit> {
    let ExecutorPair { executor, context } = pair;
    executor.execute(context).await?;
    let counters = translate_counters(executor.take_counter_deltas());
    let mut builder = context.finish()?;
    builder.add_counter_updates(counters);
    Ok(builder.build())
}

async fn apply_failure_policy(
    inner: &Arc<HarnessInner>,
    computation_id: &ComputationId,
    input_watermark_ms: i64,
    work: WorkItem,
    err: anyhow::Error,
) {
    let err = unwrap_user_code(err);

    if is_key_token_invalid(&err) {
        tracing::debug!(
            "work token expired during execution, will not retry locally"
        );
        return;
    }

    tracing::error!(error = %format!("{err:#}"), "execution of work item failed");
    inner.last_exception.record(&err);

    let report = ExceptionReport::from_error(&err);
    let verdict = inner
        .service
        .report_stats(ReportStatsRequest {
            computation_id: computation_id.clone(),
            key: work.key.clone(),
            work_token: work.work_token,
            exceptions: vec![report],
        })
        .await;

    let retry = match verdict {
        Ok(response) => !response.failed,
        Err(report_err) => {
            tracing::debug!(
                error = %format!("{report_err:#}"),
                "failure report did not reach the service, abandoning item"
            );
            false
        }
    };

    if retry {
        // Debounce so a poison item cannot spin the pool in a tight loop.
        tokio::time::sleep(inner.config.retry_debounce()).await;
        inner.pool.force_execute(process_work(
            Arc::clone(inner),
            computation_id.clone(),
            input_watermark_ms,
            work,
        ));
    } else {
        tracing::debug!("service refused local retry, awaiting lease expiry");
    }
}

pub(crate) async fn commit_loop(inner: Arc<HarnessInner>) {
    while inner.running.is_running() {
        let mut request = CommitWorkRequest::default();
        let mut remaining = inner.config.max_commit_bytes as i64;

        for (computation_id, state) in inner.registry.snapshot() {
            let queue = state.output_queue();
            let mut sub = ComputationCommitRequest {
                computation_id,
                requests: Vec::new(),
            };
            // Budget is checked before the pop, so one oversized item can
            // still make progress alone.
            while remaining > 0 {
                match queue.pop() {
                    Some(commit) => {
                        remaining -= commit.encoded_len() as i64;
                        sub.requests.push(commit);
                    }
                    None => break,
                }
            }
            #[cfg(feature = "metrics")]
            crate::metrics::set_commit_queue_depth(
                sub.computation_id.as_str(),
                queue.len(),
            );
            if !sub.requests.is_empty() {
                request.requests.push(sub);
            }
        }

        if !request.requests.is_empty() {
            tracing::trace!(
                computations = request.requests.len(),
                "sending commit batch"
            );
            if let Err(err) = inner.service.commit_work(request).await {
                tracing::warn!(
                    error = %format!("{err:#}"),
                    "commit batch failed, items will be re-leased after token expiry"
                );
            }
        }

        if remaining > 0 {
            tokio::time::sleep(inner.config.commit_idle()).await;
        }
    }
    tracing::info!("commit done");
}
