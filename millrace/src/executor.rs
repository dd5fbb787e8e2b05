//! The executor seam between the harness and the user-pipeline engine.
//!
//! A [`PipelineExecutor`] runs one computation's stage graph; the harness
//! never looks inside it. Executors are expensive to build, so each
//! computation keeps a free-list of idle `(executor, context)` pairs that
//! are rebound to successive work items. A pair leaves the free-list for
//! exactly one in-flight item at a time and only returns after a fully
//! successful execution; any failure closes it instead.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use async_trait::async_trait;
use parking_lot::Mutex;

use crate::commit::{CommitBuilder, OutputMessage, ValueUpdate};
use crate::counters::CounterSnapshot;
use crate::descriptor::{ComputationDescriptor, ComputationId};
use crate::service::{InputMessage, WorkItem};
use crate::state::StateFetcher;

/// A user-pipeline executor for one computation.
///
/// Executors must be restartable: `execute` is invoked repeatedly on the
/// same instance with different work items, with the context rebound
/// between invocations.
#[async_trait]
pub trait PipelineExecutor: Send {
    /// Run the pipeline against the work item currently bound to `ctx`.
    /// Blocks the calling worker for the duration.
    async fn execute(&mut self, ctx: &mut ExecutionContext)
        -> anyhow::Result<()>;

    /// Whether this executor supports repeated `execute` calls. The harness
    /// refuses to run executors that do not.
    fn supports_restart(&self) -> bool;

    /// Set the period of incremental progress updates. The harness disables
    /// them (`Duration::ZERO`) on freshly built executors; their results go
    /// unused for streaming work.
    fn set_progress_update_interval(&mut self, interval: Duration);

    /// Take the counter deltas accumulated since the last call.
    fn take_counter_deltas(&mut self) -> Vec<CounterSnapshot>;

    /// Release the executor's resources. Called instead of reuse after any
    /// failed execution, and for idle executors at shutdown.
    fn close(&mut self) -> anyhow::Result<()>;
}

/// Builds executors for a computation from its descriptor.
#[async_trait]
pub trait ExecutorFactory: Send + Sync {
    /// Build a fresh executor wired to `ctx`'s computation and state
    /// fetcher.
    async fn create(
        &self,
        descriptor: &ComputationDescriptor,
        ctx: &ExecutionContext,
    ) -> anyhow::Result<Box<dyn PipelineExecutor>>;
}

struct WorkBinding {
    work: WorkItem,
    input_watermark_ms: i64,
    builder: CommitBuilder,
    staged_values: Vec<ValueUpdate>,
}

/// Per-computation execution state threaded through an executor run.
///
/// The context outlives individual work items: it is created once per
/// executor pair and rebound to each item via [`ExecutionContext::start`].
/// During execution it collects outputs and staged state writes; at the end
/// [`ExecutionContext::finish`] flushes staged writes into the commit
/// builder and unbinds.
pub struct ExecutionContext {
    computation_id: ComputationId,
    state_fetcher: Arc<dyn StateFetcher>,
    binding: Option<WorkBinding>,
}

impl ExecutionContext {
    /// Create a context bound to a computation and the state capability.
    pub fn new(
        computation_id: ComputationId,
        state_fetcher: Arc<dyn StateFetcher>,
    ) -> Self {
        Self {
            computation_id,
            state_fetcher,
            binding: None,
        }
    }

    /// Computation this context belongs to.
    pub fn computation_id(&self) -> &ComputationId {
        &self.computation_id
    }

    /// Bind the context to a work item, its batch watermark, and the commit
    /// builder that will collect its outputs. Replaces any stale binding
    /// left by a failed execution.
    pub fn start(
        &mut self,
        work: WorkItem,
        input_watermark_ms: i64,
        builder: CommitBuilder,
    ) {
        self.binding = Some(WorkBinding {
            work,
            input_watermark_ms,
            builder,
            staged_values: Vec::new(),
        });
    }

    fn binding(&self) -> anyhow::Result<&WorkBinding> {
        self.binding
            .as_ref()
            .context("execution context is not bound to a work item")
    }

    fn binding_mut(&mut self) -> anyhow::Result<&mut WorkBinding> {
        self.binding
            .as_mut()
            .context("execution context is not bound to a work item")
    }

    /// Key of the bound work item.
    pub fn key(&self) -> anyhow::Result<&[u8]> {
        Ok(&self.binding()?.work.key)
    }

    /// Lease token of the bound work item.
    pub fn work_token(&self) -> anyhow::Result<u64> {
        Ok(self.binding()?.work.work_token)
    }

    /// Input data watermark of the bound batch, in milliseconds.
    pub fn input_watermark_ms(&self) -> anyhow::Result<i64> {
        Ok(self.binding()?.input_watermark_ms)
    }

    /// Embedded input messages of the bound work item.
    pub fn messages(&self) -> anyhow::Result<&[InputMessage]> {
        Ok(&self.binding()?.work.messages)
    }

    /// Emit an output message for the bound work item.
    pub fn emit_output(&mut self, message: OutputMessage) -> anyhow::Result<()> {
        self.binding_mut()?.builder.add_output(message);
        Ok(())
    }

    /// Stage a keyed-state write. Staged writes are flushed into the commit
    /// on [`ExecutionContext::finish`]; nothing is persisted locally.
    pub fn stage_value(&mut self, tag: Vec<u8>, data: Vec<u8>) -> anyhow::Result<()> {
        self.binding_mut()?
            .staged_values
            .push(ValueUpdate { tag, data });
        Ok(())
    }

    /// Read keyed state for the bound item through the state fetcher.
    pub async fn fetch_state(
        &self,
        tag: &[u8],
    ) -> anyhow::Result<Option<Vec<u8>>> {
        let binding = self.binding()?;
        self.state_fetcher
            .fetch_value(
                &self.computation_id,
                &binding.work.key,
                binding.work.work_token,
                tag,
            )
            .await
    }

    /// Flush staged state writes into the commit builder and unbind,
    /// returning the builder for sealing.
    pub fn finish(&mut self) -> anyhow::Result<CommitBuilder> {
        let mut binding = self
            .binding
            .take()
            .context("execution context is not bound to a work item")?;
        for update in binding.staged_values.drain(..) {
            binding.builder.add_value_update(update);
        }
        Ok(binding.builder)
    }
}

/// An idle or in-flight `(executor, context)` pair.
pub struct ExecutorPair {
    /// The pipeline executor.
    pub executor: Box<dyn PipelineExecutor>,
    /// Its execution context.
    pub context: ExecutionContext,
}

impl ExecutorPair {
    /// Pair an executor with its context.
    pub fn new(
        executor: Box<dyn PipelineExecutor>,
        context: ExecutionContext,
    ) -> Self {
        Self { executor, context }
    }
}

/// Free-list of idle executor pairs for one computation.
///
/// Last released is first acquired, keeping recently warm executors in
/// rotation. `acquire` never blocks: an empty stack tells the caller to
/// build a fresh pair through the factory.
#[derive(Default)]
pub struct ExecutorStack {
    stack: Mutex<Vec<ExecutorPair>>,
}

impl ExecutorStack {
    /// Create an empty free-list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the most recently released pair, if any.
    pub fn acquire(&self) -> Option<ExecutorPair> {
        self.stack.lock().pop()
    }

    /// Return a pair after a successful, restartable execution.
    pub fn release(&self, pair: ExecutorPair) {
        self.stack.lock().push(pair);
    }

    /// Number of idle pairs.
    pub fn depth(&self) -> usize {
        self.stack.lock().len()
    }

    /// Close every idle pair, emptying the free-list. Close failures are
    /// logged and do not stop the drain.
    pub fn drain_and_close(&self) {
        let pairs = std::mem::take(&mut *self.stack.lock());
        for mut pair in pairs {
            if let Err(err) = pair.executor.close() {
                tracing::warn!(
                    computation = %pair.context.computation_id(),
                    error = %format!("{err:#}"),
                    "failed to close idle executor"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commit::CommitBuilder;
    use crate::descriptor::ComputationId;

    struct NullStateFetcher;

    #[async_trait]
    impl StateFetcher for NullStateFetcher {
        async fn fetch_value(
            &self,
            _computation_id: &ComputationId,
            _key: &[u8],
            _work_token: u64,
            _tag: &[u8],
        ) -> anyhow::Result<Option<Vec<u8>>> {
            Ok(None)
        }
    }

    struct NullExecutor {
        closed: bool,
    }

    #[async_trait]
    impl PipelineExecutor for NullExecutor {
        async fn execute(
            &mut self,
            _ctx: &mut ExecutionContext,
        ) -> anyhow::Result<()> {
            Ok(())
        }

        fn supports_restart(&self) -> bool {
            true
        }

        fn set_progress_update_interval(&mut self, _interval: Duration) {}

        fn take_counter_deltas(&mut self) -> Vec<CounterSnapshot> {
            Vec::new()
        }

        fn close(&mut self) -> anyhow::Result<()> {
            self.closed = true;
            Ok(())
        }
    }

    fn pair() -> ExecutorPair {
        ExecutorPair::new(
            Box::new(NullExecutor { closed: false }),
            ExecutionContext::new(
                ComputationId::from("c1"),
                Arc::new(NullStateFetcher),
            ),
        )
    }

    fn work_item(token: u64) -> WorkItem {
        WorkItem {
            key: b"key".to_vec(),
            work_token: token,
            messages: vec![InputMessage {
                timestamp_micros: 1_000,
                data: b"payload".to_vec(),
            }],
        }
    }

    #[test]
    fn test_stack_is_lifo() {
        let stack = ExecutorStack::new();
        let mut first = pair();
        first.context.start(
            work_item(1),
            0,
            CommitBuilder::new(b"key".to_vec(), 1),
        );
        stack.release(first);
        stack.release(pair());
        assert_eq!(stack.depth(), 2);

        // Second released comes back first and has no stale binding.
        let top = stack.acquire().unwrap();
        assert!(top.context.key().is_err());
        assert_eq!(stack.depth(), 1);
    }

    #[test]
    fn test_acquire_release_restores_depth() {
        let stack = ExecutorStack::new();
        stack.release(pair());
        let taken = stack.acquire().unwrap();
        assert_eq!(stack.depth(), 0);
        stack.release(taken);
        assert_eq!(stack.depth(), 1);
    }

    #[test]
    fn test_drain_and_close_empties_stack() {
        let stack = ExecutorStack::new();
        stack.release(pair());
        stack.release(pair());
        stack.drain_and_close();
        assert_eq!(stack.depth(), 0);
        assert!(stack.acquire().is_none());
    }

    #[test]
    fn test_context_binding_lifecycle() {
        let mut ctx = ExecutionContext::new(
            ComputationId::from("c1"),
            Arc::new(NullStateFetcher),
        );
        assert!(ctx.key().is_err());

        ctx.start(work_item(7), 1_000, CommitBuilder::new(b"key".to_vec(), 7));
        assert_eq!(ctx.key().unwrap(), b"key");
        assert_eq!(ctx.work_token().unwrap(), 7);
        assert_eq!(ctx.input_watermark_ms().unwrap(), 1_000);
        assert_eq!(ctx.messages().unwrap().len(), 1);

        ctx.stage_value(b"tag".to_vec(), b"value".to_vec()).unwrap();
        ctx.emit_output(OutputMessage {
            tag: "downstream".to_string(),
            timestamp_micros: 1_000,
            data: b"out".to_vec(),
        })
        .unwrap();

        let commit = ctx.finish().unwrap().build();
        assert_eq!(commit.work_token, 7);
        assert_eq!(commit.output_messages.len(), 1);
        assert_eq!(commit.value_updates.len(), 1);
        assert_eq!(commit.value_updates[0].tag, b"tag");

        // Finishing unbinds; a second finish has nothing to flush.
        assert!(ctx.finish().is_err());
    }
}
