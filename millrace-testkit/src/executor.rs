use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use millrace::{
    ComputationDescriptor, CounterSnapshot, ExecutionContext, ExecutorFactory,
    KeyTokenInvalid, OutputMessage, PipelineExecutor, UserCodeError,
};
use parking_lot::Mutex;

/// What a scripted executor does with its next work item.
#[derive(Clone, Debug, Default)]
pub enum ExecutorBehavior {
    /// Finish cleanly, emitting the given outputs, staged state writes,
    /// and counter deltas.
    Succeed {
        /// Output messages to emit through the context.
        outputs: Vec<OutputMessage>,
        /// `(tag, value)` state writes to stage.
        values: Vec<(Vec<u8>, Vec<u8>)>,
        /// Counter deltas surfaced after execution.
        counters: Vec<CounterSnapshot>,
    },
    /// Fail with the given message.
    Fail {
        /// Error message of the innermost failure.
        message: String,
        /// Wrap the failure in a user-code layer.
        user_code: bool,
        /// Chain a stale-token error underneath the message.
        key_token_invalid: bool,
    },
    /// Finish cleanly with no outputs.
    #[default]
    SucceedEmpty,
}

/// One recorded `execute` invocation.
#[derive(Clone, Debug)]
pub struct ExecutionRecord {
    /// Computation the executor ran for.
    pub computation: String,
    /// Key of the work item.
    pub key: Vec<u8>,
    /// Token of the work item.
    pub work_token: u64,
    /// Input watermark the context was bound with, in milliseconds.
    pub input_watermark_ms: i64,
}

#[derive(Default)]
struct ScriptState {
    behaviors: Mutex<VecDeque<ExecutorBehavior>>,
    executions: Mutex<Vec<ExecutionRecord>>,
    created: AtomicUsize,
    closed: AtomicUsize,
    progress_disabled: AtomicUsize,
    restartable: AtomicBool,
    create_error: Mutex<Option<String>>,
}

/// Executor factory whose executors follow a shared script.
///
/// Behaviors queue up across all executors of the factory; each `execute`
/// call consumes the next one, defaulting to an empty success when the
/// script runs dry.
#[derive(Clone, Default)]
pub struct ScriptedExecutorFactory {
    state: Arc<ScriptState>,
}

impl ScriptedExecutorFactory {
    /// Create a factory producing restartable executors.
    pub fn new() -> Self {
        let factory = Self::default();
        factory.state.restartable.store(true, Ordering::SeqCst);
        factory
    }

    /// Queue the next behavior.
    pub fn script(&self, behavior: ExecutorBehavior) {
        self.state.behaviors.lock().push_back(behavior);
    }

    /// Make produced executors report that they cannot restart.
    pub fn set_restartable(&self, restartable: bool) {
        self.state.restartable.store(restartable, Ordering::SeqCst);
    }

    /// Make `create` fail with the given message.
    pub fn set_create_error(&self, message: impl Into<String>) {
        *self.state.create_error.lock() = Some(message.into());
    }

    /// Every recorded execution, in order.
    pub fn executions(&self) -> Vec<ExecutionRecord> {
        self.state.executions.lock().clone()
    }

    /// Number of executors built so far.
    pub fn created_count(&self) -> usize {
        self.state.created.load(Ordering::SeqCst)
    }

    /// Number of executors closed so far.
    pub fn closed_count(&self) -> usize {
        self.state.closed.load(Ordering::SeqCst)
    }

    /// Number of executors whose progress updates were disabled at build
    /// time.
    pub fn progress_disabled_count(&self) -> usize {
        self.state.progress_disabled.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ExecutorFactory for ScriptedExecutorFactory {
    async fn create(
        &self,
        _descriptor: &ComputationDescriptor,
        _ctx: &ExecutionContext,
    ) -> anyhow::Result<Box<dyn PipelineExecutor>> {
        if let Some(message) = self.state.create_error.lock().clone() {
            anyhow::bail!(message);
        }
        self.state.created.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(ScriptedExecutor {
            state: Arc::clone(&self.state),
            pending_counters: Vec::new(),
        }))
    }
}

struct ScriptedExecutor {
    state: Arc<ScriptState>,
    pending_counters: Vec<CounterSnapshot>,
}

#[async_trait]
impl PipelineExecutor for ScriptedExecutor {
    async fn execute(
        &mut self,
        ctx: &mut ExecutionContext,
    ) -> anyhow::Result<()> {
        let key = ctx.key()?.to_vec();
        self.state.executions.lock().push(ExecutionRecord {
            computation: ctx.computation_id().to_string(),
            key: key.clone(),
            work_token: ctx.work_token()?,
            input_watermark_ms: ctx.input_watermark_ms()?,
        });

        let behavior = self
            .state
            .behaviors
            .lock()
            .pop_front()
            .unwrap_or_default();
        match behavior {
            ExecutorBehavior::SucceedEmpty => Ok(()),
            ExecutorBehavior::Succeed {
                outputs,
                values,
                counters,
            } => {
                for output in outputs {
                    ctx.emit_output(output)?;
                }
                for (tag, value) in values {
                    ctx.stage_value(tag, value)?;
                }
                self.pending_counters = counters;
                Ok(())
            }
            ExecutorBehavior::Fail {
                message,
                user_code,
                key_token_invalid,
            } => {
                let err = if key_token_invalid {
                    anyhow::Error::new(KeyTokenInvalid::new(&key))
                        .context(message)
                } else {
                    anyhow::anyhow!(message)
                };
                if user_code {
                    Err(anyhow::Error::new(UserCodeError::new(err)))
                } else {
                    Err(err)
                }
            }
        }
    }

    fn supports_restart(&self) -> bool {
        self.state.restartable.load(Ordering::SeqCst)
    }

    fn set_progress_update_interval(&mut self, interval: Duration) {
        if interval.is_zero() {
            self.state.progress_disabled.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn take_counter_deltas(&mut self) -> Vec<CounterSnapshot> {
        std::mem::take(&mut self.pending_counters)
    }

    fn close(&mut self) -> anyhow::Result<()> {
        self.state.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
