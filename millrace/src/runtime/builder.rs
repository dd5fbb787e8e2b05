use std::sync::Arc;

use anyhow::Context as _;

use crate::config::WorkerConfig;
use crate::descriptor::{parse_descriptor, ComputationDescriptor};
use crate::executor::ExecutorFactory;
use crate::failure::LastExceptionCell;
use crate::memory::{MemoryGauge, ProcStatusGauge};
use crate::pool::{BoundedWorkPool, WorkPoolConfig};
use crate::registry::ComputationRegistry;
use crate::runtime::harness::{HarnessInner, RunState, StreamingWorkerHarness};
use crate::service::WorkService;
use crate::state::StateFetcher;

/// Builder for [`StreamingWorkerHarness`].
///
/// The service, executor factory, and state fetcher are required
/// collaborators; the memory gauge defaults to the resident-set gauge
/// configured from [`WorkerConfig::memory_ceiling_bytes`].
#[derive(Default)]
pub struct HarnessBuilder {
    config: Option<WorkerConfig>,
    service: Option<Arc<dyn WorkService>>,
    factory: Option<Arc<dyn ExecutorFactory>>,
    state_fetcher: Option<Arc<dyn StateFetcher>>,
    memory: Option<Arc<dyn MemoryGauge>>,
    descriptors: Vec<ComputationDescriptor>,
}

impl HarnessBuilder {
    /// Create an empty builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the worker configuration.
    pub fn config(mut self, config: WorkerConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Set the work-service client.
    pub fn service(mut self, service: Arc<dyn WorkService>) -> Self {
        self.service = Some(service);
        self
    }

    /// Set the executor factory.
    pub fn executor_factory(mut self, factory: Arc<dyn ExecutorFactory>) -> Self {
        self.factory = Some(factory);
        self
    }

    /// Set the keyed-state fetcher handed to every execution context.
    pub fn state_fetcher(mut self, fetcher: Arc<dyn StateFetcher>) -> Self {
        self.state_fetcher = Some(fetcher);
        self
    }

    /// Override the memory gauge. Tests use this to drive pushback.
    pub fn memory_gauge(mut self, gauge: Arc<dyn MemoryGauge>) -> Self {
        self.memory = Some(gauge);
        self
    }

    /// Pre-register a computation.
    pub fn register(mut self, descriptor: ComputationDescriptor) -> Self {
        self.descriptors.push(descriptor);
        self
    }

    /// Pre-register a computation from its serialized descriptor. A parse
    /// failure here is fatal: the worker must not start with malformed
    /// startup specs.
    pub fn register_serialized(mut self, input: &str) -> anyhow::Result<Self> {
        let descriptor = parse_descriptor(input)
            .with_context(|| format!("malformed computation spec: {input}"))?;
        self.descriptors.push(descriptor);
        Ok(self)
    }

    /// Assemble the harness.
    pub fn build(self) -> anyhow::Result<StreamingWorkerHarness> {
        let config = self.config.unwrap_or_default();
        let service = self.service.context("work service is required")?;
        let factory = self.factory.context("executor factory is required")?;
        let state_fetcher =
            self.state_fetcher.context("state fetcher is required")?;
        let memory = self.memory.unwrap_or_else(|| {
            Arc::new(ProcStatusGauge::new(config.memory_ceiling_bytes))
        });

        let pool = BoundedWorkPool::new(WorkPoolConfig {
            max_workers: config.max_workers,
            max_queue: config.max_queue,
            idle_expiration: config.worker_idle(),
        });

        let registry = ComputationRegistry::new();
        for descriptor in self.descriptors {
            registry.register(descriptor);
        }

        let inner = Arc::new(HarnessInner {
            config,
            service,
            factory,
            state_fetcher,
            memory,
            registry,
            pool,
            running: RunState::new(),
            client_id: rand::random(),
            last_exception: LastExceptionCell::new(),
        });
        Ok(StreamingWorkerHarness::from_inner(inner))
    }
}
