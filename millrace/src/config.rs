use std::time::Duration;

/// Configuration for a streaming worker harness.
///
/// Defaults match the production tuning; tests usually shrink the sleeps.
#[derive(Clone, Debug)]
pub struct WorkerConfig {
    /// `host:port` of the coordination service. Required.
    pub service_endpoint: String,
    /// Tag of the work-service stub to construct, resolved through a
    /// [`crate::service::StubRegistry`].
    pub stub: String,
    /// Port for the HTTP status server. Port 0 binds ephemerally.
    pub status_port: u16,
    /// Whether to run the status server at all.
    pub status_enabled: bool,
    /// Maximum concurrent execution workers.
    pub max_workers: usize,
    /// Capacity of the bounded admission queue.
    pub max_queue: usize,
    /// Seconds a worker may idle before being reclaimed.
    pub worker_idle_secs: u64,
    /// Byte budget for one commit batch.
    pub max_commit_bytes: u64,
    /// Fraction of the memory ceiling at which dispatch stops leasing.
    pub pushback_ratio: f64,
    /// Memory ceiling in bytes. `None` disables pushback.
    pub memory_ceiling_bytes: Option<u64>,
    /// Poll interval while in memory pushback, in milliseconds.
    pub memory_poll_ms: u64,
    /// Minimum spacing between pushback warnings, in seconds.
    pub pushback_log_secs: u64,
    /// Maximum items requested per lease call.
    pub lease_batch_size: usize,
    /// Initial lease backoff, in milliseconds.
    pub lease_backoff_floor_ms: u64,
    /// Lease backoff cap, in milliseconds.
    pub lease_backoff_ceiling_ms: u64,
    /// Delay before resubmitting a retryable failure, in milliseconds.
    pub retry_debounce_ms: u64,
    /// Commit-loop sleep when the queues were drained, in milliseconds.
    pub commit_idle_ms: u64,
    /// Seconds to wait for the pool to drain at shutdown.
    pub shutdown_grace_secs: u64,
}

impl WorkerConfig {
    /// Create a configuration with the given service endpoint and default
    /// tuning.
    pub fn new(service_endpoint: impl Into<String>) -> Self {
        Self {
            service_endpoint: service_endpoint.into(),
            ..Self::default()
        }
    }

    /// Build a configuration from process environment variables:
    /// `MILLRACE_HOSTPORT` (required), `MILLRACE_STATUS_PORT`, and
    /// `MILLRACE_STUB`.
    pub fn from_env() -> anyhow::Result<Self> {
        let endpoint = std::env::var("MILLRACE_HOSTPORT").map_err(|_| {
            anyhow::anyhow!(
                "MILLRACE_HOSTPORT must be set to the location of the work service"
            )
        })?;
        let mut config = Self::new(endpoint);
        if let Ok(port) = std::env::var("MILLRACE_STATUS_PORT") {
            config.status_port = port.parse()?;
        }
        if let Ok(stub) = std::env::var("MILLRACE_STUB") {
            config.stub = stub;
        }
        Ok(config)
    }

    /// Set the status port.
    pub fn with_status_port(mut self, port: u16) -> Self {
        self.status_port = port;
        self
    }

    /// Enable or disable the status server.
    pub fn with_status_enabled(mut self, enabled: bool) -> Self {
        self.status_enabled = enabled;
        self
    }

    /// Set the work-service stub tag.
    pub fn with_stub(mut self, stub: impl Into<String>) -> Self {
        self.stub = stub.into();
        self
    }

    /// Set the execution worker ceiling.
    pub fn with_max_workers(mut self, max_workers: usize) -> Self {
        self.max_workers = max_workers;
        self
    }

    /// Set the admission queue capacity.
    pub fn with_max_queue(mut self, max_queue: usize) -> Self {
        self.max_queue = max_queue;
        self
    }

    /// Set the commit byte budget.
    pub fn with_max_commit_bytes(mut self, max_commit_bytes: u64) -> Self {
        self.max_commit_bytes = max_commit_bytes;
        self
    }

    /// Set the memory ceiling.
    pub fn with_memory_ceiling(mut self, ceiling_bytes: u64) -> Self {
        self.memory_ceiling_bytes = Some(ceiling_bytes);
        self
    }

    /// Set the retry debounce.
    pub fn with_retry_debounce(mut self, debounce: Duration) -> Self {
        self.retry_debounce_ms = debounce.as_millis() as u64;
        self
    }

    pub(crate) fn memory_poll(&self) -> Duration {
        Duration::from_millis(self.memory_poll_ms)
    }

    pub(crate) fn pushback_log_interval(&self) -> Duration {
        Duration::from_secs(self.pushback_log_secs)
    }

    pub(crate) fn lease_backoff_floor(&self) -> Duration {
        Duration::from_millis(self.lease_backoff_floor_ms)
    }

    pub(crate) fn lease_backoff_ceiling(&self) -> Duration {
        Duration::from_millis(self.lease_backoff_ceiling_ms)
    }

    pub(crate) fn retry_debounce(&self) -> Duration {
        Duration::from_millis(self.retry_debounce_ms)
    }

    pub(crate) fn commit_idle(&self) -> Duration {
        Duration::from_millis(self.commit_idle_ms)
    }

    pub(crate) fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    pub(crate) fn worker_idle(&self) -> Duration {
        Duration::from_secs(self.worker_idle_secs)
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            service_endpoint: String::new(),
            stub: "remote".to_string(),
            status_port: 8081,
            status_enabled: true,
            max_workers: 100,
            max_queue: 100,
            worker_idle_secs: 60,
            max_commit_bytes: 32 << 20,
            pushback_ratio: 0.9,
            memory_ceiling_bytes: None,
            memory_poll_ms: 10,
            pushback_log_secs: 60,
            lease_batch_size: 100,
            lease_backoff_floor_ms: 1,
            lease_backoff_ceiling_ms: 1000,
            retry_debounce_ms: 10_000,
            commit_idle_ms: 100,
            shutdown_grace_secs: 300,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_tuning() {
        let config = WorkerConfig::default();
        assert_eq!(config.max_workers, 100);
        assert_eq!(config.max_queue, 100);
        assert_eq!(config.max_commit_bytes, 32 << 20);
        assert_eq!(config.status_port, 8081);
        assert!((config.pushback_ratio - 0.9).abs() < f64::EPSILON);
        assert_eq!(config.worker_idle_secs, 60);
        assert_eq!(config.lease_backoff_floor_ms, 1);
        assert_eq!(config.lease_backoff_ceiling_ms, 1000);
        assert_eq!(config.retry_debounce_ms, 10_000);
        assert_eq!(config.pushback_log_secs, 60);
        assert_eq!(config.shutdown_grace_secs, 300);
        assert_eq!(config.commit_idle_ms, 100);
        assert_eq!(config.memory_poll_ms, 10);
        assert_eq!(config.lease_batch_size, 100);
    }

    #[test]
    fn test_builder_setters() {
        let config = WorkerConfig::new("work-service:1234")
            .with_status_port(9090)
            .with_max_workers(4)
            .with_max_queue(8)
            .with_memory_ceiling(1 << 30)
            .with_retry_debounce(Duration::from_millis(50));
        assert_eq!(config.service_endpoint, "work-service:1234");
        assert_eq!(config.status_port, 9090);
        assert_eq!(config.max_workers, 4);
        assert_eq!(config.max_queue, 8);
        assert_eq!(config.memory_ceiling_bytes, Some(1 << 30));
        assert_eq!(config.retry_debounce_ms, 50);
    }
}
