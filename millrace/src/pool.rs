//! Bounded execution pool for per-item work.
//!
//! Up to `max_workers` worker tasks pull from two channels: a bounded
//! admission queue that refuses work when full, and an unbounded retry
//! channel that cannot refuse. The dispatch loop submits through the
//! bounded path and treats rejection as back-pressure; the failure
//! reporter resubmits through the unbounded path so a retry is never lost
//! to saturation. Workers are spawned on demand and exit after an idle
//! period.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// A unit of work for the pool.
pub type PoolTask = BoxFuture<'static, ()>;

/// Admission was refused because the bounded queue is full (or the pool is
/// shutting down).
#[derive(Clone, Copy, Debug, Error)]
#[error("work pool admission queue is full")]
pub struct PoolSaturated;

/// Pool sizing and reclaim settings.
#[derive(Clone, Debug)]
pub struct WorkPoolConfig {
    /// Maximum concurrent worker tasks.
    pub max_workers: usize,
    /// Capacity of the bounded admission queue.
    pub max_queue: usize,
    /// How long a worker may sit idle before exiting.
    pub idle_expiration: Duration,
}

impl Default for WorkPoolConfig {
    fn default() -> Self {
        Self {
            max_workers: 100,
            max_queue: 100,
            idle_expiration: Duration::from_secs(60),
        }
    }
}

struct PoolInner {
    config: WorkPoolConfig,
    queue_tx: parking_lot::Mutex<Option<mpsc::Sender<PoolTask>>>,
    queue_rx: tokio::sync::Mutex<mpsc::Receiver<PoolTask>>,
    forced_tx: parking_lot::Mutex<Option<mpsc::UnboundedSender<PoolTask>>>,
    forced_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<PoolTask>>,
    workers: AtomicUsize,
    active: AtomicUsize,
    queued: AtomicUsize,
    forced: AtomicUsize,
    shutting_down: AtomicBool,
    handles: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

/// Fixed-capacity worker pool with bounded and unbounded admission paths.
#[derive(Clone)]
pub struct BoundedWorkPool {
    inner: Arc<PoolInner>,
}

impl BoundedWorkPool {
    /// Create a pool. Workers are spawned lazily as work arrives, so this
    /// must be called within a tokio runtime.
    pub fn new(config: WorkPoolConfig) -> Self {
        let (queue_tx, queue_rx) = mpsc::channel(config.max_queue.max(1));
        let (forced_tx, forced_rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(PoolInner {
                config,
                queue_tx: parking_lot::Mutex::new(Some(queue_tx)),
                queue_rx: tokio::sync::Mutex::new(queue_rx),
                forced_tx: parking_lot::Mutex::new(Some(forced_tx)),
                forced_rx: tokio::sync::Mutex::new(forced_rx),
                workers: AtomicUsize::new(0),
                active: AtomicUsize::new(0),
                queued: AtomicUsize::new(0),
                forced: AtomicUsize::new(0),
                shutting_down: AtomicBool::new(false),
                handles: parking_lot::Mutex::new(Vec::new()),
            }),
        }
    }

    /// Submit through the bounded admission queue. Fails synchronously when
    /// the queue is full; the caller decides what dropping the task means.
    pub fn execute(&self, task: PoolTask) -> Result<(), PoolSaturated> {
        if self.inner.shutting_down.load(Ordering::SeqCst) {
            return Err(PoolSaturated);
        }
        let sender = match self.inner.queue_tx.lock().clone() {
            Some(sender) => sender,
            None => return Err(PoolSaturated),
        };
        self.inner.queued.fetch_add(1, Ordering::SeqCst);
        match sender.try_send(task) {
            Ok(()) => {
                Self::ensure_worker(&self.inner);
                Ok(())
            }
            Err(_) => {
                self.inner.queued.fetch_sub(1, Ordering::SeqCst);
                Err(PoolSaturated)
            }
        }
    }

    /// Submit through the unbounded retry path. Never refused while the
    /// pool is running; used only for resubmitting failed items.
    pub fn force_execute(&self, task: PoolTask) {
        let sender = match self.inner.forced_tx.lock().clone() {
            Some(sender) => sender,
            None => return,
        };
        self.inner.forced.fetch_add(1, Ordering::SeqCst);
        if sender.send(task).is_err() {
            self.inner.forced.fetch_sub(1, Ordering::SeqCst);
            return;
        }
        Self::ensure_worker(&self.inner);
    }

    /// Current number of live worker tasks.
    pub fn worker_count(&self) -> usize {
        self.inner.workers.load(Ordering::SeqCst)
    }

    /// Number of workers currently running a task.
    pub fn active_count(&self) -> usize {
        self.inner.active.load(Ordering::SeqCst)
    }

    /// Depth of the bounded admission queue.
    pub fn queue_depth(&self) -> usize {
        self.inner.queued.load(Ordering::SeqCst)
    }

    /// Depth of the unbounded retry channel.
    pub fn forced_depth(&self) -> usize {
        self.inner.forced.load(Ordering::SeqCst)
    }

    /// Configured worker ceiling.
    pub fn max_workers(&self) -> usize {
        self.inner.config.max_workers
    }

    /// Configured admission-queue capacity.
    pub fn max_queue(&self) -> usize {
        self.inner.config.max_queue
    }

    /// Stop intake, drain both channels, and join every worker. Exceeding
    /// `grace` is an error; the process has no safe way to continue with
    /// stuck workers.
    pub async fn shutdown(&self, grace: Duration) -> anyhow::Result<()> {
        self.inner.shutting_down.store(true, Ordering::SeqCst);
        self.inner.queue_tx.lock().take();
        self.inner.forced_tx.lock().take();

        let handles = std::mem::take(&mut *self.inner.handles.lock());
        let drain = async {
            for handle in handles {
                let _ = handle.await;
            }
        };
        if tokio::time::timeout(grace, drain).await.is_err() {
            anyhow::bail!(
                "work pool failed to drain within {}s",
                grace.as_secs()
            );
        }
        Ok(())
    }

    fn ensure_worker(inner: &Arc<PoolInner>) {
        loop {
            let workers = inner.workers.load(Ordering::SeqCst);
            if workers >= inner.config.max_workers {
                return;
            }
            let active = inner.active.load(Ordering::SeqCst);
            let idle = workers.saturating_sub(active);
            let pending = inner.queued.load(Ordering::SeqCst)
                + inner.forced.load(Ordering::SeqCst);
            if pending <= idle {
                return;
            }
            if inner
                .workers
                .compare_exchange(
                    workers,
                    workers + 1,
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                )
                .is_ok()
            {
                let worker_inner = Arc::clone(inner);
                let handle = tokio::spawn(Self::worker_loop(worker_inner));
                inner.handles.lock().push(handle);
                return;
            }
        }
    }

    async fn worker_loop(inner: Arc<PoolInner>) {
        let mut forced_open = true;
        let mut queued_open = true;
        while forced_open || queued_open {
            let pulled = tokio::select! {
                biased;
                task = Self::recv_forced(&inner), if forced_open => {
                    match task {
                        Some(task) => Pulled::Task(task),
                        None => Pulled::ForcedClosed,
                    }
                }
                task = Self::recv_queued(&inner), if queued_open => {
                    match task {
                        Some(task) => Pulled::Task(task),
                        None => Pulled::QueuedClosed,
                    }
                }
                () = tokio::time::sleep(inner.config.idle_expiration) => {
                    Pulled::Idle
                }
            };
            match pulled {
                Pulled::Task(task) => {
                    inner.active.fetch_add(1, Ordering::SeqCst);
                    task.await;
                    inner.active.fetch_sub(1, Ordering::SeqCst);
                }
                Pulled::ForcedClosed => forced_open = false,
                Pulled::QueuedClosed => queued_open = false,
                Pulled::Idle => break,
            }
        }
        inner.workers.fetch_sub(1, Ordering::SeqCst);
        // An item may have been admitted while this worker was deciding to
        // exit; make sure someone is left to run it.
        let pending = inner.queued.load(Ordering::SeqCst)
            + inner.forced.load(Ordering::SeqCst);
        if pending > 0 && !inner.shutting_down.load(Ordering::SeqCst) {
            Self::ensure_worker(&inner);
        }
    }

    async fn recv_forced(inner: &PoolInner) -> Option<PoolTask> {
        let mut rx = inner.forced_rx.lock().await;
        let task = rx.recv().await;
        if task.is_some() {
            inner.forced.fetch_sub(1, Ordering::SeqCst);
        }
        task
    }

    async fn recv_queued(inner: &PoolInner) -> Option<PoolTask> {
        let mut rx = inner.queue_rx.lock().await;
        let task = rx.recv().await;
        if task.is_some() {
            inner.queued.fetch_sub(1, Ordering::SeqCst);
        }
        task
    }
}

enum Pulled {
    Task(PoolTask),
    ForcedClosed,
    QueuedClosed,
    Idle,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::Notify;
    use tokio::time::timeout;

    fn counting_task(counter: Arc<AtomicUsize>) -> PoolTask {
        Box::pin(async move {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    fn blocking_task(release: Arc<Notify>) -> PoolTask {
        Box::pin(async move {
            release.notified().await;
        })
    }

    async fn wait_until(mut check: impl FnMut() -> bool) {
        timeout(Duration::from_secs(5), async {
            while !check() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    fn small_pool(max_workers: usize, max_queue: usize) -> BoundedWorkPool {
        BoundedWorkPool::new(WorkPoolConfig {
            max_workers,
            max_queue,
            idle_expiration: Duration::from_secs(60),
        })
    }

    #[tokio::test]
    async fn test_tasks_run() {
        let pool = small_pool(4, 4);
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..4 {
            pool.execute(counting_task(Arc::clone(&counter))).unwrap();
        }
        wait_until(|| counter.load(Ordering::SeqCst) == 4).await;
        pool.shutdown(Duration::from_secs(5)).await.unwrap();
    }

    #[tokio::test]
    async fn test_execute_refused_when_queue_full() {
        let pool = small_pool(1, 2);
        let release = Arc::new(Notify::new());
        let counter = Arc::new(AtomicUsize::new(0));

        // Occupy the single worker, then fill the admission queue.
        pool.execute(blocking_task(Arc::clone(&release))).unwrap();
        wait_until(|| pool.active_count() == 1).await;
        pool.execute(counting_task(Arc::clone(&counter))).unwrap();
        pool.execute(counting_task(Arc::clone(&counter))).unwrap();
        wait_until(|| pool.queue_depth() == 2).await;

        assert!(pool.execute(counting_task(Arc::clone(&counter))).is_err());

        wait_until(|| {
            release.notify_waiters();
            counter.load(Ordering::SeqCst) == 2
        })
        .await;
        pool.shutdown(Duration::from_secs(5)).await.unwrap();
    }

    #[tokio::test]
    async fn test_force_execute_bypasses_bound() {
        let pool = small_pool(1, 1);
        let release = Arc::new(Notify::new());
        let counter = Arc::new(AtomicUsize::new(0));

        pool.execute(blocking_task(Arc::clone(&release))).unwrap();
        wait_until(|| pool.active_count() == 1).await;
        pool.execute(counting_task(Arc::clone(&counter))).unwrap();
        assert!(pool.execute(counting_task(Arc::clone(&counter))).is_err());

        // The retry path is never refused.
        for _ in 0..5 {
            pool.force_execute(counting_task(Arc::clone(&counter)));
        }
        assert_eq!(pool.forced_depth(), 5);

        wait_until(|| {
            release.notify_waiters();
            counter.load(Ordering::SeqCst) == 6
        })
        .await;
        pool.shutdown(Duration::from_secs(5)).await.unwrap();
    }

    #[tokio::test]
    async fn test_worker_ceiling_respected() {
        let pool = small_pool(2, 100);
        let release = Arc::new(Notify::new());
        for _ in 0..10 {
            pool.execute(blocking_task(Arc::clone(&release))).unwrap();
        }
        wait_until(|| pool.active_count() == 2).await;
        assert!(pool.worker_count() <= 2);
        assert_eq!(pool.active_count(), 2);

        // Each wake releases at most the current pair; keep notifying until
        // the backlog fully drains.
        wait_until(|| {
            release.notify_waiters();
            pool.queue_depth() == 0 && pool.active_count() == 0
        })
        .await;
        pool.shutdown(Duration::from_secs(5)).await.unwrap();
    }

    #[tokio::test]
    async fn test_idle_workers_reclaimed() {
        let pool = BoundedWorkPool::new(WorkPoolConfig {
            max_workers: 4,
            max_queue: 4,
            idle_expiration: Duration::from_millis(50),
        });
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..4 {
            pool.execute(counting_task(Arc::clone(&counter))).unwrap();
        }
        wait_until(|| counter.load(Ordering::SeqCst) == 4).await;
        wait_until(|| pool.worker_count() == 0).await;
        pool.shutdown(Duration::from_secs(5)).await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_drains_queued_tasks() {
        let pool = small_pool(2, 10);
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..10 {
            pool.execute(counting_task(Arc::clone(&counter))).unwrap();
        }
        pool.shutdown(Duration::from_secs(5)).await.unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 10);
        assert!(pool.execute(counting_task(counter)).is_err());
    }

    #[tokio::test]
    async fn test_shutdown_times_out_on_stuck_worker() {
        let pool = small_pool(1, 1);
        let never = Arc::new(Notify::new());
        pool.execute(blocking_task(never)).unwrap();
        wait_until(|| pool.active_count() == 1).await;

        let result = pool.shutdown(Duration::from_millis(100)).await;
        assert!(result.is_err());
    }
}
