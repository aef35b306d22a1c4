//! Bounded worker pool with idle expiry, used by the gateways.
//!
//! - At most `max_workers` worker tasks exist at once. A new one is started on
//!   submit while below the limit.
//! - Jobs wait in a bounded queue. When it is full the submitting task runs
//!   the job itself, which naturally slows down the accept loop.
//! - A worker that sees no job for `idle_timeout` retires; the pool can
//!   shrink to zero and grows again on demand.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use flume::{Receiver, Sender, TrySendError};
use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::Notify;
use tokio::time::timeout;
use tracing::{debug, error, warn};

type Job = BoxFuture<'static, ()>;

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub max_workers: usize,
    pub idle_timeout: Duration,
    pub queue_capacity: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_workers: 10,
            idle_timeout: Duration::from_secs(30),
            queue_capacity: 100,
        }
    }
}

/// Cheap to clone; clones share the same workers and queue.
#[derive(Clone)]
pub struct WorkerPool {
    inner: Arc<Inner>,
}

struct Inner {
    config: PoolConfig,
    tx: Mutex<Option<Sender<Job>>>,
    rx: Receiver<Job>,
    live: AtomicUsize,
    drained: Notify,
}

impl WorkerPool {
    pub fn new(config: PoolConfig) -> Self {
        let (tx, rx) = flume::bounded(config.queue_capacity);
        Self {
            inner: Arc::new(Inner {
                config,
                tx: Mutex::new(Some(tx)),
                rx,
                live: AtomicUsize::new(0),
                drained: Notify::new(),
            }),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Worker tasks currently alive (busy or idle).
    pub fn live_workers(&self) -> usize {
        self.inner.live.load(Ordering::SeqCst)
    }

    /// Hands a job to the pool, or runs it on the calling task if the queue is
    /// full. Jobs submitted after [`WorkerPool::shutdown`] are dropped.
    pub async fn submit<F>(&self, job: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let job: Job = Box::pin(job);
        let Some(tx) = self.sender() else {
            warn!("worker pool is shut down; dropping job");
            return;
        };

        match tx.try_send(job) {
            Ok(()) => {
                if self.inner.try_reserve_worker() {
                    tokio::spawn(run_worker(Arc::clone(&self.inner)));
                }
            }
            Err(TrySendError::Full(job)) => {
                debug!("worker queue full; running job on caller");
                run_job(job).await;
            }
            Err(TrySendError::Disconnected(_)) => {
                warn!("worker pool is shut down; dropping job");
            }
        }
    }

    /// Stops accepting jobs and waits up to `grace` for queued and running
    /// jobs to finish. Returns `false` if the grace period ran out first.
    pub async fn shutdown(&self, grace: Duration) -> bool {
        self.inner
            .tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        let drained = async {
            loop {
                let notified = self.inner.drained.notified();
                if self.live_workers() == 0 {
                    return;
                }
                notified.await;
            }
        };
        let finished = timeout(grace, drained).await.is_ok();
        if !finished {
            warn!(live = self.live_workers(), ?grace, "worker pool did not drain in time");
        }
        finished
    }

    fn sender(&self) -> Option<Sender<Job>> {
        self.inner
            .tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl Inner {
    /// Claims a worker slot if the pool is below its limit.
    fn try_reserve_worker(&self) -> bool {
        self.live
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |live| {
                (live < self.config.max_workers).then_some(live + 1)
            })
            .is_ok()
    }
}

async fn run_worker(inner: Arc<Inner>) {
    loop {
        serve_until_idle(&inner).await;
        inner.live.fetch_sub(1, Ordering::SeqCst);

        // A job can land in the queue between our idle timeout and the
        // decrement above; whoever submitted it saw us as still alive.
        if inner.rx.is_empty() || !inner.try_reserve_worker() {
            break;
        }
    }

    if inner.live.load(Ordering::SeqCst) == 0 {
        inner.drained.notify_waiters();
    }
}

async fn serve_until_idle(inner: &Inner) {
    loop {
        match timeout(inner.config.idle_timeout, inner.rx.recv_async()).await {
            Ok(Ok(job)) => run_job(job).await,
            // Queue closed and empty.
            Ok(Err(_)) => return,
            Err(_) => {
                debug!("worker idle; retiring");
                return;
            }
        }
    }
}

async fn run_job(job: Job) {
    if AssertUnwindSafe(job).catch_unwind().await.is_err() {
        error!("worker job panicked");
    }
}
