//! Bounded worker pool for one cycle
//!
//! The pool runs at most `max_workers` items at once. Workers are spawned
//! lazily as items are submitted and exit after sitting idle for
//! `idle_timeout`; a later submission spawns a replacement. Each cycle builds
//! a fresh pool and shuts it down after the drain, so nothing a faulty item
//! leaves behind can leak into the next cycle.
//!
//! Every submitted item gets exactly one [`ItemOutcome`]. Errors and panics
//! raised by a processor are captured as [`ItemOutcome::Failed`] and never
//! reach sibling items or the caller of [`WorkerPool::wait_all`].
//!
//! Every queued item is started. The drain timeout only bounds how long
//! [`WorkerPool::wait_all`] waits for the items still in flight once the queue
//! is empty; [`WorkerPool::shutdown`] then gives cancelled stragglers a bounded
//! grace period to return.
//!
//! # Example
//!
//! ```no_run
//! use cycle_runner::pool::{PoolConfig, WorkerPool};
//! use std::time::Duration;
//!
//! # async fn example() {
//! let pool = WorkerPool::new(PoolConfig::default());
//!
//! let handles: Vec<_> = (0..10u32)
//!     .map(|n| {
//!         pool.submit(n, |n, _cancel| async move {
//!             tracing::info!(n, "processing");
//!             Ok(())
//!         })
//!     })
//!     .collect();
//!
//! let report = pool.wait_all(handles, Duration::from_secs(5)).await;
//! assert_eq!(report.completed(), 10);
//! pool.shutdown(Duration::from_secs(1)).await;
//! # }
//! ```

use crate::error::{Error, Result};
use futures::FutureExt;
use futures::future::BoxFuture;
use std::any::Any;
use std::collections::VecDeque;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{Notify, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Worker pool settings
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PoolConfig {
    /// Maximum number of items processed concurrently (clamped to at least 1)
    pub max_workers: usize,
    /// How long a worker waits for new work before exiting
    pub idle_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_workers: 8,
            idle_timeout: Duration::from_millis(3000),
        }
    }
}

/// Result of processing one submitted item
#[derive(Debug)]
pub enum ItemOutcome {
    /// The processor returned `Ok`
    Completed,
    /// The processor returned an error or panicked
    Failed(Error),
    /// The item was still running when the drain timeout elapsed, or never
    /// started because the pool was shut down
    Abandoned,
}

impl ItemOutcome {
    /// Whether the processor returned `Ok`
    pub fn is_completed(&self) -> bool {
        matches!(self, ItemOutcome::Completed)
    }

    /// Whether the processor returned an error or panicked
    pub fn is_failed(&self) -> bool {
        matches!(self, ItemOutcome::Failed(_))
    }

    /// Whether the item was abandoned
    pub fn is_abandoned(&self) -> bool {
        matches!(self, ItemOutcome::Abandoned)
    }
}

/// Handle to one submitted item, resolved by [`WorkerPool::wait_all`]
#[derive(Debug)]
pub struct ItemHandle {
    index: usize,
    rx: oneshot::Receiver<ItemOutcome>,
}

impl ItemHandle {
    /// Submission order of the item within its pool, starting at 0
    pub fn index(&self) -> usize {
        self.index
    }
}

/// Outcomes collected by [`WorkerPool::wait_all`]
#[derive(Debug)]
pub struct DrainReport {
    /// `(submission index, outcome)` for every handle, in handle order
    pub outcomes: Vec<(usize, ItemOutcome)>,
    /// Whether the drain timeout elapsed before the in-flight items resolved
    pub timed_out: bool,
}

impl DrainReport {
    /// Number of completed items
    pub fn completed(&self) -> usize {
        self.outcomes.iter().filter(|(_, o)| o.is_completed()).count()
    }

    /// Number of failed items
    pub fn failed(&self) -> usize {
        self.outcomes.iter().filter(|(_, o)| o.is_failed()).count()
    }

    /// Number of abandoned items
    pub fn abandoned(&self) -> usize {
        self.outcomes.iter().filter(|(_, o)| o.is_abandoned()).count()
    }
}

struct PoolState {
    queue: VecDeque<BoxFuture<'static, ()>>,
    live_workers: usize,
    closed: bool,
}

struct Shared {
    state: Mutex<PoolState>,
    work_ready: Notify,
    /// Signalled when a worker takes the last queued item
    queue_drained: Notify,
    /// Signalled whenever a worker exits
    worker_exited: Notify,
    max_workers: usize,
    idle_timeout: Duration,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, PoolState> {
        // Never held across a panic point, so a poisoned lock still has a valid state
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn retire_worker(&self, state: &mut PoolState) {
        state.live_workers -= 1;
        self.worker_exited.notify_waiters();
    }
}

/// Bounded-concurrency executor for the items of one cycle
///
/// Dropping the pool has the same effect as [`WorkerPool::shutdown`].
pub struct WorkerPool {
    shared: Arc<Shared>,
    cancel: CancellationToken,
    submitted: AtomicUsize,
}

impl WorkerPool {
    /// Create an empty pool; no workers run until the first submission
    pub fn new(config: PoolConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(PoolState {
                    queue: VecDeque::new(),
                    live_workers: 0,
                    closed: false,
                }),
                work_ready: Notify::new(),
                queue_drained: Notify::new(),
                worker_exited: Notify::new(),
                max_workers: config.max_workers.max(1),
                idle_timeout: config.idle_timeout,
            }),
            cancel: CancellationToken::new(),
            submitted: AtomicUsize::new(0),
        }
    }

    /// Concurrency bound of this pool
    pub fn max_workers(&self) -> usize {
        self.shared.max_workers
    }

    /// Number of worker tasks currently alive (busy or idle)
    pub fn live_workers(&self) -> usize {
        self.shared.lock().live_workers
    }

    /// Token cancelled when the drain times out or the pool shuts down
    ///
    /// Every processor receives a child of this token.
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Schedule one invocation of `processor(item, cancel)`
    ///
    /// The invocation starts as soon as a worker slot is free. Must be called
    /// from within a Tokio runtime.
    pub fn submit<T, F, Fut>(&self, item: T, processor: F) -> ItemHandle
    where
        T: Send + 'static,
        F: FnOnce(T, CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let index = self.submitted.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        let cancel = self.cancel.child_token();

        let task = async move {
            let run = AssertUnwindSafe(async move { processor(item, cancel).await });
            let outcome = match run.catch_unwind().await {
                Ok(Ok(())) => ItemOutcome::Completed,
                Ok(Err(e)) => ItemOutcome::Failed(e),
                Err(panic) => ItemOutcome::Failed(Error::ItemPanicked(panic_message(&*panic))),
            };
            // Receiver is gone if the drain already gave up on this item
            tx.send(outcome).ok();
        }
        .boxed();

        let spawn_worker = {
            let mut state = self.shared.lock();
            if state.closed {
                debug!(index, "Pool already shut down, item dropped");
                return ItemHandle { index, rx };
            }
            state.queue.push_back(task);
            if state.live_workers < self.shared.max_workers {
                state.live_workers += 1;
                true
            } else {
                false
            }
        };

        if spawn_worker {
            tokio::spawn(run_worker(Arc::clone(&self.shared)));
        }
        self.shared.work_ready.notify_one();

        ItemHandle { index, rx }
    }

    /// Wait for every handle to resolve
    ///
    /// Waits without limit until every queued item has been picked up by a
    /// worker, then up to `drain_timeout` for the items still in flight. On
    /// timeout the unresolved handles are reported as
    /// [`ItemOutcome::Abandoned`] and the pool's cancellation token is
    /// cancelled so stragglers can stop cooperatively. Items that finished
    /// while earlier handles were awaited are still collected.
    pub async fn wait_all(&self, handles: Vec<ItemHandle>, drain_timeout: Duration) -> DrainReport {
        self.wait_queue_drained().await;

        let deadline = tokio::time::Instant::now() + drain_timeout;
        let mut outcomes = Vec::with_capacity(handles.len());
        let mut timed_out = false;

        for ItemHandle { index, mut rx } in handles {
            let outcome = if timed_out {
                rx.try_recv().unwrap_or(ItemOutcome::Abandoned)
            } else {
                match tokio::time::timeout_at(deadline, &mut rx).await {
                    Ok(Ok(outcome)) => outcome,
                    // Sender dropped without running: the pool was closed first
                    Ok(Err(_)) => ItemOutcome::Abandoned,
                    Err(_) => {
                        timed_out = true;
                        ItemOutcome::Abandoned
                    }
                }
            };
            outcomes.push((index, outcome));
        }

        let report = DrainReport {
            outcomes,
            timed_out,
        };

        if timed_out {
            warn!(
                drain_timeout_ms = drain_timeout.as_millis() as u64,
                abandoned = report.abandoned(),
                "Drain timeout elapsed, cancelling unfinished items"
            );
            self.cancel.cancel();
        }

        report
    }

    /// Close the pool, then wait up to `grace` for its workers to exit
    ///
    /// Queued items that never started are dropped and resolve as abandoned.
    /// In-flight items are not aborted; they see their cancellation token
    /// fire and finish on their own. Returns the number of workers still
    /// running an item when `grace` elapsed.
    pub async fn shutdown(self, grace: Duration) -> usize {
        debug!(
            submitted = self.submitted.load(Ordering::Relaxed),
            "Shutting down worker pool"
        );
        self.close();

        let deadline = tokio::time::Instant::now() + grace;
        loop {
            let exited = self.shared.worker_exited.notified();
            tokio::pin!(exited);
            exited.as_mut().enable();

            let live = self.live_workers();
            if live == 0 {
                return 0;
            }
            if tokio::time::timeout_at(deadline, exited).await.is_err() {
                let live = self.live_workers();
                if live > 0 {
                    warn!(
                        stragglers = live,
                        grace_ms = grace.as_millis() as u64,
                        "Workers still busy after shutdown grace period"
                    );
                }
                return live;
            }
        }
    }

    async fn wait_queue_drained(&self) {
        loop {
            let drained = self.shared.queue_drained.notified();
            tokio::pin!(drained);
            drained.as_mut().enable();

            let queued = self.shared.lock().queue.len();
            if queued == 0 {
                return;
            }
            drained.await;
        }
    }

    fn close(&self) {
        let dropped: Vec<_> = {
            let mut state = self.shared.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            state.queue.drain(..).collect()
        };

        if !dropped.is_empty() {
            debug!(count = dropped.len(), "Dropping queued items that never started");
        }
        drop(dropped);

        self.cancel.cancel();
        self.shared.queue_drained.notify_waiters();
        self.shared.work_ready.notify_waiters();
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.close();
    }
}

async fn run_worker(shared: Arc<Shared>) {
    loop {
        let next = {
            let mut state = shared.lock();
            match state.queue.pop_front() {
                Some(task) => {
                    if state.queue.is_empty() {
                        shared.queue_drained.notify_waiters();
                    }
                    Some(task)
                }
                None if state.closed => {
                    shared.retire_worker(&mut state);
                    return;
                }
                None => None,
            }
        };

        if let Some(task) = next {
            task.await;
            continue;
        }

        // Register before re-checking, so a submit or close in between still wakes us
        let notified = shared.work_ready.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        {
            let state = shared.lock();
            if state.closed || !state.queue.is_empty() {
                continue;
            }
        }

        if tokio::time::timeout(shared.idle_timeout, notified).await.is_err() {
            let mut state = shared.lock();
            if state.queue.is_empty() {
                shared.retire_worker(&mut state);
                debug!(
                    live_workers = state.live_workers,
                    "Idle pool worker exiting"
                );
                return;
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
