//! Cycle orchestration
//!
//! [`CycleExecutor`] runs one cycle of a [`CycleJob`] per accepted trigger:
//!
//! ```text
//! execute(ctx)
//!   └─ guard.try_acquire()  ── taken ──▶ Skipped (no hooks, no snapshot)
//!        ├─ items of an earlier cycle still running ──▶ Skipped
//!        │
//!        ├─ on_start(ctx)                         [Starting]
//!        ├─ snapshot()
//!        ├─ submit every item to a fresh pool     [Dispatching]
//!        ├─ wait_all(drain_timeout)               [Draining]
//!        ├─ pool shutdown(drain_timeout)
//!        ├─ on_end()
//!        └─ guard released                        [Idle]
//! ```
//!
//! The guard is held through a scoped permit, so it is released on every
//! path out of a cycle: success, hook or snapshot failure, and unwinding.
//! The caller's future stays pending for the whole cycle.
//!
//! An abandoned item that ignores its cancellation token can outlive the
//! shutdown grace period. Until it returns, new triggers are skipped, so
//! `process_item` calls never exceed the worker limit and never span two
//! cycles.
//!
//! # Example
//!
//! ```no_run
//! use async_trait::async_trait;
//! use cycle_runner::{CycleConfig, CycleContext, CycleExecutor, CycleJob, CycleOutcome, Result};
//! use tokio_util::sync::CancellationToken;
//!
//! struct Pages;
//!
//! #[async_trait]
//! impl CycleJob for Pages {
//!     type Item = u32;
//!
//!     async fn snapshot(&self) -> Result<Vec<u32>> {
//!         Ok((1..=10).collect())
//!     }
//!
//!     async fn process_item(&self, page: u32, _cancel: CancellationToken) -> Result<()> {
//!         tracing::info!(page, "Crawling page");
//!         Ok(())
//!     }
//! }
//!
//! # async fn example() -> Result<()> {
//! let executor = CycleExecutor::new(Pages, CycleConfig::default())?;
//!
//! match executor.execute(CycleContext::new("manual")).await? {
//!     CycleOutcome::Completed(report) => println!("{} items done", report.completed),
//!     CycleOutcome::Skipped => println!("previous cycle still running"),
//! }
//! # Ok(())
//! # }
//! ```

use crate::config::CycleConfig;
use crate::error::{Error, HookKind, Result};
use crate::guard::CycleGuard;
use crate::job::CycleJob;
use crate::pool::{DrainReport, ItemOutcome, WorkerPool};
use crate::types::{
    CycleContext, CycleEvent, CycleId, CycleOutcome, CycleReport, CycleState, ItemFailure,
};
use chrono::Utc;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU64, AtomicUsize, Ordering};
use std::time::Instant;
use tokio::sync::{RwLock, broadcast};
use tracing::{debug, error, info, warn};

/// Capacity of the event broadcast channel
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Runs cycles of one job, never more than one at a time
///
/// Share it behind an `Arc` to fire `execute` from several trigger tasks; a
/// trigger that arrives while a cycle runs is skipped.
pub struct CycleExecutor<J: CycleJob> {
    job: Arc<J>,
    /// Read once at the start of each cycle; updates apply to the next one
    config: RwLock<CycleConfig>,
    guard: CycleGuard,
    state: AtomicU8,
    last_cycle_id: AtomicU64,
    /// `process_item` calls currently running, including abandoned ones
    items_in_flight: Arc<AtomicUsize>,
    event_tx: broadcast::Sender<CycleEvent>,
}

/// Counts one running `process_item` call; the count drops on return or unwind
struct InFlight(Arc<AtomicUsize>);

impl InFlight {
    fn enter(counter: Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::AcqRel);
        Self(counter)
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Resets the executor state to idle when a cycle ends, however it ends
struct StateReset<'a>(&'a AtomicU8);

impl Drop for StateReset<'_> {
    fn drop(&mut self) {
        self.0.store(CycleState::Idle.to_u8(), Ordering::Release);
    }
}

impl<J: CycleJob> CycleExecutor<J> {
    /// Create an executor for `job`
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the configuration fails validation.
    pub fn new(job: J, config: CycleConfig) -> Result<Self> {
        Self::with_shared_job(Arc::new(job), config)
    }

    /// Create an executor for a job that is also used elsewhere
    pub fn with_shared_job(job: Arc<J>, config: CycleConfig) -> Result<Self> {
        config.validate()?;
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        info!(
            job = job.name(),
            max_worker_threads = config.max_worker_threads,
            worker_limit = config.worker_limit(),
            drain_timeout_ms = config.drain_timeout.as_millis() as u64,
            "Cycle executor created"
        );

        Ok(Self {
            job,
            config: RwLock::new(config),
            guard: CycleGuard::new(),
            state: AtomicU8::new(CycleState::Idle.to_u8()),
            last_cycle_id: AtomicU64::new(0),
            items_in_flight: Arc::new(AtomicUsize::new(0)),
            event_tx,
        })
    }

    /// The job driven by this executor
    pub fn job(&self) -> &Arc<J> {
        &self.job
    }

    /// Subscribe to cycle events
    pub fn subscribe(&self) -> broadcast::Receiver<CycleEvent> {
        self.event_tx.subscribe()
    }

    /// Current state of the cycle state machine
    pub fn state(&self) -> CycleState {
        CycleState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Whether a cycle currently holds the guard
    pub fn is_running(&self) -> bool {
        self.guard.is_running()
    }

    /// Number of `process_item` calls currently running
    ///
    /// Non-zero while idle only when abandoned items are still finishing.
    pub fn items_in_flight(&self) -> usize {
        self.items_in_flight.load(Ordering::Acquire)
    }

    /// Number of cycles accepted so far
    pub fn cycles_started(&self) -> u64 {
        self.last_cycle_id.load(Ordering::Relaxed)
    }

    /// Current configuration
    pub async fn config(&self) -> CycleConfig {
        self.config.read().await.clone()
    }

    /// Replace the configuration
    ///
    /// A cycle that is already running keeps the settings it started with.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] and keeps the old settings if validation fails.
    pub async fn update_config(&self, config: CycleConfig) -> Result<()> {
        config.validate()?;
        info!(
            job = self.job.name(),
            max_worker_threads = config.max_worker_threads,
            drain_timeout_ms = config.drain_timeout.as_millis() as u64,
            idle_timeout_ms = config.idle_timeout.as_millis() as u64,
            deferred = self.is_running(),
            "Cycle configuration updated"
        );
        *self.config.write().await = config;
        Ok(())
    }

    /// Run one cycle, or skip it if another cycle is running
    ///
    /// Also skips while items abandoned by an earlier cycle are still
    /// running. Resolves when the cycle has finished: every item completed,
    /// failed or was abandoned at the drain timeout, and `on_end` ran.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Hook`] or [`Error::Snapshot`] when a hook or the
    /// snapshot producer failed. Item failures are never returned here; they
    /// are counted in the [`CycleReport`]. The guard is released in all cases.
    pub async fn execute(&self, ctx: CycleContext) -> Result<CycleOutcome> {
        let Some(_permit) = self.guard.try_acquire() else {
            debug!(
                job = self.job.name(),
                trigger = %ctx.trigger,
                "Cycle already running, skipping trigger"
            );
            self.emit_event(CycleEvent::CycleSkipped {
                trigger: ctx.trigger.clone(),
            });
            return Ok(CycleOutcome::Skipped);
        };
        // Nothing can start new items while we hold the guard, so this only shrinks
        let stragglers = self.items_in_flight();
        if stragglers > 0 {
            warn!(
                job = self.job.name(),
                trigger = %ctx.trigger,
                stragglers,
                "Abandoned items from an earlier cycle still running, skipping trigger"
            );
            self.emit_event(CycleEvent::CycleSkipped {
                trigger: ctx.trigger.clone(),
            });
            return Ok(CycleOutcome::Skipped);
        }
        // Dropped before the permit, so observers never see a free guard
        // together with a non-idle state
        let _state_reset = StateReset(&self.state);

        let cycle_id = CycleId(self.last_cycle_id.fetch_add(1, Ordering::Relaxed) + 1);
        let config = self.config.read().await.clone();
        let started_at = Utc::now();
        let start = Instant::now();

        self.set_state(CycleState::Starting);
        info!(
            job = self.job.name(),
            cycle_id = cycle_id.0,
            trigger = %ctx.trigger,
            "Cycle started"
        );
        self.emit_event(CycleEvent::CycleStarted {
            cycle_id,
            trigger: ctx.trigger.clone(),
        });

        let drained = self.run_cycle(cycle_id, &ctx, &config).await;

        // Runs once per accepted cycle, whether or not the body succeeded
        let ended = self
            .job
            .on_end()
            .await
            .map_err(|e| Error::hook(HookKind::End, e));

        let result = match (drained, ended) {
            (Ok((total, drain)), Ok(())) => {
                let report = self.build_report(cycle_id, started_at, start, total, drain);
                info!(
                    job = self.job.name(),
                    cycle_id = cycle_id.0,
                    total = report.total,
                    completed = report.completed,
                    failed = report.failed,
                    abandoned = report.abandoned,
                    elapsed_ms = report.elapsed_ms,
                    "Cycle completed"
                );
                Ok(report)
            }
            (Err(e), ended) => {
                if let Err(end_err) = ended {
                    warn!(
                        job = self.job.name(),
                        cycle_id = cycle_id.0,
                        error = %end_err,
                        "End hook also failed"
                    );
                }
                Err(e)
            }
            (Ok(_), Err(e)) => Err(e),
        };

        match result {
            Ok(report) => {
                self.emit_event(CycleEvent::CycleCompleted {
                    report: report.clone(),
                });
                Ok(CycleOutcome::Completed(report))
            }
            Err(e) => {
                error!(
                    job = self.job.name(),
                    cycle_id = cycle_id.0,
                    code = e.error_code(),
                    error = %e,
                    "Cycle failed"
                );
                self.emit_event(CycleEvent::CycleFailed {
                    cycle_id,
                    code: e.error_code().to_string(),
                    error: e.to_string(),
                });
                Err(e)
            }
        }
    }

    /// Start hook, snapshot, fan-out and drain
    ///
    /// Returns the snapshot size and the collected item outcomes.
    async fn run_cycle(
        &self,
        cycle_id: CycleId,
        ctx: &CycleContext,
        config: &CycleConfig,
    ) -> Result<(usize, DrainReport)> {
        self.job
            .on_start(ctx)
            .await
            .map_err(|e| Error::hook(HookKind::Start, e))?;

        let items = self.job.snapshot().await.map_err(Error::snapshot)?;
        let total = items.len();

        self.set_state(CycleState::Dispatching);
        debug!(
            cycle_id = cycle_id.0,
            items = total,
            worker_limit = config.worker_limit(),
            "Dispatching snapshot"
        );
        self.emit_event(CycleEvent::Dispatching {
            cycle_id,
            items: total,
        });

        let pool = WorkerPool::new(config.pool_config());
        let handles: Vec<_> = items
            .into_iter()
            .map(|item| {
                let job = Arc::clone(&self.job);
                let counter = Arc::clone(&self.items_in_flight);
                pool.submit(item, move |item, cancel| async move {
                    let _in_flight = InFlight::enter(counter);
                    job.process_item(item, cancel).await
                })
            })
            .collect();

        self.set_state(CycleState::Draining);
        let drain = pool.wait_all(handles, config.drain_timeout).await;
        let stragglers = pool.shutdown(config.drain_timeout).await;
        if stragglers > 0 {
            warn!(
                cycle_id = cycle_id.0,
                stragglers,
                "Abandoned items ignored cancellation; triggers are skipped until they return"
            );
        }

        Ok((total, drain))
    }

    fn build_report(
        &self,
        cycle_id: CycleId,
        started_at: chrono::DateTime<Utc>,
        start: Instant,
        total: usize,
        drain: DrainReport,
    ) -> CycleReport {
        let mut report = CycleReport {
            cycle_id,
            started_at,
            elapsed_ms: start.elapsed().as_millis() as u64,
            total,
            completed: 0,
            failed: 0,
            abandoned: 0,
            drain_timed_out: drain.timed_out,
            failures: Vec::new(),
        };

        for (index, outcome) in drain.outcomes {
            match outcome {
                ItemOutcome::Completed => report.completed += 1,
                ItemOutcome::Abandoned => report.abandoned += 1,
                ItemOutcome::Failed(e) => {
                    warn!(
                        job = self.job.name(),
                        cycle_id = cycle_id.0,
                        index,
                        code = e.error_code(),
                        error = %e,
                        "Item failed"
                    );
                    let error = e.to_string();
                    self.emit_event(CycleEvent::ItemFailed {
                        cycle_id,
                        index,
                        error: error.clone(),
                    });
                    report.failed += 1;
                    report.failures.push(ItemFailure { index, error });
                }
            }
        }

        report
    }

    fn set_state(&self, state: CycleState) {
        self.state.store(state.to_u8(), Ordering::Release);
    }

    fn emit_event(&self, event: CycleEvent) {
        // send() returns Err if there are no receivers, which is fine - we just drop the event
        self.event_tx.send(event).ok();
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests;
