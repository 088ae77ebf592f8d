//! Interval trigger for cycle executors
//!
//! A small host loop that fires [`CycleExecutor::execute`] on a fixed
//! interval until its shutdown token is cancelled. Hosts with their own
//! scheduler (cron expressions, external job systems) call `execute` directly
//! and do not need this module.
//!
//! # Features
//!
//! - Fixed-interval firing, optionally starting with an immediate cycle
//! - Missed ticks are skipped, never bursted
//! - Graceful shutdown: a running cycle finishes before the loop exits
//! - Stop on any future, or on SIGTERM/SIGINT via [`IntervalTrigger::run_until_signal`]
//!
//! # Example
//!
//! ```no_run
//! use cycle_runner::{CycleExecutor, CycleJob, IntervalTrigger, TriggerConfig};
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example<J: CycleJob>(executor: Arc<CycleExecutor<J>>) {
//! let shutdown = CancellationToken::new();
//! let trigger = IntervalTrigger::new(Arc::clone(&executor), TriggerConfig::default());
//! let handle = tokio::spawn(trigger.run(shutdown.clone()));
//!
//! // ... later, from elsewhere in the host
//! shutdown.cancel();
//! let stats = handle.await;
//!
//! // Or let a termination signal stop it
//! let stats = IntervalTrigger::new(executor, TriggerConfig::default())
//!     .run_until_signal()
//!     .await;
//! # }
//! ```

use crate::config::TriggerConfig;
use crate::executor::CycleExecutor;
use crate::job::CycleJob;
use crate::types::{CycleContext, CycleOutcome};
use std::future::Future;
use std::sync::Arc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Counters returned when an [`IntervalTrigger`] stops
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TriggerStats {
    /// Number of times the trigger fired
    pub fired: u64,
    /// Cycles that ran to completion
    pub completed: u64,
    /// Fires skipped because a cycle was already running
    pub skipped: u64,
    /// Cycles that ended with a hook or snapshot failure
    pub failed: u64,
}

/// Fires cycles of one executor at a fixed interval
pub struct IntervalTrigger<J: CycleJob> {
    executor: Arc<CycleExecutor<J>>,
    config: TriggerConfig,
}

impl<J: CycleJob> IntervalTrigger<J> {
    /// Creates a new interval trigger
    ///
    /// # Parameters
    /// - `executor`: The executor to fire; may be shared with other triggers
    /// - `config`: Interval, first-fire behavior and trigger name
    pub fn new(executor: Arc<CycleExecutor<J>>, config: TriggerConfig) -> Self {
        Self { executor, config }
    }

    /// Runs the trigger loop until `shutdown` is cancelled
    ///
    /// Every tick builds a fresh [`CycleContext`] carrying the trigger name and
    /// fire count, then awaits the cycle. Cycle failures are logged and the
    /// loop keeps going; the next tick starts a new cycle.
    pub async fn run(self, shutdown: CancellationToken) -> TriggerStats {
        info!(
            trigger = %self.config.name,
            interval_ms = self.config.interval.as_millis() as u64,
            "Interval trigger started"
        );

        let period = self.config.interval;
        let first_tick = if self.config.fire_on_start {
            Instant::now()
        } else {
            Instant::now() + period
        };
        let mut interval = tokio::time::interval_at(first_tick, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let mut stats = TriggerStats::default();

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!(trigger = %self.config.name, "Interval trigger shutting down");
                    break;
                }
                _ = interval.tick() => {}
            }

            // Cancellation may race with the tick; don't start a cycle after shutdown
            if shutdown.is_cancelled() {
                break;
            }

            stats.fired += 1;
            let ctx = CycleContext::new(self.config.name.clone())
                .with_metadata("fire_count", serde_json::json!(stats.fired));

            match self.executor.execute(ctx).await {
                Ok(CycleOutcome::Completed(report)) => {
                    stats.completed += 1;
                    debug!(
                        trigger = %self.config.name,
                        cycle_id = report.cycle_id.0,
                        "Triggered cycle finished"
                    );
                }
                Ok(CycleOutcome::Skipped) => {
                    stats.skipped += 1;
                }
                Err(e) => {
                    stats.failed += 1;
                    error!(
                        trigger = %self.config.name,
                        error = %e,
                        "Triggered cycle failed"
                    );
                }
            }
        }

        info!(
            trigger = %self.config.name,
            fired = stats.fired,
            completed = stats.completed,
            skipped = stats.skipped,
            failed = stats.failed,
            "Interval trigger stopped"
        );
        stats
    }

    /// Runs the trigger loop until `stop` resolves
    ///
    /// A cycle in progress when `stop` resolves still runs to completion.
    pub async fn run_until<F>(self, stop: F) -> TriggerStats
    where
        F: Future<Output = ()>,
    {
        let shutdown = CancellationToken::new();
        let run = self.run(shutdown.clone());
        tokio::pin!(run);

        tokio::select! {
            stats = &mut run => stats,
            _ = stop => {
                shutdown.cancel();
                (&mut run).await
            }
        }
    }

    /// Runs the trigger loop until the process receives a termination signal
    pub async fn run_until_signal(self) -> TriggerStats {
        let name = self.config.name.clone();
        self.run_until(async move {
            shutdown_signal().await;
            info!(trigger = %name, "Stopping trigger on termination signal");
        })
        .await
    }
}

/// Resolves on the first termination signal
///
/// SIGTERM or SIGINT on unix, Ctrl+C elsewhere. If no signal can be listened
/// for, the error is logged and the future never resolves, so a trigger
/// waiting on it keeps running instead of stopping at once.
pub async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = terminate.recv() => info!(signal = "SIGTERM", "Termination signal received"),
                    _ = interrupt() => {}
                }
                return;
            }
            Err(e) => {
                warn!(error = %e, "Cannot listen for SIGTERM, waiting for interrupt only");
            }
        }
    }

    interrupt().await;
}

async fn interrupt() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!(signal = "SIGINT", "Termination signal received"),
        Err(e) => {
            error!(error = %e, "Cannot listen for interrupt signal");
            std::future::pending::<()>().await;
        }
    }
}
