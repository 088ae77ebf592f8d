//! # cycle-runner
//!
//! Core for periodically-triggered batch work. A trigger fires a cycle; the
//! cycle captures a snapshot of work items, processes them concurrently through
//! a bounded worker pool, and resolves only when every item has finished.
//! Overlapping cycles of the same executor are never allowed: a trigger that
//! arrives while a cycle runs is skipped.
//!
//! ## Design Philosophy
//!
//! - **One cycle at a time** - Each executor owns its own re-entrancy guard
//! - **Isolation over reuse** - Every cycle gets a fresh worker pool
//! - **Failures stay local** - An item that errors or panics never aborts its siblings
//! - **Cooperative shutdown** - Stragglers get a cancellation token, never a forced kill
//!
//! ## Quick Start
//!
//! ```no_run
//! use async_trait::async_trait;
//! use cycle_runner::{CycleConfig, CycleContext, CycleExecutor, CycleJob, Result};
//! use tokio_util::sync::CancellationToken;
//!
//! struct FeedJob;
//!
//! #[async_trait]
//! impl CycleJob for FeedJob {
//!     type Item = String;
//!
//!     async fn snapshot(&self) -> Result<Vec<String>> {
//!         Ok(vec!["https://example.com/feed.xml".to_string()])
//!     }
//!
//!     async fn process_item(&self, url: String, _cancel: CancellationToken) -> Result<()> {
//!         tracing::info!(%url, "Extracting");
//!         Ok(())
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let executor = CycleExecutor::new(FeedJob, CycleConfig::default())?;
//!
//!     // Subscribe to events
//!     let mut events = executor.subscribe();
//!     tokio::spawn(async move {
//!         while let Ok(event) = events.recv().await {
//!             println!("Event: {:?}", event);
//!         }
//!     });
//!
//!     executor.execute(CycleContext::new("manual")).await?;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

/// Configuration types
pub mod config;
/// Error types
pub mod error;
/// Cycle orchestration
pub mod executor;
/// Re-entrancy guard
pub mod guard;
/// Job contract
pub mod job;
/// Bounded worker pool
pub mod pool;
/// Interval trigger
pub mod trigger;
/// Core types and events
pub mod types;

// Re-export commonly used types
pub use config::{Config, CycleConfig, TriggerConfig};
pub use error::{BoxError, Error, HookKind, Result};
pub use executor::CycleExecutor;
pub use guard::{CycleGuard, GuardPermit};
pub use job::CycleJob;
pub use pool::{DrainReport, ItemHandle, ItemOutcome, PoolConfig, WorkerPool};
pub use trigger::{IntervalTrigger, TriggerStats, shutdown_signal};
pub use types::{
    CycleContext, CycleEvent, CycleId, CycleOutcome, CycleReport, CycleState, ItemFailure,
};
