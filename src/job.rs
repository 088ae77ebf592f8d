//! The job contract implemented by callers
//!
//! A [`CycleJob`] supplies the snapshot producer, the item processor, and two
//! optional lifecycle hooks. The executor calls them in a fixed order for
//! every accepted cycle:
//!
//! 1. [`on_start`](CycleJob::on_start) with the trigger's context
//! 2. [`snapshot`](CycleJob::snapshot), exactly once
//! 3. [`process_item`](CycleJob::process_item) once per snapshot item,
//!    concurrently, bounded by `max_worker_threads`
//! 4. [`on_end`](CycleJob::on_end), after every item finished or was abandoned
//!
//! # Example
//!
//! ```no_run
//! use async_trait::async_trait;
//! use cycle_runner::{CycleContext, CycleJob, Result};
//! use tokio_util::sync::CancellationToken;
//!
//! struct FeedJob {
//!     feeds: Vec<String>,
//! }
//!
//! #[async_trait]
//! impl CycleJob for FeedJob {
//!     type Item = String;
//!
//!     async fn snapshot(&self) -> Result<Vec<String>> {
//!         Ok(self.feeds.clone())
//!     }
//!
//!     async fn process_item(&self, url: String, cancel: CancellationToken) -> Result<()> {
//!         if cancel.is_cancelled() {
//!             return Ok(());
//!         }
//!         tracing::info!(%url, "Extracting feed");
//!         Ok(())
//!     }
//! }
//! ```

use crate::error::Result;
use crate::types::CycleContext;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

/// Periodic batch job driven by a [`CycleExecutor`](crate::executor::CycleExecutor)
///
/// Implementations must tolerate `process_item` running concurrently for
/// different items of the same cycle; the executor adds no serialization.
#[async_trait]
pub trait CycleJob: Send + Sync + 'static {
    /// One unit of work; never inspected by the executor
    type Item: Send + 'static;

    /// Called once per accepted cycle, before the snapshot is taken
    ///
    /// An error ends the cycle early without taking a snapshot.
    async fn on_start(&self, _ctx: &CycleContext) -> Result<()> {
        Ok(())
    }

    /// Produce the items for this cycle
    ///
    /// Called exactly once per accepted cycle. An empty snapshot is valid:
    /// no item is dispatched but both hooks still run. No timeout is applied,
    /// so an implementation that hangs holds the cycle (and the guard) with it.
    async fn snapshot(&self) -> Result<Vec<Self::Item>>;

    /// Process one item
    ///
    /// `cancel` fires when the cycle's drain timeout elapses; long-running
    /// work should check it and stop early. Errors and panics are recorded
    /// against this item only.
    async fn process_item(&self, item: Self::Item, cancel: CancellationToken) -> Result<()>;

    /// Called once per accepted cycle after the pool drained
    ///
    /// Also runs after a failed start hook or snapshot.
    async fn on_end(&self) -> Result<()> {
        Ok(())
    }

    /// Name used in logs
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }
}
