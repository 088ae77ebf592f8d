//! Core types for cycle-runner

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Sequence number of an accepted cycle, unique per executor
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CycleId(pub u64);

impl CycleId {
    /// Create a new CycleId
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// Get the inner u64 value
    pub fn get(&self) -> u64 {
        self.0
    }
}

impl From<u64> for CycleId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for CycleId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Trigger metadata handed to the start hook
///
/// The executor never looks inside; it is carried from the trigger to
/// [`CycleJob::on_start`](crate::job::CycleJob::on_start) unchanged.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CycleContext {
    /// When the trigger fired
    pub fired_at: DateTime<Utc>,
    /// Name of whatever fired the cycle (scheduler job name, "manual", ...)
    pub trigger: String,
    /// Free-form trigger metadata
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl CycleContext {
    /// Context for a trigger fired now
    pub fn new(trigger: impl Into<String>) -> Self {
        Self {
            fired_at: Utc::now(),
            trigger: trigger.into(),
            metadata: HashMap::new(),
        }
    }

    /// Attach one metadata entry
    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

impl Default for CycleContext {
    fn default() -> Self {
        Self::new("manual")
    }
}

/// Executor state machine
///
/// `Idle → Starting → Dispatching → Draining → Idle`
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CycleState {
    /// No cycle running
    Idle,
    /// Guard acquired, start hook and snapshot in progress
    Starting,
    /// Submitting snapshot items to the worker pool
    Dispatching,
    /// Waiting for dispatched items to finish
    Draining,
}

impl CycleState {
    /// Convert to the integer representation used for atomic storage
    pub fn to_u8(&self) -> u8 {
        match self {
            CycleState::Idle => 0,
            CycleState::Starting => 1,
            CycleState::Dispatching => 2,
            CycleState::Draining => 3,
        }
    }

    /// Convert from the integer representation (unknown values map to Idle)
    pub fn from_u8(value: u8) -> Self {
        match value {
            1 => CycleState::Starting,
            2 => CycleState::Dispatching,
            3 => CycleState::Draining,
            _ => CycleState::Idle,
        }
    }
}

/// One item that did not complete successfully
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemFailure {
    /// Position of the item in the cycle's snapshot
    pub index: usize,
    /// Error message
    pub error: String,
}

/// Accumulated result of one accepted cycle
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CycleReport {
    /// Cycle sequence number
    pub cycle_id: CycleId,
    /// When the cycle acquired the guard
    pub started_at: DateTime<Utc>,
    /// Wall-clock duration of the cycle in milliseconds
    pub elapsed_ms: u64,
    /// Number of items in the snapshot
    pub total: usize,
    /// Items whose processor returned successfully
    pub completed: usize,
    /// Items whose processor returned an error or panicked
    pub failed: usize,
    /// Items still unfinished when the drain timeout elapsed
    pub abandoned: usize,
    /// Whether the drain timeout elapsed before every item finished
    pub drain_timed_out: bool,
    /// Details of failed items
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failures: Vec<ItemFailure>,
}

impl CycleReport {
    /// True when every item completed successfully
    pub fn is_clean(&self) -> bool {
        self.failed == 0 && self.abandoned == 0 && !self.drain_timed_out
    }
}

/// Result of [`CycleExecutor::execute`](crate::executor::CycleExecutor::execute)
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CycleOutcome {
    /// A previous cycle still held the guard; nothing ran
    Skipped,
    /// The cycle ran to completion
    Completed(CycleReport),
}

impl CycleOutcome {
    /// Whether the trigger was skipped
    pub fn is_skipped(&self) -> bool {
        matches!(self, CycleOutcome::Skipped)
    }

    /// The report of a completed cycle
    pub fn report(&self) -> Option<&CycleReport> {
        match self {
            CycleOutcome::Completed(report) => Some(report),
            CycleOutcome::Skipped => None,
        }
    }
}

/// Events emitted by the executor
///
/// Delivered through a broadcast channel; see
/// [`CycleExecutor::subscribe`](crate::executor::CycleExecutor::subscribe).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CycleEvent {
    /// A trigger acquired the guard and a cycle started
    CycleStarted {
        /// Cycle sequence number
        cycle_id: CycleId,
        /// Name of the trigger
        trigger: String,
    },

    /// A trigger arrived while a cycle was running and was dropped
    CycleSkipped {
        /// Name of the trigger
        trigger: String,
    },

    /// The snapshot was captured and items are being dispatched
    Dispatching {
        /// Cycle sequence number
        cycle_id: CycleId,
        /// Number of items in the snapshot
        items: usize,
    },

    /// An item processor returned an error or panicked
    ItemFailed {
        /// Cycle sequence number
        cycle_id: CycleId,
        /// Position of the item in the snapshot
        index: usize,
        /// Error message
        error: String,
    },

    /// The cycle finished and the guard was released
    CycleCompleted {
        /// Final report
        report: CycleReport,
    },

    /// A snapshot or hook failure ended the cycle early
    CycleFailed {
        /// Cycle sequence number
        cycle_id: CycleId,
        /// Machine-readable error code
        code: String,
        /// Error message
        error: String,
    },
}
