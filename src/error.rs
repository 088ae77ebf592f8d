//! Error types for cycle-runner
//!
//! This module provides the error handling for the library, including:
//! - The crate-wide [`Error`] enum and [`Result`] alias
//! - Context for cycle-fatal failures (which hook, snapshot capture)
//! - Per-item failures captured by the worker pool (errors and panics)
//! - Machine-readable error codes for logs and events

use std::fmt;
use thiserror::Error;

/// Result type alias for cycle-runner operations
pub type Result<T> = std::result::Result<T, Error>;

/// Boxed error type accepted from job implementations
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Lifecycle hook of a cycle
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HookKind {
    /// `CycleJob::on_start`, runs before the snapshot is taken
    Start,
    /// `CycleJob::on_end`, runs after the pool has drained
    End,
}

impl fmt::Display for HookKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HookKind::Start => write!(f, "on_start"),
            HookKind::End => write!(f, "on_end"),
        }
    }
}

/// Main error type for cycle-runner
///
/// Errors raised by job implementations (snapshot, item processing, hooks) are
/// carried in [`Error::Job`] or [`Error::Other`]; the executor adds context by
/// wrapping them in [`Error::Snapshot`] or [`Error::Hook`] when they end a cycle.
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error with context about which setting is invalid
    #[error("configuration error: {message}")]
    Config {
        /// Human-readable error message describing the configuration issue
        message: String,
        /// The configuration key that caused the error (e.g., "drain_timeout")
        key: Option<String>,
    },

    /// The snapshot producer failed; the cycle ended before dispatch
    #[error("snapshot failed: {source}")]
    Snapshot {
        /// The error returned by the snapshot producer
        source: Box<Error>,
    },

    /// A lifecycle hook failed; the cycle ended early
    #[error("{hook} hook failed: {source}")]
    Hook {
        /// Which hook failed
        hook: HookKind,
        /// The error returned by the hook
        source: Box<Error>,
    },

    /// An item processor panicked
    #[error("item processor panicked: {0}")]
    ItemPanicked(String),

    /// Work was cancelled before it completed
    #[error("cancelled")]
    Cancelled,

    /// Error raised by a job implementation
    #[error("{0}")]
    Job(#[source] BoxError),

    /// I/O error
    ///
    /// Never raised by the executor itself; lets job implementations use `?`
    /// on I/O calls.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    ///
    /// Never raised by the executor itself; lets job implementations use `?`
    /// when decoding snapshot sources.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Other error
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Wrap any error raised by a job implementation
    pub fn job<E>(error: E) -> Self
    where
        E: Into<BoxError>,
    {
        Error::Job(error.into())
    }

    /// Machine-readable error code, stable across releases
    pub fn error_code(&self) -> &'static str {
        match self {
            Error::Config { .. } => "config_error",
            Error::Snapshot { .. } => "snapshot_failed",
            Error::Hook {
                hook: HookKind::Start,
                ..
            } => "start_hook_failed",
            Error::Hook {
                hook: HookKind::End,
                ..
            } => "end_hook_failed",
            Error::ItemPanicked(_) => "item_panicked",
            Error::Cancelled => "cancelled",
            Error::Job(_) => "job_error",
            Error::Io(_) => "io_error",
            Error::Serialization(_) => "serialization_error",
            Error::Other(_) => "internal_error",
        }
    }

    /// Returns true if this error ended a cycle early (snapshot or hook failure)
    pub fn is_cycle_fatal(&self) -> bool {
        matches!(self, Error::Snapshot { .. } | Error::Hook { .. })
    }

    pub(crate) fn snapshot(source: Error) -> Self {
        Error::Snapshot {
            source: Box::new(source),
        }
    }

    pub(crate) fn hook(hook: HookKind, source: Error) -> Self {
        Error::Hook {
            hook,
            source: Box::new(source),
        }
    }
}
