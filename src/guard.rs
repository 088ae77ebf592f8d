//! Re-entrancy guard for cycles
//!
//! A [`CycleGuard`] is a single "a cycle is running" flag. Each executor owns
//! its own guard, so independent jobs never block each other. A trigger that
//! finds the guard taken is skipped outright; nothing is queued or retried.

use std::sync::atomic::{AtomicBool, Ordering};

/// Thread-safe idle/running flag
#[derive(Debug, Default)]
pub struct CycleGuard {
    running: AtomicBool,
}

impl CycleGuard {
    /// Create a guard in the idle state
    pub fn new() -> Self {
        Self {
            running: AtomicBool::new(false),
        }
    }

    /// Atomically transition idle → running
    ///
    /// Returns `false` without side effects if a cycle is already running.
    pub fn try_enter(&self) -> bool {
        self.running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Unconditionally transition to idle
    pub fn exit(&self) {
        self.running.store(false, Ordering::Release);
    }

    /// Whether a cycle currently holds the guard
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Enter the guard and get a permit that exits it on drop
    ///
    /// Returns `None` if a cycle is already running.
    #[must_use = "dropping the permit releases the guard immediately"]
    pub fn try_acquire(&self) -> Option<GuardPermit<'_>> {
        self.try_enter().then_some(GuardPermit { guard: self })
    }
}

/// Scoped ownership of a [`CycleGuard`]
///
/// The guard returns to idle when the permit is dropped, including on early
/// returns and unwinding.
#[derive(Debug)]
pub struct GuardPermit<'a> {
    guard: &'a CycleGuard,
}

impl Drop for GuardPermit<'_> {
    fn drop(&mut self) {
        self.guard.exit();
    }
}
