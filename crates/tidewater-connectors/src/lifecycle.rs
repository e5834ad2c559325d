//! Dumper run state.
//!
//! ```text
//!   NotStarted ──start──► Running ──stop──► Stopping ──► Stopped
//!        │                   │
//!        └──stop──► Stopped  └──────────────────────────► Finished
//! ```
//!
//! The dumper polls [`Lifecycle::is_running`] only at batch boundaries.
//! A stop request never interrupts a batch already being read.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

/// Observable dumper state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LifecycleState {
    /// Constructed, not yet running.
    NotStarted = 0,
    /// Scanning.
    Running = 1,
    /// Stop requested; exits at the next batch boundary.
    Stopping = 2,
    /// Exited on request (or failure) without completing.
    Stopped = 3,
    /// Completed naturally. Terminal.
    Finished = 4,
}

impl LifecycleState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::NotStarted,
            1 => Self::Running,
            2 => Self::Stopping,
            3 => Self::Stopped,
            _ => Self::Finished,
        }
    }
}

/// Lock-free lifecycle flag shared between a dumper and its controller.
pub struct Lifecycle {
    state: AtomicU8,
}

impl Lifecycle {
    /// Creates a lifecycle in `NotStarted`.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(LifecycleState::NotStarted as u8),
        }
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> LifecycleState {
        LifecycleState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Moves `NotStarted` to `Running`.
    ///
    /// Returns `false` if the lifecycle was already started or stopped.
    pub fn start(&self) -> bool {
        self.transition(LifecycleState::NotStarted, LifecycleState::Running)
    }

    /// Requests a cooperative stop.
    ///
    /// A running dumper moves to `Stopping`; one that never started moves
    /// straight to `Stopped`. Terminal states are left untouched.
    pub fn stop(&self) {
        if !self.transition(LifecycleState::Running, LifecycleState::Stopping) {
            self.transition(LifecycleState::NotStarted, LifecycleState::Stopped);
        }
    }

    /// Returns `true` while the dumper should keep scanning.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.state() == LifecycleState::Running
    }

    /// Marks natural completion.
    pub fn mark_finished(&self) {
        self.state
            .store(LifecycleState::Finished as u8, Ordering::Release);
    }

    /// Marks a non-terminal exit (stop honored or failure).
    pub fn mark_stopped(&self) {
        if self.state() != LifecycleState::Finished {
            self.state
                .store(LifecycleState::Stopped as u8, Ordering::Release);
        }
    }

    fn transition(&self, from: LifecycleState, to: LifecycleState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Lifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lifecycle")
            .field("state", &self.state())
            .finish()
    }
}
