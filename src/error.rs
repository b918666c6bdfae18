//! Recoverable errors raised across the API boundary.
//!
//! Internal invariant violations (an illegal fiber state transition,
//! destroying a still-running fiber, a failed context switch) are not
//! modeled here: they are `assert!`/`panic!` at the point of violation,
//! matching the source's `SYLAR_ASSERT`/`SYLAR_ASSERT2` macros, which abort
//! rather than return control to the caller.

use thiserror::Error;

/// Errors that can occur while constructing or resetting a [`crate::fiber::Fiber`].
#[derive(Debug, Error)]
pub enum FiberError {
    /// The OS refused to map or protect a new stack.
    #[error("failed to allocate fiber stack: {0}")]
    Stack(#[from] std::io::Error),
}

/// Errors raised by [`crate::scheduler::Scheduler`] when the API is misused.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// `stop()` was called from a thread other than the one that
    /// constructed the scheduler.
    #[error("Scheduler::stop() must be called from the thread that created it (root={root}, caller={caller})")]
    NotRootThread {
        /// Id of the thread that constructed the scheduler.
        root: u64,
        /// Id of the thread that called `stop()`.
        caller: u64,
    },

    /// In `use_caller` mode, `stop()` was called from inside the caller's
    /// own scheduling fiber (or some other fiber), rather than from its
    /// manager context.
    #[error("Scheduler::stop() must be called from the constructing thread's manager context, not from a scheduling or task fiber")]
    WrongContext,
}
