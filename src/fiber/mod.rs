//! The fiber state machine: a stackful, user-space coroutine.
//!
//! Ported from a source built around `ucontext_t` + `makecontext`; here the
//! raw context switch is hand-rolled assembly (see [`arch`]) and the stack
//! is an `mmap`-backed, guard-paged allocation (see [`stack`]). Every other
//! invariant -- the six-state machine, the "bootstrap fiber" that stands in
//! for a thread's own native stack, the thread-local "current fiber" -- is
//! carried over unchanged.

pub(crate) mod arch;
pub mod stack;

pub use stack::FiberStack;

use crate::error::FiberError;
use std::cell::{Cell, RefCell, UnsafeCell};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{trace, warn};

/// Lifecycle state of a [`Fiber`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Constructed, never run.
    Init,
    /// Queued to run but not currently executing.
    Ready,
    /// Currently executing on some thread.
    Exec,
    /// Suspended mid-execution, waiting to be resumed.
    Hold,
    /// Ran its callback to completion.
    Term,
    /// Its callback panicked.
    Except,
}

static NEXT_ID: AtomicU64 = AtomicU64::new(1);
static LIVE_COUNT: AtomicU64 = AtomicU64::new(0);

type Callback = Box<dyn FnOnce() + 'static>;

struct Core {
    stack: Option<FiberStack>,
    cb: Option<Callback>,
    on_caller: bool,
}

/// A stackful coroutine.
///
/// Always held behind an [`Arc`]: swapping into a fiber requires the
/// scheduling machinery to retain a reference to whichever fiber is
/// currently executing, and a fiber's own trampoline needs a handle back
/// to itself once it starts running on its own stack.
pub struct Fiber {
    id: u64,
    state: Cell<State>,
    sp: Cell<usize>,
    core: UnsafeCell<Core>,
}

// A fiber's interior state is mutated only by the single OS thread that is
// currently swapped into it (or in the process of swapping into/out of
// it); ownership of *which* thread that is can change over the fiber's
// life (the scheduler does not pin fibers to threads unless asked to), so
// the type must be `Send`. It is never touched by two threads at once --
// the EXEC state and the scheduler's dequeue-skip rule enforce that -- so
// `Sync` is sound under that external contract even though nothing here
// is internally locked.
unsafe impl Send for Fiber {}
unsafe impl Sync for Fiber {}

thread_local! {
    static CURRENT: RefCell<Option<Arc<Fiber>>> = const { RefCell::new(None) };
    static THREAD_FIBER: RefCell<Option<Arc<Fiber>>> = const { RefCell::new(None) };
    static SCHEDULING_FIBER: RefCell<Option<Arc<Fiber>>> = const { RefCell::new(None) };
}

impl Fiber {
    /// Constructs a new fiber running `cb` on its own stack.
    ///
    /// `stack_size` of `0` uses [`crate::config::default_stack_size`].
    /// `on_caller` selects which trampoline the stack is primed to enter;
    /// it has no other effect on this fiber and exists purely so
    /// [`Fiber::call`]/[`Fiber::back`] and [`Fiber::swap_in`]/[`Fiber::swap_out`]
    /// read as the distinct pairs the scheduler's two construction modes
    /// expect.
    pub fn new(
        cb: impl FnOnce() + 'static,
        stack_size: u32,
        on_caller: bool,
    ) -> Result<Arc<Fiber>, FiberError> {
        let stack_size = if stack_size == 0 {
            crate::config::default_stack_size()
        } else {
            stack_size
        };
        let stack = FiberStack::new(stack_size as usize)?;
        let entry = if on_caller {
            caller_trampoline
        } else {
            main_trampoline
        };
        let sp = unsafe { arch::init_stack(stack.top(), entry) };
        let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
        LIVE_COUNT.fetch_add(1, Ordering::Relaxed);

        trace!(fiber_id = id, stack_size, on_caller, "fiber constructed");

        Ok(Arc::new(Fiber {
            id,
            state: Cell::new(State::Init),
            sp: Cell::new(sp),
            core: UnsafeCell::new(Core {
                stack: Some(stack),
                cb: Some(Box::new(cb)),
                on_caller,
            }),
        }))
    }

    /// The bootstrap fiber: no stack, no callback, permanently EXEC, id 0.
    /// Exactly one is created per thread, lazily, by [`Fiber::current`].
    fn bootstrap() -> Arc<Fiber> {
        LIVE_COUNT.fetch_add(1, Ordering::Relaxed);
        trace!("bootstrap fiber constructed");
        Arc::new(Fiber {
            id: 0,
            state: Cell::new(State::Exec),
            sp: Cell::new(0),
            core: UnsafeCell::new(Core {
                stack: None,
                cb: None,
                on_caller: false,
            }),
        })
    }

    /// This fiber's unique id. `0` is reserved for bootstrap fibers.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// This fiber's current lifecycle state.
    pub fn state(&self) -> State {
        self.state.get()
    }

    /// Forces this fiber's state, used by the scheduler to apply the
    /// HOLD label after a fiber yields without setting it itself.
    pub(crate) fn set_state(&self, state: State) {
        self.state.set(state);
    }

    fn core(&self) -> &Core {
        unsafe { &*self.core.get() }
    }

    #[allow(clippy::mut_from_ref)]
    fn core_mut(&self) -> &mut Core {
        unsafe { &mut *self.core.get() }
    }

    fn sp_ptr(&self) -> *mut usize {
        self.sp.as_ptr()
    }

    /// Re-initializes a terminated fiber with a new callback, reusing its
    /// existing stack allocation.
    ///
    /// # Panics
    ///
    /// Panics if this is the bootstrap fiber, or if `state()` is not one
    /// of INIT, TERM, EXCEPT.
    pub fn reset(&self, cb: impl FnOnce() + 'static) {
        let on_caller = self.core().on_caller;
        let state = self.state();
        assert!(
            matches!(state, State::Init | State::Term | State::Except),
            "cannot reset fiber {} in state {:?}",
            self.id,
            state
        );
        let core = self.core_mut();
        let top = core
            .stack
            .as_ref()
            .expect("cannot reset the bootstrap fiber")
            .top();
        let entry = if on_caller {
            caller_trampoline
        } else {
            main_trampoline
        };
        core.cb = Some(Box::new(cb));
        self.sp.set(unsafe { arch::init_stack(top, entry) });
        self.state.set(State::Init);
        trace!(fiber_id = self.id, "fiber reset");
    }

    /// Returns the currently executing fiber on this thread, materializing
    /// the bootstrap fiber as a side effect if none exists yet.
    pub fn current() -> Arc<Fiber> {
        if let Some(f) = CURRENT.with(|c| c.borrow().clone()) {
            return f;
        }
        let bootstrap = Fiber::bootstrap();
        CURRENT.with(|c| *c.borrow_mut() = Some(bootstrap.clone()));
        THREAD_FIBER.with(|t| *t.borrow_mut() = Some(bootstrap.clone()));
        bootstrap
    }

    fn set_current(fiber: &Arc<Fiber>) {
        CURRENT.with(|c| *c.borrow_mut() = Some(fiber.clone()));
    }

    /// The fiber id of whichever fiber is current on this thread, without
    /// materializing a bootstrap fiber. Returns `0` if the fiber API has
    /// never been touched on this thread, matching the bootstrap's id.
    pub fn fiber_id_of_current() -> u64 {
        CURRENT.with(|c| c.borrow().as_ref().map(|f| f.id).unwrap_or(0))
    }

    /// Total number of live fibers (including bootstraps) across the
    /// process.
    pub fn total_fibers() -> u64 {
        LIVE_COUNT.load(Ordering::Relaxed)
    }

    /// The scheduling fiber registered for this thread by the scheduler,
    /// if any.
    pub(crate) fn scheduling_fiber() -> Option<Arc<Fiber>> {
        SCHEDULING_FIBER.with(|f| f.borrow().clone())
    }

    pub(crate) fn set_scheduling_fiber(fiber: Option<Arc<Fiber>>) {
        SCHEDULING_FIBER.with(|f| *f.borrow_mut() = fiber);
    }

    /// Switches the calling context into this fiber, which must not
    /// already be EXEC or TERM.
    pub fn swap_in(self: &Arc<Self>) {
        let state = self.state();
        assert!(
            !matches!(state, State::Exec | State::Term),
            "cannot swap into fiber {} in state {:?}",
            self.id,
            state
        );
        let thread_fiber = THREAD_FIBER
            .with(|t| t.borrow().clone())
            .expect("swap_in called before Fiber::current() established a thread fiber");
        Fiber::set_current(self);
        self.state.set(State::Exec);
        trace!(fiber_id = self.id, "swap_in");
        unsafe {
            arch::swap(self.sp.get(), thread_fiber.sp_ptr());
        }
    }

    /// Switches out of this fiber, back into the calling thread's
    /// scheduling fiber. Does not itself change `state()`; callers that
    /// want a particular post-suspend state (READY, HOLD) must set it
    /// first, matching the source's `yield_to_ready`/`yield_to_hold` split.
    pub fn swap_out(&self) {
        let thread_fiber = THREAD_FIBER
            .with(|t| t.borrow().clone())
            .expect("swap_out called without an established thread fiber");
        Fiber::set_current(&thread_fiber);
        trace!(fiber_id = self.id, "swap_out");
        unsafe {
            arch::swap(thread_fiber.sp.get(), self.sp_ptr());
        }
    }

    /// Alias for [`Fiber::swap_in`], used by `on_caller=true` fibers to
    /// read as "call into the dedicated scheduling fiber" at call sites.
    pub fn call(self: &Arc<Self>) {
        self.swap_in();
    }

    /// Alias for [`Fiber::swap_out`], the counterpart to [`Fiber::call`].
    pub fn back(&self) {
        self.swap_out();
    }

    /// Sets the current fiber's state to READY and swaps out.
    pub fn yield_to_ready() {
        let cur = Fiber::current();
        cur.state.set(State::Ready);
        cur.swap_out();
    }

    /// Swaps out without touching state; see the open-question note in
    /// the design docs for why this does not set HOLD itself.
    pub fn yield_to_hold() {
        let cur = Fiber::current();
        cur.swap_out();
    }
}

impl Drop for Fiber {
    fn drop(&mut self) {
        let core = self.core();
        if core.stack.is_some() {
            assert!(
                matches!(self.state(), State::Init | State::Term | State::Except),
                "fiber {} dropped while in state {:?}",
                self.id,
                self.state()
            );
        } else {
            assert!(
                core.cb.is_none() && self.state() == State::Exec,
                "bootstrap fiber {} dropped in an unexpected state",
                self.id
            );
        }
        LIVE_COUNT.fetch_sub(1, Ordering::Relaxed);
        trace!(fiber_id = self.id, "fiber dropped");
    }
}

unsafe extern "C" fn main_trampoline() -> ! {
    unsafe { run_trampoline() }
}

unsafe extern "C" fn caller_trampoline() -> ! {
    unsafe { run_trampoline() }
}

/// Shared body of both trampolines: run the callback under
/// `catch_unwind`, record TERM/EXCEPT, then swap back out unconditionally.
unsafe fn run_trampoline() -> ! {
    let cur = Fiber::current();
    let id = cur.id;
    let cb = cur
        .core_mut()
        .cb
        .take()
        .expect("fiber trampoline entered without a callback");

    trace!(fiber_id = id, "fiber starting");
    match std::panic::catch_unwind(AssertUnwindSafe(cb)) {
        Ok(()) => {
            cur.state.set(State::Term);
            trace!(fiber_id = id, "fiber terminated");
        }
        Err(payload) => {
            cur.state.set(State::Except);
            warn!(fiber_id = id, panic = %panic_message(&*payload), "fiber panicked");
        }
    }

    let raw: *const Fiber = Arc::as_ptr(&cur);
    drop(cur);
    unsafe {
        (*raw).swap_out();
    }
    unreachable!("fiber {} resumed after reaching a terminal state", id);
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn single_fiber_swap_runs_to_term() {
        std::thread::spawn(|| {
            let _bootstrap = Fiber::current();
            let log = Arc::new(Mutex::new(Vec::new()));
            let log2 = log.clone();
            let f = Fiber::new(
                move || {
                    log2.lock().unwrap().push("A");
                    Fiber::yield_to_hold();
                    log2.lock().unwrap().push("B");
                },
                0,
                false,
            )
            .unwrap();

            f.swap_in();
            assert_eq!(*log.lock().unwrap(), vec!["A"]);
            f.state.set(State::Hold);

            f.swap_in();
            assert_eq!(*log.lock().unwrap(), vec!["A", "B"]);
            assert_eq!(f.state(), State::Term);
        })
        .join()
        .unwrap();
    }

    #[test]
    fn panicking_callback_sets_except() {
        std::thread::spawn(|| {
            let _bootstrap = Fiber::current();
            let f = Fiber::new(|| panic!("boom"), 0, false).unwrap();
            f.swap_in();
            assert_eq!(f.state(), State::Except);
        })
        .join()
        .unwrap();
    }

    #[test]
    fn reset_reuses_stack_and_runs_once() {
        std::thread::spawn(|| {
            let _bootstrap = Fiber::current();
            let count = Arc::new(Mutex::new(0));
            let c1 = count.clone();
            let f = Fiber::new(move || *c1.lock().unwrap() += 1, 0, false).unwrap();
            f.swap_in();
            assert_eq!(f.state(), State::Term);

            let c2 = count.clone();
            f.reset(move || *c2.lock().unwrap() += 1);
            assert_eq!(f.state(), State::Init);
            f.swap_in();
            assert_eq!(f.state(), State::Term);
            assert_eq!(*count.lock().unwrap(), 2);
        })
        .join()
        .unwrap();
    }

    #[test]
    fn fresh_thread_current_id_is_zero() {
        std::thread::spawn(|| {
            assert_eq!(Fiber::fiber_id_of_current(), 0);
            let _ = Fiber::current();
            assert_eq!(Fiber::fiber_id_of_current(), 0);
        })
        .join()
        .unwrap();
    }
}
