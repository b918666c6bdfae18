//! The N:M scheduler: a shared task queue dispatched onto a fixed pool of
//! worker threads, with an optional "caller" mode that lets the
//! constructing thread host the scheduling loop itself.
//!
//! Grounded in the same source as [`crate::fiber`]; `run` below is a
//! direct port of its dispatch loop, the single hardest algorithm in this
//! crate.

use crate::error::SchedulerError;
use crate::fiber::{Fiber, State};
use crate::thread::Thread;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tracing::{debug, info, trace, trace_span};

/// A unit of work accepted by [`Scheduler::schedule`]: either an
/// already-constructed fiber, or a plain callable the scheduler wraps in
/// one of its own.
pub enum Task {
    /// Schedule an existing fiber.
    Fiber(Arc<Fiber>),
    /// Schedule a callable; the scheduler runs it on a fiber it owns.
    Callback(Box<dyn FnOnce() + Send + 'static>),
}

impl Task {
    /// Wraps an existing fiber as a task.
    pub fn fiber(fiber: Arc<Fiber>) -> Self {
        Task::Fiber(fiber)
    }

    /// Wraps a plain callable as a task.
    pub fn callback(f: impl FnOnce() + Send + 'static) -> Self {
        Task::Callback(Box::new(f))
    }
}

struct TaskRecord {
    task: Task,
    thread_id: i64,
}

thread_local! {
    static CURRENT_SCHEDULER: RefCell<Option<Arc<Scheduler>>> = const { RefCell::new(None) };
}

/// Owns a pool of [`Thread`]s, a shared task queue, and (in `use_caller`
/// mode) a caller scheduling fiber that runs the dispatch loop on the
/// constructing thread.
pub struct Scheduler {
    name: String,
    queue: Mutex<VecDeque<TaskRecord>>,
    active_count: AtomicU64,
    idle_count: AtomicU64,
    worker_count: usize,
    use_caller: bool,
    root_thread: u64,
    is_stopping: AtomicBool,
    auto_stop: AtomicBool,
    started: AtomicBool,
    threads: Mutex<Vec<Thread>>,
    thread_ids: Mutex<Vec<u64>>,
    caller_fiber: Option<Arc<Fiber>>,
    tickle_hook: Option<Box<dyn Fn() + Send + Sync>>,
    idle_hook: Option<Box<dyn Fn(&Scheduler) + Send + Sync>>,
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("name", &self.name)
            .field("worker_count", &self.worker_count)
            .field("use_caller", &self.use_caller)
            .finish_non_exhaustive()
    }
}

impl Scheduler {
    /// Constructs a scheduler with `worker_count` total workers and the
    /// base (no-op `tickle`, blocking-yield `idle`) hooks.
    ///
    /// If `use_caller` is true, the constructing thread is adopted as one
    /// of the `worker_count` workers and materializes a caller scheduling
    /// fiber; that fiber is not entered until [`Scheduler::stop`].
    pub fn new(
        worker_count: usize,
        use_caller: bool,
        name: impl Into<String>,
    ) -> Result<Arc<Scheduler>, crate::error::FiberError> {
        Self::with_hooks(worker_count, use_caller, name, None, None)
    }

    /// Like [`Scheduler::new`], overriding `tickle`/`idle` with the given
    /// hooks instead of the base no-op/blocking-yield behavior. This is
    /// the composition-based stand-in for subclassing the scheduler.
    pub fn with_hooks(
        worker_count: usize,
        use_caller: bool,
        name: impl Into<String>,
        tickle_hook: Option<Box<dyn Fn() + Send + Sync>>,
        idle_hook: Option<Box<dyn Fn(&Scheduler) + Send + Sync>>,
    ) -> Result<Arc<Scheduler>, crate::error::FiberError> {
        assert!(worker_count >= 1, "a scheduler needs at least one worker");
        let name = name.into();
        let root_thread = crate::thread::current_id() as u64;
        let worker_threads = if use_caller {
            worker_count - 1
        } else {
            worker_count
        };

        if use_caller {
            // Materialize this thread's bootstrap fiber up front.
            let _ = Fiber::current();
        }

        let mut caller_fiber_result: Option<Result<Arc<Fiber>, crate::error::FiberError>> = None;
        let scheduler = Arc::new_cyclic(|weak: &Weak<Scheduler>| {
            let caller_fiber = if use_caller {
                let weak = weak.clone();
                let built = Fiber::new(
                    move || {
                        if let Some(scheduler) = weak.upgrade() {
                            scheduler.run();
                        }
                    },
                    0,
                    true,
                );
                let fiber = built.as_ref().ok().cloned();
                caller_fiber_result = Some(built);
                fiber
            } else {
                None
            };

            Scheduler {
                name,
                queue: Mutex::new(VecDeque::new()),
                active_count: AtomicU64::new(0),
                idle_count: AtomicU64::new(0),
                worker_count: worker_threads,
                use_caller,
                root_thread,
                is_stopping: AtomicBool::new(true),
                auto_stop: AtomicBool::new(false),
                started: AtomicBool::new(false),
                threads: Mutex::new(Vec::new()),
                thread_ids: Mutex::new(Vec::new()),
                caller_fiber,
                tickle_hook,
                idle_hook,
            }
        });

        if let Some(Err(e)) = caller_fiber_result {
            return Err(e);
        }

        Ok(scheduler)
    }

    /// This scheduler's display name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The scheduler currently active on the calling thread, if `run` has
    /// set one.
    pub fn current() -> Option<Arc<Scheduler>> {
        CURRENT_SCHEDULER.with(|c| c.borrow().clone())
    }

    fn set_current(scheduler: Option<Arc<Scheduler>>) {
        CURRENT_SCHEDULER.with(|c| *c.borrow_mut() = scheduler);
    }

    /// The scheduling fiber registered for the calling thread, if any.
    pub fn current_scheduling_fiber() -> Option<Arc<Fiber>> {
        Fiber::scheduling_fiber()
    }

    /// The system ids of the worker threads this scheduler has spawned,
    /// in spawn order. Empty until [`Scheduler::start`] has run. Useful
    /// for pinning a task to a specific worker via its `thread_id`.
    pub fn worker_thread_ids(&self) -> Vec<u64> {
        self.thread_ids
            .lock()
            .expect("scheduler thread_ids mutex poisoned")
            .clone()
    }

    /// Appends a single task to the queue. `thread_id = -1` means "any
    /// worker"; any other value pins the task to the worker registered
    /// with that id. Wakes a potentially idle worker if the queue was
    /// empty before this call.
    pub fn schedule(self: &Arc<Self>, task: Task, thread_id: i64) {
        let was_empty = {
            let mut queue = self.queue.lock().expect("scheduler queue mutex poisoned");
            let was_empty = queue.is_empty();
            queue.push_back(TaskRecord { task, thread_id });
            was_empty
        };
        if was_empty {
            self.tickle();
        }
    }

    /// Batched form of [`Scheduler::schedule`]; wakes a worker at most
    /// once for the whole batch.
    pub fn schedule_batch(self: &Arc<Self>, tasks: impl IntoIterator<Item = (Task, i64)>) {
        let mut pushed_any = false;
        let was_empty = {
            let mut queue = self.queue.lock().expect("scheduler queue mutex poisoned");
            let was_empty = queue.is_empty();
            for (task, thread_id) in tasks {
                queue.push_back(TaskRecord { task, thread_id });
                pushed_any = true;
            }
            was_empty
        };
        if pushed_any && was_empty {
            self.tickle();
        }
    }

    /// Spawns the worker pool and starts dispatching. A no-op if already
    /// started.
    pub fn start(self: &Arc<Self>) {
        let mut threads = self.threads.lock().expect("scheduler threads mutex poisoned");
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        self.is_stopping.store(false, Ordering::SeqCst);

        info!(scheduler = %self.name, worker_count = self.worker_count, use_caller = self.use_caller, "starting scheduler");

        threads.reserve(self.worker_count);
        let mut ids = Vec::with_capacity(self.worker_count);
        for i in 0..self.worker_count {
            let scheduler = self.clone();
            let worker_name = format!("{}-{}", self.name, i);
            let thread = Thread::spawn(worker_name, move || {
                scheduler.run();
            });
            ids.push(thread.id() as u64);
            threads.push(thread);
        }
        *self.thread_ids.lock().expect("scheduler thread_ids mutex poisoned") = ids;
    }

    /// Stops accepting the dispatch loop's continuation, drains the
    /// queue, and joins every worker thread. Must be called from the
    /// thread that constructed the scheduler; in `use_caller` mode, must
    /// additionally be called from that thread's manager context (not
    /// from inside a scheduling or task fiber).
    pub fn stop(self: &Arc<Self>) -> Result<(), SchedulerError> {
        if !self.started.load(Ordering::SeqCst) {
            return Ok(());
        }

        self.auto_stop.store(true, Ordering::SeqCst);

        let caller_tid = crate::thread::current_id() as u64;
        if caller_tid != self.root_thread {
            return Err(SchedulerError::NotRootThread {
                root: self.root_thread,
                caller: caller_tid,
            });
        }
        if self.use_caller && Fiber::fiber_id_of_current() != 0 {
            return Err(SchedulerError::WrongContext);
        }

        self.is_stopping.store(true, Ordering::SeqCst);

        let tickles = self.worker_count + usize::from(self.use_caller);
        for _ in 0..tickles {
            self.tickle();
        }

        if let Some(caller_fiber) = &self.caller_fiber {
            if !matches!(caller_fiber.state(), State::Term | State::Except) {
                caller_fiber.call();
            }
        }

        self.wait_for_worker_threads();
        self.started.store(false, Ordering::SeqCst);
        debug!(scheduler = %self.name, "scheduler stopped");
        Ok(())
    }

    fn wait_for_worker_threads(&self) {
        let mut threads = {
            let mut guard = self.threads.lock().expect("scheduler threads mutex poisoned");
            std::mem::take(&mut *guard)
        };
        for thread in &mut threads {
            thread.join();
        }
    }

    /// Reschedules the calling fiber onto `self`, pinned to `thread_id`
    /// (`-1` for any worker), and yields to HOLD. A no-op if the calling
    /// fiber is already running under `self` on the requested thread.
    pub fn switch_to(self: &Arc<Self>, thread_id: i64) {
        let current = Scheduler::current().expect("switch_to called without a current scheduler");
        if Arc::ptr_eq(&current, self)
            && (thread_id == -1 || thread_id as u64 == crate::thread::current_id() as u64)
        {
            return;
        }
        let current_fiber = Fiber::current();
        self.schedule(Task::Fiber(current_fiber), thread_id);
        Fiber::yield_to_hold();
    }

    /// The no-op base hook: logs and returns. Overridden via the
    /// `tickle_hook` supplied to [`Scheduler::with_hooks`].
    pub fn tickle(&self) {
        match &self.tickle_hook {
            Some(hook) => hook(),
            None => trace!(scheduler = %self.name, "tickle (no-op)"),
        }
    }

    /// The base idle hook: parks the calling fiber in a HOLD loop until
    /// `stopping()` holds. Overridden via `idle_hook`.
    fn idle(&self) {
        match &self.idle_hook {
            Some(hook) => hook(self),
            None => {
                while !self.stopping() {
                    Fiber::yield_to_hold();
                }
            }
        }
    }

    /// True iff this scheduler has been told to stop, the queue is
    /// drained, and no worker is actively running a task.
    pub fn stopping(&self) -> bool {
        self.auto_stop.load(Ordering::SeqCst)
            && self.is_stopping.load(Ordering::SeqCst)
            && self.queue.lock().expect("scheduler queue mutex poisoned").is_empty()
            && self.active_count.load(Ordering::SeqCst) == 0
    }

    /// Renders a one-line diagnostic summary: name, worker count,
    /// active/idle counters, the stopping flag, and registered worker
    /// thread ids.
    pub fn dump(&self) -> String {
        format!(
            "Scheduler{{name={}, workers={}, active={}, idle={}, stopping={}, thread_ids={:?}}}",
            self.name,
            self.worker_count,
            self.active_count.load(Ordering::SeqCst),
            self.idle_count.load(Ordering::SeqCst),
            self.stopping(),
            self.thread_ids.lock().expect("scheduler thread_ids mutex poisoned"),
        )
    }

    fn dequeue(&self, worker_id: u64) -> (Option<TaskRecord>, bool) {
        let mut queue = self.queue.lock().expect("scheduler queue mutex poisoned");
        let mut tickle_me = false;
        let mut picked_index = None;

        for (index, record) in queue.iter().enumerate() {
            if record.thread_id != -1 && record.thread_id as u64 != worker_id {
                tickle_me = true;
                continue;
            }
            if let Task::Fiber(fiber) = &record.task {
                if fiber.state() == State::Exec {
                    continue;
                }
            }
            picked_index = Some(index);
            break;
        }

        let picked = picked_index.map(|index| {
            queue
                .remove(index)
                .expect("picked index was just observed in the queue")
        });
        if picked.is_some() {
            self.active_count.fetch_add(1, Ordering::SeqCst);
        }
        if !queue.is_empty() {
            tickle_me = true;
        }

        (picked, tickle_me)
    }

    /// The dispatch loop: run by every spawned worker and, in
    /// `use_caller` mode, by the caller scheduling fiber.
    fn run(self: Arc<Self>) {
        let _span = trace_span!("scheduler_run", scheduler = %self.name).entered();
        Scheduler::set_current(Some(self.clone()));

        let worker_id = crate::thread::current_id() as u64;
        let running_as_caller_fiber = self.use_caller && worker_id == self.root_thread;
        if running_as_caller_fiber {
            Fiber::set_scheduling_fiber(self.caller_fiber.clone());
        } else {
            let bootstrap = Fiber::current();
            Fiber::set_scheduling_fiber(Some(bootstrap));
        }

        let idle_fiber = {
            let scheduler = self.clone();
            Fiber::new(move || scheduler.idle(), 0, false).expect("failed to allocate idle fiber")
        };
        let mut callback_fiber: Option<Arc<Fiber>> = None;

        loop {
            let (picked, tickle_me) = self.dequeue(worker_id);
            if tickle_me {
                self.tickle();
            }

            match picked {
                Some(record) => match record.task {
                    Task::Fiber(fiber) => {
                        if matches!(fiber.state(), State::Term | State::Except) {
                            self.active_count.fetch_sub(1, Ordering::SeqCst);
                            continue;
                        }
                        fiber.swap_in();
                        self.active_count.fetch_sub(1, Ordering::SeqCst);
                        self.apply_post_run_state(fiber);
                    }
                    Task::Callback(cb) => {
                        let fiber = match callback_fiber.take() {
                            Some(existing) => {
                                existing.reset(cb);
                                existing
                            }
                            None => Fiber::new(cb, 0, false).expect("failed to allocate callback fiber"),
                        };
                        fiber.swap_in();
                        self.active_count.fetch_sub(1, Ordering::SeqCst);
                        if matches!(fiber.state(), State::Term | State::Except) {
                            callback_fiber = Some(fiber);
                        } else {
                            self.apply_post_run_state(fiber);
                        }
                    }
                },
                None => {
                    if idle_fiber.state() == State::Term {
                        debug!(scheduler = %self.name, worker_id, "idle fiber terminated, worker exiting");
                        break;
                    }
                    self.idle_count.fetch_add(1, Ordering::SeqCst);
                    idle_fiber.swap_in();
                    self.idle_count.fetch_sub(1, Ordering::SeqCst);
                    if !matches!(idle_fiber.state(), State::Term | State::Except) {
                        idle_fiber.set_state(State::Hold);
                    }
                }
            }
        }

        Scheduler::set_current(None);
        Fiber::set_scheduling_fiber(None);
    }

    /// Shared tail of the fiber-record and callback-record dispatch
    /// cases: re-schedule a READY fiber, leave TERM/EXCEPT alone, and
    /// otherwise label it HOLD for an external owner to resume later.
    fn apply_post_run_state(self: &Arc<Self>, fiber: Arc<Fiber>) {
        match fiber.state() {
            State::Ready => self.schedule(Task::Fiber(fiber), -1),
            State::Term | State::Except => {}
            _ => fiber.set_state(State::Hold),
        }
    }
}

/// RAII guard that switches into `target` on construction and restores
/// whatever scheduler was current beforehand on drop.
pub struct SchedulerSwitcher {
    previous: Option<Arc<Scheduler>>,
}

impl SchedulerSwitcher {
    /// Switches the calling fiber onto `target` and remembers the
    /// previously current scheduler (if any) to switch back to on drop.
    pub fn new(target: &Arc<Scheduler>) -> Self {
        let previous = Scheduler::current();
        target.switch_to(-1);
        Self { previous }
    }
}

impl Drop for SchedulerSwitcher {
    fn drop(&mut self) {
        if let Some(previous) = self.previous.take() {
            previous.switch_to(-1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    #[test]
    fn without_caller_runs_all_tasks() {
        let scheduler = Scheduler::new(2, false, "test-sched").unwrap();
        let results = Arc::new(StdMutex::new(Vec::new()));

        for i in 0..3 {
            let results = results.clone();
            scheduler.schedule(Task::callback(move || results.lock().unwrap().push(i)), -1);
        }

        scheduler.start();
        scheduler.stop().unwrap();

        let mut got = results.lock().unwrap().clone();
        got.sort_unstable();
        assert_eq!(got, vec![0, 1, 2]);
    }

    #[test]
    fn with_caller_runs_on_root_thread() {
        let scheduler = Scheduler::new(1, true, "caller-sched").unwrap();
        let flag = Arc::new(StdMutex::new(false));
        let flag2 = flag.clone();
        scheduler.schedule(Task::callback(move || *flag2.lock().unwrap() = true), -1);

        scheduler.start();
        scheduler.stop().unwrap();

        assert!(*flag.lock().unwrap());
    }

    #[test]
    fn exception_in_one_task_does_not_stop_others() {
        let scheduler = Scheduler::new(1, false, "panic-sched").unwrap();
        let ran = Arc::new(StdMutex::new(false));
        let ran2 = ran.clone();

        scheduler.schedule(Task::callback(|| panic!("boom")), -1);
        scheduler.schedule(Task::callback(move || *ran2.lock().unwrap() = true), -1);

        scheduler.start();
        scheduler.stop().unwrap();

        assert!(*ran.lock().unwrap());
    }

    #[test]
    fn stop_from_non_root_thread_is_rejected() {
        let scheduler = Scheduler::new(1, false, "guarded-sched").unwrap();
        scheduler.start();

        let other = scheduler.clone();
        let result = std::thread::spawn(move || other.stop()).join().unwrap();
        assert!(matches!(result, Err(SchedulerError::NotRootThread { .. })));

        scheduler.stop().unwrap();
    }
}
