//! A thin, joinable OS-thread wrapper.
//!
//! [`Thread::spawn`] blocking until the new thread has published its
//! identity is the whole point of this type: it turns "the constructor
//! returned" into "`id()` is final and non-racy", which lets a caller
//! immediately collect thread ids for diagnostics or affinity without a
//! separate synchronization step.

use crate::sync::Semaphore;
use std::cell::RefCell;
use std::sync::atomic::{AtomicU32, Ordering};
use std::thread::JoinHandle;

const MAX_NAME_LEN: usize = 15;

thread_local! {
    static CURRENT_NAME: RefCell<String> = const { RefCell::new(String::new()) };
    static CURRENT_ID: RefCell<Option<u32>> = const { RefCell::new(None) };
}

static NEXT_ID: AtomicU32 = AtomicU32::new(1);

/// Returns a per-process-unique, 32-bit id for the calling thread,
/// assigning one on first use.
///
/// On Linux this would ordinarily be the kernel's `gettid()`; to keep the
/// id stable and portable across the platforms this crate targets, we hand
/// out ids from a process-global counter the first time a thread touches
/// any fiber/scheduler API, exactly as the kernel tid is: opaque, stable
/// for the thread's lifetime, and used only for diagnostics and affinity.
pub fn current_id() -> u32 {
    CURRENT_ID.with(|id| {
        let mut id = id.borrow_mut();
        *id.get_or_insert_with(|| NEXT_ID.fetch_add(1, Ordering::Relaxed))
    })
}

/// Alias for [`current_id`].
pub fn current() -> u32 {
    current_id()
}

/// Returns the name of the calling thread, or an empty string if it was
/// never named.
pub fn current_name() -> String {
    CURRENT_NAME.with(|name| name.borrow().clone())
}

/// Renames the calling thread. Truncated to [`MAX_NAME_LEN`] characters,
/// matching the limit most OSes impose on thread names.
pub fn set_current_name(name: &str) {
    let truncated: String = name.chars().take(MAX_NAME_LEN).collect();
    CURRENT_NAME.with(|slot| *slot.borrow_mut() = truncated);
}

/// A joinable OS thread that runs a single callable, with its identity
/// guaranteed available as soon as the constructor returns.
#[derive(Debug)]
pub struct Thread {
    id: u32,
    name: String,
    handle: Option<JoinHandle<()>>,
}

impl Thread {
    /// Spawns a new OS thread running `f`, blocking until the thread has
    /// recorded its id and name.
    pub fn spawn<F>(name: impl Into<String>, f: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        let name = name.into();
        let ready = std::sync::Arc::new(Semaphore::new(0));
        let ready_in_thread = ready.clone();

        let id_slot = std::sync::Arc::new(std::sync::Mutex::new(0u32));
        let id_slot_in_thread = id_slot.clone();

        let thread_name = name.clone();
        let handle = std::thread::Builder::new()
            .name(thread_name.chars().take(MAX_NAME_LEN).collect())
            .spawn(move || {
                set_current_name(&thread_name);
                let tid = current_id();
                *id_slot_in_thread.lock().expect("thread id mutex poisoned") = tid;

                // Everything above must complete before the constructor is
                // allowed to observe this thread as started.
                ready_in_thread.notify();

                f();
            })
            .expect("failed to spawn OS thread");

        ready.wait();
        let id = *id_slot.lock().expect("thread id mutex poisoned");

        Self {
            id,
            name,
            handle: Some(handle),
        }
    }

    /// The diagnostic id this thread registered on startup.
    pub fn id(&self) -> u32 {
        self.id
    }

    /// The human-readable name this thread was given.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Blocks until the thread's callable returns. Idempotent: a second
    /// call is a no-op.
    pub fn join(&mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Thread {
    fn drop(&mut self) {
        // A `Thread` that is dropped while still joinable detaches rather
        // than blocking the dropping thread; callers that care about
        // ordered shutdown are expected to call `join()` themselves, as the
        // scheduler does.
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicBool;

    #[test]
    fn id_is_available_immediately() {
        let t = Thread::spawn("worker", || {
            std::thread::sleep(std::time::Duration::from_millis(10));
        });
        assert_ne!(t.id(), 0);
        assert_eq!(t.name(), "worker");
    }

    #[test]
    fn join_is_idempotent() {
        let ran = Arc::new(AtomicBool::new(false));
        let ran2 = ran.clone();
        let mut t = Thread::spawn("once", move || {
            ran2.store(true, Ordering::SeqCst);
        });
        t.join();
        t.join();
        assert!(ran.load(Ordering::SeqCst));
    }

    #[test]
    fn names_are_truncated() {
        let t = Thread::spawn("a-name-that-is-definitely-too-long-for-an-os-thread", || {});
        let mut t = t;
        t.join();
    }
}
