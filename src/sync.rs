//! Synchronization primitives shared by [`crate::thread::Thread`] and
//! [`crate::scheduler::Scheduler`].
//!
//! `Mutex` and `RwLock` here are thin re-exports of the standard library's
//! scoped-guard primitives -- std's guards already release on every exit
//! path, including unwinding, which is exactly the contract the source's
//! hand-rolled `ScopedLockImpl`/`ReadScopedLockImpl`/`WriteScopedLockImpl`
//! were providing over raw `pthread_mutex_t`/`pthread_rwlock_t`. `Semaphore`
//! has no standard-library equivalent and is built from a `Mutex` + `Condvar`
//! pair, the idiomatic Rust rendition of a counting semaphore.

pub use std::sync::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

use std::sync::Condvar;

/// A classic counting semaphore: `wait` blocks while the count is zero,
/// `notify` increments the count and wakes one waiter.
///
/// Used by [`crate::thread::Thread`] to make its constructor block until the
/// spawned OS thread has finished publishing its identity.
#[derive(Debug)]
pub struct Semaphore {
    state: Mutex<u32>,
    cond: Condvar,
}

impl Semaphore {
    /// Creates a semaphore with the given initial count.
    pub fn new(count: u32) -> Self {
        Self {
            state: Mutex::new(count),
            cond: Condvar::new(),
        }
    }

    /// Blocks the calling thread until the count is non-zero, then
    /// decrements it.
    pub fn wait(&self) {
        let mut count = self.state.lock().expect("semaphore mutex poisoned");
        while *count == 0 {
            count = self.cond.wait(count).expect("semaphore mutex poisoned");
        }
        *count -= 1;
    }

    /// Increments the count and wakes one waiter, if any.
    pub fn notify(&self) {
        let mut count = self.state.lock().expect("semaphore mutex poisoned");
        *count += 1;
        self.cond.notify_one();
    }
}

impl Default for Semaphore {
    fn default() -> Self {
        Self::new(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn wait_blocks_until_notify() {
        let sem = Arc::new(Semaphore::new(0));
        let sem2 = sem.clone();

        let handle = thread::spawn(move || {
            sem2.wait();
        });

        thread::sleep(std::time::Duration::from_millis(20));
        sem.notify();
        handle.join().unwrap();
    }

    #[test]
    fn nonzero_initial_count_does_not_block() {
        let sem = Semaphore::new(1);
        sem.wait();
    }
}
