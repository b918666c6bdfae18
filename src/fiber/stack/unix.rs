// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::fiber::stack::MIN_STACK_SIZE;
use crate::fiber::stack::valgrind::ValgrindStackRegistration;
use std::io::Error;
use std::mem::ManuallyDrop;
use std::ptr;

/// A `mmap`-backed fiber stack with a leading guard page.
///
/// The guard page is mapped `PROT_NONE` so a stack overflow faults instead of
/// silently corrupting whatever memory happens to sit below it.
pub struct FiberStack {
    top: usize,
    mmap_len: usize,
    valgrind: ManuallyDrop<ValgrindStackRegistration>,
}

impl FiberStack {
    /// Creates a new stack which has at least the given capacity.
    pub fn new(size: usize) -> std::io::Result<Self> {
        // Apply minimum stack size.
        let size = size.max(MIN_STACK_SIZE);

        // Add a guard page to the requested size and round the size up to
        // a page boundary.
        let page_size = page_size();
        let mmap_len = size
            .checked_add(page_size + page_size - 1)
            .expect("integer overflow while calculating stack size")
            & !(page_size - 1);

        let map_flags = libc::MAP_ANONYMOUS | libc::MAP_PRIVATE;

        unsafe {
            // Reserve some address space for the stack.
            let mmap = libc::mmap(ptr::null_mut(), mmap_len, libc::PROT_NONE, map_flags, -1, 0);
            if mmap == libc::MAP_FAILED {
                return Err(Error::last_os_error());
            }

            // Create the result here. If the mprotect call fails then this will
            // be dropped and the memory will be unmapped.
            let out = Self {
                top: mmap as usize + mmap_len,
                mmap_len,
                valgrind: ManuallyDrop::new(ValgrindStackRegistration::new(
                    mmap as *mut u8,
                    mmap_len,
                )),
            };

            // Make everything except the guard page writable.
            if libc::mprotect(
                mmap.cast::<u8>().add(page_size).cast(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
            ) != 0
            {
                return Err(Error::last_os_error());
            }

            Ok(out)
        }
    }

    /// Returns the highest address of the stack; this is the initial stack
    /// pointer value handed to the arch-specific `init_stack`.
    pub fn top(&self) -> usize {
        self.top
    }
}

impl Default for FiberStack {
    fn default() -> Self {
        Self::new(crate::config::default_stack_size() as usize).expect("failed to allocate stack")
    }
}

impl Drop for FiberStack {
    fn drop(&mut self) {
        unsafe {
            // De-register the stack first.
            ManuallyDrop::drop(&mut self.valgrind);

            let mmap = self.top - self.mmap_len;
            let ret = libc::munmap(mmap as *mut libc::c_void, self.mmap_len);
            debug_assert_eq!(ret, 0);
        }
    }
}

fn page_size() -> usize {
    let pagesize = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as usize;
    assert!(pagesize.is_power_of_two());
    pagesize
}
