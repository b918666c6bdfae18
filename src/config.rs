//! The single piece of configuration the core owns directly.
//!
//! Loading configuration from a textual document (TOML, YAML, whatever a
//! host application prefers) is explicitly out of scope for this crate --
//! see the purpose-and-scope section of the design docs. What the core does
//! own is the default stack size new fibers fall back to when constructed
//! with `stack_size: 0`. An external config loader is expected to call
//! [`set_default_stack_size`] once at startup after parsing its own
//! `fiber.stack_size` entry; until it does, [`default_stack_size`] returns
//! [`DEFAULT_STACK_SIZE`].

use std::sync::atomic::{AtomicU32, Ordering};

/// Name of the single configuration item the core reads, for the benefit of
/// an external config loader.
pub const STACK_SIZE_CONFIG_NAME: &str = "fiber.stack_size";

/// Default fiber stack size in bytes: 128 KiB.
pub const DEFAULT_STACK_SIZE: u32 = 128 * 1024;

static STACK_SIZE: AtomicU32 = AtomicU32::new(DEFAULT_STACK_SIZE);

/// Returns the currently configured default fiber stack size, in bytes.
pub fn default_stack_size() -> u32 {
    STACK_SIZE.load(Ordering::Relaxed)
}

/// Overrides the default fiber stack size used by fibers constructed with
/// `stack_size: 0`. Does not affect fibers that already exist.
pub fn set_default_stack_size(bytes: u32) {
    STACK_SIZE.store(bytes, Ordering::Relaxed);
}
