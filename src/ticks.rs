//! Monotonic tick counter.
//!
//! Stands in for the timer-interrupt-driven `ticks` global the cache
//! uses to stamp `last_use`; reads don't need synchronization beyond a
//! relaxed load. The real timer interrupt handler owns advancing this
//! on a booted kernel; [`advance`] is the hook a caller (or a test)
//! drives in its place.

use core::sync::atomic::{AtomicU64, Ordering};

static TICKS: AtomicU64 = AtomicU64::new(0);

/// Returns the current tick count.
///
/// `last_use` stamps only need monotonic ordering against each other, so
/// a relaxed load is sufficient.
pub fn now() -> u64 {
    TICKS.load(Ordering::Relaxed)
}

/// Advances the tick counter by one.
///
/// Called by the timer interrupt on real hardware; called directly by
/// tests that need `last_use` ordering to be observable.
pub fn advance() {
    TICKS.fetch_add(1, Ordering::Relaxed);
}
