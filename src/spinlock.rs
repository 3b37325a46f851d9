//! A busy-wait mutex that disables interrupts on the current hart while
//! held.
//!
//! A CAS loop over an owner marker, an RAII guard, and interrupt
//! disable/restore around the critical section. The owning hart is
//! tracked as a plain [`hart::id`](crate::hart::id) rather than a
//! per-CPU struct, since there is no scheduler here to own one.

use core::cell::UnsafeCell;
use core::hint;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::hart;

const NO_OWNER: usize = usize::MAX;

/// A spin-lock guarding `T`.
///
/// Acquiring it disables interrupts on the current hart, so a holder
/// can't be interrupted and rescheduled back onto the same lock;
/// dropping the guard restores whatever interrupt state was in effect
/// before acquisition.
#[derive(Debug)]
pub struct SpinLock<T> {
    name: &'static str,
    locked: AtomicBool,
    owner: AtomicUsize,
    data: UnsafeCell<T>,
}

unsafe impl<T> Sync for SpinLock<T> where T: Send {}

/// An RAII guard releasing its [`SpinLock`] on drop.
#[derive(Debug)]
pub struct SpinLockGuard<'a, T> {
    lock: &'a SpinLock<T>,
    interrupts_were_enabled: bool,
}

unsafe impl<T> Sync for SpinLockGuard<'_, T> where T: Sync {}

impl<T> SpinLock<T> {
    pub const fn new(value: T, name: &'static str) -> Self {
        Self {
            name,
            locked: AtomicBool::new(false),
            owner: AtomicUsize::new(NO_OWNER),
            data: UnsafeCell::new(value),
        }
    }

    /// True if the current hart holds this lock.
    fn holding(&self) -> bool {
        self.locked.load(Ordering::Relaxed) && self.owner.load(Ordering::Relaxed) == hart::id()
    }

    /// Acquires the lock, spinning until it is free.
    ///
    /// Fatal if the current hart already holds it: a re-entrant
    /// acquisition can never make progress and is always a bug.
    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        let interrupts_were_enabled = hart::disable_interrupts();

        if self.holding() {
            crate::fatal!("spinlock {}: already held by this hart", self.name);
        }

        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            hint::spin_loop();
        }
        self.owner.store(hart::id(), Ordering::Relaxed);

        SpinLockGuard {
            lock: self,
            interrupts_were_enabled,
        }
    }

    /// Gives unsynchronized mutable access to the guarded data.
    ///
    /// # Safety
    /// The caller must already hold a lock this type's documented
    /// locking protocol designates as also covering this data — see
    /// [`crate::bcache`], whose bucket metadata is protected this way.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn get_mut_unchecked(&self) -> &mut T {
        unsafe { &mut *self.data.get() }
    }
}

impl<T> Drop for SpinLockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.owner.store(NO_OWNER, Ordering::Relaxed);
        self.lock.locked.store(false, Ordering::Release);
        hart::restore_interrupts(self.interrupts_were_enabled);
    }
}

impl<T> Deref for SpinLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for SpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn mutual_exclusion() {
        let lock = Arc::new(SpinLock::new(0usize, "test"));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let lock = Arc::clone(&lock);
            handles.push(thread::spawn(move || {
                for _ in 0..1000 {
                    *lock.lock() += 1;
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(*lock.lock(), 8000);
    }

    #[test]
    #[should_panic(expected = "already held")]
    fn reacquire_same_hart_is_fatal() {
        let lock = SpinLock::new((), "test");
        let _a = lock.lock();
        let _b = lock.lock();
    }
}
