//! Hart (hardware thread) identification and interrupt masking.
//!
//! [`spinlock::SpinLock`](crate::spinlock::SpinLock) needs two things
//! from the platform it runs on: "which hart is this" (to detect a hart
//! re-acquiring a lock it already holds) and "mask interrupts while a
//! spin-lock is held" (spin-locks disable preemption while held so the
//! holder can't be interrupted and rescheduled onto the same lock).
//! Both are reduced to the narrowest possible hooks here, generalized
//! behind `cfg` so the crate's own test suite can run on a host thread
//! instead of a riscv hart.

/// Returns an identifier for the current hart, stable for the lifetime
/// of the calling thread of execution.
///
/// On the real target this is the riscv `tp` register, set once per
/// hart at boot. Under `cfg(test)` it is derived from the host OS
/// thread id, so concurrent `#[test]` functions exercising the lock
/// from multiple `std::thread`s still see distinct hart identities.
#[cfg(not(test))]
pub fn id() -> usize {
    let id: usize;
    unsafe {
        core::arch::asm!("mv {0}, tp", out(reg) id);
    }
    id
}

#[cfg(test)]
pub fn id() -> usize {
    use std::collections::HashMap;
    use std::sync::Mutex;

    static IDS: Mutex<Option<HashMap<std::thread::ThreadId, usize>>> = Mutex::new(None);

    let mut table = IDS.lock().unwrap();
    let table = table.get_or_insert_with(HashMap::new);
    let next = table.len();
    *table.entry(std::thread::current().id()).or_insert(next)
}

/// Disables interrupts on the current hart, returning whether they were
/// enabled beforehand.
///
/// Paired with [`restore`]. On the real target this would clear `sstatus.SIE`;
/// under test it is a no-op that always reports "was enabled", since a
/// host thread has no interrupt mask to save.
pub fn disable_interrupts() -> bool {
    #[cfg(not(test))]
    {
        let was_enabled: usize;
        unsafe {
            core::arch::asm!("csrrci {0}, sstatus, 2", out(reg) was_enabled);
        }
        was_enabled & 2 != 0
    }
    #[cfg(test)]
    {
        true
    }
}

/// Restores the interrupt-enabled state `disable_interrupts` reported.
pub fn restore_interrupts(was_enabled: bool) {
    #[cfg(not(test))]
    if was_enabled {
        unsafe {
            core::arch::asm!("csrsi sstatus, 2");
        }
    }
    #[cfg(test)]
    let _ = was_enabled;
}
