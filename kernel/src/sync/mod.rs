//! Synchronization primitives.
//!
//! The kernel uses one locking primitive of its own: a test-and-set
//! spinlock that disables interrupts on the local CPU while held. Without
//! that discipline a timer interrupt on the same CPU can recursively take
//! a lock its interrupted context already holds (e.g. a `kmalloc` from an
//! IRQ handler while the heap lock is taken).
//!
//! Lock ordering, outermost to innermost, is: socket table, VMM per-root,
//! PMM per-zone, slab heap. The scheduler run-queue lock stands alone and
//! is only ever handed across the context-switch primitive.

use core::{
    cell::UnsafeCell,
    ops::{Deref, DerefMut},
    sync::atomic::{AtomicBool, Ordering},
};

/// A test-and-set spinlock that masks local interrupts for the duration of
/// the critical section.
pub struct SpinLock<T> {
    locked: AtomicBool,
    value: UnsafeCell<T>,
}

// SAFETY: SpinLock provides mutual exclusion via the atomic `locked` flag,
// so the inner value is only ever accessed by one CPU at a time. T: Send is
// sufficient because the lock serializes all access.
unsafe impl<T: Send> Send for SpinLock<T> {}
// SAFETY: See above -- shared references to the lock only yield access to
// the inner value through the guard, which holds the lock.
unsafe impl<T: Send> Sync for SpinLock<T> {}

impl<T> SpinLock<T> {
    /// Create a new unlocked spinlock.
    pub const fn new(value: T) -> Self {
        Self {
            locked: AtomicBool::new(false),
            value: UnsafeCell::new(value),
        }
    }

    /// Acquire the lock, spinning until it is free.
    ///
    /// Local interrupts are disabled before the acquire attempt and their
    /// previous state is restored when the guard drops. The spin loop does
    /// relaxed reads between acquire attempts so contended CPUs do not
    /// hammer the cache line with exclusive requests.
    pub fn lock(&self) -> SpinGuard<'_, T> {
        let were_enabled = arch_disable_interrupts();

        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            while self.locked.load(Ordering::Relaxed) {
                core::hint::spin_loop();
            }
        }

        SpinGuard {
            lock: self,
            restore_interrupts: were_enabled,
        }
    }

    /// Release a lock whose guard was forgotten across a context switch.
    ///
    /// # Safety
    ///
    /// The caller must be the logical owner of the lock: the guard must
    /// have been leaked with [`core::mem::forget`] on the outgoing side of
    /// a context switch, and no other release for the same acquisition may
    /// happen. Interrupt state is NOT restored; the caller is responsible
    /// for re-enabling interrupts if appropriate.
    pub unsafe fn force_unlock(&self) {
        self.locked.store(false, Ordering::Release);
    }
}

/// RAII guard for [`SpinLock`]. Releases the lock and restores the saved
/// interrupt state on drop.
pub struct SpinGuard<'a, T> {
    lock: &'a SpinLock<T>,
    restore_interrupts: bool,
}

impl<T> Deref for SpinGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: The guard proves the lock is held, so no other reference
        // to the inner value exists.
        unsafe { &*self.lock.value.get() }
    }
}

impl<T> DerefMut for SpinGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: Same as Deref -- exclusive access is guaranteed while the
        // guard is alive.
        unsafe { &mut *self.lock.value.get() }
    }
}

impl<T> Drop for SpinGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.locked.store(false, Ordering::Release);
        if self.restore_interrupts {
            arch_enable_interrupts();
        }
    }
}

/// Disable local interrupts, returning whether they were enabled.
#[cfg(target_os = "none")]
fn arch_disable_interrupts() -> bool {
    let enabled = x86_64::instructions::interrupts::are_enabled();
    x86_64::instructions::interrupts::disable();
    enabled
}

#[cfg(target_os = "none")]
fn arch_enable_interrupts() {
    x86_64::instructions::interrupts::enable();
}

// Hosted builds have no interrupt flag to manage.
#[cfg(not(target_os = "none"))]
fn arch_disable_interrupts() -> bool {
    false
}

#[cfg(not(target_os = "none"))]
fn arch_enable_interrupts() {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_guards_value() {
        let lock = SpinLock::new(41);
        {
            let mut guard = lock.lock();
            *guard += 1;
        }
        assert_eq!(*lock.lock(), 42);
    }

    #[test]
    fn test_sequential_reacquire() {
        let lock = SpinLock::new(0u32);
        for _ in 0..100 {
            *lock.lock() += 1;
        }
        assert_eq!(*lock.lock(), 100);
    }

    #[test]
    fn test_force_unlock_releases() {
        let lock = SpinLock::new(());
        let guard = lock.lock();
        core::mem::forget(guard);
        // SAFETY: The guard above was forgotten, so this thread still owns
        // the lock and may release it exactly once.
        unsafe { lock.force_unlock() };
        drop(lock.lock());
    }
}
