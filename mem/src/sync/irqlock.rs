// =============================================================================
// EmberRT — Interrupt-Safe Lock
// =============================================================================
//
// `IrqLock<T>` is the critical-section shim: every public allocator entry
// point funnels through one. It composes two layers:
//
//   1. The arch backend: mask local IRQs (ARM/ARM64) or suspend the
//      scheduler (other targets) BEFORE touching the lock.
//   2. A spin mutex providing in-language mutual exclusion and the `Sync`
//      bound a global heap singleton needs.
//
// IRQ SAFETY:
//   The masks go on before the lock is taken. Otherwise:
//     1. A task holds the heap lock with interrupts enabled
//     2. An interrupt fires on the same core
//     3. The handler allocates and spins on the heap lock
//     4. DEADLOCK — the task can't release the lock until the handler
//        returns
//   The previous mask state is saved and restored exactly on unlock, so
//   nested critical sections compose. This is NOT a recursive lock: one
//   critical section must never re-enter a public allocator call.
//
// ORDERING:
//   Within a single uninterruptible section there is nothing to race with;
//   the spin mutex's acquire/release pair covers the multi-thread case of
//   hosted test builds.
//
// =============================================================================

use core::ops::{Deref, DerefMut};

use crate::arch;

/// A spin lock that establishes the platform critical section while held.
///
/// # Examples
/// ```ignore
/// static HEAP: IrqLock<Heap> = IrqLock::new(Heap::new());
///
/// let mut heap = HEAP.lock();
/// heap.allocate(64);
/// // Critical section ends when the guard drops.
/// ```
pub struct IrqLock<T> {
    inner: spin::Mutex<T>,
}

impl<T> IrqLock<T> {
    /// Creates a new unlocked lock. `const` so it can live in a static.
    pub const fn new(value: T) -> Self {
        Self { inner: spin::Mutex::new(value) }
    }

    /// Enters the critical section and acquires the lock.
    ///
    /// Interrupts are masked (or the scheduler suspended) before the
    /// acquisition, and restored when the returned guard drops.
    pub fn lock(&self) -> IrqLockGuard<'_, T> {
        let irq_state = arch::critical_enter();
        let guard = self.inner.lock();
        IrqLockGuard { guard: Some(guard), irq_state: Some(irq_state) }
    }
}

/// RAII guard for a held [`IrqLock`].
///
/// While the guard exists the holder has exclusive access to the data and
/// the platform critical section is active. Dropping it releases the lock
/// first, then restores the saved interrupt/scheduler state.
pub struct IrqLockGuard<'a, T> {
    /// `Some` until dropped; released before the critical section ends.
    guard: Option<spin::MutexGuard<'a, T>>,
    /// Saved arch state; consumed on drop.
    irq_state: Option<arch::IrqState>,
}

impl<T> Deref for IrqLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.guard.as_ref().expect("guard present until drop")
    }
}

impl<T> DerefMut for IrqLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        self.guard.as_mut().expect("guard present until drop")
    }
}

impl<T> Drop for IrqLockGuard<'_, T> {
    fn drop(&mut self) {
        // Release the mutex while still masked, then leave the critical
        // section in the reverse of the acquisition order.
        drop(self.guard.take());
        if let Some(state) = self.irq_state.take() {
            arch::critical_exit(state);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_round_trip() {
        let lock = IrqLock::new(41);
        {
            let mut value = lock.lock();
            *value += 1;
        }
        assert_eq!(*lock.lock(), 42);
    }

    #[test]
    fn sequential_sections_compose() {
        static COUNTER: IrqLock<u32> = IrqLock::new(0);
        for _ in 0..10 {
            *COUNTER.lock() += 1;
        }
        assert_eq!(*COUNTER.lock(), 10);
    }
}
