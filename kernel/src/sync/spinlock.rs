//! Interrupt-safe spinlock
//!
//! A `spin::Mutex` that additionally keeps interrupts disabled while the
//! guard lives. Taking an IRQ while holding a lock that an interrupt
//! handler may also take deadlocks a single CPU; every kernel-global table
//! uses this type instead of a bare `spin::Mutex`.

use core::ops::{Deref, DerefMut};

use spin::{Mutex, MutexGuard};

use crate::arch::{irq_restore, irq_save_disable, IrqState};

/// Spinlock whose critical sections run with interrupts disabled.
pub struct IrqSpinlock<T> {
    inner: Mutex<T>,
}

/// Guard for [`IrqSpinlock`]; restores the interrupt state on drop.
pub struct IrqSpinlockGuard<'a, T> {
    guard: Option<MutexGuard<'a, T>>,
    irq: IrqState,
}

impl<T> IrqSpinlock<T> {
    pub const fn new(value: T) -> Self {
        Self {
            inner: Mutex::new(value),
        }
    }

    /// Disable interrupts, then spin until the lock is acquired.
    pub fn lock(&self) -> IrqSpinlockGuard<'_, T> {
        let irq = irq_save_disable();
        IrqSpinlockGuard {
            guard: Some(self.inner.lock()),
            irq,
        }
    }

    /// Try to acquire without spinning. Interrupt state is untouched on
    /// failure.
    pub fn try_lock(&self) -> Option<IrqSpinlockGuard<'_, T>> {
        let irq = irq_save_disable();
        match self.inner.try_lock() {
            Some(guard) => Some(IrqSpinlockGuard {
                guard: Some(guard),
                irq,
            }),
            None => {
                irq_restore(irq);
                None
            }
        }
    }

    /// Whether the lock is currently held by someone.
    pub fn is_locked(&self) -> bool {
        self.inner.is_locked()
    }
}

impl<T> Deref for IrqSpinlockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.guard.as_ref().unwrap()
    }
}

impl<T> DerefMut for IrqSpinlockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        self.guard.as_mut().unwrap()
    }
}

impl<T> Drop for IrqSpinlockGuard<'_, T> {
    fn drop(&mut self) {
        // Release the lock before re-enabling interrupts.
        self.guard.take();
        irq_restore(self.irq);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_roundtrip() {
        let lock = IrqSpinlock::new(41);
        {
            let mut g = lock.lock();
            *g += 1;
        }
        assert_eq!(*lock.lock(), 42);
    }

    #[test]
    fn try_lock_fails_while_held() {
        let lock = IrqSpinlock::new(());
        let g = lock.lock();
        assert!(lock.try_lock().is_none());
        drop(g);
        assert!(lock.try_lock().is_some());
    }
}
