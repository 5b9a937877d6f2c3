//! Long-term locks for kernel objects. Unlike a `SpinLock`, a `SleepLock`
//! may be held across block-device I/O; waiters sleep instead of spinning
//! with the protecting spinlock held.

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};

use super::SleepableLock;

pub struct SleepLock<T> {
    /// Is the lock held?
    locked: SleepableLock<bool>,
    data: UnsafeCell<T>,
}

// SAFETY: the data is only reachable through a guard, which guarantees
// exclusive access while the lock is held.
unsafe impl<T: Send> Sync for SleepLock<T> {}
unsafe impl<T: Send> Send for SleepLock<T> {}

pub struct SleepLockGuard<'s, T> {
    lock: &'s SleepLock<T>,
}

impl<T> SleepLock<T> {
    pub const fn new(name: &'static str, data: T) -> Self {
        Self {
            locked: SleepableLock::new(name, false),
            data: UnsafeCell::new(data),
        }
    }

    pub fn lock(&self) -> SleepLockGuard<'_, T> {
        let mut guard = self.locked.lock();
        while *guard {
            guard.sleep();
        }
        *guard = true;
        drop(guard);
        SleepLockGuard { lock: self }
    }

    /// Acquires the lock only if it is free right now.
    pub fn try_lock(&self) -> Option<SleepLockGuard<'_, T>> {
        let mut guard = self.locked.lock();
        if *guard {
            None
        } else {
            *guard = true;
            Some(SleepLockGuard { lock: self })
        }
    }

    pub fn get_mut(&mut self) -> &mut T {
        unsafe { &mut *self.data.get() }
    }
}

impl<T> Drop for SleepLockGuard<'_, T> {
    fn drop(&mut self) {
        let mut guard = self.lock.locked.lock();
        *guard = false;
        guard.wakeup();
    }
}

impl<T> Deref for SleepLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        // SAFETY: the guard holds the lock.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for SleepLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        // SAFETY: the guard holds the lock exclusively.
        unsafe { &mut *self.lock.data.get() }
    }
}
