//! Locks whose guards can sleep, i.e. a lock paired with a condition
//! variable over its own data.

use core::ops::{Deref, DerefMut};

use super::{SpinLock, SpinLockGuard, WaitChannel};

pub struct SleepableLock<T> {
    inner: SpinLock<T>,
    /// Sleepers waiting for the guarded condition to change.
    waitchannel: WaitChannel,
}

pub struct SleepableLockGuard<'s, T> {
    waitchannel: &'s WaitChannel,
    guard: SpinLockGuard<'s, T>,
}

impl<T> SleepableLock<T> {
    pub const fn new(name: &'static str, data: T) -> Self {
        Self {
            inner: SpinLock::new(name, data),
            waitchannel: WaitChannel::new(),
        }
    }

    pub fn lock(&self) -> SleepableLockGuard<'_, T> {
        SleepableLockGuard {
            waitchannel: &self.waitchannel,
            guard: self.inner.lock(),
        }
    }

    pub fn get_mut(&mut self) -> &mut T {
        self.inner.get_mut()
    }
}

impl<T> SleepableLockGuard<'_, T> {
    /// Releases the lock, sleeps until woken, and reacquires it.
    pub fn sleep(&mut self) {
        self.waitchannel.sleep(&mut self.guard);
    }

    /// Wakes every guard sleeping on this lock.
    pub fn wakeup(&self) {
        self.waitchannel.wakeup();
    }
}

impl<T> Deref for SleepableLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.guard
    }
}

impl<T> DerefMut for SleepableLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.guard
    }
}
