//! Short-term mutual exclusion locks. Never hold one across block-device
//! I/O; use `SleepLock` for that.

use core::ops::{Deref, DerefMut};

use super::Waitable;

pub struct SpinLock<T> {
    name: &'static str,
    inner: spin::Mutex<T>,
}

pub struct SpinLockGuard<'s, T> {
    lock: &'s SpinLock<T>,
    // None only transiently, while slept on a wait channel.
    guard: Option<spin::MutexGuard<'s, T>>,
}

impl<T> SpinLock<T> {
    pub const fn new(name: &'static str, data: T) -> Self {
        Self {
            name,
            inner: spin::Mutex::new(data),
        }
    }

    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        SpinLockGuard {
            lock: self,
            guard: Some(self.inner.lock()),
        }
    }

    pub fn try_lock(&self) -> Option<SpinLockGuard<'_, T>> {
        self.inner.try_lock().map(|guard| SpinLockGuard {
            lock: self,
            guard: Some(guard),
        })
    }

    /// Returns a mutable reference to the inner data without locking.
    pub fn get_mut(&mut self) -> &mut T {
        self.inner.get_mut()
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl<T> Waitable for SpinLockGuard<'_, T> {
    fn raw_release(&mut self) {
        self.guard = None;
    }

    fn raw_acquire(&mut self) {
        debug_assert!(self.guard.is_none(), "raw_acquire: {}", self.lock.name);
        self.guard = Some(self.lock.inner.lock());
    }
}

impl<T> Deref for SpinLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        self.guard.as_ref().expect("unlocked guard")
    }
}

impl<T> DerefMut for SpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.guard.as_mut().expect("unlocked guard")
    }
}
