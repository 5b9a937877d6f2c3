//! The lock module.
//!
//! Contains types for locks and lock guards that provide mutual exclusion,
//! plus the wait channel and counting semaphore built on top of them.

mod semaphore;
mod sleepablelock;
mod sleeplock;
mod spinlock;
mod wait_channel;

pub use semaphore::Semaphore;
pub use sleepablelock::{SleepableLock, SleepableLockGuard};
pub use sleeplock::{SleepLock, SleepLockGuard};
pub use spinlock::{SpinLock, SpinLockGuard};
pub use wait_channel::WaitChannel;

/// Lock guards that can be slept in a `WaitChannel`.
pub trait Waitable {
    /// Releases the inner lock.
    ///
    /// Must always be paired with `raw_acquire`. Do not access the guard's
    /// data between the two calls.
    fn raw_release(&mut self);

    /// Reacquires the inner lock.
    fn raw_acquire(&mut self);
}
