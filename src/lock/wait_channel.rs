use core::hint;
use core::sync::atomic::{AtomicUsize, Ordering};

use super::Waitable;

/// A place to sleep waiting for a condition guarded by a lock.
///
/// Wakeups are broadcast and may be spurious; callers recheck their
/// condition in a loop, as with any condition variable.
pub struct WaitChannel {
    generation: AtomicUsize,
}

impl WaitChannel {
    pub const fn new() -> Self {
        Self {
            generation: AtomicUsize::new(0),
        }
    }

    /// Atomically releases the guard's lock and sleeps on this channel,
    /// reacquiring the lock before returning.
    ///
    /// The ticket is taken while the lock is still held, so a wakeup
    /// issued by anyone who mutates the guarded condition afterwards
    /// cannot be missed.
    pub fn sleep<G: Waitable>(&self, guard: &mut G) {
        let ticket = self.generation.load(Ordering::Acquire);
        guard.raw_release();
        while self.generation.load(Ordering::Acquire) == ticket {
            hint::spin_loop();
        }
        guard.raw_acquire();
    }

    /// Wakes up every sleeper on this channel.
    pub fn wakeup(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
    }
}
