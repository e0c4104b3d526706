//! Spin lock for the buffer pool's short critical sections.
//!
//! The pool's critical sections are a handful of pointer moves, so a full
//! mutex is overkill. Acquisition backs off in three stages: a bounded
//! busy-spin, a bounded yield loop, then a nanosecond sleep, repeated until
//! the lock is ours. Never hold the guard across IO.

use std::cell::UnsafeCell;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

const SPIN_COUNT: usize = 8;
const YIELD_COUNT: usize = 128;
const SLEEP: Duration = Duration::from_nanos(3);

/// Mutual exclusion via an atomic flag.
#[derive(Debug, Default)]
pub struct SpinLock<T> {
    locked: AtomicBool,
    value: UnsafeCell<T>,
}

// SAFETY: the flag guarantees exclusive access to `value` while a guard is
// alive, so sharing the lock across threads is sound whenever T itself can
// be sent between them.
unsafe impl<T: Send> Sync for SpinLock<T> {}

/// RAII guard; releases the lock on drop.
pub struct SpinGuard<'a, T> {
    lock: &'a SpinLock<T>,
}

impl<T> SpinLock<T> {
    pub const fn new(value: T) -> Self {
        Self {
            locked: AtomicBool::new(false),
            value: UnsafeCell::new(value),
        }
    }

    #[inline]
    fn try_acquire(&self) -> bool {
        !self.locked.swap(true, Ordering::Acquire)
    }

    /// Acquire the lock, backing off through spin, yield and sleep stages.
    pub fn lock(&self) -> SpinGuard<'_, T> {
        loop {
            for _ in 0..SPIN_COUNT {
                if self.try_acquire() {
                    return SpinGuard { lock: self };
                }
                std::hint::spin_loop();
            }
            for _ in 0..YIELD_COUNT {
                if self.try_acquire() {
                    return SpinGuard { lock: self };
                }
                std::thread::yield_now();
            }
            std::thread::sleep(SLEEP);
        }
    }
}

impl<T> Deref for SpinGuard<'_, T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        // SAFETY: the guard holds the lock, so no other reference exists
        unsafe { &*self.lock.value.get() }
    }
}

impl<T> DerefMut for SpinGuard<'_, T> {
    #[inline]
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: the guard holds the lock exclusively
        unsafe { &mut *self.lock.value.get() }
    }
}

impl<T> Drop for SpinGuard<'_, T> {
    #[inline]
    fn drop(&mut self) {
        self.lock.locked.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn counter_increments_are_not_lost() {
        let lock = Arc::new(SpinLock::new(0u64));
        let mut handles = Vec::new();
        for _ in 0..4 {
            let lock = Arc::clone(&lock);
            handles.push(std::thread::spawn(move || {
                for _ in 0..10_000 {
                    *lock.lock() += 1;
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(*lock.lock(), 40_000);
    }

    #[test]
    fn guard_releases_on_drop() {
        let lock = SpinLock::new(7);
        {
            let mut g = lock.lock();
            *g = 8;
        }
        assert_eq!(*lock.lock(), 8);
    }
}
