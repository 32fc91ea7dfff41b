//! Spin-based mutual exclusion lock.
//!
//! Uses test-and-test-and-set (TTAS) to reduce cache-line contention.
//! Const-constructable so it can be placed in `static` items.

use core::cell::UnsafeCell;
use core::fmt;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, Ordering};

/// A spin-based mutual exclusion lock.
///
/// Each kernel subsystem guards its state with its own `SpinLock`: the tick
/// counter, the sleep queue, the process table, and the frame arena are all
/// serialized independently.
pub struct SpinLock<T> {
    locked: AtomicBool,
    name: &'static str,
    data: UnsafeCell<T>,
}

// SAFETY: The lock provides exclusive access to `T` via atomic operations.
// `T: Send` is required because the data may be accessed from any thread.
unsafe impl<T: Send> Send for SpinLock<T> {}
unsafe impl<T: Send> Sync for SpinLock<T> {}

impl<T> SpinLock<T> {
    /// Creates a new unlocked `SpinLock` wrapping `value`.
    pub const fn new(value: T) -> Self {
        Self {
            locked: AtomicBool::new(false),
            name: "<unnamed>",
            data: UnsafeCell::new(value),
        }
    }

    /// Creates a new unlocked `SpinLock` with a name for diagnostics.
    pub const fn named(name: &'static str, value: T) -> Self {
        Self {
            locked: AtomicBool::new(false),
            name,
            data: UnsafeCell::new(value),
        }
    }

    /// Acquires the lock, spinning until it becomes available.
    ///
    /// Returns a [`SpinLockGuard`] that releases the lock when dropped.
    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        loop {
            // Fast path: try to acquire directly.
            if self
                .locked
                .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                return SpinLockGuard { lock: self };
            }

            // TTAS: spin on a read (shared cache line) until it looks free.
            while self.locked.load(Ordering::Relaxed) {
                core::hint::spin_loop();
            }
        }
    }

    /// Attempts to acquire the lock without blocking.
    ///
    /// Returns `Some(guard)` if the lock was acquired, `None` if it was
    /// already held. Useful in paths that must not deadlock, such as panic
    /// diagnostics.
    pub fn try_lock(&self) -> Option<SpinLockGuard<'_, T>> {
        if self
            .locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            Some(SpinLockGuard { lock: self })
        } else {
            None
        }
    }

    /// Returns a mutable reference to the underlying data.
    ///
    /// Statically exclusive access makes locking unnecessary.
    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }
}

impl<T> fmt::Debug for SpinLock<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpinLock")
            .field("name", &self.name)
            .field("locked", &self.locked.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

/// RAII guard that releases the [`SpinLock`] when dropped.
pub struct SpinLockGuard<'a, T> {
    lock: &'a SpinLock<T>,
}

impl<T> Deref for SpinLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: The guard guarantees exclusive access while it exists.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for SpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: The guard guarantees exclusive access while it exists.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for SpinLockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.locked.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_unlock() {
        let lock = SpinLock::new(42);
        {
            let guard = lock.lock();
            assert_eq!(*guard, 42);
        }
        // Lock is released after the guard is dropped.
        assert!(lock.try_lock().is_some());
    }

    #[test]
    fn try_lock_fails_when_held() {
        let lock = SpinLock::new(10);
        let _guard = lock.lock();
        assert!(lock.try_lock().is_none());
    }

    #[test]
    fn mutate_through_guard() {
        let lock = SpinLock::new(0);
        {
            let mut guard = lock.lock();
            *guard = 99;
        }
        assert_eq!(*lock.lock(), 99);
    }

    #[test]
    fn get_mut_bypasses_locking() {
        let mut lock = SpinLock::new(5);
        *lock.get_mut() += 1;
        assert_eq!(*lock.lock(), 6);
    }

    #[test]
    fn named_constructor() {
        let lock = SpinLock::named("test_lock", 42);
        assert_eq!(*lock.lock(), 42);
        assert!(format!("{lock:?}").contains("test_lock"));
    }

    #[test]
    fn contended_lock_from_threads() {
        use std::sync::Arc;

        let lock = Arc::new(SpinLock::new(0u64));
        let mut handles = Vec::new();
        for _ in 0..4 {
            let lock = Arc::clone(&lock);
            handles.push(std::thread::spawn(move || {
                for _ in 0..1000 {
                    *lock.lock() += 1;
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(*lock.lock(), 4000);
    }
}
