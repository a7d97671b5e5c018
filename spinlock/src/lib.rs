//! Implements a simple spin-lock based mutex.
//!
//! On a single CPU the lock mainly documents intent and catches accidental
//! reentrant calls; the spin path only matters once more CPUs show up.

#![cfg_attr(not(test), no_std)]

use core::cell::UnsafeCell;
use core::hint;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, Ordering};

pub struct Mutex<T> {
    locked: AtomicBool,
    guarded_value: UnsafeCell<T>,
}

impl<T> Mutex<T> {
    pub const fn new(value: T) -> Mutex<T> {
        Mutex {
            locked: AtomicBool::new(false),
            guarded_value: UnsafeCell::new(value),
        }
    }

    /// Spin until the lock is acquired.
    pub fn lock(&self) -> MutexGuard<'_, T> {
        loop {
            if let Some(guard) = self.try_lock() {
                return guard;
            }
            while self.is_locked() {
                hint::spin_loop();
            }
        }
    }

    /// Acquire the lock only if it is currently free.
    pub fn try_lock(&self) -> Option<MutexGuard<'_, T>> {
        if self
            .locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            Some(MutexGuard { mutex: self })
        } else {
            None
        }
    }

    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
    }

    /// Run `callback` with the lock held.
    pub fn with_lock<F, R>(&self, callback: F) -> R
    where
        F: FnOnce(&mut T) -> R,
    {
        let mut guard = self.lock();
        callback(&mut *guard)
    }

    /// Consume the mutex and return the guarded value.
    pub fn into_inner(self) -> T {
        self.guarded_value.into_inner()
    }
}

unsafe impl<T: Send> Send for Mutex<T> {}
unsafe impl<T: Send> Sync for Mutex<T> {}

pub struct MutexGuard<'a, T> {
    mutex: &'a Mutex<T>,
}

impl<'a, T> Deref for MutexGuard<'a, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.mutex.guarded_value.get() }
    }
}

impl<'a, T> DerefMut for MutexGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.mutex.guarded_value.get() }
    }
}

impl<'a, T> Drop for MutexGuard<'a, T> {
    fn drop(&mut self) {
        self.mutex.locked.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod test {
    use super::Mutex;

    #[test]
    fn lock_is_exclusive() {
        let mutex = Mutex::new(0_u32);

        {
            let guard = mutex.try_lock();
            assert!(guard.is_some(), "unlocked mutex must be lockable");

            let second = mutex.try_lock();
            assert!(second.is_none(), "mutex acquired twice");
        }

        // guard went out of scope, lock must be free again
        assert!(!mutex.is_locked());
        assert!(mutex.try_lock().is_some());
    }

    #[test]
    fn guard_gives_access_to_value() {
        let mutex = Mutex::new(21_u32);
        {
            let mut guard = mutex.lock();
            *guard *= 2;
        }
        assert_eq!(mutex.with_lock(|v| *v), 42);
    }

    #[test]
    fn contended_lock_from_threads() {
        use std::sync::Arc;

        let mutex = Arc::new(Mutex::new(0_u32));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let mutex = Arc::clone(&mutex);
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        *mutex.lock() += 1;
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(*mutex.lock(), 4000);
    }
}
