//! One-time initialized cells.
//!
//! The kernel variables record is written exactly once by the BSP before
//! any secondary CPU or task can observe it; these cells encode that
//! hand-off without `static mut`.

use core::sync::atomic::{AtomicPtr, Ordering};

use spin::Mutex;

extern crate alloc;

/// A cell that can be written to only once.
///
/// Similar to `std::sync::OnceLock` but usable in no_std contexts.
pub struct OnceLock<T> {
    inner: AtomicPtr<T>,
}

impl<T> Default for OnceLock<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> OnceLock<T> {
    /// Create a new empty OnceLock
    pub const fn new() -> Self {
        Self {
            inner: AtomicPtr::new(core::ptr::null_mut()),
        }
    }

    /// Get the value if initialized
    pub fn get(&self) -> Option<&'static T> {
        let ptr = self.inner.load(Ordering::Acquire);
        if ptr.is_null() {
            None
        } else {
            // SAFETY: A non-null pointer was stored by `set()` via
            // `Box::into_raw()`, so it refers to a live, leaked `T`. The
            // Acquire load synchronizes-with the Release in `set()`, so the
            // pointee is fully initialized before we read it.
            Some(unsafe { &*ptr })
        }
    }

    /// Initialize the cell with a value.
    ///
    /// Returns `Ok(())` on first initialization, `Err(value)` if the cell
    /// was already set.
    pub fn set(&self, value: T) -> Result<(), T> {
        let boxed = alloc::boxed::Box::new(value);
        let ptr = alloc::boxed::Box::into_raw(boxed);

        match self.inner.compare_exchange(
            core::ptr::null_mut(),
            ptr,
            Ordering::Release,
            Ordering::Acquire,
        ) {
            Ok(_) => Ok(()),
            Err(_) => {
                // SAFETY: `ptr` came from `Box::into_raw` above and the
                // compare_exchange failed, so nobody else took ownership of
                // it; reclaiming avoids a leak.
                let boxed = unsafe { alloc::boxed::Box::from_raw(ptr) };
                Err(*boxed)
            }
        }
    }

    /// Get or initialize the value
    pub fn get_or_init<F>(&self, f: F) -> &'static T
    where
        F: FnOnce() -> T,
    {
        if let Some(val) = self.get() {
            return val;
        }
        let _ = self.set(f());
        self.get().expect("OnceLock get failed after set")
    }
}

// SAFETY: The inner value is heap-allocated and reached through an AtomicPtr
// with Acquire/Release ordering; transferring the cell moves ownership of
// that allocation, which is sound when T itself is Send.
unsafe impl<T: Send> Send for OnceLock<T> {}
// SAFETY: `get()` hands out shared references only after the Release store
// in `set()` is visible, and `set()` wins at most once via compare_exchange,
// so shared access is data-race free when T is Sync.
unsafe impl<T: Send + Sync> Sync for OnceLock<T> {}

impl<T> Drop for OnceLock<T> {
    fn drop(&mut self) {
        let ptr = self.inner.load(Ordering::Acquire);
        if !ptr.is_null() {
            // SAFETY: The pointer was created by `Box::into_raw` in `set()`
            // and `drop(&mut self)` guarantees exclusive access, so the
            // allocation can be reclaimed exactly once.
            unsafe {
                let _ = alloc::boxed::Box::from_raw(ptr);
            }
        }
    }
}

/// Mutex-guarded global state that is initialized once and then shared.
pub struct GlobalState<T> {
    inner: Mutex<Option<T>>,
}

impl<T> GlobalState<T> {
    /// Create new uninitialized global state
    pub const fn new() -> Self {
        Self {
            inner: Mutex::new(None),
        }
    }

    /// Initialize the global state
    pub fn init(&self, value: T) -> Result<(), T> {
        let mut lock = self.inner.lock();
        if lock.is_some() {
            Err(value)
        } else {
            *lock = Some(value);
            Ok(())
        }
    }

    /// Get reference with closure
    pub fn with<R, F: FnOnce(&T) -> R>(&self, f: F) -> Option<R> {
        let lock = self.inner.lock();
        lock.as_ref().map(f)
    }

    /// Get mutable reference with closure
    pub fn with_mut<R, F: FnOnce(&mut T) -> R>(&self, f: F) -> Option<R> {
        let mut lock = self.inner.lock();
        lock.as_mut().map(f)
    }
}

impl<T> Default for GlobalState<T> {
    fn default() -> Self {
        Self::new()
    }
}

// SAFETY: The spin::Mutex serializes all access to the inner Option<T>, so
// sharing the wrapper across threads cannot race when T is Send.
unsafe impl<T: Send> Send for GlobalState<T> {}
// SAFETY: Same argument as Send; each caller gets exclusive access through
// the lock guard, so T only needs Send.
unsafe impl<T: Send> Sync for GlobalState<T> {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn once_lock_single_init() {
        let lock = OnceLock::new();
        assert!(lock.get().is_none());

        assert!(lock.set(42).is_ok());
        assert_eq!(*lock.get().unwrap(), 42);

        // Second set must fail and return the rejected value
        assert_eq!(lock.set(100), Err(100));
        assert_eq!(*lock.get().unwrap(), 42);
    }

    #[test]
    fn global_state_with_mut() {
        let state: GlobalState<i32> = GlobalState::new();
        assert!(state.with(|_| ()).is_none());
        assert!(state.init(1).is_ok());
        state.with_mut(|v| *v += 9);
        assert_eq!(state.with(|v| *v), Some(10));
    }
}
