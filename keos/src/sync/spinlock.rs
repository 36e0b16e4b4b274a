//! SMP-supported spinlock.
//!
//! A unicore spinlock is simple: it only needs to prevent the lock-holding
//! thread from being preempted while it holds the lock. On a single core
//! that is sufficient, because no other thread can run concurrently.
//!
//! On multiple cores, disabling preemption on one core is not enough, since
//! another core can still touch the protected data at the same time. An SMP
//! spinlock instead 1) polls a variable that records whether the lock is
//! held, 2) sets that variable atomically when a thread acquires the lock,
//! and 3) clears it when the thread releases the lock. Steps 1 and 2 must
//! happen atomically, which is exactly what [`spin::Mutex`] gives us.
//!
//! This module wraps the `spin` crate rather than re-deriving the
//! read-modify-write loop by hand, and keeps the explicit `unlock()` call
//! style the rest of this codebase uses at call sites, even though the
//! underlying guard also releases the lock on drop.

use core::ops::{Deref, DerefMut};

/// A mutual exclusion primitive useful for protecting shared data.
///
/// The spinlock busy-waits threads trying to acquire a lock already held
/// elsewhere. It is created via [`SpinLock::new`]; the protected data is
/// only reachable through the guard returned by [`lock`] or [`try_lock`].
///
/// [`lock`]: Self::lock
/// [`try_lock`]: Self::try_lock
///
/// # Examples
///
/// ```
/// use keos::sync::SpinLock;
///
/// let data = SpinLock::new(0);
/// {
///     let mut guard = data.lock();
///     *guard += 1;
///     // the lock is conventionally released explicitly at the call site...
///     guard.unlock();
/// }
/// // ...but dropping the guard without calling unlock() is equally correct.
/// assert_eq!(*data.lock(), 1);
/// ```
pub struct SpinLock<T: ?Sized> {
    inner: spin::Mutex<T>,
}

impl<T> SpinLock<T> {
    /// Creates a new spinlock in an unlocked state ready for use.
    pub const fn new(data: T) -> Self {
        Self {
            inner: spin::Mutex::new(data),
        }
    }

    /// Consumes this spinlock, returning the underlying data.
    pub fn into_inner(self) -> T {
        self.inner.into_inner()
    }
}

impl<T: ?Sized> SpinLock<T> {
    /// Acquires the lock, spinning until it becomes available.
    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        SpinLockGuard {
            inner: core::mem::ManuallyDrop::new(self.inner.lock()),
        }
    }

    /// Attempts to acquire the lock without blocking.
    pub fn try_lock(&self) -> Option<SpinLockGuard<'_, T>> {
        self.inner.try_lock().map(|g| SpinLockGuard {
            inner: core::mem::ManuallyDrop::new(g),
        })
    }

    /// Returns a mutable reference to the underlying data.
    ///
    /// Since this call borrows the spinlock mutably, no locking takes
    /// place -- the mutable borrow statically guarantees no concurrent
    /// access is possible.
    pub fn get_mut(&mut self) -> &mut T {
        self.inner.get_mut()
    }
}

// SAFETY: SpinLock<T> provides the same Sync bound spin::Mutex<T> does;
// it is a thin wrapper with no additional interior state.
unsafe impl<T: ?Sized + Send> Sync for SpinLock<T> {}
unsafe impl<T: ?Sized + Send> Send for SpinLock<T> {}

/// An RAII guard for a locked [`SpinLock`].
///
/// The lock is released either when the guard is dropped, or earlier when
/// [`unlock`] is called explicitly; both paths are equivalent.
///
/// [`unlock`]: Self::unlock
pub struct SpinLockGuard<'a, T: ?Sized + 'a> {
    inner: core::mem::ManuallyDrop<spin::MutexGuard<'a, T>>,
}

impl<T: ?Sized> SpinLockGuard<'_, T> {
    /// Releases the lock early.
    ///
    /// Equivalent to dropping the guard, spelled out for readability at
    /// call sites that hold the lock across several statements.
    pub fn unlock(self) {
        drop(self);
    }
}

impl<T: ?Sized> Deref for SpinLockGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.inner
    }
}

impl<T: ?Sized> DerefMut for SpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.inner
    }
}

impl<T: ?Sized> Drop for SpinLockGuard<'_, T> {
    fn drop(&mut self) {
        // SAFETY: `inner` is only ever dropped here, exactly once.
        unsafe { core::mem::ManuallyDrop::drop(&mut self.inner) }
    }
}
