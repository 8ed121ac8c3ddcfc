//! LockCell implementations
//!
//! [SpinLock] is the only [LockCell] used by the drivers. It guards per-queue
//! state that is touched both by the submitting core and by interrupt-driven
//! completion handling.

use core::{
    cell::UnsafeCell,
    fmt::Display,
    hint::spin_loop,
    marker::PhantomData,
    ops::{Deref, DerefMut},
    sync::atomic::{AtomicBool, Ordering},
};

/// unsafe internals used by [LockCell]s and [LockCellGuard].
///
/// Normally this shouldn't be used unless you implement a [LockCell].
#[doc(hidden)]
pub trait LockCellInternal<T> {
    /// Returns a reference to the data behind the mutex
    ///
    /// # Safety:
    ///
    /// this thread needs to hold the lock
    unsafe fn get(&self) -> &T;

    /// Returns a mutable reference to the data behind the mutex
    ///
    /// # Safety:
    ///
    /// this thread needs to hold the lock
    #[allow(clippy::mut_from_ref)]
    unsafe fn get_mut(&self) -> &mut T;

    /// unlocks the mutex
    ///
    /// # Safety:
    ///
    /// this should only be called when the [LockCellGuard] corresponding to this
    /// LockCell is droped.
    unsafe fn unlock(&self);
}

/// A trait representing a lock cell that guards simultaneus access to a value.
pub trait LockCell<T>: LockCellInternal<T> {
    /// gives out access to the value of this lock. Blocks until access is granted.
    fn lock(&self) -> LockCellGuard<'_, T, Self>;

    /// gives out access to the value of this lock if it is currently free.
    fn try_lock(&self) -> Option<LockCellGuard<'_, T, Self>>;
}

/// Guard giving access to the value of a [LockCell]. The lock is released on drop.
#[derive(Debug)]
pub struct LockCellGuard<'l, T, M: ?Sized + LockCellInternal<T>> {
    mutex: &'l M,
    // the guard must stay on the core that took the lock
    _t: PhantomData<(T, *mut ())>,
}

impl<T, M: ?Sized + LockCellInternal<T>> Deref for LockCellGuard<'_, T, M> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        // Safety: There can always be only 1 guard for a given mutex so this is safe
        unsafe { self.mutex.get() }
    }
}

impl<T, M: ?Sized + LockCellInternal<T>> DerefMut for LockCellGuard<'_, T, M> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        // Safety: There can always be only 1 guard for a given mutex so this is safe
        unsafe { self.mutex.get_mut() }
    }
}

impl<T: Display, M: ?Sized + LockCellInternal<T>> Display for LockCellGuard<'_, T, M> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        (**self).fmt(f)
    }
}

impl<T, M: ?Sized + LockCellInternal<T>> Drop for LockCellGuard<'_, T, M> {
    fn drop(&mut self) {
        // Safety: the guard is the only holder of the lock
        unsafe { self.mutex.unlock() }
    }
}

/// A simple spin lock
#[derive(Debug)]
pub struct SpinLock<T> {
    open: AtomicBool,
    data: UnsafeCell<T>,
}

unsafe impl<T: Send> Send for SpinLock<T> {}
unsafe impl<T: Send> Sync for SpinLock<T> {}

impl<T> LockCellInternal<T> for SpinLock<T> {
    unsafe fn get(&self) -> &T {
        unsafe { &*self.data.get() }
    }

    unsafe fn get_mut(&self) -> &mut T {
        unsafe { &mut *self.data.get() }
    }

    unsafe fn unlock(&self) {
        self.open.store(true, Ordering::Release);
    }
}

impl<T> SpinLock<T> {
    /// Creates a new unlocked [SpinLock]
    pub const fn new(data: T) -> Self {
        Self {
            open: AtomicBool::new(true),
            data: UnsafeCell::new(data),
        }
    }

    /// Access the value without locking, which is possible because of the `&mut self`
    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }

    /// Consumes the lock and returns the inner value
    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }

    /// returns `true` if the lock is currently held
    pub fn is_locked(&self) -> bool {
        !self.open.load(Ordering::Relaxed)
    }
}

impl<T> LockCell<T> for SpinLock<T> {
    fn lock(&self) -> LockCellGuard<'_, T, Self> {
        loop {
            if let Some(guard) = self.try_lock() {
                return guard;
            }
            while self.is_locked() {
                spin_loop();
            }
        }
    }

    fn try_lock(&self) -> Option<LockCellGuard<'_, T, Self>> {
        self.open
            .compare_exchange(true, false, Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| LockCellGuard {
                mutex: self,
                _t: PhantomData,
            })
    }
}

impl<T: Default> Default for SpinLock<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T> From<T> for SpinLock<T> {
    fn from(value: T) -> Self {
        Self::new(value)
    }
}
