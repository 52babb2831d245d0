//! Lock primitives without poisoning.
//!
//! [`std::sync::Mutex`] and [`std::sync::RwLock`] poison themselves when the thread holding the
//! lock panics. In this crate that happens routinely: a work unit or a [`SyncMap::range`] visitor
//! may panic while the group or map state is locked, and the panic is already forwarded to the
//! owner by [`TaskGroup::wait`]. Poisoning would only turn every later lock acquisition into a
//! knock-on `unwrap` failure that hides the original panic.
//!
//! The wrappers here recover the guard from a poisoned lock and otherwise behave like their
//! [`std::sync`] counterparts. Only the operations the crate needs are mirrored.
//!
//! [`SyncMap::range`]: crate::SyncMap::range
//! [`TaskGroup::wait`]: crate::TaskGroup::wait

use std::{
    ops::{Deref, DerefMut},
    sync::{self, LockResult, PoisonError},
};

fn unpoison<G>(result: LockResult<G>) -> G {
    result.unwrap_or_else(PoisonError::into_inner)
}

#[derive(Default)]
pub struct Mutex<T: ?Sized> {
    inner: sync::Mutex<T>,
}

impl<T> Mutex<T> {
    pub const fn new(t: T) -> Mutex<T> {
        Self {
            inner: sync::Mutex::new(t),
        }
    }
}

impl<T: ?Sized> Mutex<T> {
    pub fn lock(&self) -> MutexGuard<'_, T> {
        MutexGuard {
            inner: unpoison(self.inner.lock()),
        }
    }
}

pub struct MutexGuard<'a, T: ?Sized + 'a> {
    inner: sync::MutexGuard<'a, T>,
}

impl<'a, T: ?Sized + 'a> Deref for MutexGuard<'a, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl<'a, T: ?Sized + 'a> DerefMut for MutexGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.inner
    }
}

/// Condition variable paired with [`Mutex`].
#[derive(Debug, Default)]
pub struct Condvar {
    inner: sync::Condvar,
}

impl Condvar {
    pub const fn new() -> Condvar {
        Self {
            inner: sync::Condvar::new(),
        }
    }

    /// Blocks while `condition` returns `true`, releasing the lock while asleep.
    pub fn wait_while<'a, T, F>(&self, guard: MutexGuard<'a, T>, condition: F) -> MutexGuard<'a, T>
    where
        F: FnMut(&mut T) -> bool,
    {
        MutexGuard {
            inner: unpoison(self.inner.wait_while(guard.inner, condition)),
        }
    }

    pub fn notify_all(&self) {
        self.inner.notify_all();
    }
}

#[derive(Default)]
pub struct RwLock<T: ?Sized> {
    inner: sync::RwLock<T>,
}

impl<T> RwLock<T> {
    pub const fn new(t: T) -> RwLock<T> {
        Self {
            inner: sync::RwLock::new(t),
        }
    }
}

impl<T: ?Sized> RwLock<T> {
    pub fn read(&self) -> RwLockReadGuard<'_, T> {
        RwLockReadGuard {
            inner: unpoison(self.inner.read()),
        }
    }

    /// Attempts to take the read lock without blocking.
    ///
    /// Returns [`None`] if a writer currently holds the lock.
    pub fn try_read(&self) -> Option<RwLockReadGuard<'_, T>> {
        let inner = match self.inner.try_read() {
            Ok(guard) => guard,
            Err(sync::TryLockError::Poisoned(poison)) => poison.into_inner(),
            Err(sync::TryLockError::WouldBlock) => return None,
        };
        Some(RwLockReadGuard { inner })
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, T> {
        RwLockWriteGuard {
            inner: unpoison(self.inner.write()),
        }
    }
}

impl<T> From<T> for RwLock<T> {
    fn from(value: T) -> Self {
        RwLock::new(value)
    }
}

pub struct RwLockReadGuard<'a, T: ?Sized + 'a> {
    inner: sync::RwLockReadGuard<'a, T>,
}

impl<'a, T: ?Sized> Deref for RwLockReadGuard<'a, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

pub struct RwLockWriteGuard<'a, T: ?Sized + 'a> {
    inner: sync::RwLockWriteGuard<'a, T>,
}

impl<'a, T: ?Sized> Deref for RwLockWriteGuard<'a, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl<'a, T: ?Sized> DerefMut for RwLockWriteGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.inner
    }
}
