//! Mutex-guarded growable array.
//!
//! Every operation takes the array's single lock. Indexed access returns a
//! [`Guarded`] handle that keeps the lock held until it is dropped (or
//! [`Guarded::release`] is called), so the reference it hands out stays
//! valid. Hold it briefly: every other operation on the array waits for it.
//!
//! Iterating while other threads mutate is not supported. Take a
//! [`ConcurrentVec::snapshot`] (copied out under one lock) and work from
//! that instead, which is what the read loop does once per poll cycle.

use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Capacity added whenever an append finds the array full.
pub const GROWTH_INCREMENT: usize = 16;

/// A thread-safe growable array.
pub struct ConcurrentVec<T> {
    items: Mutex<Vec<T>>,
}

/// Locked handle to one element of a [`ConcurrentVec`].
pub struct Guarded<'a, T> {
    guard: MutexGuard<'a, Vec<T>>,
    index: usize,
}

impl<T> Guarded<'_, T> {
    /// Position of the element at the time the handle was taken.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Unlock the array before the handle would otherwise go out of scope.
    pub fn release(self) {}
}

impl<T> Deref for Guarded<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard[self.index]
    }
}

impl<T> DerefMut for Guarded<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard[self.index]
    }
}

impl<T> ConcurrentVec<T> {
    /// Create an empty array. Nothing is allocated until the first append.
    pub fn new() -> Self {
        Self {
            items: Mutex::new(Vec::new()),
        }
    }

    /// Create an array with room for `capacity` elements.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            items: Mutex::new(Vec::with_capacity(capacity)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<T>> {
        self.items.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append a value, growing by [`GROWTH_INCREMENT`] slots when full.
    pub fn push(&self, value: T) {
        let mut items = self.lock();
        if items.len() == items.capacity() {
            items.reserve_exact(GROWTH_INCREMENT);
        }
        items.push(value);
    }

    /// Locked access to the element at `index`, or `None` if out of range.
    pub fn get(&self, index: usize) -> Option<Guarded<'_, T>> {
        let guard = self.lock();
        if index < guard.len() {
            Some(Guarded { guard, index })
        } else {
            None
        }
    }

    /// Remove the element at `index`, shifting later elements down.
    pub fn erase_at(&self, index: usize) -> Option<T> {
        let mut items = self.lock();
        if index < items.len() {
            Some(items.remove(index))
        } else {
            None
        }
    }

    /// Remove the first element equal to `value`.
    ///
    /// Returns `true` if an element was removed.
    pub fn erase(&self, value: &T) -> bool
    where
        T: PartialEq,
    {
        let mut items = self.lock();
        match items.iter().position(|item| item == value) {
            Some(index) => {
                items.remove(index);
                true
            }
            None => false,
        }
    }

    /// Check whether an element equal to `value` is present.
    pub fn contains(&self, value: &T) -> bool
    where
        T: PartialEq,
    {
        self.lock().contains(value)
    }

    /// Copy every element out under a single lock.
    pub fn snapshot(&self) -> Vec<T>
    where
        T: Clone,
    {
        self.lock().clone()
    }

    /// Like [`snapshot`](Self::snapshot) but reuses the caller's buffer.
    pub fn snapshot_into(&self, out: &mut Vec<T>)
    where
        T: Clone,
    {
        out.clear();
        out.extend_from_slice(&self.lock());
    }

    /// Remove and return every element.
    pub fn drain(&self) -> Vec<T> {
        std::mem::take(&mut *self.lock())
    }

    /// Remove every element.
    pub fn clear(&self) {
        self.lock().clear();
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether the array is empty. A concurrent append may change this
    /// as soon as the call returns.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Number of elements the array can hold without growing.
    pub fn capacity(&self) -> usize {
        self.lock().capacity()
    }
}

impl<T> Default for ConcurrentVec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: fmt::Debug> fmt::Debug for ConcurrentVec<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.lock().iter()).finish()
    }
}
