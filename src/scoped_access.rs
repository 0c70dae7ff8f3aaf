// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// A shared segment paired with a named mutex whose key is derived from the
// segment key. Data is reachable only through a ScopedAccess guard, which
// holds the mutex for its lifetime.

use std::fmt;
use std::marker::PhantomData;
use std::ops::{Deref, DerefMut};
use std::ptr;

use tracing::warn;

use crate::error::{IpcError, IpcResult};
use crate::mutex::NamedMutex;
use crate::shm::SharedMemorySegment;
use crate::typed::ShmSafe;

/// Suffix appended to a segment key to name its lock.
pub const LOCK_SUFFIX: &str = "#lock";

/// Key of the mutex guarding the segment `key`.
///
/// Any process that knows a segment's key can find its lock this way.
pub fn lock_key(key: &str) -> String {
    format!("{key}{LOCK_SUFFIX}")
}

/// A named, lockable block of shared memory holding one `T`.
///
/// Every read and write goes through [`lock`](Self::lock) or
/// [`try_lock`](Self::try_lock), so all processes using the same key are
/// serialised by the paired [`NamedMutex`].
///
/// Because the lock key is `key` plus [`LOCK_SUFFIX`], the usable key length
/// is the platform limit minus the suffix length.
pub struct GuardedSharedMemory<T: ShmSafe> {
    segment: SharedMemorySegment,
    mutex: NamedMutex,
    _marker: PhantomData<T>,
}

impl<T: ShmSafe> GuardedSharedMemory<T> {
    /// Open or create segment `key` and its lock. Inert if either fails.
    pub fn new(key: &str) -> Self {
        Self {
            segment: SharedMemorySegment::new(key, std::mem::size_of::<T>()),
            mutex: NamedMutex::new(&lock_key(key)),
            _marker: PhantomData,
        }
    }

    /// Like [`new`](Self::new) but returns the first construction error.
    pub fn open(key: &str) -> IpcResult<Self> {
        let segment = SharedMemorySegment::open(key, std::mem::size_of::<T>())?;
        let mutex = NamedMutex::open(&lock_key(key))?;
        Ok(Self { segment, mutex, _marker: PhantomData })
    }

    /// Whether both the segment and its lock are open.
    pub fn is_valid(&self) -> bool {
        self.segment.is_valid() && self.mutex.is_valid()
    }

    /// The first construction error, if any.
    pub fn error(&self) -> Option<&IpcError> {
        self.segment.error().or_else(|| self.mutex.error())
    }

    pub fn key(&self) -> &str {
        self.segment.key()
    }

    pub fn lock_key(&self) -> &str {
        self.mutex.key()
    }

    pub fn segment(&self) -> &SharedMemorySegment {
        &self.segment
    }

    fn ensure_mapped(&self) -> IpcResult<()> {
        if self.segment.is_valid() {
            return Ok(());
        }
        Err(IpcError::Inert {
            primitive: "GuardedSharedMemory",
            key: self.segment.key().to_owned(),
        })
    }

    /// Block until the lock is held and return the guard.
    pub fn lock(&mut self) -> IpcResult<ScopedAccess<'_, T>> {
        self.ensure_mapped()?;
        self.mutex.lock()?;
        Ok(ScopedAccess::new(&self.segment, &mut self.mutex))
    }

    /// Take the lock if it is free; `Ok(None)` when another owner holds it.
    pub fn try_lock(&mut self) -> IpcResult<Option<ScopedAccess<'_, T>>> {
        self.ensure_mapped()?;
        if !self.mutex.try_lock()? {
            return Ok(None);
        }
        Ok(Some(ScopedAccess::new(&self.segment, &mut self.mutex)))
    }
}

impl<T: ShmSafe> fmt::Debug for GuardedSharedMemory<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GuardedSharedMemory")
            .field("segment", &self.segment)
            .field("mutex", &self.mutex)
            .finish()
    }
}

/// RAII guard: the paired mutex is held while it lives and released on drop.
/// Dereferences to the shared `T`.
pub struct ScopedAccess<'a, T: ShmSafe> {
    segment: &'a SharedMemorySegment,
    mutex: &'a mut NamedMutex,
    _marker: PhantomData<&'a mut T>,
}

impl<'a, T: ShmSafe> ScopedAccess<'a, T> {
    fn new(segment: &'a SharedMemorySegment, mutex: &'a mut NamedMutex) -> Self {
        Self { segment, mutex, _marker: PhantomData }
    }

    fn value_ptr(&self) -> *mut T {
        self.segment.as_mut_ptr() as *mut T
    }

    /// The whole segment as bytes.
    pub fn bytes(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.segment.as_ptr(), self.segment.size()) }
    }

    /// Write `buf` at the start of the segment.
    ///
    /// # Errors
    /// [`IpcError::InvalidSize`] if `buf` is larger than the segment.
    pub fn write_bytes(&mut self, buf: &[u8]) -> IpcResult<()> {
        self.segment.write_bytes(buf)
    }

    /// Release the lock now instead of at drop, reporting the OS result.
    pub fn unlock(self) -> IpcResult<()> {
        let mut this = std::mem::ManuallyDrop::new(self);
        this.mutex.unlock()
    }
}

impl<T: ShmSafe> Deref for ScopedAccess<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.value_ptr() }
    }
}

impl<T: ShmSafe> DerefMut for ScopedAccess<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.value_ptr() }
    }
}

impl<T: ShmSafe + Copy> ScopedAccess<'_, T> {
    /// Copy the value out.
    pub fn get(&self) -> T {
        unsafe { ptr::read_volatile(self.value_ptr()) }
    }

    /// Replace the value.
    pub fn set(&mut self, value: T) {
        unsafe { ptr::write_volatile(self.value_ptr(), value) }
    }
}

impl<T: ShmSafe> Drop for ScopedAccess<'_, T> {
    fn drop(&mut self) {
        if let Err(e) = self.mutex.unlock() {
            warn!(primitive = "ScopedAccess", key = %self.mutex.key(), error = %e, "unlock on guard drop failed");
        }
    }
}
