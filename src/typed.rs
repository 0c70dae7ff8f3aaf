// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Typed view over the first size_of::<T>() bytes of a shared segment.

use std::fmt;
use std::marker::PhantomData;
use std::ptr;
use std::sync::atomic::*;

use crate::error::{IpcError, IpcResult};
use crate::shm::SharedMemorySegment;

/// Types that may live in shared memory.
///
/// # Safety
///
/// Implementors must be plain data: the all-zero bit pattern is a valid
/// value (fresh segments are zero-filled), any bit pattern another process
/// may write through the same layout is valid, and the type holds no
/// pointers or references (they mean nothing in another address space).
/// Use `#[repr(C)]` for structs so every process agrees on the layout.
pub unsafe trait ShmSafe: Send + Sync + 'static {}

macro_rules! impl_shm_safe {
    ($($t:ty),* $(,)?) => {
        $( unsafe impl ShmSafe for $t {} )*
    };
}

impl_shm_safe! {
    i8, i16, i32, i64, i128, isize,
    u8, u16, u32, u64, u128, usize,
    f32, f64,
    AtomicI8, AtomicI16, AtomicI32, AtomicI64, AtomicIsize,
    AtomicU8, AtomicU16, AtomicU32, AtomicU64, AtomicUsize,
}

unsafe impl<T: ShmSafe, const N: usize> ShmSafe for [T; N] {}

/// A [`SharedMemorySegment`] sized for one `T` and viewed as a `T`.
///
/// Access is unsynchronised: two processes (or threads) writing through
/// typed views at once race, and a reader may see a torn value. Pair the
/// segment with a lock ([`GuardedSharedMemory`](crate::GuardedSharedMemory))
/// or use atomic fields when that matters.
pub struct TypedSegment<T: ShmSafe> {
    segment: SharedMemorySegment,
    _marker: PhantomData<T>,
}

impl<T: ShmSafe> TypedSegment<T> {
    /// Open or create `key` sized for `T`. Inert on failure.
    pub fn new(key: &str) -> Self {
        Self::from_segment(SharedMemorySegment::new(key, std::mem::size_of::<T>()))
    }

    /// Like [`new`](Self::new) but returns the construction error.
    pub fn open(key: &str) -> IpcResult<Self> {
        SharedMemorySegment::open(key, std::mem::size_of::<T>()).map(Self::from_segment)
    }

    fn from_segment(segment: SharedMemorySegment) -> Self {
        Self { segment, _marker: PhantomData }
    }

    /// Pointer to the shared `T`, or null when inert.
    pub fn as_ptr(&self) -> *mut T {
        self.segment.as_mut_ptr() as *mut T
    }

    /// Shared reference to the value, for types whose fields are atomics.
    pub fn get(&self) -> Option<&T> {
        self.segment.data().map(|p| unsafe { &*(p.as_ptr() as *const T) })
    }

    pub fn segment(&self) -> &SharedMemorySegment {
        &self.segment
    }

    pub fn is_valid(&self) -> bool {
        self.segment.is_valid()
    }

    pub fn key(&self) -> &str {
        self.segment.key()
    }

    fn checked_ptr(&self) -> IpcResult<*mut T> {
        self.segment
            .data()
            .map(|p| p.as_ptr() as *mut T)
            .ok_or_else(|| IpcError::Inert {
                primitive: "TypedSegment",
                key: self.segment.key().to_owned(),
            })
    }
}

impl<T: ShmSafe + Copy> TypedSegment<T> {
    /// Copy the value out of shared memory.
    pub fn read(&self) -> IpcResult<T> {
        let p = self.checked_ptr()?;
        Ok(unsafe { ptr::read_volatile(p) })
    }

    /// Copy `value` into shared memory.
    pub fn write(&self, value: T) -> IpcResult<()> {
        let p = self.checked_ptr()?;
        unsafe { ptr::write_volatile(p, value) };
        Ok(())
    }
}

impl<T: ShmSafe> Clone for TypedSegment<T> {
    fn clone(&self) -> Self {
        Self::from_segment(self.segment.clone())
    }
}

impl<T: ShmSafe> Default for TypedSegment<T> {
    fn default() -> Self {
        Self::from_segment(SharedMemorySegment::default())
    }
}

impl<T: ShmSafe> fmt::Debug for TypedSegment<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypedSegment")
            .field("type", &std::any::type_name::<T>())
            .field("segment", &self.segment)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unarmed_view_is_inert() {
        let v = TypedSegment::<u64>::default();
        assert!(v.as_ptr().is_null());
        assert!(v.get().is_none());
        assert!(matches!(v.read(), Err(IpcError::Inert { .. })));
        assert!(matches!(v.write(7), Err(IpcError::Inert { .. })));
    }
}
