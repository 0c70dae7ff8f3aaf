// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Named shared memory segment.
// Delegates to platform::PlatformShm (POSIX or Windows).

use std::fmt;
use std::ptr::{self, NonNull};

use tracing::{debug, warn};

use crate::error::{IpcError, IpcResult};
use crate::platform::{PlatformShm, ShmMode};
use crate::shm_name;

const PRIMITIVE: &str = "SharedMemorySegment";

/// Open mode for shared memory segments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ShmOpenMode {
    /// Create exclusively; fail if already exists.
    Create,
    /// Open existing; fail if it does not exist.
    Open,
    /// Create if missing, open if it already exists.
    #[default]
    CreateOrOpen,
}

impl From<ShmOpenMode> for ShmMode {
    fn from(mode: ShmOpenMode) -> Self {
        match mode {
            ShmOpenMode::Create => ShmMode::Create,
            ShmOpenMode::Open => ShmMode::Open,
            ShmOpenMode::CreateOrOpen => ShmMode::CreateOrOpen,
        }
    }
}

/// A named, fixed-size memory region mapped into this process and shared
/// with every other process that opens the same key.
///
/// Construction never panics. If the OS refuses the segment, the instance is
/// inert: [`as_ptr`](Self::as_ptr) is null, [`size`](Self::size) is 0 and
/// [`error`](Self::error) holds the reason. Check [`is_valid`](Self::is_valid)
/// before touching memory.
///
/// Freshly created segments are zero-filled. On Windows the backing object
/// lives as long as any process keeps a mapping. On POSIX the name outlives
/// every mapping until [`unlink`](Self::unlink) or
/// [`unlink_by_name`](Self::unlink_by_name) removes it, so a reader that
/// opens and closes a key never discards what a writer is about to publish.
///
/// Cloning opens an independent mapping of the same object.
/// `std::mem::take` moves the mapping out and leaves an unarmed instance
/// (null pointer, empty key, zero size).
pub struct SharedMemorySegment {
    key: String,
    requested: usize,
    mode: ShmOpenMode,
    inner: Option<PlatformShm>,
    error: Option<IpcError>,
}

impl SharedMemorySegment {
    /// Open or create the segment `key` of `size` bytes. Inert on failure.
    pub fn new(key: &str, size: usize) -> Self {
        Self::with_mode(key, size, ShmOpenMode::CreateOrOpen)
    }

    /// Like [`new`](Self::new) but returns the construction error.
    pub fn open(key: &str, size: usize) -> IpcResult<Self> {
        Self::new(key, size).into_result()
    }

    /// Open with an explicit mode. Inert on failure.
    pub fn with_mode(key: &str, size: usize, mode: ShmOpenMode) -> Self {
        let (inner, error) = match Self::acquire(key, size, mode) {
            Ok(shm) => {
                debug!(primitive = PRIMITIVE, key, size, ?mode, "segment mapped");
                (Some(shm), None)
            }
            Err(e) => {
                warn!(primitive = PRIMITIVE, key, size, ?mode, error = %e, "segment unavailable");
                (None, Some(e))
            }
        };
        Self { key: key.to_owned(), requested: size, mode, inner, error }
    }

    fn acquire(key: &str, size: usize, mode: ShmOpenMode) -> IpcResult<PlatformShm> {
        shm_name::check_key(key)?;
        if size == 0 {
            return Err(IpcError::InvalidSize { size });
        }
        PlatformShm::acquire(key, size, mode.into()).map_err(|source| {
            IpcError::ResourceUnavailable { primitive: PRIMITIVE, key: key.to_owned(), source }
        })
    }

    /// Turn an inert instance into its construction error.
    pub(crate) fn into_result(mut self) -> IpcResult<Self> {
        match self.error.take() {
            Some(e) => Err(e),
            None if self.inner.is_none() => {
                Err(IpcError::Inert { primitive: PRIMITIVE, key: self.key.clone() })
            }
            None => Ok(self),
        }
    }

    /// Whether the segment is mapped.
    pub fn is_valid(&self) -> bool {
        self.inner.is_some()
    }

    /// Why construction failed, if it did.
    pub fn error(&self) -> Option<&IpcError> {
        self.error.as_ref()
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Mapped size in bytes; 0 when inert.
    pub fn size(&self) -> usize {
        self.inner.as_ref().map_or(0, PlatformShm::user_size)
    }

    /// Start of the mapped region, or `None` when inert.
    pub fn data(&self) -> Option<NonNull<u8>> {
        self.inner.as_ref().and_then(|shm| NonNull::new(shm.as_mut_ptr()))
    }

    /// Start of the mapped region, or null when inert.
    pub fn as_ptr(&self) -> *const u8 {
        self.as_mut_ptr()
    }

    /// Mutable start of the mapped region, or null when inert.
    pub fn as_mut_ptr(&self) -> *mut u8 {
        self.inner.as_ref().map_or(ptr::null_mut(), PlatformShm::as_mut_ptr)
    }

    /// Number of live mappings recorded in the segment (all processes).
    pub fn ref_count(&self) -> i32 {
        self.inner.as_ref().map_or(0, PlatformShm::ref_count)
    }

    /// Remove the name so new opens create a fresh object (POSIX only).
    /// Existing mappings stay valid.
    pub fn unlink(&self) {
        if let Some(shm) = &self.inner {
            shm.unlink();
        }
    }

    /// Remove a segment by name without an open instance (POSIX only).
    pub fn unlink_by_name(key: &str) {
        PlatformShm::unlink_by_name(key);
    }

    /// Copy `buf` to the start of the segment.
    pub fn write_bytes(&self, buf: &[u8]) -> IpcResult<()> {
        let dst = self.checked_ptr()?;
        if buf.len() > self.size() {
            return Err(IpcError::InvalidSize { size: buf.len() });
        }
        unsafe { ptr::copy_nonoverlapping(buf.as_ptr(), dst, buf.len()) };
        Ok(())
    }

    /// Copy the first `buf.len()` bytes of the segment into `buf`.
    pub fn read_bytes(&self, buf: &mut [u8]) -> IpcResult<()> {
        let src = self.checked_ptr()?;
        if buf.len() > self.size() {
            return Err(IpcError::InvalidSize { size: buf.len() });
        }
        unsafe { ptr::copy_nonoverlapping(src, buf.as_mut_ptr(), buf.len()) };
        Ok(())
    }

    fn checked_ptr(&self) -> IpcResult<*mut u8> {
        match &self.inner {
            Some(shm) => Ok(shm.as_mut_ptr()),
            None => Err(IpcError::Inert { primitive: PRIMITIVE, key: self.key.clone() }),
        }
    }
}

impl Default for SharedMemorySegment {
    /// The unarmed segment: no mapping, empty key, zero size.
    fn default() -> Self {
        Self {
            key: String::new(),
            requested: 0,
            mode: ShmOpenMode::CreateOrOpen,
            inner: None,
            error: None,
        }
    }
}

impl Clone for SharedMemorySegment {
    fn clone(&self) -> Self {
        if self.key.is_empty() {
            return Self::default();
        }
        // An exclusive create would fail against the object we already hold.
        let mode = match self.mode {
            ShmOpenMode::Create => ShmOpenMode::Open,
            other => other,
        };
        Self::with_mode(&self.key, self.requested, mode)
    }
}

impl Drop for SharedMemorySegment {
    fn drop(&mut self) {
        if self.inner.take().is_some() {
            debug!(primitive = PRIMITIVE, key = %self.key, "segment released");
        }
    }
}

impl fmt::Debug for SharedMemorySegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedMemorySegment")
            .field("key", &self.key)
            .field("size", &self.size())
            .field("valid", &self.is_valid())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_unarmed() {
        let seg = SharedMemorySegment::default();
        assert!(!seg.is_valid());
        assert!(seg.as_ptr().is_null());
        assert!(seg.data().is_none());
        assert_eq!(seg.size(), 0);
        assert_eq!(seg.key(), "");
        assert!(seg.error().is_none());
    }

    #[test]
    fn zero_size_is_inert() {
        let seg = SharedMemorySegment::new("xproc_unit_zero_size", 0);
        assert!(!seg.is_valid());
        assert!(matches!(seg.error(), Some(IpcError::InvalidSize { size: 0 })));
    }

    #[test]
    fn inert_rejects_byte_access() {
        let seg = SharedMemorySegment::default();
        let mut buf = [0u8; 4];
        assert!(matches!(seg.read_bytes(&mut buf), Err(IpcError::Inert { .. })));
        assert!(matches!(seg.write_bytes(&buf), Err(IpcError::Inert { .. })));
    }

    #[test]
    fn open_mode_maps_to_platform() {
        assert_eq!(ShmMode::from(ShmOpenMode::Create), ShmMode::Create);
        assert_eq!(ShmMode::from(ShmOpenMode::Open), ShmMode::Open);
        assert_eq!(ShmMode::from(ShmOpenMode::default()), ShmMode::CreateOrOpen);
    }
}
