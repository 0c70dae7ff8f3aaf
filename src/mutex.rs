// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Cross-platform named inter-process mutex.
// Delegates to platform::PlatformMutex (POSIX or Windows).

use std::fmt;

use tracing::{debug, warn};

use crate::error::{IpcError, IpcResult};
use crate::platform::PlatformMutex;
use crate::shm_name;

const PRIMITIVE: &str = "NamedMutex";

/// A process-spanning exclusive lock identified by a key.
///
/// On POSIX this is a `pthread_mutex_t` stored in shared memory with
/// `PTHREAD_PROCESS_SHARED` and `PTHREAD_MUTEX_ROBUST` attributes.
/// On Windows this is a kernel named mutex via `CreateMutexW`.
///
/// The instance tracks whether *it* holds the lock ([`locked`](Self::locked));
/// dropping a holding instance unlocks before the OS object is released, so
/// other waiters never see an abandoned mutex.
///
/// If construction fails (for example [`IpcError::NameTooLong`]) the instance
/// is inert and every lock operation returns [`IpcError::Inert`].
///
/// Cloning opens an independent handle to the same name and does not carry
/// the lock: the clone starts unlocked. `std::mem::take` moves handle and
/// lock state out and leaves an unarmed instance behind.
pub struct NamedMutex {
    key: String,
    locked: bool,
    inner: Option<PlatformMutex>,
    error: Option<IpcError>,
}

impl NamedMutex {
    /// Open (or create) the mutex named `key`. Inert on failure.
    pub fn new(key: &str) -> Self {
        let (inner, error) = match Self::acquire(key) {
            Ok(m) => {
                debug!(primitive = PRIMITIVE, key, "mutex opened");
                (Some(m), None)
            }
            Err(e) => {
                warn!(primitive = PRIMITIVE, key, error = %e, "mutex unavailable");
                (None, Some(e))
            }
        };
        Self { key: key.to_owned(), locked: false, inner, error }
    }

    /// Like [`new`](Self::new) but returns the construction error.
    pub fn open(key: &str) -> IpcResult<Self> {
        let mut m = Self::new(key);
        match m.error.take() {
            Some(e) => Err(e),
            None => Ok(m),
        }
    }

    fn acquire(key: &str) -> IpcResult<PlatformMutex> {
        shm_name::check_key(key)?;
        PlatformMutex::open(key).map_err(|source| IpcError::ResourceUnavailable {
            primitive: PRIMITIVE,
            key: key.to_owned(),
            source,
        })
    }

    fn platform(&self) -> IpcResult<&PlatformMutex> {
        self.inner
            .as_ref()
            .ok_or_else(|| IpcError::Inert { primitive: PRIMITIVE, key: self.key.clone() })
    }

    fn lock_error(&self, source: std::io::Error) -> IpcError {
        warn!(primitive = PRIMITIVE, key = %self.key, error = %source, "lock operation failed");
        IpcError::Lock { key: self.key.clone(), source }
    }

    /// Block until this instance owns the lock. No timeout.
    ///
    /// A lock abandoned by a dead owner is recovered and counts as acquired.
    pub fn lock(&mut self) -> IpcResult<()> {
        let m = self.platform()?;
        match m.lock() {
            Ok(()) => {
                self.locked = true;
                Ok(())
            }
            Err(e) => Err(self.lock_error(e)),
        }
    }

    /// Try to take the lock without blocking.
    /// Returns `Ok(false)` when another owner holds it.
    pub fn try_lock(&mut self) -> IpcResult<bool> {
        let m = self.platform()?;
        match m.try_lock() {
            Ok(acquired) => {
                self.locked = acquired;
                Ok(acquired)
            }
            Err(e) => {
                self.locked = false;
                Err(self.lock_error(e))
            }
        }
    }

    /// Release the lock. Only the holder may call this; what the OS does
    /// otherwise is platform-defined.
    pub fn unlock(&mut self) -> IpcResult<()> {
        let m = self.platform()?;
        let res = m.unlock();
        self.locked = false;
        res.map_err(|e| self.lock_error(e))
    }

    /// Whether this instance believes it holds the lock.
    /// Not a query of the OS object.
    pub fn locked(&self) -> bool {
        self.locked
    }

    /// Whether the OS mutex was opened.
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

    /// Remove the backing storage for `key` (POSIX; no-op on Windows).
    ///
    /// Only call this when no process uses the mutex.
    pub fn clear_storage(key: &str) {
        if shm_name::check_key(key).is_ok() {
            PlatformMutex::clear_storage(key);
        }
    }
}

impl Default for NamedMutex {
    /// The unarmed mutex: empty key, not locked, no OS handle.
    fn default() -> Self {
        Self { key: String::new(), locked: false, inner: None, error: None }
    }
}

impl Clone for NamedMutex {
    fn clone(&self) -> Self {
        if self.key.is_empty() {
            return Self::default();
        }
        Self::new(&self.key)
    }
}

impl Drop for NamedMutex {
    fn drop(&mut self) {
        let Some(m) = self.inner.take() else {
            return;
        };
        if self.locked {
            if let Err(e) = m.unlock() {
                warn!(primitive = PRIMITIVE, key = %self.key, error = %e, "unlock on drop failed");
            }
            self.locked = false;
        }
        debug!(primitive = PRIMITIVE, key = %self.key, "mutex released");
    }
}

impl fmt::Debug for NamedMutex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NamedMutex")
            .field("key", &self.key)
            .field("locked", &self.locked)
            .field("valid", &self.is_valid())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unarmed_operations_report_inert() {
        let mut m = NamedMutex::default();
        assert!(!m.is_valid());
        assert!(matches!(m.lock(), Err(IpcError::Inert { .. })));
        assert!(matches!(m.try_lock(), Err(IpcError::Inert { .. })));
        assert!(matches!(m.unlock(), Err(IpcError::Inert { .. })));
        assert!(!m.locked());
    }

    #[test]
    fn clone_of_unarmed_is_unarmed() {
        let m = NamedMutex::default();
        let c = m.clone();
        assert!(!c.is_valid());
        assert_eq!(c.key(), "");
    }

    #[test]
    fn empty_key_is_rejected() {
        assert!(matches!(NamedMutex::open(""), Err(IpcError::InvalidKey { .. })));
    }
}
