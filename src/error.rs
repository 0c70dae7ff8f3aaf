// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Error type shared by every primitive in the crate.

use std::io;

use thiserror::Error;

/// Errors reported by named mutexes, shared memory segments and the
/// handle hand-off protocol.
///
/// The consumer side of the hand-off keeps its outcomes distinct so callers
/// can tell a pending publication ([`IpcError::NotReady`]) from a terminal
/// failure. See [`IpcError::is_retryable`].
#[derive(Error, Debug)]
pub enum IpcError {
    /// Key is empty or contains an interior NUL byte.
    #[error("invalid key {key:?}: {reason}")]
    InvalidKey {
        /// Offending key
        key: String,
        /// Why it was rejected
        reason: &'static str,
    },

    /// Segment size of zero.
    #[error("invalid segment size: {size} bytes")]
    InvalidSize {
        /// Requested size
        size: usize,
    },

    /// Key exceeds the platform's maximum object-name length.
    #[error("key of length {len} exceeds the platform limit of {max}: {key:?}")]
    NameTooLong {
        /// Offending key
        key: String,
        /// Length as measured by the platform
        len: usize,
        /// Platform limit
        max: usize,
    },

    /// The OS refused to create, open or map the object.
    #[error("{primitive} {key:?} unavailable: {source}")]
    ResourceUnavailable {
        /// Primitive kind, e.g. `"NamedMutex"`
        primitive: &'static str,
        /// Key of the object
        key: String,
        /// OS error
        #[source]
        source: io::Error,
    },

    /// Operation on an instance whose construction failed.
    #[error("{primitive} {key:?} is not open")]
    Inert {
        /// Primitive kind
        primitive: &'static str,
        /// Key the instance was constructed with
        key: String,
    },

    /// An OS lock or unlock call failed.
    #[error("lock operation on {key:?} failed: {source}")]
    Lock {
        /// Mutex key
        key: String,
        /// OS error
        #[source]
        source: io::Error,
    },

    /// No handle has been published under the key yet.
    #[error("no handle published under {key:?} yet")]
    NotReady {
        /// Publication key
        key: String,
    },

    /// The publishing process no longer exists.
    #[error("publishing process {pid} is gone")]
    OwnerUnreachable {
        /// Recorded owner process id
        pid: u32,
    },

    /// The OS could not duplicate the handle for another reason.
    #[error("duplicating handle {raw:#x} from process {pid} failed: {source}")]
    DuplicationFailed {
        /// Recorded owner process id
        pid: u32,
        /// Raw handle value in the owner process
        raw: i64,
        /// OS error
        #[source]
        source: io::Error,
    },
}

impl IpcError {
    /// Whether trying the same operation again later may succeed.
    ///
    /// Only a pending publication is transient; a dead publisher cannot
    /// publish again and OS refusals are reported as-is.
    pub fn is_retryable(&self) -> bool {
        matches!(self, IpcError::NotReady { .. })
    }

    /// The underlying OS error, if any.
    pub fn os_error(&self) -> Option<&io::Error> {
        match self {
            IpcError::ResourceUnavailable { source, .. }
            | IpcError::Lock { source, .. }
            | IpcError::DuplicationFailed { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// Result alias used throughout the crate.
pub type IpcResult<T> = Result<T, IpcError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_not_ready_is_retryable() {
        assert!(IpcError::NotReady { key: "k".into() }.is_retryable());
        assert!(!IpcError::OwnerUnreachable { pid: 1 }.is_retryable());
        assert!(!IpcError::DuplicationFailed {
            pid: 1,
            raw: 3,
            source: io::Error::from(io::ErrorKind::Unsupported),
        }
        .is_retryable());
        assert!(!IpcError::NameTooLong { key: "k".into(), len: 300, max: 255 }.is_retryable());
    }

    #[test]
    fn os_error_exposes_source() {
        let e = IpcError::ResourceUnavailable {
            primitive: "SharedMemorySegment",
            key: "k".into(),
            source: io::Error::from_raw_os_error(13),
        };
        assert_eq!(e.os_error().and_then(|s| s.raw_os_error()), Some(13));
        assert!(IpcError::Inert { primitive: "NamedMutex", key: "k".into() }
            .os_error()
            .is_none());
    }

    #[test]
    fn display_names_primitive_and_key() {
        let e = IpcError::Inert { primitive: "NamedMutex", key: "abc".into() };
        let s = e.to_string();
        assert!(s.contains("NamedMutex"));
        assert!(s.contains("abc"));
    }
}
