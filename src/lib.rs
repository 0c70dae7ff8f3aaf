// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Cross-process primitives: named mutexes, named shared memory segments,
// lock-guarded typed segments, and kernel handle hand-off by key.
// Same POSIX/Win32 syscalls and naming rules on every platform.

pub mod error;
pub use error::{IpcError, IpcResult};

pub mod shm_name;

mod platform;
pub use platform::{BorrowedNative, OwnedNative, Pid, RawValue};

mod shm;
pub use shm::{SharedMemorySegment, ShmOpenMode};

mod mutex;
pub use mutex::NamedMutex;

mod typed;
pub use typed::{ShmSafe, TypedSegment};

mod scoped_access;
pub use scoped_access::{lock_key, GuardedSharedMemory, ScopedAccess, LOCK_SUFFIX};

pub mod handle;
pub use handle::{
    fetch_handle, read_publication, read_record, wait_for_handle, HandlePublisher, HandleRecord,
    PollPolicy, PublishedHandle, RemoteHandle,
};

/// Id of the calling process, in the form stored in a [`HandleRecord`].
pub fn current_pid() -> Pid {
    platform::current_pid()
}

/// Start time of the calling process, in the form stored in a
/// [`PublishedHandle`]. `None` where the OS does not expose it.
pub fn current_start_time() -> Option<u64> {
    platform::current_start_time()
}

/// Install a `tracing` fmt subscriber filtered by `RUST_LOG`, writing to
/// stderr.
///
/// For binaries and tests; the library never installs one itself. A second
/// call is a no-op.
pub fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(true)
        .with_line_number(true)
        .finish();

    let _ = tracing::subscriber::set_global_default(subscriber);
}
