// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Kernel handle hand-off between processes that share only a name.
//
// The publisher writes a HandleRecord { raw, owner_pid, ready }, followed by
// its own start time, into a guarded segment named by the key. A consumer
// opens the same segment (create-or-open: fresh segments are zero-filled, so
// an unpublished record reads as ready == 0), copies it under the lock,
// opens the owner process, checks it is the process that published, and
// asks the OS to duplicate the handle into itself.

use std::fmt;
use std::marker::PhantomData;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::error::{IpcError, IpcResult};
use crate::platform::{self, BorrowedNative, OwnedNative, OwnerProcess, Pid, RawValue};
use crate::scoped_access::GuardedSharedMemory;
use crate::typed::ShmSafe;

/// A handle as published in shared memory.
///
/// Layout: `[native handle][process id][ready byte]`, `#[repr(C)]`. It is
/// meaningful only between processes on the same machine and architecture.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HandleRecord {
    /// Handle value inside the owner process.
    pub raw: RawValue,
    /// Id of the process that owns `raw`.
    pub owner_pid: Pid,
    /// Non-zero once `raw` and `owner_pid` are complete.
    pub ready: u8,
}

unsafe impl ShmSafe for HandleRecord {}

impl HandleRecord {
    /// A complete record for `raw` owned by `owner_pid`.
    pub fn published(raw: RawValue, owner_pid: Pid) -> Self {
        Self { raw, owner_pid, ready: 1 }
    }

    pub fn is_ready(&self) -> bool {
        self.ready != 0
    }

    /// The tagged handle, if the record is ready. The owner's identity is
    /// not checked beyond its pid.
    pub fn remote(&self) -> Option<RemoteHandle> {
        self.is_ready().then(|| RemoteHandle {
            raw: self.raw,
            owner_pid: self.owner_pid,
            owner_start: None,
        })
    }
}

/// Segment contents under a publication key: the record, then the owner's
/// start time so a recycled pid is not mistaken for the publisher.
///
/// `owner_start == 0` means the publisher could not determine it, and
/// consumers fall back to the pid alone.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PublishedHandle {
    pub record: HandleRecord,
    pub owner_start: u64,
}

unsafe impl ShmSafe for PublishedHandle {}

impl PublishedHandle {
    pub fn new(record: HandleRecord, owner_start: Option<u64>) -> Self {
        Self { record, owner_start: owner_start.unwrap_or(0) }
    }

    pub fn remote(&self) -> Option<RemoteHandle> {
        let mut remote = self.record.remote()?;
        remote.owner_start = (self.owner_start != 0).then_some(self.owner_start);
        Some(remote)
    }
}

/// A handle value tagged with the process it belongs to.
///
/// The raw value means nothing in this process until
/// [`resolve`](Self::resolve) duplicates it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteHandle {
    pub raw: RawValue,
    pub owner_pid: Pid,
    /// Start time of the owner when it published, if known.
    pub owner_start: Option<u64>,
}

impl RemoteHandle {
    /// Duplicate the handle into this process.
    ///
    /// # Errors
    /// - [`IpcError::OwnerUnreachable`] if the owner process has exited, or
    ///   its pid now belongs to a different process.
    /// - [`IpcError::DuplicationFailed`] for any other OS refusal.
    pub fn resolve(&self) -> IpcResult<OwnedNative> {
        let pid = self.owner_pid as u32;
        let owner = OwnerProcess::open(self.owner_pid).map_err(|source| {
            if platform::is_process_gone(&source) {
                IpcError::OwnerUnreachable { pid }
            } else {
                self.duplication_failed(source)
            }
        })?;
        if let (Some(recorded), Some(actual)) = (self.owner_start, owner.start_time()) {
            if recorded != actual {
                warn!(pid, recorded, actual, "pid now belongs to another process");
                return Err(IpcError::OwnerUnreachable { pid });
            }
        }
        owner.duplicate(self.raw).map_err(|source| {
            if platform::is_process_gone(&source) || owner.has_exited() {
                IpcError::OwnerUnreachable { pid }
            } else {
                self.duplication_failed(source)
            }
        })
    }

    fn duplication_failed(&self, source: std::io::Error) -> IpcError {
        IpcError::DuplicationFailed { pid: self.owner_pid as u32, raw: self.raw as i64, source }
    }
}

/// Publishes a handle under a key for as long as it lives.
///
/// The borrow keeps the published handle open while consumers may still
/// duplicate it. Dropping the publisher retracts the record.
pub struct HandlePublisher<'h> {
    shared: GuardedSharedMemory<PublishedHandle>,
    published: PublishedHandle,
    _handle: PhantomData<BorrowedNative<'h>>,
}

impl<'h> HandlePublisher<'h> {
    /// Publish `handle` under `key`.
    ///
    /// The record is written under the segment's lock, `ready` last.
    ///
    /// On Linux this also lets any process of the same user duplicate
    /// descriptors out of the calling process (Yama `PR_SET_PTRACER_ANY`),
    /// so consumers need not be its ancestors. The grant is process-wide
    /// and outlives the publisher.
    pub fn publish(key: &str, handle: BorrowedNative<'h>) -> IpcResult<Self> {
        if let Err(e) = platform::allow_duplication() {
            warn!(key, error = %e, "could not open this process to handle duplication");
        }
        let mut shared = GuardedSharedMemory::<PublishedHandle>::open(key)?;
        let record = HandleRecord::published(platform::raw_value(handle), platform::current_pid());
        let published = PublishedHandle::new(record, platform::current_start_time());
        {
            let mut access = shared.lock()?;
            access.owner_start = published.owner_start;
            access.record.raw = record.raw;
            access.record.owner_pid = record.owner_pid;
            access.record.ready = 1;
        }
        debug!(key, raw = record.raw as i64, pid = record.owner_pid as i64, "handle published");
        Ok(Self { shared, published, _handle: PhantomData })
    }

    pub fn key(&self) -> &str {
        self.shared.key()
    }

    pub fn record(&self) -> HandleRecord {
        self.published.record
    }

    pub fn published(&self) -> PublishedHandle {
        self.published
    }
}

impl Drop for HandlePublisher<'_> {
    fn drop(&mut self) {
        // Only clear the record if it is still ours; a later publisher may
        // have replaced it.
        let key = self.shared.key().to_owned();
        let published = self.published;
        match self.shared.lock() {
            Ok(mut access) => {
                if *access == published {
                    access.set(PublishedHandle::default());
                    debug!(key = %key, "handle retracted");
                }
            }
            Err(e) => warn!(key = %key, error = %e, "could not retract handle"),
        }
    }
}

impl fmt::Debug for HandlePublisher<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlePublisher")
            .field("key", &self.shared.key())
            .field("published", &self.published)
            .finish()
    }
}

/// Copy the record published under `key`, taken under its lock.
///
/// Opens the segment with create-or-open, so an unpublished key reads as a
/// zeroed (not ready) record rather than an error.
pub fn read_record(key: &str) -> IpcResult<HandleRecord> {
    read_publication(key).map(|p| p.record)
}

/// Like [`read_record`], including the owner's recorded start time.
pub fn read_publication(key: &str) -> IpcResult<PublishedHandle> {
    let mut shared = GuardedSharedMemory::<PublishedHandle>::open(key)?;
    let access = shared.lock()?;
    Ok(access.get())
}

/// Fetch a duplicate of the handle published under `key`.
///
/// Every outcome is distinct: [`IpcError::NotReady`] is the only retryable
/// one (see [`IpcError::is_retryable`]); a missing owner is
/// [`IpcError::OwnerUnreachable`]; other OS failures are
/// [`IpcError::DuplicationFailed`] or [`IpcError::ResourceUnavailable`].
/// The returned handle is owned by the caller, independent of the publisher.
pub fn fetch_handle(key: &str) -> IpcResult<OwnedNative> {
    let Some(remote) = read_publication(key)?.remote() else {
        return Err(IpcError::NotReady { key: key.to_owned() });
    };
    match remote.resolve() {
        Ok(handle) => {
            debug!(key, pid = remote.owner_pid as i64, "handle duplicated");
            Ok(handle)
        }
        Err(e) => {
            warn!(key, pid = remote.owner_pid as i64, error = %e, "handle fetch failed");
            Err(e)
        }
    }
}

/// How [`wait_for_handle`] polls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    /// Sleep between attempts.
    pub interval: Duration,
    /// Give up after this long; `None` waits forever.
    pub timeout: Option<Duration>,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self { interval: Duration::from_millis(10), timeout: None }
    }
}

impl PollPolicy {
    /// Default interval with a deadline.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self { timeout: Some(timeout), ..Self::default() }
    }
}

/// Poll [`fetch_handle`] until the handle is published.
///
/// Terminal errors are returned at once. When the timeout elapses the last
/// [`IpcError::NotReady`] is returned.
pub fn wait_for_handle(key: &str, policy: &PollPolicy) -> IpcResult<OwnedNative> {
    let deadline = policy.timeout.map(|t| Instant::now() + t);
    loop {
        match fetch_handle(key) {
            Err(e) if e.is_retryable() => {
                if deadline.is_some_and(|d| Instant::now() >= d) {
                    return Err(e);
                }
                thread::sleep(policy.interval);
            }
            other => return other,
        }
    }
}
