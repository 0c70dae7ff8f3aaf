// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// POSIX implementation of shared memory, named mutex and handle duplication.
// Shared memory is shm_open + mmap with a trailing process-shared reference
// counter; the named mutex is a robust PTHREAD_PROCESS_SHARED pthread mutex
// living in its own segment; duplication uses pidfd_open + pidfd_getfd
// (Linux 5.6+).

use std::collections::HashMap;
use std::ffi::CString;
use std::io;
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::ptr;
use std::sync::atomic::{AtomicI32, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::time::{Duration, Instant};

use crate::shm_name;

// ---------------------------------------------------------------------------
// Native handle types
// ---------------------------------------------------------------------------

/// Raw descriptor value as stored in a handle record.
pub type RawValue = RawFd;
/// Process id as stored in a handle record.
pub type Pid = libc::pid_t;
/// Descriptor owned by this process.
pub type OwnedNative = OwnedFd;
/// Descriptor borrowed from the caller.
pub type BorrowedNative<'a> = BorrowedFd<'a>;

pub fn raw_value(handle: BorrowedNative<'_>) -> RawValue {
    handle.as_raw_fd()
}

pub fn current_pid() -> Pid {
    unsafe { libc::getpid() }
}

// ---------------------------------------------------------------------------
// Process-local mapping cache.
//
// All threads of one process that open the same named mutex must use the
// same mmap: macOS's pthread implementation keeps pointers relative to the
// address used for pthread_mutex_init, so a second mapping of the same page
// at another address fails with EINVAL on lock.
//
// The cache is created on first use and is empty again once the last local
// user of every name has dropped.
// ---------------------------------------------------------------------------

pub(crate) struct CachedShm {
    pub(crate) shm: PlatformShm,
    local_ref: AtomicUsize,
}

pub(crate) struct MappingCache {
    map: Mutex<HashMap<String, Arc<CachedShm>>>,
}

impl MappingCache {
    /// The cache shared by every named mutex in this process.
    pub(crate) fn mutexes() -> &'static MappingCache {
        static CACHE: OnceLock<MappingCache> = OnceLock::new();
        CACHE.get_or_init(|| MappingCache { map: Mutex::new(HashMap::new()) })
    }

    /// Acquire or reuse a cached mapping.
    ///
    /// When this process maps `name` for the first time, `init_fn` runs on
    /// the new mapping **while the cache lock is held**, so no other local
    /// thread can use the object before it is ready.
    pub(crate) fn acquire<F>(&self, name: &str, size: usize, init_fn: F) -> io::Result<Arc<CachedShm>>
    where
        F: FnOnce(&PlatformShm) -> io::Result<()>,
    {
        let mut map = self.map.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(entry) = map.get(name) {
            entry.local_ref.fetch_add(1, Ordering::Relaxed);
            return Ok(Arc::clone(entry));
        }
        let shm = PlatformShm::acquire(name, size, ShmMode::CreateOrOpen)?;
        init_fn(&shm)?;
        let entry = Arc::new(CachedShm { shm, local_ref: AtomicUsize::new(1) });
        map.insert(name.to_string(), Arc::clone(&entry));
        Ok(entry)
    }

    /// Release one local reference; the last one removes the entry.
    pub(crate) fn release(&self, name: &str) {
        let mut map = self.map.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(entry) = map.get(name) {
            if entry.local_ref.fetch_sub(1, Ordering::AcqRel) <= 1 {
                map.remove(name);
            }
        }
    }

    /// Drop the entry regardless of local users (after the object was unlinked).
    pub(crate) fn purge(&self, name: &str) {
        let mut map = self.map.lock().unwrap_or_else(PoisonError::into_inner);
        map.remove(name);
    }
}

// ---------------------------------------------------------------------------
// Robust mutex symbols: not exposed by the `libc` crate on every target.
// macOS has no robust mutexes.
// ---------------------------------------------------------------------------

#[cfg(not(target_os = "macos"))]
const EOWNERDEAD: i32 = libc::EOWNERDEAD;

#[cfg(not(target_os = "macos"))]
extern "C" {
    fn pthread_mutexattr_setrobust(
        attr: *mut libc::pthread_mutexattr_t,
        robustness: libc::c_int,
    ) -> libc::c_int;
    fn pthread_mutex_consistent(mutex: *mut libc::pthread_mutex_t) -> libc::c_int;
}

#[cfg(not(target_os = "macos"))]
const PTHREAD_MUTEX_ROBUST: libc::c_int = 1;

// ---------------------------------------------------------------------------
// Layout helpers
// ---------------------------------------------------------------------------

/// Rounds the user size up to the counter's alignment and appends an
/// `AtomicI32` reference counter.
const ALIGN: usize = std::mem::align_of::<AtomicI32>();

pub(crate) fn calc_size(user_size: usize) -> usize {
    let aligned = ((user_size.wrapping_sub(1) / ALIGN) + 1) * ALIGN;
    aligned + std::mem::size_of::<AtomicI32>()
}

/// Returns the trailing ref-counter inside a mapped region of `total_size`
/// bytes starting at `mem`.
///
/// # Safety
/// `mem` must point to a valid mapped region of at least `total_size` bytes
/// that outlives the returned reference.
unsafe fn acc_of<'a>(mem: *mut u8, total_size: usize) -> &'a AtomicI32 {
    let offset = total_size - std::mem::size_of::<AtomicI32>();
    &*(mem.add(offset) as *const AtomicI32)
}

/// How long an opener waits for a concurrent creator to size the object.
const SIZE_WAIT: Duration = Duration::from_millis(100);

/// Backoff: spin, then yield, then sleep 1 ms.
fn backoff(k: &mut u32) {
    if *k < 16 {
        std::hint::spin_loop();
    } else if *k < 32 {
        std::thread::yield_now();
    } else {
        std::thread::sleep(Duration::from_millis(1));
        return;
    }
    *k += 1;
}

/// Wait until an existing object has been sized by its creator and check
/// that its size matches what this opener expects.
fn check_existing_size(fd: RawFd, total_size: usize) -> io::Result<()> {
    let deadline = Instant::now() + SIZE_WAIT;
    let mut k = 0u32;
    loop {
        let mut st: libc::stat = unsafe { std::mem::zeroed() };
        if unsafe { libc::fstat(fd, &mut st) } != 0 {
            return Err(io::Error::last_os_error());
        }
        let len = st.st_size as usize;
        // macOS rounds shm objects up to the page size.
        let compatible = if cfg!(target_os = "macos") {
            len >= total_size
        } else {
            len == total_size
        };
        if compatible {
            return Ok(());
        }
        if len != 0 || Instant::now() >= deadline {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("existing object is {len} bytes, expected {total_size}"),
            ));
        }
        backoff(&mut k);
    }
}

// ---------------------------------------------------------------------------
// PlatformShm: POSIX shared memory
// ---------------------------------------------------------------------------

pub struct PlatformShm {
    mem: *mut u8,
    size: usize,      // total mapped size (including ref counter)
    user_size: usize, // user-requested size
    name: String,     // POSIX name (with leading '/')
    created: bool,    // this mapping created the object (O_EXCL succeeded)
}

// Safety: the mapping is process-shared; access discipline is the caller's.
unsafe impl Send for PlatformShm {}
unsafe impl Sync for PlatformShm {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShmMode {
    Create,
    Open,
    CreateOrOpen,
}

impl PlatformShm {
    /// Create and/or open the object named after `name` and map it.
    /// `name` must already have passed `shm_name::check_key`.
    pub fn acquire(name: &str, user_size: usize, mode: ShmMode) -> io::Result<Self> {
        if user_size == 0 {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "size is 0"));
        }

        let posix_name = shm_name::make_shm_name(name);
        let c_name = CString::new(posix_name.as_bytes())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

        let perms: libc::mode_t = 0o666;
        let total_size = calc_size(user_size);

        let open_excl = || unsafe {
            libc::shm_open(
                c_name.as_ptr(),
                libc::O_RDWR | libc::O_CREAT | libc::O_EXCL,
                perms as libc::c_uint,
            )
        };
        let open_existing =
            || unsafe { libc::shm_open(c_name.as_ptr(), libc::O_RDWR, perms as libc::c_uint) };

        // CreateOrOpen tries the exclusive create first so only the creator
        // ever calls ftruncate; on macOS truncating an already-sized object
        // can zero it before failing with EINVAL.
        let (fd, created) = match mode {
            ShmMode::Create => {
                let f = open_excl();
                if f == -1 {
                    return Err(io::Error::last_os_error());
                }
                (f, true)
            }
            ShmMode::Open => {
                let f = open_existing();
                if f == -1 {
                    return Err(io::Error::last_os_error());
                }
                (f, false)
            }
            ShmMode::CreateOrOpen => {
                let f = open_excl();
                if f != -1 {
                    (f, true)
                } else {
                    let e = io::Error::last_os_error();
                    if e.raw_os_error() != Some(libc::EEXIST) {
                        return Err(e);
                    }
                    let f2 = open_existing();
                    if f2 == -1 {
                        return Err(io::Error::last_os_error());
                    }
                    (f2, false)
                }
            }
        };

        // The umask may have stripped group/other bits on creation.
        unsafe { libc::fchmod(fd, perms) };

        let sized = if created {
            if unsafe { libc::ftruncate(fd, total_size as libc::off_t) } != 0 {
                Err(io::Error::last_os_error())
            } else {
                Ok(())
            }
        } else {
            check_existing_size(fd, total_size)
        };
        if let Err(e) = sized {
            unsafe { libc::close(fd) };
            if created {
                unsafe { libc::shm_unlink(c_name.as_ptr()) };
            }
            return Err(e);
        }

        Self::mmap_and_finish(fd, total_size, user_size, posix_name, created)
    }

    fn mmap_and_finish(
        fd: i32,
        total_size: usize,
        user_size: usize,
        posix_name: String,
        created: bool,
    ) -> io::Result<Self> {
        let mem = unsafe {
            libc::mmap(
                ptr::null_mut(),
                total_size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        unsafe { libc::close(fd) };

        if mem == libc::MAP_FAILED {
            let e = io::Error::last_os_error();
            if created {
                Self::unlink_by_name_raw(&posix_name);
            }
            return Err(e);
        }

        unsafe { acc_of(mem as *mut u8, total_size).fetch_add(1, Ordering::AcqRel) };

        Ok(Self {
            mem: mem as *mut u8,
            size: total_size,
            user_size,
            name: posix_name,
            created,
        })
    }

    pub fn as_mut_ptr(&self) -> *mut u8 {
        self.mem
    }

    pub fn user_size(&self) -> usize {
        self.user_size
    }

    /// Whether this mapping created the object. Exactly one mapper of a
    /// name sees `true` until the name is unlinked.
    pub fn created(&self) -> bool {
        self.created
    }

    pub fn ref_count(&self) -> i32 {
        if self.mem.is_null() || self.size == 0 {
            return 0;
        }
        unsafe { acc_of(self.mem, self.size).load(Ordering::Acquire) }
    }

    /// Remove the name (shm_unlink). Existing mappings stay valid.
    pub fn unlink(&self) {
        Self::unlink_by_name_raw(&self.name);
    }

    pub fn unlink_by_name(name: &str) {
        Self::unlink_by_name_raw(&shm_name::make_shm_name(name));
    }

    fn unlink_by_name_raw(posix_name: &str) {
        if let Ok(c_name) = CString::new(posix_name.as_bytes()) {
            unsafe { libc::shm_unlink(c_name.as_ptr()) };
        }
    }
}

impl Drop for PlatformShm {
    fn drop(&mut self) {
        if self.mem.is_null() {
            return;
        }
        // The name outlives the last mapping: another process may be between
        // shm_open and mmap on it. Removal is explicit (unlink, clear_storage).
        unsafe { acc_of(self.mem, self.size).fetch_sub(1, Ordering::AcqRel) };
        unsafe { libc::munmap(self.mem as *mut libc::c_void, self.size) };
    }
}

// ---------------------------------------------------------------------------
// PlatformMutex: pthread_mutex_t in shared memory
// ---------------------------------------------------------------------------

/// Initialise a process-shared (and, where supported, robust) mutex in place.
///
/// # Safety
/// `mtx_ptr` must point into a writable mapping no other thread uses yet.
unsafe fn init_mutex(mtx_ptr: *mut libc::pthread_mutex_t) -> io::Result<()> {
    let mut attr: libc::pthread_mutexattr_t = std::mem::zeroed();
    let mut eno = libc::pthread_mutexattr_init(&mut attr);
    if eno != 0 {
        return Err(io::Error::from_raw_os_error(eno));
    }

    eno = libc::pthread_mutexattr_setpshared(&mut attr, libc::PTHREAD_PROCESS_SHARED);
    if eno != 0 {
        libc::pthread_mutexattr_destroy(&mut attr);
        return Err(io::Error::from_raw_os_error(eno));
    }

    #[cfg(not(target_os = "macos"))]
    {
        eno = pthread_mutexattr_setrobust(&mut attr, PTHREAD_MUTEX_ROBUST);
        if eno != 0 {
            libc::pthread_mutexattr_destroy(&mut attr);
            return Err(io::Error::from_raw_os_error(eno));
        }
    }

    eno = libc::pthread_mutex_init(mtx_ptr, &attr);
    libc::pthread_mutexattr_destroy(&mut attr);
    if eno != 0 {
        return Err(io::Error::from_raw_os_error(eno));
    }
    Ok(())
}

/// Wait for the creator of `name` to publish an initialised mutex.
fn wait_ready(cell: *mut MutexCell, name: &str) -> io::Result<()> {
    let ready = unsafe { &(*cell).ready };
    let deadline = Instant::now() + INIT_WAIT;
    let mut k = 0u32;
    while ready.load(Ordering::Acquire) != MUTEX_READY {
        if Instant::now() >= deadline {
            return Err(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("mutex {name:?} was never initialised by its creator"),
            ));
        }
        backoff(&mut k);
    }
    Ok(())
}

/// Layout of a named mutex segment. `ready` is published by the creator
/// once `mtx` is initialised; every other opener waits for it.
#[repr(C)]
struct MutexCell {
    mtx: libc::pthread_mutex_t,
    ready: AtomicU32,
}

const MUTEX_READY: u32 = 0x584d_5458;

/// How long an opener waits for the creator to initialise the mutex.
const INIT_WAIT: Duration = Duration::from_secs(1);

pub struct PlatformMutex {
    cached: Arc<CachedShm>,
    name: String,
}

impl PlatformMutex {
    /// Open (or create) the mutex stored in the segment named `name`.
    ///
    /// Only the process that created the segment initialises the mutex, with
    /// `PTHREAD_PROCESS_SHARED` and, where supported, `PTHREAD_MUTEX_ROBUST`.
    /// Openers wait until it has done so.
    pub fn open(name: &str) -> io::Result<Self> {
        let shm_size = std::mem::size_of::<MutexCell>();
        let cached = MappingCache::mutexes().acquire(name, shm_size, |shm| {
            let cell = shm.as_mut_ptr() as *mut MutexCell;
            if !shm.created() {
                return wait_ready(cell, name);
            }
            let res = unsafe { init_mutex(ptr::addr_of_mut!((*cell).mtx)) };
            match res {
                Ok(()) => {
                    unsafe { (*cell).ready.store(MUTEX_READY, Ordering::Release) };
                    Ok(())
                }
                Err(e) => {
                    // Nobody else could ever initialise it.
                    shm.unlink();
                    Err(e)
                }
            }
        })?;

        Ok(Self { cached, name: name.to_string() })
    }

    fn mtx_ptr(&self) -> *mut libc::pthread_mutex_t {
        let cell = self.cached.shm.as_mut_ptr() as *mut MutexCell;
        unsafe { ptr::addr_of_mut!((*cell).mtx) }
    }

    /// Mark a mutex whose previous owner died as consistent again.
    #[cfg(not(target_os = "macos"))]
    fn recover(&self) -> io::Result<()> {
        let eno = unsafe { pthread_mutex_consistent(self.mtx_ptr()) };
        if eno != 0 {
            return Err(io::Error::from_raw_os_error(eno));
        }
        Ok(())
    }

    /// Lock (blocking). `EOWNERDEAD` counts as acquired after recovery.
    pub fn lock(&self) -> io::Result<()> {
        let eno = unsafe { libc::pthread_mutex_lock(self.mtx_ptr()) };
        match eno {
            0 => Ok(()),
            #[cfg(not(target_os = "macos"))]
            EOWNERDEAD => self.recover(),
            _ => Err(io::Error::from_raw_os_error(eno)),
        }
    }

    /// Returns `Ok(false)` when another owner holds the lock.
    pub fn try_lock(&self) -> io::Result<bool> {
        let eno = unsafe { libc::pthread_mutex_trylock(self.mtx_ptr()) };
        match eno {
            0 => Ok(true),
            libc::EBUSY => Ok(false),
            #[cfg(not(target_os = "macos"))]
            EOWNERDEAD => self.recover().map(|()| true),
            _ => Err(io::Error::from_raw_os_error(eno)),
        }
    }

    pub fn unlock(&self) -> io::Result<()> {
        let eno = unsafe { libc::pthread_mutex_unlock(self.mtx_ptr()) };
        if eno != 0 {
            return Err(io::Error::from_raw_os_error(eno));
        }
        Ok(())
    }

    /// Unlink the segment backing `name` and forget the local mapping so the
    /// next `open` starts from a freshly initialised mutex.
    pub fn clear_storage(name: &str) {
        MappingCache::mutexes().purge(name);
        PlatformShm::unlink_by_name(name);
    }
}

impl Drop for PlatformMutex {
    fn drop(&mut self) {
        // No pthread_mutex_destroy: other processes may still use the object,
        // and on macOS the address can be recycled for another segment after
        // munmap. Unmapping the last reference reclaims the memory.
        MappingCache::mutexes().release(&self.name);
    }
}

// ---------------------------------------------------------------------------
// OwnerProcess: a publishing process opened for descriptor duplication
// ---------------------------------------------------------------------------

/// Whether `err` means the target process does not exist.
pub fn is_process_gone(err: &io::Error) -> bool {
    err.raw_os_error() == Some(libc::ESRCH)
}

fn check_alive(pid: Pid) -> io::Result<()> {
    if pid <= 0 {
        return Err(io::Error::from_raw_os_error(libc::ESRCH));
    }
    if unsafe { libc::kill(pid, 0) } == 0 {
        return Ok(());
    }
    let e = io::Error::last_os_error();
    // EPERM: the process exists but belongs to someone else.
    if e.raw_os_error() == Some(libc::EPERM) {
        return Ok(());
    }
    Err(e)
}

/// Start time of the calling process, for telling it apart from a later
/// process that reuses its pid.
pub fn current_start_time() -> Option<u64> {
    process_start_time(current_pid())
}

/// Start time of `pid` in clock ticks since boot (`/proc/<pid>/stat`, field 22).
#[cfg(target_os = "linux")]
fn process_start_time(pid: Pid) -> Option<u64> {
    let stat = std::fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
    parse_start_time(&stat)
}

#[cfg(not(target_os = "linux"))]
fn process_start_time(_pid: Pid) -> Option<u64> {
    None
}

/// The command name (field 2) may itself contain spaces and parentheses, so
/// fields are counted from the last ')'.
#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn parse_start_time(stat: &str) -> Option<u64> {
    let rest = &stat[stat.rfind(')')? + 1..];
    // rest starts at field 3 (state); starttime is field 22.
    rest.split_whitespace().nth(19)?.parse().ok()
}

/// Let unrelated processes of the same user duplicate descriptors out of
/// this one.
///
/// Under Yama `ptrace_scope=1` only ancestors may `pidfd_getfd` from a
/// process unless it names a ptracer. This declares any process as allowed;
/// the usual same-user ptrace checks still apply. Kernels without Yama
/// reject the call with `EINVAL`, which is treated as success.
#[cfg(target_os = "linux")]
pub fn allow_duplication() -> io::Result<()> {
    const PR_SET_PTRACER: libc::c_int = 0x5961_6d61;
    const PR_SET_PTRACER_ANY: libc::c_ulong = libc::c_ulong::MAX;

    let rc = unsafe { libc::prctl(PR_SET_PTRACER, PR_SET_PTRACER_ANY, 0, 0, 0) };
    if rc == 0 {
        return Ok(());
    }
    let e = io::Error::last_os_error();
    if e.raw_os_error() == Some(libc::EINVAL) {
        return Ok(());
    }
    Err(e)
}

#[cfg(not(target_os = "linux"))]
pub fn allow_duplication() -> io::Result<()> {
    Ok(())
}

#[cfg(target_os = "linux")]
pub struct OwnerProcess {
    pid: Pid,
    pidfd: OwnedFd,
}

#[cfg(target_os = "linux")]
impl OwnerProcess {
    pub fn open(pid: Pid) -> io::Result<Self> {
        check_alive(pid)?;
        let fd = unsafe { libc::syscall(libc::SYS_pidfd_open, pid, 0) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self { pid, pidfd: unsafe { OwnedFd::from_raw_fd(fd as RawFd) } })
    }

    /// Start time of the opened process. The pidfd pins the pid, so a match
    /// with a recorded start time identifies the process that was recorded.
    pub fn start_time(&self) -> Option<u64> {
        process_start_time(self.pid)
    }

    /// Copy descriptor `raw` of the owner into this process (close-on-exec).
    pub fn duplicate(&self, raw: RawValue) -> io::Result<OwnedNative> {
        let fd = unsafe { libc::syscall(libc::SYS_pidfd_getfd, self.pidfd.as_raw_fd(), raw, 0) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(unsafe { OwnedFd::from_raw_fd(fd as RawFd) })
    }

    /// A pidfd polls readable once the process has terminated, zombies included.
    pub fn has_exited(&self) -> bool {
        let mut pfd = libc::pollfd { fd: self.pidfd.as_raw_fd(), events: libc::POLLIN, revents: 0 };
        let n = unsafe { libc::poll(&mut pfd, 1, 0) };
        n > 0 && (pfd.revents & libc::POLLIN) != 0
    }
}

#[cfg(not(target_os = "linux"))]
pub struct OwnerProcess {
    pid: Pid,
}

#[cfg(not(target_os = "linux"))]
impl OwnerProcess {
    pub fn open(pid: Pid) -> io::Result<Self> {
        check_alive(pid)?;
        Ok(Self { pid })
    }

    /// No API on this platform copies a descriptor out of an unrelated process.
    pub fn duplicate(&self, _raw: RawValue) -> io::Result<OwnedNative> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "descriptor duplication from another process is not supported on this platform",
        ))
    }

    pub fn start_time(&self) -> Option<u64> {
        process_start_time(self.pid)
    }

    pub fn has_exited(&self) -> bool {
        check_alive(self.pid).is_err()
    }
}
