// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Windows implementation of shared memory, named mutex and handle duplication.
// Shared memory is a pagefile-backed file mapping, the mutex a kernel named
// mutex, and duplication OpenProcess + DuplicateHandle.

use std::io;
use std::os::windows::io::{AsRawHandle, BorrowedHandle, FromRawHandle, OwnedHandle, RawHandle};
use std::ptr;
use std::sync::atomic::{AtomicI32, Ordering};

use windows_sys::Win32::Foundation::{CloseHandle, GetLastError, FALSE, HANDLE};

// ---------------------------------------------------------------------------
// Native handle types
// ---------------------------------------------------------------------------

/// Raw `HANDLE` value as stored in a handle record.
pub type RawValue = isize;
/// Process id as stored in a handle record.
pub type Pid = u32;
/// Handle owned by this process.
pub type OwnedNative = OwnedHandle;
/// Handle borrowed from the caller.
pub type BorrowedNative<'a> = BorrowedHandle<'a>;

pub fn raw_value(handle: BorrowedNative<'_>) -> RawValue {
    handle.as_raw_handle() as RawValue
}

pub fn current_pid() -> Pid {
    unsafe { windows_sys::Win32::System::Threading::GetCurrentProcessId() }
}

// ---------------------------------------------------------------------------
// Layout helpers: same layout as the POSIX side
// ---------------------------------------------------------------------------

const ALIGN: usize = std::mem::align_of::<AtomicI32>();

pub(crate) fn calc_size(user_size: usize) -> usize {
    let aligned = ((user_size.wrapping_sub(1) / ALIGN) + 1) * ALIGN;
    aligned + std::mem::size_of::<AtomicI32>()
}

unsafe fn acc_of<'a>(mem: *mut u8, total_size: usize) -> &'a AtomicI32 {
    let offset = total_size - std::mem::size_of::<AtomicI32>();
    &*(mem.add(offset) as *const AtomicI32)
}

/// Encode a name as a null-terminated wide string for Win32 APIs.
fn to_wide(s: &str) -> Vec<u16> {
    s.encode_utf16().chain(std::iter::once(0)).collect()
}

// ---------------------------------------------------------------------------
// PlatformShm: file mapping backed by the paging file
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShmMode {
    Create,
    Open,
    CreateOrOpen,
}

pub struct PlatformShm {
    handle: HANDLE,
    mem: *mut u8,
    size: usize,      // total mapped size
    user_size: usize, // user-requested size
}

unsafe impl Send for PlatformShm {}
unsafe impl Sync for PlatformShm {}

impl PlatformShm {
    pub fn acquire(name: &str, user_size: usize, mode: ShmMode) -> io::Result<Self> {
        use windows_sys::Win32::Foundation::{ERROR_ALREADY_EXISTS, INVALID_HANDLE_VALUE};
        use windows_sys::Win32::System::Memory::*;

        if user_size == 0 {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "size is 0"));
        }

        let wide_name = to_wide(name);
        let total_size = calc_size(user_size);

        let handle = if mode == ShmMode::Open {
            let h = unsafe { OpenFileMappingW(FILE_MAP_ALL_ACCESS, FALSE, wide_name.as_ptr()) };
            if h.is_null() {
                return Err(io::Error::last_os_error());
            }
            h
        } else {
            let size = total_size as u64;
            let h = unsafe {
                CreateFileMappingW(
                    INVALID_HANDLE_VALUE,
                    ptr::null(),
                    PAGE_READWRITE | SEC_COMMIT,
                    (size >> 32) as u32,
                    (size & 0xFFFF_FFFF) as u32,
                    wide_name.as_ptr(),
                )
            };
            let err = unsafe { GetLastError() };
            if h.is_null() {
                return Err(io::Error::from_raw_os_error(err as i32));
            }
            if mode == ShmMode::Create && err == ERROR_ALREADY_EXISTS {
                unsafe { CloseHandle(h) };
                return Err(io::Error::new(io::ErrorKind::AlreadyExists, "shm already exists"));
            }
            h
        };

        let view = unsafe { MapViewOfFile(handle, FILE_MAP_ALL_ACCESS, 0, 0, 0) };
        if view.Value.is_null() {
            let e = io::Error::last_os_error();
            unsafe { CloseHandle(handle) };
            return Err(e);
        }
        let mem = view.Value as *mut u8;

        // An existing section keeps the size it was created with; refuse one
        // too small to hold this opener's layout.
        let mut info: MEMORY_BASIC_INFORMATION = unsafe { std::mem::zeroed() };
        let ret = unsafe {
            VirtualQuery(
                mem as *const _,
                &mut info,
                std::mem::size_of::<MEMORY_BASIC_INFORMATION>(),
            )
        };
        let fail = |e: io::Error| {
            unsafe {
                UnmapViewOfFile(view);
                CloseHandle(handle);
            }
            Err(e)
        };
        if ret == 0 {
            return fail(io::Error::last_os_error());
        }
        if info.RegionSize < total_size {
            return fail(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "existing mapping is {} bytes, expected {total_size}",
                    info.RegionSize
                ),
            ));
        }

        unsafe { acc_of(mem, total_size).fetch_add(1, Ordering::AcqRel) };

        Ok(Self { handle, mem, size: total_size, user_size })
    }

    pub fn as_mut_ptr(&self) -> *mut u8 {
        self.mem
    }

    pub fn user_size(&self) -> usize {
        self.user_size
    }

    pub fn ref_count(&self) -> i32 {
        if self.mem.is_null() || self.size == 0 {
            return 0;
        }
        unsafe { acc_of(self.mem, self.size).load(Ordering::Acquire) }
    }

    pub fn unlink(&self) {
        // The kernel frees a section when its last handle closes.
    }

    pub fn unlink_by_name(_name: &str) {}
}

impl Drop for PlatformShm {
    fn drop(&mut self) {
        use windows_sys::Win32::System::Memory::{UnmapViewOfFile, MEMORY_MAPPED_VIEW_ADDRESS};

        if !self.mem.is_null() && self.size > 0 {
            unsafe { acc_of(self.mem, self.size).fetch_sub(1, Ordering::AcqRel) };
            unsafe { UnmapViewOfFile(MEMORY_MAPPED_VIEW_ADDRESS { Value: self.mem as *mut _ }) };
        }
        if !self.handle.is_null() {
            unsafe { CloseHandle(self.handle) };
        }
    }
}

// ---------------------------------------------------------------------------
// PlatformMutex: kernel named mutex
// ---------------------------------------------------------------------------

pub struct PlatformMutex {
    handle: HANDLE,
}

unsafe impl Send for PlatformMutex {}
unsafe impl Sync for PlatformMutex {}

impl PlatformMutex {
    pub fn open(name: &str) -> io::Result<Self> {
        use windows_sys::Win32::System::Threading::CreateMutexW;

        let wide_name = to_wide(name);
        let h = unsafe { CreateMutexW(ptr::null(), FALSE, wide_name.as_ptr()) };
        if h.is_null() {
            return Err(io::Error::last_os_error());
        }
        Ok(Self { handle: h })
    }

    fn wait(&self, timeout_ms: u32) -> io::Result<bool> {
        use windows_sys::Win32::Foundation::{WAIT_ABANDONED, WAIT_OBJECT_0, WAIT_TIMEOUT};
        use windows_sys::Win32::System::Threading::WaitForSingleObject;

        match unsafe { WaitForSingleObject(self.handle, timeout_ms) } {
            // An abandoned mutex is owned by the caller after the wait.
            WAIT_OBJECT_0 | WAIT_ABANDONED => Ok(true),
            WAIT_TIMEOUT => Ok(false),
            _ => Err(io::Error::last_os_error()),
        }
    }

    pub fn lock(&self) -> io::Result<()> {
        use windows_sys::Win32::System::Threading::INFINITE;

        match self.wait(INFINITE)? {
            true => Ok(()),
            false => Err(io::Error::new(io::ErrorKind::TimedOut, "infinite wait timed out")),
        }
    }

    pub fn try_lock(&self) -> io::Result<bool> {
        self.wait(0)
    }

    pub fn unlock(&self) -> io::Result<()> {
        use windows_sys::Win32::System::Threading::ReleaseMutex;

        if unsafe { ReleaseMutex(self.handle) } == 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    pub fn clear_storage(_name: &str) {}
}

impl Drop for PlatformMutex {
    fn drop(&mut self) {
        if !self.handle.is_null() {
            unsafe { CloseHandle(self.handle) };
        }
    }
}

// ---------------------------------------------------------------------------
// OwnerProcess: a publishing process opened with PROCESS_DUP_HANDLE
// ---------------------------------------------------------------------------

/// Whether `err` means the target process does not exist.
pub fn is_process_gone(err: &io::Error) -> bool {
    use windows_sys::Win32::Foundation::ERROR_INVALID_PARAMETER;
    err.raw_os_error() == Some(ERROR_INVALID_PARAMETER as i32)
}

/// Creation time of a process as a FILETIME count.
fn creation_time(process: HANDLE) -> Option<u64> {
    use windows_sys::Win32::Foundation::FILETIME;
    use windows_sys::Win32::System::Threading::GetProcessTimes;

    let zero = FILETIME { dwLowDateTime: 0, dwHighDateTime: 0 };
    let (mut created, mut exited, mut kernel, mut user) = (zero, zero, zero, zero);
    let ok = unsafe { GetProcessTimes(process, &mut created, &mut exited, &mut kernel, &mut user) };
    if ok == 0 {
        return None;
    }
    Some((u64::from(created.dwHighDateTime) << 32) | u64::from(created.dwLowDateTime))
}

/// Start time of the calling process, for telling it apart from a later
/// process that reuses its id.
pub fn current_start_time() -> Option<u64> {
    use windows_sys::Win32::System::Threading::GetCurrentProcess;
    creation_time(unsafe { GetCurrentProcess() })
}

/// `PROCESS_DUP_HANDLE` access is governed by the process DACL; nothing to grant.
pub fn allow_duplication() -> io::Result<()> {
    Ok(())
}

pub struct OwnerProcess {
    handle: HANDLE,
}

impl OwnerProcess {
    pub fn open(pid: Pid) -> io::Result<Self> {
        use windows_sys::Win32::System::Threading::{
            OpenProcess, PROCESS_DUP_HANDLE, PROCESS_QUERY_LIMITED_INFORMATION,
        };

        let h = unsafe {
            OpenProcess(PROCESS_DUP_HANDLE | PROCESS_QUERY_LIMITED_INFORMATION, FALSE, pid)
        };
        if h.is_null() {
            return Err(io::Error::last_os_error());
        }
        Ok(Self { handle: h })
    }

    /// Duplicate `raw` from the owner into this process with the same access.
    pub fn duplicate(&self, raw: RawValue) -> io::Result<OwnedNative> {
        use windows_sys::Win32::Foundation::{DuplicateHandle, DUPLICATE_SAME_ACCESS};
        use windows_sys::Win32::System::Threading::GetCurrentProcess;

        let mut dup: HANDLE = ptr::null_mut();
        let ok = unsafe {
            DuplicateHandle(
                self.handle,
                raw as HANDLE,
                GetCurrentProcess(),
                &mut dup,
                0,
                FALSE,
                DUPLICATE_SAME_ACCESS,
            )
        };
        if ok == 0 || dup.is_null() {
            return Err(io::Error::last_os_error());
        }
        Ok(unsafe { OwnedHandle::from_raw_handle(dup as RawHandle) })
    }

    /// Creation time of the opened process. The open handle keeps its id
    /// from being reused.
    pub fn start_time(&self) -> Option<u64> {
        creation_time(self.handle)
    }

    pub fn has_exited(&self) -> bool {
        use windows_sys::Win32::Foundation::STILL_ACTIVE;
        use windows_sys::Win32::System::Threading::GetExitCodeProcess;

        let mut code: u32 = 0;
        let ok = unsafe { GetExitCodeProcess(self.handle, &mut code) };
        ok != 0 && code != STILL_ACTIVE as u32
    }
}

impl Drop for OwnerProcess {
    fn drop(&mut self) {
        if !self.handle.is_null() {
            unsafe { CloseHandle(self.handle) };
        }
    }
}
