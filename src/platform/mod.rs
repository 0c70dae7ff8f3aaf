// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// The single platform seam. Each OS module provides the same set of items:
//
//   PlatformShm, PlatformMutex, ShmMode       shared memory and named mutex
//   OwnerProcess, is_process_gone             resolving a publishing process
//   current_start_time, allow_duplication     owner identity and access
//   RawValue, Pid, OwnedNative, BorrowedNative, raw_value, current_pid

#[cfg(unix)]
pub mod posix;

#[cfg(windows)]
pub mod windows;

#[cfg(unix)]
pub use posix::*;

#[cfg(windows)]
pub use windows::*;
