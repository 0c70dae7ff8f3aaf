// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Key validation and platform object naming.
// Every primitive runs its key through `check_key` before touching the OS,
// so an over-long or malformed key fails construction instead of reaching a
// syscall.

use crate::error::{IpcError, IpcResult};

/// Maximum key length accepted by [`check_key`].
///
/// On Unix this is `NAME_MAX` (255 bytes), measured without the optional
/// leading `/`. On Windows it is `MAX_PATH` (260), measured in UTF-16 units,
/// the limit for kernel object names.
#[cfg(unix)]
pub const MAX_KEY_LEN: usize = 255;

#[cfg(windows)]
pub const MAX_KEY_LEN: usize = 260;

/// Length of `key` as the platform counts it.
#[cfg(unix)]
fn platform_len(key: &str) -> usize {
    key.strip_prefix('/').unwrap_or(key).len()
}

#[cfg(windows)]
fn platform_len(key: &str) -> usize {
    key.encode_utf16().count()
}

/// Validate a caller-chosen key.
///
/// Rejects empty keys, keys with an interior NUL and keys longer than
/// [`MAX_KEY_LEN`].
pub fn check_key(key: &str) -> IpcResult<()> {
    if key.is_empty() || key == "/" {
        return Err(IpcError::InvalidKey { key: key.to_owned(), reason: "key is empty" });
    }
    if key.as_bytes().contains(&0) {
        return Err(IpcError::InvalidKey {
            key: key.to_owned(),
            reason: "key contains a NUL byte",
        });
    }
    let len = platform_len(key);
    if len > MAX_KEY_LEN {
        return Err(IpcError::NameTooLong { key: key.to_owned(), len, max: MAX_KEY_LEN });
    }
    Ok(())
}

/// FNV-1a 64-bit hash.
pub fn fnv1a_64(data: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf29ce484222325;
    for &b in data {
        hash ^= b as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}

/// Convert a 64-bit value to a fixed-width 16-char lowercase hex string.
fn to_hex(val: u64) -> [u8; 16] {
    const DIGITS: &[u8; 16] = b"0123456789abcdef";
    let mut buf = [0u8; 16];
    let mut v = val;
    for i in (0..16).rev() {
        buf[i] = DIGITS[(v & 0xf) as usize];
        v >>= 4;
    }
    buf
}

/// Longest POSIX shm name the OS accepts, including the leading '/'.
/// 0 disables shortening.
///
/// macOS caps names at `PSHMNAMLEN` (31); Linux accepts any key that
/// passed [`check_key`].
#[cfg(target_os = "macos")]
pub const SHM_NAME_MAX: usize = 31;

#[cfg(not(target_os = "macos"))]
pub const SHM_NAME_MAX: usize = 0;

/// Produce a POSIX shm name (with leading '/') for a validated key.
///
/// When `SHM_NAME_MAX > 0`, names longer than the limit are shortened to
/// `/<prefix>_<16-hex-FNV-1a-hash>` where `<prefix>` is the head of the key,
/// so distinct long keys still map to distinct objects.
pub fn make_shm_name(name: &str) -> String {
    let result = if name.starts_with('/') {
        name.to_string()
    } else {
        format!("/{name}")
    };

    if SHM_NAME_MAX == 0 || result.len() <= SHM_NAME_MAX {
        return result;
    }

    // 1 (underscore) + 16 (hex hash)
    const HASH_SUFFIX_LEN: usize = 1 + 16;
    let prefix_len = SHM_NAME_MAX.saturating_sub(HASH_SUFFIX_LEN + 1);

    let hex = to_hex(fnv1a_64(result.as_bytes()));

    let mut shortened = String::with_capacity(SHM_NAME_MAX);
    shortened.push('/');
    // Take whole chars only so a multi-byte key never splits mid-codepoint.
    let body = &result[1..];
    let mut take = prefix_len.min(body.len());
    while !body.is_char_boundary(take) {
        take -= 1;
    }
    shortened.push_str(&body[..take]);
    shortened.push('_');
    shortened.extend(hex.iter().map(|&b| b as char));
    shortened
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fnv1a_known_value() {
        assert_eq!(fnv1a_64(b""), 0xcbf29ce484222325);
        assert_eq!(fnv1a_64(b"a"), 0xaf63dc4c8601ec8c);
    }

    #[test]
    fn make_shm_name_prepends_slash() {
        assert_eq!(make_shm_name("foo"), "/foo");
        assert_eq!(make_shm_name("/bar"), "/bar");
    }

    #[test]
    fn to_hex_fixed_width() {
        assert_eq!(&to_hex(0x0123456789abcdef), b"0123456789abcdef");
        assert_eq!(&to_hex(0xff), b"00000000000000ff");
    }

    #[test]
    fn check_key_accepts_limit() {
        let key = "k".repeat(MAX_KEY_LEN);
        assert!(check_key(&key).is_ok());
    }

    #[test]
    fn check_key_rejects_over_limit() {
        let key = "k".repeat(MAX_KEY_LEN + 1);
        match check_key(&key) {
            Err(IpcError::NameTooLong { len, max, .. }) => {
                assert_eq!(len, MAX_KEY_LEN + 1);
                assert_eq!(max, MAX_KEY_LEN);
            }
            other => panic!("expected NameTooLong, got {other:?}"),
        }
    }

    #[test]
    fn check_key_rejects_empty_and_nul() {
        assert!(matches!(check_key(""), Err(IpcError::InvalidKey { .. })));
        assert!(matches!(check_key("/"), Err(IpcError::InvalidKey { .. })));
        assert!(matches!(check_key("a\0b"), Err(IpcError::InvalidKey { .. })));
    }

    #[cfg(unix)]
    #[test]
    fn leading_slash_does_not_count() {
        let key = format!("/{}", "k".repeat(MAX_KEY_LEN));
        assert!(check_key(&key).is_ok());
    }
}
