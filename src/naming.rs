// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Names for POSIX shared memory segments and named semaphores.
// Pure functions: every process that derives a name from the same inputs gets
// the same string, without touching any OS object.

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

/// Maximum length for POSIX shm and semaphore names. 0 disables truncation.
///
/// On macOS `PSHMNAMLEN` and `PSEMNAMLEN` are 31. On Linux the limit is
/// `NAME_MAX` minus the `sem.` prefix, far above anything generated here.
#[cfg(target_os = "macos")]
pub const NAME_MAX: usize = 31;

#[cfg(not(target_os = "macos"))]
pub const NAME_MAX: usize = 0;

/// Prefix of every semaphore backing an emulated condition variable.
pub const CONDVAR_SEM_PREFIX: &str = "shmsync_cv";

/// Produce a POSIX-safe object name (with leading '/').
///
/// When `NAME_MAX > 0`, names whose POSIX form would exceed that limit are
/// shortened to `/<prefix>_<16-hex-FNV-1a-hash>`, keeping as much of the
/// original as fits for debuggability.
pub fn make_shm_name(name: &str) -> String {
    shorten(name, NAME_MAX)
}

/// Name of the semaphore backing an emulated condition variable.
///
/// Derived only from the identity of the mapped object (`device`, `inode`)
/// and the byte offset of the condition variable's shared part inside it, so
/// every process mapping the same file at any address resolves to the same
/// semaphore, while two condition variables in the same file never share one.
pub fn condvar_semaphore_name(device: u64, inode: u64, offset: usize) -> String {
    let raw = format!("/{CONDVAR_SEM_PREFIX}_{device:x}_{inode:x}_{offset:x}");
    shorten(&raw, NAME_MAX)
}

fn shorten(name: &str, max: usize) -> String {
    let result = if name.starts_with('/') {
        name.to_string()
    } else {
        format!("/{name}")
    };

    if max == 0 || result.len() <= max {
        return result;
    }

    // 1 (underscore) + 16 (hex hash)
    const HASH_SUFFIX_LEN: usize = 1 + 16;
    let prefix_len = if max > HASH_SUFFIX_LEN + 1 {
        max - HASH_SUFFIX_LEN - 1
    } else {
        0
    };

    let hex = to_hex(fnv1a_64(result.as_bytes()));

    let mut shortened = String::with_capacity(max);
    shortened.push('/');
    if prefix_len > 0 {
        let body = &result[1..];
        // Cut on a char boundary; user names may be non-ASCII.
        let mut take = prefix_len.min(body.len());
        while !body.is_char_boundary(take) {
            take -= 1;
        }
        shortened.push_str(&body[..take]);
    }
    shortened.push('_');
    shortened.extend(hex.iter().map(|&b| b as char));
    shortened
}
