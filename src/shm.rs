// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Shared memory that hosts process-shared primitives.
// Delegates to platform::PlatformShm.

use std::io;
use std::path::Path;

use crate::platform::PlatformShm;

/// Open mode for shared memory segments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShmOpenMode {
    /// Create exclusively; fail if it already exists.
    Create,
    /// Open existing; fail if it does not exist.
    Open,
    /// Create if missing, open if it already exists.
    CreateOrOpen,
}

/// A shared memory mapping: a named POSIX segment or a memory-mapped file.
///
/// Named segments carry a trailing reference counter shared by every process
/// mapping them and are unlinked when the last mapping goes away. File
/// mappings leave the file in place.
///
/// [`ShmHandle::device`] and [`ShmHandle::inode`] identify the backing
/// object; together with a byte offset they name the semaphore of an emulated
/// [`CondVar`](crate::CondVar) living in the mapping.
pub struct ShmHandle {
    inner: PlatformShm,
}

impl ShmHandle {
    /// Acquire a named shared memory region of `size` bytes (user-visible).
    ///
    /// The actual mapped region is slightly larger to hold the ref counter.
    /// A newly created segment reads as zero.
    pub fn acquire(name: &str, size: usize, mode: ShmOpenMode) -> io::Result<Self> {
        let platform_mode = match mode {
            ShmOpenMode::Create => crate::platform::posix::ShmMode::Create,
            ShmOpenMode::Open => crate::platform::posix::ShmMode::Open,
            ShmOpenMode::CreateOrOpen => crate::platform::posix::ShmMode::CreateOrOpen,
        };

        let inner = PlatformShm::acquire(name, size, platform_mode)?;
        Ok(Self { inner })
    }

    /// Map the first `size` bytes of the file at `path`, creating the file
    /// and extending it with zeroes as needed.
    pub fn map_file(path: impl AsRef<Path>, size: usize) -> io::Result<Self> {
        let inner = PlatformShm::map_file(path.as_ref(), size)?;
        Ok(Self { inner })
    }

    /// Pointer to the start of the user-visible shared memory region.
    pub fn as_ptr(&self) -> *const u8 {
        self.inner.as_ptr()
    }

    /// Mutable pointer to the start of the user-visible shared memory region.
    pub fn as_mut_ptr(&self) -> *mut u8 {
        self.inner.as_mut_ptr()
    }

    /// Total mapped size (including the trailing ref counter).
    pub fn mapped_size(&self) -> usize {
        self.inner.mapped_size()
    }

    /// User-requested size (the usable portion).
    pub fn user_size(&self) -> usize {
        self.inner.user_size()
    }

    pub fn device(&self) -> u64 {
        self.inner.device()
    }

    pub fn inode(&self) -> u64 {
        self.inner.inode()
    }

    /// The platform name used to open the segment; `None` for files.
    pub fn name(&self) -> Option<&str> {
        self.inner.name()
    }

    /// Whether this handle created the segment (nobody mapped it before).
    /// Always true for file mappings.
    pub fn is_creator(&self) -> bool {
        self.inner.prev_ref_count() == 0
    }

    /// Current reference count (number of processes/handles mapping this segment).
    pub fn ref_count(&self) -> i32 {
        self.inner.ref_count()
    }

    /// Force-remove the backing segment.
    pub fn unlink(&self) {
        self.inner.unlink();
    }

    /// Remove a named shm segment by name without needing an open handle.
    pub fn unlink_by_name(name: &str) {
        PlatformShm::unlink_by_name(name);
    }
}
