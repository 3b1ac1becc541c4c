// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Named inter-process counting semaphore.
// Delegates to platform::PlatformSemaphore (POSIX sem_open).

use std::io;
use std::time::Duration;

use crate::platform::PlatformSemaphore;

/// A named, inter-process counting semaphore.
///
/// Every process opening the same name shares one permit count. This is the
/// backend of the emulated process-shared [`CondVar`](crate::CondVar).
pub struct NamedSemaphore {
    inner: PlatformSemaphore,
}

impl NamedSemaphore {
    /// Open (or create with `initial` permits) a named semaphore.
    /// An existing semaphore keeps its current count.
    pub fn open(name: &str, initial: u32) -> io::Result<Self> {
        let inner = PlatformSemaphore::open(name, initial)?;
        Ok(Self { inner })
    }

    /// The platform name (with leading '/').
    pub fn name(&self) -> &str {
        self.inner.name()
    }

    /// Block until a permit is available and take it.
    pub fn wait(&self) -> io::Result<()> {
        self.inner.wait()
    }

    /// Take a permit without blocking. Returns `Ok(false)` if none is available.
    pub fn try_wait(&self) -> io::Result<bool> {
        self.inner.try_wait()
    }

    /// Wait up to `timeout` for a permit.
    /// Returns `Ok(true)` if a permit was taken, `Ok(false)` on timeout.
    pub fn wait_timeout(&self, timeout: Duration) -> io::Result<bool> {
        self.inner.wait_timeout(timeout)
    }

    /// Release `count` permits.
    pub fn post(&self, count: u32) -> io::Result<()> {
        self.inner.post(count)
    }

    /// Remove the name. Processes that already opened it keep working.
    pub fn unlink(name: &str) {
        PlatformSemaphore::unlink_by_name(name);
    }

    /// Remove the backing storage for a named semaphore.
    pub fn clear_storage(name: &str) {
        PlatformSemaphore::unlink_by_name(name);
    }
}
