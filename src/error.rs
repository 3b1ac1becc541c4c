// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Error types and the fatal-termination path.
//
// Only shared-state failures (a robust lock whose owner died) are surfaced as
// `Error`. Failing to create, use or destroy a native primitive, and misuse
// such as unlocking a lock that is not held, terminate the process.

use thiserror::Error;

/// Failure of the robust-lock recovery protocol.
#[derive(Debug, Error)]
pub enum Error {
    /// The robust mutex is in the unrecoverable state: a previous owner died
    /// and nobody restored a consistent view of the shared data before the
    /// lock was released.
    #[error("failed to recover consistent state of shared memory")]
    NotRecoverable,

    /// A recovery callback failed with an application error. The mutex has
    /// entered the unrecoverable state.
    #[error("recovery of shared state failed: {0}")]
    Recovery(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl Error {
    /// Wrap an application error raised by a recovery callback.
    pub fn recovery<E>(err: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Error::Recovery(err.into())
    }

    /// True for [`Error::NotRecoverable`].
    pub fn is_not_recoverable(&self) -> bool {
        matches!(self, Error::NotRecoverable)
    }
}

/// Result alias used by the robust locking API.
pub type Result<T> = std::result::Result<T, Error>;

/// Terminate the process after logging `what`.
///
/// Used for environment failures and contract violations: a half-initialised
/// or misused primitive in shared memory cannot be handed back to the caller.
#[cold]
#[inline(never)]
pub(crate) fn terminate(what: &str) -> ! {
    tracing::error!(target: "shmsync", "fatal: {what}");
    std::process::abort()
}

/// Terminate the process after logging `what` together with an OS error code.
#[cold]
#[inline(never)]
pub(crate) fn terminate_errno(what: &str, eno: i32) -> ! {
    let err = std::io::Error::from_raw_os_error(eno);
    tracing::error!(target: "shmsync", errno = eno, "fatal: {what}: {err}");
    std::process::abort()
}

/// Terminate the process after logging `what` together with an I/O error.
#[cold]
#[inline(never)]
pub(crate) fn terminate_io(what: &str, err: &std::io::Error) -> ! {
    tracing::error!(target: "shmsync", "fatal: {what}: {err}");
    std::process::abort()
}
