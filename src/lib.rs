// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Synchronization primitives for processes sharing memory-mapped files:
// process-local and process-shared mutexes, robust mutexes with an owner-death
// recovery protocol, condition variables with a named-semaphore emulation for
// platforms without dependable process-shared condition variables, and an
// ordering-aware atomic cell.

#[cfg(not(unix))]
compile_error!("shmsync supports POSIX platforms only");

pub mod naming;

mod platform;

mod error;
pub use error::{Error, Result};

mod config;
pub use config::{ConfigError, EmulationPolicy, SyncConfig, CONDVAR_EMULATION_ENV};

mod atomic;
pub use atomic::{Atomic, AtomicInteger, AtomicValue};

mod mutex;
pub use mutex::{DeferredLock, Mutex, ScopedLock};

mod robust;
pub use robust::{RobustEvent, RobustMutex, RobustScopedLock, RobustState};

mod semaphore;
pub use semaphore::NamedSemaphore;

mod condition;
pub use condition::{CondVar, SharedPart, WaitStatus};

mod shm;
pub use shm::{ShmHandle, ShmOpenMode};

mod thread;
pub use thread::Thread;
