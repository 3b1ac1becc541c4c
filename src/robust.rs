// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Robust process-shared mutex: detects that a previous owner died while
// holding the lock and drives an application-supplied recovery callback.

use std::marker::PhantomData;

use crate::atomic::Atomic;
use crate::error::{terminate_errno, Error, Result};
use crate::mutex::Mutex;
use crate::platform::posix::{self, MutexKind, ENOTRECOVERABLE, EOWNERDEAD};

/// Consistency state of a [`RobustMutex`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum RobustState {
    /// Consistent and free.
    Unlocked = 0,
    /// Consistent and held.
    Locked = 1,
    /// An owner died while holding the lock; the current holder must recover.
    Inconsistent = 2,
    /// Recovery failed or was skipped. Every future lock attempt fails.
    Unrecoverable = 3,
}

/// Something that happened to a [`RobustMutex`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RobustEvent {
    /// Acquired with no owner death observed.
    Lock,
    Unlock,
    /// Acquired, and the previous owner had died holding the lock.
    OwnerDied,
    /// The recovery callback succeeded and the lock was marked consistent.
    Recovered,
    /// The recovery callback failed.
    RecoveryFailed,
}

impl RobustState {
    /// Pure transition function of the robust locking protocol.
    ///
    /// `Unrecoverable` absorbs every event. Releasing an `Inconsistent` lock
    /// without recovering makes it `Unrecoverable`. Owner death is reported
    /// by the acquiring side, so it leads to `Inconsistent` from any live
    /// state.
    pub fn next(self, event: RobustEvent) -> RobustState {
        use RobustEvent as E;
        use RobustState as S;

        match (self, event) {
            (S::Unrecoverable, _) => S::Unrecoverable,
            (_, E::Lock) => S::Locked,
            (S::Inconsistent, E::Unlock) => S::Unrecoverable,
            (_, E::Unlock) => S::Unlocked,
            (_, E::OwnerDied) => S::Inconsistent,
            (S::Inconsistent, E::Recovered) => S::Locked,
            (s, E::Recovered) => s,
            (_, E::RecoveryFailed) => S::Unrecoverable,
        }
    }

    /// True unless the lock is waiting for recovery or beyond saving.
    pub fn is_consistent(self) -> bool {
        matches!(self, RobustState::Unlocked | RobustState::Locked)
    }

    fn from_raw(raw: u32) -> Self {
        match raw {
            0 => RobustState::Unlocked,
            1 => RobustState::Locked,
            2 => RobustState::Inconsistent,
            _ => RobustState::Unrecoverable,
        }
    }
}

/// A robust, process-shared mutex.
///
/// Detects whether a thread or process died while holding the lock. The
/// next locker then runs a recovery callback, with the lock held, whose job
/// is to re-establish a consistent view of the shared data. If recovery
/// fails the mutex becomes unrecoverable and every later lock attempt, from
/// any process, fails with [`Error::NotRecoverable`].
///
/// On platforms without robust mutexes (see
/// [`RobustMutex::is_robust_on_this_platform`]) this is a plain
/// process-shared mutex: if an owner dies holding the lock, every later lock
/// attempt blocks forever.
///
/// The mutex and its state word are laid out `repr(C)` so the whole object
/// can live in a shared mapping.
#[repr(C)]
pub struct RobustMutex {
    mutex: Mutex,
    // Written only by the lock holder.
    state: Atomic<u32>,
}

impl RobustMutex {
    /// A robust mutex allocated on the heap of this process.
    pub fn new() -> Box<Self> {
        let mut mutex = Box::new(Self {
            mutex: unsafe { Mutex::uninit() },
            state: Atomic::new(RobustState::Unlocked as u32),
        });
        // Safety: freshly allocated, unaliased and never moved again.
        unsafe { Mutex::init_in_place(&mut mutex.mutex, MutexKind::Robust) };
        mutex
    }

    /// Initialise a robust mutex in place, typically inside a shared mapping.
    ///
    /// # Safety
    /// `place` must be valid for writes, suitably aligned, and not in use by
    /// any thread or process. The returned reference must not outlive the
    /// mapping.
    pub unsafe fn init_process_shared<'a>(place: *mut Self) -> &'a Self {
        Mutex::init_in_place(std::ptr::addr_of_mut!((*place).mutex), MutexKind::Robust);
        std::ptr::addr_of_mut!((*place).state).write(Atomic::new(RobustState::Unlocked as u32));
        &*place
    }

    pub fn is_robust_on_this_platform() -> bool {
        posix::ROBUST_SUPPORTED
    }

    /// Last state recorded by a lock holder.
    pub fn state(&self) -> RobustState {
        RobustState::from_raw(self.state.load_acquire())
    }

    pub(crate) fn advance(&self, event: RobustEvent) -> RobustState {
        let next = self.state().next(event);
        self.state.store_release(next as u32);
        next
    }

    /// Lock, running `recover` first if a previous owner died holding it.
    ///
    /// `recover` is called with the lock held and only when owner death was
    /// observed. If it returns `Ok`, the mutex is marked consistent and the
    /// caller owns it. If it fails, the mutex is released without being
    /// marked consistent, which makes it unrecoverable, and the callback's
    /// error is returned. Returns [`Error::NotRecoverable`] when the mutex is
    /// already unrecoverable.
    pub fn lock<F>(&self, mut recover: F) -> Result<()>
    where
        F: FnMut() -> Result<()>,
    {
        if self.low_level_lock()? {
            return Ok(());
        }
        self.recover_locked(&mut recover)
    }

    /// Run the recovery protocol for a lock just acquired with a dead owner.
    pub(crate) fn recover_locked<F>(&self, recover: &mut F) -> Result<()>
    where
        F: FnMut() -> Result<()>,
    {
        match recover() {
            Ok(()) => {
                self.mark_as_consistent();
                tracing::info!(target: "shmsync::robust", "shared state recovered");
                Ok(())
            }
            Err(e) => {
                tracing::warn!(
                    target: "shmsync::robust",
                    error = %e,
                    "recovery failed; mutex is now unrecoverable"
                );
                self.advance(RobustEvent::RecoveryFailed);
                self.raw_unlock();
                Err(e)
            }
        }
    }

    pub fn unlock(&self) {
        self.advance(RobustEvent::Unlock);
        self.raw_unlock();
    }

    fn raw_unlock(&self) {
        let eno = unsafe { posix::mutex_unlock(self.mutex.native_ptr()) };
        if eno != 0 {
            terminate_errno("pthread_mutex_unlock() failed", eno);
        }
    }

    /// Acquire without running recovery.
    ///
    /// Returns `Ok(true)` normally and `Ok(false)` if a previous owner died
    /// holding the lock; in that case the caller owns an inconsistent lock
    /// and must call [`RobustMutex::mark_as_consistent`] before unlocking,
    /// or the mutex becomes unrecoverable. Always `Ok(true)` on platforms
    /// without robust mutexes.
    pub fn low_level_lock(&self) -> Result<bool> {
        let eno = self.mutex.lock_errno();
        self.after_acquire(eno, "pthread_mutex_lock() failed")
    }

    /// Interpret the errno of any operation that re-acquires the mutex.
    /// Other errors terminate with `what`.
    pub(crate) fn after_acquire(&self, eno: i32, what: &str) -> Result<bool> {
        match eno {
            0 => {
                self.advance(RobustEvent::Lock);
                Ok(true)
            }
            EOWNERDEAD => {
                self.advance(RobustEvent::OwnerDied);
                tracing::warn!(target: "shmsync::robust", "previous owner died holding the lock");
                Ok(false)
            }
            ENOTRECOVERABLE => {
                // Not held; record it only if no holder can be writing.
                if self.state() != RobustState::Unrecoverable {
                    self.state.store_release(RobustState::Unrecoverable as u32);
                }
                Err(Error::NotRecoverable)
            }
            _ => terminate_errno(what, eno),
        }
    }

    /// Pull the mutex out of the inconsistent state.
    ///
    /// Only valid right after [`RobustMutex::low_level_lock`] returned
    /// `Ok(false)`.
    pub fn mark_as_consistent(&self) {
        let eno = unsafe { posix::mutex_consistent(self.mutex.native_ptr()) };
        if eno != 0 {
            terminate_errno("pthread_mutex_consistent() failed", eno);
        }
        self.advance(RobustEvent::Recovered);
    }

    /// Best-effort check that this is a valid mutex object.
    ///
    /// Attempts a non-blocking lock and returns false only if the platform
    /// reports the object as invalid, as opposed to busy, inconsistent or
    /// unrecoverable. Only meaningful when there is already other evidence
    /// that the memory holds a mutex; probing arbitrary bytes is undefined
    /// behaviour.
    ///
    /// A probe that finds a dead owner cannot recover the shared state, so it
    /// releases the lock unmarked and the mutex becomes unrecoverable.
    pub fn is_valid(&self) -> bool {
        let eno = unsafe { posix::mutex_trylock(self.mutex.native_ptr()) };
        match eno {
            0 => {
                self.raw_unlock();
                true
            }
            EOWNERDEAD => {
                tracing::warn!(
                    target: "shmsync::robust",
                    "validity probe found a dead owner; mutex is now unrecoverable"
                );
                self.state.store_release(RobustState::Unrecoverable as u32);
                self.raw_unlock();
                true
            }
            libc::EINVAL => false,
            _ => true,
        }
    }

    pub(crate) fn mutex(&self) -> &Mutex {
        &self.mutex
    }
}

/// Holds a [`RobustMutex`] locked for its lifetime.
///
/// Construction runs the recovery protocol of [`RobustMutex::lock`].
pub struct RobustScopedLock<'a> {
    mutex: &'a RobustMutex,
    // Cleared when a failed wait left the mutex released.
    held: bool,
    _not_send: PhantomData<*const ()>,
}

impl<'a> RobustScopedLock<'a> {
    pub fn new<F>(mutex: &'a RobustMutex, recover: F) -> Result<Self>
    where
        F: FnMut() -> Result<()>,
    {
        mutex.lock(recover)?;
        Ok(Self {
            mutex,
            held: true,
            _not_send: PhantomData,
        })
    }

    pub fn mutex(&self) -> &'a RobustMutex {
        self.mutex
    }

    /// Whether the guard still owns the lock. False only after a condition
    /// variable wait failed with a recovery error.
    pub fn is_held(&self) -> bool {
        self.held
    }

    pub(crate) fn release_ownership(&mut self) {
        self.held = false;
    }
}

impl Drop for RobustScopedLock<'_> {
    fn drop(&mut self) {
        if self.held {
            self.mutex.unlock();
        }
    }
}
