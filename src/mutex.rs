// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Low-level mutual exclusion device and its ownership guards.
// Delegates to the platform pthread mutex.

use std::cell::UnsafeCell;
use std::marker::PhantomData;

use crate::error::{terminate, terminate_errno};
use crate::platform::posix::{self, MutexKind};

/// A non-recursive mutual exclusion device.
///
/// Either process-local ([`Mutex::new`]) or process-shared
/// ([`Mutex::new_process_shared`], [`Mutex::init_process_shared`]). A
/// process-shared mutex may live in memory mapped by several processes, or in
/// a memory mapped file, and stays valid after the process that initialised
/// it exits. Releasing that memory without dropping the mutex is fine and
/// leaks no system resources.
///
/// A mutex must not be moved after initialisation; the constructors hand out
/// boxed or in-place instances for that reason. Locking it again from the
/// thread that holds it is a contract violation. Dropping a locked mutex
/// terminates the process.
#[repr(C)]
pub struct Mutex {
    raw: UnsafeCell<libc::pthread_mutex_t>,
}

// Safety: pthread mutexes are designed for concurrent access.
unsafe impl Send for Mutex {}
unsafe impl Sync for Mutex {}

impl Mutex {
    /// A process-local mutex.
    pub fn new() -> Box<Self> {
        Self::boxed(MutexKind::Regular)
    }

    /// A process-shared mutex allocated on the heap of this process.
    pub fn new_process_shared() -> Box<Self> {
        Self::boxed(MutexKind::ProcessShared)
    }

    /// Initialise a process-shared mutex in place, typically inside a shared
    /// mapping, and return a reference to it.
    ///
    /// # Safety
    /// `place` must be valid for writes, suitably aligned, and not in use by
    /// any thread or process. The returned reference must not outlive the
    /// mapping.
    pub unsafe fn init_process_shared<'a>(place: *mut Self) -> &'a Self {
        Self::init_in_place(place, MutexKind::ProcessShared);
        &*place
    }

    fn boxed(kind: MutexKind) -> Box<Self> {
        let mut mutex = Box::new(unsafe { Self::uninit() });
        // Safety: freshly allocated, unaliased and never moved again.
        unsafe { Self::init_in_place(&mut *mutex, kind) };
        mutex
    }

    /// Zeroed storage, to be initialised in its final location with
    /// `init_in_place` before any other use.
    pub(crate) unsafe fn uninit() -> Self {
        Self {
            raw: UnsafeCell::new(std::mem::zeroed()),
        }
    }

    pub(crate) unsafe fn init_in_place(place: *mut Self, kind: MutexKind) {
        let eno = posix::mutex_init(Self::raw_of(place), kind);
        if eno != 0 {
            terminate_errno("pthread_mutex_init() failed", eno);
        }
    }

    fn raw_of(place: *mut Self) -> *mut libc::pthread_mutex_t {
        // `raw` is the only field of a repr(C) struct.
        place as *mut libc::pthread_mutex_t
    }

    /// Lock, returning a guard that unlocks when dropped.
    pub fn lock(&self) -> ScopedLock<'_> {
        ScopedLock::new(self)
    }

    /// Lock if the mutex is free right now.
    pub fn try_lock(&self) -> Option<ScopedLock<'_>> {
        let eno = unsafe { posix::mutex_trylock(self.native_ptr()) };
        match eno {
            0 => Some(ScopedLock::adopt(self)),
            libc::EBUSY => None,
            _ => terminate_errno("pthread_mutex_trylock() failed", eno),
        }
    }

    /// Raw pointer to the underlying `pthread_mutex_t`.
    /// Used by `CondVar` for `pthread_cond_wait`.
    pub(crate) fn native_ptr(&self) -> *mut libc::pthread_mutex_t {
        self.raw.get()
    }

    /// Returns the raw pthread errno so robust callers can inspect it.
    pub(crate) fn lock_errno(&self) -> i32 {
        unsafe { posix::mutex_lock(self.native_ptr()) }
    }

    pub(crate) fn raw_lock(&self) {
        let eno = self.lock_errno();
        if eno != 0 {
            terminate_errno("pthread_mutex_lock() failed", eno);
        }
    }

    pub(crate) fn raw_unlock(&self) {
        let eno = unsafe { posix::mutex_unlock(self.native_ptr()) };
        if eno != 0 {
            terminate_errno("pthread_mutex_unlock() failed", eno);
        }
    }
}

impl Drop for Mutex {
    fn drop(&mut self) {
        let eno = unsafe { posix::mutex_destroy(self.native_ptr()) };
        if eno != 0 {
            terminate_errno("pthread_mutex_destroy() failed", eno);
        }
    }
}

/// Holds a [`Mutex`] locked for its lifetime.
///
/// Released on every exit path, unwinding included. Not `Send`: a pthread
/// mutex must be unlocked by the thread that locked it.
pub struct ScopedLock<'a> {
    mutex: &'a Mutex,
    _not_send: PhantomData<*const ()>,
}

impl<'a> ScopedLock<'a> {
    pub fn new(mutex: &'a Mutex) -> Self {
        mutex.raw_lock();
        Self::adopt(mutex)
    }

    fn adopt(mutex: &'a Mutex) -> Self {
        Self {
            mutex,
            _not_send: PhantomData,
        }
    }

    pub fn mutex(&self) -> &'a Mutex {
        self.mutex
    }
}

impl Drop for ScopedLock<'_> {
    fn drop(&mut self) {
        self.mutex.raw_unlock();
    }
}

/// A [`Mutex`] ownership wrapper supporting deferred locking and repeated
/// unlocking and relocking.
///
/// Tracks whether it currently holds the lock and releases it on drop only in
/// that case. Calling `lock` while holding, or `unlock` while not holding,
/// terminates the process.
pub struct DeferredLock<'a> {
    mutex: &'a Mutex,
    locked: bool,
    _not_send: PhantomData<*const ()>,
}

impl<'a> DeferredLock<'a> {
    /// Acquire immediately.
    pub fn new(mutex: &'a Mutex) -> Self {
        mutex.raw_lock();
        Self {
            mutex,
            locked: true,
            _not_send: PhantomData,
        }
    }

    /// Bind without acquiring.
    pub fn deferred(mutex: &'a Mutex) -> Self {
        Self {
            mutex,
            locked: false,
            _not_send: PhantomData,
        }
    }

    pub fn lock(&mut self) {
        if self.locked {
            terminate("DeferredLock::lock() while already holding the lock");
        }
        self.mutex.raw_lock();
        self.locked = true;
    }

    pub fn unlock(&mut self) {
        if !self.locked {
            terminate("DeferredLock::unlock() without holding the lock");
        }
        self.mutex.raw_unlock();
        self.locked = false;
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }

    pub fn mutex(&self) -> &'a Mutex {
        self.mutex
    }
}

impl Drop for DeferredLock<'_> {
    fn drop(&mut self) {
        if self.locked {
            self.mutex.raw_unlock();
        }
    }
}
