// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Condition variable for process-local and process-shared monitors.
// Process-local: pthread_cond_t owned by this process.
// Process-shared: pthread_cond_t with PTHREAD_PROCESS_SHARED inside a
// SharedPart, or, where that is not dependable, emulated with a named
// counting semaphore plus a shared generation counter and waiter count.

use std::cell::UnsafeCell;
use std::ptr::{self, NonNull};
use std::time::{Duration, Instant};

use crate::atomic::Atomic;
use crate::config::SyncConfig;
use crate::error::{terminate, terminate_errno, terminate_io, Result};
use crate::mutex::ScopedLock;
use crate::naming;
use crate::platform::posix;
use crate::robust::{RobustEvent, RobustMutex, RobustScopedLock};
use crate::semaphore::NamedSemaphore;

const MODE_UNINIT: u32 = 0;
const MODE_NATIVE: u32 = 1;
const MODE_EMULATED: u32 = 2;

/// The part of a process-shared [`CondVar`] that lives in shared memory.
///
/// Initialise it exactly once, with exclusive access, through
/// [`CondVar::init_shared_part`] before any process waits or notifies; then
/// bind every participating `CondVar` to it with
/// [`CondVar::set_shared_part`]. Several condition variables may share one
/// part. It must not move while any process uses it.
///
/// The emulation counters are only changed while the mutex the condition
/// variable is used with is held.
#[repr(C)]
pub struct SharedPart {
    mode: Atomic<u32>,
    waiters: Atomic<u32>,
    signal_counter: Atomic<u64>,
    native: UnsafeCell<libc::pthread_cond_t>,
}

// Safety: every field is either atomic or a process-shared pthread object.
unsafe impl Send for SharedPart {}
unsafe impl Sync for SharedPart {}

impl SharedPart {
    /// Number of notify generations so far (emulated mode).
    pub fn signal_counter(&self) -> u64 {
        self.signal_counter.load_acquire()
    }

    /// Waiters registered and not yet notified (emulated mode).
    pub fn waiters(&self) -> u32 {
        self.waiters.load_acquire()
    }

    /// Whether the initialiser chose the semaphore emulation.
    pub fn is_emulated(&self) -> bool {
        self.mode.load_acquire() == MODE_EMULATED
    }

    fn native_ptr(&self) -> *mut libc::pthread_cond_t {
        self.native.get()
    }
}

/// Outcome of a timed wait. A timeout is a normal result, not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitStatus {
    Notified,
    TimedOut,
}

enum Inner {
    Local(Box<UnsafeCell<libc::pthread_cond_t>>),
    Unbound,
    SharedNative(NonNull<SharedPart>),
    SharedEmulated {
        part: NonNull<SharedPart>,
        sem: NamedSemaphore,
    },
}

/// Condition variable for use in synchronization monitors.
///
/// A process-local condition variable ([`CondVar::new`]) is ready to use. A
/// process-shared one ([`CondVar::process_shared`]) must be bound to a
/// [`SharedPart`] first.
///
/// The emulation costs at most two extra task switches for every waiter
/// woken by `notify` or `notify_all` compared to a native implementation.
pub struct CondVar {
    inner: Inner,
}

// Safety: the shared part is only reached through &self methods whose
// synchronization is provided by the bound mutex and the semaphore.
unsafe impl Send for CondVar {}
unsafe impl Sync for CondVar {}

impl CondVar {
    /// A process-local condition variable.
    pub fn new() -> Self {
        let cond = Box::new(UnsafeCell::new(unsafe { std::mem::zeroed() }));
        let eno = unsafe { posix::cond_init(cond.get(), false) };
        if eno != 0 {
            terminate_errno("pthread_cond_init() failed", eno);
        }
        Self {
            inner: Inner::Local(cond),
        }
    }

    /// A process-shared condition variable, unusable until
    /// [`CondVar::set_shared_part`] binds it.
    pub fn process_shared() -> Self {
        Self {
            inner: Inner::Unbound,
        }
    }

    /// Initialise a shared part in place using [`SyncConfig::from_env`].
    ///
    /// # Safety
    /// `place` must be valid for writes, suitably aligned, and not in use by
    /// any process. The returned reference must not outlive the mapping.
    pub unsafe fn init_shared_part<'a>(place: *mut SharedPart) -> &'a SharedPart {
        Self::init_shared_part_with(place, &SyncConfig::from_env())
    }

    /// Initialise a shared part in place with an explicit configuration.
    ///
    /// # Safety
    /// As for [`CondVar::init_shared_part`].
    pub unsafe fn init_shared_part_with<'a>(
        place: *mut SharedPart,
        config: &SyncConfig,
    ) -> &'a SharedPart {
        let emulate = config.condvar_emulation.emulate();

        ptr::addr_of_mut!((*place).waiters).write(Atomic::new(0));
        ptr::addr_of_mut!((*place).signal_counter).write(Atomic::new(0));
        let native = UnsafeCell::raw_get(ptr::addr_of!((*place).native));
        if emulate {
            ptr::write_bytes(native, 0, 1);
        } else {
            let eno = posix::cond_init(native, true);
            if eno != 0 {
                terminate_errno("pthread_cond_init() failed", eno);
            }
        }
        let mode = if emulate { MODE_EMULATED } else { MODE_NATIVE };
        ptr::addr_of_mut!((*place).mode).write(Atomic::new(mode));
        &*place
    }

    /// Bind this process-shared condition variable to an initialised shared
    /// part.
    ///
    /// `device`, `inode` and `offset` identify where the part lives: the
    /// backing file (or shm segment) and the byte offset of the part inside
    /// it. In emulated mode they name the semaphore, so every process mapping
    /// the same file resolves to the same one.
    ///
    /// # Safety
    /// `part` must have been initialised with [`CondVar::init_shared_part`]
    /// and must stay mapped at the same address until this condition variable
    /// is closed or dropped.
    pub unsafe fn set_shared_part(
        &mut self,
        part: &SharedPart,
        device: u64,
        inode: u64,
        offset: usize,
    ) {
        if !matches!(self.inner, Inner::Unbound) {
            terminate("CondVar::set_shared_part() on a local or already bound condition variable");
        }

        let ptr = NonNull::from(part);
        self.inner = match part.mode.load_acquire() {
            MODE_NATIVE => {
                tracing::debug!(target: "shmsync::condvar", "bound to native shared part");
                Inner::SharedNative(ptr)
            }
            MODE_EMULATED => {
                let name = naming::condvar_semaphore_name(device, inode, offset);
                let sem = NamedSemaphore::open(&name, 0)
                    .unwrap_or_else(|e| terminate_io("cannot open condition variable semaphore", &e));
                tracing::debug!(
                    target: "shmsync::condvar",
                    semaphore = %sem.name(),
                    "bound to emulated shared part"
                );
                Inner::SharedEmulated { part: ptr, sem }
            }
            MODE_UNINIT => terminate("CondVar::set_shared_part() on an uninitialised shared part"),
            _ => terminate("CondVar::set_shared_part() on a corrupt shared part"),
        };
    }

    /// Remove the named semaphore an emulated condition variable at this
    /// location would use.
    pub fn remove_semaphore(device: u64, inode: u64, offset: usize) {
        NamedSemaphore::unlink(&naming::condvar_semaphore_name(device, inode, offset));
    }

    pub fn is_process_shared(&self) -> bool {
        !matches!(self.inner, Inner::Local(_))
    }

    pub fn is_emulated(&self) -> bool {
        matches!(self.inner, Inner::SharedEmulated { .. })
    }

    /// Wait for another thread or process to call `notify` or `notify_all`.
    ///
    /// `guard` must hold the mutex every waiter and notifier of this
    /// condition variable uses. It is released while blocked and held again
    /// on return. Native waits may wake spuriously; check the predicate in a
    /// loop.
    pub fn wait(&self, guard: &ScopedLock<'_>) {
        let mutex = guard.mutex();
        match &self.inner {
            Inner::Local(cond) => native_wait(cond.get(), mutex.native_ptr()),
            Inner::SharedNative(part) => {
                native_wait(unsafe { part.as_ref() }.native_ptr(), mutex.native_ptr())
            }
            Inner::SharedEmulated { part, sem } => {
                let status = emulated_wait(
                    unsafe { part.as_ref() },
                    sem,
                    None,
                    || mutex.raw_unlock(),
                    || {
                        mutex.raw_lock();
                        Ok(())
                    },
                );
                debug_assert!(matches!(status, Ok(WaitStatus::Notified)));
            }
            Inner::Unbound => terminate("CondVar::wait() on an unbound condition variable"),
        }
    }

    /// Wait while holding a robust mutex, optionally with a timeout.
    ///
    /// If re-acquiring the mutex reveals that another owner died while
    /// holding it, `recover` runs exactly as in [`RobustMutex::lock`]. On a
    /// timeout the mutex is held again and [`WaitStatus::TimedOut`] is
    /// returned without running recovery. On error the mutex is not held and
    /// `guard` will not release it again.
    pub fn wait_robust<F>(
        &self,
        guard: &mut RobustScopedLock<'_>,
        mut recover: F,
        timeout: Option<Duration>,
    ) -> Result<WaitStatus>
    where
        F: FnMut() -> Result<()>,
    {
        if !guard.is_held() {
            terminate("CondVar::wait_robust() with a guard that no longer holds the lock");
        }
        let mutex = guard.mutex();

        let result = match &self.inner {
            Inner::Local(cond) => robust_native_wait(cond.get(), mutex, &mut recover, timeout),
            Inner::SharedNative(part) => robust_native_wait(
                unsafe { part.as_ref() }.native_ptr(),
                mutex,
                &mut recover,
                timeout,
            ),
            Inner::SharedEmulated { part, sem } => {
                let deadline = timeout.and_then(|t| Instant::now().checked_add(t));
                emulated_wait(
                    unsafe { part.as_ref() },
                    sem,
                    deadline,
                    || mutex.unlock(),
                    || mutex.lock(&mut recover),
                )
            }
            Inner::Unbound => terminate("CondVar::wait_robust() on an unbound condition variable"),
        };

        if result.is_err() {
            guard.release_ownership();
        }
        result
    }

    /// Wake at least one waiter, if any.
    ///
    /// For an emulated condition variable the caller must hold the mutex.
    pub fn notify(&self) {
        match &self.inner {
            Inner::Local(cond) => native_signal(cond.get()),
            Inner::SharedNative(part) => native_signal(unsafe { part.as_ref() }.native_ptr()),
            Inner::SharedEmulated { part, sem } => {
                let part = unsafe { part.as_ref() };
                part.signal_counter.fetch_add_release(1);
                if part.waiters.load_relaxed() > 0 {
                    if let Err(e) = sem.post(1) {
                        terminate_io("sem_post() failed", &e);
                    }
                    part.waiters.fetch_sub_release(1);
                }
            }
            Inner::Unbound => terminate("CondVar::notify() on an unbound condition variable"),
        }
    }

    /// Wake every thread or process currently waiting.
    ///
    /// For an emulated condition variable the caller must hold the mutex.
    pub fn notify_all(&self) {
        match &self.inner {
            Inner::Local(cond) => native_broadcast(cond.get()),
            Inner::SharedNative(part) => native_broadcast(unsafe { part.as_ref() }.native_ptr()),
            Inner::SharedEmulated { part, sem } => {
                let part = unsafe { part.as_ref() };
                part.signal_counter.fetch_add_release(1);
                let waiters = part.waiters.load_relaxed();
                if waiters > 0 {
                    if let Err(e) = sem.post(waiters) {
                        terminate_io("sem_post() failed", &e);
                    }
                    part.waiters.fetch_sub_release(waiters);
                }
            }
            Inner::Unbound => terminate("CondVar::notify_all() on an unbound condition variable"),
        }
    }

    /// Release the system resources held by this handle.
    ///
    /// Destroys a process-local condition variable or closes the semaphore
    /// handle of an emulated one. The shared part is left alone; other
    /// condition variables may still use it. Afterwards the handle is an
    /// unbound process-shared condition variable.
    pub fn close(&mut self) {
        match std::mem::replace(&mut self.inner, Inner::Unbound) {
            Inner::Local(cond) => {
                let eno = unsafe { posix::cond_destroy(cond.get()) };
                if eno != 0 {
                    terminate_errno("pthread_cond_destroy() failed", eno);
                }
            }
            Inner::SharedEmulated { sem, .. } => drop(sem),
            Inner::SharedNative(_) | Inner::Unbound => {}
        }
    }
}

impl Default for CondVar {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for CondVar {
    fn drop(&mut self) {
        self.close();
    }
}

fn native_wait(cond: *mut libc::pthread_cond_t, mtx: *mut libc::pthread_mutex_t) {
    let eno = unsafe { posix::cond_wait(cond, mtx) };
    if eno != 0 {
        terminate_errno("pthread_cond_wait() failed", eno);
    }
}

fn native_signal(cond: *mut libc::pthread_cond_t) {
    let eno = unsafe { posix::cond_signal(cond) };
    if eno != 0 {
        terminate_errno("pthread_cond_signal() failed", eno);
    }
}

fn native_broadcast(cond: *mut libc::pthread_cond_t) {
    let eno = unsafe { posix::cond_broadcast(cond) };
    if eno != 0 {
        terminate_errno("pthread_cond_broadcast() failed", eno);
    }
}

fn robust_native_wait<F>(
    cond: *mut libc::pthread_cond_t,
    mutex: &RobustMutex,
    recover: &mut F,
    timeout: Option<Duration>,
) -> Result<WaitStatus>
where
    F: FnMut() -> Result<()>,
{
    let mtx = mutex.mutex().native_ptr();
    mutex.advance(RobustEvent::Unlock);
    let eno = match timeout {
        None => unsafe { posix::cond_wait(cond, mtx) },
        Some(t) => unsafe { posix::cond_timedwait(cond, mtx, t) },
    };
    if eno == libc::ETIMEDOUT {
        mutex.advance(RobustEvent::Lock);
        return Ok(WaitStatus::TimedOut);
    }
    if !mutex.after_acquire(eno, "pthread_cond_wait() failed")? {
        mutex.recover_locked(recover)?;
    }
    Ok(WaitStatus::Notified)
}

/// The semaphore-based wait protocol.
///
/// Register as a waiter and remember the generation, release the mutex and
/// block on the semaphore. After waking, re-acquire the mutex and compare
/// generations: a permit consumed while the generation is unchanged belongs
/// to some other waiter, so hand it back and try again.
///
/// With a deadline, a timed-out waiter that finds the generation unchanged
/// withdraws its registration. If the generation moved on it counts as
/// notified and absorbs its pending permit when one is still there, or
/// withdraws its registration when no permit is left.
fn emulated_wait<U, L>(
    part: &SharedPart,
    sem: &NamedSemaphore,
    deadline: Option<Instant>,
    unlock: U,
    mut relock: L,
) -> Result<WaitStatus>
where
    U: Fn(),
    L: FnMut() -> Result<()>,
{
    part.waiters.fetch_add_release(1);
    let my_counter = part.signal_counter.load_relaxed();
    unlock();

    loop {
        let got_permit = match deadline {
            None => match sem.wait() {
                Ok(()) => true,
                Err(e) => terminate_io("sem_wait() failed", &e),
            },
            Some(d) => match sem.wait_timeout(d.saturating_duration_since(Instant::now())) {
                Ok(got) => got,
                Err(e) => terminate_io("sem_timedwait() failed", &e),
            },
        };

        relock()?;

        if part.signal_counter.load_relaxed() != my_counter {
            if !got_permit {
                match sem.try_wait() {
                    Ok(true) => {}
                    // Another waiter took the permit and with it the
                    // notifier's decrement, so withdraw this registration.
                    Ok(false) => {
                        part.waiters.fetch_sub_release(1);
                    }
                    Err(e) => terminate_io("sem_trywait() failed", &e),
                }
            }
            return Ok(WaitStatus::Notified);
        }

        if !got_permit {
            part.waiters.fetch_sub_release(1);
            return Ok(WaitStatus::TimedOut);
        }

        tracing::trace!(target: "shmsync::condvar", generation = my_counter, "stray permit, handing it back");
        if let Err(e) = sem.post(1) {
            terminate_io("sem_post() failed", &e);
        }
        std::thread::yield_now();
        unlock();
    }
}
